use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Count-down latch. Blocking helpers park on a connection latch until
/// the poller observes readiness and counts it down; the endpoint parks
/// on the shutdown latch until every poller thread has exited.
#[derive(Debug)]
pub struct Latch {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl Latch {
    pub fn new(count: usize) -> Latch {
        Latch {
            count: Mutex::new(count),
            condvar: Condvar::new(),
        }
    }

    /// Re-arms the latch. Only valid while no thread is waiting.
    pub fn set(&self, count: usize) {
        let mut guard = self.count.lock().unwrap();
        *guard = count;
    }

    pub fn count(&self) -> usize {
        *self.count.lock().unwrap()
    }

    pub fn count_down(&self) {
        let mut guard = self.count.lock().unwrap();
        if *guard > 0 {
            *guard -= 1;
        }
        if *guard == 0 {
            self.condvar.notify_all();
        }
    }

    /// Waits until the count reaches zero. Returns `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.count.lock().unwrap();
        while *guard > 0 {
            let (next, res) = self.condvar.wait_timeout(guard, timeout).unwrap();
            guard = next;
            if res.timed_out() && *guard > 0 {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod test {
    use super::Latch;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn counts_down_to_zero() {
        let latch = Arc::new(Latch::new(2));

        let l = latch.clone();
        let handle = thread::spawn(move || {
            l.count_down();
            l.count_down();
        });

        assert!(latch.wait_timeout(Duration::from_secs(1)));
        handle.join().unwrap();
        assert_eq!(latch.count(), 0);
    }

    #[test]
    fn timeout_when_not_released() {
        let latch = Latch::new(1);
        assert!(!latch.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn count_down_saturates() {
        let latch = Latch::new(0);
        latch.count_down();
        latch.count_down();
        assert_eq!(latch.count(), 0);
        assert!(latch.wait_timeout(Duration::from_millis(1)));
    }
}
