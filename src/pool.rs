use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire};
use std::sync::Arc;

use concurrent_queue::ConcurrentQueue;

use crate::buffer::BufferPair;
use crate::endpoint::Flags;

/// Bounded free-list. Lock-free MPMC queue plus an atomic size counter so
/// the cap check stays off the fast path. Offers are refused while the
/// endpoint is not running: during shutdown recycled objects are simply
/// dropped.
pub struct Pool<T> {
    queue: ConcurrentQueue<T>,
    size: AtomicUsize,
    limit: isize,
    flags: Arc<Flags>,
}

impl<T: Send> Pool<T> {
    /// `limit` of -1 means unbounded.
    pub fn new(limit: isize, flags: Arc<Flags>) -> Pool<T> {
        Pool {
            queue: ConcurrentQueue::unbounded(),
            size: AtomicUsize::new(0),
            limit,
            flags,
        }
    }

    pub fn offer(&self, item: T) -> bool {
        if !self.flags.running() || self.flags.paused() {
            return false;
        }

        if self.limit >= 0 && self.size.load(Acquire) >= self.limit as usize {
            return false;
        }

        match self.queue.push(item) {
            Ok(()) => {
                self.size.fetch_add(1, AcqRel);
                true
            }
            Err(_) => false,
        }
    }

    pub fn poll(&self) -> Option<T> {
        self.queue.pop().ok().inspect(|_| {
            self.size.fetch_sub(1, AcqRel);
        })
    }

    pub fn len(&self) -> usize {
        self.size.load(Acquire)
    }

    pub fn clear(&self) {
        while self.poll().is_some() {}
    }
}

/// Buffer-pair free-list with an additional total-bytes cap on top of the
/// entry cap.
pub struct BufferPool {
    pool: Pool<BufferPair>,
    bytes: AtomicUsize,
    max_bytes: isize,
}

impl BufferPool {
    pub fn new(limit: isize, max_bytes: isize, flags: Arc<Flags>) -> BufferPool {
        BufferPool {
            pool: Pool::new(limit, flags),
            bytes: AtomicUsize::new(0),
            max_bytes,
        }
    }

    pub fn offer(&self, pair: BufferPair) -> bool {
        let size = pair.capacity();

        if self.max_bytes >= 0 && self.bytes.load(Acquire) + size > self.max_bytes as usize {
            return false;
        }

        if self.pool.offer(pair) {
            self.bytes.fetch_add(size, AcqRel);
            true
        } else {
            false
        }
    }

    pub fn poll(&self) -> Option<BufferPair> {
        self.pool.poll().inspect(|pair| {
            self.bytes.fetch_sub(pair.capacity(), AcqRel);
        })
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn bytes(&self) -> usize {
        self.bytes.load(Acquire)
    }

    pub fn clear(&self) {
        while self.poll().is_some() {}
    }
}

#[cfg(test)]
mod test {
    use super::{BufferPool, Pool};
    use crate::buffer::BufferPair;
    use crate::endpoint::Flags;
    use std::sync::Arc;

    fn running_flags() -> Arc<Flags> {
        let flags = Arc::new(Flags::new());
        flags.set_running(true);
        flags
    }

    #[test]
    fn offer_then_poll_round_trips() {
        let pool: Pool<u32> = Pool::new(4, running_flags());

        assert!(pool.offer(7));
        assert_eq!(pool.poll(), Some(7));
        assert_eq!(pool.poll(), None);
    }

    #[test]
    fn offer_refused_when_not_running() {
        let flags = Arc::new(Flags::new());
        let pool: Pool<u32> = Pool::new(4, flags.clone());

        assert!(!pool.offer(1));

        flags.set_running(true);
        assert!(pool.offer(1));

        flags.set_paused(true);
        assert!(!pool.offer(2));
    }

    #[test]
    fn offer_refused_at_cap() {
        let pool: Pool<u32> = Pool::new(2, running_flags());

        assert!(pool.offer(1));
        assert!(pool.offer(2));
        assert!(!pool.offer(3));
        assert_eq!(pool.len(), 2);

        pool.poll().unwrap();
        assert!(pool.offer(3));
    }

    #[test]
    fn unbounded_pool() {
        let pool: Pool<u32> = Pool::new(-1, running_flags());
        for i in 0..1000 {
            assert!(pool.offer(i));
        }
        assert_eq!(pool.len(), 1000);
    }

    #[test]
    fn buffer_pool_byte_cap() {
        let pool = BufferPool::new(-1, 300, running_flags());

        assert!(pool.offer(BufferPair::with_capacity(64, 64).unwrap()));
        // second pair would exceed the byte cap
        assert!(!pool.offer(BufferPair::with_capacity(256, 256).unwrap()));

        let pair = pool.poll().unwrap();
        assert!(pair.capacity() >= 128);
        assert_eq!(pool.bytes(), 0);
    }

    #[test]
    fn clear_empties() {
        let pool: Pool<u32> = Pool::new(-1, running_flags());
        pool.offer(1);
        pool.offer(2);
        pool.clear();
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.poll(), None);
    }
}
