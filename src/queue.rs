use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::Arc;

use concurrent_queue::{ConcurrentQueue, PushError};

use crate::sys::EventFd;

/// MPMC queue with an eventfd wake-up. The push that takes the pending
/// counter from zero fires the eventfd; pushes landing on an already
/// non-empty queue do not. The owning poller registers the eventfd in its
/// readiness queue, so a blocked `epoll_wait` returns as soon as the
/// first event of a batch is submitted.
pub struct EventQueue<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    queue: ConcurrentQueue<T>,
    pending: AtomicUsize,
    waker: EventFd,
}

impl<T: Send> EventQueue<T> {
    pub fn unbounded() -> io::Result<EventQueue<T>> {
        Ok(EventQueue {
            inner: Arc::new(Inner {
                queue: ConcurrentQueue::unbounded(),
                pending: AtomicUsize::new(0),
                waker: EventFd::new()?,
            }),
        })
    }

    fn inc(&self) -> io::Result<()> {
        let cnt = self.inner.pending.fetch_add(1, Acquire);

        if 0 == cnt {
            self.wake()?;
        }
        Ok(())
    }

    fn dec(&self) -> io::Result<()> {
        let first = self.inner.pending.load(Acquire);

        if first == 1 {
            self.drain_wake()?;
        }

        let second = self.inner.pending.fetch_sub(1, AcqRel);

        if first == 1 && second > 1 {
            self.wake()?;
        }

        Ok(())
    }

    pub fn push(&self, value: T) -> Result<(), PushError<T>> {
        self.inner.queue.push(value).map(|_| {
            let _ = self.inc();
        })
    }

    pub fn pop(&self) -> Option<T> {
        self.inner.queue.pop().ok().inspect(|_| {
            let _ = self.dec();
        })
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.load(Relaxed)
    }

    /// Fires the eventfd without enqueueing anything. Used to nudge a
    /// poller out of its wait at shutdown.
    pub fn wake(&self) -> io::Result<()> {
        match self.inner.waker.write(1) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn drain_wake(&self) -> io::Result<()> {
        match self.inner.waker.read() {
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Consumes a wake observed by the poller that no `pop` will account
    /// for (shutdown nudges).
    pub fn consume_wake(&self) {
        if self.inner.pending.load(Acquire) == 0 {
            let _ = self.drain_wake();
        }
    }
}

impl<T: Send> Clone for EventQueue<T> {
    fn clone(&self) -> EventQueue<T> {
        EventQueue {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send> AsRawFd for EventQueue<T> {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.waker.as_raw_fd()
    }
}

#[cfg(test)]
mod test {
    use super::EventQueue;

    #[test]
    fn push_pop() {
        let queue: EventQueue<u32> = EventQueue::unbounded().unwrap();

        queue.push(1).unwrap();
        queue.push(2).unwrap();
        assert_eq!(queue.pending(), 2);

        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn first_push_wakes() {
        let queue: EventQueue<u32> = EventQueue::unbounded().unwrap();

        queue.push(7).unwrap();
        queue.push(8).unwrap();

        // a single wake for the batch
        assert!(queue.inner.waker.read().unwrap() >= 1);
        assert_eq!(queue.inner.waker.read().unwrap_err().kind(),
                   std::io::ErrorKind::WouldBlock);
    }

    #[test]
    fn drained_queue_rearms() {
        let queue: EventQueue<u32> = EventQueue::unbounded().unwrap();

        queue.push(1).unwrap();
        assert_eq!(queue.pop(), Some(1));
        // eventfd consumed by the pop that emptied the queue
        assert!(queue.inner.waker.read().is_err());

        queue.push(2).unwrap();
        assert!(queue.inner.waker.read().is_ok());
    }
}
