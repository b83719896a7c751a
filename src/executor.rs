use std::collections::VecDeque;
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Acquire, Release};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::info;

use crate::endpoint::{Shared, SocketProcessor};

/// Fixed worker pool over a bounded queue. `execute` hands the task back
/// instead of blocking when the queue is full or the pool is shut down;
/// the caller treats that as a rejection and closes the socket.
pub(crate) struct Executor {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    queue: Mutex<VecDeque<SocketProcessor>>,
    condvar: Condvar,
    capacity: usize,
    shutdown: AtomicBool,
}

impl Executor {
    pub fn start(threads: usize, capacity: usize, shared: Arc<Shared>) -> io::Result<Executor> {
        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            condvar: Condvar::new(),
            capacity,
            shutdown: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(threads);
        for id in 0..threads {
            let inner = inner.clone();
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{}", id))
                .spawn(move || worker_loop(&inner, &shared))?;
            handles.push(handle);
        }

        Ok(Executor {
            inner,
            threads: Mutex::new(handles),
        })
    }

    pub fn execute(&self, task: SocketProcessor) -> Result<(), SocketProcessor> {
        if self.inner.shutdown.load(Acquire) {
            return Err(task);
        }

        let mut queue = self.inner.queue.lock().unwrap();
        if queue.len() >= self.inner.capacity {
            return Err(task);
        }
        queue.push_back(task);
        drop(queue);

        self.inner.condvar.notify_one();
        Ok(())
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Release);
        self.inner.condvar.notify_all();

        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        info!("worker pool stopped");
    }
}

fn worker_loop(inner: &Inner, shared: &Arc<Shared>) {
    loop {
        let task = {
            let mut queue = inner.queue.lock().unwrap();
            loop {
                if let Some(task) = queue.pop_front() {
                    break task;
                }
                if inner.shutdown.load(Acquire) {
                    return;
                }
                queue = inner.condvar.wait(queue).unwrap();
            }
        };

        let mut task = task;
        task.run(shared);
        task.clear();
        shared.pools.processors.offer(task);
    }
}
