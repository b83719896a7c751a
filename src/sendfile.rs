use std::cmp;
use std::fs::File;
use std::io::{self, ErrorKind};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Acquire, Release};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::{debug, trace, warn};
use slab::Slab;

use crate::conn::{now_ms, Connection};
use crate::endpoint::Shared;
use crate::handler::SocketStatus;
use crate::poller::WAKE;
use crate::queue::EventQueue;
use crate::ready::Ready;
use crate::sys::{Epoll, Events, FileDesc};
use crate::token::Token;

const CHUNK: u64 = 256 * 1024;

/// A kernel-assisted file transmission in flight on one connection.
/// Built by the protocol handler, consumed by the engine, released when
/// the range is exhausted or the transfer dies.
pub struct SendfileJob {
    path: PathBuf,
    file: Option<FileDesc>,
    pos: u64,
    remaining: u64,
    keep_alive: bool,
    pub(crate) parked: bool,
}

impl SendfileJob {
    pub fn new<P: AsRef<Path>>(
        path: P,
        pos: u64,
        length: u64,
        keep_alive: bool,
    ) -> io::Result<SendfileJob> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;

        Ok(SendfileJob {
            path,
            file: Some(FileDesc::from_file(file)),
            pos,
            remaining: length,
            keep_alive,
            parked: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }
}

enum Progress {
    /// Range exhausted; the job is ready to be released.
    Complete,
    /// The socket pushed back; wait for write readiness.
    Again,
    /// Transfer died.
    Failed,
    /// No job attached (a stale continuation).
    Idle,
}

/// Write-readiness poller for parked transfers. The fast path never
/// reaches it: `add` drives `sendfile(2)` inline and only transfers the
/// kernel refuses to finish get registered here.
pub(crate) struct SendfilePoller {
    id: usize,
    epoll: RwLock<Epoll>,
    queue: EventQueue<Arc<Connection>>,
    conns: Mutex<Slab<Arc<Connection>>>,
    close: AtomicBool,
    shared: Arc<Shared>,
}

impl SendfilePoller {
    pub fn new(id: usize, shared: Arc<Shared>) -> io::Result<Arc<SendfilePoller>> {
        let epoll = Epoll::new()?;
        let queue = EventQueue::unbounded()?;

        epoll.add(queue.as_raw_fd(), WAKE, Ready::readable())?;

        Ok(Arc::new(SendfilePoller {
            id,
            epoll: RwLock::new(epoll),
            queue,
            conns: Mutex::new(Slab::with_capacity(64)),
            close: AtomicBool::new(false),
            shared,
        }))
    }

    pub fn request_close(&self) {
        self.close.store(true, Release);
        let _ = self.queue.wake();
    }

    /// Entry point for a freshly attached job: transmit as much as the
    /// kernel will take right now. Returns true when the whole range
    /// went out synchronously.
    pub fn add(&self, conn: Arc<Connection>) -> bool {
        self.shared.counters.sendfile_started();

        match self.drive(&conn) {
            Progress::Complete => {
                self.complete(conn);
                true
            }
            Progress::Again => {
                self.park(conn);
                false
            }
            Progress::Failed => {
                self.fail(conn, None);
                false
            }
            Progress::Idle => {
                self.shared.counters.sendfile_finished();
                true
            }
        }
    }

    /// Continuation for readiness observed outside this poller (the
    /// primary queue routing a key that still carries a job).
    pub fn resume(&self, conn: Arc<Connection>) {
        match self.drive(&conn) {
            Progress::Complete => self.complete(conn),
            Progress::Again => self.park(conn),
            Progress::Failed => self.fail(conn, None),
            Progress::Idle => {}
        }
    }

    fn drive(&self, conn: &Arc<Connection>) -> Progress {
        let mut slot = conn.sendfile.lock().unwrap();
        let Some(job) = slot.as_mut() else {
            return Progress::Idle;
        };

        while job.remaining > 0 {
            let Some(file) = job.file.as_ref() else {
                return Progress::Failed;
            };
            let chunk = cmp::min(job.remaining, CHUNK) as usize;

            match conn.with_socket(|sock| sock.sendfile(file, job.pos, chunk)) {
                Ok(0) => {
                    debug!("sendfile hit end of {:?} early", job.path);
                    return Progress::Failed;
                }
                Ok(n) => {
                    job.pos += n as u64;
                    job.remaining -= n as u64;
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    return Progress::Again;
                }
                Err(e) => {
                    debug!("sendfile on {:?} failed: {}", job.path, e);
                    return Progress::Failed;
                }
            }
        }

        Progress::Complete
    }

    fn complete(&self, conn: Arc<Connection>) {
        let job = conn.sendfile.lock().unwrap().take();
        self.shared.counters.sendfile_finished();

        let keep_alive = job.map(|j| j.keep_alive).unwrap_or(false);
        if keep_alive {
            conn.touch();
            if let Err(e) = conn.rearm(Ready::readable()) {
                debug!("sendfile poller {} keep-alive re-arm failed: {}", self.id, e);
                self.cancel(conn, None);
            }
        } else {
            self.cancel(conn, None);
        }
    }

    fn fail(&self, conn: Arc<Connection>, status: Option<SocketStatus>) {
        conn.sendfile.lock().unwrap().take();
        self.shared.counters.sendfile_finished();
        self.cancel(conn, status);
    }

    fn cancel(&self, conn: Arc<Connection>, status: Option<SocketStatus>) {
        match conn.poller() {
            Some(poller) => poller.cancelled_key(conn, status),
            None => {
                if conn.cancel() {
                    self.shared.handler.release(&conn);
                    conn.close_socket();
                }
            }
        }
    }

    fn park(&self, conn: Arc<Connection>) {
        {
            let mut slot = conn.sendfile.lock().unwrap();
            match slot.as_mut() {
                Some(job) if job.parked => return,
                Some(job) => job.parked = true,
                None => return,
            }
        }

        if let Err(err) = self.queue.push(conn) {
            self.fail(err.into_inner(), None);
        }
    }

    fn register_parked(&self, conn: Arc<Connection>) {
        if conn.is_cancelled() {
            return;
        }

        if self.conns.lock().unwrap().len() >= self.shared.config.sendfile_size {
            warn!(
                "sendfile poller {} at capacity ({} transfers), dropping socket",
                self.id, self.shared.config.sendfile_size
            );
            self.fail(conn, None);
            return;
        }

        let token = Token(self.conns.lock().unwrap().insert(conn.clone()));
        let res = self
            .epoll
            .read()
            .unwrap()
            .add(conn.raw_fd(), token, Ready::writable());
        if let Err(e) = res {
            debug!("sendfile poller {} registration failed: {}", self.id, e);
            self.conns.lock().unwrap().remove(token.into());
            self.fail(conn, None);
        }
    }

    fn unregister(&self, token: Token, conn: &Arc<Connection>) {
        let mut conns = self.conns.lock().unwrap();
        if conns.contains(token.into()) {
            conns.remove(token.into());
        }
        drop(conns);

        let fd = conn.raw_fd();
        if fd >= 0 {
            if let Err(e) = self.epoll.read().unwrap().delete(fd) {
                debug!("sendfile poller {} deregister: {}", self.id, e);
            }
        }

        if let Some(job) = conn.sendfile.lock().unwrap().as_mut() {
            job.parked = false;
        }
    }

    /// Same drain/wait/sweep skeleton as the primary poller, adapted
    /// for write readiness.
    pub fn run(self: Arc<Self>) {
        let mut events = Events::with_capacity(128);
        let wait = Duration::from_micros(self.shared.config.poll_time.max(1_000));
        let mut next_sweep = now_ms() + self.shared.config.timeout_interval;

        loop {
            while let Some(conn) = self.queue.pop() {
                self.register_parked(conn);
            }

            if self.close.load(Acquire) {
                let parked: Vec<Arc<Connection>> = {
                    let conns = self.conns.lock().unwrap();
                    conns.iter().map(|(_, c)| c.clone()).collect()
                };
                for conn in parked {
                    self.fail(conn, Some(SocketStatus::Stop));
                }
                self.conns.lock().unwrap().clear();
                break;
            }

            let keys = match self.epoll.read().unwrap().wait(&mut events, Some(wait)) {
                Ok(n) => n,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => 0,
                Err(ref e) if e.kind() == ErrorKind::TimedOut => 0,
                Err(e) => {
                    warn!("sendfile poller {} wait failed: {}", self.id, e);
                    self.shared.counters.poller_failure();
                    if self.rebuild().is_err() {
                        break;
                    }
                    continue;
                }
            };

            for i in 0..keys {
                let Some(event) = events.get(i) else { continue };
                let token = event.token();
                if token == WAKE {
                    self.queue.consume_wake();
                    continue;
                }

                let ready = event.readiness();
                // this queue only ever asks for write readiness
                debug_assert!(!(ready.is_readable() && ready.is_writable()));

                let conn = {
                    let conns = self.conns.lock().unwrap();
                    conns.get(token.into()).cloned()
                };
                let Some(conn) = conn else { continue };

                conn.touch();

                match self.drive(&conn) {
                    Progress::Complete => {
                        self.unregister(token, &conn);
                        self.complete(conn);
                    }
                    Progress::Again => {
                        trace!("sendfile poller {} partial write", self.id);
                    }
                    Progress::Failed => {
                        self.unregister(token, &conn);
                        self.fail(conn, None);
                    }
                    Progress::Idle => {
                        self.unregister(token, &conn);
                    }
                }
            }

            let now = now_ms();
            if now >= next_sweep {
                next_sweep = now + self.shared.config.timeout_interval;
                self.sweep(now);
            }
        }

        debug!("sendfile poller {} exited", self.id);
    }

    fn sweep(&self, now: u64) {
        let snapshot: Vec<(usize, Arc<Connection>)> = {
            let conns = self.conns.lock().unwrap();
            conns.iter().map(|(t, c)| (t, c.clone())).collect()
        };

        let so_timeout = self.shared.config.so_timeout;
        for (token, conn) in snapshot {
            if conn.is_cancelled() {
                self.conns.lock().unwrap().try_remove(token);
                continue;
            }

            let t = conn.effective_timeout(so_timeout);
            if t >= 0 && now > conn.last_access() + t as u64 {
                self.unregister(Token(token), &conn);
                self.fail(conn, Some(SocketStatus::Timeout));
            }
        }
    }

    fn rebuild(&self) -> io::Result<()> {
        let parked: Vec<Arc<Connection>> = {
            let conns = self.conns.lock().unwrap();
            conns.iter().map(|(_, c)| c.clone()).collect()
        };
        for conn in parked {
            self.fail(conn, Some(SocketStatus::Error));
        }
        self.conns.lock().unwrap().clear();

        let fresh = Epoll::new()?;
        fresh.add(self.queue.as_raw_fd(), WAKE, Ready::readable())?;
        *self.epoll.write().unwrap() = fresh;
        warn!("sendfile poller {} readiness queue rebuilt", self.id);
        Ok(())
    }
}
