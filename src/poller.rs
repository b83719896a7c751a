use std::io;
use std::os::fd::AsRawFd;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Release};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use log::{debug, error, trace, warn};
use slab::Slab;

use crate::conn::{now_ms, Connection};
use crate::endpoint::Shared;
use crate::handler::SocketStatus;
use crate::latch::Latch;
use crate::queue::EventQueue;
use crate::ready::Ready;
use crate::sys::{Epoll, Events};
use crate::token::Token;

/// Reserved token for the event-queue eventfd.
pub(crate) const WAKE: Token = Token(usize::MAX);

pub(crate) enum EventKind {
    Register,
    Rearm,
}

/// Deferred registration mutation, applied on the poller thread between
/// readiness waits. Records are pooled and refilled on submission.
pub(crate) struct PollerEvent {
    pub conn: Option<Arc<Connection>>,
    pub interest: Ready,
    pub kind: EventKind,
}

impl PollerEvent {
    pub fn new() -> PollerEvent {
        PollerEvent {
            conn: None,
            interest: Ready::empty(),
            kind: EventKind::Register,
        }
    }

    pub fn clear(&mut self) {
        self.conn = None;
        self.interest = Ready::empty();
        self.kind = EventKind::Register;
    }
}

/// One readiness queue plus everything needed to drive it: the pending
/// event FIFO, the slab of registered connections, and the timeout
/// sweep bookkeeping. The epoll interest of a registered socket is
/// mutated only on this poller's thread; other threads submit
/// `PollerEvent`s.
pub(crate) struct Poller {
    pub id: usize,
    size: usize,
    epoll: RwLock<Epoll>,
    events: EventQueue<PollerEvent>,
    conns: Mutex<Slab<Arc<Connection>>>,
    close: AtomicBool,
    keep_alive_count: AtomicUsize,
    next_expiration: AtomicU64,
    shared: Arc<Shared>,
}

impl Poller {
    pub fn new(id: usize, size: usize, shared: Arc<Shared>) -> io::Result<Arc<Poller>> {
        let epoll = Epoll::new()?;
        let events = EventQueue::unbounded()?;

        epoll.add(events.as_raw_fd(), WAKE, Ready::readable())?;

        Ok(Arc::new(Poller {
            id,
            size,
            epoll: RwLock::new(epoll),
            events,
            conns: Mutex::new(Slab::with_capacity(1024.min(size))),
            close: AtomicBool::new(false),
            keep_alive_count: AtomicUsize::new(0),
            next_expiration: AtomicU64::new(0),
            shared,
        }))
    }

    pub fn keep_alive_count(&self) -> usize {
        self.keep_alive_count.load(Acquire)
    }

    /// Keeps the keep-alive gauge equal to the number of keys holding
    /// READ interest. Called after every interest mutation; the
    /// per-connection flag keeps the transitions balanced no matter
    /// which thread retires the socket.
    fn sync_keep_alive(&self, conn: &Connection, interest: Ready) {
        if interest.is_readable() {
            if !conn.keep_alive_counted.swap(true, AcqRel) {
                self.keep_alive_count.fetch_add(1, AcqRel);
            }
        } else if conn.keep_alive_counted.swap(false, AcqRel) {
            self.keep_alive_count.fetch_sub(1, AcqRel);
        }
    }

    /// Attaches a fresh connection: seeds read interest and defers the
    /// OS registration to the poller thread.
    pub fn register(self: &Arc<Self>, conn: Arc<Connection>) {
        conn.bind_poller(self);
        conn.set_interest(Ready::readable() | Ready::register());

        self.add_event(conn, Ready::readable(), EventKind::Register);
    }

    /// Posts an interest merge for an attached connection.
    pub fn rearm(&self, conn: Arc<Connection>, ops: Ready) -> io::Result<()> {
        self.add_event(conn, ops, EventKind::Rearm);
        Ok(())
    }

    fn add_event(&self, conn: Arc<Connection>, interest: Ready, kind: EventKind) {
        let mut record = self
            .shared
            .pools
            .events
            .poll()
            .unwrap_or_else(PollerEvent::new);
        record.conn = Some(conn);
        record.interest = interest;
        record.kind = kind;

        if let Err(err) = self.events.push(record) {
            let record = err.into_inner();
            if let Some(conn) = record.conn {
                debug!("poller {} event queue closed, dropping socket", self.id);
                self.cancelled_key(conn, None);
            }
        }
    }

    pub fn request_close(&self) {
        self.close.store(true, Release);
        let _ = self.events.wake();
    }

    fn closing(&self) -> bool {
        self.close.load(Acquire)
    }

    /// Drains the pending event queue, applying registrations and
    /// interest merges. Returns whether anything was processed.
    fn drain_events(&self) -> bool {
        let mut processed = false;

        while let Some(mut record) = self.events.pop() {
            processed = true;
            let conn = record.conn.take();
            let interest = record.interest;
            let kind = std::mem::replace(&mut record.kind, EventKind::Register);
            record.clear();
            self.shared.pools.events.offer(record);

            let Some(conn) = conn else { continue };

            match kind {
                EventKind::Register => self.run_register(conn),
                EventKind::Rearm => self.run_rearm(conn, interest),
            }
        }

        processed
    }

    fn run_register(&self, conn: Arc<Connection>) {
        if conn.is_cancelled() {
            return;
        }

        let token = {
            let mut conns = self.conns.lock().unwrap();
            if conns.len() >= self.size {
                drop(conns);
                warn!(
                    "poller {} at capacity ({} sockets), refusing connection",
                    self.id, self.size
                );
                self.cancelled_key(conn, None);
                return;
            }
            Token(conns.insert(conn.clone()))
        };

        conn.set_token(token);
        conn.set_interest(Ready::readable());
        conn.touch();

        let res = self
            .epoll
            .read()
            .unwrap()
            .add(conn.raw_fd(), token, Ready::readable());

        match res {
            Ok(()) => {
                self.sync_keep_alive(&conn, Ready::readable());
                trace!("poller {} registered {:?}", self.id, token);
            }
            Err(e) => {
                debug!("poller {} failed to register socket: {}", self.id, e);
                self.cancelled_key(conn, None);
            }
        }
    }

    fn run_rearm(&self, conn: Arc<Connection>, ops: Ready) {
        if conn.is_cancelled() {
            return;
        }
        let Some(token) = conn.token() else { return };

        let merged = conn.merge_interest(ops);
        conn.touch();

        let kernel = merged & (Ready::readable() | Ready::writable());
        let res = self
            .epoll
            .read()
            .unwrap()
            .modify(conn.raw_fd(), token, kernel);
        match res {
            Ok(()) => self.sync_keep_alive(&conn, merged),
            Err(e) => {
                debug!("poller {} re-arm failed: {}", self.id, e);
                self.cancelled_key(conn, None);
            }
        }
    }

    /// The readiness loop. Runs until close is requested, then expires
    /// every registered connection and counts down the shutdown latch.
    pub fn run(self: Arc<Self>, latch: Arc<Latch>) {
        let mut events = Events::with_capacity(1024.min(self.size.max(64)));
        let selector_timeout = Duration::from_millis(self.shared.config.selector_timeout);

        loop {
            if self.shared.flags.paused() && !self.closing() {
                thread::sleep(Duration::from_millis(100));
                continue;
            }

            let mut has_events = self.drain_events();

            if self.closing() {
                self.timeout(0, false);
                break;
            }

            let timeout = if self.events.pending() > 0 {
                Some(Duration::ZERO)
            } else {
                Some(selector_timeout)
            };

            let keys = match self.epoll.read().unwrap().wait(&mut events, timeout) {
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => 0,
                Err(e) => {
                    error!("poller {} readiness wait failed: {}", self.id, e);
                    self.shared.counters.poller_failure();
                    if let Err(e) = self.rebuild() {
                        error!("poller {} could not rebuild readiness queue: {}", self.id, e);
                        break;
                    }
                    continue;
                }
            };

            if keys == 0 {
                has_events |= self.drain_events();
            }

            let mut ready_keys = 0;
            for i in 0..keys {
                let Some(event) = events.get(i) else { continue };
                if event.token() == WAKE {
                    self.events.consume_wake();
                    continue;
                }
                ready_keys += 1;
                self.process_key(event.token(), event.readiness());
            }

            self.timeout(ready_keys, has_events);
        }

        latch.count_down();
        debug!("poller {} exited", self.id);
    }

    fn process_key(&self, token: Token, ready: Ready) {
        let conn = {
            let conns = self.conns.lock().unwrap();
            conns.get(token.into()).cloned()
        };

        let Some(conn) = conn else {
            // cancelled between the wait and the dispatch
            return;
        };

        if self.closing() {
            self.cancelled_key(conn, Some(SocketStatus::Stop));
            return;
        }

        if conn.is_cancelled() {
            return;
        }

        conn.touch();

        if conn.is_async() && !conn.interest().intersects(Ready::readable() | Ready::writable()) {
            // parked socket: only the resume path may dispatch, so route
            // readiness through it
            let status = if ready.is_error() || ready.is_hup() {
                SocketStatus::Disconnect
            } else {
                SocketStatus::Open
            };
            self.shared.process_socket_async(&conn, status);
            return;
        }

        if conn.has_sendfile() {
            // a parked transfer saw readiness on the primary queue;
            // hand it straight back to the engine
            if let Some(engine) = self.shared.sendfile() {
                engine.resume(conn);
            } else {
                self.cancelled_key(conn, None);
            }
            return;
        }

        if conn.is_comet() {
            // comet sockets drop their whole mask so a second readiness
            // notification cannot dispatch a second worker; the handler
            // re-arms explicitly via the comet interest
            conn.swap_interest(Ready::empty());
            if let Err(e) = self
                .epoll
                .read()
                .unwrap()
                .modify(conn.raw_fd(), token, Ready::empty())
            {
                debug!("poller {} comet disarm failed: {}", self.id, e);
                self.cancelled_key(conn, Some(SocketStatus::Disconnect));
                return;
            }
            self.sync_keep_alive(&conn, Ready::empty());

            if !self
                .shared
                .dispatch(conn.clone(), Some(SocketStatus::Open), ready)
            {
                self.cancelled_key(conn, Some(SocketStatus::Disconnect));
            }
            return;
        }

        // ordinary sockets shed only the observed bits
        let interest = conn.interest();
        let remaining = interest - ready - Ready::callback();
        let keep_callback = interest.is_callback()
            && !((interest.is_readable() && ready.is_readable())
                || (interest.is_writable() && ready.is_writable()));
        let remaining = if keep_callback {
            remaining | Ready::callback()
        } else {
            remaining
        };
        conn.set_interest(remaining);
        if let Err(e) = self.epoll.read().unwrap().modify(
            conn.raw_fd(),
            token,
            remaining & (Ready::readable() | Ready::writable()),
        ) {
            debug!("poller {} interest update failed: {}", self.id, e);
            self.cancelled_key(conn, None);
            return;
        }
        self.sync_keep_alive(&conn, remaining);

        if interest.is_callback() && !keep_callback {
            // readiness for a blocked helper: count the latch down
            // instead of dispatching
            if ready.is_readable() || ready.is_error() || ready.is_hup() {
                conn.read_latch.count_down();
            }
            if ready.is_writable() || ready.is_error() || ready.is_hup() {
                conn.write_latch.count_down();
            }
            return;
        }

        if !self.shared.dispatch(conn.clone(), None, ready) {
            self.cancelled_key(conn, Some(SocketStatus::Disconnect));
        }
    }

    /// Retires a connection. Safe to call from any thread, any number of
    /// times; the first caller does the work. Errors on the way out are
    /// swallowed so retirement always completes.
    pub fn cancelled_key(&self, conn: Arc<Connection>, status: Option<SocketStatus>) {
        if !conn.cancel() {
            return;
        }

        if conn.is_comet() {
            if let Some(status) = status {
                // final event before release; timeouts are dispatched,
                // everything else is delivered inline
                if status == SocketStatus::Timeout {
                    self.shared
                        .dispatch(conn.clone(), Some(SocketStatus::Timeout), Ready::empty());
                } else {
                    self.shared.handler.event(&conn, status);
                }
            }
        }

        if let Some(token) = conn.token() {
            let mut conns = self.conns.lock().unwrap();
            if conns.contains(token.into()) {
                conns.remove(token.into());
            }
        }

        if conn.keep_alive_counted.swap(false, AcqRel) {
            self.keep_alive_count.fetch_sub(1, AcqRel);
        }

        self.shared.remove_waiting(&conn);

        let fd = conn.raw_fd();
        if fd >= 0 {
            if let Err(e) = self.epoll.read().unwrap().delete(fd) {
                debug!("poller {} deregister: {}", self.id, e);
            }
        }

        self.shared.handler.release(&conn);

        // drops the file handle
        conn.sendfile.lock().unwrap().take();

        conn.close_socket();
        conn.set_interest(Ready::empty());

        if let Some(mut pair) = conn.buffers.lock().unwrap().take() {
            pair.clear();
            self.shared.pools.buffers.offer(pair);
        }

        if let Ok(mut wrapper) = Arc::try_unwrap(conn) {
            wrapper.reset();
            self.shared.pools.connections.offer(wrapper);
        }
    }

    /// Deadline sweep. Skipped entirely while nothing happened and the
    /// horizon has not arrived; otherwise walks every registered
    /// connection once.
    fn timeout(&self, keys: usize, has_events: bool) {
        let now = now_ms();
        let closing = self.closing();

        if keys == 0 && !has_events && now < self.next_expiration.load(Acquire) && !closing {
            return;
        }

        let snapshot: Vec<Arc<Connection>> = {
            let conns = self.conns.lock().unwrap();
            conns.iter().map(|(_, c)| c.clone()).collect()
        };

        let keep_alive_default = self.shared.config.effective_keep_alive_timeout();
        let so_timeout = self.shared.config.so_timeout;
        let mut next = now + self.shared.config.timeout_interval;

        for conn in snapshot {
            if closing {
                conn.set_interest(Ready::empty());
                self.cancelled_key(conn, Some(SocketStatus::Stop));
                continue;
            }

            if conn.is_cancelled() {
                continue;
            }

            let interest = conn.interest();

            if interest.intersects(Ready::readable() | Ready::writable()) {
                let t = conn.effective_timeout(keep_alive_default);
                if t >= 0 {
                    let deadline = conn.last_access() + t as u64;
                    if now > deadline {
                        // zeroed mask doubles as the guard against a
                        // second sweep picking the same key up
                        let prev = conn.swap_interest(Ready::empty());
                        if !prev.is_empty() {
                            self.cancelled_key(conn, Some(SocketStatus::Timeout));
                        }
                    } else if deadline < next {
                        next = deadline;
                    }
                }
            } else if conn.is_comet() && conn.comet_notify.swap(false, AcqRel) {
                if !self
                    .shared
                    .dispatch(conn.clone(), Some(SocketStatus::Open), Ready::empty())
                {
                    self.cancelled_key(conn, Some(SocketStatus::Disconnect));
                }
            } else if conn.is_async() {
                let t = conn.effective_timeout(so_timeout);
                if t >= 0 && now > conn.last_access() + t as u64 {
                    self.shared.process_socket_async(&conn, SocketStatus::Timeout);
                }
            }
        }

        self.next_expiration.store(next, Release);
    }

    /// Critical-failure recovery: tears the readiness queue down and
    /// starts over. Registered connections are cancelled through the
    /// normal retirement path.
    fn rebuild(&self) -> io::Result<()> {
        let snapshot: Vec<Arc<Connection>> = {
            let conns = self.conns.lock().unwrap();
            conns.iter().map(|(_, c)| c.clone()).collect()
        };
        for conn in snapshot {
            self.cancelled_key(conn, Some(SocketStatus::Error));
        }

        let fresh = Epoll::new()?;
        fresh.add(self.events.as_raw_fd(), WAKE, Ready::readable())?;

        let mut guard = self.epoll.write().unwrap();
        *guard = fresh;
        warn!("poller {} readiness queue rebuilt", self.id);
        Ok(())
    }
}
