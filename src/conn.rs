use std::cmp;
use std::fmt;
use std::io::{self, Error, ErrorKind};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, AtomicU8, AtomicUsize};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use crate::buffer::BufferPair;
use crate::latch::Latch;
use crate::poller::Poller;
use crate::ready::Ready;
use crate::sendfile::SendfileJob;
use crate::sys::Socket;
use crate::tls::TlsEngine;
use crate::token::Token;

pub(crate) const NO_TOKEN: usize = usize::MAX;

const OPEN: u8 = 0;
const CANCELLED: u8 = 1;

/// Coarse monotonic clock, milliseconds since first use. Timeout sweeps
/// compare these stamps instead of taking `Instant`s per connection.
pub(crate) fn now_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// One accepted TCP socket plus the state the endpoint tracks for it:
/// interest mask, deadlines, keep-alive budget, comet/async mode flags,
/// optional TLS engine and sendfile job, and the latches that let
/// blocking helpers ride on top of the nonblocking socket.
///
/// Wrappers are pooled: `reset` scrubs one for reuse without touching
/// the (already retired) socket handle.
pub struct Connection {
    pub(crate) socket: Mutex<Option<Socket>>,
    fd: AtomicI32,
    remote: Mutex<Option<SocketAddr>>,

    self_ref: Mutex<Weak<Connection>>,
    poller: Mutex<Weak<Poller>>,
    token: AtomicUsize,

    state: AtomicU8,
    interest: AtomicUsize,

    last_access: AtomicU64,
    timeout: AtomicI64,
    default_timeout: AtomicI64,
    keep_alive_left: AtomicI64,
    /// Whether this connection is currently counted in its poller's
    /// keep-alive gauge, i.e. registered with READ interest.
    pub(crate) keep_alive_counted: AtomicBool,

    async_flag: AtomicBool,
    comet_allowed: AtomicBool,
    comet: AtomicBool,
    comet_ops: AtomicUsize,
    pub(crate) comet_notify: AtomicBool,

    handshake_done: AtomicBool,
    pub(crate) tls: Mutex<Option<Box<dyn TlsEngine>>>,
    pub(crate) sendfile: Mutex<Option<SendfileJob>>,
    pub(crate) buffers: Mutex<Option<BufferPair>>,

    pub(crate) read_latch: Latch,
    pub(crate) write_latch: Latch,

    /// Serializes workers: resume, timeout and ordinary dispatch for the
    /// same connection never overlap.
    pub(crate) lock: Mutex<()>,
}

impl Connection {
    pub(crate) fn new() -> Connection {
        Connection {
            socket: Mutex::new(None),
            fd: AtomicI32::new(-1),
            remote: Mutex::new(None),
            self_ref: Mutex::new(Weak::new()),
            poller: Mutex::new(Weak::new()),
            token: AtomicUsize::new(NO_TOKEN),
            state: AtomicU8::new(OPEN),
            interest: AtomicUsize::new(0),
            last_access: AtomicU64::new(0),
            timeout: AtomicI64::new(-1),
            default_timeout: AtomicI64::new(-1),
            keep_alive_left: AtomicI64::new(-1),
            keep_alive_counted: AtomicBool::new(false),
            async_flag: AtomicBool::new(false),
            comet_allowed: AtomicBool::new(true),
            comet: AtomicBool::new(false),
            comet_ops: AtomicUsize::new(Ready::readable().as_usize()),
            comet_notify: AtomicBool::new(false),
            handshake_done: AtomicBool::new(true),
            tls: Mutex::new(None),
            sendfile: Mutex::new(None),
            buffers: Mutex::new(None),
            read_latch: Latch::new(0),
            write_latch: Latch::new(0),
            lock: Mutex::new(()),
        }
    }

    pub(crate) fn activate(
        &mut self,
        socket: Socket,
        remote: SocketAddr,
        so_timeout: i64,
        keep_alive_budget: i64,
        comet_allowed: bool,
        tls: Option<Box<dyn TlsEngine>>,
        buffers: BufferPair,
    ) {
        self.fd.store(socket.raw(), Release);
        *self.socket.lock().unwrap() = Some(socket);
        *self.remote.lock().unwrap() = Some(remote);
        self.state.store(OPEN, Release);
        self.timeout.store(-1, Release);
        self.default_timeout.store(so_timeout, Release);
        self.keep_alive_left.store(keep_alive_budget, Release);
        self.comet_allowed.store(comet_allowed, Release);
        self.handshake_done.store(tls.is_none(), Release);
        *self.tls.lock().unwrap() = tls;
        *self.buffers.lock().unwrap() = Some(buffers);
        self.touch();
    }

    pub(crate) fn bind_self(&self, this: &Arc<Connection>) {
        *self.self_ref.lock().unwrap() = Arc::downgrade(this);
    }

    pub(crate) fn this(&self) -> Option<Arc<Connection>> {
        self.self_ref.lock().unwrap().upgrade()
    }

    /// Shared handle to this connection, for resuming it later via
    /// [`Endpoint::process_socket_async`](crate::Endpoint::process_socket_async).
    pub fn handle(&self) -> Option<Arc<Connection>> {
        self.this()
    }

    pub(crate) fn bind_poller(&self, poller: &Arc<Poller>) {
        *self.poller.lock().unwrap() = Arc::downgrade(poller);
    }

    pub(crate) fn poller(&self) -> Option<Arc<Poller>> {
        self.poller.lock().unwrap().upgrade()
    }

    pub(crate) fn set_token(&self, token: Token) {
        self.token.store(token.into(), Release);
    }

    pub(crate) fn token(&self) -> Option<Token> {
        match self.token.load(Acquire) {
            NO_TOKEN => None,
            t => Some(Token(t)),
        }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.load(Acquire)
    }

    /// First caller wins; repeated cancellations are no-ops.
    pub(crate) fn cancel(&self) -> bool {
        self.state
            .compare_exchange(OPEN, CANCELLED, AcqRel, Acquire)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Acquire) == CANCELLED
    }

    pub(crate) fn interest(&self) -> Ready {
        Ready::from_usize(self.interest.load(Acquire))
    }

    pub(crate) fn set_interest(&self, ops: Ready) {
        self.interest.store(ops.as_usize(), Release);
    }

    /// Merges `ops` into the mask, returning the merged mask.
    pub(crate) fn merge_interest(&self, ops: Ready) -> Ready {
        let prev = self.interest.fetch_or(ops.as_usize(), AcqRel);
        Ready::from_usize(prev | ops.as_usize())
    }

    pub(crate) fn swap_interest(&self, ops: Ready) -> Ready {
        Ready::from_usize(self.interest.swap(ops.as_usize(), AcqRel))
    }

    pub(crate) fn touch(&self) {
        self.last_access.store(now_ms(), Release);
    }

    pub(crate) fn last_access(&self) -> u64 {
        self.last_access.load(Acquire)
    }

    /// Per-connection timeout in ms; -1 means "use the default".
    pub fn set_timeout(&self, ms: i64) {
        self.timeout.store(ms, Release);
    }

    pub fn timeout(&self) -> i64 {
        self.timeout.load(Acquire)
    }

    pub(crate) fn effective_timeout(&self, fallback: i64) -> i64 {
        let t = self.timeout.load(Acquire);
        if t >= 0 {
            t
        } else {
            fallback
        }
    }

    fn io_timeout(&self) -> Duration {
        let t = self.effective_timeout(self.default_timeout.load(Acquire));
        if t < 0 {
            Duration::from_secs(u64::MAX)
        } else {
            Duration::from_millis(t as u64)
        }
    }

    /// Burns one keep-alive credit. Returns false when the budget is
    /// spent; a budget of -1 never runs out.
    pub(crate) fn take_keep_alive(&self) -> bool {
        if self.keep_alive_left.load(Acquire) < 0 {
            return true;
        }
        self.keep_alive_left.fetch_sub(1, AcqRel) > 1
    }

    pub fn set_async(&self, on: bool) {
        self.async_flag.store(on, Release);
    }

    pub fn is_async(&self) -> bool {
        self.async_flag.load(Acquire)
    }

    /// Switches the connection into comet (long-poll) mode. Ignored
    /// when the endpoint was configured without comet support.
    pub fn set_comet(&self, on: bool) {
        self.comet
            .store(on && self.comet_allowed.load(Acquire), Release);
    }

    /// Asks the poller to deliver an OPEN event on its next sweep, for
    /// server-initiated comet pushes.
    pub fn set_comet_notify(&self, on: bool) {
        self.comet_notify.store(on, Release);
    }

    pub fn is_comet(&self) -> bool {
        self.comet.load(Acquire)
    }

    /// Interest the poller re-arms after a comet dispatch returns
    /// `Open`.
    pub fn set_comet_interest(&self, ops: Ready) {
        self.comet_ops.store(ops.as_usize(), Release);
    }

    pub(crate) fn comet_interest(&self) -> Ready {
        Ready::from_usize(self.comet_ops.load(Acquire))
    }

    pub(crate) fn needs_handshake(&self) -> bool {
        !self.handshake_done.load(Acquire)
    }

    pub(crate) fn finish_handshake(&self) {
        self.handshake_done.store(true, Release);
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote.lock().unwrap()
    }

    /// Attaches a sendfile job; the endpoint routes it to the sendfile
    /// engine once the current dispatch returns.
    pub fn set_sendfile(&self, job: SendfileJob) {
        *self.sendfile.lock().unwrap() = Some(job);
    }

    pub(crate) fn has_sendfile(&self) -> bool {
        self.sendfile.lock().unwrap().is_some()
    }

    /// Posts a deferred interest merge to the owning poller.
    pub fn rearm(&self, ops: Ready) -> io::Result<()> {
        let poller = self
            .poller()
            .ok_or_else(|| Error::new(ErrorKind::NotConnected, "no poller"))?;
        let this = self
            .this()
            .ok_or_else(|| Error::new(ErrorKind::NotConnected, "detached wrapper"))?;
        poller.rearm(this, ops)
    }

    /// Blocks the calling worker until the socket turns readable, via a
    /// latch counted down by the poller. Returns false on timeout.
    pub fn poll_read(&self) -> io::Result<bool> {
        self.read_latch.set(1);
        self.rearm(Ready::readable() | Ready::callback())?;
        Ok(self.read_latch.wait_timeout(self.io_timeout()))
    }

    /// Write-readiness counterpart of [`poll_read`](Self::poll_read).
    pub fn poll_write(&self) -> io::Result<bool> {
        self.write_latch.set(1);
        self.rearm(Ready::writable() | Ready::callback())?;
        Ok(self.write_latch.wait_timeout(self.io_timeout()))
    }

    /// Reads plaintext. Routed through the TLS engine when one is
    /// attached; leftover decrypted bytes spill into the read buffer
    /// and are served first on the next call.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(pair) = buffers.as_mut() {
                let spill = pair.read_buf();
                if !spill.is_empty() {
                    let take = cmp::min(spill.len(), buf.len());
                    buf[..take].copy_from_slice(&spill[..take]);
                    spill.drain(..take);
                    return Ok(take);
                }
            }
        }

        let mut tls = self.tls.lock().unwrap();
        match tls.as_mut() {
            None => self.with_socket(|sock| sock.read(buf)),
            Some(engine) => {
                let mut raw = [0u8; 16 * 1024];
                let n = self.with_socket(|sock| sock.read(&mut raw))?;
                if n == 0 {
                    return Ok(0);
                }
                let mut plain = Vec::new();
                engine.unwrap(&raw[..n], &mut plain)?;
                let take = cmp::min(plain.len(), buf.len());
                buf[..take].copy_from_slice(&plain[..take]);
                if take < plain.len() {
                    let mut buffers = self.buffers.lock().unwrap();
                    if let Some(pair) = buffers.as_mut() {
                        pair.read_buf().extend_from_slice(&plain[take..]);
                    }
                }
                Ok(take)
            }
        }
    }

    /// Writes plaintext. A TLS record is flushed whole, parking on the
    /// write latch when the socket pushes back; plaintext writes are a
    /// single nonblocking attempt.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut tls = self.tls.lock().unwrap();
        match tls.as_mut() {
            None => self.with_socket(|sock| sock.write(buf)),
            Some(engine) => {
                let mut records = Vec::new();
                let done = engine.wrap(buf, &mut records)?;
                drop(tls);
                let mut off = 0;
                while off < records.len() {
                    match self.with_socket(|sock| sock.write(&records[off..])) {
                        Ok(n) => off += n,
                        Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                            if !self.poll_write()? {
                                return Err(Error::new(ErrorKind::TimedOut, "write timed out"));
                            }
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(done.consumed)
            }
        }
    }

    pub(crate) fn with_socket<F, R>(&self, f: F) -> io::Result<R>
    where
        F: FnOnce(&Socket) -> io::Result<R>,
    {
        let guard = self.socket.lock().unwrap();
        match guard.as_ref() {
            Some(sock) => f(sock),
            None => Err(Error::new(ErrorKind::NotConnected, "socket closed")),
        }
    }

    /// Drops the socket handle (closing the fd) and unblocks any parked
    /// helpers. Only the cancellation path calls this.
    pub(crate) fn close_socket(&self) {
        self.fd.store(-1, Release);
        *self.socket.lock().unwrap() = None;
        self.read_latch.count_down();
        self.write_latch.count_down();
    }

    /// Scrubs the wrapper for the free-list. Latches are counted down,
    /// the sendfile job and TLS engine are dropped, flags and masks are
    /// zeroed. The socket handle is left alone: retiring it is the
    /// cancellation path's job, not the pool's.
    pub(crate) fn reset(&mut self) {
        self.read_latch.count_down();
        self.write_latch.count_down();
        self.read_latch.set(0);
        self.write_latch.set(0);
        *self.remote.lock().unwrap() = None;
        *self.self_ref.lock().unwrap() = Weak::new();
        *self.poller.lock().unwrap() = Weak::new();
        self.token.store(NO_TOKEN, Release);
        self.state.store(OPEN, Release);
        self.interest.store(0, Release);
        self.last_access.store(0, Release);
        self.timeout.store(-1, Release);
        self.keep_alive_left.store(-1, Release);
        self.keep_alive_counted.store(false, Release);
        self.async_flag.store(false, Release);
        self.comet_allowed.store(true, Release);
        self.comet.store(false, Release);
        self.comet_ops
            .store(Ready::readable().as_usize(), Release);
        self.comet_notify.store(false, Relaxed);
        self.handshake_done.store(true, Release);
        *self.tls.lock().unwrap() = None;
        *self.sendfile.lock().unwrap() = None;
        *self.buffers.lock().unwrap() = None;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Connection")
            .field("fd", &self.raw_fd())
            .field("token", &self.token())
            .field("interest", &self.interest())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::Connection;
    use crate::ready::Ready;

    #[test]
    fn reset_is_idempotent() {
        let mut conn = Connection::new();
        conn.set_interest(Ready::readable());
        conn.set_comet(true);
        conn.set_async(true);
        conn.set_timeout(5_000);

        conn.reset();
        let snapshot = format!("{:?}", conn);

        conn.reset();
        assert_eq!(format!("{:?}", conn), snapshot);
        assert!(conn.interest().is_empty());
        assert!(!conn.is_comet());
        assert!(!conn.is_async());
        assert_eq!(conn.timeout(), -1);
    }

    #[test]
    fn cancel_only_once() {
        let conn = Connection::new();
        assert!(conn.cancel());
        assert!(!conn.cancel());
        assert!(conn.is_cancelled());
    }

    #[test]
    fn keep_alive_budget() {
        let conn = Connection::new();
        // -1: unlimited
        assert!(conn.take_keep_alive());
        assert!(conn.take_keep_alive());

        conn.keep_alive_left.store(2, std::sync::atomic::Ordering::SeqCst);
        assert!(conn.take_keep_alive());
        assert!(!conn.take_keep_alive());
    }

    #[test]
    fn interest_merge() {
        let conn = Connection::new();
        conn.set_interest(Ready::readable());
        let merged = conn.merge_interest(Ready::writable());
        assert!(merged.is_readable() && merged.is_writable());
        assert_eq!(conn.interest(), merged);

        let prev = conn.swap_interest(Ready::empty());
        assert_eq!(prev, merged);
        assert!(conn.interest().is_empty());
    }
}
