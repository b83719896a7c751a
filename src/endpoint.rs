use std::fs;
use std::io::{self, Error, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use indexmap::IndexMap;
use log::{debug, error, info, trace, warn};

use crate::acceptor;
use crate::buffer::BufferPair;
use crate::config::{effective_poller_size, EndpointConfig};
use crate::conn::{now_ms, Connection};
use crate::executor::Executor;
use crate::handler::{Handler, SocketState, SocketStatus};
use crate::latch::Latch;
use crate::pool::{BufferPool, Pool};
use crate::poller::{Poller, PollerEvent};
use crate::ready::Ready;
use crate::sendfile::SendfilePoller;
use crate::sys::Socket;
use crate::tls::{Handshake, TlsProvider};

/// Lifecycle state shared with every component. Pools consult it so
/// recycled objects are dropped instead of cached once the endpoint
/// leaves the running state.
pub(crate) struct Flags {
    initialized: AtomicBool,
    running: AtomicBool,
    paused: AtomicBool,
}

impl Flags {
    pub fn new() -> Flags {
        Flags {
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        }
    }

    pub fn initialized(&self) -> bool {
        self.initialized.load(Acquire)
    }

    pub fn set_initialized(&self, on: bool) {
        self.initialized.store(on, Release);
    }

    pub fn running(&self) -> bool {
        self.running.load(Acquire)
    }

    pub fn set_running(&self, on: bool) {
        self.running.store(on, Release);
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Acquire)
    }

    pub fn set_paused(&self, on: bool) {
        self.paused.store(on, Release);
    }
}

pub(crate) struct Counters {
    accept_failures: AtomicUsize,
    poller_failures: AtomicUsize,
    sendfile_active: AtomicUsize,
}

impl Counters {
    fn new() -> Counters {
        Counters {
            accept_failures: AtomicUsize::new(0),
            poller_failures: AtomicUsize::new(0),
            sendfile_active: AtomicUsize::new(0),
        }
    }

    pub fn accept_failure(&self) {
        self.accept_failures.fetch_add(1, Relaxed);
    }

    pub fn accept_failures(&self) -> usize {
        self.accept_failures.load(Relaxed)
    }

    pub fn poller_failure(&self) {
        self.poller_failures.fetch_add(1, Relaxed);
    }

    pub fn poller_failures(&self) -> usize {
        self.poller_failures.load(Relaxed)
    }

    pub fn sendfile_started(&self) {
        self.sendfile_active.fetch_add(1, Relaxed);
    }

    pub fn sendfile_finished(&self) {
        self.sendfile_active.fetch_sub(1, Relaxed);
    }

    pub fn sendfile_active(&self) -> usize {
        self.sendfile_active.load(Relaxed)
    }
}

/// Preallocated slab dropped on allocation failure so the runtime has
/// headroom to recover; a watchdog re-arms it once free memory looks
/// healthy again.
pub(crate) struct Parachute {
    size: usize,
    slab: Mutex<Option<Vec<u8>>>,
    released: AtomicBool,
}

impl Parachute {
    fn new(size: usize) -> Parachute {
        Parachute {
            size,
            slab: Mutex::new(None),
            released: AtomicBool::new(false),
        }
    }

    pub fn allocate(&self) {
        if self.size == 0 {
            return;
        }
        let mut vec = Vec::new();
        if vec.try_reserve_exact(self.size).is_ok() {
            *self.slab.lock().unwrap() = Some(vec);
            self.released.store(false, Release);
        } else {
            warn!("could not allocate {} byte OOM parachute", self.size);
        }
    }

    pub fn release(&self) -> bool {
        let had = self.slab.lock().unwrap().take().is_some();
        if had {
            self.released.store(true, Release);
        }
        had
    }

    /// Re-arms the parachute once free memory exceeds twice its size.
    pub fn reclaim_check(&self) {
        if self.size == 0 || !self.released.load(Acquire) {
            return;
        }
        if let Some(available) = mem_available() {
            if available > 2 * self.size as u64 {
                info!("reclaiming OOM parachute");
                self.allocate();
            }
        }
    }

    fn clear(&self) {
        self.slab.lock().unwrap().take();
        self.released.store(false, Release);
    }
}

fn mem_available() -> Option<u64> {
    let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

/// The four free-lists of §resource pooling: connection wrappers,
/// poller event records, processor tasks, and buffer pairs.
pub(crate) struct Pools {
    pub connections: Pool<Connection>,
    pub events: Pool<PollerEvent>,
    pub processors: Pool<SocketProcessor>,
    pub buffers: BufferPool,
}

impl Pools {
    fn new(config: &EndpointConfig, flags: Arc<Flags>) -> Pools {
        Pools {
            connections: Pool::new(config.connection_cache, flags.clone()),
            events: Pool::new(config.event_cache, flags.clone()),
            processors: Pool::new(config.processor_cache, flags.clone()),
            buffers: BufferPool::new(config.buffer_pool, config.buffer_pool_bytes, flags),
        }
    }

    pub fn clear_caches(&self) {
        self.connections.clear();
        self.events.clear();
        self.processors.clear();
        self.buffers.clear();
    }
}

/// State reachable from every thread the endpoint spawns.
pub(crate) struct Shared {
    pub flags: Arc<Flags>,
    pub config: EndpointConfig,
    pub handler: Box<dyn Handler>,
    pub tls: Option<Box<dyn TlsProvider>>,
    pub pools: Pools,
    pub counters: Counters,
    pub parachute: Parachute,
    waiting: Mutex<IndexMap<usize, Arc<Connection>>>,
    executor: Mutex<Option<Executor>>,
    sendfile: Mutex<Vec<Arc<SendfilePoller>>>,
    sendfile_rr: AtomicUsize,
}

impl Shared {
    /// Hands a task to the worker pool. Returns false on rejection; the
    /// caller closes the socket.
    pub fn dispatch(&self, conn: Arc<Connection>, status: Option<SocketStatus>, ready: Ready) -> bool {
        let mut task = self
            .pools
            .processors
            .poll()
            .unwrap_or_else(SocketProcessor::new);
        task.conn = Some(conn);
        task.status = status;
        task.ready = ready;

        let executor = self.executor.lock().unwrap();
        match executor.as_ref() {
            Some(executor) => match executor.execute(task) {
                Ok(()) => true,
                Err(mut task) => {
                    task.clear();
                    self.pools.processors.offer(task);
                    error!("worker pool rejected a socket");
                    false
                }
            },
            None => false,
        }
    }

    /// Resumes a parked socket. Whoever wins the removal from the
    /// waiting set gets to dispatch; everyone else (a concurrent
    /// timeout, a duplicate resume) sees false. This is the only guard
    /// against double dispatch, and it is sufficient.
    pub fn process_socket_async(&self, conn: &Arc<Connection>, status: SocketStatus) -> bool {
        if !self.remove_waiting(conn) {
            return false;
        }

        if self.dispatch(conn.clone(), Some(status), Ready::empty()) {
            true
        } else {
            self.retire(conn, Some(SocketStatus::Disconnect));
            false
        }
    }

    /// Routes retirement through the owning poller when there is one.
    pub fn retire(&self, conn: &Arc<Connection>, status: Option<SocketStatus>) {
        match conn.poller() {
            Some(poller) => poller.cancelled_key(conn.clone(), status),
            None => {
                if conn.cancel() {
                    self.handler.release(conn);
                    conn.close_socket();
                }
            }
        }
    }

    pub fn add_waiting(&self, conn: Arc<Connection>) {
        let key = Arc::as_ptr(&conn) as usize;
        self.waiting.lock().unwrap().insert(key, conn);
    }

    pub fn remove_waiting(&self, conn: &Arc<Connection>) -> bool {
        let key = Arc::as_ptr(conn) as usize;
        self.waiting.lock().unwrap().swap_remove(&key).is_some()
    }

    pub fn waiting_snapshot(&self) -> Vec<Arc<Connection>> {
        self.waiting.lock().unwrap().values().cloned().collect()
    }

    fn clear_waiting(&self) {
        self.waiting.lock().unwrap().clear();
    }

    pub fn sendfile(&self) -> Option<Arc<SendfilePoller>> {
        let engines = self.sendfile.lock().unwrap();
        if engines.is_empty() {
            return None;
        }
        let idx = self.sendfile_rr.fetch_add(1, Relaxed) % engines.len();
        Some(engines[idx].clone())
    }

    /// Draws a wrapper and buffers from the pools (allocating on a
    /// miss) and binds the accepted socket to them.
    pub fn build_connection(&self, socket: Socket, remote: SocketAddr) -> io::Result<Arc<Connection>> {
        let buffers = match self.pools.buffers.poll() {
            Some(pair) => pair,
            None => BufferPair::with_capacity(
                self.config.read_buffer_size,
                self.config.write_buffer_size,
            )?,
        };

        let tls = if self.config.ssl_enabled {
            let provider = self
                .tls
                .as_ref()
                .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "TLS enabled without provider"))?;
            Some(provider.engine()?)
        } else {
            None
        };

        let mut conn = self
            .pools
            .connections
            .poll()
            .unwrap_or_else(Connection::new);
        conn.activate(
            socket,
            remote,
            self.config.so_timeout,
            self.config.max_keep_alive_requests,
            self.config.use_comet,
            tls,
            buffers,
        );

        let conn = Arc::new(conn);
        conn.bind_self(&conn);
        Ok(conn)
    }

    /// Out-of-memory recovery: drop the parachute and every cache, then
    /// keep serving.
    pub fn oom(&self, err: &io::Error) {
        error!("allocation failure: {}; dropping caches", err);
        if self.parachute.release() {
            warn!("OOM parachute released");
        }
        self.pools.clear_caches();
    }
}

/// One dispatch of one connection to the protocol handler, including
/// the TLS handshake driving that precedes it. Tasks are pooled.
pub(crate) struct SocketProcessor {
    pub conn: Option<Arc<Connection>>,
    pub status: Option<SocketStatus>,
    pub ready: Ready,
}

impl SocketProcessor {
    pub fn new() -> SocketProcessor {
        SocketProcessor {
            conn: None,
            status: None,
            ready: Ready::empty(),
        }
    }

    pub fn clear(&mut self) {
        self.conn = None;
        self.status = None;
        self.ready = Ready::empty();
    }

    pub fn run(&mut self, shared: &Arc<Shared>) {
        let Some(conn) = self.conn.take() else { return };
        let status = self.status.take();
        let ready = std::mem::replace(&mut self.ready, Ready::empty());

        // one worker per connection at a time
        let _guard = conn.lock.lock().unwrap();

        if conn.is_cancelled() {
            // retirement dispatches a final comet timeout event
            if status == Some(SocketStatus::Timeout) && conn.is_comet() {
                shared.handler.event(&conn, SocketStatus::Timeout);
            }
            return;
        }

        if conn.needs_handshake()
            && !matches!(
                status,
                Some(SocketStatus::Stop) | Some(SocketStatus::Disconnect) | Some(SocketStatus::Error)
            )
        {
            let result = {
                let mut tls = conn.tls.lock().unwrap();
                match tls.as_mut() {
                    Some(engine) => conn.with_socket(|sock| {
                        engine.handshake(sock, ready.is_readable(), ready.is_writable())
                    }),
                    None => Ok(Handshake::Done),
                }
            };

            match result {
                Ok(Handshake::Done) => conn.finish_handshake(),
                Ok(Handshake::Want(ops)) => {
                    if conn.rearm(ops).is_err() {
                        shared.retire(&conn, Some(SocketStatus::Disconnect));
                    }
                    return;
                }
                Err(e) => {
                    debug!("TLS handshake failed: {}", e);
                    shared.retire(&conn, Some(SocketStatus::Disconnect));
                    return;
                }
            }
        }

        let state = match status {
            None => shared.handler.process(&conn),
            Some(st) => {
                if conn.is_comet() {
                    shared.handler.event(&conn, st)
                } else if conn.is_async() {
                    shared.handler.async_dispatch(&conn, st)
                } else {
                    shared.handler.event(&conn, st)
                }
            }
        };

        match state {
            SocketState::Open => {
                conn.set_async(false);
                if conn.has_sendfile() {
                    match shared.sendfile() {
                        Some(engine) => {
                            engine.add(conn.clone());
                        }
                        None => {
                            warn!("sendfile job attached while sendfile is disabled");
                            shared.retire(&conn, None);
                        }
                    }
                } else if conn.is_comet() {
                    conn.touch();
                    if conn.rearm(conn.comet_interest()).is_err() {
                        shared.retire(&conn, None);
                    }
                } else if !conn.take_keep_alive() {
                    trace!("keep-alive budget exhausted");
                    shared.retire(&conn, None);
                } else {
                    conn.touch();
                    if conn.rearm(Ready::readable()).is_err() {
                        shared.retire(&conn, None);
                    }
                }
            }
            SocketState::Closed => shared.retire(&conn, None),
            SocketState::Long => {
                conn.set_async(true);
                conn.touch();
                shared.add_waiting(conn.clone());
            }
            SocketState::AsyncEnd => {
                conn.set_async(false);
                if !shared.dispatch(conn.clone(), Some(SocketStatus::Open), Ready::empty()) {
                    shared.retire(&conn, Some(SocketStatus::Disconnect));
                }
            }
        }
    }
}

/// The connection-multiplexing endpoint: accepts sockets, multiplexes
/// idle keep-alive connections across poller threads, and dispatches
/// readiness to the protocol [`Handler`].
pub struct Endpoint {
    shared: Arc<Shared>,
    listener: Mutex<Option<Arc<Socket>>>,
    pollers: Mutex<Vec<Arc<Poller>>>,
    poller_threads: Mutex<Vec<JoinHandle<()>>>,
    acceptor_threads: Mutex<Vec<JoinHandle<()>>>,
    sendfile_threads: Mutex<Vec<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    stop_latch: Mutex<Option<Arc<Latch>>>,
    round_robin: Arc<AtomicUsize>,
    lifecycle: Mutex<()>,
}

impl Endpoint {
    pub fn new<H: Handler + 'static>(config: EndpointConfig, handler: H) -> Endpoint {
        Endpoint::build(config, Box::new(handler), None)
    }

    pub fn with_tls<H: Handler + 'static, P: TlsProvider + 'static>(
        config: EndpointConfig,
        handler: H,
        provider: P,
    ) -> Endpoint {
        Endpoint::build(config, Box::new(handler), Some(Box::new(provider)))
    }

    fn build(
        mut config: EndpointConfig,
        handler: Box<dyn Handler>,
        tls: Option<Box<dyn TlsProvider>>,
    ) -> Endpoint {
        config.poller_size = effective_poller_size(config.poller_size);

        let flags = Arc::new(Flags::new());
        let pools = Pools::new(&config, flags.clone());
        let parachute = Parachute::new(config.oom_parachute);

        let shared = Arc::new(Shared {
            flags,
            config,
            handler,
            tls,
            pools,
            counters: Counters::new(),
            parachute,
            waiting: Mutex::new(IndexMap::new()),
            executor: Mutex::new(None),
            sendfile: Mutex::new(Vec::new()),
            sendfile_rr: AtomicUsize::new(0),
        });

        Endpoint {
            shared,
            listener: Mutex::new(None),
            pollers: Mutex::new(Vec::new()),
            poller_threads: Mutex::new(Vec::new()),
            acceptor_threads: Mutex::new(Vec::new()),
            sendfile_threads: Mutex::new(Vec::new()),
            sweeper: Mutex::new(None),
            stop_latch: Mutex::new(None),
            round_robin: Arc::new(AtomicUsize::new(0)),
            lifecycle: Mutex::new(()),
        }
    }

    /// Binds and listens, builds the pollers. Idempotent.
    pub fn init(&self) -> io::Result<()> {
        let _guard = self.lifecycle.lock().unwrap();
        self.init_inner()
    }

    fn init_inner(&self) -> io::Result<()> {
        if self.shared.flags.initialized() {
            return Ok(());
        }

        let config = &self.shared.config;

        if config.ssl_enabled {
            let provider = self.shared.tls.as_ref().ok_or_else(|| {
                Error::new(ErrorKind::InvalidInput, "TLS enabled without a provider")
            })?;
            let tls_config = config.tls.clone().unwrap_or_default();
            provider.init(&tls_config)?;
        }

        let addr = config.socket_addr();
        let sock = Socket::stream(&addr)?;
        sock.set_reuseaddr(true)?;
        sock.set_keepalive(true)?;
        if config.defer_accept {
            if let Err(e) = sock.set_defer_accept(1) {
                debug!("TCP_DEFER_ACCEPT not applied: {}", e);
            }
        }
        sock.bind(&addr)?;
        sock.listen(config.backlog)?;
        info!("listening on {}", sock.local_addr()?);
        *self.listener.lock().unwrap() = Some(Arc::new(sock));

        let mut pollers = Vec::new();
        for id in 0..config.poller_thread_count.max(1) {
            pollers.push(Poller::new(id, config.poller_size, self.shared.clone())?);
        }
        *self.pollers.lock().unwrap() = pollers;

        self.shared.flags.set_initialized(true);
        Ok(())
    }

    /// Creates pools and spawns every thread. Idempotent.
    pub fn start(&self) -> io::Result<()> {
        let _guard = self.lifecycle.lock().unwrap();
        self.init_inner()?;

        if self.shared.flags.running() {
            return Ok(());
        }

        let config = &self.shared.config;
        self.shared.flags.set_running(true);
        self.shared.flags.set_paused(false);
        self.shared.parachute.allocate();

        *self.shared.executor.lock().unwrap() = Some(Executor::start(
            config.worker_thread_count.max(1),
            config.worker_queue_size.max(1),
            self.shared.clone(),
        )?);

        if config.use_sendfile {
            let mut threads = self.sendfile_threads.lock().unwrap();
            for id in 0..config.sendfile_thread_count.max(1) {
                let engine = SendfilePoller::new(id, self.shared.clone())?;
                self.shared.sendfile.lock().unwrap().push(engine.clone());
                let handle = thread::Builder::new()
                    .name(format!("sendfile-{}", id))
                    .spawn(move || engine.run())?;
                threads.push(handle);
            }
        }

        let pollers = self.pollers.lock().unwrap().clone();
        let latch = Arc::new(Latch::new(pollers.len()));
        *self.stop_latch.lock().unwrap() = Some(latch.clone());

        {
            let mut threads = self.poller_threads.lock().unwrap();
            for poller in &pollers {
                let poller = poller.clone();
                let latch = latch.clone();
                let handle = thread::Builder::new()
                    .name(format!("poller-{}", poller.id))
                    .spawn(move || poller.run(latch))?;
                threads.push(handle);
            }
        }

        let listener = self
            .listener
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "endpoint not bound"))?;
        {
            let mut threads = self.acceptor_threads.lock().unwrap();
            for id in 0..config.acceptor_thread_count.max(1) {
                let listener = listener.clone();
                let shared = self.shared.clone();
                let pollers = pollers.clone();
                let rr = self.round_robin.clone();
                let handle = thread::Builder::new()
                    .name(format!("acceptor-{}", id))
                    .spawn(move || acceptor::run(id, listener, shared, pollers, rr))?;
                threads.push(handle);
            }
        }

        let shared = self.shared.clone();
        *self.sweeper.lock().unwrap() = Some(
            thread::Builder::new()
                .name("async-timeout".to_string())
                .spawn(move || sweeper_loop(shared))?,
        );

        info!("endpoint started");
        Ok(())
    }

    /// Stops accepting without dropping established connections.
    pub fn pause(&self) {
        if self.shared.flags.running() && !self.shared.flags.paused() {
            info!("endpoint paused");
            self.shared.flags.set_paused(true);
        }
    }

    pub fn resume(&self) {
        if self.shared.flags.running() && self.shared.flags.paused() {
            info!("endpoint resumed");
            self.shared.flags.set_paused(false);
        }
    }

    /// Stops every thread and retires every connection. Idempotent.
    pub fn stop(&self) {
        let _guard = self.lifecycle.lock().unwrap();
        self.stop_inner();
    }

    fn stop_inner(&self) {
        if !self.shared.flags.running() {
            return;
        }

        info!("stopping endpoint");
        self.shared.flags.set_running(false);

        // the acceptor may be parked inside accept(2); a self-connect
        // gets it moving again
        self.unlock_accept();

        for poller in self.pollers.lock().unwrap().iter() {
            poller.request_close();
        }

        let grace =
            Duration::from_millis(self.shared.config.selector_timeout.saturating_add(100));
        let clean = match self.stop_latch.lock().unwrap().take() {
            Some(latch) => latch.wait_timeout(grace),
            None => true,
        };

        let mut poller_threads = self.poller_threads.lock().unwrap();
        if clean {
            for handle in poller_threads.drain(..) {
                let _ = handle.join();
            }
        } else {
            warn!("pollers did not exit within the grace window");
            poller_threads.clear();
        }
        drop(poller_threads);

        for handle in self.acceptor_threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }

        for engine in self.shared.sendfile.lock().unwrap().drain(..) {
            engine.request_close();
        }
        for handle in self.sendfile_threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }

        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            let _ = handle.join();
        }

        // take the executor out before shutting down: a worker finishing
        // an ASYNC_END tail-dispatch grabs the same lock
        let executor = self.shared.executor.lock().unwrap().take();
        if let Some(executor) = executor {
            executor.shutdown();
        }

        self.shared.clear_waiting();
        self.pollers.lock().unwrap().clear();
        info!("endpoint stopped");
    }

    /// Releases the listening socket and every cache.
    pub fn destroy(&self) {
        let _guard = self.lifecycle.lock().unwrap();
        self.stop_inner();

        self.listener.lock().unwrap().take();
        self.shared.pools.clear_caches();
        self.shared.parachute.clear();
        self.shared.flags.set_initialized(false);
    }

    fn unlock_accept(&self) {
        let Some(listener) = self.listener.lock().unwrap().clone() else {
            return;
        };
        let Ok(mut addr) = listener.local_addr() else {
            return;
        };

        if addr.ip().is_unspecified() {
            match addr.ip() {
                IpAddr::V4(_) => addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST)),
                IpAddr::V6(_) => addr.set_ip(IpAddr::V6(Ipv6Addr::LOCALHOST)),
            }
        }

        match Socket::stream(&addr) {
            Ok(sock) => {
                if let Err(e) = sock.connect_timeout(&addr, Duration::from_millis(250)) {
                    trace!("accept unlock connect: {}", e);
                }
            }
            Err(e) => trace!("accept unlock socket: {}", e),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.flags.running()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.flags.paused()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        let listener = self.listener.lock().unwrap();
        listener.as_ref().and_then(|sock| sock.local_addr().ok())
    }

    /// Idle connections currently parked in readiness queues.
    pub fn keep_alive_count(&self) -> usize {
        self.pollers
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.keep_alive_count())
            .sum()
    }

    /// Sendfile transfers in flight.
    pub fn sendfile_count(&self) -> usize {
        self.shared.counters.sendfile_active()
    }

    pub fn accept_failures(&self) -> usize {
        self.shared.counters.accept_failures()
    }

    pub fn poller_failures(&self) -> usize {
        self.shared.counters.poller_failures()
    }

    /// Number of sockets parked for asynchronous resumption.
    pub fn waiting_count(&self) -> usize {
        self.shared.waiting.lock().unwrap().len()
    }

    /// Resumes a connection previously parked by a `Long` handler
    /// return. At most one dispatch happens per park, no matter how
    /// this races with the timeout sweeper.
    pub fn process_socket_async(&self, conn: &Arc<Connection>, status: SocketStatus) -> bool {
        self.shared.process_socket_async(conn, status)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Dedicated sweep over the parked-socket set; fires TIMEOUT through
/// the same remove-wins gate external resumes use.
fn sweeper_loop(shared: Arc<Shared>) {
    while shared.flags.running() {
        for _ in 0..10 {
            if !shared.flags.running() {
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }

        let now = now_ms();
        for conn in shared.waiting_snapshot() {
            if conn.is_cancelled() {
                shared.remove_waiting(&conn);
                continue;
            }

            let t = conn.effective_timeout(shared.config.so_timeout);
            if t >= 0 && now > conn.last_access() + t as u64 {
                shared.process_socket_async(&conn, SocketStatus::Timeout);
            }
        }
    }
}
