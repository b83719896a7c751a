use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use hive_io::{
    Connection, Endpoint, EndpointConfig, Handler, Handshake, Ready, SendfileJob, Socket,
    SocketState, SocketStatus, TlsEngine, TlsIo, TlsProvider, TlsStatus,
};

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn test_config() -> EndpointConfig {
    let mut config = EndpointConfig::default();
    config.port = 0;
    config.poller_thread_count = 1;
    config.acceptor_thread_count = 1;
    config.worker_thread_count = 2;
    config.worker_queue_size = 64;
    config.use_sendfile = false;
    config.so_timeout = 10_000;
    config.selector_timeout = 100;
    config.timeout_interval = 100;
    config.oom_parachute = 0;
    config
}

#[derive(Default)]
struct Recorder {
    process_calls: AtomicUsize,
    responses: AtomicUsize,
    releases: AtomicUsize,
    events: Mutex<Vec<SocketStatus>>,
    asyncs: Mutex<Vec<SocketStatus>>,
    parked: Mutex<Option<Arc<Connection>>>,
}

impl Recorder {
    fn events(&self) -> Vec<SocketStatus> {
        self.events.lock().unwrap().clone()
    }

    fn asyncs(&self) -> Vec<SocketStatus> {
        self.asyncs.lock().unwrap().clone()
    }
}

type ProcessFn = dyn Fn(&Connection, usize, &Recorder) -> SocketState + Send + Sync;
type EventFn = dyn Fn(&Connection, SocketStatus, &Recorder) -> SocketState + Send + Sync;

struct TestHandler {
    rec: Arc<Recorder>,
    on_process: Box<ProcessFn>,
    on_event: Box<EventFn>,
    on_async: Box<EventFn>,
}

impl TestHandler {
    fn new(rec: Arc<Recorder>) -> TestHandler {
        TestHandler {
            rec,
            on_process: Box::new(|_, _, _| SocketState::Closed),
            on_event: Box::new(|_, _, _| SocketState::Closed),
            on_async: Box::new(|_, _, _| SocketState::Closed),
        }
    }

    fn on_process<F>(mut self, f: F) -> Self
    where
        F: Fn(&Connection, usize, &Recorder) -> SocketState + Send + Sync + 'static,
    {
        self.on_process = Box::new(f);
        self
    }

    fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&Connection, SocketStatus, &Recorder) -> SocketState + Send + Sync + 'static,
    {
        self.on_event = Box::new(f);
        self
    }

    fn on_async<F>(mut self, f: F) -> Self
    where
        F: Fn(&Connection, SocketStatus, &Recorder) -> SocketState + Send + Sync + 'static,
    {
        self.on_async = Box::new(f);
        self
    }
}

impl Handler for TestHandler {
    fn process(&self, conn: &Connection) -> SocketState {
        let call = self.rec.process_calls.fetch_add(1, Ordering::SeqCst) + 1;
        (self.on_process)(conn, call, &self.rec)
    }

    fn event(&self, conn: &Connection, status: SocketStatus) -> SocketState {
        self.rec.events.lock().unwrap().push(status);
        (self.on_event)(conn, status, &self.rec)
    }

    fn async_dispatch(&self, conn: &Connection, status: SocketStatus) -> SocketState {
        self.rec.asyncs.lock().unwrap().push(status);
        (self.on_async)(conn, status, &self.rec)
    }

    fn release(&self, _conn: &Connection) {
        self.rec.releases.fetch_add(1, Ordering::SeqCst);
    }
}

fn eventually<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for: {}", what);
}

fn read_eof(client: &mut TcpStream) -> io::Result<usize> {
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut sink = [0u8; 512];
    loop {
        match client.read(&mut sink) {
            Ok(0) => return Ok(0),
            Ok(_) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Pipelined keep-alive: three requests answered with `Open`, the
/// fourth closes; the idle count drains back to zero.
#[test]
fn keep_alive_pipeline_then_close() {
    init_logging();

    let rec = Arc::new(Recorder::default());
    let handler = TestHandler::new(rec.clone()).on_process(|conn, call, _| {
        let mut buf = [0u8; 256];
        match conn.read(&mut buf) {
            Ok(0) => SocketState::Closed,
            Ok(_) => {
                conn.write(b"ok").unwrap();
                if call < 4 {
                    SocketState::Open
                } else {
                    SocketState::Closed
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => SocketState::Open,
            Err(_) => SocketState::Closed,
        }
    });

    let endpoint = Endpoint::new(test_config(), handler);
    endpoint.start().unwrap();
    let addr = endpoint.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    for _ in 0..4 {
        client.write_all(b"ping").unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ok");
    }

    assert_eq!(read_eof(&mut client).unwrap(), 0);
    assert_eq!(rec.process_calls.load(Ordering::SeqCst), 4);
    eventually("keep-alive count to drain", Duration::from_secs(3), || {
        endpoint.keep_alive_count() == 0
    });

    endpoint.stop();
}

struct StagedEngine {
    rounds: usize,
}

impl TlsEngine for StagedEngine {
    fn handshake(
        &mut self,
        sock: &Socket,
        readable: bool,
        _writable: bool,
    ) -> io::Result<Handshake> {
        if readable {
            let mut flight = [0u8; 64];
            let _ = sock.read(&mut flight);
        }
        self.rounds += 1;
        if self.rounds < 3 {
            Ok(Handshake::Want(Ready::readable()))
        } else {
            Ok(Handshake::Done)
        }
    }

    fn wrap(&mut self, src: &[u8], dst: &mut Vec<u8>) -> io::Result<TlsIo> {
        dst.extend_from_slice(src);
        Ok(TlsIo {
            consumed: src.len(),
            produced: src.len(),
            status: TlsStatus::Ok,
        })
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut Vec<u8>) -> io::Result<TlsIo> {
        dst.extend_from_slice(src);
        Ok(TlsIo {
            consumed: src.len(),
            produced: src.len(),
            status: TlsStatus::Ok,
        })
    }
}

struct StagedProvider;

impl TlsProvider for StagedProvider {
    fn engine(&self) -> io::Result<Box<dyn TlsEngine>> {
        Ok(Box::new(StagedEngine { rounds: 0 }))
    }
}

/// Handshake wants two extra read-readiness rounds before completing,
/// then the socket behaves like a plain keep-alive connection.
#[test]
fn tls_handshake_spans_multiple_events() {
    init_logging();

    let rec = Arc::new(Recorder::default());
    let handler = TestHandler::new(rec.clone()).on_process(|conn, _, rec| {
        let mut buf = [0u8; 256];
        match conn.read(&mut buf) {
            Ok(0) => SocketState::Closed,
            Ok(_) => {
                conn.write(b"ok").unwrap();
                let sent = rec.responses.fetch_add(1, Ordering::SeqCst) + 1;
                if sent < 2 {
                    SocketState::Open
                } else {
                    SocketState::Closed
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => SocketState::Open,
            Err(_) => SocketState::Closed,
        }
    });

    let mut config = test_config();
    config.ssl_enabled = true;

    let endpoint = Endpoint::with_tls(config, handler, StagedProvider);
    endpoint.start().unwrap();
    let addr = endpoint.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    // three staged handshake flights, paced so each lands as its own
    // readiness event
    for _ in 0..3 {
        client.write_all(b"x").unwrap();
        thread::sleep(Duration::from_millis(200));
    }

    for _ in 0..2 {
        client.write_all(b"ping").unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ok");
    }

    assert_eq!(read_eof(&mut client).unwrap(), 0);
    endpoint.stop();
}

/// `Long` parks the socket; with no readiness and no resume the
/// sweeper delivers exactly one TIMEOUT, and the handler's `Closed`
/// retires the socket.
#[test]
fn long_poll_timeout_fires_once() {
    init_logging();

    let rec = Arc::new(Recorder::default());
    let handler = TestHandler::new(rec.clone())
        .on_process(|conn, _, _| {
            let mut buf = [0u8; 256];
            let _ = conn.read(&mut buf);
            conn.set_timeout(300);
            SocketState::Long
        })
        .on_async(|_, _, _| SocketState::Closed);

    let endpoint = Endpoint::new(test_config(), handler);
    endpoint.start().unwrap();
    let addr = endpoint.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"park me").unwrap();

    eventually("socket to park", Duration::from_secs(3), || {
        endpoint.waiting_count() == 1
    });
    // parked sockets hold no READ interest and leave the gauge
    assert_eq!(endpoint.keep_alive_count(), 0);

    assert_eq!(read_eof(&mut client).unwrap(), 0);
    thread::sleep(Duration::from_millis(1_500));

    assert_eq!(rec.asyncs(), vec![SocketStatus::Timeout]);
    assert_eq!(endpoint.waiting_count(), 0);

    endpoint.stop();
}

/// `Long` then an explicit resume: the winner of the waiting-set
/// removal dispatches, ASYNC_END tail-calls an OPEN dispatch, and the
/// handler closes from there.
#[test]
fn long_poll_resume_and_async_end() {
    init_logging();

    let rec = Arc::new(Recorder::default());
    let handler = TestHandler::new(rec.clone())
        .on_process(|conn, _, rec| {
            let mut buf = [0u8; 256];
            let _ = conn.read(&mut buf);
            *rec.parked.lock().unwrap() = conn.handle();
            SocketState::Long
        })
        .on_async(|_, status, _| {
            assert_eq!(status, SocketStatus::Open);
            SocketState::AsyncEnd
        })
        .on_event(|_, _, _| SocketState::Closed);

    let endpoint = Endpoint::new(test_config(), handler);
    endpoint.start().unwrap();
    let addr = endpoint.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"park me").unwrap();

    eventually("socket to park", Duration::from_secs(3), || {
        rec.parked.lock().unwrap().is_some()
    });
    assert_eq!(endpoint.keep_alive_count(), 0);

    let conn = rec.parked.lock().unwrap().take().unwrap();
    assert!(endpoint.process_socket_async(&conn, SocketStatus::Open));
    // the park was consumed; a second resume has nothing to win
    assert!(!endpoint.process_socket_async(&conn, SocketStatus::Open));

    assert_eq!(read_eof(&mut client).unwrap(), 0);
    assert_eq!(rec.asyncs(), vec![SocketStatus::Open]);
    assert_eq!(rec.events(), vec![SocketStatus::Open]);

    endpoint.stop();
}

/// An 8 MiB sendfile against a slow reader parks in the sendfile
/// poller; on completion the keep-alive flag re-enters the socket into
/// the primary poller.
#[test]
fn sendfile_parks_and_reenters_keep_alive() {
    init_logging();

    let dir = std::env::temp_dir();
    let path = dir.join(format!("hive-io-sendfile-{}", std::process::id()));
    let payload = vec![7u8; 8 * 1024 * 1024];
    std::fs::write(&path, &payload).unwrap();

    let rec = Arc::new(Recorder::default());
    let file = path.clone();
    let handler = TestHandler::new(rec.clone()).on_process(move |conn, call, _| {
        let mut buf = [0u8; 256];
        match conn.read(&mut buf) {
            Ok(0) => SocketState::Closed,
            Ok(_) => {
                if call == 1 {
                    let job =
                        SendfileJob::new(&file, 0, 8 * 1024 * 1024, true).unwrap();
                    conn.set_sendfile(job);
                    SocketState::Open
                } else {
                    SocketState::Closed
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => SocketState::Open,
            Err(_) => SocketState::Closed,
        }
    });

    let mut config = test_config();
    config.use_sendfile = true;

    let endpoint = Endpoint::new(config, handler);
    endpoint.start().unwrap();
    let addr = endpoint.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    client.write_all(b"get").unwrap();

    // let the socket buffer fill so the transfer has to park
    thread::sleep(Duration::from_millis(300));
    // while the transfer is in flight the socket is out of keep-alive
    assert_eq!(endpoint.keep_alive_count(), 0);

    let mut total = 0usize;
    let mut chunk = [0u8; 64 * 1024];
    while total < payload.len() {
        let n = client.read(&mut chunk).unwrap();
        assert!(n > 0, "short sendfile response");
        assert!(chunk[..n].iter().all(|b| *b == 7));
        total += n;
    }
    assert_eq!(total, payload.len());

    eventually("transfer accounting to drain", Duration::from_secs(3), || {
        endpoint.sendfile_count() == 0
    });
    eventually("socket to re-enter keep-alive", Duration::from_secs(3), || {
        endpoint.keep_alive_count() == 1
    });

    // keep-alive re-arm: the same socket serves another request
    client.write_all(b"done").unwrap();
    assert_eq!(read_eof(&mut client).unwrap(), 0);
    assert_eq!(rec.process_calls.load(Ordering::SeqCst), 2);

    endpoint.stop();
    std::fs::remove_file(&path).ok();
}

/// A zero-length range completes synchronously and leaves the
/// connection as it was.
#[test]
fn zero_length_sendfile_completes_inline() {
    init_logging();

    let dir = std::env::temp_dir();
    let path = dir.join(format!("hive-io-sendfile0-{}", std::process::id()));
    std::fs::write(&path, b"irrelevant").unwrap();

    let rec = Arc::new(Recorder::default());
    let file = path.clone();
    let handler = TestHandler::new(rec.clone()).on_process(move |conn, call, _| {
        let mut buf = [0u8; 256];
        match conn.read(&mut buf) {
            Ok(0) => SocketState::Closed,
            Ok(_) => {
                if call == 1 {
                    conn.set_sendfile(SendfileJob::new(&file, 0, 0, true).unwrap());
                    SocketState::Open
                } else {
                    conn.write(b"ok").unwrap();
                    SocketState::Closed
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => SocketState::Open,
            Err(_) => SocketState::Closed,
        }
    });

    let mut config = test_config();
    config.use_sendfile = true;

    let endpoint = Endpoint::new(config, handler);
    endpoint.start().unwrap();
    let addr = endpoint.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    client.write_all(b"get").unwrap();

    eventually("inline completion", Duration::from_secs(2), || {
        endpoint.sendfile_count() == 0
    });

    // the connection is still in keep-alive and serves the next request
    client.write_all(b"next").unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"ok");

    endpoint.stop();
    std::fs::remove_file(&path).ok();
}

/// An idle keep-alive socket is swept exactly once after its timeout.
#[test]
fn idle_keep_alive_socket_times_out() {
    init_logging();

    let rec = Arc::new(Recorder::default());
    let handler = TestHandler::new(rec.clone());

    let mut config = test_config();
    config.keep_alive_timeout = 300;

    let endpoint = Endpoint::new(config, handler);
    endpoint.start().unwrap();
    let addr = endpoint.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    eventually("registration", Duration::from_secs(2), || {
        endpoint.keep_alive_count() == 1
    });

    assert_eq!(read_eof(&mut client).unwrap(), 0);
    assert_eq!(endpoint.keep_alive_count(), 0);
    eventually("single release", Duration::from_secs(2), || {
        rec.releases.load(Ordering::SeqCst) == 1
    });

    endpoint.stop();
}

/// Comet sockets get the final TIMEOUT event delivered before release.
#[test]
fn comet_timeout_event_is_delivered() {
    init_logging();

    let rec = Arc::new(Recorder::default());
    let handler = TestHandler::new(rec.clone())
        .on_process(|conn, _, _| {
            let mut buf = [0u8; 256];
            let _ = conn.read(&mut buf);
            conn.set_comet(true);
            conn.set_timeout(300);
            SocketState::Open
        })
        .on_event(|_, _, _| SocketState::Closed);

    let endpoint = Endpoint::new(test_config(), handler);
    endpoint.start().unwrap();
    let addr = endpoint.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"subscribe").unwrap();

    assert_eq!(read_eof(&mut client).unwrap(), 0);
    eventually("timeout event", Duration::from_secs(3), || {
        rec.events() == vec![SocketStatus::Timeout]
    });

    endpoint.stop();
}

/// While paused, a connection that reaches accept is dropped without
/// the handler ever seeing it.
#[test]
fn paused_endpoint_drops_accepted_sockets() {
    init_logging();

    let rec = Arc::new(Recorder::default());
    let handler = TestHandler::new(rec.clone());

    let mut config = test_config();
    config.defer_accept = true;

    let endpoint = Endpoint::new(config, handler);
    endpoint.start().unwrap();
    let addr = endpoint.local_addr().unwrap();

    endpoint.pause();
    thread::sleep(Duration::from_millis(100));

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"anyone there?").unwrap();

    // dropped with unread data pending, so expect either FIN or RST
    assert!(matches!(read_eof(&mut client), Ok(0) | Err(_)));
    assert_eq!(rec.process_calls.load(Ordering::SeqCst), 0);
    assert_eq!(endpoint.keep_alive_count(), 0);

    endpoint.resume();
    endpoint.stop();
}

/// Stop sweeps a crowd of idle keep-alive sockets inside the grace
/// window; nothing but STOP ever reaches the handler.
#[test]
fn stop_retires_idle_connections() {
    init_logging();

    let rec = Arc::new(Recorder::default());
    let handler = TestHandler::new(rec.clone());

    let mut config = test_config();
    config.so_timeout = 60_000;

    let endpoint = Endpoint::new(config, handler);
    endpoint.start().unwrap();
    let addr = endpoint.local_addr().unwrap();

    let clients: Vec<TcpStream> = (0..100).map(|_| TcpStream::connect(addr).unwrap()).collect();
    eventually("idle crowd to register", Duration::from_secs(5), || {
        endpoint.keep_alive_count() == 100
    });

    let started = Instant::now();
    endpoint.stop();
    assert!(started.elapsed() < Duration::from_secs(3));

    assert_eq!(endpoint.keep_alive_count(), 0);
    assert!(rec.events().iter().all(|s| *s == SocketStatus::Stop));

    for mut client in clients {
        assert_eq!(read_eof(&mut client).unwrap(), 0);
    }
}
