use std::mem;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Client certificate verification policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    None,
    Optional,
    Require,
    /// Like `Optional` but accepts certificates that do not chain to a
    /// configured CA.
    OptionalNoCa,
}

/// TLS material handed to the [`TlsProvider`](crate::TlsProvider) at
/// init. The endpoint never reads these files itself.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub certificate_file: PathBuf,
    pub certificate_key_file: PathBuf,
    pub certificate_chain_file: Option<PathBuf>,
    pub ca_certificate_file: Option<PathBuf>,
    pub ca_certificate_path: Option<PathBuf>,
    pub revocation_file: Option<PathBuf>,
    pub cipher_suite: String,
    pub protocols: Vec<String>,
    pub verify: VerifyMode,
    pub verify_depth: u32,
}

impl Default for TlsConfig {
    fn default() -> TlsConfig {
        TlsConfig {
            certificate_file: PathBuf::new(),
            certificate_key_file: PathBuf::new(),
            certificate_chain_file: None,
            ca_certificate_file: None,
            ca_certificate_path: None,
            revocation_file: None,
            cipher_suite: "HIGH:!aNULL:!MD5".to_string(),
            protocols: vec!["TLSv1.2".to_string(), "TLSv1.3".to_string()],
            verify: VerifyMode::None,
            verify_depth: 10,
        }
    }
}

/// Endpoint tuning knobs. Timeouts are in milliseconds; `-1` means "use
/// the default for the context".
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub address: IpAddr,
    pub port: u16,
    pub backlog: i32,

    pub acceptor_thread_count: usize,
    pub poller_thread_count: usize,
    /// Max sockets per poller. Clamped against the fd limit at init; see
    /// [`effective_poller_size`].
    pub poller_size: usize,

    pub use_sendfile: bool,
    pub sendfile_size: usize,
    pub sendfile_thread_count: usize,

    pub use_comet: bool,

    pub keep_alive_timeout: i64,
    pub so_timeout: i64,
    pub timeout_interval: u64,
    pub selector_timeout: u64,
    /// Readiness wait granularity for the sendfile poller, in
    /// microseconds.
    pub poll_time: u64,
    pub max_keep_alive_requests: i64,

    pub tcp_no_delay: bool,
    pub so_linger_on: bool,
    pub so_linger_time: i32,
    pub defer_accept: bool,

    pub worker_thread_count: usize,
    pub worker_queue_size: usize,

    pub read_buffer_size: usize,
    pub write_buffer_size: usize,

    pub connection_cache: isize,
    pub event_cache: isize,
    pub processor_cache: isize,
    pub buffer_pool: isize,
    pub buffer_pool_bytes: isize,

    pub oom_parachute: usize,

    pub ssl_enabled: bool,
    pub tls: Option<TlsConfig>,
}

impl Default for EndpointConfig {
    fn default() -> EndpointConfig {
        EndpointConfig {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            backlog: 100,

            acceptor_thread_count: 1,
            poller_thread_count: num_cpus::get(),
            poller_size: 8 * 1024,

            use_sendfile: true,
            sendfile_size: 1024,
            sendfile_thread_count: 1,

            use_comet: true,

            keep_alive_timeout: -1,
            so_timeout: 20_000,
            timeout_interval: 1_000,
            selector_timeout: 1_000,
            poll_time: 2_000,
            max_keep_alive_requests: 100,

            tcp_no_delay: true,
            so_linger_on: false,
            so_linger_time: -1,
            defer_accept: false,

            worker_thread_count: 8,
            worker_queue_size: 128,

            read_buffer_size: 8 * 1024,
            write_buffer_size: 8 * 1024,

            connection_cache: 500,
            event_cache: 500,
            processor_cache: 500,
            buffer_pool: 500,
            buffer_pool_bytes: 10 * 1024 * 1024,

            oom_parachute: 1024 * 1024,

            ssl_enabled: false,
            tls: None,
        }
    }
}

impl EndpointConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Keep-alive sweep deadline: falls back to `so_timeout` when
    /// `keep_alive_timeout` is -1.
    pub fn effective_keep_alive_timeout(&self) -> i64 {
        if self.keep_alive_timeout >= 0 {
            self.keep_alive_timeout
        } else {
            self.so_timeout
        }
    }
}

/// Clamps the requested per-poller socket capacity against the process
/// fd limit. Oversized requests degrade to 1024, then to 62, mirroring
/// the select-era fallback chain.
pub fn effective_poller_size(requested: usize) -> usize {
    fallback(requested, rlimit_nofile())
}

fn fallback(requested: usize, limit: usize) -> usize {
    if requested <= limit {
        requested
    } else if 1024 <= limit {
        1024
    } else {
        62
    }
}

fn rlimit_nofile() -> usize {
    let mut rlim: libc::rlimit = unsafe { mem::zeroed() };
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) };
    if ret != 0 {
        return 1024;
    }
    if rlim.rlim_cur == libc::RLIM_INFINITY {
        usize::MAX
    } else {
        rlim.rlim_cur as usize
    }
}

#[cfg(test)]
mod test {
    use super::{fallback, EndpointConfig};

    #[test]
    fn fallback_chain() {
        // fits: untouched
        assert_eq!(fallback(100, 65536), 100);
        // over the limit: degrade to 1024
        assert_eq!(fallback(100_000, 4096), 1024);
        // limit below 1024: degrade to 62
        assert_eq!(fallback(100_000, 512), 62);
        assert_eq!(fallback(2048, 100), 62);
    }

    #[test]
    fn keep_alive_timeout_defaults_to_so_timeout() {
        let mut config = EndpointConfig::default();
        config.so_timeout = 5_000;
        config.keep_alive_timeout = -1;
        assert_eq!(config.effective_keep_alive_timeout(), 5_000);

        config.keep_alive_timeout = 100;
        assert_eq!(config.effective_keep_alive_timeout(), 100);
    }
}
