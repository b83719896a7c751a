use std::io::{self, ErrorKind};
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info};

use crate::config::EndpointConfig;
use crate::endpoint::Shared;
use crate::poller::Poller;
use crate::sys::Socket;

/// Blocking accept loop. Accepted sockets are switched to nonblocking,
/// wrapped, and handed round-robin to the pollers. While the endpoint
/// is paused the loop sleep-polls and drops anything the kernel hands
/// it anyway.
pub(crate) fn run(
    id: usize,
    listener: Arc<Socket>,
    shared: Arc<Shared>,
    pollers: Vec<Arc<Poller>>,
    round_robin: Arc<AtomicUsize>,
) {
    info!("acceptor-{} listening", id);

    loop {
        while shared.flags.paused() && shared.flags.running() {
            thread::sleep(Duration::from_secs(1));
        }

        if !shared.flags.running() {
            break;
        }

        shared.parachute.reclaim_check();

        match listener.accept() {
            Ok((sock, addr)) => {
                if !shared.flags.running() || shared.flags.paused() {
                    // unlock nudge at stop, or a connection raced the
                    // pause flag; either way it never reaches a handler
                    continue;
                }

                if let Err(e) = set_socket_options(&sock, &shared.config) {
                    debug!("acceptor-{} socket options failed: {}", id, e);
                    continue;
                }

                match shared.build_connection(sock, addr) {
                    Ok(conn) => {
                        let idx = round_robin.fetch_add(1, Relaxed) % pollers.len();
                        pollers[idx].register(conn);
                    }
                    Err(ref e) if e.kind() == ErrorKind::OutOfMemory => {
                        shared.oom(e);
                    }
                    Err(e) => {
                        debug!("acceptor-{} could not wrap socket: {}", id, e);
                    }
                }
            }
            Err(e) => {
                if !shared.flags.running() {
                    break;
                }
                shared.counters.accept_failure();
                error!("acceptor-{} accept failed: {}", id, e);
            }
        }
    }

    info!("acceptor-{} exited", id);
}

fn set_socket_options(sock: &Socket, config: &EndpointConfig) -> io::Result<()> {
    sock.set_nonblocking(true)?;
    sock.set_nodelay(config.tcp_no_delay)?;
    if config.so_linger_on {
        sock.set_linger(true, config.so_linger_time)?;
    }
    Ok(())
}
