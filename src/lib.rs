//! A connection-multiplexing TCP endpoint: a long-lived server front
//! end that accepts connections, parks tens of thousands of idle
//! keep-alive sockets across a small number of epoll queues, and
//! dispatches readiness to a worker pool running your protocol
//! [`Handler`]. Kernel `sendfile(2)` transmission and a long-poll /
//! asynchronous-continuation mode are built in; TLS is terminated
//! through a pluggable engine interface.
//!
//! # Example
//!
//! ```no_run
//! use hive_io::{Connection, Endpoint, EndpointConfig, Handler, SocketState, SocketStatus};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn process(&self, conn: &Connection) -> SocketState {
//!         let mut buf = [0u8; 1024];
//!         match conn.read(&mut buf) {
//!             Ok(0) => SocketState::Closed,
//!             Ok(n) => {
//!                 let _ = conn.write(&buf[..n]);
//!                 SocketState::Open
//!             }
//!             Err(_) => SocketState::Closed,
//!         }
//!     }
//!
//!     fn event(&self, _conn: &Connection, _status: SocketStatus) -> SocketState {
//!         SocketState::Closed
//!     }
//!
//!     fn async_dispatch(&self, _conn: &Connection, _status: SocketStatus) -> SocketState {
//!         SocketState::Closed
//!     }
//!
//!     fn release(&self, _conn: &Connection) {}
//! }
//!
//! let mut config = EndpointConfig::default();
//! config.port = 8080;
//!
//! let endpoint = Endpoint::new(config, Echo);
//! endpoint.start().unwrap();
//! std::thread::park();
//! ```

#[macro_use]
mod sys;

mod acceptor;
mod buffer;
mod config;
mod conn;
mod endpoint;
mod executor;
mod handler;
mod latch;
mod pool;
mod poller;
mod queue;
mod ready;
mod sendfile;
mod tls;
mod token;

pub use config::{effective_poller_size, EndpointConfig, TlsConfig, VerifyMode};
pub use conn::Connection;
pub use endpoint::Endpoint;
pub use handler::{Handler, SocketState, SocketStatus};
pub use ready::Ready;
pub use sendfile::SendfileJob;
pub use sys::Socket;
pub use tls::{Handshake, TlsEngine, TlsIo, TlsProvider, TlsStatus};
pub use token::Token;
