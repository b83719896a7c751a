use std::io;

use crate::config::TlsConfig;
use crate::ready::Ready;
use crate::sys::Socket;

/// Handshake progress report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Done,
    /// More socket readiness is needed; the mask names which.
    Want(Ready),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsStatus {
    Ok,
    NeedRead,
    NeedWrite,
    Closed,
}

/// Outcome of a `wrap`/`unwrap` call.
#[derive(Debug, Clone, Copy)]
pub struct TlsIo {
    pub consumed: usize,
    pub produced: usize,
    pub status: TlsStatus,
}

/// Per-connection TLS record engine. The endpoint drives the handshake
/// from worker threads and routes application bytes through
/// `wrap`/`unwrap`; the cryptography itself lives behind this trait.
/// Engines own their internal network buffers.
pub trait TlsEngine: Send {
    /// Advances the handshake. `readable`/`writable` describe the
    /// readiness that triggered this call. An `Err` is terminal: the
    /// endpoint closes the connection without retry.
    fn handshake(&mut self, sock: &Socket, readable: bool, writable: bool)
        -> io::Result<Handshake>;

    /// Encrypts `src`, appending records to `dst`.
    fn wrap(&mut self, src: &[u8], dst: &mut Vec<u8>) -> io::Result<TlsIo>;

    /// Decrypts records from `src`, appending plaintext to `dst`.
    fn unwrap(&mut self, src: &[u8], dst: &mut Vec<u8>) -> io::Result<TlsIo>;
}

/// Engine factory. `init` is called once with the endpoint's TLS
/// material when the endpoint is initialized; the provider is immutable
/// afterwards.
pub trait TlsProvider: Send + Sync {
    fn init(&self, _config: &TlsConfig) -> io::Result<()> {
        Ok(())
    }

    fn engine(&self) -> io::Result<Box<dyn TlsEngine>>;
}
