use crate::conn::Connection;

/// What the protocol layer wants done with the socket after a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Keep-alive: re-arm read interest and wait for the next request.
    Open,
    /// Retire the socket.
    Closed,
    /// Park for asynchronous continuation; the socket leaves the
    /// readiness queue until resumed or timed out.
    Long,
    /// The asynchronous cycle finished; redispatch immediately.
    AsyncEnd,
}

/// Why an event dispatch fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    Open,
    Stop,
    Timeout,
    Disconnect,
    Error,
}

/// The protocol layer consumed by the endpoint. Implementations parse
/// and answer requests on the sockets they are handed; the endpoint
/// owns registration, timeouts, and retirement.
pub trait Handler: Send + Sync {
    /// Read-readiness dispatch.
    fn process(&self, conn: &Connection) -> SocketState;

    /// Comet/event dispatch.
    fn event(&self, conn: &Connection, status: SocketStatus) -> SocketState;

    /// Asynchronous resumption (explicit resume or async timeout).
    fn async_dispatch(&self, conn: &Connection, status: SocketStatus) -> SocketState;

    /// Socket retirement; release any per-connection protocol state.
    fn release(&self, conn: &Connection);
}
