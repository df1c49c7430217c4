//! Error types for the network layer.

use thiserror::Error;

/// Errors raised by connections and listeners.
///
/// Transport errors are scoped to one connection: the owner receives
/// exactly one via the event channel and is expected to disconnect.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetError {
    /// Connection attempt failed
    #[error("connect: {0}")]
    Connect(String),

    /// Read failed, remote closed, framing overflowed, or the idle
    /// timeout fired
    #[error("receive: {0}")]
    Receive(String),

    /// Write failed
    #[error("send: {0}")]
    Send(String),

    /// Two hubs requested a TCP and a TLS listener on the same port
    #[error("listener conflict on port {port}: TCP and TLS cannot share a socket")]
    BindConflict {
        /// The contested port
        port: u16,
    },

    /// Socket setup failed; all listeners were aborted
    #[error("listener setup failed: {0}")]
    BindFailed(String),
}
