//! # dctide-net
//!
//! The network layer of the engine:
//! - **Connections**: message-framed bidirectional byte streams over
//!   TCP (with a TLS flavor tag for sessions the collaborator wraps),
//!   raw-receive byte ranges, kernel-assisted file sends, keepalive and
//!   idle timers, per-connection and global rate accounting
//! - **Listener multiplexer**: collapses the per-hub TCP/UDP/TLS bind
//!   requests into a minimum disjoint set of sockets, merging wildcard
//!   binds over interface-specific ones and refusing TCP/TLS port
//!   conflicts

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod error;
pub mod listener;
pub mod stats;

pub use connection::{ConnConfig, ConnEvent, Connection};
pub use error::NetError;
pub use listener::{
    Bind, BindRequest, BindType, ListenerEvent, ListenerSet, RandomPorts, UdpFlavor,
};
pub use stats::NetStats;
