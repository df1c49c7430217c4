//! # dctide-core
//!
//! The engine core of a Direct Connect client: download orchestration
//! with per-user queues and TTH-verified block receipt, peer-session
//! plumbing, the key/value configuration surface, and the on-disk data
//! directory.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    Engine (assembly)                     │
//! │   data dir lock · store · config · ports · orchestrator  │
//! ├──────────────────────────────────────────────────────────┤
//! │                 Orchestrator (scheduling)                │
//! │   debounced slot selection · reconnect timers · events   │
//! ├──────────────────────────────────────────────────────────┤
//! │                  DlQueue (bookkeeping)                   │
//! │   records · per-user queues · verified receipt · resume  │
//! ├──────────────────────────────────────────────────────────┤
//! │         peer-session / hub seams (traits + events)       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The terminal UI, hub protocol parsers, TLS plumbing and the share
//! hasher are collaborators above and beside this crate; they talk to
//! it through [`Engine`], [`Orchestrator`], the [`session`] traits and
//! the queue-event channel.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cc;
pub mod config;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod queue;
pub mod session;
pub mod spool;
pub mod user;

pub use cc::CcEvent;
pub use config::{parse_bool, TlsPolicy, Vars};
pub use engine::Engine;
pub use error::CoreError;
pub use orchestrator::{Orchestrator, SCHEDULE_DEBOUNCE};
pub use queue::{
    DlErrorKind, DlQueue, DlRecord, MatchResult, Priority, QueueConfig, QueueEvent,
    ReceiveContext, ReceiveOutcome, UserState, RECONNECT_DELAY,
};
pub use session::{DownloadTask, HubApi, PeerSession};
pub use spool::SpoolDir;
pub use user::Uid;
