//! Reports from client-client peer sessions.
//!
//! The session layer itself is a collaborator: it owns the wire
//! exchange with the peer and is driven through the [`PeerSession`]
//! trait. Everything it needs to tell the orchestrator travels here as
//! a [`CcEvent`], which [`Orchestrator::on_cc_event`] dispatches into
//! the queue (`user_cc`, `set_tthl`, `recv_data`).
//!
//! [`PeerSession`]: crate::session::PeerSession
//! [`Orchestrator::on_cc_event`]: crate::orchestrator::Orchestrator::on_cc_event

use dctide_hash::Tth;

use crate::user::Uid;

/// Reports from a session to the orchestrator.
#[derive(Debug)]
pub enum CcEvent {
    /// Handshake complete; the user has an idle session
    Established(Uid),
    /// Session is gone (error, close, or ordered disconnect)
    Gone(Uid),
    /// A full TTHL arrived for a download
    Tthl {
        /// The session's user
        uid: Uid,
        /// The download it belongs to
        tth: Tth,
        /// Serialized leaves
        blob: Vec<u8>,
    },
    /// A chunk of file data arrived
    Data {
        /// The session's user
        uid: Uid,
        /// Raw bytes at the current offset
        bytes: Vec<u8>,
    },
    /// The requested range completed
    DataEnd(Uid),
    /// Peer says the requested file is not there
    NotAvailable {
        /// The session's user
        uid: Uid,
        /// The download that failed
        tth: Option<Tth>,
    },
}
