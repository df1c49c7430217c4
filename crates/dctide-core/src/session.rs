//! Seams toward the hub layer and the peer-session layer.
//!
//! The orchestrator drives both through these traits: hubs open peer
//! sessions on request and know which users are online; an established
//! session accepts download assignments and disconnect orders, and
//! reports back through the queue (`user_cc`, `set_tthl`, `recv_data`).

use dctide_hash::Tth;

/// One download assignment handed to a peer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    /// Identity of the download
    pub tth: Tth,
    /// Fetch the peer's file list instead of a file
    pub is_list: bool,
    /// Resume offset
    pub offset: u64,
    /// Total expected size (zero for lists until known)
    pub size: u64,
    /// Fetch the TTHL before any file data
    pub need_tthl: bool,
}

/// What the orchestrator needs from the hub layer.
pub trait HubApi: Send {
    /// True when some hub currently sees this user.
    fn user_online(&self, uid: crate::user::Uid) -> bool;

    /// Ask a hub to open a client-client connection to the user.
    fn request_connect(&mut self, uid: crate::user::Uid);

    /// All listeners went down; hubs must advertise passive mode.
    fn notify_passive(&mut self, reason: &str);
}

/// What the orchestrator needs from an established peer session.
pub trait PeerSession: Send {
    /// Start transferring; the session reports data through the queue.
    fn download(&mut self, task: DownloadTask);

    /// Tear the session down. `force` skips the polite close and is
    /// required when an active entry is being dropped.
    fn disconnect(&mut self, force: bool);
}
