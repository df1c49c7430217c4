//! Process-global transfer counters.

use std::sync::Mutex;

use dctide_hash::RateCalc;

/// Global network-in/out accounting, shared by every connection.
///
/// Constructed once at startup and passed by handle; see the subsystem
/// init discipline in the core crate.
#[derive(Debug, Default)]
pub struct NetStats {
    rx: Mutex<RateCalc>,
    tx: Mutex<RateCalc>,
}

impl NetStats {
    /// Fresh counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_rx(&self, bytes: u64) {
        self.rx.lock().expect("stats lock").add(bytes);
    }

    pub(crate) fn add_tx(&self, bytes: u64) {
        self.tx.lock().expect("stats lock").add(bytes);
    }

    /// Download rate in bytes per second.
    #[must_use]
    pub fn rx_rate(&self) -> u64 {
        self.rx.lock().expect("stats lock").rate()
    }

    /// Upload rate in bytes per second.
    #[must_use]
    pub fn tx_rate(&self) -> u64 {
        self.tx.lock().expect("stats lock").rate()
    }

    /// Lifetime bytes received.
    #[must_use]
    pub fn rx_total(&self) -> u64 {
        self.rx.lock().expect("stats lock").total()
    }

    /// Lifetime bytes sent.
    #[must_use]
    pub fn tx_total(&self) -> u64 {
        self.tx.lock().expect("stats lock").total()
    }
}
