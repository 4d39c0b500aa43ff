//! Configuration for the sync engine.

use crate::connectivity::NetworkStatus;

/// Configuration for a [`SyncEngine`](crate::SyncEngine).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Sweep the pending log once at start when online, so entries left by a
    /// previous session are re-offered without waiting for a reconnect.
    pub sweep_on_start: bool,
    /// Overrides the network probe's initial status.
    pub initial_status: Option<NetworkStatus>,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to sweep at start.
    #[must_use]
    pub const fn with_sweep_on_start(mut self, sweep: bool) -> Self {
        self.sweep_on_start = sweep;
        self
    }

    /// Forces the initial network status.
    #[must_use]
    pub const fn with_initial_status(mut self, status: NetworkStatus) -> Self {
        self.initial_status = Some(status);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sweep_on_start: true,
            initial_status: None,
        }
    }
}
