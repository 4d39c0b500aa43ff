//! Connectivity monitor.
//!
//! The monitor holds a two-state network status. It never polls: platform
//! adapters report changes through [`ConnectivityMonitor::set`], and the
//! initial value comes from a [`NetworkProbe`]. Every change is published on
//! a `tokio::sync::watch` channel.

use std::fmt;
use tokio::sync::watch;

/// Network status as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkStatus {
    /// The remote is assumed reachable; dispatch is allowed.
    Online,
    /// No dispatch happens.
    Offline,
}

impl NetworkStatus {
    /// Returns true for `Online`.
    pub fn is_online(self) -> bool {
        self == NetworkStatus::Online
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            NetworkStatus::Online => "online",
            NetworkStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reads the platform's network status at startup.
pub trait NetworkProbe: Send + Sync {
    /// Returns the current status.
    fn current(&self) -> NetworkStatus;
}

impl<F> NetworkProbe for F
where
    F: Fn() -> NetworkStatus + Send + Sync,
{
    fn current(&self) -> NetworkStatus {
        self()
    }
}

/// A probe that always reports the same status.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub NetworkStatus);

impl NetworkProbe for StaticProbe {
    fn current(&self) -> NetworkStatus {
        self.0
    }
}

/// Tracks the network status and publishes changes.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    status: watch::Sender<NetworkStatus>,
}

impl ConnectivityMonitor {
    /// Creates a monitor starting at `initial`.
    pub fn new(initial: NetworkStatus) -> Self {
        let (status, _) = watch::channel(initial);
        Self { status }
    }

    /// Returns the current status.
    pub fn status(&self) -> NetworkStatus {
        *self.status.borrow()
    }

    /// Returns true if dispatch is currently allowed.
    pub fn is_online(&self) -> bool {
        self.status().is_online()
    }

    /// Subscribes to status changes.
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.status.subscribe()
    }

    /// Moves to `status`. Returns true if this was a transition; asserting
    /// the current status again is not one.
    pub fn set(&self, status: NetworkStatus) -> bool {
        self.set_with(status, |_| {})
    }

    /// Like [`set`](Self::set), but runs `on_transition` after the status
    /// changes and before subscribers are woken.
    ///
    /// Readers of the status wait until `on_transition` returns, so it must
    /// not block on them.
    pub fn set_with(
        &self,
        status: NetworkStatus,
        on_transition: impl FnOnce(NetworkStatus),
    ) -> bool {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            on_transition(status);
            true
        })
    }
}
