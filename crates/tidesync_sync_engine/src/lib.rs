//! # TideSync Sync Engine
//!
//! Connectivity tracking and change dispatch for TideSync.
//!
//! This crate provides:
//! - A two-state connectivity monitor fed by platform signals
//! - The dispatch coordinator: durable local writes, merged dispatch on a
//!   single worker task, watermark acknowledgment
//! - Reconnect sweeps that re-offer every pending entity exactly once
//! - Reconciliation of a table with an authoritative remote snapshot
//! - A per-table remote capability router
//!
//! ## Delivery guarantees
//!
//! - Every accepted write is durable before `write` returns
//! - An entity's pending entries are offered as one merged action
//! - Entries stay pending until acknowledged, across restarts too
//! - Acknowledgment is idempotent; redelivery is possible

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connectivity;
mod dispatch;
mod engine;
mod error;
mod remote;

pub use config::SyncConfig;
pub use connectivity::{ConnectivityMonitor, NetworkProbe, NetworkStatus, StaticProbe};
pub use dispatch::{Acknowledger, DispatchHandler, DispatchRequest, StateListener};
pub use engine::SyncEngine;
pub use error::{RemoteError, SyncError, SyncResult};
pub use remote::{MemoryRemote, RemoteCall, RemoteRouter, RemoteTable};
