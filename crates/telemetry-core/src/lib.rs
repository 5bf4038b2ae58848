//! Core telemetry types, the adapter trait, the snapshot store and the broadcast hub.
//!
//! ## Modules
//! - `snapshot` - Normalized flight telemetry (`TelemetrySnapshot`) and its single-writer store
//! - `hub` - Subscriber registry and snapshot fan-out (`BroadcastHub`)
//! - `state` - Simulator classification and per-adapter lifecycle state

#![deny(static_mut_refs)]

use async_trait::async_trait;
use thiserror::Error;

pub mod hub;
pub mod snapshot;
pub mod state;

pub use hub::{BroadcastHub, HubError, PublishReport, SubscriberId, SubscriberReceiver};
pub use snapshot::{SnapshotField, SnapshotStore, TelemetrySnapshot};
pub use state::{AdapterState, AdapterStateCell, SimulatorKind, SimulatorState};

/// Lifecycle contract shared by every simulator adapter.
///
/// Adapters never decide on their own whether they should be running; the
/// connection manager calls `start`/`stop` and guarantees that at most one
/// adapter is past `start` at any time.
#[async_trait]
pub trait SimulatorAdapter: Send + Sync {
    /// Simulator family this adapter talks to.
    fn kind(&self) -> SimulatorKind;

    /// Current lifecycle state.
    fn state(&self) -> AdapterState;

    /// Begin connecting. Returns once the background session is spawned.
    async fn start(&self) -> Result<(), TelemetryError>;

    /// Stop the session. When this returns every socket, handle and timer
    /// owned by the session has been released.
    async fn stop(&self) -> Result<(), TelemetryError>;
}

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to connect to telemetry source: {0}")]
    ConnectionFailed(String),

    #[error("Failed to bind UDP port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Simulator binding error: {0}")]
    Binding(String),

    #[error("Telemetry timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Adapter already running")]
    AlreadyRunning,

    #[error("Adapter not running")]
    NotRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TelemetryError {
    /// Whether this is a local bind failure caused by the port being taken or
    /// refused, which callers recover from by moving to another port.
    pub fn is_port_conflict(&self) -> bool {
        match self {
            TelemetryError::Bind { source, .. } | TelemetryError::Io(source) => matches!(
                source.kind(),
                std::io::ErrorKind::AddrInUse | std::io::ErrorKind::PermissionDenied
            ),
            _ => false,
        }
    }
}
