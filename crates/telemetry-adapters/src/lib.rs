//! Simulator-specific telemetry adapters.
//!
//! Each adapter owns one background session task. `start` spawns it and
//! `stop` signals it and awaits its completion, so nothing the session owned
//! (socket, vendor handle, interval) outlives the call.

#![deny(static_mut_refs)]

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub use flight_bridge_telemetry_core::{
    AdapterState, AdapterStateCell, BroadcastHub, SimulatorAdapter, SimulatorKind, SimulatorState,
    SnapshotStore, TelemetryError, TelemetrySnapshot,
};

pub mod simconnect;
pub mod watchdog;
pub mod xplane;

pub use simconnect::{SimConnectAdapter, SimConnectConfig};
pub use watchdog::StalenessWatchdog;
pub use xplane::{XPlaneAdapter, XPlaneConfig};

/// Shared collaborators handed to every adapter.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub store: Arc<SnapshotStore>,
    pub hub: Arc<BroadcastHub>,
    pub simulator: Arc<SimulatorState>,
}

impl AdapterContext {
    pub fn new(
        store: Arc<SnapshotStore>,
        hub: Arc<BroadcastHub>,
        simulator: Arc<SimulatorState>,
    ) -> Self {
        Self {
            store,
            hub,
            simulator,
        }
    }

    /// Merge a partial update into the store, confirm the simulator and push
    /// the merged snapshot to subscribers.
    pub fn publish_merge(&self, kind: SimulatorKind, update: &TelemetrySnapshot) {
        let snapshot = self.store.merge(update);
        self.simulator.confirm(kind);
        self.push(&snapshot);
    }

    /// Replace the store wholesale, confirm the simulator and push.
    pub fn publish_replace(&self, kind: SimulatorKind, snapshot: TelemetrySnapshot) {
        let snapshot = self.store.replace(snapshot);
        self.simulator.confirm(kind);
        self.push(&snapshot);
    }

    fn push(&self, snapshot: &TelemetrySnapshot) {
        match self.hub.publish(snapshot) {
            Ok(report) => debug!(
                delivered = report.delivered,
                dropped = report.dropped,
                removed = report.removed,
                "Snapshot published"
            ),
            Err(e) => warn!(error = %e, "Failed to publish snapshot"),
        }
    }
}

/// Handle to a running session task.
#[derive(Debug)]
pub(crate) struct SessionHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub(crate) fn spawn<F, Fut>(session: F) -> Self
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(session(shutdown_rx));
        Self { shutdown, task }
    }

    /// Signal the session and wait until it has fully unwound.
    pub(crate) async fn shutdown(self) {
        // The task may already have exited on its own; that is fine.
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            error!(error = %e, "Adapter session task failed");
        }
    }
}
