//! Detection-driven adapter switching.
//!
//! Every poll the detected [`SimulatorKind`] is compared with the kind of the
//! active adapter. A change stops the active adapter completely before the
//! replacement is started, so at most one adapter is ever live. Detector
//! failures leave the active adapter alone and are retried next poll.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use flight_bridge_process_detection::{DetectionError, SimulatorDetector};
use flight_bridge_telemetry_core::{SimulatorAdapter, SimulatorKind, SimulatorState};

/// Outcome of applying one detection result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Same kind as before, or the detector failed.
    Unchanged,
    /// The active adapter was stopped and nothing replaced it.
    Stopped { from: SimulatorKind },
    /// An adapter was started from idle.
    Started { kind: SimulatorKind },
    /// The active adapter was stopped and another one started.
    Switched {
        from: SimulatorKind,
        to: SimulatorKind,
    },
    /// The adapter for `kind` could not be started; retried next poll.
    StartFailed { kind: SimulatorKind },
}

struct Active {
    kind: SimulatorKind,
    adapter: Arc<dyn SimulatorAdapter>,
}

pub struct ConnectionManager {
    simulator: Arc<SimulatorState>,
    adapters: Vec<Arc<dyn SimulatorAdapter>>,
    active: Mutex<Option<Active>>,
}

impl ConnectionManager {
    /// `adapters` holds at most one adapter per simulator kind; the first
    /// registered for a kind wins.
    pub fn new(simulator: Arc<SimulatorState>, adapters: Vec<Arc<dyn SimulatorAdapter>>) -> Self {
        Self {
            simulator,
            adapters,
            active: Mutex::new(None),
        }
    }

    /// Kind of the adapter currently started, `None` when idle.
    pub async fn active_kind(&self) -> SimulatorKind {
        self.active
            .lock()
            .await
            .as_ref()
            .map_or(SimulatorKind::None, |active| active.kind)
    }

    fn adapter_for(&self, kind: SimulatorKind) -> Option<Arc<dyn SimulatorAdapter>> {
        self.adapters
            .iter()
            .find(|adapter| adapter.kind() == kind)
            .map(Arc::clone)
    }

    /// Apply one detection result.
    pub async fn apply(&self, detected: Result<SimulatorKind, DetectionError>) -> Transition {
        let kind = match detected {
            Ok(kind) => kind,
            Err(e) => {
                warn!(error = %e, "Simulator detection failed; keeping current adapter");
                return Transition::Unchanged;
            }
        };

        let mut active = self.active.lock().await;
        let current = active.as_ref().map_or(SimulatorKind::None, |a| a.kind);
        if kind == current {
            debug!(simulator = %kind, "Detected simulator unchanged");
            return Transition::Unchanged;
        }

        info!(from = %current, to = %kind, "Detected simulator changed");
        // The target moves first so a stopping adapter sees it is no longer wanted.
        self.simulator.set_target(kind);

        if let Some(previous) = active.take() {
            stop_adapter(&previous).await;
        }

        if kind.is_none() {
            return Transition::Stopped { from: current };
        }

        let Some(adapter) = self.adapter_for(kind) else {
            error!(simulator = %kind, "No adapter registered for simulator");
            return Transition::StartFailed { kind };
        };

        if let Err(e) = adapter.start().await {
            error!(simulator = %kind, error = %e, "Failed to start adapter");
            return Transition::StartFailed { kind };
        }
        info!(simulator = %kind, "Adapter started");
        *active = Some(Active { kind, adapter });

        if current.is_none() {
            Transition::Started { kind }
        } else {
            Transition::Switched {
                from: current,
                to: kind,
            }
        }
    }

    /// Poll `detector` every `poll_interval` until `shutdown` fires, then stop
    /// the active adapter.
    pub async fn run(
        &self,
        detector: &dyn SimulatorDetector,
        poll_interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut poll = tokio::time::interval(poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            poll_interval_ms = u64::try_from(poll_interval.as_millis()).unwrap_or(u64::MAX),
            "Connection manager started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = poll.tick() => {}
            }

            let detected = tokio::select! {
                _ = shutdown.recv() => break,
                detected = detector.detect() => detected,
            };
            let transition = self.apply(detected).await;
            if transition != Transition::Unchanged {
                debug!(?transition, "Applied detection result");
            }
        }

        self.shutdown().await;
    }

    /// Stop the active adapter, if any, and clear the target simulator.
    pub async fn shutdown(&self) {
        let mut active = self.active.lock().await;
        self.simulator.set_target(SimulatorKind::None);
        if let Some(previous) = active.take() {
            stop_adapter(&previous).await;
        }
        info!("Connection manager stopped");
    }
}

async fn stop_adapter(active: &Active) {
    info!(simulator = %active.kind, "Stopping adapter");
    if let Err(e) = active.adapter.stop().await {
        warn!(simulator = %active.kind, error = %e, "Adapter stop returned an error");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
