//! Simulator classification and adapter lifecycle state.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

/// Which simulator family is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SimulatorKind {
    #[default]
    None,
    /// MSFS / Prepar3D, reached through the SimConnect binding.
    Msfs,
    /// X-Plane, reached through the RREF UDP protocol.
    XPlane,
}

impl SimulatorKind {
    pub fn is_none(&self) -> bool {
        matches!(self, SimulatorKind::None)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SimulatorKind::None => "None",
            SimulatorKind::Msfs => "MSFS",
            SimulatorKind::XPlane => "X-Plane",
        }
    }
}

impl fmt::Display for SimulatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AdapterState {
    #[default]
    Idle,
    Connecting,
    Active,
    Stopping,
}

impl AdapterState {
    /// Connecting or Active. The connection manager keeps at most one adapter
    /// in this set.
    pub fn is_live(&self) -> bool {
        matches!(self, AdapterState::Connecting | AdapterState::Active)
    }

    fn to_u8(self) -> u8 {
        match self {
            AdapterState::Idle => 0,
            AdapterState::Connecting => 1,
            AdapterState::Active => 2,
            AdapterState::Stopping => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => AdapterState::Connecting,
            2 => AdapterState::Active,
            3 => AdapterState::Stopping,
            _ => AdapterState::Idle,
        }
    }
}

/// Lock-free holder for an adapter's state, shared between the adapter handle
/// and its session task.
#[derive(Debug, Default)]
pub struct AdapterStateCell(AtomicU8);

impl AdapterStateCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> AdapterState {
        AdapterState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: AdapterState) {
        self.0.store(state.to_u8(), Ordering::Release);
    }

    /// Move Connecting -> Active. Any other current state is left alone so a
    /// late sample cannot revive a stopping adapter.
    pub fn mark_active(&self) -> bool {
        self.transition(AdapterState::Connecting, AdapterState::Active)
    }

    /// Set `to` only if the current state is `from`.
    pub fn transition(&self, from: AdapterState, to: AdapterState) -> bool {
        self.0
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Process-wide simulator bookkeeping.
///
/// `target` is owned by the connection manager: it is the kind the manager
/// currently wants running. `confirmed` is written by adapters whenever they
/// decode a sample, independently of detection.
#[derive(Debug)]
pub struct SimulatorState {
    target: watch::Sender<SimulatorKind>,
    confirmed: RwLock<SimulatorKind>,
}

impl Default for SimulatorState {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatorState {
    pub fn new() -> Self {
        let (target, _) = watch::channel(SimulatorKind::None);
        Self {
            target,
            confirmed: RwLock::new(SimulatorKind::None),
        }
    }

    pub fn target(&self) -> SimulatorKind {
        *self.target.borrow()
    }

    pub fn set_target(&self, kind: SimulatorKind) {
        let previous = self.target.send_replace(kind);
        if previous != kind {
            info!(from = %previous, to = %kind, "Target simulator changed");
        }
    }

    /// Watch the target kind; used by adapters to gate startup and to decide
    /// whether a dropped connection should be re-established.
    pub fn subscribe_target(&self) -> watch::Receiver<SimulatorKind> {
        self.target.subscribe()
    }

    pub fn confirmed(&self) -> SimulatorKind {
        *self.confirmed.read()
    }

    pub fn confirm(&self, kind: SimulatorKind) {
        let mut confirmed = self.confirmed.write();
        if *confirmed != kind {
            info!(simulator = %kind, "Current simulator set");
            *confirmed = kind;
        }
    }
}
