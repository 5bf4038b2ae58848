//! Simulator detection.
//!
//! Two strategies share one contract: [`ProcessDetector`] matches the OS
//! process list against per-simulator allow-lists, [`ProbeDetector`] asks each
//! protocol directly. Both prefer MSFS when both simulators appear to run.

#![deny(static_mut_refs)]

use async_trait::async_trait;
use thiserror::Error;

pub use flight_bridge_telemetry_core::SimulatorKind;

pub mod probe;
pub mod process;

pub use probe::{ProbeConfig, ProbeDetector};
pub use process::ProcessDetector;

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("Process scan failed: {0}")]
    ProcessScan(String),

    #[error("Protocol probe failed: {0}")]
    Probe(#[from] std::io::Error),
}

/// Classifies which simulator is currently running.
///
/// "Nothing found" is `Ok(SimulatorKind::None)`; errors are reserved for the
/// detector's own I/O failures.
#[async_trait]
pub trait SimulatorDetector: Send + Sync {
    async fn detect(&self) -> Result<SimulatorKind, DetectionError>;
}

/// Process-name allow-lists, matched case-insensitively as substrings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessPatterns {
    pub msfs: Vec<String>,
    pub xplane: Vec<String>,
}

impl Default for ProcessPatterns {
    fn default() -> Self {
        Self {
            msfs: vec!["FlightSimulator".to_string(), "Prepar3D".to_string()],
            xplane: vec!["X-Plane".to_string()],
        }
    }
}

impl ProcessPatterns {
    pub fn new(msfs: Vec<String>, xplane: Vec<String>) -> Self {
        Self { msfs, xplane }
    }

    /// Simulator a single process name belongs to, if any.
    pub fn match_process(&self, process_name: &str) -> SimulatorKind {
        let name = process_name.to_lowercase();
        let hit = |patterns: &[String]| {
            patterns
                .iter()
                .filter(|p| !p.is_empty())
                .any(|p| name.contains(&p.to_lowercase()))
        };
        if hit(&self.msfs) {
            SimulatorKind::Msfs
        } else if hit(&self.xplane) {
            SimulatorKind::XPlane
        } else {
            SimulatorKind::None
        }
    }
}

/// Classify a whole process list. MSFS takes precedence over X-Plane.
pub fn classify<I, S>(process_names: I, patterns: &ProcessPatterns) -> SimulatorKind
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut found = SimulatorKind::None;
    for name in process_names {
        match patterns.match_process(name.as_ref()) {
            SimulatorKind::Msfs => return SimulatorKind::Msfs,
            SimulatorKind::XPlane => found = SimulatorKind::XPlane,
            SimulatorKind::None => {}
        }
    }
    found
}
