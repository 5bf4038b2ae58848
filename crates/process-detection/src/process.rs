//! Process-list detection backed by `sysinfo`.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sysinfo::{ProcessesToUpdate, System};
use tracing::debug;

use crate::{DetectionError, ProcessPatterns, SimulatorDetector, SimulatorKind, classify};

/// Scans running processes for known simulator executables.
///
/// The `System` handle is kept between polls so refreshes stay incremental.
/// Scans run on the blocking pool.
pub struct ProcessDetector {
    patterns: ProcessPatterns,
    system: Arc<Mutex<System>>,
}

impl ProcessDetector {
    pub fn new(patterns: ProcessPatterns) -> Self {
        Self {
            patterns,
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    pub fn patterns(&self) -> &ProcessPatterns {
        &self.patterns
    }
}

impl Default for ProcessDetector {
    fn default() -> Self {
        Self::new(ProcessPatterns::default())
    }
}

#[async_trait]
impl SimulatorDetector for ProcessDetector {
    async fn detect(&self) -> Result<SimulatorKind, DetectionError> {
        let system = Arc::clone(&self.system);
        let patterns = self.patterns.clone();
        let kind = tokio::task::spawn_blocking(move || {
            let mut system = system.lock();
            system.refresh_processes(ProcessesToUpdate::All, true);
            let names = system
                .processes()
                .values()
                .map(|p| p.name().to_string_lossy().into_owned());
            classify(names, &patterns)
        })
        .await
        .map_err(|e| DetectionError::ProcessScan(e.to_string()))?;

        debug!(simulator = %kind, "Process scan complete");
        Ok(kind)
    }
}
