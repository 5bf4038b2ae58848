//! Daemon wiring: shared state, adapters, detection loop and subscriber listener.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use flight_bridge_process_detection::{ProbeDetector, ProcessDetector, SimulatorDetector};
use flight_bridge_telemetry_adapters::simconnect::{SimConnectBinding, UnavailableBinding};
use flight_bridge_telemetry_adapters::{
    AdapterContext, BroadcastHub, SimConnectAdapter, SimulatorAdapter, SimulatorKind,
    SimulatorState, SnapshotStore, XPlaneAdapter,
};

use crate::config::{BridgeConfig, DetectionMode};
use crate::connection_manager::ConnectionManager;
use crate::ws_server::{self, SubscriberState};

/// Build the detector selected by `config.detection.mode`.
pub fn build_detector(
    config: &BridgeConfig,
    binding: Arc<dyn SimConnectBinding>,
) -> Arc<dyn SimulatorDetector> {
    match config.detection.mode {
        DetectionMode::Process => Arc::new(ProcessDetector::new(config.process_patterns())),
        DetectionMode::Probe => Arc::new(ProbeDetector::new(binding, config.probe_config())),
    }
}

/// Run a single detection pass. Detector failures are reported as errors.
pub async fn detect_once(config: &BridgeConfig) -> Result<SimulatorKind> {
    let detector = build_detector(config, Arc::new(UnavailableBinding));
    detector
        .detect()
        .await
        .context("Simulator detection failed")
}

/// The bridge daemon. Construct with [`BridgeDaemon::bind`], then [`BridgeDaemon::run`].
pub struct BridgeDaemon {
    config: BridgeConfig,
    listener: TcpListener,
    binding: Arc<dyn SimConnectBinding>,
    detector: Option<Arc<dyn SimulatorDetector>>,
    store: Arc<SnapshotStore>,
    hub: Arc<BroadcastHub>,
    simulator: Arc<SimulatorState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl BridgeDaemon {
    /// Validate `config` and bind the subscriber listener.
    pub async fn bind(config: BridgeConfig) -> Result<Self> {
        config.validate().context("Invalid bridge configuration")?;
        let listener = ws_server::bind(config.broadcast.listen_address).await?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            hub: Arc::new(BroadcastHub::new(config.broadcast.subscriber_buffer)),
            store: Arc::new(SnapshotStore::new()),
            simulator: Arc::new(SimulatorState::new()),
            binding: Arc::new(UnavailableBinding),
            detector: None,
            listener,
            shutdown_tx,
            config,
        })
    }

    /// Use a concrete SimConnect binding instead of the unavailable default.
    pub fn with_binding(mut self, binding: Arc<dyn SimConnectBinding>) -> Self {
        self.binding = binding;
        self
    }

    /// Whether MSFS/FSX telemetry can be received at all.
    pub fn simconnect_available(&self) -> bool {
        self.binding.is_available()
    }

    /// Override the detector chosen from configuration.
    pub fn with_detector(mut self, detector: Arc<dyn SimulatorDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Subscriber listener has no local address")
    }

    /// Sender that stops the daemon when anything is sent on it.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn store(&self) -> Arc<SnapshotStore> {
        Arc::clone(&self.store)
    }

    pub fn simulator(&self) -> Arc<SimulatorState> {
        Arc::clone(&self.simulator)
    }

    /// Run until the shutdown handle fires. The active adapter is fully
    /// stopped and the listener closed before this returns.
    pub async fn run(self) -> Result<()> {
        let Self {
            config,
            listener,
            binding,
            detector,
            store,
            hub,
            simulator,
            shutdown_tx,
        } = self;

        info!(
            address = %listener.local_addr().context("Subscriber listener has no local address")?,
            mode = ?config.detection.mode,
            "Starting flight bridge"
        );
        if !binding.is_available() {
            info!("No SimConnect binding configured; MSFS/FSX telemetry is disabled");
        }

        let ctx = AdapterContext::new(Arc::clone(&store), Arc::clone(&hub), Arc::clone(&simulator));
        let adapters: Vec<Arc<dyn SimulatorAdapter>> = vec![
            Arc::new(SimConnectAdapter::new(
                Arc::clone(&binding),
                config.simconnect_config(),
                ctx.clone(),
            )),
            Arc::new(XPlaneAdapter::new(config.xplane_config(), ctx)),
        ];
        let manager = ConnectionManager::new(Arc::clone(&simulator), adapters);
        let detector = detector.unwrap_or_else(|| build_detector(&config, binding));

        let server = tokio::spawn(ws_server::serve(
            listener,
            SubscriberState::new(Arc::clone(&hub), Arc::clone(&store), shutdown_tx.clone()),
            shutdown_tx.subscribe(),
        ));
        let heartbeat = config.heartbeat_interval().map(|period| {
            tokio::spawn(ws_server::run_heartbeat(
                Arc::clone(&hub),
                Arc::clone(&store),
                period,
                shutdown_tx.subscribe(),
            ))
        });

        manager
            .run(detector.as_ref(), config.poll_interval(), shutdown_tx.subscribe())
            .await;

        // The manager may have stopped on its own; make sure everything else follows.
        let _ = shutdown_tx.send(());
        if let Some(heartbeat) = heartbeat {
            if let Err(e) = heartbeat.await {
                warn!(error = %e, "Heartbeat task failed");
            }
        }
        match server.await {
            Ok(result) => result?,
            Err(e) => error!(error = %e, "Subscriber listener task failed"),
        }

        info!("Flight bridge stopped");
        Ok(())
    }
}

/// Resolve once the process is asked to terminate (Ctrl-C, or SIGTERM on Unix).
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    result = tokio::signal::ctrl_c() => log_ctrl_c(result),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler");
                log_ctrl_c(tokio::signal::ctrl_c().await);
            }
        }
    }

    #[cfg(not(unix))]
    log_ctrl_c(tokio::signal::ctrl_c().await);
}

fn log_ctrl_c(result: std::io::Result<()>) {
    match result {
        Ok(()) => info!("Received Ctrl+C"),
        Err(e) => error!(error = %e, "Error waiting for Ctrl+C"),
    }
}
