//! Bridge configuration with JSON persistence and validation.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use flight_bridge_process_detection::{ProbeConfig, ProcessPatterns};
use flight_bridge_telemetry_adapters::simconnect::{self, Protocol};
use flight_bridge_telemetry_adapters::xplane;
use flight_bridge_telemetry_adapters::{SimConnectConfig, XPlaneConfig};

pub const SCHEMA_VERSION: &str = "flight-bridge.config/1";
const SCHEMA_PREFIX: &str = "flight-bridge.config/";
pub const DEFAULT_LISTEN_ADDRESS: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 49153);
const MAX_FREQUENCY_HZ: u32 = 1000;

/// Complete bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Configuration schema version
    pub schema_version: String,
    pub detection: DetectionConfig,
    pub xplane: XPlaneSection,
    pub simconnect: SimConnectSection,
    pub broadcast: BroadcastConfig,
    pub logging: LoggingConfig,
}

/// How the running simulator is identified
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    /// Match the OS process list against the allow-lists
    #[default]
    Process,
    /// Handshake with each simulator protocol
    Probe,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectionConfig {
    pub mode: DetectionMode,
    pub poll_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub xplane_processes: Vec<String>,
    pub msfs_processes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct XPlaneSection {
    pub host: IpAddr,
    pub receive_ports: Vec<u16>,
    pub target_ports: Vec<u16>,
    pub frequency_hz: u32,
    pub stale_timeout_ms: u64,
    pub resend_requests: bool,
}

/// SimConnect protocol revision requested when opening a session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolVersion {
    #[default]
    FsxSp2,
    KittyHawk,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimConnectSection {
    pub app_name: String,
    pub protocol: ProtocolVersion,
    pub reconnect_delay_ms: u64,
    pub stall_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BroadcastConfig {
    pub listen_address: SocketAddr,
    /// Republish the current snapshot on this cadence; absent disables it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_ms: Option<u64>,
    pub subscriber_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            detection: DetectionConfig::default(),
            xplane: XPlaneSection::default(),
            simconnect: SimConnectSection::default(),
            broadcast: BroadcastConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        let patterns = ProcessPatterns::default();
        Self {
            mode: DetectionMode::default(),
            poll_interval_ms: 2000,
            probe_timeout_ms: 5000,
            xplane_processes: patterns.xplane,
            msfs_processes: patterns.msfs,
        }
    }
}

impl Default for XPlaneSection {
    fn default() -> Self {
        Self {
            host: xplane::DEFAULT_HOST,
            receive_ports: xplane::DEFAULT_RECEIVE_PORTS.to_vec(),
            target_ports: xplane::DEFAULT_TARGET_PORTS.to_vec(),
            frequency_hz: xplane::DEFAULT_FREQUENCY_HZ,
            stale_timeout_ms: duration_ms(xplane::DEFAULT_STALE_TIMEOUT),
            resend_requests: true,
        }
    }
}

impl Default for SimConnectSection {
    fn default() -> Self {
        Self {
            app_name: simconnect::DEFAULT_APP_NAME.to_string(),
            protocol: ProtocolVersion::default(),
            reconnect_delay_ms: duration_ms(simconnect::DEFAULT_RECONNECT_DELAY),
            stall_timeout_ms: duration_ms(simconnect::DEFAULT_STALL_TIMEOUT),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS,
            heartbeat_interval_ms: None,
            subscriber_buffer: 16,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Where a loaded configuration came from. Loading runs before logging is
/// installed, so the caller reports this once the subscriber is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOrigin {
    File(PathBuf),
    CreatedDefault(PathBuf),
}

impl ConfigOrigin {
    pub fn path(&self) -> &Path {
        match self {
            ConfigOrigin::File(path) | ConfigOrigin::CreatedDefault(path) => path,
        }
    }

    pub fn log(&self) {
        match self {
            ConfigOrigin::File(path) => debug!("Loaded config from {:?}", path),
            ConfigOrigin::CreatedDefault(path) => {
                info!("Config file not found at {:?}, created default", path)
            }
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl BridgeConfig {
    /// Load configuration from the default location
    pub async fn load() -> Result<(Self, ConfigOrigin)> {
        let config_path = Self::default_config_path()?;
        Self::load_from_path(&config_path).await
    }

    /// Load configuration from a specific path, writing defaults if it is missing
    pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<(Self, ConfigOrigin)> {
        let path = path.as_ref();

        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            let config = Self::default();
            config.save_to_path(path).await?;
            return Ok((config, ConfigOrigin::CreatedDefault(path.to_path_buf())));
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: BridgeConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok((config, ConfigOrigin::File(path.to_path_buf())))
    }

    /// Save configuration to a specific path
    pub async fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        debug!("Saved config to {:?}", path);
        Ok(())
    }

    /// Platform default configuration path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = if cfg!(windows) {
            std::env::var("LOCALAPPDATA").context("LOCALAPPDATA environment variable not set")?
        } else {
            format!(
                "{}/.config",
                std::env::var("HOME").context("HOME environment variable not set")?
            )
        };

        Ok(PathBuf::from(config_dir)
            .join("flight-bridge")
            .join("bridge.json"))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !self.schema_version.starts_with(SCHEMA_PREFIX) {
            anyhow::bail!("Invalid schema version: {}", self.schema_version);
        }

        if self.detection.poll_interval_ms == 0 {
            anyhow::bail!("Detection poll interval must be greater than zero");
        }
        if self.detection.probe_timeout_ms == 0 {
            anyhow::bail!("Probe timeout must be greater than zero");
        }

        let xplane = &self.xplane;
        if xplane.receive_ports.is_empty() || xplane.target_ports.is_empty() {
            anyhow::bail!("X-Plane port lists must not be empty");
        }
        if xplane.receive_ports.len() != xplane.target_ports.len() {
            anyhow::bail!(
                "X-Plane receive ports ({}) and target ports ({}) must have the same length",
                xplane.receive_ports.len(),
                xplane.target_ports.len()
            );
        }
        if xplane
            .receive_ports
            .iter()
            .chain(&xplane.target_ports)
            .any(|&port| port == 0)
        {
            anyhow::bail!("X-Plane ports must be non-zero");
        }
        if xplane.frequency_hz == 0 || xplane.frequency_hz > MAX_FREQUENCY_HZ {
            anyhow::bail!(
                "X-Plane frequency must be between 1 and {} Hz, got {}",
                MAX_FREQUENCY_HZ,
                xplane.frequency_hz
            );
        }
        if xplane.stale_timeout_ms == 0 {
            anyhow::bail!("X-Plane stale timeout must be greater than zero");
        }

        if self.simconnect.reconnect_delay_ms == 0 || self.simconnect.stall_timeout_ms == 0 {
            anyhow::bail!("SimConnect timeouts must be greater than zero");
        }

        if self.broadcast.heartbeat_interval_ms == Some(0) {
            anyhow::bail!("Heartbeat interval must be greater than zero when set");
        }
        if self.broadcast.subscriber_buffer == 0 {
            anyhow::bail!("Subscriber buffer must be greater than zero");
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.detection.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.broadcast.heartbeat_interval_ms.map(Duration::from_millis)
    }

    pub fn process_patterns(&self) -> ProcessPatterns {
        ProcessPatterns::new(
            self.detection.msfs_processes.clone(),
            self.detection.xplane_processes.clone(),
        )
    }

    pub fn xplane_config(&self) -> XPlaneConfig {
        XPlaneConfig {
            host: self.xplane.host,
            receive_ports: self.xplane.receive_ports.clone(),
            target_ports: self.xplane.target_ports.clone(),
            frequency_hz: self.xplane.frequency_hz,
            stale_timeout: Duration::from_millis(self.xplane.stale_timeout_ms),
            resend_requests: self.xplane.resend_requests,
        }
    }

    pub fn simconnect_config(&self) -> SimConnectConfig {
        SimConnectConfig {
            app_name: self.simconnect.app_name.clone(),
            protocol: self.simconnect.protocol.into(),
            reconnect_delay: Duration::from_millis(self.simconnect.reconnect_delay_ms),
            stall_timeout: Duration::from_millis(self.simconnect.stall_timeout_ms),
        }
    }

    /// Probe against the first configured X-Plane target port.
    pub fn probe_config(&self) -> ProbeConfig {
        let defaults = ProbeConfig::default();
        let xplane_target = self
            .xplane
            .target_ports
            .first()
            .map(|&port| SocketAddr::new(self.xplane.host, port))
            .unwrap_or(defaults.xplane_target);
        ProbeConfig {
            protocol: self.simconnect.protocol.into(),
            xplane_target,
            timeout: Duration::from_millis(self.detection.probe_timeout_ms),
            ..defaults
        }
    }
}

impl From<ProtocolVersion> for Protocol {
    fn from(version: ProtocolVersion) -> Self {
        match version {
            ProtocolVersion::FsxSp2 => Protocol::FsxSp2,
            ProtocolVersion::KittyHawk => Protocol::KittyHawk,
        }
    }
}
