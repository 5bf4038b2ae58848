//! Future-based facade over a SimConnect client library.
//!
//! The native client is callback driven; implementations of these traits
//! turn it into an `open` call plus a pull-style event stream so the adapter
//! can drive everything from one `select!` loop.

use async_trait::async_trait;
use flight_bridge_telemetry_core::TelemetryError;

pub const DEFAULT_APP_NAME: &str = "flight-bridge";

/// `SIMCONNECT_OBJECT_ID_USER`: the user aircraft.
pub const OBJECT_ID_USER: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    FsxSp2,
    KittyHawk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Float64,
    Float32,
    Int32,
}

impl DataType {
    /// Bytes one value of this type occupies in a data event payload.
    pub fn width(self) -> usize {
        match self {
            DataType::Float64 => 8,
            DataType::Float32 | DataType::Int32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Never,
    Once,
    VisualFrame,
    SimFrame,
    Second,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionInfo {
    pub application_name: String,
    pub application_version: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SimConnectEvent {
    /// Values for `request_id`, packed in declaration order.
    Data { request_id: u32, payload: Vec<u8> },
    /// The simulator is exiting.
    Quit,
    /// The connection dropped.
    Close,
}

#[async_trait]
pub trait SimConnectBinding: Send + Sync {
    /// False when this binding can never open a session.
    fn is_available(&self) -> bool {
        true
    }

    async fn open(
        &self,
        app_name: &str,
        protocol: Protocol,
    ) -> Result<Box<dyn SimConnectSession>, TelemetryError>;
}

#[async_trait]
pub trait SimConnectSession: Send {
    fn info(&self) -> &SessionInfo;

    async fn declare_field(
        &mut self,
        definition_id: u32,
        name: &str,
        unit: &str,
        data_type: DataType,
    ) -> Result<(), TelemetryError>;

    async fn subscribe(
        &mut self,
        request_id: u32,
        definition_id: u32,
        object_id: u32,
        period: Period,
    ) -> Result<(), TelemetryError>;

    /// Next event from the simulator. Must be cancel-safe. `None` once the
    /// connection is gone.
    async fn next_event(&mut self) -> Option<SimConnectEvent>;

    async fn close(&mut self) -> Result<(), TelemetryError>;
}

/// Binding for hosts without a SimConnect client library; every open fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableBinding;

#[async_trait]
impl SimConnectBinding for UnavailableBinding {
    fn is_available(&self) -> bool {
        false
    }

    async fn open(
        &self,
        _app_name: &str,
        _protocol: Protocol,
    ) -> Result<Box<dyn SimConnectSession>, TelemetryError> {
        Err(TelemetryError::ConnectionFailed(
            "no SimConnect client library is available on this host".to_string(),
        ))
    }
}
