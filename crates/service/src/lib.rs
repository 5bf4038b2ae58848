//! Flight bridge service: detection-driven adapter switching and the
//! WebSocket subscriber listener.
//!
//! ## Modules
//! - `config` - `BridgeConfig` loading, defaults and validation
//! - `connection_manager` - Starts and stops adapters as the detected simulator changes
//! - `ws_server` - Subscriber listener and optional heartbeat
//! - `daemon` - Wires everything together for `flightbridged`
//! - `observability` - Logging initialisation

#![deny(static_mut_refs)]

pub mod config;
pub mod connection_manager;
pub mod daemon;
pub mod observability;
pub mod ws_server;

pub use config::{BridgeConfig, ConfigOrigin};
pub use connection_manager::{ConnectionManager, Transition};
pub use daemon::{BridgeDaemon, detect_once, shutdown_signal};
pub use observability::init_logging;
