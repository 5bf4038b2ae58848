//! MSFS / Prepar3D telemetry through SimConnect.
//!
//! A session opens the binding, declares [`schema::AIRCRAFT_SCHEMA`] once,
//! subscribes per simulation frame and replaces the snapshot with every
//! decoded sample. `quit` and `close` reconnect after a fixed delay; `close`
//! only while MSFS is still the target simulator. A session that produces no
//! position for the stall timeout is closed and reopened immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, oneshot};
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, warn};

use crate::watchdog::StalenessWatchdog;
use crate::{AdapterContext, SessionHandle};
use flight_bridge_telemetry_core::{
    AdapterState, AdapterStateCell, SimulatorAdapter, SimulatorKind, TelemetryError,
};

pub mod binding;
pub mod schema;

pub use binding::{
    DEFAULT_APP_NAME, DataType, OBJECT_ID_USER, Period, Protocol, SessionInfo, SimConnectBinding,
    SimConnectEvent, SimConnectSession, UnavailableBinding,
};
pub use schema::{AIRCRAFT_SCHEMA, FieldSpec, SampleError, decode_sample};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct SimConnectConfig {
    pub app_name: String,
    pub protocol: Protocol,
    pub reconnect_delay: Duration,
    pub stall_timeout: Duration,
}

impl Default for SimConnectConfig {
    fn default() -> Self {
        Self {
            app_name: DEFAULT_APP_NAME.to_string(),
            protocol: Protocol::default(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }
}

pub struct SimConnectAdapter {
    binding: Arc<dyn SimConnectBinding>,
    config: SimConnectConfig,
    ctx: AdapterContext,
    state: Arc<AdapterStateCell>,
    session: Mutex<Option<SessionHandle>>,
}

impl SimConnectAdapter {
    pub fn new(
        binding: Arc<dyn SimConnectBinding>,
        config: SimConnectConfig,
        ctx: AdapterContext,
    ) -> Self {
        Self {
            binding,
            config,
            ctx,
            state: Arc::new(AdapterStateCell::new()),
            session: Mutex::new(None),
        }
    }
}

#[async_trait]
impl SimulatorAdapter for SimConnectAdapter {
    fn kind(&self) -> SimulatorKind {
        SimulatorKind::Msfs
    }

    fn state(&self) -> AdapterState {
        self.state.get()
    }

    async fn start(&self) -> Result<(), TelemetryError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(TelemetryError::AlreadyRunning);
        }
        self.state.set(AdapterState::Connecting);
        let binding = Arc::clone(&self.binding);
        let config = self.config.clone();
        let ctx = self.ctx.clone();
        let state = Arc::clone(&self.state);
        *session = Some(SessionHandle::spawn(move |shutdown| {
            run_session(binding, config, ctx, state, shutdown)
        }));
        info!("SimConnect adapter started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), TelemetryError> {
        let mut session = self.session.lock().await;
        let Some(handle) = session.take() else {
            self.state.set(AdapterState::Idle);
            return Ok(());
        };
        self.state.set(AdapterState::Stopping);
        handle.shutdown().await;
        self.state.set(AdapterState::Idle);
        info!("SimConnect adapter stopped");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    Stalled,
    Quit,
    Closed,
}

async fn run_session(
    binding: Arc<dyn SimConnectBinding>,
    config: SimConnectConfig,
    ctx: AdapterContext,
    state: Arc<AdapterStateCell>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let retry_ms = config.reconnect_delay.as_millis() as u64;
    loop {
        let opened = tokio::select! {
            _ = &mut shutdown => break,
            opened = open_session(binding.as_ref(), &config) => opened,
        };
        let mut session = match opened {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, retry_ms, "SimConnect connection failed");
                if wait_or_shutdown(&mut shutdown, config.reconnect_delay).await {
                    break;
                }
                continue;
            }
        };
        info!(
            application = %session.info().application_name,
            "Connected to SimConnect"
        );

        let end = drive_session(session.as_mut(), &config, &ctx, &state, &mut shutdown).await;
        if let Err(e) = session.close().await {
            debug!(error = %e, "SimConnect close failed");
        }
        drop(session);

        match end {
            SessionEnd::Shutdown => break,
            SessionEnd::Stalled => {
                warn!(
                    timeout_ms = config.stall_timeout.as_millis() as u64,
                    "No SimConnect position data; restarting session"
                );
                state.transition(AdapterState::Active, AdapterState::Connecting);
                continue;
            }
            SessionEnd::Quit => info!(retry_ms, "Simulator quit; reconnecting"),
            SessionEnd::Closed => {
                let target = ctx.simulator.target();
                if target != SimulatorKind::Msfs {
                    info!(%target, "SimConnect closed; MSFS is no longer the target");
                    if !state.transition(AdapterState::Active, AdapterState::Idle) {
                        state.transition(AdapterState::Connecting, AdapterState::Idle);
                    }
                    break;
                }
                warn!(retry_ms, "SimConnect connection closed; reconnecting");
            }
        }

        state.transition(AdapterState::Active, AdapterState::Connecting);
        if wait_or_shutdown(&mut shutdown, config.reconnect_delay).await {
            break;
        }
    }
    debug!("SimConnect session ended");
}

/// Sleep for `delay`; true if shutdown was requested first.
async fn wait_or_shutdown(shutdown: &mut oneshot::Receiver<()>, delay: Duration) -> bool {
    tokio::select! {
        _ = &mut *shutdown => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

async fn open_session(
    binding: &dyn SimConnectBinding,
    config: &SimConnectConfig,
) -> Result<Box<dyn SimConnectSession>, TelemetryError> {
    let mut session = binding.open(&config.app_name, config.protocol).await?;
    if let Err(e) = declare_and_subscribe(session.as_mut()).await {
        if let Err(close_err) = session.close().await {
            debug!(error = %close_err, "SimConnect close failed");
        }
        return Err(e);
    }
    Ok(session)
}

async fn declare_and_subscribe(session: &mut dyn SimConnectSession) -> Result<(), TelemetryError> {
    for spec in &AIRCRAFT_SCHEMA {
        session
            .declare_field(
                schema::AIRCRAFT_DEFINITION,
                spec.name,
                spec.unit,
                spec.data_type,
            )
            .await?;
    }
    session
        .subscribe(
            schema::AIRCRAFT_REQUEST,
            schema::AIRCRAFT_DEFINITION,
            OBJECT_ID_USER,
            Period::SimFrame,
        )
        .await
}

async fn drive_session(
    session: &mut dyn SimConnectSession,
    config: &SimConnectConfig,
    ctx: &AdapterContext,
    state: &AdapterStateCell,
    shutdown: &mut oneshot::Receiver<()>,
) -> SessionEnd {
    let start = Instant::now();
    let mut watchdog = StalenessWatchdog::new(config.stall_timeout, start);
    let every = watchdog.check_interval();
    let mut check = interval_at(start + every, every);

    loop {
        tokio::select! {
            _ = &mut *shutdown => return SessionEnd::Shutdown,
            event = session.next_event() => match event {
                Some(SimConnectEvent::Data { request_id, payload })
                    if request_id == schema::AIRCRAFT_REQUEST =>
                {
                    if handle_sample(&payload, ctx, state) {
                        watchdog.record_valid(Instant::now());
                    }
                }
                Some(SimConnectEvent::Data { request_id, .. }) => {
                    debug!(request_id, "Ignoring data for unknown request");
                }
                Some(SimConnectEvent::Quit) => return SessionEnd::Quit,
                Some(SimConnectEvent::Close) | None => return SessionEnd::Closed,
            },
            _ = check.tick() => {
                if watchdog.is_stale(Instant::now()) {
                    return SessionEnd::Stalled;
                }
            }
        }
    }
}

/// Decode and publish one sample. Returns whether it carried a position.
fn handle_sample(payload: &[u8], ctx: &AdapterContext, state: &AdapterStateCell) -> bool {
    let snapshot = match decode_sample(payload) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(error = %e, "Dropping SimConnect sample");
            return false;
        }
    };
    let has_position = snapshot.latitude.is_some_and(|lat| lat.abs() > f64::EPSILON);

    if state.mark_active() {
        info!("Receiving SimConnect telemetry");
    }
    ctx.publish_replace(SimulatorKind::Msfs, snapshot);
    has_position
}
