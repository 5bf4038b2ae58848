//! X-Plane telemetry over the RREF UDP protocol.
//!
//! The session waits until X-Plane is the target simulator, binds a local
//! receive port, subscribes to every channel in [`rref::CHANNELS`] and merges
//! each response into the snapshot store. When no valid record arrives for
//! the staleness timeout, or the bind fails with a port conflict, the
//! receive/target port pair is rotated and the session rebinds.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tracing::{debug, info, trace, warn};

use crate::watchdog::StalenessWatchdog;
use crate::{AdapterContext, SessionHandle};
use flight_bridge_telemetry_core::{
    AdapterState, AdapterStateCell, SimulatorAdapter, SimulatorKind, TelemetryError,
};

pub mod rref;

pub use rref::{
    CHANNELS, REQUEST_LEN, RequestDescriptor, RrefChannel, RrefError, RrefFrame, UnitConversion,
    decode_request, decode_response, encode_request, request_batch,
};

pub const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
pub const DEFAULT_RECEIVE_PORTS: [u16; 2] = [7172, 49001];
pub const DEFAULT_TARGET_PORTS: [u16; 2] = [49000, 49010];
pub const DEFAULT_FREQUENCY_HZ: u32 = 3;
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, Clone, PartialEq)]
pub struct XPlaneConfig {
    pub host: IpAddr,
    /// Local ports to bind, rotated on staleness.
    pub receive_ports: Vec<u16>,
    /// X-Plane request ports, rotated in lockstep with `receive_ports`.
    pub target_ports: Vec<u16>,
    pub frequency_hz: u32,
    pub stale_timeout: Duration,
    /// Re-send the request batch every `1 / frequency_hz` seconds.
    pub resend_requests: bool,
}

impl Default for XPlaneConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST,
            receive_ports: DEFAULT_RECEIVE_PORTS.to_vec(),
            target_ports: DEFAULT_TARGET_PORTS.to_vec(),
            frequency_hz: DEFAULT_FREQUENCY_HZ,
            stale_timeout: DEFAULT_STALE_TIMEOUT,
            resend_requests: true,
        }
    }
}

impl XPlaneConfig {
    pub fn resend_interval(&self) -> Option<Duration> {
        if !self.resend_requests || self.frequency_hz == 0 {
            return None;
        }
        Some(Duration::from_millis(1000 / u64::from(self.frequency_hz)))
    }

    fn frequency(&self) -> i32 {
        i32::try_from(self.frequency_hz).unwrap_or(i32::MAX)
    }
}

/// Lockstep rotation over the receive and target port lists.
#[derive(Debug, Clone)]
pub struct PortCycle {
    receive: Vec<u16>,
    target: Vec<u16>,
    receive_idx: usize,
    target_idx: usize,
}

impl PortCycle {
    pub fn new(receive: &[u16], target: &[u16]) -> Self {
        Self {
            receive: receive.to_vec(),
            target: target.to_vec(),
            receive_idx: 0,
            target_idx: 0,
        }
    }

    /// Current (receive, target) pair. Empty lists fall back to the defaults.
    pub fn current(&self) -> (u16, u16) {
        let receive = self
            .receive
            .get(self.receive_idx)
            .copied()
            .unwrap_or(DEFAULT_RECEIVE_PORTS[0]);
        let target = self
            .target
            .get(self.target_idx)
            .copied()
            .unwrap_or(DEFAULT_TARGET_PORTS[0]);
        (receive, target)
    }

    pub fn advance(&mut self) -> (u16, u16) {
        if !self.receive.is_empty() {
            self.receive_idx = (self.receive_idx + 1) % self.receive.len();
        }
        if !self.target.is_empty() {
            self.target_idx = (self.target_idx + 1) % self.target.len();
        }
        let (receive, target) = self.current();
        info!(
            receive_port = receive,
            target_port = target,
            "Switching X-Plane ports"
        );
        (receive, target)
    }
}

pub struct XPlaneAdapter {
    config: XPlaneConfig,
    ctx: AdapterContext,
    state: Arc<AdapterStateCell>,
    session: Mutex<Option<SessionHandle>>,
}

impl XPlaneAdapter {
    pub fn new(config: XPlaneConfig, ctx: AdapterContext) -> Self {
        Self {
            config,
            ctx,
            state: Arc::new(AdapterStateCell::new()),
            session: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &XPlaneConfig {
        &self.config
    }
}

#[async_trait]
impl SimulatorAdapter for XPlaneAdapter {
    fn kind(&self) -> SimulatorKind {
        SimulatorKind::XPlane
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
        let config = self.config.clone();
        let ctx = self.ctx.clone();
        let state = Arc::clone(&self.state);
        *session = Some(SessionHandle::spawn(move |shutdown| {
            run_session(config, ctx, state, shutdown)
        }));
        info!("X-Plane adapter started");
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
        info!("X-Plane adapter stopped");
        Ok(())
    }
}

enum SocketEnd {
    Shutdown,
    Stale,
}

async fn run_session(
    config: XPlaneConfig,
    ctx: AdapterContext,
    state: Arc<AdapterStateCell>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut target = ctx.simulator.subscribe_target();
    if *target.borrow() != SimulatorKind::XPlane {
        info!("Waiting for X-Plane to become the target simulator");
    }
    tokio::select! {
        _ = &mut shutdown => return,
        ready = async { target.wait_for(|kind| *kind == SimulatorKind::XPlane).await.is_ok() } => {
            if !ready {
                return;
            }
        }
    }

    let requests = rref::request_batch(config.frequency());
    let mut ports = PortCycle::new(&config.receive_ports, &config.target_ports);
    let retry_delay = StalenessWatchdog::new(config.stale_timeout, Instant::now()).check_interval();

    loop {
        let (receive_port, target_port) = ports.current();
        let socket = match bind(receive_port).await {
            Ok(socket) => socket,
            Err(e) => {
                if e.is_port_conflict() {
                    warn!(port = receive_port, error = %e, "X-Plane receive port unavailable");
                    ports.advance();
                } else {
                    warn!(port = receive_port, error = %e, "Failed to bind X-Plane socket");
                }
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(retry_delay) => continue,
                }
            }
        };
        info!(
            port = receive_port,
            target_port, "X-Plane UDP socket listening"
        );

        let dest = SocketAddr::new(config.host, target_port);
        match drive_socket(&socket, dest, &requests, &config, &ctx, &state, &mut shutdown).await {
            SocketEnd::Shutdown => break,
            SocketEnd::Stale => {
                warn!(
                    timeout_ms = config.stale_timeout.as_millis() as u64,
                    "No valid X-Plane data received"
                );
                state.set(AdapterState::Connecting);
                ports.advance();
            }
        }
    }
    debug!("X-Plane session ended");
}

async fn bind(port: u16) -> Result<UdpSocket, TelemetryError> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    UdpSocket::bind(addr)
        .await
        .map_err(|source| TelemetryError::Bind { port, source })
}

async fn drive_socket(
    socket: &UdpSocket,
    dest: SocketAddr,
    requests: &[[u8; REQUEST_LEN]],
    config: &XPlaneConfig,
    ctx: &AdapterContext,
    state: &AdapterStateCell,
    shutdown: &mut oneshot::Receiver<()>,
) -> SocketEnd {
    send_requests(socket, dest, requests).await;

    let start = Instant::now();
    let mut watchdog = StalenessWatchdog::new(config.stale_timeout, start);
    let check_every = watchdog.check_interval();
    let mut check = interval_at(start + check_every, check_every);
    let mut resend = config.resend_interval().map(|period| {
        let mut resend = interval_at(start + period, period);
        resend.set_missed_tick_behavior(MissedTickBehavior::Delay);
        resend
    });
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = &mut *shutdown => return SocketEnd::Shutdown,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, peer)) => {
                    if handle_datagram(&buf[..len], ctx, state) {
                        watchdog.record_valid(Instant::now());
                    } else {
                        trace!(%peer, len, "Ignored datagram");
                    }
                }
                Err(e) => warn!(error = %e, "X-Plane UDP receive error"),
            },
            _ = check.tick() => {
                if watchdog.check(Instant::now()) {
                    return SocketEnd::Stale;
                }
            }
            _ = tick(&mut resend) => send_requests(socket, dest, requests).await,
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn send_requests(socket: &UdpSocket, dest: SocketAddr, requests: &[[u8; REQUEST_LEN]]) {
    for request in requests {
        if let Err(e) = socket.send_to(request, dest).await {
            warn!(%dest, error = %e, "Failed to send RREF request");
            return;
        }
    }
    trace!(%dest, count = requests.len(), "RREF requests sent");
}

/// Decode one datagram and publish it. Returns whether it carried valid data.
fn handle_datagram(data: &[u8], ctx: &AdapterContext, state: &AdapterStateCell) -> bool {
    let frame = match rref::decode_response(data) {
        Ok(frame) => frame,
        Err(e) => {
            trace!(error = %e, "Discarding non-RREF datagram");
            return false;
        }
    };
    for id in &frame.unknown_ids {
        debug!(id, "Unknown RREF index");
    }
    if !frame.invalid_ids.is_empty() {
        debug!(ids = ?frame.invalid_ids, "Dropped non-finite RREF values");
    }
    if !frame.has_data() {
        return false;
    }

    if state.mark_active() {
        info!("Receiving X-Plane telemetry");
    }
    debug!(fields = frame.update.populated_fields(), "Decoded RREF message");
    ctx.publish_merge(SimulatorKind::XPlane, &frame.update);
    true
}

#[cfg(test)]
mod tests {
    use super::rref::test_support::response;
    use super::*;
    use flight_bridge_telemetry_core::{BroadcastHub, SimulatorState, SnapshotStore};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn context() -> AdapterContext {
        AdapterContext::new(
            Arc::new(SnapshotStore::new()),
            Arc::new(BroadcastHub::default()),
            Arc::new(SimulatorState::new()),
        )
    }

    #[test]
    fn port_cycle_rotates_in_lockstep() {
        let mut ports = PortCycle::new(&DEFAULT_RECEIVE_PORTS, &DEFAULT_TARGET_PORTS);
        assert_eq!(ports.current(), (7172, 49000));
        assert_eq!(ports.advance(), (49001, 49010));
        assert_eq!(ports.advance(), (7172, 49000));
    }

    #[test]
    fn port_cycle_handles_uneven_lists() {
        let mut ports = PortCycle::new(&[1000], &[2000, 2001, 2002]);
        assert_eq!(ports.advance(), (1000, 2001));
        assert_eq!(ports.advance(), (1000, 2002));
        assert_eq!(ports.advance(), (1000, 2000));
    }

    #[test]
    fn resend_interval_follows_frequency() {
        let mut config = XPlaneConfig::default();
        assert_eq!(config.resend_interval(), Some(Duration::from_millis(333)));
        config.resend_requests = false;
        assert_eq!(config.resend_interval(), None);
    }

    #[test]
    fn datagram_merges_into_store_and_confirms() -> TestResult {
        let ctx = context();
        let (_, mut rx) = ctx.hub.register();
        let state = AdapterStateCell::new();
        state.set(AdapterState::Connecting);

        assert!(handle_datagram(&response(&[(1, 47.5), (3, 100.0)]), &ctx, &state));
        assert!(handle_datagram(&response(&[(1, 48.0)]), &ctx, &state));

        let snapshot = ctx.store.get();
        assert_eq!(snapshot.latitude, Some(48.0));
        let msl = snapshot.altitude_msl.ok_or("MSL missing")?;
        assert!((msl - 328.084).abs() < 1e-3);
        assert_eq!(state.get(), AdapterState::Active);
        assert_eq!(ctx.simulator.confirmed(), SimulatorKind::XPlane);

        rx.try_recv()?;
        rx.try_recv()?;
        Ok(())
    }

    #[test]
    fn wrong_tag_leaves_snapshot_unchanged() {
        let ctx = context();
        let state = AdapterStateCell::new();
        let mut data = response(&[(1, 47.5)]);
        data[..4].copy_from_slice(b"DATA");

        assert!(!handle_datagram(&data, &ctx, &state));
        assert!(ctx.store.is_empty());
        assert_eq!(ctx.simulator.confirmed(), SimulatorKind::None);
    }

    #[test]
    fn unknown_ids_only_do_not_publish() {
        let ctx = context();
        let (_, mut rx) = ctx.hub.register();
        let state = AdapterStateCell::new();

        assert!(!handle_datagram(&response(&[(77, 1.0)]), &ctx, &state));
        assert!(rx.try_recv().is_err());
        assert!(ctx.store.last_update().is_none());
    }

    #[tokio::test]
    async fn start_twice_is_rejected_and_stop_is_idempotent() -> TestResult {
        let adapter = XPlaneAdapter::new(XPlaneConfig::default(), context());
        adapter.start().await?;
        assert_eq!(adapter.state(), AdapterState::Connecting);
        assert!(matches!(
            adapter.start().await,
            Err(TelemetryError::AlreadyRunning)
        ));

        adapter.stop().await?;
        assert_eq!(adapter.state(), AdapterState::Idle);
        adapter.stop().await?;
        assert_eq!(adapter.state(), AdapterState::Idle);
        Ok(())
    }
}
