//! X-Plane adapter against a fake simulator on loopback UDP.
//!
//! The fake answers every RREF subscription it receives with one response
//! datagram, so these tests exercise the real bind / request / decode /
//! publish path end to end.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use flight_bridge_telemetry_adapters::xplane::{XPlaneAdapter, XPlaneConfig, decode_request};
use flight_bridge_telemetry_adapters::{
    AdapterContext, AdapterState, BroadcastHub, SimulatorAdapter, SimulatorKind, SimulatorState,
    SnapshotStore, TelemetrySnapshot,
};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

type TestResult = Result<(), Box<dyn std::error::Error>>;

const WAIT: Duration = Duration::from_secs(5);

fn context() -> AdapterContext {
    AdapterContext::new(
        Arc::new(SnapshotStore::new()),
        Arc::new(BroadcastHub::default()),
        Arc::new(SimulatorState::new()),
    )
}

/// Reserve a free local UDP port number.
fn free_port() -> Result<u16, std::io::Error> {
    let socket = StdUdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(socket.local_addr()?.port())
}

fn rref_response(records: &[(i32, f32)]) -> Vec<u8> {
    let mut data = b"RREF,".to_vec();
    for (id, value) in records {
        data.extend_from_slice(&id.to_le_bytes());
        data.extend_from_slice(&value.to_le_bytes());
    }
    data
}

struct FakeXPlane {
    port: u16,
    requests: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl FakeXPlane {
    /// Reply to each latitude request with latitude, AGL and vertical speed.
    async fn spawn() -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let port = socket.local_addr()?.port();
        let requests = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&requests);
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                let Ok(request) = decode_request(&buf[..len]) else {
                    continue;
                };
                seen.fetch_add(1, Ordering::SeqCst);
                if request.id != 1 {
                    continue;
                }
                let reply = rref_response(&[(1, 47.5), (4, 100.0), (12, 5.08), (42, 1.0)]);
                if socket.send_to(&reply, peer).await.is_err() {
                    break;
                }
            }
        });
        Ok(Self {
            port,
            requests,
            task,
        })
    }
}

impl Drop for FakeXPlane {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn next_snapshot(
    rx: &mut tokio::sync::mpsc::Receiver<Arc<str>>,
) -> Result<TelemetrySnapshot, Box<dyn std::error::Error>> {
    let payload = tokio::time::timeout(WAIT, rx.recv())
        .await?
        .ok_or("hub closed")?;
    Ok(serde_json::from_str(&payload)?)
}

#[tokio::test]
async fn adapter_subscribes_and_publishes_converted_values() -> TestResult {
    let fake = FakeXPlane::spawn().await?;
    let ctx = context();
    let (_, mut rx) = ctx.hub.register();
    let config = XPlaneConfig {
        host: Ipv4Addr::LOCALHOST.into(),
        receive_ports: vec![free_port()?],
        target_ports: vec![fake.port],
        resend_requests: false,
        ..XPlaneConfig::default()
    };
    let adapter = XPlaneAdapter::new(config, ctx.clone());

    ctx.simulator.set_target(SimulatorKind::XPlane);
    adapter.start().await?;
    let snapshot = next_snapshot(&mut rx).await?;

    assert_eq!(snapshot.latitude, Some(47.5));
    let agl = snapshot.altitude_agl.ok_or("AGL missing")?;
    assert!((agl - 328.084).abs() < 1e-3);
    // 5.08 m/s climb.
    let vertical_speed = snapshot.vertical_speed.ok_or("vertical speed missing")?;
    assert!((vertical_speed - 1000.0).abs() < 0.1, "got {vertical_speed}");
    assert_eq!(ctx.simulator.confirmed(), SimulatorKind::XPlane);
    assert_eq!(adapter.state(), AdapterState::Active);
    assert!(fake.requests.load(Ordering::SeqCst) >= 1);

    adapter.stop().await?;
    assert_eq!(adapter.state(), AdapterState::Idle);
    Ok(())
}

#[tokio::test]
async fn adapter_waits_for_xplane_target_before_binding() -> TestResult {
    let fake = FakeXPlane::spawn().await?;
    let ctx = context();
    let receive_port = free_port()?;
    let config = XPlaneConfig {
        host: Ipv4Addr::LOCALHOST.into(),
        receive_ports: vec![receive_port],
        target_ports: vec![fake.port],
        ..XPlaneConfig::default()
    };
    let adapter = XPlaneAdapter::new(config, ctx.clone());

    adapter.start().await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fake.requests.load(Ordering::SeqCst), 0);

    // Nothing is bound yet, so the port is still free for someone else.
    let probe = StdUdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, receive_port)))?;
    drop(probe);

    adapter.stop().await?;
    Ok(())
}

#[tokio::test]
async fn stop_releases_the_receive_port() -> TestResult {
    let fake = FakeXPlane::spawn().await?;
    let ctx = context();
    let (_, mut rx) = ctx.hub.register();
    let receive_port = free_port()?;
    let config = XPlaneConfig {
        host: Ipv4Addr::LOCALHOST.into(),
        receive_ports: vec![receive_port],
        target_ports: vec![fake.port],
        ..XPlaneConfig::default()
    };
    let adapter = XPlaneAdapter::new(config, ctx.clone());

    ctx.simulator.set_target(SimulatorKind::XPlane);
    adapter.start().await?;
    next_snapshot(&mut rx).await?;
    adapter.stop().await?;

    let rebound = StdUdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, receive_port)))?;
    drop(rebound);

    // A second session can take the same port again.
    while rx.try_recv().is_ok() {}
    adapter.start().await?;
    next_snapshot(&mut rx).await?;
    adapter.stop().await?;
    Ok(())
}

#[tokio::test]
async fn silent_target_port_is_cycled_away_from() -> TestResult {
    let fake = FakeXPlane::spawn().await?;
    let silent = StdUdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
    let ctx = context();
    let (_, mut rx) = ctx.hub.register();
    let config = XPlaneConfig {
        host: Ipv4Addr::LOCALHOST.into(),
        receive_ports: vec![free_port()?, free_port()?],
        target_ports: vec![silent.local_addr()?.port(), fake.port],
        stale_timeout: Duration::from_millis(300),
        resend_requests: false,
        ..XPlaneConfig::default()
    };
    let adapter = XPlaneAdapter::new(config, ctx.clone());

    ctx.simulator.set_target(SimulatorKind::XPlane);
    adapter.start().await?;
    let snapshot = next_snapshot(&mut rx).await?;
    assert_eq!(snapshot.latitude, Some(47.5));

    adapter.stop().await?;
    Ok(())
}

#[tokio::test]
async fn silent_target_is_resubscribed_at_most_once_per_timeout_window() -> TestResult {
    let silent = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let silent_port = silent.local_addr()?.port();
    // One latitude request per subscription batch, so this counts rebinds.
    let batches = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&batches);
    let listener = tokio::spawn(async move {
        let mut buf = [0u8; 512];
        while let Ok((len, _)) = silent.recv_from(&mut buf).await {
            if decode_request(&buf[..len]).is_ok_and(|r| r.id == 1) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    let stale_timeout = Duration::from_millis(200);
    let ctx = context();
    let config = XPlaneConfig {
        host: Ipv4Addr::LOCALHOST.into(),
        receive_ports: vec![free_port()?],
        target_ports: vec![silent_port],
        stale_timeout,
        resend_requests: false,
        ..XPlaneConfig::default()
    };
    let adapter = XPlaneAdapter::new(config, ctx.clone());

    ctx.simulator.set_target(SimulatorKind::XPlane);
    adapter.start().await?;
    tokio::time::sleep(stale_timeout * 5).await;
    adapter.stop().await?;
    listener.abort();

    // The first batch, then one more per elapsed window of silence at most.
    let batches = batches.load(Ordering::SeqCst);
    assert!(batches >= 2, "never resubscribed: {batches} batch(es)");
    assert!(batches <= 6, "resubscribed too often: {batches} batches");
    assert_eq!(adapter.state(), AdapterState::Idle);
    Ok(())
}

#[tokio::test]
async fn occupied_receive_port_is_skipped() -> TestResult {
    let fake = FakeXPlane::spawn().await?;
    let occupied = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    let ctx = context();
    let (_, mut rx) = ctx.hub.register();
    let config = XPlaneConfig {
        host: Ipv4Addr::LOCALHOST.into(),
        receive_ports: vec![occupied.local_addr()?.port(), free_port()?],
        target_ports: vec![fake.port, fake.port],
        stale_timeout: Duration::from_millis(300),
        ..XPlaneConfig::default()
    };
    let adapter = XPlaneAdapter::new(config, ctx.clone());

    ctx.simulator.set_target(SimulatorKind::XPlane);
    adapter.start().await?;
    let snapshot = next_snapshot(&mut rx).await?;
    assert_eq!(snapshot.latitude, Some(47.5));

    adapter.stop().await?;
    drop(occupied);
    Ok(())
}
