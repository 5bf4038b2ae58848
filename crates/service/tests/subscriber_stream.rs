//! End-to-end: fake X-Plane over loopback UDP, the daemon, and WebSocket
//! subscribers.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use flight_bridge_process_detection::{DetectionError, SimulatorDetector};
use flight_bridge_service::{BridgeConfig, BridgeDaemon};
use flight_bridge_telemetry_adapters::xplane::decode_request;
use flight_bridge_telemetry_core::{SimulatorKind, TelemetrySnapshot};

type TestResult = Result<(), Box<dyn std::error::Error>>;
type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

struct FixedDetector(SimulatorKind);

#[async_trait]
impl SimulatorDetector for FixedDetector {
    async fn detect(&self) -> Result<SimulatorKind, DetectionError> {
        Ok(self.0)
    }
}

fn free_udp_port() -> Result<u16, std::io::Error> {
    let socket = StdUdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(socket.local_addr()?.port())
}

/// Answers every latitude subscription with latitude, AGL and vertical speed.
async fn spawn_fake_xplane() -> Result<(u16, JoinHandle<()>), std::io::Error> {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let port = socket.local_addr()?.port();
    let task = tokio::spawn(async move {
        let mut buf = [0u8; 512];
        while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
            let Ok(request) = decode_request(&buf[..len]) else {
                continue;
            };
            if request.id != 1 || request.frequency_hz == 0 {
                continue;
            }
            let mut reply = b"RREF,".to_vec();
            for (id, value) in [(1i32, 47.5f32), (4, 100.0), (12, 5.08)] {
                reply.extend_from_slice(&id.to_le_bytes());
                reply.extend_from_slice(&value.to_le_bytes());
            }
            if socket.send_to(&reply, peer).await.is_err() {
                break;
            }
        }
    });
    Ok((port, task))
}

fn base_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.broadcast.listen_address = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
    config.detection.poll_interval_ms = 100;
    config
}

async fn start(
    daemon: BridgeDaemon,
) -> Result<(SocketAddr, tokio::sync::broadcast::Sender<()>, JoinHandle<anyhow::Result<()>>), Box<dyn std::error::Error>>
{
    let addr = daemon.local_addr()?;
    let shutdown = daemon.shutdown_handle();
    let task = tokio::spawn(daemon.run());
    Ok((addr, shutdown, task))
}

async fn connect(addr: SocketAddr, path: &str) -> Result<Client, Box<dyn std::error::Error>> {
    let (client, _) = connect_async(format!("ws://{addr}{path}")).await?;
    Ok(client)
}

async fn next_json(client: &mut Client) -> Result<Value, Box<dyn std::error::Error>> {
    loop {
        let message = timeout(WAIT, client.next())
            .await?
            .ok_or("connection closed")??;
        if message.is_text() {
            return Ok(serde_json::from_str(message.to_text()?)?);
        }
    }
}

#[tokio::test]
async fn xplane_telemetry_reaches_websocket_subscriber() -> TestResult {
    let (xplane_port, fake) = spawn_fake_xplane().await?;
    let mut config = base_config();
    config.xplane.host = Ipv4Addr::LOCALHOST.into();
    config.xplane.receive_ports = vec![free_udp_port()?];
    config.xplane.target_ports = vec![xplane_port];

    let daemon = BridgeDaemon::bind(config)
        .await?
        .with_detector(Arc::new(FixedDetector(SimulatorKind::XPlane)));
    let simulator = daemon.simulator();
    let (addr, shutdown, task) = start(daemon).await?;

    let mut client = connect(addr, "/").await?;
    let snapshot = next_json(&mut client).await?;

    assert_eq!(snapshot["latitude"].as_f64(), Some(47.5));
    let agl = snapshot["AGL"].as_f64().ok_or("AGL missing")?;
    assert!((agl - 328.084).abs() < 1e-3);
    let vertical_speed = snapshot["vertical_speed"]
        .as_f64()
        .ok_or("vertical speed missing")?;
    assert!((vertical_speed - 1000.0).abs() < 0.1);
    assert_eq!(simulator.confirmed(), SimulatorKind::XPlane);

    // Client chatter is ignored and the stream keeps flowing.
    client.send(Message::text("hello")).await?;
    let again = next_json(&mut client).await?;
    assert_eq!(again["latitude"].as_f64(), Some(47.5));

    shutdown.send(())?;
    timeout(WAIT, task).await???;
    assert_eq!(simulator.target(), SimulatorKind::None);

    fake.abort();
    Ok(())
}

#[tokio::test]
async fn new_subscriber_gets_current_snapshot_immediately() -> TestResult {
    let daemon = BridgeDaemon::bind(base_config())
        .await?
        .with_detector(Arc::new(FixedDetector(SimulatorKind::None)));
    let mut stored = TelemetrySnapshot::new();
    stored.latitude = Some(-33.9);
    stored.longitude = Some(151.2);
    daemon.store().replace(stored);
    let (addr, shutdown, task) = start(daemon).await?;

    let mut client = connect(addr, "/any/path").await?;
    let snapshot: TelemetrySnapshot = serde_json::from_value(next_json(&mut client).await?)?;
    assert_eq!(snapshot.latitude, Some(-33.9));
    assert_eq!(snapshot.longitude, Some(151.2));

    shutdown.send(())?;
    timeout(WAIT, task).await???;
    Ok(())
}

#[tokio::test]
async fn heartbeat_reaches_every_subscriber() -> TestResult {
    let mut config = base_config();
    config.broadcast.heartbeat_interval_ms = Some(100);
    let daemon = BridgeDaemon::bind(config)
        .await?
        .with_detector(Arc::new(FixedDetector(SimulatorKind::None)));
    let mut stored = TelemetrySnapshot::new();
    stored.groundspeed = Some(140.0);
    daemon.store().replace(stored);
    let (addr, shutdown, task) = start(daemon).await?;

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(connect(addr, "/").await?);
    }
    for client in &mut clients {
        // Initial snapshot, then at least one heartbeat.
        for _ in 0..2 {
            let snapshot = next_json(client).await?;
            assert_eq!(snapshot["groundspeed"].as_f64(), Some(140.0));
        }
    }

    shutdown.send(())?;
    timeout(WAIT, task).await???;
    Ok(())
}

#[tokio::test]
async fn shutdown_closes_open_connections() -> TestResult {
    let daemon = BridgeDaemon::bind(base_config())
        .await?
        .with_detector(Arc::new(FixedDetector(SimulatorKind::None)));
    let (addr, shutdown, task) = start(daemon).await?;
    let mut client = connect(addr, "/").await?;

    shutdown.send(())?;
    timeout(WAIT, task).await???;

    // The server sends a close frame (or simply drops the socket).
    let closed = timeout(WAIT, async {
        while let Some(message) = client.next().await {
            match message {
                Ok(Message::Close(_)) | Err(_) => return true,
                Ok(_) => {}
            }
        }
        true
    })
    .await?;
    assert!(closed);
    Ok(())
}
