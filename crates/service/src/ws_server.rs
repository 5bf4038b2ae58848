//! WebSocket listener that streams snapshots to subscribers.
//!
//! Every connection registers with the [`BroadcastHub`] and forwards its
//! channel as text frames. The current snapshot is queued first when the
//! store holds one. Anything the client sends is logged and ignored.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use flight_bridge_telemetry_core::{BroadcastHub, SnapshotStore, SubscriberId};

/// Shared state for the subscriber routes.
#[derive(Clone)]
pub struct SubscriberState {
    pub hub: Arc<BroadcastHub>,
    pub store: Arc<SnapshotStore>,
    /// Fired once on daemon shutdown; open connections close on it.
    pub shutdown: broadcast::Sender<()>,
}

impl SubscriberState {
    pub fn new(
        hub: Arc<BroadcastHub>,
        store: Arc<SnapshotStore>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            hub,
            store,
            shutdown,
        }
    }
}

/// Subscribers may connect on any path.
pub fn router(state: SubscriberState) -> Router {
    Router::new()
        .route("/", get(subscribe))
        .route("/{*path}", get(subscribe))
        .with_state(state)
}

/// Bind the subscriber listener. Failure here is fatal for the daemon.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind subscriber listener on {}", addr))
}

/// Serve subscribers until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    state: SubscriberState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let local_addr = listener.local_addr().context("Listener has no local address")?;
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();

    info!(address = %local_addr, "Subscriber listener started");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
        .context("Subscriber listener failed")?;
    info!("Subscriber listener stopped");
    Ok(())
}

async fn subscribe(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<SubscriberState>,
) -> Response {
    // Subscribed before the upgrade completes so a shutdown racing the
    // handshake is still observed.
    let shutdown = state.shutdown.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, peer, state, shutdown))
}

async fn handle_socket(
    socket: WebSocket,
    peer: SocketAddr,
    state: SubscriberState,
    mut shutdown: broadcast::Receiver<()>,
) {
    let (id, mut updates) = state.hub.register();
    info!(subscriber = %id, %peer, "Subscriber connected");

    if !state.store.is_empty() {
        send_initial_snapshot(&state, id);
    }

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            update = updates.recv() => {
                // `None` means the hub already dropped us.
                let Some(payload) = update else { break };
                if let Err(e) = sink.send(Message::Text(payload.to_string().into())).await {
                    debug!(subscriber = %id, error = %e, "Send to subscriber failed");
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    debug!(subscriber = %id, message = %text.as_str(), "Ignoring client message");
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(subscriber = %id, error = %e, "Subscriber connection error");
                    break;
                }
            },
        }
    }

    state.hub.deregister(id);
    info!(subscriber = %id, %peer, "Subscriber disconnected");
}

fn send_initial_snapshot(state: &SubscriberState, id: SubscriberId) {
    match state.hub.publish_to(id, &state.store.get()) {
        Ok(true) => debug!(subscriber = %id, "Queued initial snapshot"),
        Ok(false) => debug!(subscriber = %id, "Initial snapshot not queued"),
        Err(e) => warn!(subscriber = %id, error = %e, "Failed to serialize initial snapshot"),
    }
}

/// Republish the current snapshot every `period` until shutdown. An empty
/// store is not published.
pub async fn run_heartbeat(
    hub: Arc<BroadcastHub>,
    store: Arc<SnapshotStore>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                if store.is_empty() {
                    continue;
                }
                if let Err(e) = hub.publish(&store.get()) {
                    warn!(error = %e, "Heartbeat publish failed");
                }
            }
        }
    }
    debug!("Heartbeat stopped");
}
