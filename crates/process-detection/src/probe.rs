//! Protocol-probe detection.
//!
//! SimConnect is probed first by opening and immediately closing a session.
//! X-Plane is probed by subscribing to latitude on its request port and
//! waiting for any RREF-tagged reply; on success the subscription is
//! cancelled again with a frequency-0 request.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info};

use flight_bridge_telemetry_adapters::simconnect::{Protocol, SimConnectBinding};
use flight_bridge_telemetry_adapters::xplane::rref;

use crate::{DetectionError, SimulatorDetector, SimulatorKind};

pub const PROBE_APP_NAME: &str = "flight-bridge-probe";
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_FREQUENCY_HZ: i32 = 2;
const DEFAULT_XPLANE_TARGET: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 49000);

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeConfig {
    pub app_name: String,
    pub protocol: Protocol,
    pub xplane_target: SocketAddr,
    /// Upper bound for each individual probe.
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            app_name: PROBE_APP_NAME.to_string(),
            protocol: Protocol::default(),
            xplane_target: DEFAULT_XPLANE_TARGET,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

pub struct ProbeDetector {
    binding: Arc<dyn SimConnectBinding>,
    config: ProbeConfig,
}

impl ProbeDetector {
    pub fn new(binding: Arc<dyn SimConnectBinding>, config: ProbeConfig) -> Self {
        Self { binding, config }
    }

    async fn probe_simconnect(&self) -> bool {
        let opened = timeout(
            self.config.timeout,
            self.binding
                .open(&self.config.app_name, self.config.protocol),
        )
        .await;
        match opened {
            Ok(Ok(mut session)) => {
                info!(
                    application = %session.info().application_name,
                    "SimConnect answered probe"
                );
                if let Err(e) = session.close().await {
                    debug!(error = %e, "SimConnect probe close failed");
                }
                true
            }
            Ok(Err(e)) => {
                debug!(error = %e, "SimConnect probe failed");
                false
            }
            Err(_) => {
                debug!(
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "SimConnect probe timed out"
                );
                false
            }
        }
    }

    async fn probe_xplane(&self) -> Result<bool, DetectionError> {
        let target = self.config.xplane_target;
        let Some(subscribe) = rref::request_batch(PROBE_FREQUENCY_HZ).into_iter().next() else {
            return Ok(false);
        };

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.send_to(&subscribe, target).await?;

        let answered = timeout(self.config.timeout, wait_for_rref(&socket))
            .await
            .unwrap_or(false);
        if !answered {
            debug!(%target, "X-Plane probe got no RREF reply");
            return Ok(false);
        }

        info!(%target, "X-Plane answered probe");
        if let Some(cancel) = rref::request_batch(0).into_iter().next() {
            if let Err(e) = socket.send_to(&cancel, target).await {
                debug!(error = %e, "Failed to cancel X-Plane probe subscription");
            }
        }
        Ok(true)
    }
}

async fn wait_for_rref(socket: &UdpSocket) -> bool {
    let mut buf = [0u8; 1024];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, _)) => {
                if buf.get(..len).is_some_and(rref::has_rref_tag) {
                    return true;
                }
            }
            Err(e) => {
                debug!(error = %e, "X-Plane probe receive failed");
                return false;
            }
        }
    }
}

#[async_trait]
impl SimulatorDetector for ProbeDetector {
    async fn detect(&self) -> Result<SimulatorKind, DetectionError> {
        if self.probe_simconnect().await {
            return Ok(SimulatorKind::Msfs);
        }
        if self.probe_xplane().await? {
            return Ok(SimulatorKind::XPlane);
        }
        Ok(SimulatorKind::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flight_bridge_telemetry_adapters::TelemetryError;
    use flight_bridge_telemetry_adapters::simconnect::{
        DataType, Period, SessionInfo, SimConnectEvent, SimConnectSession, UnavailableBinding,
    };
    use std::sync::atomic::{AtomicBool, Ordering};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    struct OpenBinding {
        closed: Arc<AtomicBool>,
    }

    struct ProbeSession {
        info: SessionInfo,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl SimConnectBinding for OpenBinding {
        async fn open(
            &self,
            app_name: &str,
            _protocol: Protocol,
        ) -> Result<Box<dyn SimConnectSession>, TelemetryError> {
            assert_eq!(app_name, PROBE_APP_NAME);
            Ok(Box::new(ProbeSession {
                info: SessionInfo {
                    application_name: "SunRise".to_string(),
                    application_version: "5.4".to_string(),
                },
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    #[async_trait]
    impl SimConnectSession for ProbeSession {
        fn info(&self) -> &SessionInfo {
            &self.info
        }

        async fn declare_field(
            &mut self,
            _definition_id: u32,
            _name: &str,
            _unit: &str,
            _data_type: DataType,
        ) -> Result<(), TelemetryError> {
            Ok(())
        }

        async fn subscribe(
            &mut self,
            _request_id: u32,
            _definition_id: u32,
            _object_id: u32,
            _period: Period,
        ) -> Result<(), TelemetryError> {
            Ok(())
        }

        async fn next_event(&mut self) -> Option<SimConnectEvent> {
            None
        }

        async fn close(&mut self) -> Result<(), TelemetryError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config_for(target: SocketAddr) -> ProbeConfig {
        ProbeConfig {
            xplane_target: target,
            timeout: Duration::from_millis(300),
            ..ProbeConfig::default()
        }
    }

    #[tokio::test]
    async fn simconnect_answer_wins_and_session_is_closed() -> TestResult {
        let closed = Arc::new(AtomicBool::new(false));
        let binding = Arc::new(OpenBinding {
            closed: Arc::clone(&closed),
        });
        let silent = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let detector = ProbeDetector::new(binding, config_for(silent.local_addr()?));

        assert_eq!(detector.detect().await?, SimulatorKind::Msfs);
        assert!(closed.load(Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test]
    async fn rref_reply_detects_xplane_and_cancels_subscription() -> TestResult {
        let fake = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let target = fake.local_addr()?;
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let mut frequencies = Vec::new();
            while frequencies.len() < 2 {
                let Ok((len, peer)) = fake.recv_from(&mut buf).await else {
                    break;
                };
                let Ok(request) = rref::decode_request(&buf[..len]) else {
                    continue;
                };
                frequencies.push(request.frequency_hz);
                if request.frequency_hz > 0 && fake.send_to(b"RREF,\x01\0\0\0\0\0\0\0", peer).await.is_err() {
                    break;
                }
            }
            frequencies
        });

        let detector = ProbeDetector::new(Arc::new(UnavailableBinding), config_for(target));
        assert_eq!(detector.detect().await?, SimulatorKind::XPlane);

        let frequencies = timeout(Duration::from_secs(2), responder).await??;
        assert_eq!(frequencies, vec![PROBE_FREQUENCY_HZ, 0]);
        Ok(())
    }

    #[tokio::test]
    async fn silence_everywhere_is_none() -> TestResult {
        let silent = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let detector = ProbeDetector::new(Arc::new(UnavailableBinding), config_for(silent.local_addr()?));
        assert_eq!(detector.detect().await?, SimulatorKind::None);
        Ok(())
    }

    #[tokio::test]
    async fn non_rref_reply_is_not_accepted() -> TestResult {
        let fake = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let target = fake.local_addr()?;
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            if let Ok((_, peer)) = fake.recv_from(&mut buf).await {
                let _sent = fake.send_to(b"DATA*garbage", peer).await;
            }
        });

        let detector = ProbeDetector::new(Arc::new(UnavailableBinding), config_for(target));
        assert_eq!(detector.detect().await?, SimulatorKind::None);
        responder.await?;
        Ok(())
    }
}
