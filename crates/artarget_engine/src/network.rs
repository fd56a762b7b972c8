//! Connectivity tracking and the "wait until online" gate.

use std::sync::Arc;
use std::time::Duration;

use artarget_core::JobError;
use artarget_logging::{pipeline_debug, pipeline_info, pipeline_warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::http;
use crate::settings::NetworkSettings;
use crate::token::OperationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EffectiveType {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

impl EffectiveType {
    /// Coarse class derived from round-trip time alone.
    pub fn from_rtt(rtt_ms: u64) -> Self {
        match rtt_ms {
            0..=269 => EffectiveType::FourG,
            270..=1399 => EffectiveType::ThreeG,
            1400..=1999 => EffectiveType::TwoG,
            _ => EffectiveType::Slow2g,
        }
    }
}

/// What a connection-info probe observed.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ConnectionInfo {
    pub effective_type: EffectiveType,
    pub downlink_mbps: Option<f64>,
    pub rtt_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkStatus {
    pub is_online: bool,
    pub is_slow_connection: bool,
    pub effective_type: EffectiveType,
    pub downlink_mbps: Option<f64>,
    pub rtt_ms: Option<u64>,
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self {
            is_online: true,
            is_slow_connection: false,
            effective_type: EffectiveType::Unknown,
            downlink_mbps: None,
            rtt_ms: None,
        }
    }
}

/// Shared view of connectivity. Clones observe the same status.
#[derive(Clone)]
pub struct NetworkMonitor {
    status: Arc<watch::Sender<NetworkStatus>>,
    settings: NetworkSettings,
}

impl NetworkMonitor {
    pub fn new(settings: NetworkSettings) -> Self {
        let (tx, _rx) = watch::channel(NetworkStatus::default());
        Self {
            status: Arc::new(tx),
            settings,
        }
    }

    pub fn status(&self) -> NetworkStatus {
        *self.status.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.status.borrow().is_online
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.status.subscribe()
    }

    /// Connectivity event (the platform reported going online or offline).
    pub fn set_online(&self, online: bool) {
        self.status.send_if_modified(|status| {
            if status.is_online == online {
                return false;
            }
            status.is_online = online;
            pipeline_info!("network {}", if online { "online" } else { "offline" });
            true
        });
    }

    /// Records fresh connection info and recomputes the slow flag.
    pub fn update_connection(&self, info: ConnectionInfo) {
        let slow = self.is_slow(&info);
        self.status.send_modify(|status| {
            status.effective_type = info.effective_type;
            status.downlink_mbps = info.downlink_mbps;
            status.rtt_ms = info.rtt_ms;
            status.is_slow_connection = slow;
        });
    }

    fn is_slow(&self, info: &ConnectionInfo) -> bool {
        matches!(
            info.effective_type,
            EffectiveType::Slow2g | EffectiveType::TwoG
        ) || info
            .downlink_mbps
            .is_some_and(|mbps| mbps < self.settings.slow_downlink_mbps)
            || info.rtt_ms.is_some_and(|rtt| rtt > self.settings.slow_rtt_ms)
    }

    /// Returns once the monitor reports online, polling at a fixed interval.
    /// Ends with the token's abort error if the token is cancelled first.
    pub async fn wait_for_online(&self, token: &OperationToken) -> Result<(), JobError> {
        let interval = Duration::from_millis(self.settings.online_poll_ms.max(1));
        let mut logged = false;
        loop {
            token.check()?;
            if self.is_online() {
                return Ok(());
            }
            if !logged {
                pipeline_debug!("{} waiting for connectivity", token.id());
                logged = true;
            }
            token.sleep(interval).await?;
        }
    }

    /// Periodically refreshes the status from `probe` until `token` is cancelled.
    pub fn spawn_probe_loop(
        &self,
        probe: Arc<dyn ConnectivityProbe>,
        token: OperationToken,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        let interval = Duration::from_millis(self.settings.probe_interval_ms.max(1));
        tokio::spawn(async move {
            loop {
                match token.run(async { Ok(probe.probe().await) }).await {
                    Ok(Ok(info)) => {
                        monitor.set_online(true);
                        monitor.update_connection(info);
                    }
                    Ok(Err(err)) => {
                        pipeline_warn!("connectivity probe failed: {}", err);
                        if err.kind.is_network() {
                            monitor.set_online(false);
                        }
                    }
                    Err(_) => break,
                }
                if token.sleep(interval).await.is_err() {
                    break;
                }
            }
            pipeline_debug!("probe loop {} stopped", token.id());
        })
    }
}

#[async_trait::async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> Result<ConnectionInfo, JobError>;
}

/// Times a request to a health URL. Any HTTP response counts as online.
pub struct HttpConnectivityProbe {
    client: reqwest::Client,
    url: url::Url,
}

impl HttpConnectivityProbe {
    pub fn new(health_url: &str, settings: &NetworkSettings) -> Result<Self, JobError> {
        let url = url::Url::parse(health_url)
            .map_err(|err| JobError::validation(format!("invalid health url: {err}")))?;
        let client = http::build_client(Duration::from_millis(settings.probe_timeout_ms))?;
        Ok(Self { client, url })
    }
}

#[async_trait::async_trait]
impl ConnectivityProbe for HttpConnectivityProbe {
    async fn probe(&self) -> Result<ConnectionInfo, JobError> {
        let started = Instant::now();
        let response = self
            .client
            .head(self.url.clone())
            .send()
            .await
            .map_err(http::map_reqwest_error)?;
        let rtt_ms = started.elapsed().as_millis() as u64;
        pipeline_debug!("probe {} -> {} in {}ms", self.url, response.status(), rtt_ms);
        Ok(ConnectionInfo {
            effective_type: EffectiveType::from_rtt(rtt_ms),
            downlink_mbps: None,
            rtt_ms: Some(rtt_ms),
        })
    }
}
