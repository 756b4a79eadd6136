//! Handshake health monitoring and optional HTTP reachability probing
//!
//! The lifecycle controller registers every tunnel that reaches `Up` and
//! unregisters it when it starts stopping. The monitor polls each registered
//! tunnel's last handshake on a fixed interval and asks the controller for a
//! PING restart once the handshake has been stale for enough consecutive
//! polls, at most once per cooldown window.

use crate::config::{OrchestrationPolicy, TunnelConf};
use crate::tunnel::controller::LifecycleController;
use crate::tunnel::driver::{TunnelDriver, TunnelHandle};
use crate::tunnel::events::Notice;
use crate::tunnel::handshake::{classify, HandshakeStatus};
use crate::types::TunnelId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// A tunnel the monitor is watching
#[derive(Debug, Clone)]
pub struct MonitoredTunnel {
    pub conf: TunnelConf,
    pub handle: TunnelHandle,
    pub up_since: DateTime<Utc>,
}

/// Set of Up tunnels shared between the controller and the monitor
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    inner: Arc<Mutex<BTreeMap<TunnelId, MonitoredTunnel>>>,
}

impl HealthRegistry {
    pub fn register(&self, tunnel: MonitoredTunnel) {
        debug!(tunnel = %tunnel.conf.name, "Registered for health monitoring");
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tunnel.conf.id, tunnel);
    }

    pub fn unregister(&self, id: TunnelId) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    pub fn snapshot(&self) -> Vec<MonitoredTunnel> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn contains(&self, id: TunnelId) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }
}

/// Result of a reachability probe
#[derive(Debug, Clone)]
pub struct ProbeResult {
    success: bool,
    duration: Duration,
    error: Option<String>,
}

impl ProbeResult {
    pub fn success(duration: Duration) -> Self {
        Self {
            success: true,
            duration,
            error: None,
        }
    }

    pub fn failure(duration: Duration, error: String) -> Self {
        Self {
            success: false,
            duration,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// Reachability check run through an Up tunnel
#[async_trait]
pub trait PingProbe: Send + Sync {
    async fn check(&self, target: &str) -> ProbeResult;
}

/// Errors that can occur while building a probe
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Invalid probe target: {0}")]
    InvalidUrl(String),

    #[error("HTTP client creation failed: {0}")]
    ClientCreationFailed(#[from] reqwest::Error),
}

/// Probes an HTTP/HTTPS endpoint; any 2xx or 3xx answer counts as reachable
#[derive(Debug)]
pub struct HttpProbe {
    client: Client,
    timeout: Duration,
}

impl HttpProbe {
    #[tracing::instrument(skip(timeout), fields(timeout_ms = timeout.as_millis()))]
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let client = Client::builder()
            .timeout(timeout)
            .use_rustls_tls()
            .build()?;
        Ok(Self { client, timeout })
    }

    fn parse_target(target: &str) -> Result<Url, ProbeError> {
        let url = Url::parse(target)
            .map_err(|e| ProbeError::InvalidUrl(format!("Failed to parse URL: {}", e)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            scheme => Err(ProbeError::InvalidUrl(format!(
                "Only HTTP/HTTPS schemes are supported, got: {}",
                scheme
            ))),
        }
    }
}

#[async_trait]
impl PingProbe for HttpProbe {
    #[tracing::instrument(skip(self))]
    async fn check(&self, target: &str) -> ProbeResult {
        let start = std::time::Instant::now();

        let url = match Self::parse_target(target) {
            Ok(url) => url,
            Err(e) => return ProbeResult::failure(start.elapsed(), e.to_string()),
        };

        match self.client.get(url).send().await {
            Ok(response) => {
                let duration = start.elapsed();
                let status = response.status();
                if status.is_success() || status.is_redirection() {
                    debug!(status = %status, duration_ms = duration.as_millis(), "Probe succeeded");
                    ProbeResult::success(duration)
                } else {
                    ProbeResult::failure(duration, format!("Unhealthy status code: {}", status))
                }
            }
            Err(e) => {
                let duration = start.elapsed();
                let error_msg = if e.is_timeout() {
                    format!("Request timeout after {:?}", self.timeout)
                } else if e.is_connect() {
                    "Connection refused or unreachable".to_string()
                } else {
                    format!("Request failed: {}", e)
                };
                ProbeResult::failure(duration, error_msg)
            }
        }
    }
}

/// Per-tunnel bookkeeping across polls
#[derive(Debug, Default)]
struct TunnelHealth {
    stale_polls: u32,
    ping_failures: u32,
    last_ping: Option<Instant>,
    last_restart: Option<Instant>,
    suppression_reported: bool,
}

/// Periodic handshake and ping supervisor for every Up tunnel
pub struct HealthMonitor {
    controller: Arc<LifecycleController>,
    driver: Arc<dyn TunnelDriver>,
    probe: Arc<dyn PingProbe>,
    registry: HealthRegistry,
    policy: OrchestrationPolicy,
    handshakes: watch::Sender<BTreeMap<TunnelId, HandshakeStatus>>,
    notices: broadcast::Sender<Notice>,
}

impl HealthMonitor {
    pub fn new(
        controller: Arc<LifecycleController>,
        driver: Arc<dyn TunnelDriver>,
        probe: Arc<dyn PingProbe>,
        policy: OrchestrationPolicy,
    ) -> Self {
        let (handshakes, _rx) = watch::channel(BTreeMap::new());
        Self {
            registry: controller.health_registry(),
            notices: controller.notice_sender(),
            controller,
            driver,
            probe,
            policy,
            handshakes,
        }
    }

    /// Handshake status per Up tunnel, refreshed on every poll
    pub fn subscribe(&self) -> watch::Receiver<BTreeMap<TunnelId, HandshakeStatus>> {
        self.handshakes.subscribe()
    }

    /// Poll until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.policy.handshake_poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut health: BTreeMap<TunnelId, TunnelHealth> = BTreeMap::new();

        info!(
            poll_secs = self.policy.handshake_poll_interval_secs,
            cooldown_secs = self.policy.restart_cooldown_secs,
            "Health monitor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Health monitor cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    self.poll_once(&mut health).await;
                }
            }
        }
    }

    /// One polling round over every registered tunnel
    #[tracing::instrument(skip_all)]
    async fn poll_once(&self, health: &mut BTreeMap<TunnelId, TunnelHealth>) {
        let tunnels = self.registry.snapshot();

        // Forget counters of tunnels that went away, but keep the restart
        // timestamp so the cooldown survives the restart itself.
        for (id, entry) in health.iter_mut() {
            if !tunnels.iter().any(|t| t.conf.id == *id) {
                entry.stale_polls = 0;
                entry.ping_failures = 0;
                entry.last_ping = None;
            }
        }

        let mut statuses = BTreeMap::new();

        for tunnel in tunnels {
            let status = match self.driver.last_handshake_timestamp(&tunnel.handle).await {
                Ok(last) => classify(last, tunnel.up_since, Utc::now()),
                Err(e) => {
                    debug!(tunnel = %tunnel.conf.name, "Handshake read failed: {}", e);
                    HandshakeStatus::Unknown
                }
            };
            statuses.insert(tunnel.conf.id, status);

            let entry = health.entry(tunnel.conf.id).or_default();
            entry.stale_polls = if status == HandshakeStatus::Stale {
                entry.stale_polls + 1
            } else {
                0
            };

            let mut wants_restart = entry.stale_polls >= self.policy.stale_polls_before_restart;
            if wants_restart {
                warn!(
                    tunnel = %tunnel.conf.name,
                    stale_polls = entry.stale_polls,
                    "Handshake is stale"
                );
            }

            if self.ping_due(&tunnel.conf, entry) {
                wants_restart |= self.ping(&tunnel.conf, entry).await;
            }

            if wants_restart {
                self.request_restart(&tunnel.conf, entry).await;
            }
        }

        // Restarted tunnels re-register under the same id before the next
        // poll, so only report what is still registered now.
        statuses.retain(|id, _| self.registry.contains(*id));
        self.handshakes.send_replace(statuses);
    }

    fn ping_due(&self, conf: &TunnelConf, entry: &TunnelHealth) -> bool {
        if !conf.is_ping_enabled || conf.ping_target.is_none() {
            return false;
        }
        entry.last_ping.map_or(true, |at| {
            at.elapsed() >= Duration::from_secs(conf.ping_interval_secs)
        })
    }

    /// Run the probe; true when the failure threshold is reached
    async fn ping(&self, conf: &TunnelConf, entry: &mut TunnelHealth) -> bool {
        let Some(target) = conf.ping_target.as_deref() else {
            return false;
        };
        entry.last_ping = Some(Instant::now());

        let result = self.probe.check(target).await;
        if result.is_success() {
            if entry.ping_failures > 0 {
                debug!(
                    tunnel = %conf.name,
                    "Probe succeeded after {} failures, resetting counter",
                    entry.ping_failures
                );
            }
            entry.ping_failures = 0;
            return false;
        }

        entry.ping_failures += 1;
        warn!(
            tunnel = %conf.name,
            failures = entry.ping_failures,
            threshold = conf.ping_failure_threshold,
            error = result.error().unwrap_or("unknown"),
            "Ping probe failed"
        );
        entry.ping_failures >= conf.ping_failure_threshold
    }

    async fn request_restart(&self, conf: &TunnelConf, entry: &mut TunnelHealth) {
        let cooldown = self.policy.restart_cooldown();

        if let Some(last) = entry.last_restart {
            let since = last.elapsed();
            if since < cooldown {
                let retry_in = (cooldown - since).as_secs();
                warn!(
                    tunnel = %conf.name,
                    retry_in_secs = retry_in,
                    "Tunnel unhealthy but restart is cooling down"
                );
                if !entry.suppression_reported {
                    entry.suppression_reported = true;
                    let _ = self.notices.send(Notice::RestartSuppressed {
                        tunnel: conf.name.clone(),
                        retry_in_secs: retry_in,
                    });
                }
                return;
            }
        }

        entry.last_restart = Some(Instant::now());
        entry.suppression_reported = false;
        entry.stale_polls = 0;
        entry.ping_failures = 0;
        entry.last_ping = None;

        info!(tunnel = %conf.name, "Restarting unhealthy tunnel");
        if let Err(e) = self.controller.restart(conf.id).await {
            warn!(tunnel = %conf.name, "Restart failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_probe_rejects_non_http_target() {
        assert!(HttpProbe::parse_target("ftp://example.com/").is_err());
        assert!(HttpProbe::parse_target("not a url")
            .unwrap_err()
            .to_string()
            .contains("parse URL"));
        assert!(HttpProbe::parse_target("https://example.com/health").is_ok());
    }

    #[test]
    fn test_probe_result() {
        let result = ProbeResult::failure(Duration::from_millis(456), "timeout".to_string());
        assert!(!result.is_success());
        assert_eq!(result.duration(), Duration::from_millis(456));
        assert_eq!(result.error(), Some("timeout"));
        assert!(ProbeResult::success(Duration::ZERO).error().is_none());
    }
}
