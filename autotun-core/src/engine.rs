//! Engine wiring
//!
//! [`Engine`] owns the stores and every orchestration component, runs the
//! background tasks and exposes the commands a UI or daemon calls.

use crate::config::{
    OrchestrationPolicy, SettingsStore, TunnelConf, TunnelRepository, MAX_DEBOUNCE_DELAY_SECS,
};
use crate::config::toml_config::TomlConfig;
use crate::error::{AutotunError, ConfigError};
use crate::network::NetworkState;
use crate::tunnel::{
    AutoTunnelService, DecisionArbiter, HandshakeStatus, HealthMonitor, KillSwitch,
    LifecycleController, LifecycleEvent, Notice, PingProbe, RecoveryAction, RecoveryError,
    RecoverySupervisor, StopReason, TunnelDriver, TunnelStatus,
};
use crate::types::TunnelId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One row of the status listing: every known tunnel, running or not
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelReport {
    pub id: TunnelId,
    pub name: String,
    pub status: TunnelStatus,
    pub handshake: Option<HandshakeStatus>,
    pub is_primary: bool,
    pub is_active: bool,
}

pub struct Engine {
    settings: SettingsStore,
    tunnels: TunnelRepository,
    policy: OrchestrationPolicy,
    network_tx: watch::Sender<Option<NetworkState>>,
    controller: Arc<LifecycleController>,
    monitor: Arc<HealthMonitor>,
    service: Arc<AutoTunnelService>,
    supervisor: Arc<RecoverySupervisor>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Wire the engine from a loaded configuration and concrete collaborators
    pub fn new(
        config: TomlConfig,
        driver: Arc<dyn TunnelDriver>,
        kill_switch: Arc<dyn KillSwitch>,
        probe: Arc<dyn PingProbe>,
    ) -> Result<Self, AutotunError> {
        config.validate()?;
        let TomlConfig {
            settings,
            policy,
            tunnels,
        } = config;

        let settings = SettingsStore::new(settings)?;
        let tunnels = TunnelRepository::new(tunnels)?;
        let (network_tx, network_rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        let controller = Arc::new(LifecycleController::new(
            Arc::clone(&driver),
            kill_switch,
            settings.clone(),
            tunnels.clone(),
            policy.clone(),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&controller),
            driver,
            probe,
            policy.clone(),
        ));
        let arbiter = DecisionArbiter::new(settings.clone(), tunnels.clone());
        let service = Arc::new(AutoTunnelService::new(
            arbiter.clone(),
            Arc::clone(&controller),
            network_rx,
            cancel.clone(),
        ));
        let supervisor = Arc::new(RecoverySupervisor::new(
            Arc::clone(&controller),
            Arc::clone(&service),
            arbiter,
            settings.clone(),
            policy.clone(),
        ));

        Ok(Self {
            settings,
            tunnels,
            policy,
            network_tx,
            controller,
            monitor,
            service,
            supervisor,
            cancel,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn tunnels(&self) -> &TunnelRepository {
        &self.tunnels
    }

    pub fn policy(&self) -> &OrchestrationPolicy {
        &self.policy
    }

    /// Spawn the health monitor and the recovery timer, then run the boot check
    pub async fn start(&self) -> Result<Vec<RecoveryAction>, RecoveryError> {
        {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            if tasks.is_empty() {
                let monitor = Arc::clone(&self.monitor);
                let token = self.cancel.child_token();
                tasks.push(tokio::spawn(async move { monitor.run(token).await }));

                let supervisor = Arc::clone(&self.supervisor);
                let token = self.cancel.child_token();
                tasks.push(tokio::spawn(async move { supervisor.run(token).await }));
            }
        }

        info!("Engine started, running boot recovery check");
        self.supervisor.check().await
    }

    /// Stop background work and bring every tunnel down
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        self.controller.shutdown().await;
        info!("Engine shut down");
    }

    /// Replace the current network snapshot
    pub fn publish_network_state(&self, state: NetworkState) {
        info!(network = %state, "Network state received");
        self.network_tx.send_replace(Some(state));
    }

    pub fn network_state(&self) -> Option<NetworkState> {
        self.network_tx.borrow().clone()
    }

    /// Start the named tunnel regardless of auto-tunnel
    pub async fn manual_start(&self, name: &str) -> Result<(), AutotunError> {
        let conf = self.lookup(name)?;
        self.controller.start(conf).await?;
        Ok(())
    }

    /// Stop the named tunnel
    pub async fn manual_stop(&self, name: &str, reason: StopReason) -> Result<(), AutotunError> {
        let conf = self.lookup(name)?;
        self.controller.stop(conf.id, reason).await?;
        Ok(())
    }

    /// Persist the toggle, then attach or detach the auto-tunnel service
    pub fn toggle_auto_tunnel(&self, enabled: bool) -> Result<(), AutotunError> {
        self.settings.update(|s| s.is_auto_tunnel_enabled = enabled)?;
        if enabled {
            self.service.attach();
        } else {
            self.service.detach();
        }
        info!(enabled, "Auto-tunnel toggled");
        Ok(())
    }

    pub fn set_debounce_delay(&self, seconds: u64) -> Result<(), AutotunError> {
        let delay = u8::try_from(seconds)
            .ok()
            .filter(|delay| *delay <= MAX_DEBOUNCE_DELAY_SECS)
            .ok_or(ConfigError::InvalidDebounceDelay { seconds })?;
        self.settings.update(|s| s.debounce_delay_seconds = delay)?;
        info!(seconds, "Debounce delay updated");
        Ok(())
    }

    /// Entry point for the OS scheduler; bounded by the recovery check timeout
    pub async fn run_recovery_check(&self) -> Result<Vec<RecoveryAction>, RecoveryError> {
        self.supervisor.check().await
    }

    pub fn last_recovery_success(&self) -> Option<DateTime<Utc>> {
        self.supervisor.last_success()
    }

    pub fn is_auto_tunnel_attached(&self) -> bool {
        self.service.is_attached()
    }

    pub async fn is_kill_switch_engaged(&self) -> bool {
        self.controller.is_kill_switch_engaged().await
    }

    /// Every configured tunnel with its current status and handshake health
    pub fn statuses(&self) -> Vec<TunnelReport> {
        let running = self.controller.status_snapshot();
        let handshakes = self.monitor.subscribe().borrow().clone();
        self.tunnels
            .all()
            .into_iter()
            .map(|conf| TunnelReport {
                status: running.get(&conf.id).copied().unwrap_or_default(),
                handshake: handshakes.get(&conf.id).copied(),
                id: conf.id,
                name: conf.name,
                is_primary: conf.is_primary,
                is_active: conf.is_active,
            })
            .collect()
    }

    /// Status of running tunnels; a tunnel missing from the map is `Down`
    pub fn subscribe_status(&self) -> watch::Receiver<BTreeMap<TunnelId, TunnelStatus>> {
        self.controller.subscribe_status()
    }

    pub fn subscribe_handshakes(&self) -> watch::Receiver<BTreeMap<TunnelId, HandshakeStatus>> {
        self.monitor.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.controller.subscribe_events()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.controller.subscribe_notices()
    }

    fn lookup(&self, name: &str) -> Result<TunnelConf, ConfigError> {
        self.tunnels
            .find_by_name(name)
            .ok_or_else(|| ConfigError::UnknownTunnel {
                name: name.to_string(),
            })
    }
}
