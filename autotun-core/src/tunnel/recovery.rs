//! Recovery supervisor
//!
//! A coarse, idempotent check-then-act pass: make sure the auto-tunnel
//! service is attached when it should be, bring back a tunnel when nothing
//! runs, and give the last transient failure its one retry. Runs at boot,
//! on a periodic timer, and whenever the OS scheduler pokes the daemon.

use crate::config::{OrchestrationPolicy, SettingsStore};
use crate::error::TunnelError;
use crate::tunnel::arbiter::DecisionArbiter;
use crate::tunnel::controller::{LifecycleController, PendingRetry};
use crate::tunnel::service::AutoTunnelService;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a check did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "tunnel", rename_all = "snake_case")]
pub enum RecoveryAction {
    AttachedService,
    DetachedService,
    RestoredState,
    RetriedStart(String),
    RetriedStop(String),
}

/// Errors surfaced by a recovery check
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("Recovery check did not finish within {seconds} seconds")]
    TimedOut { seconds: u64 },

    #[error("Recovery task failed: {0}")]
    TaskFailed(String),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

pub struct RecoverySupervisor {
    controller: Arc<LifecycleController>,
    service: Arc<AutoTunnelService>,
    arbiter: DecisionArbiter,
    settings: SettingsStore,
    policy: OrchestrationPolicy,
    last_success: Mutex<Option<DateTime<Utc>>>,
}

impl RecoverySupervisor {
    pub fn new(
        controller: Arc<LifecycleController>,
        service: Arc<AutoTunnelService>,
        arbiter: DecisionArbiter,
        settings: SettingsStore,
        policy: OrchestrationPolicy,
    ) -> Self {
        Self {
            controller,
            service,
            arbiter,
            settings,
            policy,
            last_success: Mutex::new(None),
        }
    }

    /// Time of the last check that completed without error
    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        *self.last_success.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one bounded check
    ///
    /// Safe to call at any time; with everything already in place it has no
    /// side effect. The work runs on its own task: running over the bound
    /// only ends the wait, never a transition halfway through.
    #[tracing::instrument(skip(self))]
    pub async fn check(&self) -> Result<Vec<RecoveryAction>, RecoveryError> {
        let work = tokio::spawn(recover(
            Arc::clone(&self.controller),
            Arc::clone(&self.service),
            self.arbiter.clone(),
            self.settings.clone(),
        ));

        let bound = self.policy.recovery_check_timeout();
        let actions = tokio::time::timeout(bound, work)
            .await
            .map_err(|_| RecoveryError::TimedOut {
                seconds: self.policy.recovery_check_timeout_secs,
            })?
            .map_err(|e| RecoveryError::TaskFailed(e.to_string()))??;

        *self.last_success.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        if actions.is_empty() {
            debug!("Recovery check: nothing to do");
        } else {
            info!(?actions, "Recovery check acted");
        }
        Ok(actions)
    }

    /// Check on every recovery interval until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.policy.recovery_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The boot check is run explicitly by the engine
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.check().await {
                        warn!("Periodic recovery check failed: {}", e);
                    }
                }
            }
        }
    }
}

async fn recover(
    controller: Arc<LifecycleController>,
    service: Arc<AutoTunnelService>,
    arbiter: DecisionArbiter,
    settings: SettingsStore,
) -> Result<Vec<RecoveryAction>, RecoveryError> {
    let settings = settings.snapshot();
    let mut actions = Vec::new();

    let mut restore = !controller.has_active_tunnel();
    if settings.is_auto_tunnel_enabled && !service.is_attached() {
        service.attach();
        actions.push(RecoveryAction::AttachedService);
        // With a snapshot the arbiter decides; without one nothing else will
        // bring the tunnel back.
        restore &= !service.has_network_snapshot();
    } else if !settings.is_auto_tunnel_enabled && service.is_attached() {
        service.detach();
        actions.push(RecoveryAction::DetachedService);
        restore = false;
    }

    if restore && !controller.has_active_tunnel() {
        controller
            .restore_previous_state(arbiter.last_decision())
            .await?;
        if controller.has_active_tunnel() {
            actions.push(RecoveryAction::RestoredState);
        }
    }

    if let Some(retry) = controller.take_pending_retry().await {
        let action = match &retry {
            PendingRetry::Start(conf) => RecoveryAction::RetriedStart(conf.name.clone()),
            PendingRetry::Stop(conf, _) => RecoveryAction::RetriedStop(conf.name.clone()),
        };
        actions.push(action);
        controller.retry(retry).await?;
    }

    Ok(actions)
}
