//! Tunnel lifecycle controller
//!
//! Sole owner of the set of running tunnels. Every start, stop and restart
//! runs to completion under one async mutex, which is what keeps kill-switch
//! rules and tunnel transitions from interleaving. Observers only ever see
//! the published status map and the ordered lifecycle event stream.
//!
//! A stop request for a tunnel that is still `Starting` does not wait for the
//! lock: it cancels the in-flight start first, which then unwinds to `Down`
//! and releases the lock.

use crate::config::{OrchestrationPolicy, SettingsStore, TunnelConf, TunnelRepository};
use crate::error::{TransitionPhase, TunnelError};
use crate::tunnel::driver::{TunnelDriver, TunnelHandle};
use crate::tunnel::events::{AutoTunnelEvent, Decision, KillSwitchEvent, LifecycleEvent, Notice};
use crate::tunnel::health::{HealthRegistry, MonitoredTunnel};
use crate::tunnel::kill_switch::{allowed_ips, KillSwitch};
use crate::tunnel::state::{StopReason, TunnelStatus};
use crate::types::TunnelId;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A failed transition the recovery supervisor may retry once
#[derive(Debug, Clone)]
pub enum PendingRetry {
    Start(TunnelConf),
    Stop(TunnelConf, TunnelHandle),
}

impl PendingRetry {
    pub fn tunnel_name(&self) -> &str {
        match self {
            PendingRetry::Start(conf) | PendingRetry::Stop(conf, _) => &conf.name,
        }
    }

    fn tunnel_id(&self) -> TunnelId {
        match self {
            PendingRetry::Start(conf) | PendingRetry::Stop(conf, _) => conf.id,
        }
    }
}

#[derive(Debug)]
struct ActiveTunnel {
    conf: TunnelConf,
    handle: Option<TunnelHandle>,
    status: TunnelStatus,
}

#[derive(Debug, Default)]
struct ControllerState {
    active: BTreeMap<TunnelId, ActiveTunnel>,
    /// Allowed IPs the kill switch is currently engaged with
    kill_switch: Option<Vec<String>>,
    pending_retry: Option<PendingRetry>,
}

impl ControllerState {
    /// Forget a queued retry that a newer transition has made stale
    fn discard_retry(&mut self, stale: impl Fn(&PendingRetry) -> bool) {
        if self.pending_retry.as_ref().is_some_and(stale) {
            if let Some(retry) = self.pending_retry.take() {
                debug!(tunnel = %retry.tunnel_name(), "Discarding superseded retry");
            }
        }
    }
}

/// Start in flight, cancellable by a concurrent stop
struct PendingStart {
    token: CancellationToken,
    reason: Option<StopReason>,
}

/// Applies decisions and manual commands to the tunnel driver
pub struct LifecycleController {
    driver: Arc<dyn TunnelDriver>,
    kill_switch: Arc<dyn KillSwitch>,
    settings: SettingsStore,
    tunnels: TunnelRepository,
    policy: OrchestrationPolicy,
    state: Mutex<ControllerState>,
    pending_starts: StdMutex<HashMap<TunnelId, PendingStart>>,
    shutting_down: AtomicBool,
    registry: HealthRegistry,
    status_tx: watch::Sender<BTreeMap<TunnelId, TunnelStatus>>,
    events_tx: broadcast::Sender<LifecycleEvent>,
    notices_tx: broadcast::Sender<Notice>,
}

impl LifecycleController {
    pub fn new(
        driver: Arc<dyn TunnelDriver>,
        kill_switch: Arc<dyn KillSwitch>,
        settings: SettingsStore,
        tunnels: TunnelRepository,
        policy: OrchestrationPolicy,
    ) -> Self {
        let (status_tx, _rx) = watch::channel(BTreeMap::new());
        let (events_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (notices_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            driver,
            kill_switch,
            settings,
            tunnels,
            policy,
            state: Mutex::new(ControllerState::default()),
            pending_starts: StdMutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            registry: HealthRegistry::default(),
            status_tx,
            events_tx,
            notices_tx,
        }
    }

    /// Status of every tunnel that is not `Down`
    pub fn subscribe_status(&self) -> watch::Receiver<BTreeMap<TunnelId, TunnelStatus>> {
        self.status_tx.subscribe()
    }

    pub fn status_snapshot(&self) -> BTreeMap<TunnelId, TunnelStatus> {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events_tx.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices_tx.subscribe()
    }

    pub(crate) fn notice_sender(&self) -> broadcast::Sender<Notice> {
        self.notices_tx.clone()
    }

    pub(crate) fn health_registry(&self) -> HealthRegistry {
        self.registry.clone()
    }

    /// Whether any tunnel is Up or Starting
    pub fn has_active_tunnel(&self) -> bool {
        self.status_tx
            .borrow()
            .values()
            .any(|status| status.is_active())
    }

    /// Whether the kill switch is currently engaged
    pub async fn is_kill_switch_engaged(&self) -> bool {
        self.state.lock().await.kill_switch.is_some()
    }

    /// Start a tunnel, engaging the kill switch first if the settings ask for it
    ///
    /// Idempotent: a tunnel already Up or Starting is left alone.
    #[tracing::instrument(skip(self, conf), fields(tunnel = %conf.name))]
    pub async fn start(&self, conf: TunnelConf) -> Result<(), TunnelError> {
        let settings = self.settings.snapshot();
        let kill_switch = settings
            .is_kill_switch_enabled
            .then(|| allowed_ips(settings.is_lan_traffic_exempt));
        self.start_with(conf, kill_switch).await
    }

    async fn start_with(
        &self,
        conf: TunnelConf,
        kill_switch: Option<Vec<String>>,
    ) -> Result<(), TunnelError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            debug!("Ignoring start during shutdown");
            return Ok(());
        }

        if !self.settings.snapshot().is_multi_tunnel_enabled {
            self.cancel_pending_starts(|id| id != conf.id, StopReason::ConfigChanged);
        }

        let mut state = self.state.lock().await;
        self.start_locked(&mut state, conf, kill_switch).await
    }

    /// Stop a tunnel
    ///
    /// Concurrent stops of the same tunnel collapse into one transition.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self, id: TunnelId, reason: StopReason) -> Result<(), TunnelError> {
        self.cancel_pending_starts(|pending| pending == id, reason);
        let mut state = self.state.lock().await;
        state.discard_retry(|retry| matches!(retry, PendingRetry::Start(conf) if conf.id == id));
        self.stop_locked(&mut state, id, reason, true).await
    }

    /// Stop every tunnel
    async fn stop_all_locked(
        &self,
        state: &mut ControllerState,
        reason: StopReason,
    ) -> Result<(), TunnelError> {
        // A failed start must not come back after everything was stopped
        state.discard_retry(|retry| matches!(retry, PendingRetry::Start(_)));
        let ids: Vec<TunnelId> = state.active.keys().copied().collect();
        let mut result = Ok(());
        for id in ids {
            if let Err(e) = self.stop_locked(state, id, reason, true).await {
                result = Err(e);
            }
        }
        result
    }

    /// Health-triggered restart: stop(PING) immediately followed by start
    ///
    /// The kill switch stays engaged across the restart.
    #[tracing::instrument(skip(self))]
    pub async fn restart(&self, id: TunnelId) -> Result<(), TunnelError> {
        let mut state = self.state.lock().await;

        let conf = match state.active.get(&id) {
            Some(active) if active.status.is_up() => active.conf.clone(),
            _ => {
                debug!("Tunnel {} is not up, skipping restart", id);
                return Ok(());
            }
        };
        let conf = self.tunnels.find_by_id(id).unwrap_or(conf);
        let kill_switch = state.kill_switch.clone();

        self.stop_locked(&mut state, id, StopReason::Ping, false).await?;
        self.start_locked(&mut state, conf, kill_switch).await
    }

    /// Apply one arbitrated decision
    #[tracing::instrument(skip(self, decision), fields(tunnel = %decision.tunnel))]
    pub async fn apply(&self, decision: Decision) -> Result<(), TunnelError> {
        let Decision {
            tunnel,
            kill_switch,
        } = decision;

        match tunnel {
            AutoTunnelEvent::Start(conf) => {
                let Some(conf) = conf.or_else(|| self.tunnels.primary_or_first()) else {
                    debug!("No tunnel to start");
                    return Ok(());
                };
                let ips = match kill_switch {
                    KillSwitchEvent::Start(ips) => Some(ips),
                    _ => None,
                };
                self.start_with(conf, ips).await
            }
            AutoTunnelEvent::Stop => {
                self.cancel_pending_starts(|_| true, StopReason::User);
                let mut state = self.state.lock().await;
                let result = self.stop_all_locked(&mut state, StopReason::User).await;
                if kill_switch == KillSwitchEvent::Stop && state.active.is_empty() {
                    self.release_kill_switch(&mut state).await;
                }
                result
            }
            AutoTunnelEvent::DoNothing => {
                let mut state = self.state.lock().await;
                match kill_switch {
                    KillSwitchEvent::Start(ips) => self.engage_kill_switch(&mut state, ips).await,
                    KillSwitchEvent::Stop if state.active.is_empty() => {
                        self.release_kill_switch(&mut state).await
                    }
                    _ => {}
                }
                Ok(())
            }
        }
    }

    /// Bring back what should be running when nothing is
    ///
    /// With auto-tunnel on, the last emitted decision is replayed (or, before
    /// any decision, the previously active tunnel else primary-or-first).
    /// Always-on VPN restores the same way with auto-tunnel off, and
    /// restore-on-boot brings back every tunnel flagged active.
    #[tracing::instrument(skip(self, last_decision))]
    pub async fn restore_previous_state(
        &self,
        last_decision: Option<Decision>,
    ) -> Result<(), TunnelError> {
        if self.has_active_tunnel() {
            debug!("A tunnel is already active, nothing to restore");
            return Ok(());
        }

        let settings = self.settings.snapshot();
        let default_kill_switch = settings
            .is_kill_switch_enabled
            .then(|| allowed_ips(settings.is_lan_traffic_exempt));

        let previous_or_primary = || {
            self.tunnels
                .find_active()
                .into_iter()
                .next()
                .or_else(|| self.tunnels.primary_or_first())
        };

        let targets: Vec<(TunnelConf, Option<Vec<String>>)> = if settings.is_auto_tunnel_enabled {
            match last_decision {
                Some(Decision {
                    tunnel: AutoTunnelEvent::Start(conf),
                    kill_switch,
                }) => {
                    let ips = match kill_switch {
                        KillSwitchEvent::Start(ips) => Some(ips),
                        _ => default_kill_switch,
                    };
                    conf.or_else(|| self.tunnels.primary_or_first())
                        .map(|conf| vec![(conf, ips)])
                        .unwrap_or_default()
                }
                Some(_) => {
                    debug!("Last decision was not a start, nothing to restore");
                    Vec::new()
                }
                None => previous_or_primary()
                    .map(|conf| vec![(conf, default_kill_switch)])
                    .unwrap_or_default(),
            }
        } else if settings.is_always_on_vpn_enabled {
            previous_or_primary()
                .map(|conf| vec![(conf, default_kill_switch)])
                .unwrap_or_default()
        } else if settings.is_restore_on_boot_enabled {
            let mut active = self.tunnels.find_active();
            if !settings.is_multi_tunnel_enabled {
                active.truncate(1);
            }
            active
                .into_iter()
                .map(|conf| (conf, default_kill_switch.clone()))
                .collect()
        } else {
            Vec::new()
        };

        if targets.is_empty() {
            return Ok(());
        }

        let mut result = Ok(());
        for (conf, ips) in targets {
            info!(tunnel = %conf.name, "Restoring tunnel");
            if let Err(e) = self.start_with(conf, ips).await {
                result = Err(e);
            }
        }
        result
    }

    /// Take the failure waiting for its one automatic retry
    pub async fn take_pending_retry(&self) -> Option<PendingRetry> {
        self.state.lock().await.pending_retry.take()
    }

    /// Retry a failed transition once; a second failure becomes a notice
    #[tracing::instrument(skip(self, retry), fields(tunnel = %retry.tunnel_name()))]
    pub async fn retry(&self, retry: PendingRetry) -> Result<(), TunnelError> {
        let name = retry.tunnel_name().to_string();
        let result = match retry {
            PendingRetry::Start(conf) => {
                let mut state = self.state.lock().await;
                let settings = self.settings.snapshot();
                let ips = settings
                    .is_kill_switch_enabled
                    .then(|| allowed_ips(settings.is_lan_traffic_exempt));
                let result = self.start_locked(&mut state, conf, ips).await;
                // The retry is the last automatic attempt
                state.pending_retry = None;
                result
            }
            PendingRetry::Stop(conf, handle) => {
                let state = self.state.lock().await;
                if state.active.contains_key(&conf.id) {
                    debug!(tunnel = %conf.name, "Tunnel was started again, dropping stop retry");
                    return Ok(());
                }
                let outcome =
                    timeout(self.policy.stop_timeout(), self.driver.bring_down(&handle)).await;
                drop(state);
                match outcome {
                    Ok(result) => result,
                    Err(_) => Err(TunnelError::Timeout {
                        tunnel: conf.name.clone(),
                        phase: TransitionPhase::Stopping,
                        seconds: self.policy.stop_timeout_secs,
                    }),
                }
            }
        };

        if let Err(e) = &result {
            if e.is_transient() {
                error!(tunnel = %name, "Retry failed: {}", e);
                let _ = self.notices_tx.send(Notice::RepeatedFailure {
                    tunnel: name,
                    message: e.to_string(),
                });
            }
        }
        result
    }

    /// Bring every tunnel down without touching the persisted active flags
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.cancel_pending_starts(|_| true, StopReason::User);

        let mut state = self.state.lock().await;
        let ids: Vec<TunnelId> = state.active.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.stop_locked(&mut state, id, StopReason::User, false).await {
                warn!("Failed to stop tunnel {} during shutdown: {}", id, e);
            }
        }
        self.release_kill_switch(&mut state).await;
        info!("Lifecycle controller shut down");
    }

    fn cancel_pending_starts(&self, selector: impl Fn(TunnelId) -> bool, reason: StopReason) {
        let mut pending = self
            .pending_starts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (id, start) in pending.iter_mut().filter(|(id, _)| selector(**id)) {
            debug!("Cancelling in-flight start of tunnel {}", id);
            start.reason = Some(reason);
            start.token.cancel();
        }
    }

    async fn start_locked(
        &self,
        state: &mut ControllerState,
        conf: TunnelConf,
        kill_switch: Option<Vec<String>>,
    ) -> Result<(), TunnelError> {
        let id = conf.id;

        if let Some(active) = state.active.get(&id) {
            if active.status.is_active() {
                debug!(
                    tunnel = %conf.name,
                    status = %active.status,
                    "Already active, start is a no-op"
                );
                return Ok(());
            }
        }

        let exclusive = !self.settings.snapshot().is_multi_tunnel_enabled;
        // This start supersedes any queued retry for the same tunnel, and in
        // exclusive mode any queued start of another one.
        state.discard_retry(|retry| {
            retry.tunnel_id() == id || (exclusive && matches!(retry, PendingRetry::Start(_)))
        });

        if exclusive {
            let others: Vec<TunnelId> = state
                .active
                .keys()
                .copied()
                .filter(|other| *other != id)
                .collect();
            for other in others {
                // The other tunnel is Down either way; its teardown failure
                // is already queued for retry.
                if let Err(e) = self
                    .stop_locked(state, other, StopReason::ConfigChanged, false)
                    .await
                {
                    warn!("Failed to stop tunnel {} before switching: {}", other, e);
                }
            }
        }

        if let Some(ips) = kill_switch {
            self.engage_kill_switch(state, ips).await;
        }

        let token = CancellationToken::new();
        self.pending_starts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                PendingStart {
                    token: token.clone(),
                    reason: None,
                },
            );

        state.active.insert(
            id,
            ActiveTunnel {
                conf: conf.clone(),
                handle: None,
                status: TunnelStatus::Down,
            },
        );
        self.set_status(state, id, TunnelStatus::Starting);

        let start_timeout = self.policy.start_timeout();
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(TunnelError::Cancelled { tunnel: conf.name.clone() }),
            result = timeout(start_timeout, self.driver.bring_up(&conf)) => match result {
                Ok(result) => result,
                Err(_) => Err(TunnelError::Timeout {
                    tunnel: conf.name.clone(),
                    phase: TransitionPhase::Starting,
                    seconds: self.policy.start_timeout_secs,
                }),
            },
        };

        let cancel_reason = self
            .pending_starts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .and_then(|pending| pending.reason);

        match outcome {
            Ok(handle) => {
                let up_since = Utc::now();
                if let Some(active) = state.active.get_mut(&id) {
                    active.handle = Some(handle.clone());
                }
                self.set_status(state, id, TunnelStatus::Up);
                self.registry.register(MonitoredTunnel {
                    conf: conf.clone(),
                    handle,
                    up_since,
                });
                self.tunnels.set_active(id, true);
                info!(tunnel = %conf.name, "Tunnel is up");
                Ok(())
            }
            Err(e) => {
                if let Some(reason) = cancel_reason {
                    self.set_status(state, id, TunnelStatus::Stopping(reason));
                    info!(tunnel = %conf.name, %reason, "Start cancelled");
                }
                self.set_status(state, id, TunnelStatus::Down);
                state.active.remove(&id);

                // Roll back so a failed start never leaves traffic blocked
                // with no tunnel to carry it.
                if state.active.is_empty()
                    && !self.settings.snapshot().is_kill_switch_without_vpn_enabled
                {
                    self.release_kill_switch(state).await;
                }

                self.record_failure(state, &conf, &e, PendingRetry::Start(conf.clone()));
                Err(e)
            }
        }
    }

    async fn stop_locked(
        &self,
        state: &mut ControllerState,
        id: TunnelId,
        reason: StopReason,
        release_kill_switch: bool,
    ) -> Result<(), TunnelError> {
        let (conf, handle) = match state.active.get(&id) {
            Some(active) if active.status.is_up() => (active.conf.clone(), active.handle.clone()),
            Some(active) => {
                debug!("Tunnel {} is {}, stop is a no-op", id, active.status);
                return Ok(());
            }
            None => {
                debug!("Tunnel {} is not running, stop is a no-op", id);
                return Ok(());
            }
        };

        self.set_status(state, id, TunnelStatus::Stopping(reason));
        self.registry.unregister(id);

        let result = match &handle {
            Some(handle) => {
                match timeout(self.policy.stop_timeout(), self.driver.bring_down(handle)).await {
                    Ok(result) => result,
                    Err(_) => Err(TunnelError::Timeout {
                        tunnel: conf.name.clone(),
                        phase: TransitionPhase::Stopping,
                        seconds: self.policy.stop_timeout_secs,
                    }),
                }
            }
            None => Ok(()),
        };

        // Down regardless of the outcome; a stuck teardown is retried later.
        self.set_status(state, id, TunnelStatus::Down);
        state.active.remove(&id);
        info!(tunnel = %conf.name, %reason, "Tunnel is down");

        if reason != StopReason::Ping && !self.shutting_down.load(Ordering::SeqCst) {
            self.tunnels.set_active(id, false);
        }

        if release_kill_switch
            && state.active.is_empty()
            && !self.settings.snapshot().is_kill_switch_without_vpn_enabled
        {
            self.release_kill_switch(state).await;
        }

        if let (Err(e), Some(handle)) = (&result, handle) {
            self.record_failure(state, &conf, e, PendingRetry::Stop(conf.clone(), handle));
        }
        result
    }

    fn record_failure(
        &self,
        state: &mut ControllerState,
        conf: &TunnelConf,
        error: &TunnelError,
        retry: PendingRetry,
    ) {
        if error.is_configuration() {
            error!(tunnel = %conf.name, "Configuration error: {}", error);
            let _ = self.notices_tx.send(Notice::ConfigurationError {
                tunnel: conf.name.clone(),
                message: error.to_string(),
            });
        } else if error.is_transient() {
            warn!(tunnel = %conf.name, "Transient failure, will retry once: {}", error);
            state.pending_retry = Some(retry);
        } else {
            debug!(tunnel = %conf.name, "Transition ended: {}", error);
        }
    }

    async fn engage_kill_switch(&self, state: &mut ControllerState, ips: Vec<String>) {
        if state.kill_switch.as_ref() == Some(&ips) {
            debug!("Kill switch already engaged with the same ranges");
            return;
        }
        match self.kill_switch.engage(&ips).await {
            Ok(()) => {
                state.kill_switch = Some(ips.clone());
                self.emit(LifecycleEvent::KillSwitch {
                    event: KillSwitchEvent::Start(ips),
                    at: Utc::now(),
                });
            }
            Err(e) => {
                error!("Failed to engage kill switch: {}", e);
                let _ = self.notices_tx.send(Notice::KillSwitchFailure {
                    message: e.to_string(),
                });
            }
        }
    }

    async fn release_kill_switch(&self, state: &mut ControllerState) {
        if state.kill_switch.is_none() {
            return;
        }
        match self.kill_switch.release().await {
            Ok(()) => {
                state.kill_switch = None;
                self.emit(LifecycleEvent::KillSwitch {
                    event: KillSwitchEvent::Stop,
                    at: Utc::now(),
                });
            }
            Err(e) => {
                error!("Failed to release kill switch: {}", e);
                let _ = self.notices_tx.send(Notice::KillSwitchFailure {
                    message: e.to_string(),
                });
            }
        }
    }

    fn set_status(&self, state: &mut ControllerState, id: TunnelId, status: TunnelStatus) {
        if let Some(active) = state.active.get_mut(&id) {
            if !active.status.can_transition_to(status) {
                warn!(
                    "Unexpected transition of tunnel {}: {} -> {}",
                    id, active.status, status
                );
            }
            active.status = status;
        }

        self.status_tx.send_modify(|map| {
            if status == TunnelStatus::Down {
                map.remove(&id);
            } else {
                map.insert(id, status);
            }
        });
        self.emit(LifecycleEvent::Status {
            tunnel_id: id,
            status,
            at: Utc::now(),
        });
    }

    fn emit(&self, event: LifecycleEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }
}
