//! Decision arbiter
//!
//! Turns the latest network snapshot, the settings and the tunnel set into
//! one `Decision`. `decide` is pure; `DecisionArbiter::run` wraps it in a
//! restartable debounce timer so only the freshest snapshot at fire time is
//! ever acted on.

use crate::config::{Settings, SettingsStore, TunnelConf, TunnelRepository};
use crate::network::{best_match, NetworkState};
use crate::tunnel::events::{AutoTunnelEvent, Decision, KillSwitchEvent};
use crate::tunnel::kill_switch::allowed_ips;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Arbitrate one decision cycle
///
/// Never fails: a missing qualifying tunnel degrades to `DoNothing`.
pub fn decide(network: &NetworkState, settings: &Settings, tunnels: &[TunnelConf]) -> Decision {
    let tunnel = decide_tunnel(network, settings, tunnels);

    let kill_switch = match &tunnel {
        AutoTunnelEvent::Start(_) if settings.is_kill_switch_enabled => {
            KillSwitchEvent::Start(allowed_ips(settings.is_lan_traffic_exempt))
        }
        AutoTunnelEvent::Stop if !settings.is_kill_switch_without_vpn_enabled => {
            KillSwitchEvent::Stop
        }
        _ => KillSwitchEvent::DoNothing,
    };

    Decision {
        tunnel,
        kill_switch,
    }
}

fn decide_tunnel(
    network: &NetworkState,
    settings: &Settings,
    tunnels: &[TunnelConf],
) -> AutoTunnelEvent {
    if !settings.is_auto_tunnel_enabled || tunnels.is_empty() {
        return AutoTunnelEvent::DoNothing;
    }

    if settings.is_tunnel_on_ethernet_enabled && network.is_ethernet_connected {
        if let Some(conf) = tunnels.iter().find(|t| t.is_ethernet_tunnel) {
            return AutoTunnelEvent::Start(Some(conf.clone()));
        }
    }

    let ssid = network.ssid.as_deref();

    if settings.is_tunnel_on_wifi_enabled && network.wifi_connected {
        if let Some(ssid) = ssid {
            if let Some(conf) = bound_to_ssid(tunnels, ssid, settings.is_wildcards_enabled) {
                return AutoTunnelEvent::Start(Some(conf.clone()));
            }
            if settings.is_trusted(ssid) {
                return AutoTunnelEvent::Stop;
            }
        }
    }

    if settings.is_tunnel_on_mobile_data_enabled && network.is_mobile_data_connected {
        if let Some(conf) = tunnels.iter().find(|t| t.is_mobile_data_tunnel) {
            return AutoTunnelEvent::Start(Some(conf.clone()));
        }
    }

    let untrusted_wifi = network.wifi_connected && !ssid.is_some_and(|s| settings.is_trusted(s));
    if untrusted_wifi {
        if !network.has_internet && settings.is_stop_on_no_internet_enabled {
            return AutoTunnelEvent::Stop;
        }
        return AutoTunnelEvent::Start(None);
    }

    AutoTunnelEvent::Stop
}

/// Tunnel explicitly bound to the SSID: exact beats wildcard, then insertion order
fn bound_to_ssid<'a>(
    tunnels: &'a [TunnelConf],
    ssid: &str,
    wildcards: bool,
) -> Option<&'a TunnelConf> {
    tunnels
        .iter()
        .enumerate()
        .filter_map(|(index, conf)| {
            best_match(&conf.tunnel_networks, ssid, wildcards).map(|rank| (rank, index, conf))
        })
        .min_by_key(|(rank, index, _)| (*rank, *index))
        .map(|(_, _, conf)| conf)
}

/// Inputs of the last evaluation; a fire with identical inputs emits nothing
#[derive(PartialEq)]
struct Inputs {
    network: NetworkState,
    settings: Settings,
    tunnels: Vec<TunnelConf>,
}

/// Debounced decision stage
#[derive(Clone)]
pub struct DecisionArbiter {
    settings: SettingsStore,
    tunnels: TunnelRepository,
    last_decision: Arc<watch::Sender<Option<Decision>>>,
}

impl DecisionArbiter {
    pub fn new(settings: SettingsStore, tunnels: TunnelRepository) -> Self {
        let (last_decision, _rx) = watch::channel(None);
        Self {
            settings,
            tunnels,
            last_decision: Arc::new(last_decision),
        }
    }

    /// Last decision that was emitted, if any
    pub fn last_decision(&self) -> Option<Decision> {
        self.last_decision.borrow().clone()
    }

    pub fn subscribe_decisions(&self) -> watch::Receiver<Option<Decision>> {
        self.last_decision.subscribe()
    }

    fn snapshot(&self, network: NetworkState) -> Inputs {
        // The controller flips is_active as a consequence of our own
        // decisions; it must not count as a new input.
        let tunnels = self
            .tunnels
            .all()
            .into_iter()
            .map(|mut conf| {
                conf.is_active = false;
                conf
            })
            .collect();
        Inputs {
            network,
            settings: self.settings.snapshot(),
            tunnels,
        }
    }

    /// Evaluate now, returning a decision worth emitting
    fn evaluate(
        &self,
        network: &watch::Receiver<Option<NetworkState>>,
        last: &mut Option<Inputs>,
    ) -> Option<Decision> {
        let current = network.borrow().clone()?;
        let inputs = self.snapshot(current);

        if last.as_ref() == Some(&inputs) {
            debug!("Inputs unchanged since last evaluation, nothing to emit");
            return None;
        }

        let decision = decide(&inputs.network, &inputs.settings, &inputs.tunnels);
        debug!(network = %inputs.network, tunnel = %decision.tunnel, "Evaluated network state");
        *last = Some(inputs);

        if decision.is_noop() {
            return None;
        }
        Some(decision)
    }

    /// Run the debounce loop until cancelled or the receiver goes away
    ///
    /// Every change of the network, settings or tunnel set restarts the
    /// timer; a delay of zero evaluates on the spot.
    pub async fn run(
        &self,
        mut network: watch::Receiver<Option<NetworkState>>,
        decisions: mpsc::Sender<Decision>,
        cancel: CancellationToken,
    ) {
        let mut settings_rx = self.settings.subscribe();
        let mut tunnels_rx = self.tunnels.subscribe();
        let mut last: Option<Inputs> = None;
        let mut deadline: Option<Instant> = None;

        // A snapshot published before we attached still counts.
        let mut pending = network.borrow_and_update().is_some();

        loop {
            if pending {
                pending = false;
                let delay = Duration::from_secs(u64::from(
                    self.settings.snapshot().debounce_delay_seconds,
                ));
                if delay.is_zero() {
                    deadline = None;
                    if let Some(decision) = self.evaluate(&network, &mut last) {
                        if !self.emit(decision, &decisions).await {
                            break;
                        }
                    }
                } else {
                    deadline = Some(Instant::now() + delay);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Arbiter cancelled");
                    break;
                }
                changed = network.changed() => {
                    if changed.is_err() {
                        debug!("Network source closed, arbiter stopping");
                        break;
                    }
                    pending = true;
                }
                Ok(()) = settings_rx.changed() => {
                    pending = true;
                }
                Ok(()) = tunnels_rx.changed() => {
                    pending = true;
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    if let Some(decision) = self.evaluate(&network, &mut last) {
                        if !self.emit(decision, &decisions).await {
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn emit(&self, decision: Decision, decisions: &mpsc::Sender<Decision>) -> bool {
        info!(tunnel = %decision.tunnel, kill_switch = ?decision.kill_switch, "Auto-tunnel decision");
        self.last_decision.send_replace(Some(decision.clone()));
        decisions.send(decision).await.is_ok()
    }
}
