//! Shared fakes for the integration tests
//!
//! The recording driver and kill switch append to one journal so tests can
//! assert on the order of side effects across both.

#![allow(dead_code)]

use async_trait::async_trait;
use autotun_core::config::toml_config::TomlConfig;
use autotun_core::config::{OrchestrationPolicy, Settings, SettingsStore, TunnelConf, TunnelRepository};
use autotun_core::engine::Engine;
use autotun_core::error::{KillSwitchError, TunnelError};
use autotun_core::tunnel::{
    LifecycleController, PingProbe, ProbeResult, TunnelDriver, TunnelHandle, TunnelStatus,
};
use autotun_core::tunnel::kill_switch::KillSwitch;
use autotun_core::types::TunnelId;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

pub const WG_CONFIG: &str = "[Interface]\nPrivateKey = aGVsbG8td29ybGQtcHJpdmF0ZS1rZXktYmFzZTY0PQ==\nAddress = 10.0.0.2/32\n\n[Peer]\nPublicKey = cGVlci1wdWJsaWMta2V5LWJhc2U2NC1lbmNvZGVkPQ==\nEndpoint = vpn.example.com:51820\nAllowedIPs = 0.0.0.0/0\n";

/// A tunnel with valid config material and no flags
pub fn tunnel(id: u32, name: &str) -> TunnelConf {
    TunnelConf::new(id, name, WG_CONFIG)
}

/// Side effect observed by a fake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Up(String),
    Down(String),
    Engage(Vec<String>),
    Release,
}

#[derive(Debug, Default)]
pub struct Journal {
    calls: Mutex<Vec<Call>>,
}

impl Journal {
    pub fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    pub fn position(&self, call: &Call) -> Option<usize> {
        self.calls.lock().unwrap().iter().position(|c| c == call)
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

/// What the fake driver reports for a tunnel's last handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Fresh,
    /// This many seconds ago
    Aged(i64),
    Never,
    Unreadable,
}

pub struct RecordingDriver {
    journal: Arc<Journal>,
    up_delay: Mutex<Duration>,
    up_failures: Mutex<VecDeque<TunnelError>>,
    down_failures: Mutex<VecDeque<TunnelError>>,
    handshakes: Mutex<HashMap<TunnelId, Handshake>>,
}

impl RecordingDriver {
    pub fn new(journal: Arc<Journal>) -> Self {
        Self {
            journal,
            up_delay: Mutex::new(Duration::ZERO),
            up_failures: Mutex::new(VecDeque::new()),
            down_failures: Mutex::new(VecDeque::new()),
            handshakes: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_up_delay(&self, delay: Duration) {
        *self.up_delay.lock().unwrap() = delay;
    }

    pub fn fail_next_up(&self, error: TunnelError) {
        self.up_failures.lock().unwrap().push_back(error);
    }

    pub fn fail_next_down(&self, error: TunnelError) {
        self.down_failures.lock().unwrap().push_back(error);
    }

    pub fn set_handshake(&self, id: u32, handshake: Handshake) {
        self.handshakes.lock().unwrap().insert(TunnelId(id), handshake);
    }
}

#[async_trait]
impl TunnelDriver for RecordingDriver {
    async fn bring_up(&self, conf: &TunnelConf) -> Result<TunnelHandle, TunnelError> {
        let delay = *self.up_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.up_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.journal.record(Call::Up(conf.name.clone()));
        Ok(TunnelHandle {
            tunnel_id: conf.id,
            interface: conf.name.clone(),
            config_path: PathBuf::from(format!("/run/autotun/{}.conf", conf.name)),
        })
    }

    async fn bring_down(&self, handle: &TunnelHandle) -> Result<(), TunnelError> {
        if let Some(error) = self.down_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.journal.record(Call::Down(handle.interface.clone()));
        Ok(())
    }

    async fn last_handshake_timestamp(
        &self,
        handle: &TunnelHandle,
    ) -> Result<Option<DateTime<Utc>>, TunnelError> {
        let handshake = self
            .handshakes
            .lock()
            .unwrap()
            .get(&handle.tunnel_id)
            .copied()
            .unwrap_or(Handshake::Fresh);
        match handshake {
            Handshake::Fresh => Ok(Some(Utc::now())),
            Handshake::Aged(secs) => Ok(Some(Utc::now() - chrono::Duration::seconds(secs))),
            Handshake::Never => Ok(None),
            Handshake::Unreadable => Err(TunnelError::HandshakeReadFailed {
                tunnel: handle.interface.clone(),
                reason: "wg exited with status 1".to_string(),
            }),
        }
    }
}

pub struct RecordingKillSwitch {
    journal: Arc<Journal>,
    fail_engage: Mutex<bool>,
}

impl RecordingKillSwitch {
    pub fn new(journal: Arc<Journal>) -> Self {
        Self {
            journal,
            fail_engage: Mutex::new(false),
        }
    }

    pub fn set_fail_engage(&self, fail: bool) {
        *self.fail_engage.lock().unwrap() = fail;
    }
}

#[async_trait]
impl KillSwitch for RecordingKillSwitch {
    async fn engage(&self, allowed_ips: &[String]) -> Result<(), KillSwitchError> {
        if *self.fail_engage.lock().unwrap() {
            return Err(KillSwitchError::EngageFailed {
                reason: "nft exited with status 1".to_string(),
            });
        }
        self.journal.record(Call::Engage(allowed_ips.to_vec()));
        Ok(())
    }

    async fn release(&self) -> Result<(), KillSwitchError> {
        self.journal.record(Call::Release);
        Ok(())
    }
}

/// Probe answering from a script, succeeding once the script runs out
#[derive(Default)]
pub struct ScriptedProbe {
    script: Mutex<VecDeque<bool>>,
    targets: Mutex<Vec<String>>,
}

impl ScriptedProbe {
    pub fn push(&self, results: &[bool]) {
        self.script.lock().unwrap().extend(results.iter().copied());
    }

    pub fn checks(&self) -> usize {
        self.targets.lock().unwrap().len()
    }
}

#[async_trait]
impl PingProbe for ScriptedProbe {
    async fn check(&self, target: &str) -> ProbeResult {
        self.targets.lock().unwrap().push(target.to_string());
        match self.script.lock().unwrap().pop_front() {
            Some(false) => ProbeResult::failure(Duration::from_millis(5), "connection refused".to_string()),
            _ => ProbeResult::success(Duration::from_millis(5)),
        }
    }
}

/// Every fake, sharing one journal
pub struct Fakes {
    pub journal: Arc<Journal>,
    pub driver: Arc<RecordingDriver>,
    pub kill_switch: Arc<RecordingKillSwitch>,
    pub probe: Arc<ScriptedProbe>,
}

impl Fakes {
    pub fn new() -> Self {
        let journal = Arc::new(Journal::default());
        Self {
            driver: Arc::new(RecordingDriver::new(Arc::clone(&journal))),
            kill_switch: Arc::new(RecordingKillSwitch::new(Arc::clone(&journal))),
            probe: Arc::new(ScriptedProbe::default()),
            journal,
        }
    }
}

/// Controller plus the stores it reads, wired to fakes
pub struct ControllerHarness {
    pub controller: Arc<LifecycleController>,
    pub settings: SettingsStore,
    pub tunnels: TunnelRepository,
    pub fakes: Fakes,
}

pub fn controller_with(settings: Settings, tunnels: Vec<TunnelConf>) -> ControllerHarness {
    let fakes = Fakes::new();
    let settings = SettingsStore::new(settings).unwrap();
    let tunnels = TunnelRepository::new(tunnels).unwrap();
    let controller = Arc::new(LifecycleController::new(
        fakes.driver.clone(),
        fakes.kill_switch.clone(),
        settings.clone(),
        tunnels.clone(),
        OrchestrationPolicy::default(),
    ));
    ControllerHarness {
        controller,
        settings,
        tunnels,
        fakes,
    }
}

pub fn engine_with(config: TomlConfig) -> (Engine, Fakes) {
    let fakes = Fakes::new();
    let engine = Engine::new(
        config,
        fakes.driver.clone(),
        fakes.kill_switch.clone(),
        fakes.probe.clone(),
    )
    .unwrap();
    (engine, fakes)
}

/// Settings with auto-tunnel on, immediate decisions, and the given trusted SSIDs
pub fn auto_settings(trusted: &[&str]) -> Settings {
    Settings {
        is_auto_tunnel_enabled: true,
        debounce_delay_seconds: 0,
        trusted_network_ssids: trusted.iter().map(|s| s.to_string()).collect(),
        ..Settings::default()
    }
}

/// Wait until the status map satisfies `done`
pub async fn wait_for_status<F>(rx: &mut watch::Receiver<BTreeMap<TunnelId, TunnelStatus>>, done: F)
where
    F: Fn(&BTreeMap<TunnelId, TunnelStatus>) -> bool,
{
    tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|map| done(map)))
        .await
        .expect("status did not settle in time")
        .expect("status channel closed");
}

/// Wait until the journal holds `count` occurrences of `call`
pub async fn wait_for_call(journal: &Journal, call: &Call, count: usize) {
    tokio::time::timeout(Duration::from_secs(60), async {
        while journal.count(call) < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("call was not observed in time");
}
