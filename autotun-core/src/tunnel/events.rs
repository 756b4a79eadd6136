//! Events flowing between the arbiter, the lifecycle controller and observers

use crate::config::TunnelConf;
use crate::tunnel::state::TunnelStatus;
use crate::types::TunnelId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the auto-tunnel should do with the tunnel set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoTunnelEvent {
    /// Bring a tunnel up; `None` means primary-or-first
    Start(Option<TunnelConf>),
    Stop,
    DoNothing,
}

impl AutoTunnelEvent {
    pub fn is_start(&self) -> bool {
        matches!(self, AutoTunnelEvent::Start(_))
    }
}

impl std::fmt::Display for AutoTunnelEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AutoTunnelEvent::Start(Some(conf)) => write!(f, "start({})", conf.name),
            AutoTunnelEvent::Start(None) => write!(f, "start(primary-or-first)"),
            AutoTunnelEvent::Stop => write!(f, "stop"),
            AutoTunnelEvent::DoNothing => write!(f, "do-nothing"),
        }
    }
}

/// What the kill switch should do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "allowed_ips", rename_all = "snake_case")]
pub enum KillSwitchEvent {
    /// Block everything outside the tunnel, letting `allowed_ips` through it
    Start(Vec<String>),
    Stop,
    DoNothing,
}

/// One arbitrated outcome of a decision cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub tunnel: AutoTunnelEvent,
    pub kill_switch: KillSwitchEvent,
}

impl Decision {
    pub fn nothing() -> Self {
        Self {
            tunnel: AutoTunnelEvent::DoNothing,
            kill_switch: KillSwitchEvent::DoNothing,
        }
    }

    /// Neither the tunnel nor the kill switch is asked to change
    pub fn is_noop(&self) -> bool {
        self.tunnel == AutoTunnelEvent::DoNothing && self.kill_switch == KillSwitchEvent::DoNothing
    }
}

/// Ordered record of every transition the controller performs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Status {
        tunnel_id: TunnelId,
        status: TunnelStatus,
        at: DateTime<Utc>,
    },
    KillSwitch {
        event: KillSwitchEvent,
        at: DateTime<Utc>,
    },
}

impl LifecycleEvent {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            LifecycleEvent::Status { at, .. } | LifecycleEvent::KillSwitch { at, .. } => *at,
        }
    }
}

/// User-visible conditions the engine could not handle on its own
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    /// Tunnel configuration is broken; it will not be retried
    ConfigurationError { tunnel: String, message: String },
    /// A transient failure survived its automatic retry
    RepeatedFailure { tunnel: String, message: String },
    /// Health monitor wanted a restart inside the cooldown window
    RestartSuppressed { tunnel: String, retry_in_secs: u64 },
    KillSwitchFailure { message: String },
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notice::ConfigurationError { tunnel, message } => {
                write!(f, "Tunnel {} has an invalid configuration: {}", tunnel, message)
            }
            Notice::RepeatedFailure { tunnel, message } => {
                write!(f, "Tunnel {} keeps failing: {}", tunnel, message)
            }
            Notice::RestartSuppressed {
                tunnel,
                retry_in_secs,
            } => write!(
                f,
                "Tunnel {} is unhealthy; next restart allowed in {}s",
                tunnel, retry_in_secs
            ),
            Notice::KillSwitchFailure { message } => write!(f, "Kill switch failure: {}", message),
        }
    }
}
