//! Tunnel orchestration
//!
//! Decision arbitration, lifecycle control, health supervision and recovery
//! for WireGuard tunnels, plus the driver and kill-switch seams they act on.

pub mod arbiter;
pub mod controller;
pub mod driver;
pub mod events;
pub mod handshake;
pub mod health;
pub mod kill_switch;
pub mod recovery;
pub mod service;
pub mod state;
pub mod wg_output;

pub use arbiter::{decide, DecisionArbiter};
pub use controller::{LifecycleController, PendingRetry};
pub use driver::{TunnelDriver, TunnelHandle, WgQuickDriver};
pub use events::{AutoTunnelEvent, Decision, KillSwitchEvent, LifecycleEvent, Notice};
pub use handshake::HandshakeStatus;
pub use health::{HealthMonitor, HttpProbe, PingProbe, ProbeResult};
pub use kill_switch::{KillSwitch, NftKillSwitch};
pub use recovery::{RecoveryAction, RecoveryError, RecoverySupervisor};
pub use service::AutoTunnelService;
pub use state::{StopReason, TunnelStatus};
