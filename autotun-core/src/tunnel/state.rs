//! Tunnel lifecycle state machine
//!
//! `Down → Starting → Up → Stopping(reason) → Down`; `Down` is both the
//! initial and the terminal state.

use serde::{Deserialize, Serialize};

/// Why a tunnel is being stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopReason {
    /// Requested by the user or by an auto-tunnel Stop decision
    User,
    /// Restart issued by the health monitor
    Ping,
    /// Replaced by another tunnel in the same exclusivity domain
    ConfigChanged,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::User => write!(f, "USER"),
            StopReason::Ping => write!(f, "PING"),
            StopReason::ConfigChanged => write!(f, "CONFIG_CHANGED"),
        }
    }
}

/// Runtime status of one tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum TunnelStatus {
    #[default]
    Down,
    Starting,
    Up,
    Stopping(StopReason),
}

impl TunnelStatus {
    pub fn is_up(&self) -> bool {
        matches!(self, TunnelStatus::Up)
    }

    /// Up or on its way up
    pub fn is_active(&self) -> bool {
        matches!(self, TunnelStatus::Up | TunnelStatus::Starting)
    }

    /// Whether the state machine allows moving to `next`
    pub fn can_transition_to(&self, next: TunnelStatus) -> bool {
        use TunnelStatus::*;
        matches!(
            (self, next),
            (Down, Starting)
                | (Starting, Up)
                | (Starting, Down)
                | (Starting, Stopping(_))
                | (Up, Stopping(_))
                | (Stopping(_), Down)
        )
    }
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelStatus::Down => write!(f, "down"),
            TunnelStatus::Starting => write!(f, "starting"),
            TunnelStatus::Up => write!(f, "up"),
            TunnelStatus::Stopping(reason) => write!(f, "stopping ({})", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let mut status = TunnelStatus::default();
        for next in [
            TunnelStatus::Starting,
            TunnelStatus::Up,
            TunnelStatus::Stopping(StopReason::Ping),
            TunnelStatus::Down,
        ] {
            assert!(status.can_transition_to(next), "{} -> {}", status, next);
            status = next;
        }
        assert_eq!(status, TunnelStatus::Down);
    }

    #[test]
    fn test_rejected_transitions() {
        assert!(!TunnelStatus::Down.can_transition_to(TunnelStatus::Up));
        assert!(!TunnelStatus::Up.can_transition_to(TunnelStatus::Starting));
        assert!(!TunnelStatus::Stopping(StopReason::User).can_transition_to(TunnelStatus::Up));
    }

    #[test]
    fn test_display() {
        assert_eq!(TunnelStatus::Up.to_string(), "up");
        assert_eq!(
            TunnelStatus::Stopping(StopReason::ConfigChanged).to_string(),
            "stopping (CONFIG_CHANGED)"
        );
    }
}
