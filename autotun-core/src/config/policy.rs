//! Timing policy for the orchestration engine
//!
//! Poll intervals, restart cooldown, transition timeouts and the recovery
//! schedule, loaded from the `[policy]` table of the config file.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing knobs for the lifecycle controller, health monitor and supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationPolicy {
    /// Seconds between handshake probes of every Up tunnel
    #[serde(default = "default_handshake_poll_interval")]
    pub handshake_poll_interval_secs: u64,

    /// Consecutive STALE polls before a restart is issued
    #[serde(default = "default_stale_polls")]
    pub stale_polls_before_restart: u32,

    /// Minimum seconds between two PING-triggered restarts of one tunnel
    #[serde(default = "default_restart_cooldown")]
    pub restart_cooldown_secs: u64,

    /// Bound on the Starting transition
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// Bound on the Stopping transition
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Seconds between periodic recovery checks
    #[serde(default = "default_recovery_interval")]
    pub recovery_interval_secs: u64,

    /// Bound on a single recovery check
    #[serde(default = "default_recovery_check_timeout")]
    pub recovery_check_timeout_secs: u64,
}

fn default_handshake_poll_interval() -> u64 {
    10
}
fn default_stale_polls() -> u32 {
    2
}
fn default_restart_cooldown() -> u64 {
    300
}
fn default_start_timeout() -> u64 {
    30
}
fn default_stop_timeout() -> u64 {
    15
}
fn default_recovery_interval() -> u64 {
    900
}
fn default_recovery_check_timeout() -> u64 {
    10
}

impl Default for OrchestrationPolicy {
    fn default() -> Self {
        Self {
            handshake_poll_interval_secs: default_handshake_poll_interval(),
            stale_polls_before_restart: default_stale_polls(),
            restart_cooldown_secs: default_restart_cooldown(),
            start_timeout_secs: default_start_timeout(),
            stop_timeout_secs: default_stop_timeout(),
            recovery_interval_secs: default_recovery_interval(),
            recovery_check_timeout_secs: default_recovery_check_timeout(),
        }
    }
}

impl OrchestrationPolicy {
    /// Validate the entire policy
    ///
    /// # Returns
    ///
    /// * `Ok(())` if all fields are valid
    /// * `Err(PolicyValidationError)` with the first validation error encountered
    pub fn validate(&self) -> Result<(), PolicyValidationError> {
        check_range(
            "handshake_poll_interval_secs",
            self.handshake_poll_interval_secs,
            1,
            300,
        )?;
        check_range(
            "stale_polls_before_restart",
            u64::from(self.stale_polls_before_restart),
            1,
            10,
        )?;
        check_range("restart_cooldown_secs", self.restart_cooldown_secs, 30, 3600)?;
        check_range("start_timeout_secs", self.start_timeout_secs, 1, 300)?;
        check_range("stop_timeout_secs", self.stop_timeout_secs, 1, 300)?;
        check_range("recovery_interval_secs", self.recovery_interval_secs, 60, 86_400)?;
        check_range(
            "recovery_check_timeout_secs",
            self.recovery_check_timeout_secs,
            1,
            120,
        )?;

        if self.restart_cooldown_secs < self.handshake_poll_interval_secs {
            return Err(PolicyValidationError::CooldownShorterThanPoll(
                self.restart_cooldown_secs,
                self.handshake_poll_interval_secs,
            ));
        }

        Ok(())
    }

    pub fn handshake_poll_interval(&self) -> Duration {
        Duration::from_secs(self.handshake_poll_interval_secs)
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_secs(self.restart_cooldown_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }

    pub fn recovery_check_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_check_timeout_secs)
    }
}

fn check_range(
    field: &'static str,
    value: u64,
    min: u64,
    max: u64,
) -> Result<(), PolicyValidationError> {
    if value < min || value > max {
        Err(PolicyValidationError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    } else {
        Ok(())
    }
}

/// Validation errors for OrchestrationPolicy
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyValidationError {
    #[error("{field} must be between {min} and {max}, got: {value}")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("restart_cooldown_secs ({0}) must be >= handshake_poll_interval_secs ({1})")]
    CooldownShorterThanPoll(u64, u64),
}
