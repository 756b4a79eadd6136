//! Error types for the autotun orchestration engine
//!
//! This module defines all error types used throughout the engine,
//! providing consistent error handling and user-friendly error messages.

use thiserror::Error;

/// Main error type for the autotun engine
#[derive(Error, Debug)]
pub enum AutotunError {
    /// Errors related to configuration loading/parsing
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Errors raised while driving a tunnel through its lifecycle
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Errors raised by the kill switch backend
    #[error("Kill switch error: {0}")]
    KillSwitch(#[from] KillSwitchError),

    /// A recovery check failed or ran over its time bound
    #[error("Recovery error: {0}")]
    Recovery(#[from] crate::tunnel::recovery::RecoveryError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Configuration-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {path}")]
    LoadFailed { path: String },

    #[error("Failed to save configuration file {path}: {reason}")]
    SaveFailed { path: String, reason: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation error: {message}")]
    ValidationError { message: String },

    #[error("Debounce delay must be between 0 and 10 seconds, got: {seconds}")]
    InvalidDebounceDelay { seconds: u64 },

    #[error("Unknown tunnel: {name}")]
    UnknownTunnel { name: String },

    #[error("Duplicate tunnel {field}: {value}")]
    Duplicate { field: String, value: String },

    #[error("I/O error: {message}")]
    IoError { message: String },
}

/// Lifecycle phase a tunnel timeout happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPhase {
    Starting,
    Stopping,
}

impl std::fmt::Display for TransitionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionPhase::Starting => write!(f, "starting"),
            TransitionPhase::Stopping => write!(f, "stopping"),
        }
    }
}

/// Tunnel lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    /// Malformed tunnel configuration; surfaced, never retried
    #[error("Invalid configuration for tunnel {tunnel}: {reason}")]
    InvalidConfig { tunnel: String, reason: String },

    #[error("Failed to start tunnel {tunnel}: {reason}")]
    StartFailed { tunnel: String, reason: String },

    #[error("Failed to stop tunnel {tunnel}: {reason}")]
    StopFailed { tunnel: String, reason: String },

    #[error("Permission denied while driving tunnel {tunnel}: {reason}")]
    PermissionDenied { tunnel: String, reason: String },

    #[error("Tunnel driver unavailable: {reason}")]
    DriverUnavailable { reason: String },

    #[error("Tunnel {tunnel} timed out while {phase} after {seconds} seconds")]
    Timeout {
        tunnel: String,
        phase: TransitionPhase,
        seconds: u64,
    },

    #[error("Start of tunnel {tunnel} was cancelled")]
    Cancelled { tunnel: String },

    #[error("Failed to read handshake for tunnel {tunnel}: {reason}")]
    HandshakeReadFailed { tunnel: String, reason: String },

    #[error("Unknown tunnel: {tunnel}")]
    UnknownTunnel { tunnel: String },
}

impl TunnelError {
    /// Whether the failure is worth one automatic retry by the recovery supervisor
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TunnelError::StartFailed { .. }
                | TunnelError::StopFailed { .. }
                | TunnelError::PermissionDenied { .. }
                | TunnelError::DriverUnavailable { .. }
                | TunnelError::Timeout { .. }
        )
    }

    /// Whether the failure is a terminal configuration problem
    pub fn is_configuration(&self) -> bool {
        matches!(self, TunnelError::InvalidConfig { .. })
    }
}

/// Kill switch backend errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KillSwitchError {
    #[error("Kill switch backend unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Failed to engage kill switch: {reason}")]
    EngageFailed { reason: String },

    #[error("Failed to release kill switch: {reason}")]
    ReleaseFailed { reason: String },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AutotunError>;
