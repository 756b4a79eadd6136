//! Pattern-based parser for wg-quick and wg output
//!
//! Classifies wg-quick failures into configuration errors (never retried)
//! and transient ones, and reads `wg show <if> latest-handshakes`.

use crate::error::TunnelError;
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;

/// Parser for wg-quick stderr and wg show output
pub struct WgOutputParser {
    /// wg(8) and wg-quick(8) complaints about the config file itself
    config_error_pattern: Regex,
    /// Missing privileges for netlink or routing changes
    permission_pattern: Regex,
    /// Interface left over from a previous run
    exists_pattern: Regex,
    /// "<public key>\t<unix seconds>"
    handshake_line_pattern: Regex,
}

impl WgOutputParser {
    /// Create a new parser with compiled regex patterns
    pub fn new() -> Self {
        Self {
            config_error_pattern: Regex::new(
                r"(?i)line unrecognized|configuration parsing error|key is not the correct length|not a valid|unable to parse|invalid (?:address|port|endpoint|key)|trailing characters",
            )
            .expect("Failed to compile config_error pattern"),
            permission_pattern: Regex::new(
                r"(?i)must be run as root|operation not permitted|permission denied",
            )
            .expect("Failed to compile permission pattern"),
            exists_pattern: Regex::new(r"(?i)already exists")
                .expect("Failed to compile exists pattern"),
            handshake_line_pattern: Regex::new(r"^(\S+)\s+(\d+)$")
                .expect("Failed to compile handshake_line pattern"),
        }
    }

    /// Classify a failed `wg-quick up` by its stderr
    pub fn classify_up_failure(&self, tunnel: &str, stderr: &str) -> TunnelError {
        let reason = last_meaningful_line(stderr);

        if self.config_error_pattern.is_match(stderr) {
            return TunnelError::InvalidConfig {
                tunnel: tunnel.to_string(),
                reason,
            };
        }

        if self.permission_pattern.is_match(stderr) {
            return TunnelError::PermissionDenied {
                tunnel: tunnel.to_string(),
                reason,
            };
        }

        if self.exists_pattern.is_match(stderr) {
            return TunnelError::StartFailed {
                tunnel: tunnel.to_string(),
                reason: format!("interface already exists ({})", reason),
            };
        }

        TunnelError::StartFailed {
            tunnel: tunnel.to_string(),
            reason,
        }
    }

    /// Classify a failed `wg-quick down` by its stderr
    pub fn classify_down_failure(&self, tunnel: &str, stderr: &str) -> TunnelError {
        let reason = last_meaningful_line(stderr);
        if self.permission_pattern.is_match(stderr) {
            TunnelError::PermissionDenied {
                tunnel: tunnel.to_string(),
                reason,
            }
        } else {
            TunnelError::StopFailed {
                tunnel: tunnel.to_string(),
                reason,
            }
        }
    }

    /// Most recent handshake across all peers
    ///
    /// wg reports `0` for a peer that never completed a handshake; if no peer
    /// has, the result is `None`.
    pub fn parse_latest_handshakes(&self, output: &str) -> Result<Option<DateTime<Utc>>, String> {
        let mut latest: Option<i64> = None;

        for line in output.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let captures = self
                .handshake_line_pattern
                .captures(line)
                .ok_or_else(|| format!("Unexpected wg output: {}", line))?;
            let seconds: i64 = captures[2]
                .parse()
                .map_err(|e| format!("Invalid handshake timestamp '{}': {}", &captures[2], e))?;
            if seconds > 0 {
                latest = Some(latest.map_or(seconds, |current| current.max(seconds)));
            }
        }

        match latest {
            Some(seconds) => Utc
                .timestamp_opt(seconds, 0)
                .single()
                .map(Some)
                .ok_or_else(|| format!("Handshake timestamp out of range: {}", seconds)),
            None => Ok(None),
        }
    }
}

impl Default for WgOutputParser {
    fn default() -> Self {
        Self::new()
    }
}

fn last_meaningful_line(stderr: &str) -> String {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("[#]"))
        .last()
        .unwrap_or("no output")
        .to_string()
}
