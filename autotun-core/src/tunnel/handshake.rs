//! Handshake health classification
//!
//! WireGuard re-keys roughly every two minutes and a quiet peer still
//! handshakes every 180 seconds, so anything older than that plus a small
//! buffer means the session is silently dead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Typical interval between handshakes of a healthy session
pub const HEALTHY_HANDSHAKE_INTERVAL_SECS: i64 = 180;

/// Slack added on top of the healthy interval
pub const HANDSHAKE_BUFFER_SECS: i64 = 30;

/// Age past which a handshake is considered stale
pub const STALE_HANDSHAKE_SECS: i64 = HEALTHY_HANDSHAKE_INTERVAL_SECS + HANDSHAKE_BUFFER_SECS;

/// Derived health of a tunnel's cryptographic session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandshakeStatus {
    /// Tunnel is not up
    NotStarted,
    Healthy,
    Stale,
    /// No verdict yet; never a restart trigger on its own
    Unknown,
}

impl std::fmt::Display for HandshakeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeStatus::NotStarted => write!(f, "NOT_STARTED"),
            HandshakeStatus::Healthy => write!(f, "HEALTHY"),
            HandshakeStatus::Stale => write!(f, "STALE"),
            HandshakeStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Classify a handshake reading
///
/// `last_handshake` is `None` when the peer never completed a handshake;
/// in that case the tunnel gets the buffer period after coming up before it
/// is declared stale.
pub fn classify(
    last_handshake: Option<DateTime<Utc>>,
    up_since: DateTime<Utc>,
    now: DateTime<Utc>,
) -> HandshakeStatus {
    match last_handshake {
        Some(at) => {
            if (now - at).num_seconds() > STALE_HANDSHAKE_SECS {
                HandshakeStatus::Stale
            } else {
                HandshakeStatus::Healthy
            }
        }
        None => {
            if (now - up_since).num_seconds() < HANDSHAKE_BUFFER_SECS {
                HandshakeStatus::Unknown
            } else {
                HandshakeStatus::Stale
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_recent_handshake_is_healthy() {
        let now = Utc::now();
        let status = classify(Some(now - Duration::seconds(60)), now - Duration::hours(1), now);
        assert_eq!(status, HandshakeStatus::Healthy);
    }

    #[test]
    fn test_old_handshake_is_stale() {
        let now = Utc::now();
        let status = classify(Some(now - Duration::seconds(250)), now - Duration::hours(1), now);
        assert_eq!(status, HandshakeStatus::Stale);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let now = Utc::now();
        let at_threshold = now - Duration::seconds(STALE_HANDSHAKE_SECS);
        assert_eq!(
            classify(Some(at_threshold), now - Duration::hours(1), now),
            HandshakeStatus::Healthy
        );
    }

    #[test]
    fn test_never_handshaken_gets_grace_period() {
        let now = Utc::now();
        assert_eq!(
            classify(None, now - Duration::seconds(10), now),
            HandshakeStatus::Unknown
        );
        assert_eq!(
            classify(None, now - Duration::seconds(45), now),
            HandshakeStatus::Stale
        );
    }
}
