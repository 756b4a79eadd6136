//! Identifier types and wrappers for sensitive tunnel material
//!
//! Raw WireGuard configuration carries the interface private key, so it is
//! held in a `secrecy` wrapper that keeps it out of logs and debug output.

use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Stable identifier of a user-defined tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelId(pub u32);

impl std::fmt::Display for TunnelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u32> for TunnelId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Raw wg-quick configuration text for one tunnel
///
/// Never printed by `Debug`; only the tunnel driver exposes it when writing
/// the interface config file.
#[derive(Clone, Debug)]
pub struct ConfigMaterial(Secret<String>);

impl ConfigMaterial {
    pub fn new(raw: String) -> Self {
        Self(Secret::new(raw))
    }

    /// Expose the raw configuration (use with caution!)
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    /// Check for the sections wg-quick refuses to start without
    pub fn validate(&self) -> Result<(), String> {
        let raw = self.expose();
        if raw.trim().is_empty() {
            return Err("Configuration is empty".to_string());
        }

        let has_section = |name: &str| {
            raw.lines()
                .any(|line| line.trim().eq_ignore_ascii_case(name))
        };
        if !has_section("[Interface]") {
            return Err("Missing [Interface] section".to_string());
        }
        if !has_section("[Peer]") {
            return Err("Missing [Peer] section".to_string());
        }

        let has_private_key = raw.lines().any(|line| {
            line.split_once('=')
                .map(|(key, value)| {
                    key.trim().eq_ignore_ascii_case("PrivateKey") && !value.trim().is_empty()
                })
                .unwrap_or(false)
        });
        if !has_private_key {
            return Err("Missing PrivateKey in [Interface] section".to_string());
        }

        Ok(())
    }
}

impl PartialEq for ConfigMaterial {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl Eq for ConfigMaterial {}

impl From<String> for ConfigMaterial {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<&str> for ConfigMaterial {
    fn from(raw: &str) -> Self {
        Self::new(raw.to_string())
    }
}

impl Serialize for ConfigMaterial {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.expose())
    }
}

impl<'de> Deserialize<'de> for ConfigMaterial {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}
