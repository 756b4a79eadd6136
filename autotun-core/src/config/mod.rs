//! Configuration module
//!
//! Process-wide settings, user-defined tunnels, the in-memory stores the
//! engine reads consistent snapshots from, and TOML file I/O.

use crate::types::{ConfigMaterial, TunnelId};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;

pub mod policy;
pub mod store;
pub mod toml_config;

pub use policy::{OrchestrationPolicy, PolicyValidationError};
pub use store::{SettingsStore, TunnelRepository};

/// Largest accepted debounce delay in seconds
pub const MAX_DEBOUNCE_DELAY_SECS: u8 = 10;

/// Process-wide auto-tunnel settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub is_auto_tunnel_enabled: bool,
    pub is_tunnel_on_wifi_enabled: bool,
    pub is_tunnel_on_mobile_data_enabled: bool,
    pub is_tunnel_on_ethernet_enabled: bool,

    /// Wi-Fi networks on which no tunnel should run
    pub trusted_network_ssids: BTreeSet<String>,

    /// Seconds a network change must stay put before it is acted on (0-10)
    pub debounce_delay_seconds: u8,

    pub is_kill_switch_enabled: bool,
    pub is_lan_traffic_exempt: bool,
    pub is_always_on_vpn_enabled: bool,

    /// Keep the kill switch engaged even while no tunnel is running
    pub is_kill_switch_without_vpn_enabled: bool,
    pub is_stop_on_no_internet_enabled: bool,
    pub is_multi_tunnel_enabled: bool,
    pub is_restore_on_boot_enabled: bool,

    /// Honour `*` and `?` in trusted SSIDs and tunnel networks
    pub is_wildcards_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            is_auto_tunnel_enabled: false,
            is_tunnel_on_wifi_enabled: true,
            is_tunnel_on_mobile_data_enabled: false,
            is_tunnel_on_ethernet_enabled: false,
            trusted_network_ssids: BTreeSet::new(),
            debounce_delay_seconds: 3,
            is_kill_switch_enabled: false,
            is_lan_traffic_exempt: false,
            is_always_on_vpn_enabled: false,
            is_kill_switch_without_vpn_enabled: false,
            is_stop_on_no_internet_enabled: false,
            is_multi_tunnel_enabled: false,
            is_restore_on_boot_enabled: false,
            is_wildcards_enabled: false,
        }
    }
}

impl Settings {
    /// Validate the settings
    pub fn validate(&self) -> Result<(), String> {
        if self.debounce_delay_seconds > MAX_DEBOUNCE_DELAY_SECS {
            return Err(format!(
                "Debounce delay must be between 0 and {} seconds",
                MAX_DEBOUNCE_DELAY_SECS
            ));
        }

        if self.trusted_network_ssids.iter().any(|ssid| ssid.trim().is_empty()) {
            return Err("Trusted network SSIDs cannot be empty".to_string());
        }

        Ok(())
    }

    /// Whether the SSID is one of the trusted networks
    pub fn is_trusted(&self, ssid: &str) -> bool {
        crate::network::best_match(&self.trusted_network_ssids, ssid, self.is_wildcards_enabled)
            .is_some()
    }
}

fn default_ping_failure_threshold() -> u32 {
    3
}
fn default_ping_interval() -> u64 {
    60
}

/// One user-defined tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConf {
    pub id: TunnelId,

    /// Unique name; doubles as the WireGuard interface name
    pub name: String,

    /// Raw wg-quick configuration
    pub config: ConfigMaterial,

    #[serde(default)]
    pub is_primary: bool,

    #[serde(default)]
    pub is_mobile_data_tunnel: bool,

    #[serde(default)]
    pub is_ethernet_tunnel: bool,

    /// Wi-Fi SSIDs bound to this tunnel
    #[serde(default)]
    pub tunnel_networks: BTreeSet<String>,

    /// Tunnel was running when the process last saw it
    #[serde(default)]
    pub is_active: bool,

    #[serde(default)]
    pub is_ping_enabled: bool,

    /// HTTP/HTTPS URL probed through the tunnel
    #[serde(default)]
    pub ping_target: Option<String>,

    /// Consecutive failed probes before a restart is requested
    #[serde(default = "default_ping_failure_threshold")]
    pub ping_failure_threshold: u32,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

fn interface_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Same rule wg-quick applies to interface names
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9_=+.-]{1,15}$").expect("interface name pattern is valid")
    })
}

impl TunnelConf {
    /// Create a tunnel with every optional flag cleared
    pub fn new(id: impl Into<TunnelId>, name: &str, config: impl Into<ConfigMaterial>) -> Self {
        Self {
            id: id.into(),
            name: name.to_string(),
            config: config.into(),
            is_primary: false,
            is_mobile_data_tunnel: false,
            is_ethernet_tunnel: false,
            tunnel_networks: BTreeSet::new(),
            is_active: false,
            is_ping_enabled: false,
            ping_target: None,
            ping_failure_threshold: default_ping_failure_threshold(),
            ping_interval_secs: default_ping_interval(),
        }
    }

    /// Validate the tunnel definition
    ///
    /// The raw material itself is checked separately by the driver so that a
    /// broken config surfaces as a configuration error at start time instead of
    /// preventing the whole file from loading.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("Tunnel name cannot be empty".to_string());
        }

        if !interface_name_pattern().is_match(&self.name) {
            return Err(format!(
                "Tunnel name '{}' is not a valid interface name (1-15 of [a-zA-Z0-9_=+.-])",
                self.name
            ));
        }

        if self.is_ping_enabled {
            let target = self
                .ping_target
                .as_deref()
                .ok_or_else(|| format!("Tunnel '{}' enables ping without a ping_target", self.name))?;
            let url = url::Url::parse(target)
                .map_err(|e| format!("Invalid ping_target '{}': {}", target, e))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(format!(
                    "ping_target must use http or https, got: {}",
                    url.scheme()
                ));
            }
            if self.ping_failure_threshold == 0 {
                return Err("ping_failure_threshold cannot be zero".to_string());
            }
            if self.ping_interval_secs == 0 {
                return Err("ping_interval_secs cannot be zero".to_string());
            }
        }

        Ok(())
    }

    pub fn with_primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    pub fn with_mobile_data(mut self) -> Self {
        self.is_mobile_data_tunnel = true;
        self
    }

    pub fn with_ethernet(mut self) -> Self {
        self.is_ethernet_tunnel = true;
        self
    }

    pub fn with_network(mut self, ssid: &str) -> Self {
        self.tunnel_networks.insert(ssid.to_string());
        self
    }
}
