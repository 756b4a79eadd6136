//! Kill switch seam and the nftables backend
//!
//! While engaged, every packet that does not leave through a WireGuard
//! interface (or the loopback) is dropped. The allowed-IP list decides which
//! destinations the blocking table covers; with LAN exemption the private
//! ranges stay reachable outside the tunnel.

use crate::error::KillSwitchError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Full-tunnel route set
pub const ALL_TRAFFIC: [&str; 2] = ["0.0.0.0/0", "::/0"];

/// 0.0.0.0/0 minus the RFC 1918 private ranges and 224.0.0.0/3
/// (multicast and reserved)
///
/// Loopback and link-local stay covered; loopback traffic is accepted by
/// interface in the ruleset instead.
pub const PUBLIC_IPV4_RANGES: [&str; 30] = [
    "0.0.0.0/5",
    "8.0.0.0/7",
    "11.0.0.0/8",
    "12.0.0.0/6",
    "16.0.0.0/4",
    "32.0.0.0/3",
    "64.0.0.0/2",
    "128.0.0.0/3",
    "160.0.0.0/5",
    "168.0.0.0/6",
    "172.0.0.0/12",
    "172.32.0.0/11",
    "172.64.0.0/10",
    "172.128.0.0/9",
    "173.0.0.0/8",
    "174.0.0.0/7",
    "176.0.0.0/4",
    "192.0.0.0/9",
    "192.128.0.0/11",
    "192.160.0.0/13",
    "192.169.0.0/16",
    "192.170.0.0/15",
    "192.172.0.0/14",
    "192.176.0.0/12",
    "192.192.0.0/10",
    "193.0.0.0/8",
    "194.0.0.0/7",
    "196.0.0.0/6",
    "200.0.0.0/5",
    "208.0.0.0/4",
];

/// Destinations the kill switch forces through the tunnel
pub fn allowed_ips(lan_exempt: bool) -> Vec<String> {
    if lan_exempt {
        PUBLIC_IPV4_RANGES
            .iter()
            .chain(std::iter::once(&"::/0"))
            .map(|range| range.to_string())
            .collect()
    } else {
        ALL_TRAFFIC.iter().map(|range| range.to_string()).collect()
    }
}

/// Traffic blocking backend
#[async_trait]
pub trait KillSwitch: Send + Sync {
    /// Block all non-tunnel traffic to `allowed_ips`
    async fn engage(&self, allowed_ips: &[String]) -> Result<(), KillSwitchError>;

    /// Remove every blocking rule
    async fn release(&self) -> Result<(), KillSwitchError>;
}

const TABLE_FAMILY: &str = "inet";
const TABLE_NAME: &str = "autotun";

/// fwmark wg-quick stamps on the encrypted packets it routes itself
const WG_QUICK_FWMARK: u32 = 0xca6c;

/// Kill switch implemented as a dedicated nftables table
pub struct NftKillSwitch {
    nft: PathBuf,
}

impl NftKillSwitch {
    /// Locate the `nft` binary
    pub fn new() -> Result<Self, KillSwitchError> {
        let nft = which::which("nft").map_err(|e| KillSwitchError::Unavailable {
            reason: format!("nft not found: {}", e),
        })?;
        Ok(Self { nft })
    }

    async fn run_script(&self, script: &str) -> Result<(), String> {
        let mut child = Command::new(&self.nft)
            .arg("-f")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("Failed to spawn nft: {}", e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .await
                .map_err(|e| format!("Failed to write ruleset: {}", e))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| format!("Failed to wait for nft: {}", e))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }
}

#[async_trait]
impl KillSwitch for NftKillSwitch {
    async fn engage(&self, allowed_ips: &[String]) -> Result<(), KillSwitchError> {
        let script = render_ruleset(allowed_ips);
        debug!("Applying kill switch ruleset:\n{}", script);
        self.run_script(&script)
            .await
            .map_err(|reason| KillSwitchError::EngageFailed { reason })?;
        info!(ranges = allowed_ips.len(), "Kill switch engaged");
        Ok(())
    }

    async fn release(&self) -> Result<(), KillSwitchError> {
        let script = format!(
            "add table {family} {name}\ndelete table {family} {name}\n",
            family = TABLE_FAMILY,
            name = TABLE_NAME
        );
        self.run_script(&script)
            .await
            .map_err(|reason| KillSwitchError::ReleaseFailed { reason })?;
        info!("Kill switch released");
        Ok(())
    }
}

/// Render the nftables script for an allowed-IP set
///
/// The table is declared, flushed and rebuilt in one transaction so a
/// re-engage with different ranges never leaves a gap.
pub fn render_ruleset(allowed_ips: &[String]) -> String {
    let (v4, v6): (Vec<&str>, Vec<&str>) = allowed_ips
        .iter()
        .map(String::as_str)
        .partition(|range| !range.contains(':'));

    let mut script = String::new();
    script.push_str(&format!("add table {} {}\n", TABLE_FAMILY, TABLE_NAME));
    script.push_str(&format!("flush table {} {}\n", TABLE_FAMILY, TABLE_NAME));
    script.push_str(&format!("table {} {} {{\n", TABLE_FAMILY, TABLE_NAME));
    script.push_str("  chain output {\n");
    script.push_str("    type filter hook output priority 0; policy accept;\n");
    script.push_str("    oifname \"lo\" accept\n");
    script.push_str("    oifkind \"wireguard\" accept\n");
    script.push_str(&format!("    meta mark {:#x} accept\n", WG_QUICK_FWMARK));
    if !v4.is_empty() {
        script.push_str(&format!("    ip daddr {{ {} }} drop\n", v4.join(", ")));
    }
    if !v6.is_empty() {
        script.push_str(&format!("    ip6 daddr {{ {} }} drop\n", v6.join(", ")));
    }
    script.push_str("  }\n}\n");
    script
}
