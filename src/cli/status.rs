//! `autotun status` and `autotun tunnels`

use std::path::Path;

use anyhow::bail;
use autotun_core::config::toml_config::TomlConfig;
use autotun_core::config::TunnelConf;
use autotun_core::engine::TunnelReport;
use autotun_core::network::NetworkState;
use autotun_core::tunnel::{HandshakeStatus, TunnelStatus};
use colored::{ColoredString, Colorize};

use super::client;
use crate::daemon::ipc::{Request, Response, StatusReport};

/// Show the daemon's live view
pub fn run_status() -> anyhow::Result<()> {
    match client().send(&Request::Status)? {
        Response::Status(report) => {
            print_report(&report);
            Ok(())
        }
        Response::Failed(failure) => Err(failure.into()),
        other => bail!("Unexpected response: {:?}", other),
    }
}

fn print_report(report: &StatusReport) {
    let auto = if report.auto_tunnel_enabled {
        "on".green()
    } else {
        "off".yellow()
    };
    println!("Auto-tunnel:  {}", auto);
    if report.auto_tunnel_enabled && !report.auto_tunnel_attached {
        println!("              {}", "not attached, waiting for recovery".yellow());
    }

    let kill_switch = if report.kill_switch_engaged {
        "engaged".green()
    } else {
        "released".normal()
    };
    println!("Kill switch:  {}", kill_switch);
    println!("Network:      {}", describe_network(report.network.as_ref()));
    match report.last_recovery {
        Some(at) => println!("Last check:   {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("Last check:   {}", "never".dimmed()),
    }

    println!();
    if report.tunnels.is_empty() {
        println!("No tunnels configured");
    }
    for tunnel in &report.tunnels {
        print_tunnel(tunnel);
    }

    if !report.recent_notices.is_empty() {
        println!();
        println!("{}", "Recent notices:".bold());
        for notice in &report.recent_notices {
            println!("  {} {}", "!".red(), notice);
        }
    }
}

fn print_tunnel(tunnel: &TunnelReport) {
    let handshake = match tunnel.handshake {
        Some(HandshakeStatus::Healthy) => "handshake ok".green(),
        Some(HandshakeStatus::Stale) => "handshake stale".red(),
        Some(HandshakeStatus::Unknown) => "handshake unknown".yellow(),
        Some(HandshakeStatus::NotStarted) | None => "".normal(),
    };
    let primary = if tunnel.is_primary { " (primary)" } else { "" };
    println!(
        "  {:<16} {:<24} {}{}",
        tunnel.name.bold(),
        paint_status(tunnel.status),
        handshake,
        primary.dimmed()
    );
}

fn paint_status(status: TunnelStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        TunnelStatus::Up => text.green(),
        TunnelStatus::Starting | TunnelStatus::Stopping(_) => text.yellow(),
        TunnelStatus::Down => text.normal(),
    }
}

fn describe_network(network: Option<&NetworkState>) -> String {
    let Some(network) = network else {
        return "no snapshot received".to_string();
    };

    let mut links = Vec::new();
    if network.wifi_connected {
        match &network.ssid {
            Some(ssid) => links.push(format!("wifi {:?}", ssid)),
            None => links.push("wifi (unknown SSID)".to_string()),
        }
    }
    if network.is_ethernet_connected {
        links.push("ethernet".to_string());
    }
    if network.is_mobile_data_connected {
        links.push("mobile data".to_string());
    }
    if links.is_empty() {
        links.push("disconnected".to_string());
    }
    if !network.has_internet {
        links.push("no internet".to_string());
    }
    links.join(", ")
}

/// List configured tunnels straight from the configuration file
pub fn run_tunnels(config_path: &Path) -> anyhow::Result<()> {
    if !config_path.exists() {
        println!("No configuration at {}", config_path.display());
        return Ok(());
    }
    let config = TomlConfig::from_file(config_path)?;
    if config.tunnels.is_empty() {
        println!("No tunnels configured");
    }
    for tunnel in &config.tunnels {
        println!("{}", describe_tunnel(tunnel));
    }
    Ok(())
}

fn describe_tunnel(tunnel: &TunnelConf) -> String {
    let mut roles = Vec::new();
    if tunnel.is_primary {
        roles.push("primary".to_string());
    }
    if tunnel.is_ethernet_tunnel {
        roles.push("ethernet".to_string());
    }
    if tunnel.is_mobile_data_tunnel {
        roles.push("mobile data".to_string());
    }
    if !tunnel.tunnel_networks.is_empty() {
        let networks: Vec<&str> = tunnel.tunnel_networks.iter().map(String::as_str).collect();
        roles.push(format!("wifi: {}", networks.join(", ")));
    }
    if tunnel.is_ping_enabled {
        if let Some(target) = &tunnel.ping_target {
            roles.push(format!("ping {}", target));
        }
    }

    let active = if tunnel.is_active { " *" } else { "" };
    format!(
        "{:>4}  {}{}  {}",
        tunnel.id.to_string(),
        tunnel.name,
        active,
        roles.join("; ")
    )
}
