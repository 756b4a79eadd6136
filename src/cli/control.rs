//! Commands that change what the daemon is doing

use anyhow::bail;
use autotun_core::network::NetworkState;
use autotun_core::tunnel::RecoveryAction;
use colored::Colorize;

use super::client;
use crate::daemon::ipc::{Request, Response};

pub fn run_up(name: String) -> anyhow::Result<()> {
    client().command(&Request::Up { name: name.clone() })?;
    println!("{} {} is up", "✓".green(), name);
    Ok(())
}

pub fn run_down(name: String) -> anyhow::Result<()> {
    client().command(&Request::Down { name: name.clone() })?;
    println!("{} {} is down", "✓".green(), name);
    Ok(())
}

pub fn run_auto(enabled: bool) -> anyhow::Result<()> {
    client().command(&Request::SetAutoTunnel { enabled })?;
    println!(
        "Auto-tunnel {}",
        if enabled { "enabled".green() } else { "disabled".yellow() }
    );
    Ok(())
}

pub fn run_debounce(seconds: u64) -> anyhow::Result<()> {
    client().command(&Request::SetDebounce { seconds })?;
    println!("Debounce delay set to {}s", seconds);
    Ok(())
}

/// Push a network snapshot, e.g. from a NetworkManager dispatcher script
pub fn run_network(state: NetworkState) -> anyhow::Result<()> {
    client().command(&Request::PublishNetwork { state })
}

/// One recovery check; the exit status is what a scheduler looks at
pub fn run_recover() -> anyhow::Result<()> {
    match client().send(&Request::Recover)? {
        Response::Recovered { actions } if actions.is_empty() => {
            println!("Nothing to recover");
            Ok(())
        }
        Response::Recovered { actions } => {
            for action in &actions {
                println!("{} {}", "✓".green(), describe_action(action));
            }
            Ok(())
        }
        Response::Failed(failure) => Err(failure.into()),
        other => bail!("Unexpected response: {:?}", other),
    }
}

fn describe_action(action: &RecoveryAction) -> String {
    match action {
        RecoveryAction::AttachedService => "Auto-tunnel service attached".to_string(),
        RecoveryAction::DetachedService => "Auto-tunnel service detached".to_string(),
        RecoveryAction::RestoredState => "Previous tunnel state restored".to_string(),
        RecoveryAction::RetriedStart(name) => format!("Retried start of {}", name),
        RecoveryAction::RetriedStop(name) => format!("Retried stop of {}", name),
    }
}
