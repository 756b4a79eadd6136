//! autotun - network-aware WireGuard auto-tunnel daemon
//!
//! Runs the orchestration engine as a daemon and controls it from the
//! command line.

use autotun_core::config::toml_config::get_config_path;
use autotun_core::error::{AutotunError, ConfigError};
use autotun_core::init_logging;
use autotun_core::network::NetworkState;
use clap::{Args, Parser, Subcommand, ValueEnum};

mod cli;
mod daemon;

use daemon::ipc::{Failure, FailureKind};

#[derive(Parser)]
#[command(name = "autotun", version)]
#[command(about = "Brings WireGuard tunnels up and down as networks change")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestration daemon
    Daemon {
        /// Stay attached to the terminal
        #[arg(long)]
        foreground: bool,
    },
    /// Show tunnel, kill switch and network status
    Status,
    /// List configured tunnels
    Tunnels,
    /// Bring a tunnel up
    Up { name: String },
    /// Take a tunnel down
    Down { name: String },
    /// Turn automatic tunnelling on or off
    Auto {
        #[arg(value_enum)]
        state: Toggle,
    },
    /// Set how long a network change must settle before it is acted on
    Debounce { seconds: u64 },
    /// Report the current network conditions to the daemon
    Network(NetworkArgs),
    /// Run one recovery check now
    Recover,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[derive(Args)]
struct NetworkArgs {
    /// Wi-Fi is connected
    #[arg(long)]
    wifi: bool,
    /// SSID of the connected Wi-Fi network
    #[arg(long, requires = "wifi")]
    ssid: Option<String>,
    /// Ethernet is connected
    #[arg(long)]
    ethernet: bool,
    /// Mobile data is connected
    #[arg(long)]
    mobile: bool,
    /// The connection has no internet access
    #[arg(long)]
    no_internet: bool,
}

impl From<NetworkArgs> for NetworkState {
    fn from(args: NetworkArgs) -> Self {
        NetworkState {
            wifi_connected: args.wifi,
            ssid: args.ssid,
            is_ethernet_connected: args.ethernet,
            is_mobile_data_connected: args.mobile,
            has_internet: !args.no_internet,
        }
    }
}

fn main() {
    // Initialize logging
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(2);
    }

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Daemon { foreground } => run_daemon(foreground),
        Commands::Status => cli::status::run_status(),
        Commands::Tunnels => get_config_path()
            .map_err(anyhow::Error::from)
            .and_then(|path| cli::status::run_tunnels(&path)),
        Commands::Up { name } => cli::control::run_up(name),
        Commands::Down { name } => cli::control::run_down(name),
        Commands::Auto { state } => cli::control::run_auto(matches!(state, Toggle::On)),
        Commands::Debounce { seconds } => cli::control::run_debounce(seconds),
        Commands::Network(args) => cli::control::run_network(args.into()),
        Commands::Recover => cli::control::run_recover(),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

fn run_daemon(foreground: bool) -> anyhow::Result<()> {
    let paths = daemon::service::DaemonPaths {
        config: get_config_path()?,
        socket: daemon::ipc::get_default_socket_path(),
        pid_file: daemon::process::get_default_pid_file(),
    };
    daemon::service::run(paths, foreground)
}

/// Configuration problems exit with 2, everything else with 1
fn exit_code(error: &anyhow::Error) -> i32 {
    let is_config = error.chain().any(|cause| {
        if let Some(error) = cause.downcast_ref::<AutotunError>() {
            return matches!(
                error,
                AutotunError::Config(_) | AutotunError::Toml(_) | AutotunError::TomlSerialize(_)
            );
        }
        if let Some(failure) = cause.downcast_ref::<Failure>() {
            return failure.kind == FailureKind::Config;
        }
        cause.is::<ConfigError>()
    });

    if is_config {
        2
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_config_errors_exit_with_2() {
        let error = anyhow::Error::from(AutotunError::Config(ConfigError::UnknownTunnel {
            name: "office".to_string(),
        }))
        .context("Failed to load configuration");
        assert_eq!(exit_code(&error), 2);

        let failure = anyhow::Error::from(Failure {
            kind: FailureKind::Config,
            message: "Unknown tunnel: office".to_string(),
        });
        assert_eq!(exit_code(&failure), 2);
    }

    #[test]
    fn test_runtime_errors_exit_with_1() {
        let error: anyhow::Result<()> =
            Err(std::io::Error::from(std::io::ErrorKind::NotFound)).context("daemon not running");
        assert_eq!(exit_code(&error.unwrap_err()), 1);

        let failure = anyhow::Error::from(Failure {
            kind: FailureKind::Runtime,
            message: "Failed to start tunnel office".to_string(),
        });
        assert_eq!(exit_code(&failure), 1);
    }

    #[test]
    fn test_network_flags() {
        let cli = Cli::parse_from(["autotun", "network", "--wifi", "--ssid", "home"]);
        let Commands::Network(args) = cli.command else {
            panic!("expected network command");
        };

        let state = NetworkState::from(args);

        assert!(state.wifi_connected);
        assert_eq!(state.ssid.as_deref(), Some("home"));
        assert!(state.has_internet);
    }
}
