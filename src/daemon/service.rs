//! The long-running daemon
//!
//! Loads the configuration, wires the engine to the wg-quick driver and the
//! nftables kill switch, serves IPC requests and writes setting changes back
//! to the configuration file until SIGTERM or SIGINT.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use autotun_core::config::toml_config::TomlConfig;
use autotun_core::config::OrchestrationPolicy;
use autotun_core::engine::Engine;
use autotun_core::error::AutotunError;
use autotun_core::tunnel::{HttpProbe, NftKillSwitch, Notice, StopReason, WgQuickDriver};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::ipc::{self, Failure, FailureKind, Request, RequestHandler, Response, StatusReport};
use super::process::DaemonProcess;

/// Notices kept for `autotun status`
const RECENT_NOTICES: usize = 20;

/// Timeout of the HTTP ping probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the daemon keeps its files
pub struct DaemonPaths {
    pub config: PathBuf,
    pub socket: PathBuf,
    pub pid_file: PathBuf,
}

/// Start the daemon, detaching unless `foreground`
pub fn run(paths: DaemonPaths, foreground: bool) -> anyhow::Result<()> {
    let process = DaemonProcess::new(paths.pid_file.clone());
    process.ensure_not_running()?;

    // Surface configuration errors on the terminal before detaching
    let config = load_config(&paths.config)?;

    if foreground {
        process.write_pid_file()?;
    } else {
        process.daemonize()?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let result = runtime.block_on(serve(config, &paths));
    drop(process);
    result
}

fn load_config(path: &Path) -> anyhow::Result<TomlConfig> {
    if !path.exists() {
        info!("No configuration at {:?}, starting with defaults", path);
        return Ok(TomlConfig::default());
    }
    Ok(TomlConfig::from_file(path)?)
}

async fn serve(config: TomlConfig, paths: &DaemonPaths) -> anyhow::Result<()> {
    let policy = config.policy.clone();
    let driver = WgQuickDriver::new(WgQuickDriver::default_runtime_dir())
        .context("wireguard-tools are required")?;
    let kill_switch =
        NftKillSwitch::new().context("nftables is required for the kill switch")?;
    let probe = HttpProbe::new(PROBE_TIMEOUT).context("Failed to build ping probe")?;

    let engine = Arc::new(Engine::new(
        config,
        Arc::new(driver),
        Arc::new(kill_switch),
        Arc::new(probe),
    )?);
    let cancel = CancellationToken::new();
    let notices = Arc::new(Mutex::new(VecDeque::with_capacity(RECENT_NOTICES)));

    tokio::spawn(collect_notices(
        engine.subscribe_notices(),
        Arc::clone(&notices),
        cancel.child_token(),
    ));
    tokio::spawn(persist_changes(
        Arc::clone(&engine),
        paths.config.clone(),
        policy,
        cancel.child_token(),
    ));

    let handler: Arc<dyn RequestHandler> = Arc::new(EngineHandler {
        engine: Arc::clone(&engine),
        notices,
    });
    let socket = paths.socket.clone();
    let ipc_token = cancel.child_token();
    let ipc_task = tokio::spawn(async move { ipc::serve(&socket, handler, ipc_token).await });

    match engine.start().await {
        Ok(actions) => info!(?actions, "Boot recovery check done"),
        Err(e) => warn!("Boot recovery check failed: {}", e),
    }
    info!("autotun daemon running");

    wait_for_shutdown_signal().await?;
    info!("Shutting down");

    cancel.cancel();
    engine.shutdown().await;
    match ipc_task.await {
        Ok(result) => result?,
        Err(e) => warn!("IPC task ended abnormally: {}", e),
    }
    Ok(())
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        _ = terminate.recv() => info!("Received SIGTERM"),
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for SIGINT")?;
            info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Log every notice and keep the most recent ones for status queries
async fn collect_notices(
    mut rx: broadcast::Receiver<Notice>,
    recent: Arc<Mutex<VecDeque<Notice>>>,
    cancel: CancellationToken,
) {
    loop {
        let notice = tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(notice) => notice,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Missed {} notices", missed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        match &notice {
            Notice::RestartSuppressed { .. } => warn!(%notice, "Notice"),
            _ => error!(%notice, "Notice"),
        }
        let mut recent = recent.lock().unwrap_or_else(PoisonError::into_inner);
        if recent.len() == RECENT_NOTICES {
            recent.pop_front();
        }
        recent.push_back(notice);
    }
}

/// Write settings and tunnel changes back to the configuration file
async fn persist_changes(
    engine: Arc<Engine>,
    path: PathBuf,
    policy: OrchestrationPolicy,
    cancel: CancellationToken,
) {
    let mut settings_rx = engine.settings().subscribe();
    let mut tunnels_rx = engine.tunnels().subscribe();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Ok(()) = settings_rx.changed() => {}
            Ok(()) = tunnels_rx.changed() => {}
            else => break,
        }

        let config = TomlConfig {
            settings: settings_rx.borrow_and_update().clone(),
            policy: policy.clone(),
            tunnels: tunnels_rx.borrow_and_update().clone(),
        };
        if let Err(e) = config.to_file(&path) {
            warn!("Failed to persist configuration: {}", e);
        }
    }
}

struct EngineHandler {
    engine: Arc<Engine>,
    notices: Arc<Mutex<VecDeque<Notice>>>,
}

impl EngineHandler {
    async fn status(&self) -> StatusReport {
        let recent_notices: Vec<Notice> = self
            .notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        StatusReport {
            tunnels: self.engine.statuses(),
            auto_tunnel_enabled: self.engine.settings().snapshot().is_auto_tunnel_enabled,
            auto_tunnel_attached: self.engine.is_auto_tunnel_attached(),
            kill_switch_engaged: self.engine.is_kill_switch_engaged().await,
            network: self.engine.network_state(),
            last_recovery: self.engine.last_recovery_success(),
            recent_notices,
        }
    }
}

#[async_trait]
impl RequestHandler for EngineHandler {
    async fn handle(&self, request: Request) -> Response {
        let result = match request {
            Request::Status => return Response::Status(Box::new(self.status().await)),
            Request::Recover => {
                return match self.engine.run_recovery_check().await {
                    Ok(actions) => Response::Recovered { actions },
                    Err(e) => Response::Failed(Failure {
                        kind: FailureKind::Runtime,
                        message: e.to_string(),
                    }),
                }
            }
            Request::Up { name } => self.engine.manual_start(&name).await,
            Request::Down { name } => self.engine.manual_stop(&name, StopReason::User).await,
            Request::SetAutoTunnel { enabled } => self.engine.toggle_auto_tunnel(enabled),
            Request::SetDebounce { seconds } => self.engine.set_debounce_delay(seconds),
            Request::PublishNetwork { state } => {
                self.engine.publish_network_state(state);
                Ok(())
            }
        };

        match result {
            Ok(()) => Response::Done,
            Err(e) => Response::Failed(failure(&e)),
        }
    }
}

fn failure(error: &AutotunError) -> Failure {
    let kind = match error {
        AutotunError::Config(_) | AutotunError::Toml(_) | AutotunError::TomlSerialize(_) => {
            FailureKind::Config
        }
        _ => FailureKind::Runtime,
    };
    Failure {
        kind,
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autotun_core::error::{ConfigError, TunnelError};

    #[test]
    fn test_configuration_errors_map_to_config_failures() {
        let error = AutotunError::Config(ConfigError::InvalidDebounceDelay { seconds: 12 });
        assert_eq!(failure(&error).kind, FailureKind::Config);

        let error = AutotunError::Tunnel(TunnelError::StartFailed {
            tunnel: "office".to_string(),
            reason: "wg-quick exited with status 1".to_string(),
        });
        let failure = failure(&error);
        assert_eq!(failure.kind, FailureKind::Runtime);
        assert!(failure.message.contains("office"));
    }

    #[test]
    fn test_missing_config_starts_with_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = load_config(&dir.path().join("config.toml")).unwrap();
        assert!(config.tunnels.is_empty());
    }
}
