//! Tunnel process driver
//!
//! The engine only ever talks to the `TunnelDriver` trait; `WgQuickDriver`
//! is the production implementation on top of wg-quick(8) and wg(8).

use crate::config::TunnelConf;
use crate::error::TunnelError;
use crate::tunnel::wg_output::WgOutputParser;
use crate::types::TunnelId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Handle to a tunnel the driver brought up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelHandle {
    pub tunnel_id: TunnelId,
    pub interface: String,
    pub config_path: PathBuf,
}

/// Brings tunnels up and down and reads their handshake
#[async_trait]
pub trait TunnelDriver: Send + Sync {
    async fn bring_up(&self, conf: &TunnelConf) -> Result<TunnelHandle, TunnelError>;

    async fn bring_down(&self, handle: &TunnelHandle) -> Result<(), TunnelError>;

    /// Newest handshake of any peer, `None` if none ever completed
    async fn last_handshake_timestamp(
        &self,
        handle: &TunnelHandle,
    ) -> Result<Option<DateTime<Utc>>, TunnelError>;
}

/// Driver shelling out to wg-quick and wg
pub struct WgQuickDriver {
    wg_quick: PathBuf,
    wg: PathBuf,
    runtime_dir: PathBuf,
    parser: WgOutputParser,
}

impl WgQuickDriver {
    /// Locate wg-quick and wg and prepare the runtime directory
    pub fn new(runtime_dir: PathBuf) -> Result<Self, TunnelError> {
        let wg_quick = which::which("wg-quick").map_err(|e| TunnelError::DriverUnavailable {
            reason: format!("wg-quick not found: {}", e),
        })?;
        let wg = which::which("wg").map_err(|e| TunnelError::DriverUnavailable {
            reason: format!("wg not found: {}", e),
        })?;

        std::fs::create_dir_all(&runtime_dir).map_err(|e| TunnelError::DriverUnavailable {
            reason: format!("Cannot create runtime dir {:?}: {}", runtime_dir, e),
        })?;

        debug!(
            "Using wg-quick at {:?}, wg at {:?}, runtime dir {:?}",
            wg_quick, wg, runtime_dir
        );

        Ok(Self {
            wg_quick,
            wg,
            runtime_dir,
            parser: WgOutputParser::new(),
        })
    }

    /// Default runtime directory: `$XDG_RUNTIME_DIR/autotun`, else `/run/autotun`
    pub fn default_runtime_dir() -> PathBuf {
        std::env::var("XDG_RUNTIME_DIR")
            .map(|dir| PathBuf::from(dir).join("autotun"))
            .unwrap_or_else(|_| PathBuf::from("/run/autotun"))
    }

    async fn write_config(&self, conf: &TunnelConf) -> Result<PathBuf, TunnelError> {
        let path = self.runtime_dir.join(format!("{}.conf", conf.name));
        let write_failed = |e: std::io::Error| TunnelError::StartFailed {
            tunnel: conf.name.clone(),
            reason: format!("Failed to write config {:?}: {}", path, e),
        };

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .await
            .map_err(write_failed)?;
        file.write_all(conf.config.expose().as_bytes())
            .await
            .map_err(write_failed)?;
        file.flush().await.map_err(write_failed)?;

        Ok(path)
    }

    async fn run_wg_quick(&self, action: &str, config_path: &Path) -> std::io::Result<std::process::Output> {
        Command::new(&self.wg_quick)
            .arg(action)
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
    }
}

fn spawn_error(tunnel: &str, e: std::io::Error) -> TunnelError {
    match e.kind() {
        std::io::ErrorKind::NotFound => TunnelError::DriverUnavailable {
            reason: format!("wg-quick disappeared: {}", e),
        },
        std::io::ErrorKind::PermissionDenied => TunnelError::PermissionDenied {
            tunnel: tunnel.to_string(),
            reason: e.to_string(),
        },
        _ => TunnelError::StartFailed {
            tunnel: tunnel.to_string(),
            reason: format!("Failed to spawn wg-quick: {}", e),
        },
    }
}

#[async_trait]
impl TunnelDriver for WgQuickDriver {
    #[tracing::instrument(skip(self, conf), fields(tunnel = %conf.name))]
    async fn bring_up(&self, conf: &TunnelConf) -> Result<TunnelHandle, TunnelError> {
        conf.config
            .validate()
            .map_err(|reason| TunnelError::InvalidConfig {
                tunnel: conf.name.clone(),
                reason,
            })?;

        let config_path = self.write_config(conf).await?;
        let output = self
            .run_wg_quick("up", &config_path)
            .await
            .map_err(|e| spawn_error(&conf.name, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let _ = tokio::fs::remove_file(&config_path).await;
            return Err(self.parser.classify_up_failure(&conf.name, &stderr));
        }

        info!("wg-quick brought up {}", conf.name);
        Ok(TunnelHandle {
            tunnel_id: conf.id,
            interface: conf.name.clone(),
            config_path,
        })
    }

    #[tracing::instrument(skip(self, handle), fields(tunnel = %handle.interface))]
    async fn bring_down(&self, handle: &TunnelHandle) -> Result<(), TunnelError> {
        let output = self
            .run_wg_quick("down", &handle.config_path)
            .await
            .map_err(|e| TunnelError::StopFailed {
                tunnel: handle.interface.clone(),
                reason: format!("Failed to spawn wg-quick: {}", e),
            })?;

        if let Err(e) = tokio::fs::remove_file(&handle.config_path).await {
            warn!("Failed to remove {:?}: {}", handle.config_path, e);
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.parser.classify_down_failure(&handle.interface, &stderr));
        }

        info!("wg-quick brought down {}", handle.interface);
        Ok(())
    }

    async fn last_handshake_timestamp(
        &self,
        handle: &TunnelHandle,
    ) -> Result<Option<DateTime<Utc>>, TunnelError> {
        let read_failed = |reason: String| TunnelError::HandshakeReadFailed {
            tunnel: handle.interface.clone(),
            reason,
        };

        let output = Command::new(&self.wg)
            .args(["show", handle.interface.as_str(), "latest-handshakes"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| read_failed(format!("Failed to spawn wg: {}", e)))?;

        if !output.status.success() {
            return Err(read_failed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        self.parser
            .parse_latest_handshakes(&String::from_utf8_lossy(&output.stdout))
            .map_err(read_failed)
    }
}
