//! Unix socket IPC for daemon communication
//!
//! One JSON request per connection: the client writes its request, shuts
//! down its write half, and reads the JSON response until EOF.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use autotun_core::engine::TunnelReport;
use autotun_core::network::NetworkState;
use autotun_core::tunnel::{Notice, RecoveryAction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Largest request the daemon reads; real requests are well under 1 KiB
const MAX_REQUEST_BYTES: u64 = 64 * 1024;

/// Requests the CLI sends to the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Request {
    Status,
    Up { name: String },
    Down { name: String },
    SetAutoTunnel { enabled: bool },
    SetDebounce { seconds: u64 },
    PublishNetwork { state: NetworkState },
    Recover,
}

/// Snapshot served for `autotun status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub tunnels: Vec<TunnelReport>,
    pub auto_tunnel_enabled: bool,
    pub auto_tunnel_attached: bool,
    pub kill_switch_engaged: bool,
    pub network: Option<NetworkState>,
    pub last_recovery: Option<DateTime<Utc>>,
    pub recent_notices: Vec<Notice>,
}

/// How a failed request should be reported to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Config,
    Runtime,
}

/// Request failure carried back to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for Failure {}

/// Responses to [`Request`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Response {
    Status(Box<StatusReport>),
    Done,
    Recovered { actions: Vec<RecoveryAction> },
    Failed(Failure),
}

/// Answers requests on the daemon side
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}

/// IPC client for communicating with the daemon
pub struct IpcClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl IpcClient {
    pub fn new(socket_path: PathBuf, timeout: Duration) -> Self {
        Self {
            socket_path,
            timeout,
        }
    }

    /// Send a request and wait for its response
    pub fn send(&self, request: &Request) -> anyhow::Result<Response> {
        let mut stream = UnixStream::connect(&self.socket_path).with_context(|| {
            format!(
                "The autotun daemon is not running (no socket at {})",
                self.socket_path.display()
            )
        })?;
        stream
            .set_read_timeout(Some(self.timeout))
            .context("Failed to set socket timeout")?;

        let payload = serde_json::to_vec(request).context("Failed to serialize request")?;
        stream
            .write_all(&payload)
            .context("Failed to send request")?;
        stream.flush().context("Failed to flush request")?;
        // The daemon reads until EOF
        stream
            .shutdown(Shutdown::Write)
            .context("Failed to finish request")?;

        let mut buffer = Vec::new();
        stream
            .read_to_end(&mut buffer)
            .context("Failed to read response")?;

        serde_json::from_slice(&buffer).context("Failed to deserialize response")
    }

    /// Send a request that is answered with `Done`
    pub fn command(&self, request: &Request) -> anyhow::Result<()> {
        match self.send(request)? {
            Response::Done => Ok(()),
            Response::Failed(failure) => Err(failure.into()),
            other => bail!("Unexpected response: {:?}", other),
        }
    }
}

/// Serve requests until cancelled
pub async fn serve(
    socket_path: &Path,
    handler: Arc<dyn RequestHandler>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    // Clean up any stale socket
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind IPC socket {}", socket_path.display()))?;
    restrict_socket(socket_path);
    debug!("IPC listening on {:?}", socket_path);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, handler).await {
                            warn!("IPC connection error: {:#}", e);
                        }
                    });
                }
                // Keep listening
                Err(e) => warn!("IPC accept error: {}", e),
            }
        }
    }

    let _ = std::fs::remove_file(socket_path);
    Ok(())
}

async fn handle_connection(
    mut stream: tokio::net::UnixStream,
    handler: Arc<dyn RequestHandler>,
) -> anyhow::Result<()> {
    let mut buffer = Vec::new();
    (&mut stream)
        .take(MAX_REQUEST_BYTES + 1)
        .read_to_end(&mut buffer)
        .await
        .context("Failed to read IPC request")?;

    let response = if buffer.len() as u64 > MAX_REQUEST_BYTES {
        warn!("Rejecting IPC request larger than {} bytes", MAX_REQUEST_BYTES);
        Response::Failed(Failure {
            kind: FailureKind::Runtime,
            message: format!("Request exceeds {} bytes", MAX_REQUEST_BYTES),
        })
    } else {
        match serde_json::from_slice::<Request>(&buffer) {
            Ok(request) => {
                debug!(?request, "IPC request");
                handler.handle(request).await
            }
            Err(e) => Response::Failed(Failure {
                kind: FailureKind::Runtime,
                message: format!("Malformed request: {}", e),
            }),
        }
    };

    let payload = serde_json::to_vec(&response).context("Failed to serialize response")?;
    stream
        .write_all(&payload)
        .await
        .context("Failed to send response")?;
    stream.shutdown().await.context("Failed to close connection")?;
    Ok(())
}

fn restrict_socket(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660)) {
        warn!("Failed to restrict permissions on {:?}: {}", path, e);
    }
}

/// Get the default socket path
pub fn get_default_socket_path() -> PathBuf {
    // Use XDG_RUNTIME_DIR if available, otherwise /tmp
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        Path::new(&runtime_dir).join("autotun.sock")
    } else {
        Path::new("/tmp").join(format!("autotun-{}.sock", nix::unistd::getuid()))
    }
}
