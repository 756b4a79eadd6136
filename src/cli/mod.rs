//! CLI command implementations
//!
//! Everything except `daemon` and `tunnels` talks to a running daemon over
//! the IPC socket.

use std::time::Duration;

use crate::daemon::ipc::{get_default_socket_path, IpcClient};

pub mod control;
pub mod status;

/// Long enough for a start plus its kill-switch bracket
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Client for the daemon on the default socket
pub fn client() -> IpcClient {
    IpcClient::new(get_default_socket_path(), COMMAND_TIMEOUT)
}
