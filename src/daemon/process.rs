//! Daemon process management
//!
//! PID file handling, liveness checks and detaching from the terminal.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context};
use daemonize::Daemonize;
use tracing::info;

/// Represents the daemon process and owns its PID file
pub struct DaemonProcess {
    pid_file: PathBuf,
}

impl DaemonProcess {
    /// Create a new daemon process manager
    pub fn new(pid_file: PathBuf) -> Self {
        Self { pid_file }
    }

    /// Check if a daemon is already running
    ///
    /// A PID file left behind by a dead process is removed.
    pub fn is_running(&self) -> anyhow::Result<bool> {
        let Some(pid) = self.read_pid()? else {
            return Ok(false);
        };

        match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None) {
            Ok(()) => Ok(true),
            Err(nix::errno::Errno::ESRCH) => {
                // Process doesn't exist, clean up PID file
                let _ = fs::remove_file(&self.pid_file);
                Ok(false)
            }
            // Alive but owned by someone else
            Err(nix::errno::Errno::EPERM) => Ok(true),
            Err(e) => Err(e).context("Failed to check daemon process status"),
        }
    }

    /// Refuse to start next to a live daemon
    pub fn ensure_not_running(&self) -> anyhow::Result<()> {
        if self.is_running()? {
            bail!(
                "autotun daemon is already running (PID file {})",
                self.pid_file.display()
            );
        }
        Ok(())
    }

    /// Detach from the terminal; the PID file is written by the child
    ///
    /// Must run before any async runtime is started.
    pub fn daemonize(&self) -> anyhow::Result<()> {
        self.ensure_parent()?;

        let daemonize = Daemonize::new()
            .pid_file(&self.pid_file)
            .chown_pid_file(true)
            .working_directory("/")
            .umask(0o027); // Restrictive permissions

        daemonize
            .start()
            .context("Failed to daemonize process")?;

        info!("Successfully daemonized process, PID: {}", process::id());
        Ok(())
    }

    /// Record the current process when staying in the foreground
    pub fn write_pid_file(&self) -> anyhow::Result<()> {
        self.ensure_parent()?;
        fs::write(&self.pid_file, format!("{}\n", process::id()))
            .with_context(|| format!("Failed to write PID file {}", self.pid_file.display()))
    }

    fn read_pid(&self) -> anyhow::Result<Option<i32>> {
        if !self.pid_file.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.pid_file).context("Failed to read PID file")?;
        let pid = content
            .trim()
            .parse()
            .with_context(|| format!("Invalid PID in PID file: {:?}", content.trim()))?;
        Ok(Some(pid))
    }

    fn ensure_parent(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.pid_file.parent() {
            fs::create_dir_all(parent).context("Failed to create PID file directory")?;
        }
        Ok(())
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        // Only the owning daemon removes its own PID file
        if matches!(self.read_pid(), Ok(Some(pid)) if pid == process::id() as i32) {
            let _ = fs::remove_file(&self.pid_file);
        }
    }
}

/// Get the default PID file path
pub fn get_default_pid_file() -> PathBuf {
    // Use XDG_RUNTIME_DIR if available, otherwise /tmp
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        Path::new(&runtime_dir).join("autotun.pid")
    } else {
        Path::new("/tmp").join(format!("autotun-{}.pid", nix::unistd::getuid()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_no_pid_file_is_not_running() {
        let dir = TempDir::new().unwrap();
        let daemon = DaemonProcess::new(dir.path().join("autotun.pid"));
        assert!(!daemon.is_running().unwrap());
    }

    #[test]
    fn test_own_pid_is_running_and_cleaned_up() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("run").join("autotun.pid");

        {
            let daemon = DaemonProcess::new(pid_file.clone());
            daemon.write_pid_file().unwrap();
            assert!(daemon.is_running().unwrap());
            assert!(daemon.ensure_not_running().is_err());
        }

        assert!(!pid_file.exists());
    }

    #[test]
    fn test_stale_pid_file_is_removed() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("autotun.pid");
        // Far above any default pid_max
        fs::write(&pid_file, "99999999\n").unwrap();

        let daemon = DaemonProcess::new(pid_file.clone());

        assert!(!daemon.is_running().unwrap());
        assert!(!pid_file.exists());
    }

    #[test]
    fn test_garbage_pid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("autotun.pid");
        fs::write(&pid_file, "not-a-pid").unwrap();

        let daemon = DaemonProcess::new(pid_file);

        assert!(daemon.is_running().is_err());
    }
}
