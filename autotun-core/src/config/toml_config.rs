//! TOML configuration file I/O
//!
//! Handles loading and saving settings, timing policy and tunnel definitions
//! to/from a TOML file in the user's configuration directory.

use crate::config::{OrchestrationPolicy, Settings, TunnelConf};
use crate::error::{AutotunError, ConfigError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Complete TOML configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Auto-tunnel settings
    #[serde(default)]
    pub settings: Settings,

    /// Timing policy (optional, defaults apply)
    #[serde(default)]
    pub policy: OrchestrationPolicy,

    /// Tunnels in insertion order
    #[serde(default)]
    pub tunnels: Vec<TunnelConf>,
}

impl TomlConfig {
    /// Load configuration from a TOML file
    ///
    /// A missing file yields `ConfigError::LoadFailed`; callers that want a
    /// first-run default should check `exists()` first.
    pub fn from_file(path: &Path) -> Result<Self, AutotunError> {
        let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AutotunError::Config(ConfigError::LoadFailed {
                path: path.to_string_lossy().to_string(),
            }),
            _ => AutotunError::Config(ConfigError::IoError {
                message: format!("Failed to read config file: {}", e),
            }),
        })?;

        let config: TomlConfig = toml::from_str(&contents).map_err(|e| {
            AutotunError::Config(ConfigError::ValidationError {
                message: format!("Failed to parse config file: {}", e),
            })
        })?;

        config.validate()?;

        info!(
            "Loaded configuration: {} tunnel(s), auto_tunnel={}, poll={}s, cooldown={}s",
            config.tunnels.len(),
            config.settings.is_auto_tunnel_enabled,
            config.policy.handshake_poll_interval_secs,
            config.policy.restart_cooldown_secs
        );

        Ok(config)
    }

    /// Save configuration to a TOML file
    ///
    /// The file carries private keys, so it is written owner-only.
    pub fn to_file(&self, path: &Path) -> Result<(), AutotunError> {
        self.validate()?;

        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AutotunError::Config(ConfigError::IoError {
                    message: format!("Failed to create config directory: {}", e),
                })
            })?;
        }

        write_private(path, contents.as_bytes()).map_err(|e| {
            AutotunError::Config(ConfigError::SaveFailed {
                path: path.to_string_lossy().to_string(),
                reason: e.to_string(),
            })
        })?;

        debug!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate settings, policy and every tunnel definition
    pub fn validate(&self) -> Result<(), AutotunError> {
        self.settings
            .validate()
            .map_err(|message| ConfigError::ValidationError { message })?;

        self.policy.validate().map_err(|e| {
            warn!("Policy validation failed: {}", e);
            ConfigError::ValidationError {
                message: format!("Invalid policy: {}", e),
            }
        })?;

        for tunnel in &self.tunnels {
            tunnel
                .validate()
                .map_err(|message| ConfigError::ValidationError { message })?;
        }

        Ok(())
    }
}

/// Default configuration file name
const CONFIG_FILE_NAME: &str = "config.toml";

/// Get the default configuration directory
///
/// Returns ~/.config/autotun, or AUTOTUN_CONFIG_DIR if set
pub fn get_config_dir() -> Result<PathBuf, AutotunError> {
    // Allow tests and packaging to override the config directory
    if let Ok(config_dir) = std::env::var("AUTOTUN_CONFIG_DIR") {
        return Ok(PathBuf::from(config_dir));
    }

    let home = std::env::var("HOME").map_err(|_| {
        AutotunError::Config(ConfigError::IoError {
            message: "HOME environment variable not set".to_string(),
        })
    })?;

    Ok(PathBuf::from(home).join(".config").join("autotun"))
}

/// Get the default configuration file path
pub fn get_config_path() -> Result<PathBuf, AutotunError> {
    Ok(get_config_dir()?.join(CONFIG_FILE_NAME))
}

/// Ensure the configuration directory exists
pub fn ensure_config_dir() -> Result<PathBuf, AutotunError> {
    let config_dir = get_config_dir()?;
    std::fs::create_dir_all(&config_dir).map_err(|e| {
        AutotunError::Config(ConfigError::IoError {
            message: format!("Failed to create config directory: {}", e),
        })
    })?;
    Ok(config_dir)
}

/// Load the configuration from the default path, or defaults on first run
pub fn load_or_default() -> Result<TomlConfig, AutotunError> {
    let path = get_config_path()?;
    if !path.exists() {
        info!("No configuration at {:?}, starting with defaults", path);
        return Ok(TomlConfig::default());
    }
    TomlConfig::from_file(&path)
}

/// Write `contents` so the file is never readable by anyone but the owner
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
        // Applies to new files only; an existing file keeps its mode until
        // narrowed here, before any secret is written.
        options.mode(0o600);
        let mut file = options.open(path)?;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        file.write_all(contents)
    }
    #[cfg(not(unix))]
    {
        options.open(path)?.write_all(contents)
    }
}
