//! Core library for the autotun daemon
//!
//! This crate turns network-condition snapshots into tunnel decisions,
//! drives WireGuard tunnels through their lifecycle behind a kill switch,
//! and supervises handshake health.

pub mod error;
pub mod types;

pub mod config;
pub mod engine;
pub mod network;
pub mod tunnel;

/// Environment variable overriding the log level
pub const LOG_LEVEL_ENV: &str = "AUTOTUN_LOG";

/// Initialize logging infrastructure
///
/// Sets up tracing with systemd journal logging for production use.
/// In development, logs to stderr with appropriate formatting.
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let level = match std::env::var(LOG_LEVEL_ENV) {
        Ok(value) => value.parse::<LevelFilter>()?,
        Err(_) => LevelFilter::INFO,
    };

    // Try to use systemd journal logging if available
    #[cfg(target_os = "linux")]
    {
        if std::env::var("JOURNAL_STREAM").is_ok() {
            // We're running under systemd, use journal logging
            let journal_layer = tracing_journald::layer()?;
            tracing_subscriber::registry()
                .with(journal_layer)
                .with(level)
                .try_init()?;
            return Ok(());
        }
    }

    // Fallback to stderr logging with pretty formatting
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
        .with(level)
        .try_init()?;

    Ok(())
}
