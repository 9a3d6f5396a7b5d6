//! Logging setup driven by environment variables.
//!
//! Without `EDITOR_RPC_LOG_FILE` logs go to stderr, filtered by `RUST_LOG`
//! (default `editor_rpc=info`). Stdout is never used since it may be the RPC
//! channel itself.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log file prefix; the file is `<prefix>_<name>`.
pub const LOG_FILE_ENV: &str = "EDITOR_RPC_LOG_FILE";
/// Level used with `LOG_FILE_ENV` (`error`, `warn`, `info`, `debug`, `trace`).
pub const LOG_LEVEL_ENV: &str = "EDITOR_RPC_LOG_LEVEL";

const DEFAULT_FILTER: &str = "editor_rpc=info";

/// Path of the log file for `name` under `prefix`.
pub fn log_file_path(prefix: &str, name: &str) -> PathBuf {
    PathBuf::from(format!("{}_{}", prefix.trim(), name))
}

/// Parse a level name, falling back to `INFO`.
///
/// Returns the rejected input alongside so the caller can warn about it once
/// logging is up.
pub fn resolve_level(raw: Option<&str>) -> (Level, Option<String>) {
    match raw.map(str::trim) {
        None | Some("") => (Level::INFO, None),
        Some(value) => match value.parse::<Level>() {
            Ok(level) => (level, None),
            Err(_) => (Level::INFO, Some(value.to_string())),
        },
    }
}

/// Install the global subscriber for a process called `name`.
///
/// Fails if a subscriber is already installed or the log file can't be created.
pub fn setup_logging(name: &str) -> Result<()> {
    let Some(prefix) = std::env::var(LOG_FILE_ENV)
        .ok()
        .filter(|p| !p.trim().is_empty())
    else {
        tracing_subscriber::registry()
            .with(EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.into()),
            ))
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .context("Failed to install tracing subscriber")?;
        return Ok(());
    };

    let path = log_file_path(&prefix, name);
    let file = File::create(&path)
        .with_context(|| format!("Failed to create log file {}", path.display()))?;
    let raw_level = std::env::var(LOG_LEVEL_ENV).ok();
    let (level, invalid) = resolve_level(raw_level.as_deref());

    tracing_subscriber::registry()
        .with(EnvFilter::new(format!(
            "editor_rpc={}",
            level.as_str().to_ascii_lowercase()
        )))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    if let Some(value) = invalid {
        tracing::warn!("Invalid {}: {:?}, using INFO.", LOG_LEVEL_ENV, value);
    }
    tracing::info!("Logging to {} (pid {})", path.display(), std::process::id());
    Ok(())
}
