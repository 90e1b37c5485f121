//! Structured logging for orca.
//!
//! Log levels follow the usual `tracing` meaning:
//! - ERROR: Failures that lose work or durability
//! - WARN: Unexpected conditions that are recoverable (retries, degraded snapshots)
//! - INFO: Lifecycle notifications (configure, task start/finish, restart, shutdown)
//! - DEBUG: Per-step dispatch traces
//! - TRACE: Event delivery and wait-set evaluation
//!
//! Debug mode can be enabled with `--debug` flag or `ORCA_DEBUG=1` env var.
//! `RUST_LOG` always wins over both when set.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

/// Environment variable that turns on debug logging.
pub const DEBUG_ENV: &str = "ORCA_DEBUG";

/// Check whether debug mode is requested through the environment.
pub fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

/// Path of the log file, `~/.orca/orca.log`.
pub fn log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".orca").join("orca.log"))
}

/// Initialize logging with explicit debug mode setting.
///
/// In debug mode the log goes to `~/.orca/orca.log` (truncated on startup);
/// otherwise it goes to stderr. Calling this more than once is harmless.
pub fn init_with_debug(debug: bool, default_level: &str) {
    let debug_enabled = debug || env_debug();
    let level = if debug_enabled { "debug" } else { default_level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file = if debug_enabled {
        log_path().and_then(|path| {
            if let Some(dir) = path.parent() {
                let _ = std::fs::create_dir_all(dir);
            }
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)
                .ok()
        })
    } else {
        None
    };

    let result = match file {
        Some(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init(),
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
