//! Tracing configuration and log routing.
//!
//! The server logs to stdout with a compact formatter and, when a log file can be opened,
//! to disk as well. `ARCHON_LOG_FILE` names an exact file; otherwise `ARCHON_LOG_DIR`
//! (default `logs/`) receives an `archon.log`. The file writer is non-blocking so slow
//! disks never stall request handling; a process-lifetime guard keeps it flushing.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Configure tracing subscribers for stdout and optional file logging.
///
/// Respects `RUST_LOG` for filtering (defaults to `info`). The stdout layer stays terse
/// (no targets); the file layer keeps targets and drops ANSI colour so logs grep cleanly.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_target(false).compact();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer);

    match configure_file_writer() {
        Some(writer) => {
            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false)
                .compact();
            registry.with(file_layer).init();
        }
        None => registry.init(),
    }
}

/// Build a non-blocking writer for file logging.
///
/// Returns `None` when neither the configured file nor the log directory is usable; the
/// server still runs with stdout-only logging in that case.
fn configure_file_writer() -> Option<NonBlocking> {
    if let Ok(path) = std::env::var("ARCHON_LOG_FILE") {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| eprintln!("Failed to open log file {path}: {err}"))
            .ok()?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let _ = LOG_GUARD.set(guard);
        return Some(non_blocking);
    }

    let directory = std::env::var("ARCHON_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("logs"));
    if let Err(err) = std::fs::create_dir_all(&directory) {
        eprintln!("Failed to create log directory {}: {err}", directory.display());
        return None;
    }
    let file_appender = tracing_appender::rolling::never(directory, "archon.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);
    Some(non_blocking)
}
