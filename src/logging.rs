//! Logging initialization.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::{fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

/// Handle for the pieces of the logging setup that follow config reloads.
/// Only the level filter is live; the file appender keeps the directory it
/// was started with.
pub struct LoggingHandle {
    /// Absent when `RUST_LOG` is set — an explicit override always wins.
    filter: Option<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
    verbose: AtomicBool,
}

impl LoggingHandle {
    /// Re-apply the default filter when the runtime verbose flag flips.
    pub fn set_verbose(&self, verbose: bool) {
        if self.verbose.swap(verbose, Ordering::SeqCst) == verbose {
            return;
        }
        let Some(handle) = &self.filter else { return };
        let level = if verbose { "debug" } else { "info" };
        if handle.reload(EnvFilter::new(format!("saltpeter={level}"))).is_ok() {
            tracing::info!(verbose, "log level changed");
        }
    }

}

/// Daemon logging: stdout plus a daily-rotated file in the log directory.
/// The `verbose` runtime flag raises the default level to debug and keeps
/// following the flag across config reloads; `RUST_LOG` overrides it for
/// the life of the process. The log directory itself requires a restart.
pub fn init_logging(verbose: bool, log_dir: &str) -> Result<LoggingHandle> {
    let overridden = std::env::var_os("RUST_LOG").is_some();
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("saltpeter={default_level}")));
    let (filter_layer, filter_handle) = reload::Layer::new(env_filter);

    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "saltpeter");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    // Keep the appender's worker alive for the life of the process.
    std::mem::forget(guard);

    tracing::info!(verbose, log_dir, "logging initialized");
    Ok(LoggingHandle {
        filter: (!overridden).then_some(filter_handle),
        verbose: AtomicBool::new(verbose),
    })
}

/// Agent logging: file only, since the agent's standard descriptors point
/// at /dev/null after detachment. Without `SP_LOG_DIR` nothing is logged.
pub fn init_agent_logging(level: Option<&str>, log_dir: Option<&str>) {
    let Some(dir) = log_dir else { return };
    if std::fs::create_dir_all(dir).is_err() {
        return;
    }
    let level = level.unwrap_or("info");
    let env_filter = EnvFilter::new(format!("saltpeter={level}"));

    let file_appender = tracing_appender::rolling::daily(dir, "sp-agent");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init();
    std::mem::forget(guard);
}

/// Plain stderr logging for one-shot commands like `check-config`.
pub fn init_simple_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "saltpeter=info".into()),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
