//! Tracing setup: stdout plus a daily-rolling log file.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Install the global subscriber. Keep the returned guard alive until exit,
/// dropping it flushes and stops the file writer.
pub fn init(config: &Config) -> std::io::Result<WorkerGuard> {
    let (dir, file_name) = split_log_path(&config.log_file);
    std::fs::create_dir_all(&dir)?;

    let appender = tracing_appender::rolling::daily(&dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    let directive = config.log_directive();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(env_filter(&directive)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(env_filter(&directive)),
        )
        .init();

    Ok(guard)
}

/// `RUST_LOG` wins over the configured level.
fn env_filter(directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
}

fn split_log_path(path: &Path) -> (PathBuf, String) {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "whatsapp_bot.log".to_string());
    (dir, file_name)
}
