//! Tracing subscriber setup

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Install the global subscriber. Logs go to stderr unless a file is set,
/// keeping stdout for command output.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let level: Level = config
        .level
        .parse()
        .with_context(|| format!("Invalid log level {:?}", config.level))?;
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true);

    let installed = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let writer = Mutex::new(file);
            if config.json {
                tracing::subscriber::set_global_default(builder.json().with_writer(writer).finish())
            } else {
                tracing::subscriber::set_global_default(
                    builder.with_ansi(false).with_writer(writer).finish(),
                )
            }
        }
        None if config.json => tracing::subscriber::set_global_default(
            builder.json().with_writer(std::io::stderr).finish(),
        ),
        None => tracing::subscriber::set_global_default(builder.with_writer(std::io::stderr).finish()),
    };

    installed.context("Failed to set tracing subscriber")
}
