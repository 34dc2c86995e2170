//! Diagnostic logging.
//!
//! stdout carries the protocol result, so logs go to stderr or to the
//! configured log file, appended with timestamps.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::Settings;

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init(settings: Option<&Settings>) -> Result<()> {
    let level = settings
        .and_then(|s| s.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // An unwritable log file must not turn into a failed teardown
    let log_file = settings.and_then(|s| s.log_file.as_ref());
    let writer = match log_file.map(|path| OpenOptions::new().create(true).append(true).open(path)) {
        Some(Ok(file)) => BoxMakeWriter::new(Mutex::new(file)),
        Some(Err(e)) => {
            eprintln!("eni-cni: cannot open log file, logging to stderr: {}", e);
            BoxMakeWriter::new(io::stderr)
        }
        None => BoxMakeWriter::new(io::stderr),
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set default subscriber")?;
    Ok(())
}
