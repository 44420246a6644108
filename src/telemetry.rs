//! Tracing setup.
//!
//! Console output honours `RUST_LOG` (default `info`). When a log directory
//! is configured, everything down to `debug` is also written to
//! `<dir>/fabricator.log`, replaced on every start.

use std::fs::{create_dir_all, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

pub const LOG_FILE_NAME: &str = "fabricator.log";

/// Install the global subscriber. Returns the log file path, if any.
pub fn init_tracing(log_dir: Option<&Path>) -> std::io::Result<Option<PathBuf>> {
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = fmt::layer().with_target(true).with_filter(console_filter);

    let (file_layer, log_path) = match log_dir {
        Some(dir) => {
            create_dir_all(dir)?;
            let path = dir.join(LOG_FILE_NAME);
            let file = File::create(&path)?;
            let layer = fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(log_path)
}
