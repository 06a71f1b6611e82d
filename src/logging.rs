//! Tracing initialization.

use std::fs::{self, OpenOptions};
use std::path::Path;

use anyhow::Result;

/// Initialize file logging for an embedding application. Respects
/// `RUST_LOG`, defaults to WARN, and strips ANSI colors since the output
/// is a file.
pub fn init_file_logging(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("switchyard.log"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    Ok(())
}
