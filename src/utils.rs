//! Small filesystem helpers.

use std::path::Path;

use tokio::fs;
use tracing::{info, instrument};

use crate::error::Result;

/// Ensure a directory exists and is writable.
///
/// Creates the directory if needed, then writes and removes a probe file.
///
/// # Errors
///
/// Returns [`crate::error::HarvestError::Io`] when the directory cannot be
/// created or written to.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn ensure_writable_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).await?;
    let probe = path.join("..__probe_write__");
    fs::write(&probe, b"").await?;
    fs::remove_file(&probe).await?;
    info!("Data directory is writable");
    Ok(())
}
