//! Checkpoint save/restore for crash recovery.
//!
//! After each node completes, the runner can persist a
//! [`Checkpoint`](pipeweave_types::Checkpoint) to `<logs_root>/checkpoint.json`,
//! overwriting the previous one. On restart, [`load_checkpoint`] discovers
//! it so a run can resume from the last completed node instead of starting
//! over.

use std::path::{Path, PathBuf};

use pipeweave_types::Checkpoint;

const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Save a checkpoint, creating `logs_root` if needed.
pub async fn save_checkpoint(checkpoint: &Checkpoint, logs_root: &Path) -> pipeweave_types::Result<PathBuf> {
    tokio::fs::create_dir_all(logs_root).await?;
    let path = logs_root.join(CHECKPOINT_FILE);
    let checkpoint = checkpoint.clone();
    let write_path = path.clone();
    tokio::task::spawn_blocking(move || checkpoint.save(&write_path))
        .await
        .map_err(|e| pipeweave_types::PipeweaveError::Other(e.to_string()))??;
    tracing::debug!(path = %path.display(), "checkpoint saved");
    Ok(path)
}

/// Load the checkpoint from a directory, or `None` if none exists yet.
pub async fn load_checkpoint(logs_root: &Path) -> pipeweave_types::Result<Option<Checkpoint>> {
    let path = logs_root.join(CHECKPOINT_FILE);
    if !tokio::fs::try_exists(&path).await? {
        return Ok(None);
    }
    let checkpoint = tokio::task::spawn_blocking(move || Checkpoint::load(&path))
        .await
        .map_err(|e| pipeweave_types::PipeweaveError::Other(e.to_string()))??;
    Ok(Some(checkpoint))
}

/// Delete the checkpoint after a successful run.
pub async fn clear_checkpoint(logs_root: &Path) -> pipeweave_types::Result<()> {
    let path = logs_root.join(CHECKPOINT_FILE);
    if tokio::fs::try_exists(&path).await? {
        tokio::fs::remove_file(&path).await?;
    }
    Ok(())
}
