//! Fetches a task's input files before it runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::client::MothershipClient;
use crate::error::TransportError;

/// Destination of the `index`-th required file inside the task directory.
pub fn destination(task_dir: &Path, index: usize) -> PathBuf {
    task_dir.join(format!("file_{index}"))
}

pub struct Downloader {
    client: Arc<MothershipClient>,
    timeout: Duration,
}

impl Downloader {
    pub fn new(client: Arc<MothershipClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Download every file in order. Stops at the first failure.
    pub async fn fetch_all(
        &self,
        task_id: Uuid,
        file_ids: &[Uuid],
        task_dir: &Path,
    ) -> Result<Vec<PathBuf>, TransportError> {
        let mut paths = Vec::with_capacity(file_ids.len());
        for (index, file_id) in file_ids.iter().enumerate() {
            let dest = destination(task_dir, index);
            let size = self.fetch_one(*file_id, &dest).await.inspect_err(|e| {
                warn!(task_id = %task_id, file_id = %file_id, error = %e, "Input download failed");
            })?;
            debug!(task_id = %task_id, file_id = %file_id, size, dest = %dest.display(), "Input downloaded");
            paths.push(dest);
        }
        if !paths.is_empty() {
            info!(task_id = %task_id, files = paths.len(), "Inputs ready");
        }
        Ok(paths)
    }

    /// Download one file. A partial destination is removed on failure.
    async fn fetch_one(&self, file_id: Uuid, dest: &Path) -> Result<u64, TransportError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(dest).await?;
        let result = self
            .client
            .download_file(file_id, &mut file, self.timeout)
            .await;
        drop(file);
        if result.is_err() {
            if let Err(e) = fs::remove_file(dest).await {
                warn!(dest = %dest.display(), error = %e, "Failed to remove partial download");
            }
        }
        result
    }
}
