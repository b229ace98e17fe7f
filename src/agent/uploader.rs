//! Uploads files a task left in its `artifacts/` directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use super::client::MothershipClient;
use crate::blob::BlobRef;

/// Subdirectory of the task directory collected after execution.
pub const ARTIFACTS_DIR: &str = "artifacts";

pub struct Uploader {
    client: Arc<MothershipClient>,
}

impl Uploader {
    pub fn new(client: Arc<MothershipClient>) -> Self {
        Self { client }
    }

    /// Upload every artifact of a finished task. Individual failures are
    /// logged and skipped; they never change the task's outcome.
    pub async fn upload_all(&self, task_id: Uuid, task_dir: &Path) -> Vec<BlobRef> {
        let root = task_dir.join(ARTIFACTS_DIR);
        let files = match collect_files(&root).await {
            Ok(files) => files,
            Err(e) => {
                warn!(task_id = %task_id, dir = %root.display(), error = %e, "Cannot list artifacts");
                return Vec::new();
            }
        };

        let mut uploaded = Vec::with_capacity(files.len());
        for path in files {
            let name = relative_name(&root, &path);
            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(task_id = %task_id, artifact = %name, error = %e, "Cannot read artifact");
                    continue;
                }
            };
            match self.client.upload_artifact(task_id, &name, bytes).await {
                Ok(blob) => {
                    info!(task_id = %task_id, artifact = %name, size = blob.size, "Artifact uploaded");
                    uploaded.push(blob);
                }
                Err(e) => {
                    warn!(task_id = %task_id, artifact = %name, error = %e, "Artifact upload failed");
                }
            }
        }
        uploaded
    }
}

/// All regular files under `root`, sorted. A missing root yields nothing.
async fn collect_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    if !fs::try_exists(root).await? {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let kind = entry.file_type().await?;
            if kind.is_dir() {
                pending.push(entry.path());
            } else if kind.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

/// `/`-separated path of `path` relative to `root`.
fn relative_name(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
