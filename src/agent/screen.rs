//! Periodic screen capture and upload.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use super::client::MothershipClient;
use crate::error::{Error, ExecutionError};
use crate::screen::model::{FrameUpload, image_dimensions};

/// Lower bound on how long one capture may run before it is abandoned.
const MIN_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Produces one encoded (PNG or JPEG) screen image per call.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn capture(&self) -> Result<Vec<u8>, ExecutionError>;
}

/// Runs a shell command that writes an image to stdout, e.g.
/// `import -window root png:-` or `screencapture -x -t png /dev/stdout`.
pub struct CommandFrameSource {
    command: String,
}

impl CommandFrameSource {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl FrameSource for CommandFrameSource {
    async fn capture(&self) -> Result<Vec<u8>, ExecutionError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ExecutionError::LaunchFailed {
                program: self.command.clone(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(ExecutionError::LaunchFailed {
                program: self.command.clone(),
                reason: format!(
                    "exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(output.stdout)
    }
}

/// Build the upload body for one captured image.
pub fn frame_upload(runner_id: Uuid, image: Vec<u8>) -> FrameUpload {
    let (width, height) = image_dimensions(&image).unwrap_or((0, 0));
    FrameUpload {
        runner_id: Some(runner_id),
        timestamp: Some(Utc::now()),
        width,
        height,
        image,
    }
}

/// Run one capture, giving up after `limit`. Dropping the capture future
/// kills a command-backed source's child process.
async fn capture_within(source: &dyn FrameSource, limit: Duration) -> Result<Vec<u8>, Error> {
    match tokio::time::timeout(limit, source.capture()).await {
        Ok(image) => Ok(image?),
        Err(_) => Err(Error::Timeout(limit)),
    }
}

async fn capture_and_upload(
    client: &MothershipClient,
    runner_id: Uuid,
    source: &dyn FrameSource,
    limit: Duration,
) {
    let image = match capture_within(source, limit).await {
        Ok(image) if !image.is_empty() => image,
        Ok(_) => {
            warn!("Screen capture produced no data");
            return;
        }
        Err(e) => {
            warn!(error = %e, "Screen capture failed");
            return;
        }
    };
    let size = image.len();
    match client.upload_frame(runner_id, &frame_upload(runner_id, image)).await {
        Ok(()) => debug!(size, "Screen frame uploaded"),
        Err(e) => warn!(error = %e, "Screen frame upload failed"),
    }
}

/// Capture and upload a frame every `interval` until `shutdown` fires.
/// Shutdown also interrupts a capture or upload in progress.
pub fn spawn_screen_capture(
    client: Arc<MothershipClient>,
    runner_id: Uuid,
    source: Arc<dyn FrameSource>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let limit = interval.max(MIN_CAPTURE_TIMEOUT);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            tokio::select! {
                _ = capture_and_upload(&client, runner_id, source.as_ref(), limit) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!("Screen capture stopped");
    })
}
