//! Periodic heartbeat: reports load, receives cancellations, and now and
//! then refreshes the runner's resource figures.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::client::MothershipClient;
use super::resources::ResourceDetector;
use super::runner::ActiveTasks;
use crate::runners::model::RunnerResources;

/// Every this many beats the heartbeat carries fresh disk, memory and
/// public IP figures.
pub const RESOURCE_SYNC_EVERY: u64 = 10;

/// Heartbeat until `shutdown` fires. The first beat goes out immediately.
///
/// Failures are logged and retried on the next tick; the control plane
/// decides liveness, not the agent.
pub fn spawn_heartbeat(
    client: Arc<MothershipClient>,
    runner_id: Uuid,
    active: Arc<ActiveTasks>,
    resources: Arc<ResourceDetector>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = interval;
        let mut beats: u64 = 0;
        loop {
            beats += 1;
            let update = if beats % RESOURCE_SYNC_EVERY == 0 {
                Some(resources.refresh().await)
            } else {
                None
            };
            if let Some(next) = beat(&client, runner_id, &active, update).await {
                if next != interval {
                    debug!(secs = next.as_secs(), "Heartbeat interval changed by mothership");
                    interval = next;
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!(runner_id = %runner_id, "Heartbeat stopped");
    })
}

/// Send one heartbeat and act on the response. Returns the interval the
/// control plane asked for, if any.
async fn beat(
    client: &MothershipClient,
    runner_id: Uuid,
    active: &ActiveTasks,
    resources: Option<RunnerResources>,
) -> Option<Duration> {
    let load = active.len().await;
    let resp = match client.heartbeat(runner_id, load, resources).await {
        Ok(resp) => resp,
        Err(e) if e.is_not_found() => {
            warn!(runner_id = %runner_id, "Mothership does not know this runner; restart the agent to re-register");
            return None;
        }
        Err(e) => {
            warn!(runner_id = %runner_id, error = %e, "Heartbeat failed");
            return None;
        }
    };

    for task_id in resp.cancel_task_ids {
        if active.cancel(task_id).await {
            info!(task_id = %task_id, "Cancelling task at mothership's request");
        } else {
            debug!(task_id = %task_id, "Cancellation for a task not running here");
        }
    }

    (resp.next_heartbeat_interval > 0).then(|| Duration::from_secs(resp.next_heartbeat_interval))
}
