//! Per-runner latest-frame channels.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{RwLock, watch};
use tracing::debug;
use uuid::Uuid;

use super::model::{ScreenFrame, ScreenStatus};

type Slot = watch::Sender<Option<Arc<ScreenFrame>>>;

/// Holds exactly one frame per runner.
///
/// A new frame overwrites the previous one whether or not any viewer has seen
/// it. Viewers hold a `watch::Receiver`, so they always wake up to the newest
/// frame and a slow viewer never holds back the uploader.
pub struct ScreenHub {
    slots: RwLock<HashMap<Uuid, Slot>>,
    freshness: Duration,
}

impl ScreenHub {
    pub fn new(freshness: Duration) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            freshness,
        }
    }

    /// Store `frame` as the runner's latest, replacing any unread frame.
    /// Returns the sequence number assigned to it.
    pub async fn publish(&self, mut frame: ScreenFrame) -> u64 {
        let runner_id = frame.runner_id;
        let slot = self.slot(runner_id).await;
        let mut sequence = 0;
        slot.send_modify(|current| {
            sequence = current.as_ref().map_or(0, |f| f.sequence) + 1;
            frame.sequence = sequence;
            *current = Some(Arc::new(frame));
        });
        debug!(runner_id = %runner_id, sequence, viewers = slot.receiver_count(), "Screen frame stored");
        sequence
    }

    /// Attach a viewer. The receiver starts at the current frame, if any.
    ///
    /// Creates the runner's slot when missing; callers check the runner
    /// exists first.
    pub async fn subscribe(&self, runner_id: Uuid) -> watch::Receiver<Option<Arc<ScreenFrame>>> {
        self.slot(runner_id).await.subscribe()
    }

    /// Drop the runner's slot. Attached viewers see the channel close.
    pub async fn remove(&self, runner_id: Uuid) {
        if self.slots.write().await.remove(&runner_id).is_some() {
            debug!(runner_id = %runner_id, "Screen slot removed");
        }
    }

    pub async fn latest(&self, runner_id: Uuid) -> Option<Arc<ScreenFrame>> {
        self.slots
            .read()
            .await
            .get(&runner_id)
            .and_then(|slot| slot.borrow().clone())
    }

    /// Timestamp and liveness of the runner's stream.
    pub async fn status(&self, runner_id: Uuid) -> ScreenStatus {
        let slots = self.slots.read().await;
        let slot = slots.get(&runner_id);
        let frame = slot.and_then(|s| s.borrow().clone());
        let viewer_count = slot.map_or(0, |s| s.receiver_count());

        let freshness = chrono::Duration::from_std(self.freshness).unwrap_or(chrono::Duration::MAX);
        let live = frame
            .as_ref()
            .is_some_and(|f| Utc::now() - f.captured_at < freshness);
        ScreenStatus {
            runner_id,
            last_frame_at: frame.as_ref().map(|f| f.captured_at),
            live,
            sequence: frame.as_ref().map_or(0, |f| f.sequence),
            width: frame.as_ref().map_or(0, |f| f.width),
            height: frame.as_ref().map_or(0, |f| f.height),
            viewer_count,
        }
    }

    async fn slot(&self, runner_id: Uuid) -> Slot {
        if let Some(slot) = self.slots.read().await.get(&runner_id) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry(runner_id)
            .or_insert_with(|| watch::channel(None).0)
            .clone()
    }
}
