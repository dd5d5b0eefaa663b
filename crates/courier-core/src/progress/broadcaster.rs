//! Per-workspace progress channels.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

use super::model::{PROGRESS_EVENT, ProgressEvent, SyncProgress};
use crate::connection::WorkspaceId;

const DEFAULT_CAPACITY: usize = 64;

/// Topic name for a workspace.
#[must_use]
pub fn topic_for(workspace_id: &WorkspaceId) -> String {
    format!("sync-progress:{workspace_id}")
}

/// Fan-out of progress events to live subscribers.
///
/// Channels are created on first subscription. Publishing to a workspace
/// nobody listens to is a no-op; a slow subscriber loses the oldest events.
#[derive(Debug, Clone)]
pub struct ProgressBroadcaster {
    channels: Arc<DashMap<WorkspaceId, broadcast::Sender<ProgressEvent>>>,
    capacity: usize,
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ProgressBroadcaster {
    /// Create a broadcaster whose channels buffer `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to a workspace's events.
    #[must_use]
    pub fn subscribe(&self, workspace_id: &WorkspaceId) -> broadcast::Receiver<ProgressEvent> {
        self.channels
            .entry(workspace_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish a snapshot. Returns the number of subscribers reached.
    pub fn publish(&self, workspace_id: &WorkspaceId, progress: SyncProgress) -> usize {
        let Some(sender) = self.channels.get(workspace_id).map(|s| s.clone()) else {
            return 0;
        };

        let event = ProgressEvent {
            topic: topic_for(workspace_id),
            event: PROGRESS_EVENT.to_string(),
            payload: progress,
        };

        match sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                // Everyone left; drop the channel unless a subscriber raced in.
                self.channels
                    .remove_if(workspace_id, |_, s| s.receiver_count() == 0);
                trace!(workspace = %workspace_id, "no progress subscribers");
                0
            }
        }
    }

    /// Number of live subscribers for a workspace.
    #[must_use]
    pub fn subscriber_count(&self, workspace_id: &WorkspaceId) -> usize {
        self.channels
            .get(workspace_id)
            .map_or(0, |s| s.receiver_count())
    }
}
