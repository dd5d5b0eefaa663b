//! Bounded classification queue and its worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Classifier;
use crate::Result;
use crate::connection::{ConnectionId, WorkspaceId};
use crate::message::{MessageId, MessageRepository};

/// Queue sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Jobs buffered before new jobs are dropped.
    pub queue_capacity: usize,
    /// Classifier calls in flight at once.
    pub concurrency: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            concurrency: 4,
        }
    }
}

/// One message to classify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationJob {
    /// Workspace of the message.
    pub workspace_id: WorkspaceId,
    /// Message to classify.
    pub message_id: MessageId,
}

/// Counters since the dispatcher started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Jobs accepted onto the queue.
    pub queued: u64,
    /// Jobs dropped because the queue was full or closed.
    pub dropped: u64,
    /// Classifier calls that succeeded.
    pub succeeded: u64,
    /// Classifier calls that failed.
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    dropped: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Handle to the classification queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ClassificationDispatcher {
    sender: mpsc::Sender<ClassificationJob>,
    messages: MessageRepository,
    counters: Arc<Counters>,
}

impl ClassificationDispatcher {
    /// Start the worker. It stops when `shutdown` is cancelled (after
    /// finishing in-flight calls) or when every handle is dropped.
    #[must_use]
    pub fn spawn(
        classifier: Arc<dyn Classifier>,
        messages: MessageRepository,
        config: DispatcherConfig,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let counters = Arc::new(Counters::default());

        let worker = tokio::spawn(run_worker(
            receiver,
            classifier,
            Arc::clone(&counters),
            config.concurrency.max(1),
            shutdown,
        ));

        (
            Self {
                sender,
                messages,
                counters,
            },
            worker,
        )
    }

    /// Queue a job without waiting. Returns `false` if it was dropped.
    pub fn enqueue(&self, job: ClassificationJob) -> bool {
        match self.sender.try_send(job) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(job)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(message = %job.message_id, "classification queue full, dropping job");
                false
            }
            Err(TrySendError::Closed(job)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(message = %job.message_id, "classification worker stopped, dropping job");
                false
            }
        }
    }

    /// Queue exactly these messages. Returns how many were accepted.
    pub fn dispatch_messages(&self, workspace_id: &WorkspaceId, ids: &[MessageId]) -> usize {
        ids.iter()
            .filter(|&&message_id| {
                self.enqueue(ClassificationJob {
                    workspace_id: workspace_id.clone(),
                    message_id,
                })
            })
            .count()
    }

    /// Queue the `new_count` most recently created unclassified messages of a
    /// connection. Returns how many were accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if the messages cannot be selected.
    pub async fn dispatch_classification(
        &self,
        workspace_id: &WorkspaceId,
        new_count: u32,
        connection_id: ConnectionId,
    ) -> Result<usize> {
        if new_count == 0 {
            return Ok(0);
        }
        let ids = self
            .messages
            .recent_unclassified(connection_id, new_count)
            .await?;
        Ok(self.dispatch_messages(workspace_id, &ids))
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

async fn run_worker(
    receiver: mpsc::Receiver<ClassificationJob>,
    classifier: Arc<dyn Classifier>,
    counters: Arc<Counters>,
    concurrency: usize,
    shutdown: CancellationToken,
) {
    let classifier = classifier.as_ref();
    let counters = counters.as_ref();

    let jobs = futures::stream::unfold(receiver, |mut rx| async move {
        rx.recv().await.map(|job| (job, rx))
    });

    jobs.take_until(async move { shutdown.cancelled().await })
        .for_each_concurrent(concurrency, |job| async move {
            match classifier.classify(job.message_id, &job.workspace_id).await {
                Ok(()) => {
                    counters.succeeded.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        message = %job.message_id,
                        workspace = %job.workspace_id,
                        "classification failed: {e}"
                    );
                }
            }
        })
        .await;

    debug!("classification worker stopped");
}
