//! Best-effort hand-off of new messages to an external classifier.
//!
//! Classification never affects sync correctness: jobs go onto a bounded
//! queue, a full queue drops the job, and classifier failures are only
//! logged and counted.

mod dispatcher;
mod http;

use async_trait::async_trait;
use thiserror::Error;

pub use dispatcher::{ClassificationDispatcher, ClassificationJob, DispatchStats, DispatcherConfig};
pub use http::HttpClassifier;

use crate::connection::WorkspaceId;
use crate::message::MessageId;

/// Errors reported by a classifier.
#[derive(Debug, Error)]
pub enum ClassifierError {
    /// Transport failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The classifier answered with a non-success status.
    #[error("Classifier rejected message {message}: HTTP {status}")]
    Rejected {
        /// Message that was sent.
        message: MessageId,
        /// HTTP status code.
        status: u16,
    },

    /// The classifier did not answer in time.
    #[error("Classifier timed out")]
    Timeout,
}

/// External classifier. Mutates the message's classifier fields as a side
/// effect.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify one message.
    ///
    /// # Errors
    ///
    /// Returns an error if the classifier could not be reached or refused the
    /// message.
    async fn classify(
        &self,
        message_id: MessageId,
        workspace_id: &WorkspaceId,
    ) -> Result<(), ClassifierError>;
}
