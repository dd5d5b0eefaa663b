//! Progress model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connection::ProviderKind;

/// Event name carried by every progress envelope.
pub const PROGRESS_EVENT: &str = "sync.progress";

/// Phase of one connection sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    /// Loading the connection and credentials.
    Connecting,
    /// Waiting on the provider.
    Fetching,
    /// Storing fetched items.
    Syncing,
    /// Handing new messages to the classifier.
    Classifying,
    /// Finished successfully.
    Complete,
    /// Finished with an error.
    Error,
}

impl SyncPhase {
    /// Whether no further events follow in this session.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

/// Snapshot of one connection sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    /// Current phase.
    pub phase: SyncPhase,
    /// Provider being synced.
    pub provider: ProviderKind,
    /// Connection display name.
    pub connection_name: String,
    /// Items in the fetched page.
    pub total_messages: u32,
    /// Items processed so far.
    pub synced_messages: u32,
    /// New messages handed to the classifier.
    pub classified_messages: u32,
    /// Item being processed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_message: Option<String>,
    /// Failure description (phase `error` only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
}

impl SyncProgress {
    /// Initial snapshot for a connection.
    #[must_use]
    pub fn new(provider: ProviderKind, connection_name: impl Into<String>) -> Self {
        Self {
            phase: SyncPhase::Connecting,
            provider,
            connection_name: connection_name.into(),
            total_messages: 0,
            synced_messages: 0,
            classified_messages: 0,
            current_message: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Overall completion in percent.
    ///
    /// `connecting` 5, `fetching` 10, `syncing` 10 to 60 by synced/total,
    /// `classifying` 60 to 100 by classified/synced, `complete` 100,
    /// `error` 0. A zero denominator maps to the start of the band.
    #[must_use]
    pub fn percent(&self) -> f64 {
        match self.phase {
            SyncPhase::Connecting => 5.0,
            SyncPhase::Fetching => 10.0,
            SyncPhase::Syncing => {
                50.0f64.mul_add(ratio(self.synced_messages, self.total_messages), 10.0)
            }
            SyncPhase::Classifying => {
                40.0f64.mul_add(ratio(self.classified_messages, self.synced_messages), 60.0)
            }
            SyncPhase::Complete => 100.0,
            SyncPhase::Error => 0.0,
        }
    }
}

fn ratio(done: u32, total: u32) -> f64 {
    if total == 0 {
        0.0
    } else {
        (f64::from(done) / f64::from(total)).clamp(0.0, 1.0)
    }
}

/// Wire envelope published on a workspace topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// `sync-progress:{workspaceId}`.
    pub topic: String,
    /// Always [`PROGRESS_EVENT`].
    pub event: String,
    /// Progress snapshot.
    pub payload: SyncProgress,
}
