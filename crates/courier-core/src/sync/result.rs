//! Sync options and results.

use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionId, ProviderKind};
use crate::message::MessageId;

/// Default page size.
pub const DEFAULT_MAX_MESSAGES: u32 = 50;

/// Per-call sync options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncOptions {
    /// Page size requested from the provider.
    pub max_messages: u32,
    /// Hand new messages to the classifier.
    pub auto_classify: bool,
    /// Provider query refinement.
    pub filter: Option<String>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            auto_classify: true,
            filter: None,
        }
    }
}

/// Outcome of syncing one connection's page.
///
/// `synced_count` is `new_count` plus the items that already existed;
/// `error_count` is tracked independently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSyncResult {
    /// The page was fetched and processed.
    pub success: bool,
    /// Items stored or found already stored.
    pub synced_count: u32,
    /// Items stored for the first time.
    pub new_count: u32,
    /// Items that failed individually.
    pub error_count: u32,
    /// The provider has more items past this page.
    pub has_more: bool,
    /// Why the sync failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Ids of the rows inserted by this sync.
    #[serde(skip)]
    pub new_message_ids: Vec<MessageId>,
}

impl ProviderSyncResult {
    /// A failed sync with an explanation.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Outcome of syncing one connection, tagged with the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    /// Connection that was synced.
    pub connection_id: ConnectionId,
    /// Its provider, if the connection could be loaded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderKind>,
    /// Counters and status.
    #[serde(flatten)]
    pub outcome: ProviderSyncResult,
}

impl SyncResult {
    /// A failed sync of a connection.
    #[must_use]
    pub fn failure(
        connection_id: ConnectionId,
        provider: Option<ProviderKind>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            connection_id,
            provider,
            outcome: ProviderSyncResult::failure(message),
        }
    }

    /// Whether the sync succeeded.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.outcome.success
    }
}

/// Outcome of syncing every active connection of a workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSyncSummary {
    /// Active connections found.
    pub total_connections: usize,
    /// Sum of `new_count` over all connections.
    pub total_new_messages: u64,
    /// One result per connection, in sync order.
    pub results: Vec<SyncResult>,
}
