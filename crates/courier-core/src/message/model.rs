//! Message model types.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connection::{ChannelConnection, ConnectionId, WorkspaceId};
use crate::contacts::ContactId;

/// Unique identifier for a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl MessageId {
    /// Create a new message ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A normalized message produced by a provider adapter, not yet stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// Connection the message was fetched through.
    pub channel_connection_id: ConnectionId,
    /// Provider's identifier, unique per connection.
    pub provider_message_id: String,
    /// Provider's thread or conversation identifier.
    pub provider_thread_id: Option<String>,
    /// Subject line (email only).
    pub subject: Option<String>,
    /// Plain text body.
    pub body: Option<String>,
    /// HTML body (email only).
    pub body_html: Option<String>,
    /// Short preview.
    pub snippet: Option<String>,
    /// Sender email address, if the channel has one.
    pub sender_email: Option<String>,
    /// Sender display name.
    pub sender_name: Option<String>,
    /// Sender identifier on the channel (Telegram user id, Slack user id).
    pub sender_id: Option<String>,
    /// Recipients in provider order.
    pub recipients: Vec<String>,
    /// When the message was sent or received.
    pub timestamp: DateTime<Utc>,
    /// Provider labels or categories.
    pub labels: BTreeSet<String>,
    /// Original provider payload.
    pub raw_data: serde_json::Value,
}

impl NewMessage {
    /// Start a message for the given connection.
    #[must_use]
    pub fn new(
        connection: &ChannelConnection,
        provider_message_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            workspace_id: connection.workspace_id.clone(),
            channel_connection_id: connection.id,
            provider_message_id: provider_message_id.into(),
            provider_thread_id: None,
            subject: None,
            body: None,
            body_html: None,
            snippet: None,
            sender_email: None,
            sender_name: None,
            sender_id: None,
            recipients: Vec::new(),
            timestamp,
            labels: BTreeSet::new(),
            raw_data: serde_json::Value::Null,
        }
    }

    /// Short description for progress reporting.
    #[must_use]
    pub fn summary(&self) -> String {
        let from = self
            .sender_name
            .as_deref()
            .or(self.sender_email.as_deref())
            .unwrap_or("unknown sender");
        match self.subject.as_deref().filter(|s| !s.is_empty()) {
            Some(subject) => format!("{from}: {subject}"),
            None => format!("Message from {from}"),
        }
    }
}

/// A stored message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Row identifier.
    pub id: MessageId,
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// Connection the message was fetched through.
    pub channel_connection_id: ConnectionId,
    /// Provider's identifier.
    pub provider_message_id: String,
    /// Provider's thread identifier.
    pub provider_thread_id: Option<String>,
    /// Subject line.
    pub subject: Option<String>,
    /// Plain text body.
    pub body: Option<String>,
    /// HTML body.
    pub body_html: Option<String>,
    /// Short preview.
    pub snippet: Option<String>,
    /// Sender email address.
    pub sender_email: Option<String>,
    /// Sender display name.
    pub sender_name: Option<String>,
    /// Sender channel identifier.
    pub sender_id: Option<String>,
    /// Recipients in provider order.
    pub recipients: Vec<String>,
    /// When the message was sent or received.
    pub timestamp: DateTime<Utc>,
    /// Provider labels.
    pub labels: BTreeSet<String>,
    /// Original provider payload.
    pub raw_data: serde_json::Value,
    /// Resolved sender contact.
    pub contact_id: Option<ContactId>,
    /// Classifier priority.
    pub priority: Option<String>,
    /// Classifier category.
    pub category: Option<String>,
    /// Classifier summary.
    pub ai_summary_short: Option<String>,
    /// Whether a reply draft exists.
    pub has_draft_reply: bool,
    /// When the row was inserted.
    pub created_at: DateTime<Utc>,
}

/// Result of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Id of the stored row (new or existing).
    pub id: MessageId,
    /// True if the row existed before this call.
    pub is_duplicate: bool,
}

/// Fields written by the classifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    /// Priority label.
    pub priority: String,
    /// Category label.
    pub category: Option<String>,
    /// One-line summary.
    pub ai_summary_short: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_display() {
        assert_eq!(MessageId::new(12).to_string(), "12");
    }

    #[test]
    fn test_classification_from_camel_case() {
        let parsed: Classification = serde_json::from_value(serde_json::json!({
            "priority": "high",
            "aiSummaryShort": "Invoice overdue"
        }))
        .unwrap_or_default();
        assert_eq!(parsed.priority, "high");
        assert_eq!(parsed.ai_summary_short.as_deref(), Some("Invoice overdue"));
        assert!(parsed.category.is_none());
    }
}
