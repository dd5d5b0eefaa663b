//! Contact model types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connection::{ProviderKind, UserId, WorkspaceId};
use crate::message::NewMessage;

/// Unique identifier for a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactId(pub i64);

impl ContactId {
    /// Create a new contact ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A resolved sender identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    /// Row identifier.
    pub id: ContactId,
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// User whose sync first saw the sender.
    pub user_id: UserId,
    /// Provider the sender was first seen on.
    pub provider: ProviderKind,
    /// Normalized email address.
    pub email: Option<String>,
    /// Display name (may be empty).
    pub display_name: String,
    /// Channel identifier, used when there is no email.
    pub channel_specific_id: Option<String>,
    /// When the contact was created.
    pub created_at: DateTime<Utc>,
    /// When the contact was last seen.
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    /// Returns a display string for the contact.
    ///
    /// If a name is present, returns "Name <email>", otherwise the email or
    /// the channel identifier.
    #[must_use]
    pub fn display(&self) -> String {
        let address = self
            .email
            .as_deref()
            .or(self.channel_specific_id.as_deref())
            .unwrap_or_default();
        match (self.display_name.is_empty(), address.is_empty()) {
            (true, _) => address.to_string(),
            (false, true) => self.display_name.clone(),
            (false, false) => format!("{} <{address}>", self.display_name),
        }
    }
}

/// Identity to resolve into a contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContact {
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// User performing the sync.
    pub user_id: UserId,
    /// Provider the sender was seen on.
    pub provider: ProviderKind,
    /// Sender email.
    pub email: Option<String>,
    /// Sender display name.
    pub display_name: String,
    /// Sender channel identifier.
    pub channel_specific_id: Option<String>,
}

impl NewContact {
    /// Sender identity of an ingested message.
    #[must_use]
    pub fn from_message(message: &NewMessage, user_id: &UserId, provider: ProviderKind) -> Self {
        Self {
            workspace_id: message.workspace_id.clone(),
            user_id: user_id.clone(),
            provider,
            email: message.sender_email.clone(),
            display_name: message.sender_name.clone().unwrap_or_default(),
            channel_specific_id: message.sender_id.clone(),
        }
    }

    /// Email trimmed and lowercased; empty means absent.
    #[must_use]
    pub fn normalized_email(&self) -> Option<String> {
        self.email
            .as_deref()
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty())
    }

    /// Channel id trimmed; empty means absent.
    #[must_use]
    pub fn normalized_channel_id(&self) -> Option<&str> {
        self.channel_specific_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(email: Option<&str>, channel_id: Option<&str>) -> NewContact {
        NewContact {
            workspace_id: WorkspaceId::new("ws"),
            user_id: UserId::new("u"),
            provider: ProviderKind::Telegram,
            email: email.map(String::from),
            display_name: String::new(),
            channel_specific_id: channel_id.map(String::from),
        }
    }

    #[test]
    fn test_email_normalization() {
        let c = identity(Some("  Alice@Example.COM "), None);
        assert_eq!(c.normalized_email().as_deref(), Some("alice@example.com"));
        assert_eq!(identity(Some("   "), None).normalized_email(), None);
    }

    #[test]
    fn test_channel_id_normalization() {
        assert_eq!(identity(None, Some(" 42 ")).normalized_channel_id(), Some("42"));
        assert_eq!(identity(None, Some("")).normalized_channel_id(), None);
    }

    #[test]
    fn test_display() {
        let contact = Contact {
            id: ContactId::new(1),
            workspace_id: WorkspaceId::new("ws"),
            user_id: UserId::new("u"),
            provider: ProviderKind::Gmail,
            email: Some("john@example.com".into()),
            display_name: "John Doe".into(),
            channel_specific_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(contact.display(), "John Doe <john@example.com>");

        let anonymous = Contact {
            display_name: String::new(),
            ..contact
        };
        assert_eq!(anonymous.display(), "john@example.com");
    }
}
