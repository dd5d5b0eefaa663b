//! Connection model types.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::provider::SyncCursor;

/// Unique identifier for a channel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub i64);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a workspace, issued by the surrounding application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(String);

impl WorkspaceId {
    /// Create a new workspace ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkspaceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for WorkspaceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of the user who owns a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create a new user ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// External communication provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Google Gmail.
    Gmail,
    /// Microsoft Outlook (Graph mail).
    Outlook,
    /// Telegram bot.
    Telegram,
    /// Slack direct messages.
    Slack,
    /// Microsoft Teams.
    Teams,
    /// `WhatsApp` Business.
    WhatsApp,
    /// Discord.
    Discord,
}

impl ProviderKind {
    /// Every known provider.
    pub const ALL: [Self; 7] = [
        Self::Gmail,
        Self::Outlook,
        Self::Telegram,
        Self::Slack,
        Self::Teams,
        Self::WhatsApp,
        Self::Discord,
    ];

    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Gmail => "gmail",
            Self::Outlook => "outlook",
            Self::Telegram => "telegram",
            Self::Slack => "slack",
            Self::Teams => "teams",
            Self::WhatsApp => "whatsapp",
            Self::Discord => "discord",
        }
    }

    /// Whether the provider's identity is an email address.
    #[must_use]
    pub const fn is_email(&self) -> bool {
        matches!(self, Self::Gmail | Self::Outlook)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::UnsupportedProvider(s.to_string()))
    }
}

/// Lifecycle status of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Syncing normally.
    #[default]
    Active,
    /// Paused by the user.
    Inactive,
    /// Unrecoverable provider error.
    Error,
    /// Credentials were rejected or could not be refreshed.
    TokenExpired,
    /// Explicitly disconnected.
    Revoked,
}

impl ConnectionStatus {
    /// Parse from database string representation.
    ///
    /// Unknown values map to [`ConnectionStatus::Error`] so that a corrupt row
    /// is never treated as syncable.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "inactive" => Self::Inactive,
            "token_expired" => Self::TokenExpired,
            "revoked" => Self::Revoked,
            _ => Self::Error,
        }
    }

    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Error => "error",
            Self::TokenExpired => "token_expired",
            Self::Revoked => "revoked",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored channel connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConnection {
    /// Row identifier.
    pub id: ConnectionId,
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// User who authorized the connection.
    pub user_id: UserId,
    /// Provider the account belongs to.
    pub provider: ProviderKind,
    /// Account identifier at the provider.
    pub provider_account_id: String,
    /// Human readable account name (may be empty).
    pub provider_account_name: String,
    /// Current access token (bot token for Telegram).
    pub access_token: String,
    /// Refresh token, if the provider issued one.
    pub refresh_token: Option<String>,
    /// When the access token expires.
    pub token_expires_at: Option<DateTime<Utc>>,
    /// Granted scopes.
    pub scopes: BTreeSet<String>,
    /// Lifecycle status.
    pub status: ConnectionStatus,
    /// When the last sync finished.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Position of the last ingested item.
    pub sync_cursor: Option<SyncCursor>,
    /// Free-form provider metadata.
    pub metadata: serde_json::Value,
    /// Secret that webhook deliveries for this connection must present.
    pub webhook_secret: Option<String>,
    /// When the connection was created.
    pub created_at: DateTime<Utc>,
    /// When the connection was last modified.
    pub updated_at: DateTime<Utc>,
}

impl ChannelConnection {
    /// Whether the connection may be synced.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == ConnectionStatus::Active
    }

    /// Name to show for this connection, falling back to the account id.
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.provider_account_name.is_empty() {
            &self.provider_account_id
        } else {
            &self.provider_account_name
        }
    }

    /// Whether a webhook delivery presenting `presented` comes from the
    /// provider. Without a stored secret no delivery is accepted.
    #[must_use]
    pub fn accepts_webhook_secret(&self, presented: Option<&str>) -> bool {
        match (self.webhook_secret.as_deref(), presented) {
            (Some(expected), Some(presented)) if !expected.is_empty() => {
                secrets_match(expected.as_bytes(), presented.as_bytes())
            }
            _ => false,
        }
    }
}

/// Compare without stopping at the first differing byte.
fn secrets_match(expected: &[u8], presented: &[u8]) -> bool {
    expected.len() == presented.len()
        && expected
            .iter()
            .zip(presented)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// A connection about to be stored, as produced by an `OAuth` callback.
#[derive(Debug, Clone)]
pub struct NewConnection {
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// User who authorized the connection.
    pub user_id: UserId,
    /// Provider the account belongs to.
    pub provider: ProviderKind,
    /// Account identifier at the provider.
    pub provider_account_id: String,
    /// Human readable account name.
    pub provider_account_name: String,
    /// Access token.
    pub access_token: String,
    /// Refresh token.
    pub refresh_token: Option<String>,
    /// Access token expiry.
    pub token_expires_at: Option<DateTime<Utc>>,
    /// Granted scopes.
    pub scopes: BTreeSet<String>,
    /// Initial sync cursor.
    pub sync_cursor: Option<SyncCursor>,
    /// Free-form provider metadata.
    pub metadata: serde_json::Value,
    /// Webhook secret registered with the provider.
    pub webhook_secret: Option<String>,
}

impl NewConnection {
    /// Create a connection with the required fields.
    #[must_use]
    pub fn new(
        workspace_id: impl Into<WorkspaceId>,
        user_id: impl Into<String>,
        provider: ProviderKind,
        provider_account_id: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            user_id: UserId::new(user_id),
            provider,
            provider_account_id: provider_account_id.into(),
            provider_account_name: String::new(),
            access_token: access_token.into(),
            refresh_token: None,
            token_expires_at: None,
            scopes: BTreeSet::new(),
            sync_cursor: None,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
            webhook_secret: None,
        }
    }

    /// Sets the account display name.
    #[must_use]
    pub fn with_account_name(mut self, name: impl Into<String>) -> Self {
        self.provider_account_name = name.into();
        self
    }

    /// Sets the refresh token.
    #[must_use]
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// Sets the access token expiry.
    #[must_use]
    pub const fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.token_expires_at = Some(expires_at);
        self
    }

    /// Sets the granted scopes.
    #[must_use]
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the initial sync cursor.
    #[must_use]
    pub fn with_sync_cursor(mut self, cursor: SyncCursor) -> Self {
        self.sync_cursor = Some(cursor);
        self
    }

    /// Sets provider metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Sets the webhook secret (Telegram `secret_token`, Graph
    /// `clientState`).
    #[must_use]
    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }
}
