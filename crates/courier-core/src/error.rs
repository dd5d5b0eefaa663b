//! Error types for the core library.

use thiserror::Error;

use crate::connection::{ConnectionId, ProviderKind};

/// Errors that can occur in core operations.
///
/// Classification failures are logged by the dispatcher and never surface
/// through this type.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection does not exist (or belongs to another workspace).
    #[error("Channel connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// Connection was disconnected while an operation on it was running.
    #[error("Channel connection {0} was disconnected")]
    ConnectionRevoked(ConnectionId),

    /// Provider has no adapter or is not a known provider name.
    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),

    /// An adapter was handed a connection of a different provider.
    #[error("Connection {connection} is a {actual} connection, not {expected}")]
    ProviderMismatch {
        /// Connection that was routed.
        connection: ConnectionId,
        /// Provider the adapter handles.
        expected: ProviderKind,
        /// Provider stored on the connection.
        actual: ProviderKind,
    },

    /// Refreshing the access token failed; the connection is demoted.
    #[error("Token refresh failed for connection {connection}: {source}")]
    TokenRefresh {
        /// Connection whose token could not be refreshed.
        connection: ConnectionId,
        /// Underlying `OAuth2` failure.
        #[source]
        source: courier_oauth::Error,
    },

    /// Provider rejected the stored credentials.
    #[error("Provider rejected credentials: {0}")]
    ProviderUnauthorized(String),

    /// Fetching a page from the provider failed.
    #[error("Provider fetch failed: {0}")]
    ProviderFetch(String),

    /// A single provider item could not be fetched or parsed.
    #[error("Provider item failed: {0}")]
    ProviderItem(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Stored cursor does not match the provider's cursor format.
    #[error("Invalid sync cursor for {provider}: {value:?}")]
    InvalidCursor {
        /// Provider the cursor was parsed for.
        provider: ProviderKind,
        /// Raw cursor value.
        value: String,
    },

    /// The sync was cancelled before the page was fully processed.
    #[error("Sync cancelled")]
    Cancelled,
}

impl Error {
    /// Returns true for failures of the persistence layer or the process
    /// itself, as opposed to provider or routing failures of one connection.
    #[must_use]
    pub const fn is_unexpected(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Serde(_))
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
