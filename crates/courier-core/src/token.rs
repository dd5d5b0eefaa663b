//! Token lifecycle: refresh access tokens before they expire.

use std::collections::HashMap;

use chrono::{Duration, Utc};
use courier_oauth::OAuthClient;
use courier_oauth::token::expires_within;
use tracing::{debug, info, warn};

use crate::connection::{
    ChannelConnection, ConnectionId, ConnectionRepository, ConnectionStatus, ProviderKind,
};
use crate::error::{Error, Result};

/// Default safety window ahead of token expiry, in seconds.
pub const DEFAULT_REFRESH_WINDOW_SECS: i64 = 300;

/// Keeps connection credentials fresh.
///
/// One `OAuth` client is registered per provider; providers without a client
/// (for example Telegram bot tokens) are never refreshed.
#[derive(Debug, Clone)]
pub struct TokenManager {
    connections: ConnectionRepository,
    clients: HashMap<ProviderKind, OAuthClient>,
    refresh_window: Duration,
}

impl TokenManager {
    /// Create a manager with no `OAuth` clients.
    #[must_use]
    pub fn new(connections: ConnectionRepository) -> Self {
        Self {
            connections,
            clients: HashMap::new(),
            refresh_window: Duration::seconds(DEFAULT_REFRESH_WINDOW_SECS),
        }
    }

    /// Registers the `OAuth` client used to refresh a provider's tokens.
    #[must_use]
    pub fn with_client(mut self, provider: ProviderKind, client: OAuthClient) -> Self {
        self.clients.insert(provider, client);
        self
    }

    /// Sets the safety window ahead of expiry.
    #[must_use]
    pub const fn with_refresh_window(mut self, window: Duration) -> Self {
        self.refresh_window = window;
        self
    }

    /// Whether a provider has a refresh client.
    #[must_use]
    pub fn can_refresh(&self, provider: ProviderKind) -> bool {
        self.clients.contains_key(&provider)
    }

    /// Return a usable access token for a connection, refreshing it first if
    /// it expires within the safety window.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionNotFound`] for an unknown connection and
    /// [`Error::TokenRefresh`] if the refresh fails, in which case the
    /// connection is marked `token_expired`.
    pub async fn ensure_fresh_token(&self, id: ConnectionId) -> Result<String> {
        let mut connection = self
            .connections
            .get(id)
            .await?
            .ok_or(Error::ConnectionNotFound(id))?;

        self.refresh_if_needed(&mut connection).await?;
        Ok(connection.access_token)
    }

    /// Refresh an already loaded connection in place if needed.
    ///
    /// Returns `true` if a refresh happened. The new token and expiry are
    /// persisted before returning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokenRefresh`] if the provider rejects the refresh or
    /// cannot be reached, and [`Error::ConnectionRevoked`] if the connection
    /// was disconnected while the refresh was in flight.
    pub async fn refresh_if_needed(&self, connection: &mut ChannelConnection) -> Result<bool> {
        if !expires_within(connection.token_expires_at, Utc::now(), self.refresh_window) {
            return Ok(false);
        }

        let Some(refresh_token) = connection
            .refresh_token
            .clone()
            .filter(|token| !token.is_empty())
        else {
            debug!(connection = %connection.id, "token expiring but no refresh token stored");
            return Ok(false);
        };

        let Some(client) = self.clients.get(&connection.provider) else {
            warn!(
                connection = %connection.id,
                provider = %connection.provider,
                "token expiring but no OAuth client configured for provider"
            );
            return Ok(false);
        };

        match client.refresh_token(&refresh_token).await {
            Ok(token) => {
                let stored = self
                    .connections
                    .update_tokens(
                        connection.id,
                        &token.access_token,
                        token.refresh_token.as_deref(),
                        token.expires_at,
                    )
                    .await?;
                if !stored {
                    info!(connection = %connection.id, "connection revoked during token refresh");
                    connection.status = ConnectionStatus::Revoked;
                    return Err(Error::ConnectionRevoked(connection.id));
                }

                connection.access_token = token.access_token;
                if token.refresh_token.is_some() {
                    connection.refresh_token = token.refresh_token;
                }
                connection.token_expires_at = token.expires_at;
                connection.status = ConnectionStatus::Active;

                info!(
                    connection = %connection.id,
                    provider = %connection.provider,
                    expires_at = ?connection.token_expires_at,
                    "access token refreshed"
                );
                Ok(true)
            }
            Err(source) => {
                warn!(
                    connection = %connection.id,
                    provider = %connection.provider,
                    invalid_grant = source.is_invalid_grant(),
                    "token refresh failed: {source}"
                );
                if self
                    .connections
                    .set_status(connection.id, ConnectionStatus::TokenExpired)
                    .await?
                {
                    connection.status = ConnectionStatus::TokenExpired;
                }
                Err(Error::TokenRefresh {
                    connection: connection.id,
                    source,
                })
            }
        }
    }
}
