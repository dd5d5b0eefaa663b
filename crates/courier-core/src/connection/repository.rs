//! Connection storage repository.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use tracing::{debug, warn};

use super::model::{
    ChannelConnection, ConnectionId, ConnectionStatus, NewConnection, ProviderKind, UserId,
    WorkspaceId,
};
use crate::Result;
use crate::database::{format_timestamp, parse_timestamp};
use crate::provider::SyncCursor;

const CONNECTION_COLUMNS: &str = r"
    id, workspace_id, user_id, provider, provider_account_id, provider_account_name,
    access_token, refresh_token, token_expires_at, scopes, status, last_sync_at,
    sync_cursor, metadata, webhook_secret, created_at, updated_at
";

/// Repository for channel connections.
#[derive(Debug, Clone)]
pub struct ConnectionRepository {
    pool: SqlitePool,
}

impl ConnectionRepository {
    /// Create a repository over an initialized pool.
    pub(crate) const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a new connection with status `active`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn create(&self, connection: &NewConnection) -> Result<ChannelConnection> {
        let now = format_timestamp(Utc::now());
        let scopes = serde_json::to_string(&connection.scopes)?;
        let metadata = serde_json::to_string(&connection.metadata)?;

        let result = sqlx::query(
            r"
            INSERT INTO channel_connections (
                workspace_id, user_id, provider, provider_account_id, provider_account_name,
                access_token, refresh_token, token_expires_at, scopes, status,
                sync_cursor, metadata, webhook_secret, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, ?, ?, ?, ?)
            ",
        )
        .bind(connection.workspace_id.as_str())
        .bind(connection.user_id.as_str())
        .bind(connection.provider.as_str())
        .bind(&connection.provider_account_id)
        .bind(&connection.provider_account_name)
        .bind(&connection.access_token)
        .bind(&connection.refresh_token)
        .bind(connection.token_expires_at.map(format_timestamp))
        .bind(scopes)
        .bind(connection.sync_cursor.as_ref().map(SyncCursor::to_raw))
        .bind(metadata)
        .bind(&connection.webhook_secret)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let id = ConnectionId::new(result.last_insert_rowid());
        debug!(connection = %id, provider = %connection.provider, "connection created");

        self.get(id)
            .await?
            .ok_or(crate::Error::ConnectionNotFound(id))
    }

    /// Get a connection by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, id: ConnectionId) -> Result<Option<ChannelConnection>> {
        let row = sqlx::query(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM channel_connections WHERE id = ?"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_connection).transpose()
    }

    /// List the active connections of a workspace, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list_active(&self, workspace_id: &WorkspaceId) -> Result<Vec<ChannelConnection>> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {CONNECTION_COLUMNS} FROM channel_connections
            WHERE workspace_id = ? AND status = 'active'
            ORDER BY id
            "
        ))
        .bind(workspace_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_connection).collect()
    }

    /// List the workspaces that have at least one active connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn active_workspaces(&self) -> Result<Vec<WorkspaceId>> {
        let rows = sqlx::query(
            r"
            SELECT DISTINCT workspace_id FROM channel_connections
            WHERE status = 'active'
            ORDER BY workspace_id
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| WorkspaceId::new(row.get::<String, _>("workspace_id")))
            .collect())
    }

    /// Find the connection of a provider that registered `secret` for its
    /// webhook deliveries.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn find_by_webhook_secret(
        &self,
        provider: ProviderKind,
        secret: &str,
    ) -> Result<Option<ChannelConnection>> {
        if secret.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query(&format!(
            r"
            SELECT {CONNECTION_COLUMNS} FROM channel_connections
            WHERE provider = ? AND webhook_secret = ?
            "
        ))
        .bind(provider.as_str())
        .bind(secret)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_connection).transpose()
    }

    /// Persist refreshed credentials and mark the connection active.
    ///
    /// A `None` refresh token keeps the stored one. A revoked connection is
    /// left untouched and `false` is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn update_tokens(
        &self,
        id: ConnectionId,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE channel_connections SET
                access_token = ?,
                refresh_token = COALESCE(?, refresh_token),
                token_expires_at = ?,
                status = 'active',
                updated_at = ?
            WHERE id = ? AND status <> 'revoked'
            ",
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at.map(format_timestamp))
        .bind(format_timestamp(Utc::now()))
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Set the connection status.
    ///
    /// Revoked is final: a revoked connection keeps its status and `false`
    /// is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn set_status(&self, id: ConnectionId, status: ConnectionStatus) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE channel_connections SET status = ?, updated_at = ?
            WHERE id = ? AND status <> 'revoked'
            ",
        )
        .bind(status.as_str())
        .bind(format_timestamp(Utc::now()))
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        let changed = result.rows_affected() > 0;
        if changed {
            debug!(connection = %id, status = %status, "connection status changed");
        } else {
            debug!(connection = %id, status = %status, "revoked or missing, status kept");
        }
        Ok(changed)
    }

    /// Record a finished sync: the new cursor (if any) and `last_sync_at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn record_sync(
        &self,
        id: ConnectionId,
        cursor: Option<&SyncCursor>,
        synced_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE channel_connections SET
                sync_cursor = COALESCE(?, sync_cursor),
                last_sync_at = ?,
                updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(cursor.map(SyncCursor::to_raw))
        .bind(format_timestamp(synced_at))
        .bind(format_timestamp(Utc::now()))
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Disconnect: mark revoked and forget the credentials.
    ///
    /// Returns `false` if the connection does not exist in the workspace.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn revoke(&self, id: ConnectionId, workspace_id: &WorkspaceId) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE channel_connections SET
                status = 'revoked',
                access_token = '',
                refresh_token = NULL,
                token_expires_at = NULL,
                updated_at = ?
            WHERE id = ? AND workspace_id = ?
            ",
        )
        .bind(format_timestamp(Utc::now()))
        .bind(id.0)
        .bind(workspace_id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Convert a database row to a `ChannelConnection`.
///
/// A malformed cursor is dropped (the next sync starts from scratch and the
/// message store deduplicates); an unknown provider is an error.
fn row_to_connection(row: &SqliteRow) -> Result<ChannelConnection> {
    let id = ConnectionId::new(row.get("id"));
    let provider: ProviderKind = row.get::<&str, _>("provider").parse()?;

    let sync_cursor = row
        .get::<Option<String>, _>("sync_cursor")
        .and_then(|raw| match SyncCursor::parse(provider, &raw) {
            Ok(cursor) => Some(cursor),
            Err(e) => {
                warn!(connection = %id, "ignoring stored cursor: {e}");
                None
            }
        });

    let scopes = serde_json::from_str(row.get("scopes")).unwrap_or_default();
    let metadata = serde_json::from_str(row.get("metadata")).unwrap_or_default();

    Ok(ChannelConnection {
        id,
        workspace_id: WorkspaceId::new(row.get::<String, _>("workspace_id")),
        user_id: UserId::new(row.get::<String, _>("user_id")),
        provider,
        provider_account_id: row.get("provider_account_id"),
        provider_account_name: row.get("provider_account_name"),
        access_token: row.get("access_token"),
        refresh_token: row.get("refresh_token"),
        token_expires_at: parse_timestamp(row.get("token_expires_at")),
        scopes,
        status: ConnectionStatus::parse(row.get("status")),
        last_sync_at: parse_timestamp(row.get("last_sync_at")),
        sync_cursor,
        metadata,
        webhook_secret: row.get("webhook_secret"),
        created_at: parse_timestamp(row.get("created_at")).unwrap_or_default(),
        updated_at: parse_timestamp(row.get("updated_at")).unwrap_or_default(),
    })
}
