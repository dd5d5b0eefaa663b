//! Shared `SQLite` pool and schema.
//!
//! All three entities live in one database so that the message store, the
//! contact resolver and the connection store see each other's writes.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::debug;

use crate::Result;
use crate::connection::ConnectionRepository;
use crate::contacts::ContactRepository;
use crate::message::MessageRepository;

/// Handle to the sync database.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database at the given path.
    ///
    /// Creates the tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn connect(database_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{database_path}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.initialize().await?;
        debug!(path = database_path, "sync database ready");
        Ok(db)
    }

    /// Create an in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.initialize().await?;
        Ok(db)
    }

    /// Connection store backed by this database.
    #[must_use]
    pub fn connections(&self) -> ConnectionRepository {
        ConnectionRepository::new(self.pool.clone())
    }

    /// Deduplicating message store backed by this database.
    #[must_use]
    pub fn messages(&self) -> MessageRepository {
        MessageRepository::new(self.pool.clone())
    }

    /// Contact resolver backed by this database.
    #[must_use]
    pub fn contacts(&self) -> ContactRepository {
        ContactRepository::new(self.pool.clone())
    }

    /// Initialize database schema.
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS channel_connections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workspace_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                provider_account_id TEXT NOT NULL,
                provider_account_name TEXT NOT NULL DEFAULT '',
                access_token TEXT NOT NULL,
                refresh_token TEXT,
                token_expires_at TEXT,
                scopes TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'active',
                last_sync_at TEXT,
                sync_cursor TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                webhook_secret TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_connections_workspace_status
            ON channel_connections(workspace_id, status)
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_connections_provider_account
            ON channel_connections(provider, provider_account_id)
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_connections_webhook_secret
            ON channel_connections(webhook_secret) WHERE webhook_secret IS NOT NULL
            ",
        )
        .execute(&self.pool)
        .await?;

        // The UNIQUE constraint is the dedup key for ingestion.
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workspace_id TEXT NOT NULL,
                channel_connection_id INTEGER NOT NULL
                    REFERENCES channel_connections(id) ON DELETE CASCADE,
                provider_message_id TEXT NOT NULL,
                provider_thread_id TEXT,
                subject TEXT,
                body TEXT,
                body_html TEXT,
                snippet TEXT,
                sender_email TEXT,
                sender_name TEXT,
                sender_id TEXT,
                recipients TEXT NOT NULL DEFAULT '[]',
                timestamp TEXT NOT NULL,
                labels TEXT NOT NULL DEFAULT '[]',
                raw_data TEXT NOT NULL DEFAULT '{}',
                contact_id INTEGER REFERENCES contacts(id) ON DELETE SET NULL,
                priority TEXT,
                category TEXT,
                ai_summary_short TEXT,
                has_draft_reply INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                UNIQUE(channel_connection_id, provider_message_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_messages_unclassified
            ON messages(channel_connection_id, created_at) WHERE priority IS NULL
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS contacts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workspace_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                email TEXT,
                display_name TEXT NOT NULL DEFAULT '',
                channel_specific_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        // Identity keys: email wins when present, channel id otherwise.
        sqlx::query(
            r"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_contacts_email
            ON contacts(workspace_id, email) WHERE email IS NOT NULL
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_contacts_channel_id
            ON contacts(workspace_id, provider, channel_specific_id)
            WHERE email IS NULL AND channel_specific_id IS NOT NULL
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Format a timestamp for storage.
///
/// Fixed-width so that stored values sort lexicographically.
pub(crate) fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp, ignoring malformed values.
pub(crate) fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_schema_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        db.initialize().await.unwrap();
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let now = Utc::now();
        let parsed = parse_timestamp(Some(&format_timestamp(now))).unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
        assert!(parse_timestamp(Some("yesterday")).is_none());
        assert!(parse_timestamp(None).is_none());
    }
}
