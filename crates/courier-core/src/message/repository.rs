//! Message storage repository.

use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use tracing::debug;

use super::model::{Classification, Message, MessageId, NewMessage, UpsertOutcome};
use crate::Result;
use crate::connection::{ConnectionId, WorkspaceId};
use crate::contacts::ContactId;
use crate::database::{format_timestamp, parse_timestamp};

/// Repository for ingested messages.
#[derive(Debug, Clone)]
pub struct MessageRepository {
    pool: SqlitePool,
}

impl MessageRepository {
    /// Create a repository over an initialized pool.
    pub(crate) const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a message unless one with the same provider id already exists
    /// for the connection.
    ///
    /// An existing row is never modified, so classifier-owned fields survive
    /// any number of re-syncs.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn upsert(&self, message: &NewMessage) -> Result<UpsertOutcome> {
        let recipients = serde_json::to_string(&message.recipients)?;
        let labels = serde_json::to_string(&message.labels)?;
        let raw_data = serde_json::to_string(&message.raw_data)?;

        let inserted = sqlx::query(
            r"
            INSERT INTO messages (
                workspace_id, channel_connection_id, provider_message_id, provider_thread_id,
                subject, body, body_html, snippet, sender_email, sender_name, sender_id,
                recipients, timestamp, labels, raw_data, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(channel_connection_id, provider_message_id) DO NOTHING
            RETURNING id
            ",
        )
        .bind(message.workspace_id.as_str())
        .bind(message.channel_connection_id.0)
        .bind(&message.provider_message_id)
        .bind(&message.provider_thread_id)
        .bind(&message.subject)
        .bind(&message.body)
        .bind(&message.body_html)
        .bind(&message.snippet)
        .bind(&message.sender_email)
        .bind(&message.sender_name)
        .bind(&message.sender_id)
        .bind(recipients)
        .bind(format_timestamp(message.timestamp))
        .bind(labels)
        .bind(raw_data)
        .bind(format_timestamp(Utc::now()))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(UpsertOutcome {
                id: MessageId::new(row.get("id")),
                is_duplicate: false,
            });
        }

        let existing: i64 = sqlx::query_scalar(
            "SELECT id FROM messages WHERE channel_connection_id = ? AND provider_message_id = ?",
        )
        .bind(message.channel_connection_id.0)
        .bind(&message.provider_message_id)
        .fetch_one(&self.pool)
        .await?;

        debug!(
            connection = %message.channel_connection_id,
            provider_message_id = %message.provider_message_id,
            "duplicate message skipped"
        );

        Ok(UpsertOutcome {
            id: MessageId::new(existing),
            is_duplicate: true,
        })
    }

    /// Get a message by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, id: MessageId) -> Result<Option<Message>> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(row_to_message))
    }

    /// Count the messages stored for a connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn count_for_connection(&self, connection_id: ConnectionId) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE channel_connection_id = ?")
                .bind(connection_id.0)
                .fetch_one(&self.pool)
                .await?;

        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Link a message to its resolved sender.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn link_contact(&self, id: MessageId, contact_id: ContactId) -> Result<()> {
        sqlx::query("UPDATE messages SET contact_id = ? WHERE id = ?")
            .bind(contact_id.0)
            .bind(id.0)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Most recently created messages of a connection that have no priority yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn recent_unclassified(
        &self,
        connection_id: ConnectionId,
        limit: u32,
    ) -> Result<Vec<MessageId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r"
            SELECT id FROM messages
            WHERE channel_connection_id = ? AND priority IS NULL
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            ",
        )
        .bind(connection_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(MessageId::new).collect())
    }

    /// Store classifier output for a message in the given workspace.
    ///
    /// Returns `false` if no such message exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn set_classification(
        &self,
        id: MessageId,
        workspace_id: &WorkspaceId,
        classification: &Classification,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE messages SET priority = ?, category = ?, ai_summary_short = ?
            WHERE id = ? AND workspace_id = ?
            ",
        )
        .bind(&classification.priority)
        .bind(&classification.category)
        .bind(&classification.ai_summary_short)
        .bind(id.0)
        .bind(workspace_id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Convert a database row to a `Message`.
fn row_to_message(row: &SqliteRow) -> Message {
    Message {
        id: MessageId::new(row.get("id")),
        workspace_id: WorkspaceId::new(row.get::<String, _>("workspace_id")),
        channel_connection_id: ConnectionId::new(row.get("channel_connection_id")),
        provider_message_id: row.get("provider_message_id"),
        provider_thread_id: row.get("provider_thread_id"),
        subject: row.get("subject"),
        body: row.get("body"),
        body_html: row.get("body_html"),
        snippet: row.get("snippet"),
        sender_email: row.get("sender_email"),
        sender_name: row.get("sender_name"),
        sender_id: row.get("sender_id"),
        recipients: serde_json::from_str(row.get("recipients")).unwrap_or_default(),
        timestamp: parse_timestamp(row.get("timestamp")).unwrap_or_default(),
        labels: serde_json::from_str(row.get("labels")).unwrap_or_default(),
        raw_data: serde_json::from_str(row.get("raw_data")).unwrap_or_default(),
        contact_id: row.get::<Option<i64>, _>("contact_id").map(ContactId::new),
        priority: row.get("priority"),
        category: row.get("category"),
        ai_summary_short: row.get("ai_summary_short"),
        has_draft_reply: row.get::<i64, _>("has_draft_reply") != 0,
        created_at: parse_timestamp(row.get("created_at")).unwrap_or_default(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::Database;
    use crate::connection::{ChannelConnection, NewConnection, ProviderKind};
    use chrono::TimeZone;

    async fn setup() -> (Database, ChannelConnection) {
        let db = Database::in_memory().await.unwrap();
        let conn = db
            .connections()
            .create(&NewConnection::new(
                "ws-1",
                "user-1",
                ProviderKind::Gmail,
                "me@example.com",
                "at",
            ))
            .await
            .unwrap();
        (db, conn)
    }

    fn sample(conn: &ChannelConnection, id: &str) -> NewMessage {
        let sent_at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let mut message = NewMessage::new(conn, id, sent_at);
        message.subject = Some("Quarterly numbers".into());
        message.sender_email = Some("alice@example.com".into());
        message.recipients = vec!["me@example.com".into(), "bob@example.com".into()];
        message.labels.insert("INBOX".into());
        message.raw_data = serde_json::json!({ "id": id });
        message
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let (db, conn) = setup().await;
        let repo = db.messages();

        let first = repo.upsert(&sample(&conn, "m-1")).await.unwrap();
        let second = repo.upsert(&sample(&conn, "m-1")).await.unwrap();

        assert!(!first.is_duplicate);
        assert!(second.is_duplicate);
        assert_eq!(first.id, second.id);
        assert_eq!(repo.count_for_connection(conn.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_does_not_touch_classification() {
        let (db, conn) = setup().await;
        let repo = db.messages();

        let outcome = repo.upsert(&sample(&conn, "m-1")).await.unwrap();
        let classification = Classification {
            priority: "high".into(),
            category: Some("finance".into()),
            ai_summary_short: Some("Numbers are in".into()),
        };
        assert!(
            repo.set_classification(outcome.id, &conn.workspace_id, &classification)
                .await
                .unwrap()
        );

        let mut resync = sample(&conn, "m-1");
        resync.subject = Some("changed upstream".into());
        repo.upsert(&resync).await.unwrap();

        let stored = repo.get(outcome.id).await.unwrap().unwrap();
        assert_eq!(stored.priority.as_deref(), Some("high"));
        assert_eq!(stored.category.as_deref(), Some("finance"));
        assert_eq!(stored.subject.as_deref(), Some("Quarterly numbers"));
    }

    #[tokio::test]
    async fn test_get_roundtrip() {
        let (db, conn) = setup().await;
        let repo = db.messages();
        let outcome = repo.upsert(&sample(&conn, "m-1")).await.unwrap();

        let stored = repo.get(outcome.id).await.unwrap().unwrap();
        assert_eq!(stored.workspace_id, conn.workspace_id);
        assert_eq!(stored.recipients, vec!["me@example.com", "bob@example.com"]);
        assert!(stored.labels.contains("INBOX"));
        assert_eq!(stored.raw_data["id"], "m-1");
        assert!(stored.contact_id.is_none());
        assert!(stored.priority.is_none());
        assert!(!stored.has_draft_reply);
    }

    #[tokio::test]
    async fn test_recent_unclassified_newest_first() {
        let (db, conn) = setup().await;
        let repo = db.messages();

        let a = repo.upsert(&sample(&conn, "m-1")).await.unwrap();
        let b = repo.upsert(&sample(&conn, "m-2")).await.unwrap();
        let c = repo.upsert(&sample(&conn, "m-3")).await.unwrap();
        repo.set_classification(
            c.id,
            &conn.workspace_id,
            &Classification {
                priority: "low".into(),
                ..Classification::default()
            },
        )
        .await
        .unwrap();

        let ids = repo.recent_unclassified(conn.id, 5).await.unwrap();
        assert_eq!(ids, vec![b.id, a.id]);
        assert_eq!(repo.recent_unclassified(conn.id, 1).await.unwrap(), vec![b.id]);
    }

    #[tokio::test]
    async fn test_set_classification_checks_workspace() {
        let (db, conn) = setup().await;
        let repo = db.messages();
        let outcome = repo.upsert(&sample(&conn, "m-1")).await.unwrap();

        let updated = repo
            .set_classification(
                outcome.id,
                &WorkspaceId::new("other"),
                &Classification::default(),
            )
            .await
            .unwrap();
        assert!(!updated);
    }
}
