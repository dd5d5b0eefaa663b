//! Contact storage repository.

use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use tracing::debug;

use super::model::{Contact, ContactId, NewContact};
use crate::Result;
use crate::connection::{UserId, WorkspaceId};
use crate::database::{format_timestamp, parse_timestamp};

/// Repository for contact resolution and lookup.
#[derive(Debug, Clone)]
pub struct ContactRepository {
    pool: SqlitePool,
}

impl ContactRepository {
    /// Create a repository over an initialized pool.
    pub(crate) const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Resolve an identity to a contact, creating it on first sight.
    ///
    /// Email is the identity key when present (across all providers of the
    /// workspace); otherwise `(provider, channel_specific_id)` is. Each path
    /// is a single upsert against a unique index, so concurrent callers
    /// resolving the same new sender get the same row. An empty stored name
    /// is filled in from a later sighting; a non-empty one is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn find_or_create(&self, identity: &NewContact) -> Result<ContactId> {
        let email = identity.normalized_email();
        let channel_id = identity.normalized_channel_id();
        let name = identity.display_name.trim();
        let now = format_timestamp(Utc::now());

        let conflict_clause = match (&email, channel_id) {
            (Some(_), _) => {
                r"
                ON CONFLICT(workspace_id, email) WHERE email IS NOT NULL DO UPDATE SET
                    display_name = CASE
                        WHEN contacts.display_name = '' THEN excluded.display_name
                        ELSE contacts.display_name
                    END,
                    updated_at = excluded.updated_at
                "
            }
            (None, Some(_)) => {
                r"
                ON CONFLICT(workspace_id, provider, channel_specific_id)
                    WHERE email IS NULL AND channel_specific_id IS NOT NULL DO UPDATE SET
                    display_name = CASE
                        WHEN contacts.display_name = '' THEN excluded.display_name
                        ELSE contacts.display_name
                    END,
                    updated_at = excluded.updated_at
                "
            }
            (None, None) => "",
        };

        let sql = format!(
            r"
            INSERT INTO contacts (
                workspace_id, user_id, provider, email, display_name,
                channel_specific_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            {conflict_clause}
            RETURNING id
            "
        );

        let id: i64 = sqlx::query_scalar(&sql)
            .bind(identity.workspace_id.as_str())
            .bind(identity.user_id.as_str())
            .bind(identity.provider.as_str())
            .bind(&email)
            .bind(name)
            .bind(channel_id)
            .bind(&now)
            .bind(&now)
            .fetch_one(&self.pool)
            .await?;

        debug!(contact = id, provider = %identity.provider, "contact resolved");
        Ok(ContactId::new(id))
    }

    /// Get a contact by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails or the row is malformed.
    pub async fn get(&self, id: ContactId) -> Result<Option<Contact>> {
        let row = sqlx::query("SELECT * FROM contacts WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_contact).transpose()
    }

    /// List the contacts of a workspace ordered by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails or a row is malformed.
    pub async fn list(&self, workspace_id: &WorkspaceId, limit: u32) -> Result<Vec<Contact>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM contacts
            WHERE workspace_id = ?
            ORDER BY display_name COLLATE NOCASE, id
            LIMIT ?
            ",
        )
        .bind(workspace_id.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_contact).collect()
    }
}

/// Convert a database row to a `Contact`.
fn row_to_contact(row: &SqliteRow) -> Result<Contact> {
    Ok(Contact {
        id: ContactId::new(row.get("id")),
        workspace_id: WorkspaceId::new(row.get::<String, _>("workspace_id")),
        user_id: UserId::new(row.get::<String, _>("user_id")),
        provider: row.get::<&str, _>("provider").parse()?,
        email: row.get("email"),
        display_name: row.get("display_name"),
        channel_specific_id: row.get("channel_specific_id"),
        created_at: parse_timestamp(row.get("created_at")).unwrap_or_default(),
        updated_at: parse_timestamp(row.get("updated_at")).unwrap_or_default(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::Database;
    use crate::connection::ProviderKind;

    fn identity(
        provider: ProviderKind,
        email: Option<&str>,
        name: &str,
        channel_id: Option<&str>,
    ) -> NewContact {
        NewContact {
            workspace_id: WorkspaceId::new("ws-1"),
            user_id: UserId::new("user-1"),
            provider,
            email: email.map(String::from),
            display_name: name.to_string(),
            channel_specific_id: channel_id.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_same_email_across_channels_resolves_once() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.contacts();

        let from_gmail = repo
            .find_or_create(&identity(
                ProviderKind::Gmail,
                Some("Alice@Example.com"),
                "Alice",
                None,
            ))
            .await
            .unwrap();
        let from_outlook = repo
            .find_or_create(&identity(
                ProviderKind::Outlook,
                Some("alice@example.com "),
                "",
                None,
            ))
            .await
            .unwrap();

        assert_eq!(from_gmail, from_outlook);
        let contact = repo.get(from_gmail).await.unwrap().unwrap();
        assert_eq!(contact.email.as_deref(), Some("alice@example.com"));
        assert_eq!(contact.display_name, "Alice");
        assert_eq!(contact.provider, ProviderKind::Gmail);
    }

    #[tokio::test]
    async fn test_empty_name_filled_but_never_overwritten() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.contacts();

        let id = repo
            .find_or_create(&identity(ProviderKind::Gmail, Some("bob@example.com"), "", None))
            .await
            .unwrap();
        repo.find_or_create(&identity(ProviderKind::Gmail, Some("bob@example.com"), "Bob", None))
            .await
            .unwrap();
        repo.find_or_create(&identity(
            ProviderKind::Gmail,
            Some("bob@example.com"),
            "Robert",
            None,
        ))
        .await
        .unwrap();

        let contact = repo.get(id).await.unwrap().unwrap();
        assert_eq!(contact.display_name, "Bob");
    }

    #[tokio::test]
    async fn test_channel_id_scoped_by_provider() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.contacts();

        let telegram = repo
            .find_or_create(&identity(ProviderKind::Telegram, None, "Dana", Some("42")))
            .await
            .unwrap();
        let again = repo
            .find_or_create(&identity(ProviderKind::Telegram, None, "", Some("42")))
            .await
            .unwrap();
        let slack = repo
            .find_or_create(&identity(ProviderKind::Slack, None, "Dana", Some("42")))
            .await
            .unwrap();

        assert_eq!(telegram, again);
        assert_ne!(telegram, slack);
    }

    #[tokio::test]
    async fn test_anonymous_sender_gets_fresh_contact() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.contacts();

        let a = repo
            .find_or_create(&identity(ProviderKind::Slack, None, "", None))
            .await
            .unwrap();
        let b = repo
            .find_or_create(&identity(ProviderKind::Slack, None, "", None))
            .await
            .unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_concurrent_resolution_is_race_safe() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.contacts();
        let who = identity(ProviderKind::Gmail, Some("carol@example.com"), "Carol", None);

        let (a, b, c) = tokio::join!(
            repo.find_or_create(&who),
            repo.find_or_create(&who),
            repo.find_or_create(&who)
        );
        assert_eq!(a.unwrap(), b.as_ref().copied().unwrap());
        assert_eq!(b.unwrap(), c.unwrap());
        assert_eq!(repo.list(&WorkspaceId::new("ws-1"), 10).await.unwrap().len(), 1);
    }
}
