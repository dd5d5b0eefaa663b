//! Outlook adapter (Microsoft Graph mail).

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use super::http::send_json;
use super::{FetchRequest, FetchedPage, ProviderAdapter, RawItem, SyncCursor, snippet_of, str_field};
use crate::connection::{ChannelConnection, ProviderKind};
use crate::error::{Error, Result};
use crate::message::NewMessage;

const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

/// Fetches inbox messages received after the cursor, oldest first.
#[derive(Debug, Clone)]
pub struct OutlookAdapter {
    client: Client,
    base_url: String,
}

impl OutlookAdapter {
    /// Create an adapter for the public Graph API.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Points the adapter at another API root.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Build the `$filter` clause.
    fn filter_clause(cursor: Option<&SyncCursor>, filter: Option<&str>) -> Option<String> {
        let since = match cursor {
            Some(SyncCursor::Outlook { received_at }) => Some(format!(
                "receivedDateTime gt {}",
                received_at.to_rfc3339_opts(SecondsFormat::Secs, true)
            )),
            _ => None,
        };
        let extra = filter.map(str::trim).filter(|f| !f.is_empty());

        match (since, extra) {
            (Some(since), Some(extra)) => Some(format!("{since} and ({extra})")),
            (Some(since), None) => Some(since),
            (None, Some(extra)) => Some(extra.to_string()),
            (None, None) => None,
        }
    }
}

fn received_at(payload: &Value) -> Option<DateTime<Utc>> {
    str_field(payload, "receivedDateTime")
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn email_address(value: &Value) -> (Option<String>, Option<String>) {
    let address = value.get("emailAddress").unwrap_or(&Value::Null);
    (
        str_field(address, "name").map(String::from),
        str_field(address, "address").map(String::from),
    )
}

#[async_trait]
impl ProviderAdapter for OutlookAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Outlook
    }

    async fn fetch_page(&self, request: FetchRequest<'_>) -> Result<FetchedPage> {
        let mut query = vec![
            ("$orderby", "receivedDateTime asc".to_string()),
            ("$top", request.max_messages.to_string()),
        ];
        if let Some(filter) = Self::filter_clause(request.cursor, request.filter) {
            query.push(("$filter", filter));
        }

        let body = send_json(
            self.client
                .get(format!("{}/me/mailFolders/inbox/messages", self.base_url))
                .bearer_auth(request.access_token)
                .query(&query),
            request.cancel,
        )
        .await?;

        let values = body
            .get("value")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        debug!(connection = %request.connection.id, count = values.len(), "outlook page");

        let items = values
            .into_iter()
            .map(|payload| -> Result<RawItem> {
                let received_at = received_at(&payload).ok_or_else(|| {
                    Error::ProviderItem("outlook message without receivedDateTime".into())
                })?;
                Ok(RawItem {
                    position: SyncCursor::Outlook { received_at },
                    payload,
                })
            })
            .collect();

        Ok(FetchedPage {
            items,
            has_more: body.get("@odata.nextLink").is_some(),
        })
    }

    fn parse_item(
        &self,
        connection: &ChannelConnection,
        item: &RawItem,
    ) -> Result<Option<NewMessage>> {
        let payload = &item.payload;
        let id = str_field(payload, "id")
            .ok_or_else(|| Error::ProviderItem("outlook message without id".into()))?;
        let timestamp = received_at(payload)
            .ok_or_else(|| Error::ProviderItem(format!("outlook message {id} has a bad date")))?;

        let mut message = NewMessage::new(connection, id, timestamp);
        message.provider_thread_id = str_field(payload, "conversationId").map(String::from);
        message.subject = str_field(payload, "subject").map(String::from);

        if let Some(from) = payload.get("from") {
            let (name, email) = email_address(from);
            message.sender_name = name;
            message.sender_email = email;
        }

        message.recipients = ["toRecipients", "ccRecipients"]
            .into_iter()
            .filter_map(|key| payload.get(key).and_then(Value::as_array))
            .flatten()
            .filter_map(|r| email_address(r).1)
            .collect();

        if let Some(body) = payload.get("body") {
            let content = str_field(body, "content").map(String::from);
            if str_field(body, "contentType").is_some_and(|t| t.eq_ignore_ascii_case("html")) {
                message.body_html = content;
            } else {
                message.body = content;
            }
        }
        message.snippet = str_field(payload, "bodyPreview")
            .and_then(|preview| snippet_of(preview, 200));

        message.labels = payload
            .get("categories")
            .and_then(Value::as_array)
            .map(|c| c.iter().filter_map(Value::as_str).map(String::from).collect())
            .unwrap_or_default();
        message.raw_data = payload.clone();

        Ok(Some(message))
    }
}
