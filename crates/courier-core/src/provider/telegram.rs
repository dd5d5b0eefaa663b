//! Telegram bot adapter (`getUpdates` polling and webhook updates).

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use super::http::send_json;
use super::{FetchRequest, FetchedPage, ProviderAdapter, RawItem, SyncCursor, snippet_of, str_field};
use crate::connection::{ChannelConnection, ProviderKind};
use crate::error::{Error, Result};
use crate::message::NewMessage;

const DEFAULT_BASE_URL: &str = "https://api.telegram.org";

/// Reads private messages sent to a bot.
///
/// The connection's access token is the bot token.
#[derive(Debug, Clone)]
pub struct TelegramAdapter {
    client: Client,
    base_url: String,
}

impl TelegramAdapter {
    /// Create an adapter for the public Bot API.
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
}

fn update_item(update: Value) -> Result<RawItem> {
    let update_id = update
        .get("update_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::ProviderItem("telegram update without update_id".into()))?;
    Ok(RawItem {
        position: SyncCursor::Telegram { update_id },
        payload: update,
    })
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

#[async_trait]
impl ProviderAdapter for TelegramAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Telegram
    }

    async fn fetch_page(&self, request: FetchRequest<'_>) -> Result<FetchedPage> {
        let offset = match request.cursor {
            Some(SyncCursor::Telegram { update_id }) => update_id.saturating_add(1),
            _ => 0,
        };

        let body = send_json(
            self.client
                .get(format!(
                    "{}/bot{}/getUpdates",
                    self.base_url, request.access_token
                ))
                .query(&[
                    ("offset", offset.to_string()),
                    ("limit", request.max_messages.to_string()),
                    ("timeout", "0".to_string()),
                ]),
            request.cancel,
        )
        .await?;

        if body.get("ok").and_then(Value::as_bool) != Some(true) {
            let description = str_field(&body, "description").unwrap_or("unknown error");
            return Err(match body.get("error_code").and_then(Value::as_i64) {
                Some(401 | 403) => Error::ProviderUnauthorized(description.to_string()),
                _ => Error::ProviderFetch(format!("telegram: {description}")),
            });
        }

        let updates = body
            .get("result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        debug!(
            connection = %request.connection.id,
            offset,
            count = updates.len(),
            "telegram updates"
        );

        let has_more = u32::try_from(updates.len()).unwrap_or(u32::MAX) >= request.max_messages;
        Ok(FetchedPage {
            items: updates.into_iter().map(update_item).collect(),
            has_more,
        })
    }

    fn parse_item(
        &self,
        connection: &ChannelConnection,
        item: &RawItem,
    ) -> Result<Option<NewMessage>> {
        let Some(msg) = item.payload.get("message") else {
            return Ok(None);
        };
        let from = msg.get("from").unwrap_or(&Value::Null);
        if from.get("is_bot").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(None);
        }
        let chat = msg.get("chat").unwrap_or(&Value::Null);
        if str_field(chat, "type") != Some("private") {
            return Ok(None);
        }

        let chat_id = chat
            .get("id")
            .and_then(id_string)
            .ok_or_else(|| Error::ProviderItem("telegram message without chat id".into()))?;
        let message_id = msg
            .get("message_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::ProviderItem("telegram message without message_id".into()))?;
        let timestamp = msg
            .get("date")
            .and_then(Value::as_i64)
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| {
                Error::ProviderItem(format!("telegram message {message_id} has a bad date"))
            })?;

        let mut message = NewMessage::new(connection, format!("{chat_id}:{message_id}"), timestamp);
        message.provider_thread_id = Some(chat_id);

        let text = str_field(msg, "text").or_else(|| str_field(msg, "caption"));
        message.body = text.map(String::from);
        message.snippet = text.and_then(|t| snippet_of(t, 200));

        let name = [str_field(from, "first_name"), str_field(from, "last_name")]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        message.sender_name = if name.is_empty() {
            str_field(from, "username").map(String::from)
        } else {
            Some(name)
        };
        message.sender_id = from.get("id").and_then(id_string);
        message.recipients = vec![connection.provider_account_id.clone()];
        message.raw_data = item.payload.clone();

        Ok(Some(message))
    }

    /// A webhook delivers one update object (or, from some relays, an array).
    fn push_items(&self, payload: &Value) -> Result<Option<Vec<RawItem>>> {
        let items = match payload {
            Value::Array(updates) => updates
                .iter()
                .cloned()
                .map(update_item)
                .collect::<Result<Vec<_>>>()?,
            update => vec![update_item(update.clone())?],
        };
        Ok(Some(items))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::Database;
    use crate::connection::NewConnection;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn update(update_id: i64, chat_type: &str, is_bot: bool) -> Value {
        json!({
            "update_id": update_id,
            "message": {
                "message_id": 7,
                "date": 1_714_550_400,
                "text": "hello bot",
                "from": { "id": 555, "is_bot": is_bot, "first_name": "Dana", "last_name": "Lee" },
                "chat": { "id": 555, "type": chat_type }
            }
        })
    }

    async fn connection() -> ChannelConnection {
        let db = Database::in_memory().await.unwrap();
        db.connections()
            .create(&NewConnection::new(
                "ws",
                "u",
                ProviderKind::Telegram,
                "support_bot",
                "123:abc",
            ))
            .await
            .unwrap()
    }

    fn raw(payload: Value) -> RawItem {
        update_item(payload).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_page_uses_offset_after_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bot123:abc/getUpdates"))
            .and(query_param("offset", "105"))
            .and(query_param("limit", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": [update(105, "private", false), update(106, "group", false)]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let conn = connection().await;
        let cursor = SyncCursor::Telegram { update_id: 104 };
        let cancel = CancellationToken::new();
        let page = TelegramAdapter::new(Client::new())
            .with_base_url(server.uri())
            .fetch_page(FetchRequest {
                connection: &conn,
                access_token: "123:abc",
                cursor: Some(&cursor),
                max_messages: 2,
                filter: None,
                cancel: &cancel,
            })
            .await
            .unwrap();

        assert!(page.has_more);
        assert_eq!(
            page.items[1].as_ref().unwrap().position,
            SyncCursor::Telegram { update_id: 106 }
        );
    }

    #[tokio::test]
    async fn test_offset_at_largest_update_id_does_not_overflow() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bot123:abc/getUpdates"))
            .and(query_param("offset", i64::MAX.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": []
            })))
            .expect(1)
            .mount(&server)
            .await;

        let conn = connection().await;
        let cursor = SyncCursor::Telegram { update_id: i64::MAX };
        let cancel = CancellationToken::new();
        let page = TelegramAdapter::new(Client::new())
            .with_base_url(server.uri())
            .fetch_page(FetchRequest {
                connection: &conn,
                access_token: "123:abc",
                cursor: Some(&cursor),
                max_messages: 10,
                filter: None,
                cancel: &cancel,
            })
            .await
            .unwrap();
        assert!(page.items.is_empty());
    }

    #[tokio::test]
    async fn test_unauthorized_bot_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": false,
                "error_code": 401,
                "description": "Unauthorized"
            })))
            .mount(&server)
            .await;

        let conn = connection().await;
        let cancel = CancellationToken::new();
        let err = TelegramAdapter::new(Client::new())
            .with_base_url(server.uri())
            .fetch_page(FetchRequest {
                connection: &conn,
                access_token: "123:abc",
                cursor: None,
                max_messages: 10,
                filter: None,
                cancel: &cancel,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderUnauthorized(_)));
    }

    #[tokio::test]
    async fn test_parse_private_message() {
        let conn = connection().await;
        let adapter = TelegramAdapter::new(Client::new());
        let message = adapter
            .parse_item(&conn, &raw(update(105, "private", false)))
            .unwrap()
            .unwrap();

        assert_eq!(message.provider_message_id, "555:7");
        assert_eq!(message.sender_id.as_deref(), Some("555"));
        assert_eq!(message.sender_name.as_deref(), Some("Dana Lee"));
        assert!(message.sender_email.is_none());
        assert_eq!(message.body.as_deref(), Some("hello bot"));
    }

    #[tokio::test]
    async fn test_filters_bots_groups_and_non_messages() {
        let conn = connection().await;
        let adapter = TelegramAdapter::new(Client::new());

        assert!(adapter.parse_item(&conn, &raw(update(1, "private", true))).unwrap().is_none());
        let group = raw(update(2, "supergroup", false));
        assert!(adapter.parse_item(&conn, &group).unwrap().is_none());
        let edited = json!({ "update_id": 3, "edited_message": {} });
        assert!(adapter.parse_item(&conn, &raw(edited)).unwrap().is_none());
    }

    #[test]
    fn test_push_items() {
        let adapter = TelegramAdapter::new(Client::new());
        let items = adapter.push_items(&update(105, "private", false)).unwrap().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].position, SyncCursor::Telegram { update_id: 105 });

        assert!(adapter.push_items(&json!({ "message": {} })).is_err());
    }
}
