//! Slack adapter (direct messages via the Web API).

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use super::http::send_json;
use super::{
    FetchRequest, FetchedPage, ProviderAdapter, RawItem, SlackTs, SyncCursor, snippet_of,
    str_field,
};
use crate::connection::{ChannelConnection, ProviderKind};
use crate::error::{Error, Result};
use crate::message::NewMessage;

const DEFAULT_BASE_URL: &str = "https://slack.com/api";

/// History pages read per channel in one sync.
const MAX_HISTORY_PAGES: usize = 5;

/// Reads the user's direct-message channels.
#[derive(Debug, Clone)]
pub struct SlackAdapter {
    client: Client,
    base_url: String,
}

impl SlackAdapter {
    /// Create an adapter for the public Slack Web API.
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

    async fn call(
        &self,
        request: &FetchRequest<'_>,
        method: &str,
        query: &[(&str, String)],
    ) -> Result<Value> {
        let body = send_json(
            self.client
                .get(format!("{}/{method}", self.base_url))
                .bearer_auth(request.access_token)
                .query(query),
            request.cancel,
        )
        .await?;

        // Slack reports failures as 200 with `ok: false`.
        if body.get("ok").and_then(Value::as_bool) == Some(true) {
            return Ok(body);
        }
        let code = str_field(&body, "error").unwrap_or("unknown_error");
        Err(match code {
            "invalid_auth" | "not_authed" | "token_revoked" | "token_expired"
            | "account_inactive" => Error::ProviderUnauthorized(format!("slack: {code}")),
            _ => Error::ProviderFetch(format!("slack {method}: {code}")),
        })
    }

    /// Read one channel's history past `oldest`, following pagination.
    ///
    /// Returns the messages and whether unread pages remain.
    async fn channel_history(
        &self,
        request: &FetchRequest<'_>,
        channel: &str,
        oldest: Option<&SlackTs>,
    ) -> Result<(Vec<Value>, bool)> {
        let mut messages = Vec::new();
        let mut next_cursor: Option<String> = None;

        for _ in 0..MAX_HISTORY_PAGES {
            let mut query = vec![
                ("channel", channel.to_string()),
                ("limit", request.max_messages.to_string()),
            ];
            if let Some(oldest) = oldest {
                query.push(("oldest", oldest.to_string()));
            }
            if let Some(cursor) = &next_cursor {
                query.push(("cursor", cursor.clone()));
            }

            let body = self.call(request, "conversations.history", &query).await?;
            if let Some(page) = body.get("messages").and_then(Value::as_array) {
                messages.extend(page.iter().cloned().map(|mut m| {
                    if let Value::Object(map) = &mut m {
                        map.insert("channel".into(), Value::String(channel.to_string()));
                    }
                    m
                }));
            }

            next_cursor = body
                .get("response_metadata")
                .and_then(|m| str_field(m, "next_cursor"))
                .map(String::from);
            if next_cursor.is_none() {
                return Ok((messages, false));
            }
        }

        warn!(
            connection = %request.connection.id,
            channel,
            pages = MAX_HISTORY_PAGES,
            "slack history page limit reached"
        );
        Ok((messages, true))
    }
}

fn message_ts(payload: &Value) -> Option<SlackTs> {
    str_field(payload, "ts").and_then(SlackTs::parse)
}

#[async_trait]
impl ProviderAdapter for SlackAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Slack
    }

    async fn fetch_page(&self, request: FetchRequest<'_>) -> Result<FetchedPage> {
        let oldest = match request.cursor {
            Some(SyncCursor::Slack { ts }) => Some(ts),
            _ => None,
        };

        let listing = self
            .call(
                &request,
                "conversations.list",
                &[("types", "im".to_string()), ("limit", "200".to_string())],
            )
            .await?;
        let channels: Vec<String> = listing
            .get("channels")
            .and_then(Value::as_array)
            .map(|c| c.iter().filter_map(|ch| str_field(ch, "id")).map(String::from).collect())
            .unwrap_or_default();

        let mut has_more = false;
        let mut collected = Vec::new();
        for channel in &channels {
            let (messages, more) = self.channel_history(&request, channel, oldest).await?;
            has_more |= more;
            collected.extend(messages);
        }

        debug!(
            connection = %request.connection.id,
            channels = channels.len(),
            count = collected.len(),
            "slack direct messages"
        );

        let mut items: Vec<Result<RawItem>> = collected
            .into_iter()
            .map(|payload| match message_ts(&payload) {
                Some(ts) => Ok(RawItem {
                    position: SyncCursor::Slack { ts },
                    payload,
                }),
                None => Err(Error::ProviderItem("slack message without ts".into())),
            })
            .collect();

        // Oldest first across channels, so a truncated page never skips
        // past messages it did not return.
        items.sort_by_key(|item| match item {
            Ok(RawItem {
                position: SyncCursor::Slack { ts },
                ..
            }) => Some(*ts),
            _ => None,
        });
        let limit = usize::try_from(request.max_messages).unwrap_or(usize::MAX);
        if items.len() > limit {
            items.truncate(limit);
            has_more = true;
        }

        Ok(FetchedPage { items, has_more })
    }

    fn parse_item(
        &self,
        connection: &ChannelConnection,
        item: &RawItem,
    ) -> Result<Option<NewMessage>> {
        let payload = &item.payload;
        if payload.get("bot_id").is_some() || str_field(payload, "subtype") == Some("bot_message") {
            return Ok(None);
        }

        let SyncCursor::Slack { ts } = &item.position else {
            return Err(Error::ProviderItem("slack message with a foreign cursor".into()));
        };
        let channel = str_field(payload, "channel")
            .ok_or_else(|| Error::ProviderItem(format!("slack message {ts} without channel")))?;
        let timestamp = ts
            .to_datetime()
            .ok_or_else(|| Error::ProviderItem(format!("slack message {ts} has a bad date")))?;

        let mut message = NewMessage::new(connection, format!("{channel}:{ts}"), timestamp);
        message.provider_thread_id = Some(
            str_field(payload, "thread_ts")
                .map_or_else(|| channel.to_string(), |thread| format!("{channel}:{thread}")),
        );

        let text = str_field(payload, "text");
        message.body = text.map(String::from);
        message.snippet = text.and_then(|t| snippet_of(t, 200));
        message.sender_id = str_field(payload, "user").map(String::from);

        let profile = payload.get("user_profile").unwrap_or(&Value::Null);
        message.sender_name = str_field(profile, "real_name")
            .or_else(|| str_field(profile, "display_name"))
            .map(String::from);
        message.recipients = vec![connection.provider_account_id.clone()];
        message.raw_data = payload.clone();

        Ok(Some(message))
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

    async fn connection() -> ChannelConnection {
        let db = Database::in_memory().await.unwrap();
        db.connections()
            .create(&NewConnection::new("ws", "u", ProviderKind::Slack, "U0ME", "xoxp-1"))
            .await
            .unwrap()
    }

    async fn mount_listing(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/conversations.list"))
            .and(query_param("types", "im"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "channels": [{ "id": "D1" }, { "id": "D2" }]
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_fetch_page_merges_channels_oldest_first() {
        let server = MockServer::start().await;
        mount_listing(&server).await;
        Mock::given(method("GET"))
            .and(path("/conversations.history"))
            .and(query_param("channel", "D1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "messages": [
                    { "ts": "1714550403.000100", "user": "U1", "text": "third" },
                    { "ts": "1714550401.000100", "user": "U1", "text": "first" }
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/conversations.history"))
            .and(query_param("channel", "D2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "messages": [{ "ts": "1714550402.000100", "user": "U2", "text": "second" }]
            })))
            .mount(&server)
            .await;

        let conn = connection().await;
        let cancel = CancellationToken::new();
        let page = SlackAdapter::new(Client::new())
            .with_base_url(server.uri())
            .fetch_page(FetchRequest {
                connection: &conn,
                access_token: "xoxp-1",
                cursor: None,
                max_messages: 2,
                filter: None,
                cancel: &cancel,
            })
            .await
            .unwrap();

        assert!(page.has_more);
        let texts: Vec<_> = page
            .items
            .iter()
            .map(|i| i.as_ref().unwrap().payload["text"].as_str().unwrap())
            .collect();
        assert_eq!(texts, vec!["first", "second"]);
        assert_eq!(page.items[1].as_ref().unwrap().payload["channel"], "D2");
    }

    #[tokio::test]
    async fn test_invalid_auth_is_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": false,
                "error": "invalid_auth"
            })))
            .mount(&server)
            .await;

        let conn = connection().await;
        let cancel = CancellationToken::new();
        let err = SlackAdapter::new(Client::new())
            .with_base_url(server.uri())
            .fetch_page(FetchRequest {
                connection: &conn,
                access_token: "xoxp-1",
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
    async fn test_parse_item_skips_bots() {
        let conn = connection().await;
        let adapter = SlackAdapter::new(Client::new());
        let item = |payload: Value| RawItem {
            position: SyncCursor::Slack {
                ts: message_ts(&payload).unwrap(),
            },
            payload,
        };

        let human = item(json!({
            "ts": "1714550401.000100",
            "channel": "D1",
            "user": "U1",
            "text": "ping",
            "user_profile": { "real_name": "Frank Ocean" }
        }));
        let message = adapter.parse_item(&conn, &human).unwrap().unwrap();
        assert_eq!(message.provider_message_id, "D1:1714550401.000100");
        assert_eq!(message.sender_id.as_deref(), Some("U1"));
        assert_eq!(message.sender_name.as_deref(), Some("Frank Ocean"));
        assert_eq!(message.timestamp.timestamp(), 1_714_550_401);

        let bot = item(json!({
            "ts": "1714550402.000100",
            "channel": "D1",
            "bot_id": "B1",
            "text": "beep"
        }));
        assert!(adapter.parse_item(&conn, &bot).unwrap().is_none());
    }
}
