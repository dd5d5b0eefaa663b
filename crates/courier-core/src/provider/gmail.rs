//! Gmail adapter (Gmail REST API v1).

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::DateTime;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use super::http::send_json;
use super::{
    FetchRequest, FetchedPage, ProviderAdapter, RawItem, SyncCursor, parse_address, snippet_of,
    split_addresses, str_field,
};
use crate::connection::{ChannelConnection, ProviderKind};
use crate::error::{Error, Result};
use crate::message::NewMessage;

const DEFAULT_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1";

/// Ids requested per `messages.list` call, Gmail's maximum.
const LISTING_PAGE_SIZE: &str = "500";

/// Listing pages followed in one sync. Mail older than this horizon on a
/// first sync is not backfilled.
const MAX_LISTING_PAGES: usize = 20;

/// Fetches mail through a search query on `internalDate`.
#[derive(Debug, Clone)]
pub struct GmailAdapter {
    client: Client,
    base_url: String,
}

impl GmailAdapter {
    /// Create an adapter for the public Gmail API.
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

    /// Build the search query for a cursor and an optional refinement.
    ///
    /// `after:` has second granularity, so the item at the cursor comes back
    /// and is skipped by the engine.
    fn search_query(cursor: Option<&SyncCursor>, filter: Option<&str>) -> String {
        let mut parts = Vec::new();
        if let Some(SyncCursor::Gmail { internal_date_ms }) = cursor {
            parts.push(format!("after:{}", internal_date_ms / 1000));
        }
        if let Some(filter) = filter.map(str::trim).filter(|f| !f.is_empty()) {
            parts.push(filter.to_string());
        }
        parts.join(" ")
    }

    /// List every message id matching `query`, newest first as Gmail
    /// returns them, following `nextPageToken`.
    ///
    /// The flag is `false` when the listing horizon was reached before the
    /// end of the result set.
    async fn list_ids(
        &self,
        request: &FetchRequest<'_>,
        query: &str,
    ) -> Result<(Vec<String>, bool)> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_LISTING_PAGES {
            let mut params = vec![("q", query), ("maxResults", LISTING_PAGE_SIZE)];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.as_str()));
            }

            let listing = send_json(
                self.client
                    .get(format!("{}/users/me/messages", self.base_url))
                    .bearer_auth(request.access_token)
                    .query(&params),
                request.cancel,
            )
            .await?;

            if let Some(messages) = listing.get("messages").and_then(Value::as_array) {
                ids.extend(messages.iter().filter_map(|m| str_field(m, "id")).map(String::from));
            }

            page_token = str_field(&listing, "nextPageToken").map(String::from);
            if page_token.is_none() {
                return Ok((ids, true));
            }
        }

        warn!(
            connection = %request.connection.id,
            pages = MAX_LISTING_PAGES,
            listed = ids.len(),
            "gmail listing horizon reached"
        );
        Ok((ids, false))
    }

    async fn fetch_message(&self, request: &FetchRequest<'_>, id: &str) -> Result<RawItem> {
        let payload = send_json(
            self.client
                .get(format!("{}/users/me/messages/{id}", self.base_url))
                .bearer_auth(request.access_token)
                .query(&[("format", "full")]),
            request.cancel,
        )
        .await?;

        let internal_date_ms = str_field(&payload, "internalDate")
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| {
                Error::ProviderItem(format!("gmail message {id} has no internalDate"))
            })?;

        Ok(RawItem {
            position: SyncCursor::Gmail { internal_date_ms },
            payload,
        })
    }
}

#[async_trait]
impl ProviderAdapter for GmailAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gmail
    }

    async fn fetch_page(&self, request: FetchRequest<'_>) -> Result<FetchedPage> {
        let query = Self::search_query(request.cursor, request.filter);
        let (mut ids, complete) = self.list_ids(&request, &query).await?;

        // Take the oldest ids, so the cursor never passes mail left for the
        // next page.
        ids.reverse();
        let limit = usize::try_from(request.max_messages).unwrap_or(usize::MAX);
        let has_more = !complete || ids.len() > limit;
        ids.truncate(limit);

        debug!(
            connection = %request.connection.id,
            query = %query,
            count = ids.len(),
            has_more,
            "gmail listing"
        );

        let mut items = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.fetch_message(&request, id).await {
                Err(e @ (Error::Cancelled | Error::ProviderUnauthorized(_))) => return Err(e),
                Err(e) => {
                    warn!(
                        connection = %request.connection.id,
                        message = %id,
                        "gmail fetch failed: {e}"
                    );
                    items.push(Err(Error::ProviderItem(format!("gmail message {id}: {e}"))));
                }
                Ok(item) => items.push(Ok(item)),
            }
        }

        items.sort_by_key(|item| match item {
            Ok(RawItem {
                position: SyncCursor::Gmail { internal_date_ms },
                ..
            }) => Some(*internal_date_ms),
            _ => None,
        });

        Ok(FetchedPage { items, has_more })
    }

    fn parse_item(
        &self,
        connection: &ChannelConnection,
        item: &RawItem,
    ) -> Result<Option<NewMessage>> {
        let payload = &item.payload;
        let id = str_field(payload, "id")
            .ok_or_else(|| Error::ProviderItem("gmail message without id".into()))?;
        let SyncCursor::Gmail { internal_date_ms } = item.position else {
            return Err(Error::ProviderItem(format!("gmail message {id} has a foreign cursor")));
        };
        let timestamp = DateTime::from_timestamp_millis(internal_date_ms)
            .ok_or_else(|| Error::ProviderItem(format!("gmail message {id} has a bad date")))?;

        let part = payload.get("payload").unwrap_or(&Value::Null);
        let header = |name: &str| header_value(part, name);

        let mut message = NewMessage::new(connection, id, timestamp);
        message.provider_thread_id = str_field(payload, "threadId").map(String::from);
        message.subject = header("Subject").map(String::from);

        if let Some(from) = header("From") {
            let (name, email) = parse_address(from);
            message.sender_name = name;
            message.sender_email = email;
        }

        message.recipients = ["To", "Cc"]
            .into_iter()
            .filter_map(header)
            .flat_map(split_addresses)
            .collect();

        let mut body = Bodies::default();
        collect_bodies(part, &mut body);
        message.snippet = str_field(payload, "snippet")
            .map(String::from)
            .or_else(|| body.text.as_deref().and_then(|t| snippet_of(t, 200)));
        message.body = body.text;
        message.body_html = body.html;

        message.labels = payload
            .get("labelIds")
            .and_then(Value::as_array)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        message.raw_data = payload.clone();

        Ok(Some(message))
    }
}

fn header_value<'a>(part: &'a Value, name: &str) -> Option<&'a str> {
    part.get("headers")?
        .as_array()?
        .iter()
        .find(|h| {
            h.get("name")
                .and_then(Value::as_str)
                .is_some_and(|n| n.eq_ignore_ascii_case(name))
        })
        .and_then(|h| h.get("value"))
        .and_then(Value::as_str)
}

#[derive(Default)]
struct Bodies {
    text: Option<String>,
    html: Option<String>,
}

/// Walk the MIME tree and keep the first text and HTML bodies.
fn collect_bodies(part: &Value, out: &mut Bodies) {
    let mime = str_field(part, "mimeType").unwrap_or_default();
    let data = part
        .get("body")
        .and_then(|b| str_field(b, "data"))
        .and_then(decode_body);

    if let Some(data) = data {
        if mime.eq_ignore_ascii_case("text/plain") && out.text.is_none() {
            out.text = Some(data);
        } else if mime.eq_ignore_ascii_case("text/html") && out.html.is_none() {
            out.html = Some(data);
        }
    }

    if let Some(parts) = part.get("parts").and_then(Value::as_array) {
        for child in parts {
            collect_bodies(child, out);
        }
    }
}

/// Gmail bodies are base64url, with or without padding.
fn decode_body(data: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(data.trim_end_matches('=')).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}
