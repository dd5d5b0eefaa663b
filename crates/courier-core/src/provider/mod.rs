//! Provider adapters.
//!
//! An adapter knows how to fetch one page of new items from a provider and
//! how to turn each raw item into a [`NewMessage`]. Everything shared by all
//! providers (credential refresh, dedup, contact resolution, cursor
//! bookkeeping) lives in the sync engine, so adding a provider means adding
//! an adapter and registering it in the [`AdapterRegistry`].

mod cursor;
mod gmail;
mod http;
mod outlook;
mod registry;
mod slack;
mod telegram;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use cursor::{SlackTs, SyncCursor};
pub use gmail::GmailAdapter;
pub use outlook::OutlookAdapter;
pub use registry::AdapterRegistry;
pub use slack::SlackAdapter;
pub use telegram::TelegramAdapter;

use crate::connection::{ChannelConnection, ProviderKind};
use crate::error::Result;
use crate::message::NewMessage;

/// Everything an adapter needs to fetch one page.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    /// Connection being synced.
    pub connection: &'a ChannelConnection,
    /// Fresh access token.
    pub access_token: &'a str,
    /// Position of the last ingested item.
    pub cursor: Option<&'a SyncCursor>,
    /// Page size.
    pub max_messages: u32,
    /// Provider query refinement.
    pub filter: Option<&'a str>,
    /// Aborts in-flight requests.
    pub cancel: &'a CancellationToken,
}

/// One undecoded provider item and its position.
#[derive(Debug, Clone, PartialEq)]
pub struct RawItem {
    /// Where the item sits in the provider's stream.
    pub position: SyncCursor,
    /// Provider payload.
    pub payload: serde_json::Value,
}

/// A fetched page of items.
///
/// Items that could not be fetched individually are kept as errors so that
/// the caller counts them without dropping the rest of the page.
#[derive(Debug, Default)]
pub struct FetchedPage {
    /// Items in provider order.
    pub items: Vec<Result<RawItem>>,
    /// The provider has more items past this page.
    pub has_more: bool,
}

/// Provider-specific fetch and parse.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider this adapter handles.
    fn kind(&self) -> ProviderKind;

    /// Fetch items past the request's cursor.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ProviderUnauthorized`] if the provider rejects
    /// the token, [`crate::Error::Cancelled`] if the request was cancelled,
    /// and [`crate::Error::ProviderFetch`] for any other page-level failure.
    async fn fetch_page(&self, request: FetchRequest<'_>) -> Result<FetchedPage>;

    /// Normalize a raw item. `None` means the item is filtered out.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ProviderItem`] if the payload is malformed.
    fn parse_item(
        &self,
        connection: &ChannelConnection,
        item: &RawItem,
    ) -> Result<Option<NewMessage>>;

    /// Decode a webhook payload that carries the items themselves.
    ///
    /// `None` means the payload is only a change notification and the
    /// connection has to be polled.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ProviderItem`] if the payload is malformed.
    fn push_items(&self, payload: &serde_json::Value) -> Result<Option<Vec<RawItem>>> {
        let _ = payload;
        Ok(None)
    }
}

/// Split `"Name <address>"` into its parts.
pub(crate) fn parse_address(value: &str) -> (Option<String>, Option<String>) {
    let value = value.trim();
    if let Some((name, rest)) = value.rsplit_once('<')
        && let Some(address) = rest.strip_suffix('>')
    {
        let name = name.trim().trim_matches('"').trim();
        let address = address.trim();
        return (
            (!name.is_empty()).then(|| name.to_string()),
            (!address.is_empty()).then(|| address.to_string()),
        );
    }
    if value.contains('@') {
        (None, Some(value.to_string()))
    } else {
        ((!value.is_empty()).then(|| value.to_string()), None)
    }
}

/// Split a comma separated address header into addresses.
pub(crate) fn split_addresses(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter_map(|part| parse_address(part).1)
        .collect()
}

/// First `max_chars` characters of a body, on one line.
pub(crate) fn snippet_of(text: &str, max_chars: usize) -> Option<String> {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.is_empty() {
        return None;
    }
    Some(flat.chars().take(max_chars).collect())
}

/// Non-empty string field of a JSON object.
pub(crate) fn str_field<'a>(value: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(serde_json::Value::as_str)
        .filter(|s| !s.is_empty())
}
