//! Deduplicating message store.
//!
//! Messages are keyed by `(channel_connection_id, provider_message_id)`;
//! ingesting the same provider message again resolves to the existing row.

mod model;
mod repository;

pub use model::{Classification, Message, MessageId, NewMessage, UpsertOutcome};
pub use repository::MessageRepository;
