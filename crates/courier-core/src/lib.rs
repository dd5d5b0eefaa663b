//! # courier-core
//!
//! Multi-channel message synchronization engine for Courier.
//!
//! This crate provides:
//! - Channel connections (credentials, cursor, status)
//! - Token lifecycle (refresh ahead of expiry, demotion on failure)
//! - Provider adapters for Gmail, Outlook, Telegram and Slack
//! - Deduplicating message store and contact resolution (`SQLite`)
//! - Sync orchestration with per-connection leases and cancellation
//! - **Classification Dispatcher** - bounded queue in front of an external classifier
//! - **Progress Broadcaster** - per-workspace live sync progress

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod classify;
pub mod connection;
pub mod contacts;
mod database;
mod error;
pub mod message;
pub mod progress;
pub mod provider;
pub mod sync;
pub mod token;

pub use classify::{
    ClassificationDispatcher, Classifier, ClassifierError, DispatchStats, DispatcherConfig,
    HttpClassifier,
};
pub use connection::{
    ChannelConnection, ConnectionId, ConnectionRepository, ConnectionStatus, NewConnection,
    ProviderKind, UserId, WorkspaceId,
};
pub use contacts::{Contact, ContactId, ContactRepository, NewContact};
pub use database::Database;
pub use error::{Error, Result};
pub use message::{Message, MessageId, MessageRepository, NewMessage, UpsertOutcome};
pub use progress::{ProgressBroadcaster, ProgressEvent, SyncPhase, SyncProgress};
pub use provider::{AdapterRegistry, ProviderAdapter, SyncCursor};
pub use sync::{ProviderSyncResult, SyncEngine, SyncOptions, SyncResult, WorkspaceSyncSummary};
pub use token::TokenManager;
