//! Sync orchestration.
//!
//! [`SyncEngine`] routes a connection to its provider adapter and runs the
//! shared ingestion pipeline: credential refresh, fetch, parse, idempotent
//! insert, contact resolution, cursor bookkeeping, classification hand-off
//! and progress reporting.

mod engine;
mod lease;
mod result;

pub use engine::SyncEngine;
pub use result::{ProviderSyncResult, SyncOptions, SyncResult, WorkspaceSyncSummary};
