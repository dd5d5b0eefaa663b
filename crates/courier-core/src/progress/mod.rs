//! Live sync progress, published per workspace.
//!
//! Nothing here is persisted: a subscriber only sees events published after
//! it subscribed.

mod broadcaster;
mod model;

pub use broadcaster::{ProgressBroadcaster, topic_for};
pub use model::{PROGRESS_EVENT, ProgressEvent, SyncPhase, SyncProgress};
