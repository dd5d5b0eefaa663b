//! In-process per-connection sync leases.

use std::sync::Arc;

use dashmap::DashSet;

use crate::connection::ConnectionId;

/// Set of connections currently being synced.
#[derive(Debug, Clone, Default)]
pub(crate) struct SyncLeases {
    held: Arc<DashSet<ConnectionId>>,
}

impl SyncLeases {
    /// Take the lease for a connection, or `None` if it is already held.
    pub(crate) fn try_acquire(&self, id: ConnectionId) -> Option<SyncLease> {
        self.held.insert(id).then(|| SyncLease {
            held: Arc::clone(&self.held),
            id,
        })
    }

    pub(crate) fn is_held(&self, id: ConnectionId) -> bool {
        self.held.contains(&id)
    }
}

/// Released on drop.
#[derive(Debug)]
pub(crate) struct SyncLease {
    held: Arc<DashSet<ConnectionId>>,
    id: ConnectionId,
}

impl Drop for SyncLease {
    fn drop(&mut self) {
        self.held.remove(&self.id);
    }
}
