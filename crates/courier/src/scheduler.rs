//! Periodic sync of every workspace with active connections.

use std::time::Duration;

use courier_core::SyncEngine;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Run [`tick`] every `interval` until `shutdown` is cancelled.
pub fn spawn(
    engine: SyncEngine,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = interval.as_secs(), "scheduler started");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    tick(&engine, &shutdown).await;
                }
            }
        }

        info!("scheduler stopped");
    })
}

/// Sync all workspaces once, workspaces concurrently, connections within a
/// workspace one after another. Returns the number of workspaces synced.
pub async fn tick(engine: &SyncEngine, shutdown: &CancellationToken) -> usize {
    let workspaces = match engine.database().connections().active_workspaces().await {
        Ok(workspaces) => workspaces,
        Err(e) => {
            error!("listing workspaces failed: {e}");
            return 0;
        }
    };
    debug!(workspaces = workspaces.len(), "scheduled sync");

    let mut tasks = JoinSet::new();
    for workspace in workspaces {
        let engine = engine.clone();
        let options = engine.default_options().clone();
        let cancel = shutdown.child_token();
        tasks.spawn(async move {
            let outcome = engine
                .sync_all_workspace_connections(&workspace, &options, &cancel)
                .await;
            (workspace, outcome)
        });
    }

    let mut synced = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((workspace, Ok(summary))) => {
                synced += 1;
                debug!(
                    workspace = %workspace,
                    connections = summary.total_connections,
                    new_messages = summary.total_new_messages,
                    "scheduled workspace sync done"
                );
            }
            Ok((workspace, Err(e))) => error!(workspace = %workspace, "scheduled sync failed: {e}"),
            Err(e) => error!("scheduled sync task panicked: {e}"),
        }
    }
    synced
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use courier_core::{
        AdapterRegistry, ConnectionStatus, Database, NewConnection, ProgressBroadcaster,
        ProviderKind, TokenManager,
    };

    async fn engine() -> SyncEngine {
        let db = Database::in_memory().await.unwrap();
        SyncEngine::new(
            db.clone(),
            TokenManager::new(db.connections()),
            AdapterRegistry::new(),
            ProgressBroadcaster::default(),
        )
    }

    #[tokio::test]
    async fn test_tick_without_connections() {
        let engine = engine().await;
        assert_eq!(tick(&engine, &CancellationToken::new()).await, 0);
    }

    #[tokio::test]
    async fn test_tick_visits_each_active_workspace() {
        let engine = engine().await;
        let connections = engine.database().connections();
        for ws in ["ws-a", "ws-b"] {
            connections
                .create(&NewConnection::new(ws, "u", ProviderKind::Teams, "acct", "at"))
                .await
                .unwrap();
        }
        let idle = connections
            .create(&NewConnection::new("ws-c", "u", ProviderKind::Teams, "acct", "at"))
            .await
            .unwrap();
        connections
            .set_status(idle.id, ConnectionStatus::Inactive)
            .await
            .unwrap();

        assert_eq!(tick(&engine, &CancellationToken::new()).await, 2);
    }

    #[tokio::test]
    async fn test_spawned_scheduler_stops_on_shutdown() {
        let engine = engine().await;
        let shutdown = CancellationToken::new();
        let handle = spawn(engine, Duration::from_secs(60), shutdown.clone());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
