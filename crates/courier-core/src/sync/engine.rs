//! Sync engine.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::lease::{SyncLease, SyncLeases};
use super::result::{ProviderSyncResult, SyncOptions, SyncResult, WorkspaceSyncSummary};
use crate::Database;
use crate::classify::ClassificationDispatcher;
use crate::connection::{ChannelConnection, ConnectionId, ConnectionStatus, WorkspaceId};
use crate::contacts::NewContact;
use crate::error::{Error, Result};
use crate::message::{MessageId, NewMessage, UpsertOutcome};
use crate::progress::{ProgressBroadcaster, SyncPhase, SyncProgress};
use crate::provider::{AdapterRegistry, FetchRequest, ProviderAdapter, RawItem, SyncCursor};
use crate::token::TokenManager;

/// Orchestrates connection syncs.
///
/// Cheap to clone; clones share the database pool, the leases and the
/// progress channels.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    db: Database,
    tokens: TokenManager,
    adapters: AdapterRegistry,
    progress: ProgressBroadcaster,
    classifier: Option<ClassificationDispatcher>,
    leases: SyncLeases,
    default_options: SyncOptions,
}

/// A connection cleared to sync. Holding it holds the lease.
struct Admitted {
    connection: ChannelConnection,
    adapter: Arc<dyn ProviderAdapter>,
    _lease: SyncLease,
}

enum Admission {
    Ready(Admitted),
    Rejected(SyncResult),
}

/// Where the items of a sync come from.
enum Source<'a> {
    Poll(&'a SyncOptions),
    Push(Vec<RawItem>),
}

enum ItemOutcome {
    Filtered,
    Stored {
        outcome: UpsertOutcome,
        summary: String,
        contact_failed: bool,
    },
}

impl SyncEngine {
    /// Create an engine without a classifier.
    #[must_use]
    pub fn new(
        db: Database,
        tokens: TokenManager,
        adapters: AdapterRegistry,
        progress: ProgressBroadcaster,
    ) -> Self {
        Self {
            db,
            tokens,
            adapters,
            progress,
            classifier: None,
            leases: SyncLeases::default(),
            default_options: SyncOptions::default(),
        }
    }

    /// Hand new messages to this dispatcher.
    #[must_use]
    pub fn with_classifier(mut self, dispatcher: ClassificationDispatcher) -> Self {
        self.classifier = Some(dispatcher);
        self
    }

    /// Options used for pushed and scheduled syncs.
    #[must_use]
    pub fn with_default_options(mut self, options: SyncOptions) -> Self {
        self.default_options = options;
        self
    }

    /// Options used for pushed and scheduled syncs.
    #[must_use]
    pub const fn default_options(&self) -> &SyncOptions {
        &self.default_options
    }

    /// Progress channels.
    #[must_use]
    pub const fn progress(&self) -> &ProgressBroadcaster {
        &self.progress
    }

    /// Underlying database.
    #[must_use]
    pub const fn database(&self) -> &Database {
        &self.db
    }

    /// Classification dispatcher, if configured.
    #[must_use]
    pub const fn classifier(&self) -> Option<&ClassificationDispatcher> {
        self.classifier.as_ref()
    }

    /// Whether a sync of this connection is running in this process.
    #[must_use]
    pub fn is_syncing(&self, id: ConnectionId) -> bool {
        self.leases.is_held(id)
    }

    /// Fetch and store one page for a connection, without classification.
    ///
    /// Routing and business failures (unknown connection, inactive
    /// connection, unsupported provider, rejected credentials, provider
    /// outage, cancellation) come back as a result with `success: false`.
    ///
    /// # Errors
    ///
    /// Returns an error only for failures of the database itself.
    pub async fn sync_provider_messages(
        &self,
        id: ConnectionId,
        workspace_id: &WorkspaceId,
        options: &SyncOptions,
        cancel: &CancellationToken,
    ) -> Result<ProviderSyncResult> {
        match self.admit(id, Some(workspace_id)).await? {
            Admission::Rejected(result) => Ok(result.outcome),
            Admission::Ready(admitted) => {
                self.run(admitted, Source::Poll(options), false, cancel)
                    .await
            }
        }
    }

    /// Sync one connection and, if requested, classify what it inserted.
    ///
    /// # Errors
    ///
    /// Returns an error only for failures of the database itself.
    pub async fn sync_channel_connection(
        &self,
        id: ConnectionId,
        workspace_id: &WorkspaceId,
        options: &SyncOptions,
        cancel: &CancellationToken,
    ) -> Result<SyncResult> {
        match self.admit(id, Some(workspace_id)).await? {
            Admission::Rejected(result) => Ok(result),
            Admission::Ready(admitted) => {
                let provider = admitted.connection.provider;
                let outcome = self
                    .run(admitted, Source::Poll(options), options.auto_classify, cancel)
                    .await?;
                Ok(SyncResult {
                    connection_id: id,
                    provider: Some(provider),
                    outcome,
                })
            }
        }
    }

    /// Sync every active connection of a workspace, one after another.
    ///
    /// A connection that fails, even with a database error, is reported in
    /// its result and does not stop the others.
    ///
    /// # Errors
    ///
    /// Returns an error if the workspace's connections cannot be listed.
    pub async fn sync_all_workspace_connections(
        &self,
        workspace_id: &WorkspaceId,
        options: &SyncOptions,
        cancel: &CancellationToken,
    ) -> Result<WorkspaceSyncSummary> {
        let connections = self.db.connections().list_active(workspace_id).await?;
        let mut summary = WorkspaceSyncSummary {
            total_connections: connections.len(),
            ..WorkspaceSyncSummary::default()
        };

        for connection in connections {
            let result = match self
                .sync_channel_connection(connection.id, workspace_id, options, cancel)
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    error!(
                        connection = %connection.id,
                        provider = %connection.provider,
                        "sync failed: {e}"
                    );
                    SyncResult::failure(connection.id, Some(connection.provider), e.to_string())
                }
            };
            summary.total_new_messages += u64::from(result.outcome.new_count);
            summary.results.push(result);
        }

        info!(
            workspace = %workspace_id,
            connections = summary.total_connections,
            new_messages = summary.total_new_messages,
            "workspace sync finished"
        );
        Ok(summary)
    }

    /// Process a webhook delivery for a connection.
    ///
    /// Payloads that carry the items themselves go straight into the
    /// ingestion pipeline; anything else triggers a regular sync with the
    /// default options.
    ///
    /// # Errors
    ///
    /// Returns an error only for failures of the database itself.
    pub async fn handle_push(
        &self,
        id: ConnectionId,
        payload: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<SyncResult> {
        let Some(connection) = self.db.connections().get(id).await? else {
            return Ok(SyncResult::failure(id, None, Error::ConnectionNotFound(id).to_string()));
        };
        let provider = connection.provider;

        let pushed = match self.adapters.get(provider).map(|a| a.push_items(payload)) {
            Some(Ok(Some(items))) => items,
            Some(Err(e)) => {
                warn!(connection = %id, provider = %provider, "ignoring malformed push: {e}");
                return Ok(SyncResult::failure(id, Some(provider), e.to_string()));
            }
            Some(Ok(None)) | None => {
                debug!(
                    connection = %id,
                    provider = %provider,
                    "push is a change notification, polling"
                );
                let options = self.default_options.clone();
                return self
                    .sync_channel_connection(id, &connection.workspace_id, &options, cancel)
                    .await;
            }
        };

        match self.admit_loaded(connection) {
            Admission::Rejected(result) => Ok(result),
            Admission::Ready(admitted) => {
                let outcome = self
                    .run(
                        admitted,
                        Source::Push(pushed),
                        self.default_options.auto_classify,
                        cancel,
                    )
                    .await?;
                Ok(SyncResult {
                    connection_id: id,
                    provider: Some(provider),
                    outcome,
                })
            }
        }
    }

    /// Load a connection and check it may be synced now.
    async fn admit(
        &self,
        id: ConnectionId,
        workspace_id: Option<&WorkspaceId>,
    ) -> Result<Admission> {
        let connection = self
            .db
            .connections()
            .get(id)
            .await?
            .filter(|c| workspace_id.is_none_or(|ws| c.workspace_id == *ws));

        match connection {
            Some(connection) => Ok(self.admit_loaded(connection)),
            None => Ok(Admission::Rejected(SyncResult::failure(
                id,
                None,
                Error::ConnectionNotFound(id).to_string(),
            ))),
        }
    }

    fn admit_loaded(&self, connection: ChannelConnection) -> Admission {
        let id = connection.id;
        let provider = connection.provider;
        let reject = |message: String| {
            debug!(connection = %id, provider = %provider, "sync rejected: {message}");
            Admission::Rejected(SyncResult::failure(id, Some(provider), message))
        };

        if !connection.is_active() {
            return reject(format!("connection is {}, not active", connection.status));
        }

        let Some(adapter) = self.adapters.get(provider) else {
            return reject(format!("{provider} sync is not supported yet"));
        };
        if adapter.kind() != provider {
            return reject(
                Error::ProviderMismatch {
                    connection: id,
                    expected: adapter.kind(),
                    actual: provider,
                }
                .to_string(),
            );
        }

        let Some(lease) = self.leases.try_acquire(id) else {
            return reject("sync already in progress".to_string());
        };

        Admission::Ready(Admitted {
            connection,
            adapter,
            _lease: lease,
        })
    }

    /// Run an admitted sync and report it on the progress channel.
    async fn run(
        &self,
        admitted: Admitted,
        source: Source<'_>,
        classify: bool,
        cancel: &CancellationToken,
    ) -> Result<ProviderSyncResult> {
        let Admitted {
            mut connection,
            adapter,
            _lease,
        } = admitted;
        let mut session = ProgressSession::start(&self.progress, &connection);
        info!(connection = %connection.id, provider = %connection.provider, "sync started");

        let outcome = match source {
            Source::Poll(options) => {
                self.poll(&mut connection, adapter.as_ref(), options, cancel, &mut session)
                    .await
            }
            Source::Push(items) => {
                let items = items.into_iter().map(Ok).collect();
                self.ingest(&connection, adapter.as_ref(), items, false, cancel, &mut session)
                    .await
            }
        };

        match outcome {
            Ok(result) => {
                if classify
                    && !result.new_message_ids.is_empty()
                    && let Some(dispatcher) = &self.classifier
                {
                    let queued = dispatcher
                        .dispatch_messages(&connection.workspace_id, &result.new_message_ids);
                    session.classifying(queued);
                }
                session.complete();
                info!(
                    connection = %connection.id,
                    provider = %connection.provider,
                    synced = result.synced_count,
                    new = result.new_count,
                    errors = result.error_count,
                    has_more = result.has_more,
                    "sync finished"
                );
                Ok(result)
            }
            Err(e) => {
                session.fail(e.to_string());
                warn!(
                    connection = %connection.id,
                    provider = %connection.provider,
                    "sync failed: {e}"
                );
                if matches!(e, Error::ProviderUnauthorized(_)) {
                    self.db
                        .connections()
                        .set_status(connection.id, ConnectionStatus::TokenExpired)
                        .await?;
                }
                if e.is_unexpected() {
                    Err(e)
                } else {
                    Ok(ProviderSyncResult::failure(e.to_string()))
                }
            }
        }
    }

    async fn poll(
        &self,
        connection: &mut ChannelConnection,
        adapter: &dyn ProviderAdapter,
        options: &SyncOptions,
        cancel: &CancellationToken,
        session: &mut ProgressSession<'_>,
    ) -> Result<ProviderSyncResult> {
        self.tokens.refresh_if_needed(connection).await?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        session.fetching();
        let connection = &*connection;
        let page = adapter
            .fetch_page(FetchRequest {
                connection,
                access_token: &connection.access_token,
                cursor: connection.sync_cursor.as_ref(),
                max_messages: options.max_messages.max(1),
                filter: options.filter.as_deref(),
                cancel,
            })
            .await?;

        self.ingest(connection, adapter, page.items, page.has_more, cancel, session)
            .await
    }

    /// Store a page in provider order, then advance the cursor.
    ///
    /// The cursor moves to the furthest position seen, including items that
    /// were filtered out or failed, and only once the whole page is done.
    async fn ingest(
        &self,
        connection: &ChannelConnection,
        adapter: &dyn ProviderAdapter,
        items: Vec<Result<RawItem>>,
        has_more: bool,
        cancel: &CancellationToken,
        session: &mut ProgressSession<'_>,
    ) -> Result<ProviderSyncResult> {
        let mut result = ProviderSyncResult {
            success: true,
            has_more,
            ..ProviderSyncResult::default()
        };
        let mut high_water = connection.sync_cursor.clone();
        session.syncing(items.len());

        for item in items {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    result.error_count += 1;
                    debug!(connection = %connection.id, "item failed: {e}");
                    session.processed(None);
                    continue;
                }
            };

            if let Some(cursor) = &connection.sync_cursor
                && !item.position.is_after(cursor)
            {
                debug!(
                    connection = %connection.id,
                    position = %item.position,
                    "skipping item at or before cursor"
                );
                session.processed(None);
                continue;
            }
            high_water = Some(SyncCursor::latest(high_water, item.position.clone()));

            match self.ingest_item(connection, adapter, &item).await {
                Ok(ItemOutcome::Filtered) => session.processed(None),
                Ok(ItemOutcome::Stored {
                    outcome,
                    summary,
                    contact_failed,
                }) => {
                    result.synced_count += 1;
                    if !outcome.is_duplicate {
                        result.new_count += 1;
                        result.new_message_ids.push(outcome.id);
                    }
                    if contact_failed {
                        result.error_count += 1;
                    }
                    session.processed(Some(summary));
                }
                Err(e) => {
                    result.error_count += 1;
                    warn!(
                        connection = %connection.id,
                        position = %item.position,
                        "item failed: {e}"
                    );
                    session.processed(None);
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.db
            .connections()
            .record_sync(connection.id, high_water.as_ref(), Utc::now())
            .await?;

        Ok(result)
    }

    async fn ingest_item(
        &self,
        connection: &ChannelConnection,
        adapter: &dyn ProviderAdapter,
        item: &RawItem,
    ) -> Result<ItemOutcome> {
        let Some(message) = adapter.parse_item(connection, item)? else {
            return Ok(ItemOutcome::Filtered);
        };

        let outcome = self.db.messages().upsert(&message).await?;
        let contact_failed = if outcome.is_duplicate {
            false
        } else if let Err(e) = self.link_contact(connection, &message, outcome.id).await {
            warn!(
                connection = %connection.id,
                message = %outcome.id,
                "contact resolution failed: {e}"
            );
            true
        } else {
            false
        };

        Ok(ItemOutcome::Stored {
            outcome,
            summary: message.summary(),
            contact_failed,
        })
    }

    async fn link_contact(
        &self,
        connection: &ChannelConnection,
        message: &NewMessage,
        id: MessageId,
    ) -> Result<()> {
        let identity = NewContact::from_message(message, &connection.user_id, connection.provider);
        let contact_id = self.db.contacts().find_or_create(&identity).await?;
        self.db.messages().link_contact(id, contact_id).await
    }
}

/// Progress events of one connection sync.
struct ProgressSession<'a> {
    broadcaster: &'a ProgressBroadcaster,
    workspace_id: WorkspaceId,
    snapshot: SyncProgress,
}

impl<'a> ProgressSession<'a> {
    fn start(broadcaster: &'a ProgressBroadcaster, connection: &ChannelConnection) -> Self {
        let mut session = Self {
            broadcaster,
            workspace_id: connection.workspace_id.clone(),
            snapshot: SyncProgress::new(connection.provider, connection.display_name()),
        };
        session.emit();
        session
    }

    fn emit(&mut self) {
        self.snapshot.timestamp = Utc::now();
        self.broadcaster.publish(&self.workspace_id, self.snapshot.clone());
    }

    fn fetching(&mut self) {
        self.snapshot.phase = SyncPhase::Fetching;
        self.emit();
    }

    /// Items follow; nothing is published until the first one is processed.
    fn syncing(&mut self, total: usize) {
        self.snapshot.phase = SyncPhase::Syncing;
        self.snapshot.total_messages = u32::try_from(total).unwrap_or(u32::MAX);
        self.snapshot.synced_messages = 0;
    }

    fn processed(&mut self, current: Option<String>) {
        self.snapshot.synced_messages = self.snapshot.synced_messages.saturating_add(1);
        self.snapshot.current_message = current;
        self.emit();
    }

    fn classifying(&mut self, queued: usize) {
        self.snapshot.phase = SyncPhase::Classifying;
        self.snapshot.classified_messages = u32::try_from(queued).unwrap_or(u32::MAX);
        self.snapshot.current_message = None;
        self.emit();
    }

    fn complete(mut self) {
        self.snapshot.phase = SyncPhase::Complete;
        self.snapshot.current_message = None;
        self.emit();
    }

    fn fail(mut self, error: String) {
        self.snapshot.phase = SyncPhase::Error;
        self.snapshot.current_message = None;
        self.snapshot.error = Some(error);
        self.emit();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::{Value, json};

    use super::*;
    use crate::classify::{ClassifierError, Classifier, DispatcherConfig};
    use crate::connection::{NewConnection, ProviderKind};
    use crate::progress::ProgressEvent;
    use crate::provider::FetchedPage;

    /// Telegram-shaped adapter serving a fixed list of items.
    ///
    /// Items are `{"id": n}` plus optional `"email"`, `"skip"` (filtered) and
    /// `"bad"` (unparseable). `"broken"` items fail at fetch time.
    struct Scripted {
        items: Vec<Value>,
        failure: Mutex<Option<Error>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(items: Vec<Value>) -> Arc<Self> {
            Arc::new(Self {
                items,
                failure: Mutex::new(None),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(error: Error) -> Arc<Self> {
            let adapter = Self::new(Vec::new());
            *adapter.failure.lock().unwrap() = Some(error);
            adapter
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn position(payload: &Value) -> Result<SyncCursor> {
        payload["id"]
            .as_i64()
            .map(|update_id| SyncCursor::Telegram { update_id })
            .ok_or_else(|| Error::ProviderItem("no id".to_string()))
    }

    #[async_trait]
    impl ProviderAdapter for Scripted {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Telegram
        }

        async fn fetch_page(&self, request: FetchRequest<'_>) -> Result<FetchedPage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = self.failure.lock().unwrap().take() {
                return Err(e);
            }
            let items = self
                .items
                .iter()
                .map(|payload| -> Result<RawItem> {
                    if payload.get("broken").is_some() {
                        return Err(Error::ProviderItem("fetch failed".to_string()));
                    }
                    Ok(RawItem {
                        position: position(payload)?,
                        payload: payload.clone(),
                    })
                })
                .collect();
            Ok(FetchedPage {
                items,
                has_more: request.max_messages < 3,
            })
        }

        fn parse_item(
            &self,
            connection: &ChannelConnection,
            item: &RawItem,
        ) -> Result<Option<NewMessage>> {
            let payload = &item.payload;
            if payload.get("bad").is_some() {
                return Err(Error::ProviderItem("malformed".to_string()));
            }
            if payload.get("skip").is_some() {
                return Ok(None);
            }
            let id = payload["id"].to_string();
            let mut message =
                NewMessage::new(connection, id, Utc.timestamp_opt(1_700_000_000, 0).unwrap());
            message.sender_email = payload["email"].as_str().map(str::to_string);
            message.sender_name = Some("Sender".to_string());
            Ok(Some(message))
        }

        fn push_items(&self, payload: &Value) -> Result<Option<Vec<RawItem>>> {
            Ok(Some(vec![RawItem {
                position: position(payload)?,
                payload: payload.clone(),
            }]))
        }
    }

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<MessageId>>,
    }

    #[async_trait]
    impl Classifier for Recording {
        async fn classify(
            &self,
            message_id: MessageId,
            _workspace_id: &WorkspaceId,
        ) -> std::result::Result<(), ClassifierError> {
            self.seen.lock().unwrap().push(message_id);
            Ok(())
        }
    }

    async fn engine_with(adapter: Arc<Scripted>) -> (SyncEngine, ChannelConnection) {
        let db = Database::in_memory().await.unwrap();
        let connection = db
            .connections()
            .create(&NewConnection::new(
                "ws",
                "user-1",
                ProviderKind::Telegram,
                "support_bot",
                "123:abc",
            ))
            .await
            .unwrap();
        let engine = SyncEngine::new(
            db.clone(),
            TokenManager::new(db.connections()),
            AdapterRegistry::new().with(adapter),
            ProgressBroadcaster::default(),
        );
        (engine, connection)
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<ProgressEvent>) -> Vec<SyncProgress> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event.payload);
        }
        events
    }

    fn ws() -> WorkspaceId {
        WorkspaceId::new("ws")
    }

    #[tokio::test]
    async fn test_counts_and_cursor() {
        let adapter = Scripted::new(vec![
            json!({ "id": 10, "email": "a@example.com" }),
            json!({ "id": 11, "skip": true }),
            json!({ "id": 14, "bad": true }),
            json!({ "broken": true }),
            json!({ "id": 12, "email": "b@example.com" }),
        ]);
        let (engine, conn) = engine_with(adapter).await;

        let result = engine
            .sync_provider_messages(
                conn.id,
                &ws(),
                &SyncOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.synced_count, 2);
        assert_eq!(result.new_count, 2);
        assert_eq!(result.error_count, 2);
        assert_eq!(result.new_message_ids.len(), 2);

        let stored = engine.database().connections().get(conn.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_cursor, Some(SyncCursor::Telegram { update_id: 14 }));
        assert!(stored.last_sync_at.is_some());
        assert_eq!(
            engine.database().messages().count_for_connection(conn.id).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_items_at_or_before_cursor_are_skipped() {
        let adapter = Scripted::new(vec![json!({ "id": 1 }), json!({ "id": 2 })]);
        let (engine, conn) = engine_with(adapter).await;
        let cancel = CancellationToken::new();

        let first = engine
            .sync_provider_messages(conn.id, &ws(), &SyncOptions::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(first.new_count, 2);

        let second = engine
            .sync_provider_messages(conn.id, &ws(), &SyncOptions::default(), &cancel)
            .await
            .unwrap();
        assert!(second.success);
        assert_eq!(second.synced_count, 0);
        assert_eq!(second.new_count, 0);
    }

    #[tokio::test]
    async fn test_inactive_connection_never_reaches_provider() {
        let adapter = Scripted::new(vec![json!({ "id": 1 })]);
        let (engine, conn) = engine_with(adapter.clone()).await;

        for status in [
            ConnectionStatus::Inactive,
            ConnectionStatus::Error,
            ConnectionStatus::TokenExpired,
            ConnectionStatus::Revoked,
        ] {
            engine.database().connections().set_status(conn.id, status).await.unwrap();
            let result = engine
                .sync_channel_connection(
                    conn.id,
                    &ws(),
                    &SyncOptions::default(),
                    &CancellationToken::new(),
                )
                .await
                .unwrap();
            assert!(!result.success());
            assert_eq!(result.provider, Some(ProviderKind::Telegram));
        }
        assert_eq!(adapter.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_and_foreign_connections_are_not_found() {
        let (engine, conn) = engine_with(Scripted::new(Vec::new())).await;
        let cancel = CancellationToken::new();

        let missing = engine
            .sync_channel_connection(
                ConnectionId::new(999),
                &ws(),
                &SyncOptions::default(),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(
            missing.outcome.message.as_deref(),
            Some("Channel connection not found: 999")
        );

        let foreign = engine
            .sync_channel_connection(
                conn.id,
                &WorkspaceId::new("other"),
                &SyncOptions::default(),
                &cancel,
            )
            .await
            .unwrap();
        assert!(!foreign.success());
        assert!(foreign.provider.is_none());
    }

    #[tokio::test]
    async fn test_unsupported_provider() {
        let (engine, _) = engine_with(Scripted::new(Vec::new())).await;
        let teams = engine
            .database()
            .connections()
            .create(&NewConnection::new("ws", "u", ProviderKind::Teams, "acct", "at"))
            .await
            .unwrap();

        let result = engine
            .sync_channel_connection(
                teams.id,
                &ws(),
                &SyncOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!result.success());
        assert_eq!(
            result.outcome.message.as_deref(),
            Some("teams sync is not supported yet")
        );
    }

    #[tokio::test]
    async fn test_concurrent_sync_is_rejected() {
        let adapter = Scripted::new(vec![json!({ "id": 1 })]);
        let (engine, conn) = engine_with(adapter.clone()).await;

        let _held = engine.leases.try_acquire(conn.id).unwrap();
        assert!(engine.is_syncing(conn.id));
        let result = engine
            .sync_channel_connection(
                conn.id,
                &ws(),
                &SyncOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.outcome.message.as_deref(), Some("sync already in progress"));
        assert_eq!(adapter.calls(), 0);
    }

    #[tokio::test]
    async fn test_lease_released_after_sync() {
        let (engine, conn) = engine_with(Scripted::new(vec![json!({ "id": 1 })])).await;
        engine
            .sync_channel_connection(
                conn.id,
                &ws(),
                &SyncOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!engine.is_syncing(conn.id));
    }

    #[tokio::test]
    async fn test_unauthorized_demotes_connection() {
        let adapter = Scripted::failing(Error::ProviderUnauthorized("401".to_string()));
        let (engine, conn) = engine_with(adapter).await;
        let mut rx = engine.progress().subscribe(&ws());

        let result = engine
            .sync_channel_connection(
                conn.id,
                &ws(),
                &SyncOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!result.success());
        let stored = engine.database().connections().get(conn.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ConnectionStatus::TokenExpired);

        let events = drain(&mut rx);
        let last = events.last().unwrap();
        assert_eq!(last.phase, SyncPhase::Error);
        assert!(last.error.as_deref().unwrap().contains("401"));
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_status() {
        let adapter = Scripted::failing(Error::ProviderFetch("HTTP 503".to_string()));
        let (engine, conn) = engine_with(adapter).await;

        let result = engine
            .sync_channel_connection(
                conn.id,
                &ws(),
                &SyncOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!result.success());
        let stored = engine.database().connections().get(conn.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ConnectionStatus::Active);
    }

    #[tokio::test]
    async fn test_cancelled_sync_leaves_cursor() {
        let (engine, conn) = engine_with(Scripted::new(vec![json!({ "id": 5 })])).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = engine
            .sync_channel_connection(conn.id, &ws(), &SyncOptions::default(), &cancel)
            .await
            .unwrap();

        assert_eq!(result.outcome.message.as_deref(), Some("Sync cancelled"));
        let stored = engine.database().connections().get(conn.id).await.unwrap().unwrap();
        assert!(stored.sync_cursor.is_none());
        assert!(stored.last_sync_at.is_none());
    }

    #[tokio::test]
    async fn test_progress_session_shape() {
        let adapter = Scripted::new(vec![
            json!({ "id": 1 }),
            json!({ "id": 2 }),
            json!({ "id": 3 }),
        ]);
        let (engine, conn) = engine_with(adapter).await;
        let classifier = Arc::new(Recording::default());
        let (dispatcher, _worker) = ClassificationDispatcher::spawn(
            classifier.clone(),
            engine.database().messages(),
            DispatcherConfig::default(),
            CancellationToken::new(),
        );
        let engine = engine.with_classifier(dispatcher);
        let mut rx = engine.progress().subscribe(&ws());

        engine
            .sync_channel_connection(
                conn.id,
                &ws(),
                &SyncOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let events = drain(&mut rx);
        let phases: Vec<_> = events.iter().map(|e| e.phase).collect();
        assert_eq!(
            phases,
            vec![
                SyncPhase::Connecting,
                SyncPhase::Fetching,
                SyncPhase::Syncing,
                SyncPhase::Syncing,
                SyncPhase::Syncing,
                SyncPhase::Classifying,
                SyncPhase::Complete,
            ]
        );
        let mut last = 0.0;
        for event in &events {
            assert!(event.percent() >= last);
            last = event.percent();
        }
        assert_eq!(events[5].classified_messages, 3);
        assert_eq!(events[0].connection_name, "support_bot");

        for _ in 0..100 {
            if classifier.seen.lock().unwrap().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(classifier.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_auto_classify_off_skips_classifier() {
        let (engine, conn) = engine_with(Scripted::new(vec![json!({ "id": 1 })])).await;
        let (dispatcher, _worker) = ClassificationDispatcher::spawn(
            Arc::new(Recording::default()),
            engine.database().messages(),
            DispatcherConfig::default(),
            CancellationToken::new(),
        );
        let engine = engine.with_classifier(dispatcher);
        let options = SyncOptions {
            auto_classify: false,
            ..SyncOptions::default()
        };

        let result = engine
            .sync_channel_connection(conn.id, &ws(), &options, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.outcome.new_count, 1);
        assert_eq!(engine.classifier().unwrap().stats().queued, 0);
    }

    #[tokio::test]
    async fn test_contacts_linked_for_new_messages() {
        let adapter = Scripted::new(vec![
            json!({ "id": 1, "email": "Dana@Example.com" }),
            json!({ "id": 2, "email": "dana@example.com" }),
        ]);
        let (engine, conn) = engine_with(adapter).await;
        engine
            .sync_channel_connection(
                conn.id,
                &ws(),
                &SyncOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let contacts = engine.database().contacts().list(&ws(), 10).await.unwrap();
        assert_eq!(contacts.len(), 1);
        let first = engine.database().messages().get(MessageId::new(1)).await.unwrap().unwrap();
        let second = engine.database().messages().get(MessageId::new(2)).await.unwrap().unwrap();
        assert_eq!(first.contact_id, Some(contacts[0].id));
        assert_eq!(second.contact_id, Some(contacts[0].id));
    }

    #[tokio::test]
    async fn test_push_ingests_payload_and_replay_is_noop() {
        let adapter = Scripted::new(Vec::new());
        let (engine, conn) = engine_with(adapter.clone()).await;
        let cancel = CancellationToken::new();
        let payload = json!({ "id": 7, "email": "p@example.com" });

        let first = engine.handle_push(conn.id, &payload, &cancel).await.unwrap();
        assert!(first.success());
        assert_eq!(first.outcome.new_count, 1);

        let replay = engine.handle_push(conn.id, &payload, &cancel).await.unwrap();
        assert!(replay.success());
        assert_eq!(replay.outcome.new_count, 0);

        assert_eq!(adapter.calls(), 0);
        let stored = engine.database().connections().get(conn.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_cursor, Some(SyncCursor::Telegram { update_id: 7 }));
    }

    #[tokio::test]
    async fn test_workspace_sync_isolates_failures() {
        let (engine, good) = engine_with(Scripted::new(vec![json!({ "id": 1 })])).await;
        let teams = engine
            .database()
            .connections()
            .create(&NewConnection::new("ws", "u", ProviderKind::Teams, "acct", "at"))
            .await
            .unwrap();
        engine
            .database()
            .connections()
            .create(&NewConnection::new("other", "u", ProviderKind::Telegram, "x", "t"))
            .await
            .unwrap();

        let summary = engine
            .sync_all_workspace_connections(
                &ws(),
                &SyncOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.total_connections, 2);
        assert_eq!(summary.total_new_messages, 1);
        let by_id = |id| summary.results.iter().find(|r| r.connection_id == id).unwrap();
        assert!(by_id(good.id).success());
        assert!(!by_id(teams.id).success());
    }
}
