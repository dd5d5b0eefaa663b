//! HTTP API, webhook receivers and the progress stream.

use std::collections::{BTreeSet, HashMap};
use std::convert::Infallible;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use courier_core::progress::PROGRESS_EVENT;
use courier_core::{ConnectionId, ProviderKind, SyncEngine, SyncOptions, WorkspaceId};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    engine: SyncEngine,
    shutdown: CancellationToken,
}

impl AppState {
    /// State for a running engine. Cancelling `shutdown` aborts in-flight
    /// syncs and ends progress streams.
    #[must_use]
    pub const fn new(engine: SyncEngine, shutdown: CancellationToken) -> Self {
        Self { engine, shutdown }
    }
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/workspaces/{workspace}/sync", post(sync_workspace))
        .route(
            "/api/workspaces/{workspace}/connections/{id}/sync",
            post(sync_connection),
        )
        .route(
            "/api/workspaces/{workspace}/connections/{id}",
            delete(disconnect),
        )
        .route(
            "/api/workspaces/{workspace}/sync-progress",
            get(progress_stream),
        )
        .route("/webhooks/telegram/{id}", post(telegram_webhook))
        .route("/webhooks/outlook", post(outlook_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Body of a sync request. Missing fields fall back to the configured
/// defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequest {
    max_messages: Option<u32>,
    auto_classify: Option<bool>,
    filter: Option<String>,
}

impl SyncRequest {
    /// An empty body means all defaults.
    fn parse(body: &[u8]) -> serde_json::Result<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body)
    }

    fn over(self, defaults: &SyncOptions) -> SyncOptions {
        SyncOptions {
            max_messages: self.max_messages.unwrap_or(defaults.max_messages),
            auto_classify: self.auto_classify.unwrap_or(defaults.auto_classify),
            filter: self.filter.or_else(|| defaults.filter.clone()),
        }
    }
}

fn failure(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": error.into() })),
    )
        .into_response()
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn sync_connection(
    State(state): State<AppState>,
    Path((workspace, id)): Path<(String, i64)>,
    body: Bytes,
) -> Response {
    let options = match SyncRequest::parse(&body) {
        Ok(request) => request.over(state.engine.default_options()),
        Err(e) => {
            return failure(StatusCode::BAD_REQUEST, format!("invalid sync request: {e}"));
        }
    };
    let cancel = state.shutdown.child_token();

    match state
        .engine
        .sync_channel_connection(
            ConnectionId::new(id),
            &WorkspaceId::new(workspace),
            &options,
            &cancel,
        )
        .await
    {
        Ok(result) => Json(result).into_response(),
        Err(e) => {
            error!(connection = id, "sync request failed: {e}");
            failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn sync_workspace(
    State(state): State<AppState>,
    Path(workspace): Path<String>,
    body: Bytes,
) -> Response {
    let options = match SyncRequest::parse(&body) {
        Ok(request) => request.over(state.engine.default_options()),
        Err(e) => {
            return failure(StatusCode::BAD_REQUEST, format!("invalid sync request: {e}"));
        }
    };
    let cancel = state.shutdown.child_token();

    match state
        .engine
        .sync_all_workspace_connections(&WorkspaceId::new(workspace.clone()), &options, &cancel)
        .await
    {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => {
            error!(workspace = %workspace, "workspace sync request failed: {e}");
            failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn disconnect(
    State(state): State<AppState>,
    Path((workspace, id)): Path<(String, i64)>,
) -> Response {
    let id = ConnectionId::new(id);
    match state
        .engine
        .database()
        .connections()
        .revoke(id, &WorkspaceId::new(workspace))
        .await
    {
        Ok(true) => {
            info!(connection = %id, "connection revoked");
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => failure(
            StatusCode::NOT_FOUND,
            format!("Channel connection not found: {id}"),
        ),
        Err(e) => {
            error!(connection = %id, "revoke failed: {e}");
            failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn progress_stream(
    State(state): State<AppState>,
    Path(workspace): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let workspace = WorkspaceId::new(workspace);
    let receiver = state.engine.progress().subscribe(&workspace);
    debug!(workspace = %workspace, "progress subscriber connected");

    let events = futures::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let data = serde_json::to_string(&event.payload).unwrap_or_default();
                    let sse = Event::default().event(PROGRESS_EVENT).data(data);
                    return Some((Ok(sse), receiver));
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "progress subscriber lagging");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    let shutdown = state.shutdown.clone();
    Sse::new(events.take_until(async move { shutdown.cancelled().await }))
        .keep_alive(KeepAlive::default())
}

/// Run a push sync in the background; the provider only gets an ack.
fn spawn_push(state: &AppState, id: ConnectionId, payload: Value) {
    let engine = state.engine.clone();
    let cancel = state.shutdown.child_token();
    tokio::spawn(async move {
        match engine.handle_push(id, &payload, &cancel).await {
            Ok(result) if result.success() => debug!(
                connection = %id,
                new = result.outcome.new_count,
                "push processed"
            ),
            Ok(result) => warn!(
                connection = %id,
                reason = result.outcome.message.as_deref().unwrap_or_default(),
                "push not processed"
            ),
            Err(e) => error!(connection = %id, "push failed: {e}"),
        }
    });
}

/// Header carrying the `secret_token` registered with `setWebhook`.
const TELEGRAM_SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Telegram update push. Deliveries must carry the connection's secret;
/// accepted ones are acknowledged whatever the sync outcome.
async fn telegram_webhook(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let id = ConnectionId::new(id);
    let secret = headers
        .get(TELEGRAM_SECRET_HEADER)
        .and_then(|value| value.to_str().ok());

    match state.engine.database().connections().get(id).await {
        Ok(Some(connection))
            if connection.provider == ProviderKind::Telegram
                && connection.accepts_webhook_secret(secret) => {}
        Ok(_) => {
            warn!(connection = %id, "rejecting telegram update without a valid secret token");
            return StatusCode::UNAUTHORIZED;
        }
        Err(e) => {
            error!(connection = %id, "cannot load connection for telegram update: {e}");
            return StatusCode::OK;
        }
    }

    match serde_json::from_slice::<Value>(&body) {
        Ok(payload) => spawn_push(&state, id, payload),
        Err(e) => warn!(connection = %id, "ignoring unreadable telegram update: {e}"),
    }
    StatusCode::OK
}

/// Graph change notifications. Subscription validation echoes the token;
/// every notification carries its subscription's `clientState` secret,
/// which identifies the connection.
async fn outlook_webhook(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    if let Some(token) = params.get("validationToken") {
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            token.clone(),
        )
            .into_response();
    }

    let notifications = match serde_json::from_slice::<Value>(&body) {
        Ok(body) => body
            .get("value")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        Err(e) => {
            warn!("ignoring unreadable outlook notification: {e}");
            Vec::new()
        }
    };

    let connections = state.engine.database().connections();
    let mut seen = BTreeSet::new();
    for notification in notifications {
        let Some(secret) = notification.get("clientState").and_then(Value::as_str) else {
            warn!("ignoring outlook notification without clientState");
            continue;
        };
        match connections
            .find_by_webhook_secret(ProviderKind::Outlook, secret)
            .await
        {
            Ok(Some(connection)) => {
                if seen.insert(connection.id) {
                    spawn_push(&state, connection.id, notification);
                }
            }
            Ok(None) => warn!("ignoring outlook notification with an unknown clientState"),
            Err(e) => error!("cannot resolve outlook notification: {e}"),
        }
    }

    StatusCode::ACCEPTED.into_response()
}
