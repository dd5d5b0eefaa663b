//! `Courier` - multi-channel message sync service
//!
//! Pulls messages from Gmail, Outlook, Telegram and Slack into one store per
//! workspace, exposes an HTTP API and webhook receivers, streams sync progress
//! and runs the periodic scheduler.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod config;
mod scheduler;
mod server;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use courier_core::{
    AdapterRegistry, ClassificationDispatcher, Database, DispatcherConfig, HttpClassifier,
    ProgressBroadcaster, ProviderKind, SyncEngine, TokenManager,
};
use courier_oauth::{OAuthClient, Provider};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{CourierConfig, OAuthClientConfig};

type ProviderConfig = fn() -> courier_oauth::Result<Provider>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=info,courier_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::load()?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting Courier");

    let shutdown = CancellationToken::new();
    let http = reqwest::Client::new();
    let (engine, classifier_worker) = build_engine(&config, &http, &shutdown).await?;

    let scheduler = (config.sync.interval_secs > 0).then(|| {
        scheduler::spawn(
            engine.clone(),
            Duration::from_secs(config.sync.interval_secs),
            shutdown.clone(),
        )
    });

    let address = config.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {address}"))?;
    info!(address = %address, "listening");

    let app = server::router(server::AppState::new(engine, shutdown.clone()));
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("cannot listen for shutdown signal: {e}");
                return;
            }
            info!("shutting down");
            signal.cancel();
        })
        .await
        .context("HTTP server failed")?;

    shutdown.cancel();
    for task in [scheduler, classifier_worker].into_iter().flatten() {
        if let Err(e) = task.await {
            warn!("background task ended abnormally: {e}");
        }
    }

    info!("Courier stopped");
    Ok(())
}

/// Open the database and wire the engine from configuration.
async fn build_engine(
    config: &CourierConfig,
    http: &reqwest::Client,
    shutdown: &CancellationToken,
) -> anyhow::Result<(SyncEngine, Option<JoinHandle<()>>)> {
    let path = config.database.resolved_path();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let db = Database::connect(&path.to_string_lossy())
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    info!(path = %path.display(), "database ready");

    let tokens = token_manager(config, &db, http)?;
    let adapters = AdapterRegistry::with_defaults(http);
    info!(providers = ?adapters.providers(), "provider adapters registered");

    let mut engine = SyncEngine::new(db.clone(), tokens, adapters, ProgressBroadcaster::default())
        .with_default_options(config.sync.options());

    let mut worker = None;
    if let Some(endpoint) = &config.classifier.endpoint {
        let classifier = HttpClassifier::new(http.clone(), endpoint.clone())
            .with_timeout(Duration::from_secs(config.classifier.timeout_secs));
        let (dispatcher, handle) = ClassificationDispatcher::spawn(
            Arc::new(classifier),
            db.messages(),
            DispatcherConfig {
                queue_capacity: config.classifier.queue_capacity,
                concurrency: config.classifier.concurrency,
            },
            shutdown.clone(),
        );
        engine = engine.with_classifier(dispatcher);
        worker = Some(handle);
        info!(endpoint = %endpoint, "classification enabled");
    } else {
        info!("no classifier endpoint configured, classification disabled");
    }

    Ok((engine, worker))
}

/// Register one refresh client per configured token endpoint.
fn token_manager(
    config: &CourierConfig,
    db: &Database,
    http: &reqwest::Client,
) -> anyhow::Result<TokenManager> {
    let mut tokens = TokenManager::new(db.connections()).with_refresh_window(
        chrono::Duration::seconds(config.sync.token_refresh_window_secs),
    );

    let sections: [(Option<&OAuthClientConfig>, ProviderConfig, &[ProviderKind]); 3] = [
        (config.oauth.google.as_ref(), Provider::google, &[ProviderKind::Gmail]),
        (
            config.oauth.microsoft.as_ref(),
            Provider::microsoft,
            &[ProviderKind::Outlook, ProviderKind::Teams],
        ),
        (config.oauth.slack.as_ref(), Provider::slack, &[ProviderKind::Slack]),
    ];

    for (section, provider, kinds) in sections {
        let Some(section) = section else { continue };
        let provider = provider().context("building OAuth provider")?;
        info!(provider = %provider.name, kinds = ?kinds, "token refresh enabled");
        let mut client =
            OAuthClient::new(section.client_id.clone(), provider).with_http_client(http.clone());
        if let Some(secret) = &section.client_secret {
            client = client.with_client_secret(secret.clone());
        }
        for &kind in kinds {
            tokens = tokens.with_client(kind, client.clone());
        }
    }

    Ok(tokens)
}
