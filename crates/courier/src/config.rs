//! Layered service configuration.
//!
//! Merge order (later overrides earlier):
//! 1. Compiled defaults
//! 2. `/etc/courier/courier.toml`
//! 3. `<config dir>/courier/courier.toml`
//! 4. `./courier.toml`
//! 5. `COURIER_*` environment variables, `__` between sections
//!    (`COURIER_SYNC__INTERVAL_SECS=60`)

use std::path::PathBuf;

use anyhow::{Context, ensure};
use courier_core::SyncOptions;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

/// Service configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    /// HTTP listener.
    pub server: ServerConfig,
    /// Sync database.
    pub database: DatabaseConfig,
    /// Sync defaults and scheduler.
    pub sync: SyncConfig,
    /// External classifier.
    pub classifier: ClassifierConfig,
    /// `OAuth` clients used to refresh tokens.
    pub oauth: OAuthConfig,
}

/// HTTP listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    /// `host:port`.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Sync database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file. Defaults to `<data dir>/courier/courier.db`.
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    /// Configured path or the per-user default.
    #[must_use]
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("courier")
                .join("courier.db")
        })
    }
}

/// Sync defaults and scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between scheduled syncs; 0 disables the scheduler.
    pub interval_secs: u64,
    /// Page size for scheduled and pushed syncs.
    pub max_messages: u32,
    /// Classify new messages after scheduled and pushed syncs.
    pub auto_classify: bool,
    /// Refresh tokens expiring within this many seconds.
    pub token_refresh_window_secs: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            max_messages: 50,
            auto_classify: true,
            token_refresh_window_secs: 300,
        }
    }
}

impl SyncConfig {
    /// Engine defaults derived from this section.
    #[must_use]
    pub fn options(&self) -> SyncOptions {
        SyncOptions {
            max_messages: self.max_messages,
            auto_classify: self.auto_classify,
            filter: None,
        }
    }
}

/// External classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Endpoint receiving `{"messageId", "workspaceId"}`. Absent disables
    /// classification.
    pub endpoint: Option<String>,
    /// Jobs buffered before new ones are dropped.
    pub queue_capacity: usize,
    /// Concurrent classifier calls.
    pub concurrency: usize,
    /// Per-call timeout.
    pub timeout_secs: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            queue_capacity: 256,
            concurrency: 4,
            timeout_secs: 30,
        }
    }
}

/// `OAuth` clients, one per token endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Gmail.
    pub google: Option<OAuthClientConfig>,
    /// Outlook and Teams.
    pub microsoft: Option<OAuthClientConfig>,
    /// Slack.
    pub slack: Option<OAuthClientConfig>,
}

/// Registered application credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthClientConfig {
    /// Client id.
    pub client_id: String,
    /// Client secret, for confidential clients.
    #[serde(default)]
    pub client_secret: Option<String>,
}

impl CourierConfig {
    /// Check values that deserialize fine but cannot work.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.server.port != 0, "server.port must not be 0");
        ensure!(
            self.classifier.concurrency >= 1,
            "classifier.concurrency must be at least 1"
        );
        ensure!(
            self.classifier.queue_capacity >= 1,
            "classifier.queue_capacity must be at least 1"
        );
        ensure!(self.sync.max_messages >= 1, "sync.max_messages must be at least 1");
        ensure!(
            self.sync.token_refresh_window_secs >= 0,
            "sync.token_refresh_window_secs must not be negative"
        );
        for (name, client) in [
            ("google", &self.oauth.google),
            ("microsoft", &self.oauth.microsoft),
            ("slack", &self.oauth.slack),
        ] {
            if let Some(client) = client {
                ensure!(
                    !client.client_id.trim().is_empty(),
                    "oauth.{name}.client_id must not be empty"
                );
            }
        }
        Ok(())
    }
}

fn defaults() -> Figment {
    Figment::new().merge(Serialized::defaults(CourierConfig::default()))
}

fn extract(figment: &Figment) -> anyhow::Result<CourierConfig> {
    let config: CourierConfig = figment.extract().context("invalid configuration")?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from the standard locations and the environment.
///
/// # Errors
///
/// Returns an error if a source cannot be parsed or a value is invalid.
pub fn load() -> anyhow::Result<CourierConfig> {
    let figment = defaults()
        .merge(Toml::file("/etc/courier/courier.toml"))
        .merge(Toml::file(
            dirs::config_dir()
                .map(|d| d.join("courier").join("courier.toml"))
                .unwrap_or_default(),
        ))
        .merge(Toml::file("courier.toml"))
        .merge(Env::prefixed("COURIER_").split("__"));
    extract(&figment)
}

/// Load configuration from a TOML string over the defaults.
///
/// # Errors
///
/// Returns an error if the string cannot be parsed or a value is invalid.
#[cfg(test)]
pub fn from_toml(toml: &str) -> anyhow::Result<CourierConfig> {
    extract(&defaults().merge(Toml::string(toml)))
}
