//! `OAuth2` provider configurations.

use crate::error::{Error, Result};
use url::Url;

/// `OAuth2` provider configuration.
#[derive(Debug, Clone)]
pub struct Provider {
    /// Provider name (e.g., "Google").
    pub name: String,
    /// Token endpoint URL.
    pub token_url: Url,
    /// Default scopes.
    pub default_scopes: Vec<String>,
}

impl Provider {
    /// Creates a new provider configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn new(name: impl Into<String>, token_url: impl AsRef<str>) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            token_url: Url::parse(token_url.as_ref())?,
            default_scopes: Vec::new(),
        })
    }

    /// Sets the default scopes.
    #[must_use]
    pub fn with_default_scopes(mut self, scopes: Vec<String>) -> Self {
        self.default_scopes = scopes;
        self
    }

    /// Overrides the token endpoint, e.g. to point at a local mock server.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn with_token_url(mut self, token_url: impl AsRef<str>) -> Result<Self> {
        self.token_url = Url::parse(token_url.as_ref())?;
        Ok(self)
    }

    /// Google `OAuth2` provider configuration.
    ///
    /// Scopes:
    /// - `https://www.googleapis.com/auth/gmail.readonly` - read Gmail messages
    ///
    /// # Errors
    ///
    /// Returns an error if URL parsing fails.
    pub fn google() -> Result<Self> {
        Ok(Self::new("Google", "https://oauth2.googleapis.com/token")?
            .with_default_scopes(vec![
                "https://www.googleapis.com/auth/gmail.readonly".to_string(),
            ]))
    }

    /// Microsoft identity platform configuration (Outlook, Teams).
    ///
    /// Scopes:
    /// - `https://graph.microsoft.com/Mail.Read` - read mailbox via Graph
    /// - `offline_access` - Refresh token
    ///
    /// # Errors
    ///
    /// Returns an error if URL parsing fails.
    pub fn microsoft() -> Result<Self> {
        Ok(Self::new(
            "Microsoft",
            "https://login.microsoftonline.com/common/oauth2/v2.0/token",
        )?
        .with_default_scopes(vec![
            "https://graph.microsoft.com/Mail.Read".to_string(),
            "offline_access".to_string(),
        ]))
    }

    /// Slack `OAuth2` provider configuration (token rotation).
    ///
    /// # Errors
    ///
    /// Returns an error if URL parsing fails.
    pub fn slack() -> Result<Self> {
        Ok(Self::new("Slack", "https://slack.com/api/oauth.v2.access")?
            .with_default_scopes(vec!["im:history".to_string(), "im:read".to_string()]))
    }

    /// Validates that required URLs are set.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.token_url.cannot_be_a_base() {
            return Err(Error::InvalidConfig(format!(
                "token_url is not a valid endpoint: {}",
                self.token_url
            )));
        }
        Ok(())
    }
}
