//! Provider adapter registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use reqwest::Client;

use super::{GmailAdapter, OutlookAdapter, ProviderAdapter, SlackAdapter, TelegramAdapter};
use crate::connection::ProviderKind;

/// Map from provider to the adapter that syncs it.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in adapters sharing one HTTP client.
    #[must_use]
    pub fn with_defaults(client: &Client) -> Self {
        Self::new()
            .with(Arc::new(GmailAdapter::new(client.clone())))
            .with(Arc::new(OutlookAdapter::new(client.clone())))
            .with(Arc::new(TelegramAdapter::new(client.clone())))
            .with(Arc::new(SlackAdapter::new(client.clone())))
    }

    /// Register an adapter, replacing any adapter for the same provider.
    #[must_use]
    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// Register an adapter, replacing any adapter for the same provider.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    /// Adapter for a provider, if one is registered.
    #[must_use]
    pub fn get(&self, provider: ProviderKind) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&provider).cloned()
    }

    /// Providers with a registered adapter.
    #[must_use]
    pub fn providers(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self.adapters.keys().copied().collect();
        kinds.sort_by_key(ProviderKind::as_str);
        kinds
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_supported_providers() {
        let registry = AdapterRegistry::with_defaults(&Client::new());
        for kind in [
            ProviderKind::Gmail,
            ProviderKind::Outlook,
            ProviderKind::Telegram,
            ProviderKind::Slack,
        ] {
            assert_eq!(registry.get(kind).map(|a| a.kind()), Some(kind));
        }
        for kind in [ProviderKind::Teams, ProviderKind::WhatsApp, ProviderKind::Discord] {
            assert!(registry.get(kind).is_none());
        }
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(GmailAdapter::new(Client::new())));
        registry.register(Arc::new(
            GmailAdapter::new(Client::new()).with_base_url("http://localhost"),
        ));
        assert_eq!(registry.providers(), vec![ProviderKind::Gmail]);
    }
}
