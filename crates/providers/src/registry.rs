//! Tier registry — resolves an abstract tier to a concrete client.

use std::collections::HashMap;
use std::sync::Arc;

use fm_domain::config::LlmConfig;
use fm_domain::llm::Tier;
use fm_domain::{Error, Result};

use crate::openai_compat::OpenAiCompatClient;
use crate::LlmClient;

/// Maps tiers to clients. Resolution falls back downward: a request for
/// `large` with only `medium` configured gets `medium`.
pub struct TierRegistry {
    clients: HashMap<Tier, Arc<dyn LlmClient>>,
}

impl TierRegistry {
    pub fn new() -> Self {
        Self { clients: HashMap::new() }
    }

    /// Build a registry from the `[llm]` config section. An unset API
    /// key env var yields an unauthenticated client (local endpoints).
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let mut registry = Self::new();
        for (name, endpoint) in &config.tiers {
            let tier: Tier = match name.parse() {
                Ok(t) => t,
                Err(_) => {
                    tracing::warn!(tier = %name, "skipping unknown tier in llm config");
                    continue;
                }
            };
            let api_key = std::env::var(&endpoint.api_key_env).unwrap_or_default();
            let client = OpenAiCompatClient::new(
                format!("{}:{}", tier, endpoint.model),
                &endpoint.base_url,
                api_key,
                endpoint.model.clone(),
                config.request_timeout_secs,
            )?;
            registry.register(tier, Arc::new(client));
        }
        Ok(registry)
    }

    pub fn register(&mut self, tier: Tier, client: Arc<dyn LlmClient>) {
        self.clients.insert(tier, client);
    }

    /// Resolve a tier to a client, falling back to the nearest lower tier.
    pub fn resolve(&self, tier: Tier) -> Result<Arc<dyn LlmClient>> {
        let mut candidate = Some(tier);
        while let Some(t) = candidate {
            if let Some(client) = self.clients.get(&t) {
                return Ok(client.clone());
            }
            candidate = match t {
                Tier::Large => Some(Tier::Medium),
                Tier::Medium => Some(Tier::Small),
                Tier::Small => None,
            };
        }
        Err(Error::Config(format!("no client available for tier {tier} or below")))
    }

    /// Client one tier above the given one, for cross-tier verification.
    /// Falls back to the same tier at the top of the ladder.
    pub fn resolve_above(&self, tier: Tier) -> Result<Arc<dyn LlmClient>> {
        match tier.next() {
            Some(above) => self.resolve(above),
            None => self.resolve(tier),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl Default for TierRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScriptedClient;

    #[test]
    fn resolves_exact_and_falls_back() {
        let mut registry = TierRegistry::new();
        registry.register(Tier::Small, Arc::new(ScriptedClient::empty("small")));

        assert_eq!(registry.resolve(Tier::Small).unwrap().client_id(), "small");
        // Large falls back through medium to small.
        assert_eq!(registry.resolve(Tier::Large).unwrap().client_id(), "small");
    }

    #[test]
    fn resolve_above_prefers_next_tier() {
        let mut registry = TierRegistry::new();
        registry.register(Tier::Small, Arc::new(ScriptedClient::empty("small")));
        registry.register(Tier::Medium, Arc::new(ScriptedClient::empty("medium")));

        assert_eq!(
            registry.resolve_above(Tier::Small).unwrap().client_id(),
            "medium"
        );
        // Top of ladder: same tier.
        assert_eq!(
            registry.resolve_above(Tier::Large).unwrap().client_id(),
            "medium"
        );
    }

    #[test]
    fn empty_registry_errors() {
        let registry = TierRegistry::new();
        assert!(registry.resolve(Tier::Small).is_err());
        assert!(registry.is_empty());
    }
}
