//! LLM Router
//!
//! Orders the registered providers (configured default first, then registration
//! order) and calls them with automatic failover. Every stage that needs text
//! generation goes through this router.

use super::ollama::OllamaProvider;
use super::openai::OpenAIProvider;
use super::{LLMError, LLMProvider, Message};
use crate::config::LLMConfig;
use std::sync::Arc;
use std::time::Duration;

/// LLM Router with ordered failover across providers
pub struct LLMRouter {
    /// Available LLM providers, in registration order
    providers: Vec<Box<dyn LLMProvider>>,

    /// LLM configuration
    config: Arc<LLMConfig>,
}

impl LLMRouter {
    /// Create a new LLM router
    ///
    /// # Arguments
    /// * `providers` - List of available LLM providers
    /// * `config` - LLM configuration
    pub fn new(providers: Vec<Box<dyn LLMProvider>>, config: Arc<LLMConfig>) -> Self {
        Self { providers, config }
    }

    /// Build a router with every provider the configuration describes
    pub fn from_config(config: Arc<LLMConfig>) -> Self {
        let providers: Vec<Box<dyn LLMProvider>> = vec![
            Box::new(
                OllamaProvider::new(config.ollama.base_url.clone(), config.ollama.model.clone())
                    .with_temperature(config.temperature),
            ),
            Box::new(OpenAIProvider::new(config.openai.clone(), config.temperature)),
        ];

        Self::new(providers, config)
    }

    /// Providers in the order they will be attempted
    pub fn ordered_providers(&self) -> Vec<&dyn LLMProvider> {
        let default_provider = &self.config.default_provider;
        let mut providers: Vec<&dyn LLMProvider> =
            self.providers.iter().map(|b| b.as_ref()).collect();

        // Stable sort keeps registration order among non-defaults
        providers.sort_by_key(|p| p.name() != default_provider);
        providers
    }

    fn timeout_for(&self, provider: &dyn LLMProvider) -> u64 {
        // Local providers get 120s for model loading + generation
        self.config
            .request_timeout_secs
            .unwrap_or(if provider.is_local() { 120 } else { 30 })
    }

    /// Call LLM providers with automatic failover
    ///
    /// Attempts providers in order, each under its own timeout. Returns the
    /// completion text together with the name of the provider that produced it.
    pub async fn call(&self, messages: &[Message]) -> super::Result<(String, String)> {
        if self.providers.is_empty() {
            return Err(LLMError::ProviderUnavailable(
                "No LLM providers configured".to_string(),
            ));
        }

        for provider in self.ordered_providers() {
            let timeout_secs = self.timeout_for(provider);
            tracing::debug!(
                "Attempting provider: {} (timeout: {}s)",
                provider.name(),
                timeout_secs
            );

            let result = tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                provider.generate(messages),
            )
            .await;

            match result {
                Ok(Ok(response)) => {
                    tracing::info!("Provider {} succeeded", provider.name());
                    return Ok((response, provider.name().to_string()));
                }
                Ok(Err(e)) => {
                    tracing::warn!("Provider {} failed: {}", provider.name(), e);
                }
                Err(_) => {
                    tracing::warn!(
                        "Provider {} timed out after {}s",
                        provider.name(),
                        timeout_secs
                    );
                }
            }
        }

        tracing::error!("All LLM providers exhausted");
        Err(LLMError::Exhausted)
    }

    /// Check the health of all registered providers
    /// Returns a list of (provider_name, is_healthy)
    pub async fn check_health(&self) -> Vec<(&str, bool)> {
        let mut results = Vec::new();
        for provider in &self.providers {
            let is_healthy = provider.check_health().await;
            results.push((provider.name(), is_healthy));
        }
        results
    }
}
