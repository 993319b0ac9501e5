//! External Service Gateway
//!
//! Abstracts the three categories of remote services the pipeline calls:
//! text generation, image generation, and speech synthesis. Providers
//! implement [`GenerativeProvider`]; the [`ServiceGateway`] fronting them
//! owns the call policy (per-request timeout, bounded retry with doubling
//! backoff for transient failures only).
//!
//! Outcome classification is carried by the error type: `NotConfigured` is a
//! configuration problem and never retried, `TransientService`/`Timeout` are
//! retried within the budget, `PermanentService` is terminal.

pub mod providers;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use crate::core::{CoreError, CoreResult};

// =============================================================================
// Capabilities
// =============================================================================

/// Service categories a provider can offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceCapability {
    TextGeneration,
    ImageGeneration,
    SpeechSynthesis,
}

impl std::fmt::Display for ServiceCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceCapability::TextGeneration => write!(f, "Text Generation"),
            ServiceCapability::ImageGeneration => write!(f, "Image Generation"),
            ServiceCapability::SpeechSynthesis => write!(f, "Speech Synthesis"),
        }
    }
}

// =============================================================================
// Requests and Artifacts
// =============================================================================

/// Request for text completion
#[derive(Clone, Debug)]
pub struct TextRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Request for image generation
#[derive(Clone, Debug)]
pub struct ImageRequest {
    pub prompt: String,
    /// Provider default when absent
    pub model: Option<String>,
    pub width: u32,
    pub height: u32,
}

impl ImageRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            width: 1024,
            height: 1024,
        }
    }
}

/// Request for speech synthesis
#[derive(Clone, Debug)]
pub struct SpeechRequest {
    pub text: String,
    pub voice: Option<String>,
    pub model: Option<String>,
}

/// Binary payload returned by image/speech providers
#[derive(Clone, Debug)]
pub struct BinaryArtifact {
    pub data: Vec<u8>,
    pub mime_type: String,
}

// =============================================================================
// Provider Trait
// =============================================================================

/// Trait for remote generative service providers.
///
/// Unsupported operations default to a permanent failure so a provider only
/// implements the categories it actually offers.
#[async_trait]
pub trait GenerativeProvider: Send + Sync {
    /// Returns the provider name
    fn name(&self) -> &str;

    /// Returns supported capabilities
    fn capabilities(&self) -> Vec<ServiceCapability>;

    /// Checks if provider supports a capability
    fn supports(&self, capability: ServiceCapability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Checks if the provider is configured correctly (credentials present)
    fn is_available(&self) -> bool;

    async fn generate_text(&self, _request: &TextRequest) -> CoreResult<String> {
        Err(CoreError::NotSupported(format!(
            "{} does not support text generation",
            self.name()
        )))
    }

    async fn generate_image(&self, _request: &ImageRequest) -> CoreResult<BinaryArtifact> {
        Err(CoreError::NotSupported(format!(
            "{} does not support image generation",
            self.name()
        )))
    }

    async fn synthesize_speech(&self, _request: &SpeechRequest) -> CoreResult<BinaryArtifact> {
        Err(CoreError::NotSupported(format!(
            "{} does not support speech synthesis",
            self.name()
        )))
    }
}

// =============================================================================
// Gateway
// =============================================================================

/// Call policy applied in front of every provider
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Total attempts per call (first try included)
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles each retry
    pub initial_backoff: Duration,
    /// Per-attempt timeout so one stuck call cannot occupy a worker
    pub request_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Provider registry plus retry/timeout policy.
pub struct ServiceGateway {
    providers: RwLock<HashMap<String, Arc<dyn GenerativeProvider>>>,
    /// Preferred provider name per capability
    defaults: RwLock<HashMap<ServiceCapability, String>>,
    config: GatewayConfig,
}

impl ServiceGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            defaults: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(GatewayConfig::default())
    }

    pub async fn register_provider(&self, provider: Arc<dyn GenerativeProvider>) {
        let mut providers = self.providers.write().await;
        providers.insert(provider.name().to_string(), provider);
    }

    pub async fn set_default_provider(
        &self,
        capability: ServiceCapability,
        name: impl Into<String>,
    ) {
        let mut defaults = self.defaults.write().await;
        defaults.insert(capability, name.into());
    }

    pub async fn list_providers(&self) -> Vec<String> {
        self.providers.read().await.keys().cloned().collect()
    }

    /// The configured default for a capability, else the first available
    /// provider that supports it.
    pub async fn provider_for(
        &self,
        capability: ServiceCapability,
    ) -> Option<Arc<dyn GenerativeProvider>> {
        let providers = self.providers.read().await;

        if let Some(name) = self.defaults.read().await.get(&capability) {
            if let Some(provider) = providers.get(name) {
                if provider.supports(capability) {
                    return Some(Arc::clone(provider));
                }
            }
        }

        providers
            .values()
            .find(|p| p.supports(capability) && p.is_available())
            .map(Arc::clone)
    }

    // =========================================================================
    // Invocation
    // =========================================================================

    pub async fn generate_text(&self, request: &TextRequest) -> CoreResult<String> {
        let provider = self.require(ServiceCapability::TextGeneration).await?;
        self.call_with_policy("text generation", || provider.generate_text(request))
            .await
    }

    pub async fn generate_image(&self, request: &ImageRequest) -> CoreResult<BinaryArtifact> {
        let provider = self.require(ServiceCapability::ImageGeneration).await?;
        self.call_with_policy("image generation", || provider.generate_image(request))
            .await
    }

    pub async fn synthesize_speech(&self, request: &SpeechRequest) -> CoreResult<BinaryArtifact> {
        let provider = self.require(ServiceCapability::SpeechSynthesis).await?;
        self.call_with_policy("speech synthesis", || provider.synthesize_speech(request))
            .await
    }

    async fn require(
        &self,
        capability: ServiceCapability,
    ) -> CoreResult<Arc<dyn GenerativeProvider>> {
        let provider = self.provider_for(capability).await.ok_or_else(|| {
            CoreError::NotConfigured(format!("No provider configured for {capability}"))
        })?;
        if !provider.is_available() {
            return Err(CoreError::NotConfigured(format!(
                "Provider {} is not configured for {capability}",
                provider.name()
            )));
        }
        Ok(provider)
    }

    /// Runs one provider call under the timeout, retrying transient failures
    /// with doubling backoff until the attempt budget is exhausted.
    async fn call_with_policy<T, F, Fut>(&self, label: &str, call: F) -> CoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let mut delay = self.config.initial_backoff;
        let mut last_error = None;

        for attempt in 1..=self.config.max_attempts {
            let result = match tokio::time::timeout(self.config.request_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(CoreError::Timeout(format!(
                    "{label} timed out after {:?}",
                    self.config.request_timeout
                ))),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    warn!("{label} attempt {attempt} failed: {e}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| CoreError::Internal(format!("{label} failed with no attempts"))))
    }
}
