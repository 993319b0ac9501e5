//! Gateway provider implementations.

#[cfg(feature = "ai-providers")]
mod openrouter;
#[cfg(feature = "ai-providers")]
pub use openrouter::{OpenRouterConfig, OpenRouterProvider};

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use super::{
    BinaryArtifact, GenerativeProvider, ImageRequest, ServiceCapability, SpeechRequest,
    TextRequest,
};
use crate::core::{CoreError, CoreResult};

// =============================================================================
// Mock Provider for Testing
// =============================================================================

/// Deterministic in-process provider with scriptable failure behavior.
#[derive(Debug)]
pub struct MockGenerativeProvider {
    name: String,
    capabilities: Vec<ServiceCapability>,
    available: bool,
    text_response: String,
    /// Fail this many calls with a transient error before succeeding
    transient_failures: AtomicU32,
    /// When set, every call fails permanently with this message
    permanent_failure: Option<String>,
    text_calls: AtomicU32,
    image_calls: AtomicU32,
    speech_calls: AtomicU32,
}

impl MockGenerativeProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: vec![
                ServiceCapability::TextGeneration,
                ServiceCapability::ImageGeneration,
                ServiceCapability::SpeechSynthesis,
            ],
            available: true,
            text_response: "mock generated text".to_string(),
            transient_failures: AtomicU32::new(0),
            permanent_failure: None,
            text_calls: AtomicU32::new(0),
            image_calls: AtomicU32::new(0),
            speech_calls: AtomicU32::new(0),
        }
    }

    pub fn with_available(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<ServiceCapability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_text_response(mut self, text: impl Into<String>) -> Self {
        self.text_response = text.into();
        self
    }

    pub fn with_transient_failures(self, count: u32) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_permanent_failure(mut self, message: impl Into<String>) -> Self {
        self.permanent_failure = Some(message.into());
        self
    }

    pub fn text_calls(&self) -> u32 {
        self.text_calls.load(Ordering::SeqCst)
    }

    pub fn image_calls(&self) -> u32 {
        self.image_calls.load(Ordering::SeqCst)
    }

    pub fn speech_calls(&self) -> u32 {
        self.speech_calls.load(Ordering::SeqCst)
    }

    fn scripted_failure(&self) -> CoreResult<()> {
        if let Some(message) = &self.permanent_failure {
            return Err(CoreError::PermanentService(message.clone()));
        }
        // Consume one scripted transient failure, if any remain
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(CoreError::TransientService(
                "simulated transient failure".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl GenerativeProvider for MockGenerativeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Vec<ServiceCapability> {
        self.capabilities.clone()
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn generate_text(&self, request: &TextRequest) -> CoreResult<String> {
        if !self.supports(ServiceCapability::TextGeneration) {
            return Err(CoreError::NotSupported(
                "Text generation not supported".to_string(),
            ));
        }
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        self.scripted_failure()?;

        let _ = &request.model;
        Ok(self.text_response.clone())
    }

    async fn generate_image(&self, request: &ImageRequest) -> CoreResult<BinaryArtifact> {
        if !self.supports(ServiceCapability::ImageGeneration) {
            return Err(CoreError::NotSupported(
                "Image generation not supported".to_string(),
            ));
        }
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        self.scripted_failure()?;

        let _ = &request.prompt;
        Ok(BinaryArtifact {
            data: vec![0u8; 64],
            mime_type: "image/png".to_string(),
        })
    }

    async fn synthesize_speech(&self, request: &SpeechRequest) -> CoreResult<BinaryArtifact> {
        if !self.supports(ServiceCapability::SpeechSynthesis) {
            return Err(CoreError::NotSupported(
                "Speech synthesis not supported".to_string(),
            ));
        }
        self.speech_calls.fetch_add(1, Ordering::SeqCst);
        self.scripted_failure()?;

        let _ = &request.text;
        Ok(BinaryArtifact {
            data: vec![0u8; 64],
            mime_type: "audio/mpeg".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_provider_defaults() {
        let provider = MockGenerativeProvider::new("mock");

        assert_eq!(provider.name(), "mock");
        assert!(provider.is_available());
        assert!(provider.supports(ServiceCapability::SpeechSynthesis));
    }

    #[tokio::test]
    async fn test_mock_provider_counts_calls() {
        let provider = MockGenerativeProvider::new("mock");

        let request = TextRequest {
            prompt: "hi".to_string(),
            system: None,
            model: "m".to_string(),
            temperature: 0.5,
            max_tokens: 16,
        };
        provider.generate_text(&request).await.unwrap();
        provider.generate_text(&request).await.unwrap();

        assert_eq!(provider.text_calls(), 2);
        assert_eq!(provider.image_calls(), 0);
    }

    #[tokio::test]
    async fn test_mock_provider_transient_script() {
        let provider = MockGenerativeProvider::new("mock").with_transient_failures(1);

        let request = ImageRequest::new("a lake");
        assert!(provider.generate_image(&request).await.is_err());
        assert!(provider.generate_image(&request).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_provider_capability_subset() {
        let provider = MockGenerativeProvider::new("mock")
            .with_capabilities(vec![ServiceCapability::TextGeneration]);

        let request = SpeechRequest {
            text: "hello".to_string(),
            voice: None,
            model: None,
        };
        let err = provider.synthesize_speech(&request).await.unwrap_err();
        assert!(matches!(err, CoreError::NotSupported(_)));
    }
}
