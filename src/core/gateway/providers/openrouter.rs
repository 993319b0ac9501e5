//! OpenRouter Provider Implementation
//!
//! Text generation over OpenRouter's chat completions API. HTTP outcomes are
//! mapped onto the gateway's failure taxonomy so the retry policy can act on
//! them: auth problems are configuration errors, rate limits and server
//! errors are transient, other client errors are permanent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::gateway::{GenerativeProvider, ServiceCapability, TextRequest};
use crate::core::{CoreError, CoreResult};

// =============================================================================
// OpenRouter Provider
// =============================================================================

/// Configuration for the OpenRouter provider
#[derive(Clone, Debug, Default)]
pub struct OpenRouterConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// OpenRouter chat-completions provider (text generation only)
#[derive(Debug)]
pub struct OpenRouterProvider {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenRouterProvider {
    /// Default OpenRouter API base URL
    pub const DEFAULT_BASE_URL: &'static str = "https://openrouter.ai/api/v1";

    pub fn new(config: OpenRouterConfig) -> CoreResult<Self> {
        let api_key = config
            .api_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| CoreError::NotConfigured("OpenRouter API key is required".to_string()))?;

        let base_url = config
            .base_url
            .unwrap_or_else(|| Self::DEFAULT_BASE_URL.to_string());

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(
                config.timeout_secs.unwrap_or(60),
            ))
            .build()
            .map_err(|e| CoreError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            api_key,
            base_url,
            client,
        })
    }
}

// =============================================================================
// OpenRouter API Types
// =============================================================================

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

fn classify_status(status: reqwest::StatusCode, message: String) -> CoreError {
    match status.as_u16() {
        401 | 403 => CoreError::NotConfigured(message),
        408 | 429 => CoreError::TransientService(message),
        code if code >= 500 => CoreError::TransientService(message),
        _ => CoreError::PermanentService(message),
    }
}

#[async_trait]
impl GenerativeProvider for OpenRouterProvider {
    fn name(&self) -> &str {
        "openrouter"
    }

    fn capabilities(&self) -> Vec<ServiceCapability> {
        vec![ServiceCapability::TextGeneration]
    }

    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn generate_text(&self, request: &TextRequest) -> CoreResult<String> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });

        let body = ChatCompletionRequest {
            model: request.model.clone(),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CoreError::Timeout(format!("OpenRouter request timed out: {}", e))
                } else {
                    CoreError::TransientService(format!("OpenRouter request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&text)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("OpenRouter error (HTTP {})", status.as_u16()));
            return Err(classify_status(status, message));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| CoreError::PermanentService(format!("Invalid OpenRouter response: {}", e)))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| {
                CoreError::PermanentService("OpenRouter returned no choices".to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_api_key() {
        let err = OpenRouterProvider::new(OpenRouterConfig::default()).unwrap_err();
        assert!(matches!(err, CoreError::NotConfigured(_)));

        let err = OpenRouterProvider::new(OpenRouterConfig {
            api_key: Some(String::new()),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, CoreError::NotConfigured(_)));
    }

    #[test]
    fn test_capabilities_are_text_only() {
        let provider = OpenRouterProvider::new(OpenRouterConfig {
            api_key: Some("sk-or-test".to_string()),
            ..Default::default()
        })
        .unwrap();

        assert!(provider.supports(ServiceCapability::TextGeneration));
        assert!(!provider.supports(ServiceCapability::ImageGeneration));
        assert!(provider.is_available());
    }

    #[test]
    fn test_status_classification() {
        use reqwest::StatusCode;

        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "no".into()),
            CoreError::NotConfigured(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down".into()),
            CoreError::TransientService(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, "upstream".into()),
            CoreError::TransientService(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "bad".into()),
            CoreError::PermanentService(_)
        ));
    }
}
