//! AI provider client.
//!
//! `AiProvider::generate` never fails: provider trouble of any kind (network,
//! auth, quota, malformed response, timeout) turns into [`FALLBACK_REPLY`] so
//! the reply pipeline always has something to store.

mod gemini;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error};

use crate::gemini::{GenerateContentRequest, GenerateContentResponse};

/// Stored as the assistant's reply when the provider call fails.
pub const FALLBACK_REPLY: &str = "Sorry, I encountered an error. Please try again.";

pub trait AiProvider: Send + Sync + 'static {
    fn generate(&self, prompt: &str) -> impl Future<Output = String> + Send;
}

impl<P: AiProvider> AiProvider for Arc<P> {
    fn generate(&self, prompt: &str) -> impl Future<Output = String> + Send {
        (**self).generate(prompt)
    }
}

#[derive(Debug, Error)]
pub enum AiError {
    #[error("request to AI provider failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("AI provider returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("prompt was blocked by the provider: {0}")]
    Blocked(String),
    #[error("AI provider returned no text")]
    Empty,
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    /// Upper bound on a whole generation request.
    pub timeout: Duration,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gemini-pro".into(),
            base_url: "https://generativelanguage.googleapis.com".into(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    config: Arc<GeminiConfig>,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self, AiError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// One `generateContent` call, with every failure surfaced.
    pub async fn try_generate(&self, prompt: &str) -> Result<String, AiError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        );

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&GenerateContentRequest::user_prompt(prompt))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AiError::Status { status, body });
        }

        let text = response.json::<GenerateContentResponse>().await?.into_text()?;
        debug!(model = %self.config.model, chars = text.len(), "Gemini response received");
        Ok(text)
    }
}

impl AiProvider for GeminiClient {
    async fn generate(&self, prompt: &str) -> String {
        match self.try_generate(prompt).await {
            Ok(text) => text,
            Err(e) => {
                error!(model = %self.config.model, "Error contacting Gemini API: {}", e);
                FALLBACK_REPLY.to_string()
            }
        }
    }
}
