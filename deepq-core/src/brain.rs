//! Brain module: LLM provider abstraction.
//!
//! Defines the `LlmProvider` trait every model backend implements, the
//! `Brain` wrapper the research stages call through, and a queue-driven
//! `MockLlmProvider` for tests.

use crate::config::{LlmConfig, RetryConfig};
use crate::error::LlmError;
use crate::providers::with_retry;
use crate::types::{CompletionRequest, CompletionResponse, Message, TokenUsage};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Trait for LLM providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Perform a full completion and return the response.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Return the model name.
    fn model_name(&self) -> &str;
}

/// Sampling and timing knobs applied to every call a `Brain` makes.
#[derive(Debug, Clone)]
pub struct BrainSettings {
    pub temperature: f32,
    pub max_tokens: usize,
    pub timeout: Duration,
    pub retry: RetryConfig,
}

impl BrainSettings {
    pub fn from_config(config: &LlmConfig, timeout: Duration) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout,
            retry: config.retry.clone(),
        }
    }
}

impl Default for BrainSettings {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: 4096,
            timeout: Duration::from_secs(120),
            retry: RetryConfig::default(),
        }
    }
}

/// The research stages' single door to a language model.
///
/// Every call is bounded by `settings.timeout`; transient failures are retried
/// inside that bound. Usage is accumulated across calls.
pub struct Brain {
    provider: Arc<dyn LlmProvider>,
    settings: BrainSettings,
    total_usage: Mutex<TokenUsage>,
}

impl Brain {
    pub fn new(provider: Arc<dyn LlmProvider>, settings: BrainSettings) -> Self {
        Self {
            provider,
            settings,
            total_usage: Mutex::new(TokenUsage::default()),
        }
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn settings(&self) -> &BrainSettings {
        &self.settings
    }

    /// Total token usage so far.
    pub fn total_usage(&self) -> TokenUsage {
        self.total_usage
            .lock()
            .map(|usage| *usage)
            .unwrap_or_default()
    }

    /// Send a system + user prompt and return the generated text.
    pub async fn ask(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let request = CompletionRequest {
            messages: vec![Message::system(system), Message::user(user)],
            temperature: self.settings.temperature,
            max_tokens: Some(self.settings.max_tokens),
            model: None,
        };
        let response = self.complete(request).await?;
        Ok(response.message.content)
    }

    /// Send a completion request with timeout and retry, tracking usage.
    pub async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let timeout = self.settings.timeout;
        let provider = &self.provider;
        let attempt = with_retry(&self.settings.retry, || provider.complete(request.clone()));

        let response = tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| LlmError::Timeout {
                timeout_secs: timeout.as_secs(),
            })??;

        if let Ok(mut usage) = self.total_usage.lock() {
            usage.accumulate(&response.usage);
        }
        debug!(
            model = %response.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "LLM call complete"
        );
        Ok(response)
    }
}

/// A mock LLM provider for testing.
///
/// Returns queued responses in order; queued errors are returned as-is.
/// Every received request is recorded for inspection.
pub struct MockLlmProvider {
    model: String,
    responses: Mutex<Vec<Result<CompletionResponse, LlmError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
    delay: Option<Duration>,
}

impl MockLlmProvider {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            responses: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Create a MockLlmProvider that always returns the given text.
    ///
    /// Queues multiple copies of the response so it can handle multiple calls.
    pub fn with_response(text: &str) -> Self {
        let provider = Self::new();
        for _ in 0..20 {
            provider.queue_response(Self::text_response(text));
        }
        provider
    }

    /// Sleep this long before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a response to be returned by the next `complete` call.
    pub fn queue_response(&self, response: CompletionResponse) {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push(Ok(response));
        }
    }

    /// Queue an error to be returned by the next `complete` call.
    pub fn queue_error(&self, error: LlmError) {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push(Err(error));
        }
    }

    /// Create a simple text response for testing.
    pub fn text_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            message: Message::assistant(text),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
            model: "mock-model".to_string(),
            finish_reason: Some("stop".to_string()),
        }
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl Default for MockLlmProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .responses
            .lock()
            .ok()
            .and_then(|mut queue| (!queue.is_empty()).then(|| queue.remove(0)));
        next.unwrap_or_else(|| {
            Ok(MockLlmProvider::text_response(
                "I'm a mock LLM. No queued responses available.",
            ))
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
