//! Error types for the deepq core.
//!
//! Uses `thiserror` for public API error types. The research taxonomy
//! (`ResearchError`) names the stage that could not proceed; the adapter
//! errors (`LlmError`, `SearchError`, `FetchError`) stay at their boundary and
//! are absorbed or mapped by the engine.

use std::path::PathBuf;

/// Top-level error type for the deepq core library.
#[derive(Debug, thiserror::Error)]
pub enum DeepqError {
    #[error("Research error: {0}")]
    Research(#[from] ResearchError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures of the research pipeline, one per stage.
///
/// Only `SynthesisUnavailable` and `BudgetExhaustedWithNoData` ever escape
/// `ResearchEngine::run`; the others are absorbed inside a cycle.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResearchError {
    #[error("Query planning unavailable: {reason}")]
    PlanningUnavailable { reason: String },

    #[error("Search provider error: {reason}")]
    SearchProviderError { reason: String },

    #[error("Failed to fetch {url}: {reason}")]
    FetchFailure { url: String, reason: String },

    #[error("Report synthesis unavailable: {reason}")]
    SynthesisUnavailable { reason: String },

    #[error("No source could be retrieved in {cycles} cycle(s) ({attempted} fetch attempt(s) failed)")]
    BudgetExhaustedWithNoData { cycles: usize, attempted: usize },
}

impl ResearchError {
    /// Short name of the stage that failed, for user-visible error payloads.
    pub fn stage(&self) -> &'static str {
        match self {
            ResearchError::PlanningUnavailable { .. } => "planning",
            ResearchError::SearchProviderError { .. } => "search",
            ResearchError::FetchFailure { .. } => "fetch",
            ResearchError::SynthesisUnavailable { .. } => "synthesis",
            ResearchError::BudgetExhaustedWithNoData { .. } => "retrieval",
        }
    }
}

/// Errors from LLM provider interactions.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Model not supported: {model}")]
    UnsupportedModel { model: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },
}

/// Errors from a search provider.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SearchError {
    #[error("Search provider '{provider}' is missing an API key (set {env_var})")]
    MissingApiKey { provider: String, env_var: String },

    #[error("Search request to '{provider}' failed: {message}")]
    Request { provider: String, message: String },

    #[error("Search response from '{provider}' could not be parsed: {message}")]
    Parse { provider: String, message: String },

    #[error("Unknown search provider: {name}")]
    UnknownProvider { name: String },

    #[error("Search timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },
}

/// Errors from page retrieval. Never escapes a cycle: the engine records
/// them as `FetchStatus::Failed`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("invalid url: {url}")]
    InvalidUrl { url: String },

    #[error("HTTP {status}")]
    Status { status: u16 },

    #[error("request failed: {message}")]
    Request { message: String },

    #[error("timeout")]
    Timeout,

    #[error("empty content")]
    EmptyContent,

    #[error("unsupported content type: {content_type}")]
    UnsupportedContent { content_type: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// A type alias for results using the top-level `DeepqError`.
pub type Result<T> = std::result::Result<T, DeepqError>;
