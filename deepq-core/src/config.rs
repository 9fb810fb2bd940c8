//! Configuration system for deepq.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace `deepq.toml` -> explicit config file -> environment -> overrides.
//! Everything the research engine needs is captured once into a
//! [`ResearchParams`] per run; nothing is read from the environment mid-run.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gateway::ServerConfig;
use crate::research::session::ResearchParams;

/// Upper bound on queries the planner may emit in one cycle.
pub const MAX_QUERIES_PER_CYCLE: usize = 5;

/// Top-level configuration for deepq.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeepqConfig {
    #[serde(default)]
    pub research: ResearchConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Budgets and timeouts for a research run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    /// Default cycle budget when the caller does not give one.
    pub max_research_cycles: usize,
    /// Results kept per search query.
    pub max_search_results_per_query: usize,
    /// URLs fetched per cycle (also the fetch concurrency bound).
    pub max_urls_to_scrape_per_cycle: usize,
    /// Queries the planner may produce per cycle (clamped to 1..=5).
    pub max_queries_per_cycle: usize,
    /// Consecutive cycles with zero search results before giving up early.
    pub empty_cycle_threshold: usize,
    /// Optional wall-clock ceiling for the whole run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_secs: Option<u64>,
    /// Extracted page text is truncated to this many characters.
    pub max_excerpt_chars: usize,
    pub llm_timeout_secs: u64,
    pub search_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_research_cycles: 3,
            max_search_results_per_query: 10,
            max_urls_to_scrape_per_cycle: 5,
            max_queries_per_cycle: 3,
            empty_cycle_threshold: 3,
            max_duration_secs: None,
            max_excerpt_chars: 4000,
            llm_timeout_secs: 120,
            search_timeout_secs: 30,
            fetch_timeout_secs: 20,
        }
    }
}

impl ResearchConfig {
    /// Build the per-run parameters for `topic`.
    ///
    /// `cycles` overrides `max_research_cycles`. Counts of zero are raised to
    /// one so every session satisfies the `>= 1` bounds.
    pub fn params(&self, topic: impl Into<String>, cycles: Option<usize>) -> ResearchParams {
        ResearchParams {
            topic: topic.into(),
            cycle_budget: cycles.unwrap_or(self.max_research_cycles).max(1),
            max_results_per_query: self.max_search_results_per_query.max(1),
            max_urls_per_cycle: self.max_urls_to_scrape_per_cycle.max(1),
            max_queries_per_cycle: self
                .max_queries_per_cycle
                .clamp(1, MAX_QUERIES_PER_CYCLE),
            empty_cycle_threshold: self.empty_cycle_threshold.max(1),
            max_duration: self
                .max_duration_secs
                .filter(|s| *s > 0)
                .map(Duration::from_secs),
            max_excerpt_chars: self.max_excerpt_chars.max(1),
            llm_timeout: Duration::from_secs(self.llm_timeout_secs.max(1)),
            search_timeout: Duration::from_secs(self.search_timeout_secs.max(1)),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs.max(1)),
        }
    }

    /// Validate this config and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.max_research_cycles == 0 {
            warnings.push("max_research_cycles is 0; at least one cycle always runs".to_string());
        }
        if self.max_queries_per_cycle > MAX_QUERIES_PER_CYCLE {
            warnings.push(format!(
                "max_queries_per_cycle ({}) exceeds {}; it will be clamped",
                self.max_queries_per_cycle, MAX_QUERIES_PER_CYCLE
            ));
        }
        if self.max_urls_to_scrape_per_cycle > self.max_search_results_per_query * 5 {
            warnings.push(format!(
                "max_urls_to_scrape_per_cycle ({}) can never be reached with {} results per query",
                self.max_urls_to_scrape_per_cycle, self.max_search_results_per_query
            ));
        }
        if self.max_excerpt_chars < 200 {
            warnings.push(format!(
                "max_excerpt_chars ({}) is very small; excerpts will carry little information",
                self.max_excerpt_chars
            ));
        }
        warnings
    }
}

/// LLM provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name: "openai", "anthropic", or any OpenAI-compatible name.
    pub provider: String,
    /// Model identifier (e.g., "gpt-4o").
    pub model: String,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    /// Explicit API key; takes precedence over `api_key_env`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Optional base URL override for the API endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Maximum tokens to generate in a response.
    pub max_tokens: usize,
    /// Sampling temperature. Kept low for repeatable planning.
    pub temperature: f32,
    pub retry: RetryConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            api_key: None,
            base_url: None,
            max_tokens: 4096,
            temperature: 0.1,
            retry: RetryConfig::default(),
        }
    }
}

impl LlmConfig {
    /// The explicit key if set, otherwise the value of `api_key_env`.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|k| !k.trim().is_empty())
    }

    /// Validate this LLM config and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.temperature < 0.0 || self.temperature > 2.0 {
            warnings.push(format!(
                "temperature ({}) is outside the usual range [0.0, 2.0]",
                self.temperature
            ));
        }
        if self.max_tokens == 0 {
            warnings.push("max_tokens is 0; reports will be empty".to_string());
        }
        if self.model.trim().is_empty() {
            warnings.push("model is empty".to_string());
        }
        warnings
    }
}

/// Retry policy for transient LLM errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Search provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Provider name: "tavily" or "duckduckgo".
    pub provider: String,
    pub api_key_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Tavily search depth: "basic" or "advanced".
    pub search_depth: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            provider: "tavily".to_string(),
            api_key_env: "TAVILY_API_KEY".to_string(),
            api_key: None,
            base_url: None,
            search_depth: "basic".to_string(),
        }
    }
}

impl SearchConfig {
    /// The explicit key if set, otherwise the value of `api_key_env`.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

/// Page retrieval configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/124.0 Safari/537.36"
                .to_string(),
            request_timeout_secs: 15,
            max_redirects: 5,
        }
    }
}

impl DeepqConfig {
    /// Collect warnings from every section.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for w in self.research.validate() {
            warnings.push(format!("[research] {w}"));
        }
        for w in self.llm.validate() {
            warnings.push(format!("[llm] {w}"));
        }
        warnings
    }

    /// A copy with every secret replaced, safe to print or log.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.llm.api_key.is_some() {
            copy.llm.api_key = Some("********".to_string());
        }
        if copy.search.api_key.is_some() {
            copy.search.api_key = Some("********".to_string());
        }
        copy
    }
}

/// Path of the user-level config file, if a config directory exists.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "deepq", "deepq")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `DEEPQ_`, `__` separates sections)
/// 3. Explicit config file
/// 4. Workspace-local config (`deepq.toml`)
/// 5. User config (`~/.config/deepq/config.toml`)
/// 6. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    config_file: Option<&Path>,
    overrides: Option<&DeepqConfig>,
) -> Result<DeepqConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(DeepqConfig::default()));

    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join("deepq.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(file) = config_file {
        figment = figment.merge(Toml::file(file));
    }

    // DEEPQ_LLM__MODEL, DEEPQ_RESEARCH__MAX_RESEARCH_CYCLES, ...
    figment = figment.merge(Env::prefixed("DEEPQ_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}
