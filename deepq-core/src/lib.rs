//! # deepq Core
//!
//! Core library for the deepq research agent.
//! Provides the multi-cycle research engine, the search and web adapters,
//! the LLM interface (brain), configuration, and the HTTP gateway.

pub mod brain;
pub mod config;
pub mod error;
pub mod gateway;
pub mod providers;
pub mod research;
pub mod types;

// Re-export commonly used types at the crate root.
pub use brain::{Brain, BrainSettings, LlmProvider, MockLlmProvider};
pub use config::{DeepqConfig, LlmConfig, ResearchConfig, SearchConfig, load_config};
pub use error::{DeepqError, ResearchError, Result};
pub use gateway::{AppState, ConfiguredEngines, EngineProvider, ServerConfig};
pub use research::{
    ResearchEngine, ResearchParams, ResearchReport, SessionStatus, StopReason,
};
pub use types::{CompletionRequest, CompletionResponse, Message, Role, TokenUsage};
