//! # HTTP Gateway
//!
//! A small JSON API over the research engine: `POST /research` runs a full
//! session, `POST /search` queries the configured search provider, and
//! `GET /health` reports liveness.

mod server;

pub use server::{
    AppState, ConfiguredEngines, EngineProvider, ResearchRequest, ResearchResponse, SearchRequest,
    router as gateway_router, run as run_gateway,
};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the HTTP gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Directory that `output_file` names in research requests resolve into.
    pub output_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8771,
            output_dir: PathBuf::from("reports"),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
