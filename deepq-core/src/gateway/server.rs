//! HTTP gateway server built on axum.

use super::ServerConfig;
use crate::config::DeepqConfig;
use crate::error::{DeepqError, ResearchError};
use crate::research::output::SourceEntry;
use crate::research::search::{SearchGateway, SearchResult, create_search_gateway};
use crate::research::session::{CycleSummary, SessionStatus, TracingResearchCallback};
use crate::research::ResearchEngine;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Builds collaborators for a request from the effective configuration.
///
/// Requests may carry their own API keys or model, so engines are built per
/// request rather than shared.
pub trait EngineProvider: Send + Sync {
    fn research_engine(&self, config: &DeepqConfig) -> Result<ResearchEngine, DeepqError>;
    fn search_gateway(&self, config: &DeepqConfig) -> Result<Arc<dyn SearchGateway>, DeepqError>;
}

/// Builds real providers from configuration.
pub struct ConfiguredEngines;

impl EngineProvider for ConfiguredEngines {
    fn research_engine(&self, config: &DeepqConfig) -> Result<ResearchEngine, DeepqError> {
        Ok(ResearchEngine::from_config(config)?.with_callback(Arc::new(TracingResearchCallback)))
    }

    fn search_gateway(&self, config: &DeepqConfig) -> Result<Arc<dyn SearchGateway>, DeepqError> {
        Ok(create_search_gateway(
            &config.search,
            Duration::from_secs(config.research.search_timeout_secs.max(1)),
        )?)
    }
}

/// Shared state for the axum handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<DeepqConfig>,
    engines: Arc<dyn EngineProvider>,
    started_at: Instant,
}

impl AppState {
    pub fn new(config: DeepqConfig, engines: Arc<dyn EngineProvider>) -> Self {
        Self {
            config: Arc::new(config),
            engines,
            started_at: Instant::now(),
        }
    }

    pub fn server_config(&self) -> &ServerConfig {
        &self.config.server
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResearchRequest {
    pub topic: String,
    #[serde(default)]
    pub cycles: Option<usize>,
    #[serde(default)]
    pub tavily_api_key: Option<String>,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub openai_model: Option<String>,
    #[serde(default)]
    pub output_file: Option<String>,
}

impl ResearchRequest {
    /// The configuration this request runs with.
    fn apply(&self, base: &DeepqConfig) -> DeepqConfig {
        let mut config = base.clone();
        if let Some(key) = self.tavily_api_key.as_deref().filter(|k| !k.is_empty()) {
            config.search.provider = "tavily".to_string();
            config.search.api_key = Some(key.to_string());
        }
        if let Some(key) = self.openai_api_key.as_deref().filter(|k| !k.is_empty()) {
            config.llm.api_key = Some(key.to_string());
        }
        if let Some(model) = self.openai_model.as_deref().filter(|m| !m.is_empty()) {
            config.llm.model = model.to_string();
        }
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchResponse {
    pub topic: String,
    pub research_cycles_completed: usize,
    pub status: SessionStatus,
    pub final_summary: String,
    pub final_report: String,
    pub cited_sources: Vec<String>,
    pub sources: Vec<SourceEntry>,
    pub cycles: Vec<CycleSummary>,
    pub reduced_confidence: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
}

fn default_max_results() -> usize {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchResult>,
}

/// An error answered as `{"error": ..., "stage": ...}`.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    stage: &'static str,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            stage: "request",
        }
    }
}

impl From<ResearchError> for ApiError {
    fn from(err: ResearchError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            stage: err.stage(),
            message: err.to_string(),
        }
    }
}

impl From<DeepqError> for ApiError {
    fn from(err: DeepqError) -> Self {
        match err {
            DeepqError::Research(e) => e.into(),
            other => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: other.to_string(),
                stage: "configuration",
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
            "stage": self.stage,
        });
        (self.status, Json(body)).into_response()
    }
}

/// Build an axum Router with the research API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/research", post(research_handler))
        .route("/search", post(search_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn index_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "deepq",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "GET /health": "liveness check",
            "POST /research": "run a multi-cycle research session",
            "POST /search": "query the configured search provider",
        },
    }))
}

/// Health check endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "uptime_secs": state.uptime_secs(),
    }))
}

async fn research_handler(
    State(state): State<AppState>,
    Json(request): Json<ResearchRequest>,
) -> Result<Json<ResearchResponse>, ApiError> {
    let topic = request.topic.trim();
    if topic.is_empty() {
        return Err(ApiError::bad_request("topic must not be empty"));
    }
    let output_path = match request.output_file.as_deref() {
        Some(name) => Some(resolve_output_file(&state.config.server.output_dir, name)?),
        None => None,
    };

    let config = request.apply(&state.config);
    let engine = state.engines.research_engine(&config)?;
    let params = config.research.params(topic, request.cycles);

    info!(topic, cycles = params.cycle_budget, "Research request");
    let report = engine.run(&params).await.map_err(|e| {
        warn!(topic, error = %e, stage = e.stage(), "Research request failed");
        ApiError::from(e)
    })?;

    let output_file = match output_path {
        Some(path) => {
            report.save_markdown(&path).map_err(|e| ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: format!("could not write report: {e}"),
                stage: "output",
            })?;
            Some(path.display().to_string())
        }
        None => None,
    };

    Ok(Json(ResearchResponse {
        topic: report.topic,
        research_cycles_completed: report.cycles_used,
        status: report.status,
        final_summary: report.summary,
        final_report: report.markdown_body,
        cited_sources: report.cited_sources,
        sources: report.sources,
        cycles: report.cycles,
        reduced_confidence: report.reduced_confidence,
        output_file,
    }))
}

async fn search_handler(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    let query = request.query.trim();
    if query.is_empty() {
        return Err(ApiError::bad_request("query must not be empty"));
    }
    let gateway = state.engines.search_gateway(&state.config)?;
    let timeout = Duration::from_secs(state.config.research.search_timeout_secs.max(1));
    let results = tokio::time::timeout(timeout, gateway.search(query, request.max_results.max(1)))
        .await
        .map_err(|_| format!("search timed out after {}s", timeout.as_secs()))
        .and_then(|r| r.map_err(|e| e.to_string()))
        .map_err(|reason| ApiError {
            status: StatusCode::BAD_GATEWAY,
            message: ResearchError::SearchProviderError { reason }.to_string(),
            stage: "search",
        })?;

    Ok(Json(SearchResponse {
        query: query.to_string(),
        results,
    }))
}

/// Resolve a requested report name inside `dir`. Only a bare file name is
/// accepted.
fn resolve_output_file(dir: &Path, name: &str) -> Result<PathBuf, ApiError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(file)), None) => Ok(dir.join(file)),
        _ => Err(ApiError::bad_request(format!(
            "output_file must be a plain file name: {name}"
        ))),
    }
}

/// Start the gateway on the configured address.
///
/// Runs until the process receives Ctrl-C.
pub async fn run(state: AppState) -> Result<(), std::io::Error> {
    let addr = state.server_config().bind_addr();
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "Gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
