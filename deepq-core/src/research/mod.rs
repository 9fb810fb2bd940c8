//! Multi-cycle web research.
//!
//! Each cycle runs four steps:
//! 1. **Plan** - ask the model for queries that cover the open gaps
//! 2. **Search** - run every query against the search provider in parallel
//! 3. **Fetch** - read the unvisited result pages in parallel
//! 4. **Fold** - add excerpts to the knowledge state and reassess gaps
//!
//! Cycles repeat until the gaps close, the planner has nothing left to
//! search, the budget or time limit is spent, or searches keep coming back
//! empty. One synthesis call then writes the report.

pub mod engine;
pub mod knowledge;
pub mod output;
pub mod planner;
pub mod prompts;
pub mod retriever;
pub mod search;
pub mod session;
pub mod sources;
pub mod synthesis;

pub use engine::ResearchEngine;
pub use knowledge::{KnowledgeAccumulator, KnowledgeState};
pub use output::{ReportGenerator, ResearchReport};
pub use planner::{Query, QueryPlanner};
pub use retriever::{HttpRetriever, WebRetriever};
pub use search::{SearchGateway, SearchResult, create_search_gateway};
pub use session::{
    CycleSummary, NoOpResearchCallback, ResearchCallback, ResearchParams, ResearchSession,
    SessionStatus, StopReason, TracingResearchCallback,
};
pub use sources::{FetchStatus, SourceRecord, SourceRegistry};
pub use synthesis::Synthesizer;
