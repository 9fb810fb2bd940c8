//! Research session state machine.
//!
//! One `ResearchSession` exists per run. It is owned by the engine, tracks
//! the cycle counter and terminal status, and is dropped when the run ends.

use super::planner::Query;
use super::sources::FetchStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Per-run parameters, captured once from configuration.
#[derive(Debug, Clone)]
pub struct ResearchParams {
    pub topic: String,
    pub cycle_budget: usize,
    pub max_results_per_query: usize,
    pub max_urls_per_cycle: usize,
    pub max_queries_per_cycle: usize,
    pub empty_cycle_threshold: usize,
    pub max_duration: Option<Duration>,
    pub max_excerpt_chars: usize,
    pub llm_timeout: Duration,
    pub search_timeout: Duration,
    pub fetch_timeout: Duration,
}

/// Lifecycle status of a research session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    /// Open gaps closed, or the planner had nothing left to search.
    Completed,
    /// A budget ran out: cycles, consecutive empty cycles, or wall clock.
    Exhausted,
    /// No source could be retrieved at all.
    Failed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Exhausted => write!(f, "exhausted"),
            SessionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Why a session stopped cycling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    GapsClosed,
    NoQueries,
    BudgetReached,
    EmptyCycles,
    Deadline,
    NoData,
}

impl StopReason {
    pub fn status(self) -> SessionStatus {
        match self {
            StopReason::GapsClosed | StopReason::NoQueries => SessionStatus::Completed,
            StopReason::BudgetReached | StopReason::EmptyCycles | StopReason::Deadline => {
                SessionStatus::Exhausted
            }
            StopReason::NoData => SessionStatus::Failed,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            StopReason::GapsClosed => "all open gaps were covered",
            StopReason::NoQueries => "the planner had nothing left to search",
            StopReason::BudgetReached => "the cycle budget was used up",
            StopReason::EmptyCycles => "searches kept returning nothing",
            StopReason::Deadline => "the time limit was reached",
            StopReason::NoData => "no source could be retrieved",
        }
    }
}

/// A single research run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchSession {
    pub id: Uuid,
    pub topic: String,
    pub cycle_budget: usize,
    pub max_results_per_query: usize,
    pub max_urls_per_cycle: usize,
    pub cycles_run: usize,
    pub status: SessionStatus,
    pub stop_reason: Option<StopReason>,
    /// Cycles in a row whose searches returned zero results.
    pub consecutive_empty_cycles: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl ResearchSession {
    pub fn new(params: &ResearchParams) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: params.topic.clone(),
            cycle_budget: params.cycle_budget.max(1),
            max_results_per_query: params.max_results_per_query.max(1),
            max_urls_per_cycle: params.max_urls_per_cycle.max(1),
            cycles_run: 0,
            status: SessionStatus::Running,
            stop_reason: None,
            consecutive_empty_cycles: 0,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    /// Start the next cycle and return its 1-based index, or `None` once the
    /// budget is spent or the session is no longer running.
    pub fn begin_cycle(&mut self) -> Option<usize> {
        if !self.is_active() || self.cycles_run >= self.cycle_budget {
            return None;
        }
        self.cycles_run += 1;
        debug!(session = %self.id, cycle = self.cycles_run, "Cycle started");
        Some(self.cycles_run)
    }

    pub fn is_last_cycle(&self) -> bool {
        self.cycles_run >= self.cycle_budget
    }

    /// Record how many search results a cycle produced; returns the new
    /// consecutive-empty count.
    pub fn record_search_results(&mut self, total_results: usize) -> usize {
        if total_results == 0 {
            self.consecutive_empty_cycles += 1;
        } else {
            self.consecutive_empty_cycles = 0;
        }
        self.consecutive_empty_cycles
    }

    /// Move to the terminal status implied by `reason`.
    pub fn finish(&mut self, reason: StopReason) {
        self.status = reason.status();
        self.stop_reason = Some(reason);
        self.finished_at = Some(Utc::now());
        info!(
            session = %self.id,
            status = %self.status,
            cycles_run = self.cycles_run,
            reason = reason.describe(),
            "Research session finished"
        );
    }

    /// Mark the session as failed.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.status = SessionStatus::Failed;
        self.finished_at = Some(Utc::now());
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Running
    }
}

/// Trace of one cycle, kept for the report and for observers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CycleSummary {
    pub cycle: usize,
    pub queries: Vec<String>,
    /// The planner failed and the topic was searched instead.
    pub planner_fallback: bool,
    pub search_results: usize,
    pub failed_searches: usize,
    pub fetched_ok: usize,
    pub fetched_failed: usize,
    /// The gap assessment failed and previous gaps were kept.
    pub assessment_degraded: bool,
    pub open_gaps: usize,
}

impl CycleSummary {
    pub fn new(cycle: usize) -> Self {
        Self {
            cycle,
            ..Default::default()
        }
    }

    /// Whether this cycle added at least one readable source.
    pub fn contributed(&self) -> bool {
        self.fetched_ok > 0
    }
}

/// Callback trait for observing research progress.
pub trait ResearchCallback: Send + Sync {
    /// Called when a cycle starts.
    fn on_cycle_start(&self, cycle: usize, budget: usize);
    /// Called once the cycle's queries are known.
    fn on_queries_planned(&self, cycle: usize, queries: &[Query], fallback: bool);
    /// Called per query after its search returns.
    fn on_search_complete(&self, query: &str, results: usize);
    /// Called per attempted URL.
    fn on_fetch_complete(&self, url: &str, status: &FetchStatus);
    /// Called when a cycle has been folded.
    fn on_cycle_complete(&self, summary: &CycleSummary);
    /// Called before the final report is written.
    fn on_synthesis_start(&self, sources: usize);
}

/// No-op callback for testing.
pub struct NoOpResearchCallback;

impl ResearchCallback for NoOpResearchCallback {
    fn on_cycle_start(&self, _cycle: usize, _budget: usize) {}
    fn on_queries_planned(&self, _cycle: usize, _queries: &[Query], _fallback: bool) {}
    fn on_search_complete(&self, _query: &str, _results: usize) {}
    fn on_fetch_complete(&self, _url: &str, _status: &FetchStatus) {}
    fn on_cycle_complete(&self, _summary: &CycleSummary) {}
    fn on_synthesis_start(&self, _sources: usize) {}
}

/// Emits every event as a structured `tracing` record.
pub struct TracingResearchCallback;

impl ResearchCallback for TracingResearchCallback {
    fn on_cycle_start(&self, cycle: usize, budget: usize) {
        info!(cycle, budget, "Research cycle starting");
    }

    fn on_queries_planned(&self, cycle: usize, queries: &[Query], fallback: bool) {
        let texts: Vec<&str> = queries.iter().map(|q| q.text.as_str()).collect();
        info!(cycle, queries = ?texts, fallback, "Queries planned");
    }

    fn on_search_complete(&self, query: &str, results: usize) {
        info!(query, results, "Search complete");
    }

    fn on_fetch_complete(&self, url: &str, status: &FetchStatus) {
        match status {
            FetchStatus::Ok => debug!(url, "Fetched"),
            FetchStatus::Failed(reason) => info!(url, reason = %reason, "Fetch failed"),
        }
    }

    fn on_cycle_complete(&self, summary: &CycleSummary) {
        info!(
            cycle = summary.cycle,
            results = summary.search_results,
            fetched_ok = summary.fetched_ok,
            fetched_failed = summary.fetched_failed,
            open_gaps = summary.open_gaps,
            "Research cycle complete"
        );
    }

    fn on_synthesis_start(&self, sources: usize) {
        info!(sources, "Synthesizing report");
    }
}
