//! Research engine: drives plan → search → fetch → fold cycles and the
//! final synthesis.
//!
//! Cycles run strictly in sequence. Inside a cycle, searches and fetches
//! run concurrently and are joined before anything is folded, so results
//! are applied in merge order no matter which request finishes first. A
//! cycle works on borrowed state and hands back a [`CycleOutcome`]; the
//! engine applies it only once the whole cycle has finished, which is what
//! lets the wall-clock deadline discard an interrupted cycle cleanly.

use crate::brain::{Brain, BrainSettings, LlmProvider};
use crate::config::DeepqConfig;
use crate::error::{DeepqError, ResearchError, SearchError};
use crate::providers::create_provider;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::knowledge::{KnowledgeAccumulator, KnowledgeState, fold_excerpts};
use super::output::ResearchReport;
use super::planner::{Query, QueryPlanner};
use super::retriever::{HttpRetriever, WebRetriever, retrieve};
use super::search::{SearchGateway, SearchResult, create_search_gateway, merge_results};
use super::session::{
    CycleSummary, NoOpResearchCallback, ResearchCallback, ResearchParams, ResearchSession,
    StopReason,
};
use super::sources::{FetchStatus, SourceRecord, SourceRegistry};
use super::synthesis::{ReportContext, Synthesizer};

/// Snippets passed to the gap assessment per cycle.
const MAX_ASSESSMENT_SNIPPETS: usize = 20;

/// Everything one cycle produced, not yet applied.
#[derive(Debug)]
struct CycleOutcome {
    summary: CycleSummary,
    records: Vec<SourceRecord>,
    state: KnowledgeState,
    no_queries: bool,
}

/// Per-run collaborators built around one `Brain`.
struct Stages {
    planner: QueryPlanner,
    accumulator: KnowledgeAccumulator,
    synthesizer: Synthesizer,
}

/// The multi-cycle research engine.
pub struct ResearchEngine {
    llm: Arc<dyn LlmProvider>,
    search: Arc<dyn SearchGateway>,
    retriever: Arc<dyn WebRetriever>,
    brain_settings: BrainSettings,
    callback: Arc<dyn ResearchCallback>,
}

impl ResearchEngine {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        search: Arc<dyn SearchGateway>,
        retriever: Arc<dyn WebRetriever>,
        brain_settings: BrainSettings,
    ) -> Self {
        Self {
            llm,
            search,
            retriever,
            brain_settings,
            callback: Arc::new(NoOpResearchCallback),
        }
    }

    /// Build an engine with the providers named in `config`.
    pub fn from_config(config: &DeepqConfig) -> Result<Self, DeepqError> {
        let llm = create_provider(&config.llm)?;
        let search = create_search_gateway(
            &config.search,
            Duration::from_secs(config.research.search_timeout_secs.max(1)),
        )?;
        let retriever: Arc<dyn WebRetriever> = Arc::new(HttpRetriever::new(&config.fetch)?);
        let settings = BrainSettings::from_config(
            &config.llm,
            Duration::from_secs(config.research.llm_timeout_secs.max(1)),
        );
        Ok(Self::new(llm, search, retriever, settings))
    }

    /// Observe progress through `callback`.
    pub fn with_callback(mut self, callback: Arc<dyn ResearchCallback>) -> Self {
        self.callback = callback;
        self
    }

    pub fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    /// Run one research session to completion.
    ///
    /// Returns a report unless every fetch attempted in the run failed
    /// (`BudgetExhaustedWithNoData`) or the final synthesis failed
    /// (`SynthesisUnavailable`). Planning, search, fetch, and assessment
    /// failures degrade inside their cycle.
    pub async fn run(&self, params: &ResearchParams) -> Result<ResearchReport, ResearchError> {
        let mut session = ResearchSession::new(params);
        let brain = Arc::new(Brain::new(
            self.llm.clone(),
            BrainSettings {
                timeout: params.llm_timeout,
                ..self.brain_settings.clone()
            },
        ));
        let stages = Stages {
            planner: QueryPlanner::new(brain.clone()),
            accumulator: KnowledgeAccumulator::new(brain.clone()),
            synthesizer: Synthesizer::new(brain.clone()),
        };

        info!(
            session = %session.id,
            topic = %params.topic,
            budget = session.cycle_budget,
            "Research session started"
        );

        let deadline = params.max_duration.map(|d| Instant::now() + d);
        let mut state = KnowledgeState::new(&params.topic);
        let mut registry = SourceRegistry::new();
        let mut cycles: Vec<CycleSummary> = Vec::new();

        while let Some(cycle) = session.begin_cycle() {
            self.callback.on_cycle_start(cycle, session.cycle_budget);

            let step = self.run_cycle(cycle, params, &state, &registry, &stages);
            let outcome = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, step).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(cycle, "Time limit reached mid-cycle; discarding the cycle");
                        session.finish(StopReason::Deadline);
                        break;
                    }
                },
                None => step.await,
            };

            for record in outcome.records {
                registry.insert(record);
            }
            state = outcome.state;
            session.record_search_results(outcome.summary.search_results);
            self.callback.on_cycle_complete(&outcome.summary);
            cycles.push(outcome.summary);

            if outcome.no_queries {
                session.finish(StopReason::NoQueries);
            } else if !state.has_open_gaps() {
                session.finish(StopReason::GapsClosed);
            } else if session.consecutive_empty_cycles >= params.empty_cycle_threshold {
                session.finish(StopReason::EmptyCycles);
            } else if session.is_last_cycle() {
                session.finish(StopReason::BudgetReached);
            } else if deadline.is_some_and(|d| Instant::now() >= d) {
                session.finish(StopReason::Deadline);
            }
        }

        let attempted = registry.len();
        if attempted > 0 && registry.ok_count() == 0 {
            let err = ResearchError::BudgetExhaustedWithNoData {
                cycles: session.cycles_run,
                attempted,
            };
            session.finish(StopReason::NoData);
            session.fail(err.to_string());
            warn!(session = %session.id, error = %err, "Research failed");
            return Err(err);
        }

        let notes = confidence_notes(&cycles, session.stop_reason);
        let reduced_confidence = !notes.is_empty();
        let context = ReportContext {
            cycles_used: session.cycles_run,
            status: session.status,
            stop_reason: session.stop_reason,
            reduced_confidence,
            notes,
            cycles,
        };

        self.callback.on_synthesis_start(state.excerpts.len());
        match stages
            .synthesizer
            .synthesize(&params.topic, &state, &registry, context)
            .await
        {
            Ok(report) => {
                let usage = brain.total_usage();
                info!(
                    session = %session.id,
                    status = %report.status,
                    cycles = report.cycles_used,
                    cited = report.cited_sources.len(),
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    "Research report ready"
                );
                Ok(report)
            }
            Err(err) => {
                session.fail(err.to_string());
                warn!(session = %session.id, error = %err, "Synthesis failed");
                Err(err)
            }
        }
    }

    async fn run_cycle(
        &self,
        cycle: usize,
        params: &ResearchParams,
        state: &KnowledgeState,
        registry: &SourceRegistry,
        stages: &Stages,
    ) -> CycleOutcome {
        let mut summary = CycleSummary::new(cycle);

        // 1. Plan
        let queries = match stages
            .planner
            .plan(
                &params.topic,
                &state.open_gaps_vec(),
                &state.summary,
                cycle,
                params.max_queries_per_cycle,
            )
            .await
        {
            Ok(queries) => queries,
            Err(e) => {
                warn!(cycle, error = %e, "Planner unavailable; searching the topic instead");
                summary.planner_fallback = true;
                vec![Query::new(params.topic.clone(), cycle)]
            }
        };
        summary.queries = queries.iter().map(|q| q.text.clone()).collect();
        self.callback
            .on_queries_planned(cycle, &queries, summary.planner_fallback);

        if queries.is_empty() {
            summary.open_gaps = state.open_gaps.len();
            return CycleOutcome {
                summary,
                records: Vec::new(),
                state: state.clone(),
                no_queries: true,
            };
        }

        // 2. Search
        let searches = queries
            .iter()
            .map(|q| self.search_one(&q.text, params.max_results_per_query, params.search_timeout));
        let mut per_query = Vec::with_capacity(queries.len());
        for (query, result) in queries.iter().zip(join_all(searches).await) {
            let results = match result {
                Ok(results) => results,
                Err(e) => {
                    let err = ResearchError::SearchProviderError {
                        reason: e.to_string(),
                    };
                    warn!(cycle, query = %query.text, error = %err, "Search failed; skipping query");
                    summary.failed_searches += 1;
                    Vec::new()
                }
            };
            self.callback.on_search_complete(&query.text, results.len());
            summary.search_results += results.len();
            per_query.push(results);
        }
        let merged = merge_results(per_query);
        let snippets: Vec<String> = merged
            .iter()
            .filter(|r| !r.snippet.trim().is_empty())
            .take(MAX_ASSESSMENT_SNIPPETS)
            .map(|r| format!("{}: {}", r.title, r.snippet.trim()))
            .collect();

        // 3. Fetch unvisited URLs
        let selected: Vec<&SearchResult> = merged
            .iter()
            .filter(|r| !registry.contains(&r.url))
            .take(params.max_urls_per_cycle)
            .collect();
        let fetches = selected.iter().map(|r| {
            retrieve(
                self.retriever.as_ref(),
                &r.url,
                cycle,
                params.fetch_timeout,
                params.max_excerpt_chars,
            )
        });
        let records: Vec<SourceRecord> = join_all(fetches).await;
        for record in &records {
            if let FetchStatus::Failed(reason) = &record.fetch_status {
                let err = ResearchError::FetchFailure {
                    url: record.url.clone(),
                    reason: reason.clone(),
                };
                debug!(cycle, error = %err, "Source skipped");
            }
            self.callback.on_fetch_complete(&record.url, &record.fetch_status);
        }
        summary.fetched_ok = records.iter().filter(|r| r.is_ok()).count();
        summary.fetched_failed = records.len() - summary.fetched_ok;

        // 4. Fold
        let next = if summary.fetched_ok == 0 {
            state.clone()
        } else {
            match stages
                .accumulator
                .fold(&params.topic, state, &records, &snippets)
                .await
            {
                Ok(next) => next,
                Err(e) => {
                    warn!(cycle, error = %e, "Gap assessment unavailable; keeping previous gaps");
                    summary.assessment_degraded = true;
                    fold_excerpts(state, &records)
                }
            }
        };
        summary.open_gaps = next.open_gaps.len();

        CycleOutcome {
            summary,
            records,
            state: next,
            no_queries: false,
        }
    }

    async fn search_one(
        &self,
        query: &str,
        limit: usize,
        timeout: Duration,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let mut results = tokio::time::timeout(timeout, self.search.search(query, limit))
            .await
            .map_err(|_| SearchError::Timeout {
                timeout_secs: timeout.as_secs(),
            })??;
        results.truncate(limit);
        for result in &mut results {
            if result.query_text.is_empty() {
                result.query_text = query.to_string();
            }
        }
        Ok(results)
    }
}

/// Reasons the report should be read with reduced confidence.
fn confidence_notes(cycles: &[CycleSummary], stop: Option<StopReason>) -> Vec<String> {
    let mut notes: Vec<String> = cycles
        .iter()
        .filter(|c| !c.queries.is_empty() && !c.contributed())
        .map(|c| {
            format!(
                "Cycle {} added no readable source ({} search result(s), {} failed fetch(es)).",
                c.cycle, c.search_results, c.fetched_failed
            )
        })
        .collect();
    if stop == Some(StopReason::Deadline) {
        notes.push("The time limit ended research before the cycle budget was used.".to_string());
    }
    notes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResearchConfig, RetryConfig};
    use crate::error::{FetchError, LlmError};
    use crate::research::prompts;
    use crate::research::retriever::FetchedPage;
    use crate::research::session::SessionStatus;
    use crate::types::{CompletionRequest, CompletionResponse};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // --- Stub LLM: routes by system prompt -------------------------------

    #[derive(Default)]
    struct ScriptedLlm {
        plans: Mutex<VecDeque<Result<String, LlmError>>>,
        assessments: Mutex<VecDeque<Result<String, LlmError>>>,
        report: Mutex<Option<Result<String, LlmError>>>,
        plan_calls: AtomicUsize,
        assess_calls: AtomicUsize,
        report_calls: AtomicUsize,
    }

    impl ScriptedLlm {
        fn plan(self, answer: &str) -> Self {
            self.plans.lock().unwrap().push_back(Ok(answer.to_string()));
            self
        }

        fn plan_error(self) -> Self {
            self.plans.lock().unwrap().push_back(Err(LlmError::Connection {
                message: "planner offline".into(),
            }));
            self
        }

        fn assess(self, answer: &str) -> Self {
            self.assessments
                .lock()
                .unwrap()
                .push_back(Ok(answer.to_string()));
            self
        }

        fn assess_error(self) -> Self {
            self.assessments
                .lock()
                .unwrap()
                .push_back(Err(LlmError::ResponseParse {
                    message: "bad".into(),
                }));
            self
        }

        fn report_error(self) -> Self {
            *self.report.lock().unwrap() = Some(Err(LlmError::Timeout { timeout_secs: 1 }));
            self
        }

        fn reply(text: String) -> CompletionResponse {
            crate::brain::MockLlmProvider::text_response(&text)
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            let system = request.messages[0].content.as_str();
            let answer = if system == prompts::PLANNER_SYSTEM {
                self.plan_calls.fetch_add(1, Ordering::SeqCst);
                self.plans
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| Ok(r#"["default query"]"#.to_string()))
            } else if system == prompts::ASSESSMENT_SYSTEM {
                self.assess_calls.fetch_add(1, Ordering::SeqCst);
                self.assessments
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| {
                        Ok(r#"{"summary": "partial", "covered": ["a"], "gaps": ["more"]}"#.to_string())
                    })
            } else {
                self.report_calls.fetch_add(1, Ordering::SeqCst);
                self.report
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or_else(|| Ok("# Report\n\nFindings.".to_string()))
            };
            answer.map(Self::reply)
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    // --- Stub search ------------------------------------------------------

    #[derive(Default)]
    struct StubSearch {
        by_query: HashMap<String, Vec<&'static str>>,
        fallback: Vec<&'static str>,
        failing: HashSet<String>,
        calls: Mutex<Vec<String>>,
    }

    impl StubSearch {
        fn always(urls: &[&'static str]) -> Self {
            Self {
                fallback: urls.to_vec(),
                ..Default::default()
            }
        }

        fn on(mut self, query: &str, urls: &[&'static str]) -> Self {
            self.by_query.insert(query.to_string(), urls.to_vec());
            self
        }

        fn fail_on(mut self, query: &str) -> Self {
            self.failing.insert(query.to_string());
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SearchGateway for StubSearch {
        async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, SearchError> {
            self.calls.lock().unwrap().push(query.to_string());
            if self.failing.contains(query) {
                return Err(SearchError::Request {
                    provider: "stub".into(),
                    message: "boom".into(),
                });
            }
            let urls = self.by_query.get(query).unwrap_or(&self.fallback);
            Ok(urls
                .iter()
                .take(limit)
                .map(|u| SearchResult {
                    url: u.to_string(),
                    title: format!("title of {u}"),
                    snippet: format!("snippet of {u}"),
                    query_text: query.to_string(),
                    query_index: 0,
                    rank: 0,
                })
                .collect())
        }

        fn name(&self) -> &str {
            "stub"
        }
    }

    // --- Stub retriever ---------------------------------------------------

    #[derive(Default)]
    struct StubRetriever {
        failing: HashSet<String>,
        delays_ms: HashMap<String, u64>,
        calls: Mutex<Vec<String>>,
    }

    impl StubRetriever {
        fn fail_on(mut self, url: &str) -> Self {
            self.failing.insert(url.to_string());
            self
        }

        fn fail_all(urls: &[&str]) -> Self {
            Self {
                failing: urls.iter().map(|u| u.to_string()).collect(),
                ..Default::default()
            }
        }

        fn delay(mut self, url: &str, ms: u64) -> Self {
            self.delays_ms.insert(url.to_string(), ms);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WebRetriever for StubRetriever {
        async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
            self.calls.lock().unwrap().push(url.to_string());
            if let Some(ms) = self.delays_ms.get(url) {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            if self.failing.contains(url) {
                return Err(FetchError::Status { status: 500 });
            }
            Ok(FetchedPage {
                title: Some(format!("Page {url}")),
                text: format!("content of {url}"),
            })
        }
    }

    // --- Helpers ------------------------------------------------------------

    fn params(topic: &str, budget: usize, results: usize, urls: usize) -> ResearchParams {
        let config = ResearchConfig {
            max_search_results_per_query: results,
            max_urls_to_scrape_per_cycle: urls,
            ..Default::default()
        };
        config.params(topic, Some(budget))
    }

    fn engine(
        llm: Arc<ScriptedLlm>,
        search: Arc<StubSearch>,
        retriever: Arc<StubRetriever>,
    ) -> ResearchEngine {
        let settings = BrainSettings {
            retry: RetryConfig {
                max_retries: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        ResearchEngine::new(llm, search, retriever, settings)
    }

    fn ok_urls(report: &ResearchReport) -> HashSet<String> {
        report
            .sources
            .iter()
            .filter(|s| s.status == FetchStatus::Ok)
            .map(|s| s.url.clone())
            .collect()
    }

    const GAPS_CLOSED: &str = r#"{"summary": "done", "covered": ["everything"], "gaps": []}"#;

    // --- Properties -----------------------------------------------------------

    #[tokio::test]
    async fn test_cycles_never_exceed_budget() {
        for budget in 1..=4 {
            let llm = Arc::new(ScriptedLlm::default());
            let search = Arc::new(StubSearch::always(&["https://a.example/", "https://b.example/"]));
            let retriever = Arc::new(StubRetriever::default());
            let report = engine(llm, search, retriever)
                .run(&params("solar", budget, 5, 1))
                .await
                .unwrap();
            assert!(report.cycles_used <= budget);
            assert!(matches!(
                report.status,
                SessionStatus::Completed | SessionStatus::Exhausted
            ));
            assert!(report.cycles.iter().zip(1..).all(|(c, i)| c.cycle == i));
        }
    }

    #[tokio::test]
    async fn test_no_url_fetched_twice() {
        // Both queries return the same URL, and later cycles see it again.
        let llm = Arc::new(
            ScriptedLlm::default()
                .plan(r#"["q1", "q2"]"#)
                .plan(r#"["q1", "q3"]"#),
        );
        let search = Arc::new(
            StubSearch::default()
                .on("q1", &["https://shared.example/", "https://one.example/"])
                .on("q2", &["https://SHARED.example/#top", "https://two.example/"])
                .on("q3", &["https://shared.example/", "https://one.example/"]),
        );
        let retriever = Arc::new(StubRetriever::default());
        let report = engine(llm, search, retriever.clone())
            .run(&params("t", 2, 5, 5))
            .await
            .unwrap();

        let urls: Vec<&str> = report.sources.iter().map(|s| s.url.as_str()).collect();
        let unique: HashSet<&str> = urls.iter().copied().collect();
        assert_eq!(urls.len(), unique.len());
        assert_eq!(urls.len(), 3);

        let calls = retriever.calls();
        let unique_calls: HashSet<&String> = calls.iter().collect();
        assert_eq!(calls.len(), unique_calls.len());
        assert_eq!(report.cycles[1].fetched_ok + report.cycles[1].fetched_failed, 0);
    }

    #[tokio::test]
    async fn test_cited_sources_are_ok_sources() {
        let llm = Arc::new(ScriptedLlm::default());
        let search = Arc::new(StubSearch::always(&[
            "https://good.example/",
            "https://bad.example/",
            "https://fine.example/",
        ]));
        let retriever = Arc::new(StubRetriever::default().fail_on("https://bad.example/"));
        let report = engine(llm, search, retriever)
            .run(&params("t", 1, 5, 5))
            .await
            .unwrap();

        let ok = ok_urls(&report);
        assert!(!report.cited_sources.is_empty());
        assert!(report.cited_sources.iter().all(|u| ok.contains(u)));
        assert!(!report.cited_sources.contains(&"https://bad.example/".to_string()));
    }

    #[tokio::test]
    async fn test_all_searches_empty_terminates_exhausted() {
        let llm = Arc::new(ScriptedLlm::default());
        let search = Arc::new(StubSearch::always(&[]));
        let retriever = Arc::new(StubRetriever::default());
        let report = engine(llm.clone(), search, retriever.clone())
            .run(&params("obscure", 10, 5, 5))
            .await
            .unwrap();

        assert_eq!(report.status, SessionStatus::Exhausted);
        assert_eq!(report.stop_reason, Some(StopReason::EmptyCycles));
        assert_eq!(report.cycles_used, 3);
        assert!(report.cited_sources.is_empty());
        assert!(report.sources.is_empty());
        assert!(report.markdown_body.contains("No sources could be retrieved."));
        assert!(retriever.calls().is_empty());
        assert_eq!(llm.assess_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_single_fetch_failure_does_not_block_others() {
        let llm = Arc::new(ScriptedLlm::default().assess(GAPS_CLOSED));
        let search = Arc::new(StubSearch::always(&[
            "https://down.example/",
            "https://up.example/",
        ]));
        let retriever = Arc::new(StubRetriever::default().fail_on("https://down.example/"));
        let report = engine(llm, search, retriever)
            .run(&params("t", 3, 5, 5))
            .await
            .unwrap();

        assert_eq!(report.cited_sources, vec!["https://up.example/".to_string()]);
        assert_eq!(report.cycles[0].fetched_ok, 1);
        assert_eq!(report.cycles[0].fetched_failed, 1);
        let down = report
            .sources
            .iter()
            .find(|s| s.url == "https://down.example/")
            .unwrap();
        assert_eq!(down.status, FetchStatus::Failed("HTTP 500".into()));
    }

    // --- Scenarios ---------------------------------------------------------------

    #[tokio::test]
    async fn test_gaps_closed_after_first_cycle_completes() {
        let topic = "renewable energy storage";
        let llm = Arc::new(
            ScriptedLlm::default()
                .plan(r#"["grid battery storage"]"#)
                .assess(GAPS_CLOSED),
        );
        let search = Arc::new(StubSearch::always(&[
            "https://one.example/",
            "https://two.example/",
            "https://three.example/",
            "https://four.example/",
        ]));
        let retriever = Arc::new(StubRetriever::default());
        let report = engine(llm.clone(), search.clone(), retriever.clone())
            .run(&params(topic, 2, 3, 2))
            .await
            .unwrap();

        assert_eq!(report.status, SessionStatus::Completed);
        assert_eq!(report.stop_reason, Some(StopReason::GapsClosed));
        assert_eq!(report.cycles_used, 1);
        assert!(!report.cycles[0].queries.is_empty());
        assert!(report.sources.len() <= 2);
        assert_eq!(retriever.calls().len(), 2);
        assert_eq!(llm.plan_calls.load(Ordering::SeqCst), 1);
        assert_eq!(search.calls(), vec!["grid battery storage".to_string()]);
        assert!(!report.reduced_confidence);
    }

    #[tokio::test]
    async fn test_planner_failure_falls_back_to_topic() {
        let topic = "ocean acidification";
        let llm = Arc::new(ScriptedLlm::default().plan_error().assess(GAPS_CLOSED));
        let search = Arc::new(StubSearch::always(&["https://a.example/"]));
        let retriever = Arc::new(StubRetriever::default());
        let report = engine(llm, search.clone(), retriever)
            .run(&params(topic, 3, 5, 5))
            .await
            .unwrap();

        assert_eq!(search.calls(), vec![topic.to_string()]);
        assert!(report.cycles[0].planner_fallback);
        assert_eq!(report.cycles[0].queries, vec![topic.to_string()]);
        assert_eq!(report.cited_sources.len(), 1);
    }

    #[tokio::test]
    async fn test_synthesis_failure_is_terminal() {
        let llm = Arc::new(
            ScriptedLlm::default()
                .plan(r#"["q1"]"#)
                .plan(r#"["q2"]"#)
                .report_error(),
        );
        let search = Arc::new(
            StubSearch::default()
                .on("q1", &["https://one.example/"])
                .on("q2", &["https://two.example/"]),
        );
        let retriever = Arc::new(StubRetriever::default());
        let err = engine(llm.clone(), search, retriever)
            .run(&params("t", 2, 5, 5))
            .await
            .unwrap_err();

        assert!(matches!(err, ResearchError::SynthesisUnavailable { .. }));
        assert_eq!(err.stage(), "synthesis");
        assert_eq!(llm.assess_calls.load(Ordering::SeqCst), 2);
        assert_eq!(llm.report_calls.load(Ordering::SeqCst), 1);
    }

    // --- Further behavior -----------------------------------------------------

    #[tokio::test]
    async fn test_every_fetch_failing_is_budget_exhausted() {
        let urls = ["https://x.example/", "https://y.example/"];
        let llm = Arc::new(ScriptedLlm::default().plan(r#"["a"]"#).plan(r#"["b"]"#));
        let search = Arc::new(StubSearch::default().on("a", &[urls[0]]).on("b", &[urls[1]]));
        let retriever = Arc::new(StubRetriever::fail_all(&urls));
        let err = engine(llm.clone(), search, retriever)
            .run(&params("t", 2, 5, 5))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ResearchError::BudgetExhaustedWithNoData {
                cycles: 2,
                attempted: 2
            }
        );
        assert_eq!(llm.report_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_planner_array_without_queries_falls_back_to_topic() {
        let topic = "tidal power";
        let llm = Arc::new(ScriptedLlm::default().plan("[1, 2, 3]").assess(GAPS_CLOSED));
        let search = Arc::new(StubSearch::always(&["https://a.example/"]));
        let retriever = Arc::new(StubRetriever::default());
        let report = engine(llm, search.clone(), retriever)
            .run(&params(topic, 3, 5, 5))
            .await
            .unwrap();

        assert!(report.cycles[0].planner_fallback);
        assert_eq!(search.calls(), vec![topic.to_string()]);
        assert_eq!(report.status, SessionStatus::Completed);
        assert_eq!(report.stop_reason, Some(StopReason::GapsClosed));
        assert_eq!(report.cited_sources.len(), 1);
    }

    #[tokio::test]
    async fn test_assessment_without_gaps_key_keeps_researching() {
        let llm = Arc::new(
            ScriptedLlm::default()
                .plan(r#"["q1"]"#)
                .plan(r#"["q2"]"#)
                .plan(r#"["q3"]"#)
                .assess(r#"{"summary": "x", "open_gaps": ["still missing"]}"#),
        );
        let search = Arc::new(
            StubSearch::default()
                .on("q1", &["https://one.example/"])
                .on("q2", &["https://two.example/"])
                .on("q3", &["https://three.example/"]),
        );
        let retriever = Arc::new(StubRetriever::default());
        let report = engine(llm.clone(), search, retriever)
            .run(&params("t", 3, 5, 5))
            .await
            .unwrap();

        assert!(report.cycles[0].assessment_degraded);
        assert_eq!(report.cycles[0].open_gaps, 1);
        assert!(!report.cycles[1].assessment_degraded);
        assert_eq!(report.cycles_used, 3);
        assert_eq!(report.status, SessionStatus::Exhausted);
        assert_eq!(report.stop_reason, Some(StopReason::BudgetReached));
        assert_eq!(report.cited_sources.len(), 3);
        assert_eq!(llm.assess_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_budget_still_runs_one_cycle_and_finishes() {
        let llm = Arc::new(ScriptedLlm::default());
        let search = Arc::new(StubSearch::always(&["https://a.example/"]));
        let retriever = Arc::new(StubRetriever::default());
        let mut p = params("t", 1, 5, 5);
        p.cycle_budget = 0;
        let report = engine(llm, search, retriever).run(&p).await.unwrap();

        assert_eq!(report.cycles_used, 1);
        assert_eq!(report.status, SessionStatus::Exhausted);
        assert_eq!(report.stop_reason, Some(StopReason::BudgetReached));
    }

    #[tokio::test]
    async fn test_empty_plan_completes_without_search() {
        let llm = Arc::new(ScriptedLlm::default().plan("[]"));
        let search = Arc::new(StubSearch::always(&["https://a.example/"]));
        let retriever = Arc::new(StubRetriever::default());
        let report = engine(llm, search.clone(), retriever)
            .run(&params("t", 3, 5, 5))
            .await
            .unwrap();

        assert_eq!(report.status, SessionStatus::Completed);
        assert_eq!(report.stop_reason, Some(StopReason::NoQueries));
        assert_eq!(report.cycles_used, 1);
        assert!(search.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_query_degrades_to_zero_results() {
        let llm = Arc::new(
            ScriptedLlm::default()
                .plan(r#"["broken", "works"]"#)
                .assess(GAPS_CLOSED),
        );
        let search = Arc::new(
            StubSearch::default()
                .fail_on("broken")
                .on("works", &["https://w.example/"]),
        );
        let retriever = Arc::new(StubRetriever::default());
        let report = engine(llm, search, retriever)
            .run(&params("t", 2, 5, 5))
            .await
            .unwrap();

        assert_eq!(report.cycles[0].failed_searches, 1);
        assert_eq!(report.cited_sources, vec!["https://w.example/".to_string()]);
    }

    #[tokio::test]
    async fn test_fold_order_ignores_fetch_completion_order() {
        let llm = Arc::new(ScriptedLlm::default().assess(GAPS_CLOSED));
        let search = Arc::new(StubSearch::always(&[
            "https://slow.example/",
            "https://fast.example/",
        ]));
        let retriever = Arc::new(StubRetriever::default().delay("https://slow.example/", 50));
        let report = engine(llm, search, retriever)
            .run(&params("t", 1, 5, 5))
            .await
            .unwrap();

        assert_eq!(
            report.cited_sources,
            vec![
                "https://slow.example/".to_string(),
                "https://fast.example/".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_assessment_failure_keeps_gaps_and_continues() {
        let llm = Arc::new(
            ScriptedLlm::default()
                .plan(r#"["q1"]"#)
                .plan(r#"["q2"]"#)
                .assess_error()
                .assess(GAPS_CLOSED),
        );
        let search = Arc::new(
            StubSearch::default()
                .on("q1", &["https://one.example/"])
                .on("q2", &["https://two.example/"]),
        );
        let retriever = Arc::new(StubRetriever::default());
        let report = engine(llm, search, retriever)
            .run(&params("t", 3, 5, 5))
            .await
            .unwrap();

        assert!(report.cycles[0].assessment_degraded);
        assert_eq!(report.cycles[0].open_gaps, 1);
        assert_eq!(report.cycles_used, 2);
        assert_eq!(report.status, SessionStatus::Completed);
        assert_eq!(report.cited_sources.len(), 2);
    }

    #[tokio::test]
    async fn test_unproductive_cycle_reduces_confidence() {
        // Cycle 2 only finds the URL cycle 1 already read.
        let llm = Arc::new(ScriptedLlm::default().plan(r#"["q1"]"#).plan(r#"["q2"]"#));
        let search = Arc::new(
            StubSearch::default()
                .on("q1", &["https://one.example/"])
                .on("q2", &["https://one.example/"]),
        );
        let retriever = Arc::new(StubRetriever::default());
        let report = engine(llm, search, retriever)
            .run(&params("t", 2, 5, 5))
            .await
            .unwrap();

        assert_eq!(report.status, SessionStatus::Exhausted);
        assert!(report.reduced_confidence);
        assert_eq!(report.notes.len(), 1);
        assert!(report.notes[0].starts_with("Cycle 2"));
        assert!(report.markdown_body.starts_with("> **Note:** reduced confidence."));
    }

    #[tokio::test]
    async fn test_deadline_discards_inflight_cycle() {
        let llm = Arc::new(ScriptedLlm::default());
        let search = Arc::new(StubSearch::always(&["https://slow.example/"]));
        let retriever = Arc::new(StubRetriever::default().delay("https://slow.example/", 5_000));
        let mut p = params("t", 3, 5, 5);
        p.max_duration = Some(Duration::from_millis(50));
        p.fetch_timeout = Duration::from_secs(10);

        let report = engine(llm, search, retriever).run(&p).await.unwrap();
        assert_eq!(report.status, SessionStatus::Exhausted);
        assert_eq!(report.stop_reason, Some(StopReason::Deadline));
        assert_eq!(report.cycles_used, 1);
        assert!(report.sources.is_empty());
        assert!(report.cycles.is_empty());
        assert!(report.reduced_confidence);
    }

    #[tokio::test]
    async fn test_fetch_timeout_is_recorded_as_failure() {
        let llm = Arc::new(ScriptedLlm::default().assess(GAPS_CLOSED));
        let search = Arc::new(StubSearch::always(&[
            "https://hang.example/",
            "https://ok.example/",
        ]));
        let retriever = Arc::new(StubRetriever::default().delay("https://hang.example/", 5_000));
        let mut p = params("t", 1, 5, 5);
        p.fetch_timeout = Duration::from_millis(30);

        let report = engine(llm, search, retriever).run(&p).await.unwrap();
        let hang = report
            .sources
            .iter()
            .find(|s| s.url == "https://hang.example/")
            .unwrap();
        assert_eq!(hang.status, FetchStatus::Failed("timeout".into()));
        assert_eq!(report.cited_sources, vec!["https://ok.example/".to_string()]);
    }

    #[tokio::test]
    async fn test_callback_observes_cycles() {
        #[derive(Default)]
        struct Recorder {
            events: Mutex<Vec<String>>,
        }

        impl ResearchCallback for Recorder {
            fn on_cycle_start(&self, cycle: usize, _budget: usize) {
                self.events.lock().unwrap().push(format!("start {cycle}"));
            }
            fn on_queries_planned(&self, _cycle: usize, queries: &[Query], _fallback: bool) {
                self.events
                    .lock()
                    .unwrap()
                    .push(format!("planned {}", queries.len()));
            }
            fn on_search_complete(&self, query: &str, results: usize) {
                self.events
                    .lock()
                    .unwrap()
                    .push(format!("search {query} {results}"));
            }
            fn on_fetch_complete(&self, url: &str, status: &FetchStatus) {
                self.events
                    .lock()
                    .unwrap()
                    .push(format!("fetch {url} {}", status.is_ok()));
            }
            fn on_cycle_complete(&self, summary: &CycleSummary) {
                self.events
                    .lock()
                    .unwrap()
                    .push(format!("end {}", summary.cycle));
            }
            fn on_synthesis_start(&self, sources: usize) {
                self.events
                    .lock()
                    .unwrap()
                    .push(format!("synthesis {sources}"));
            }
        }

        let recorder = Arc::new(Recorder::default());
        let llm = Arc::new(ScriptedLlm::default().plan(r#"["q"]"#).assess(GAPS_CLOSED));
        let search = Arc::new(StubSearch::always(&["https://a.example/"]));
        let retriever = Arc::new(StubRetriever::default());
        engine(llm, search, retriever)
            .with_callback(recorder.clone())
            .run(&params("t", 2, 5, 5))
            .await
            .unwrap();

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec![
                "start 1".to_string(),
                "planned 1".to_string(),
                "search q 1".to_string(),
                "fetch https://a.example/ true".to_string(),
                "end 1".to_string(),
                "synthesis 1".to_string(),
            ]
        );
    }
}
