//! Query planner: asks the model what to search for next.

use crate::brain::Brain;
use crate::error::ResearchError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

use super::prompts;

/// A search query planned for one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    pub cycle_index: usize,
}

impl Query {
    pub fn new(text: impl Into<String>, cycle_index: usize) -> Self {
        Self {
            text: text.into(),
            cycle_index,
        }
    }
}

/// Produces the next cycle's queries from the topic and open gaps.
pub struct QueryPlanner {
    brain: Arc<Brain>,
}

impl QueryPlanner {
    pub fn new(brain: Arc<Brain>) -> Self {
        Self { brain }
    }

    /// Plan up to `max_queries` distinct queries for `cycle`.
    ///
    /// An empty result means the model judged nothing is left to search.
    /// Model errors, timeouts, and unparsable answers are
    /// `PlanningUnavailable`.
    pub async fn plan(
        &self,
        topic: &str,
        open_gaps: &[String],
        summary: &str,
        cycle: usize,
        max_queries: usize,
    ) -> Result<Vec<Query>, ResearchError> {
        let max_queries = max_queries.max(1);
        let prompt = prompts::planner_prompt(topic, open_gaps, summary, cycle, max_queries);

        let raw = self
            .brain
            .ask(prompts::PLANNER_SYSTEM, &prompt)
            .await
            .map_err(|e| ResearchError::PlanningUnavailable {
                reason: e.to_string(),
            })?;

        let texts = parse_queries(&raw, max_queries).ok_or_else(|| {
            warn!(cycle, response = %raw.chars().take(200).collect::<String>(), "Unparsable planner output");
            ResearchError::PlanningUnavailable {
                reason: "planner output was not a JSON array of queries".to_string(),
            }
        })?;

        debug!(cycle, count = texts.len(), "Planner produced queries");
        Ok(texts
            .into_iter()
            .map(|text| Query::new(text, cycle))
            .collect())
    }
}

static THINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<think>.*?(</think>|$)").expect("valid regex"));

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));

/// Remove reasoning blocks and markup from model-written query text and
/// collapse whitespace.
pub fn clean_query(raw: &str) -> String {
    let text = THINK_RE.replace_all(raw, " ");
    let text = TAG_RE.replace_all(&text, " ");
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`')
        .trim()
        .to_string()
}

/// Extract up to `max` distinct queries from a model answer.
///
/// Accepts the first `[...]` span in the answer; items may be strings or
/// objects with a `query` field. An empty array is a valid answer meaning
/// nothing is left to search. Returns `None` when no array parses or when
/// the array has items but none of them is a usable query.
pub fn parse_queries(raw: &str, max: usize) -> Option<Vec<String>> {
    let without_think = THINK_RE.replace_all(raw, " ");
    let start = without_think.find('[')?;
    let end = without_think.rfind(']')?;
    if end < start {
        return None;
    }
    let items: Vec<Value> = serde_json::from_str(&without_think[start..=end]).ok()?;
    if items.is_empty() {
        return Some(Vec::new());
    }

    let mut seen = HashSet::new();
    let queries: Vec<String> = items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.as_str()),
            Value::Object(map) => map.get("query").and_then(|q| q.as_str()),
            _ => None,
        })
        .map(clean_query)
        .filter(|q| !q.is_empty())
        .filter(|q| seen.insert(q.to_lowercase()))
        .take(max)
        .collect();
    (!queries.is_empty()).then_some(queries)
}
