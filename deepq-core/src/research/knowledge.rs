//! Knowledge accumulator.
//!
//! [`KnowledgeState`] is an immutable snapshot: folding a cycle's records
//! produces a new state and leaves the old one intact, so a failed
//! assessment can fall back to the previous coverage without rollback.

use crate::brain::Brain;
use crate::error::ResearchError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::prompts;
use super::sources::SourceRecord;

/// Text taken from one successfully fetched source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Excerpt {
    pub url: String,
    pub title: String,
    pub cycle: usize,
    pub text: String,
}

/// What has been learned so far.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KnowledgeState {
    /// Append-only, in fold order.
    pub excerpts: Vec<Excerpt>,
    pub covered_subtopics: BTreeSet<String>,
    pub open_gaps: BTreeSet<String>,
    /// Running summary written by the assessment step.
    pub summary: String,
}

impl KnowledgeState {
    /// Initial state: the topic itself is the only open gap.
    pub fn new(topic: &str) -> Self {
        Self {
            open_gaps: BTreeSet::from([topic.trim().to_string()]),
            ..Default::default()
        }
    }

    pub fn has_open_gaps(&self) -> bool {
        !self.open_gaps.is_empty()
    }

    pub fn open_gaps_vec(&self) -> Vec<String> {
        self.open_gaps.iter().cloned().collect()
    }

    pub fn contains_source(&self, url: &str) -> bool {
        self.excerpts.iter().any(|e| e.url == url)
    }
}

/// Append the excerpts of `records` that fetched successfully, keeping
/// coverage, gaps, and summary unchanged.
pub fn fold_excerpts(state: &KnowledgeState, records: &[SourceRecord]) -> KnowledgeState {
    let mut next = state.clone();
    for record in records.iter().filter(|r| r.is_ok()) {
        if next.contains_source(&record.url) {
            continue;
        }
        next.excerpts.push(Excerpt {
            url: record.url.clone(),
            title: record.display_title().to_string(),
            cycle: record.fetched_at_cycle,
            text: record.extracted_text.clone(),
        });
    }
    next
}

/// `gaps` is required: an answer without it says nothing about coverage.
#[derive(Debug, Deserialize)]
struct Assessment {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    covered: Vec<String>,
    gaps: Vec<String>,
}

fn parse_assessment(raw: &str) -> Option<Assessment> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&raw[start..=end]).ok()
}

fn label_set(labels: Vec<String>) -> BTreeSet<String> {
    labels
        .into_iter()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
        .collect()
}

/// Folds cycle results into knowledge and reassesses coverage.
pub struct KnowledgeAccumulator {
    brain: Arc<Brain>,
}

impl KnowledgeAccumulator {
    pub fn new(brain: Arc<Brain>) -> Self {
        Self { brain }
    }

    /// Append `new_records` and recompute coverage and gaps with the model.
    ///
    /// `snippets` are the cycle's search snippets; they inform the
    /// assessment but are not stored. Fails with `PlanningUnavailable` when
    /// the model errors or its answer does not parse; callers fall back to
    /// [`fold_excerpts`].
    pub async fn fold(
        &self,
        topic: &str,
        state: &KnowledgeState,
        new_records: &[SourceRecord],
        snippets: &[String],
    ) -> Result<KnowledgeState, ResearchError> {
        let mut next = fold_excerpts(state, new_records);
        let prompt = prompts::assessment_prompt(topic, &state.summary, &next.excerpts, snippets);

        let raw = self
            .brain
            .ask(prompts::ASSESSMENT_SYSTEM, &prompt)
            .await
            .map_err(|e| ResearchError::PlanningUnavailable {
                reason: format!("gap assessment failed: {e}"),
            })?;

        let assessment = parse_assessment(&raw).ok_or_else(|| {
            warn!(response = %raw.chars().take(200).collect::<String>(), "Unparsable assessment");
            ResearchError::PlanningUnavailable {
                reason: "gap assessment was not a JSON object".to_string(),
            }
        })?;

        if !assessment.summary.trim().is_empty() {
            next.summary = assessment.summary.trim().to_string();
        }
        next.covered_subtopics = label_set(assessment.covered);
        next.open_gaps = label_set(assessment.gaps);

        debug!(
            excerpts = next.excerpts.len(),
            covered = next.covered_subtopics.len(),
            open_gaps = next.open_gaps.len(),
            "Knowledge folded"
        );
        Ok(next)
    }
}
