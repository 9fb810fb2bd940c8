//! Synthesizer: writes the final report from accumulated knowledge.

use crate::brain::Brain;
use crate::error::ResearchError;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use super::knowledge::KnowledgeState;
use super::output::{ReportGenerator, ResearchReport, SourceEntry};
use super::prompts;
use super::session::{CycleSummary, SessionStatus, StopReason};
use super::sources::{SourceRecord, SourceRegistry};

/// Run-level facts the report carries alongside the body.
#[derive(Debug, Clone)]
pub struct ReportContext {
    pub cycles_used: usize,
    pub status: SessionStatus,
    pub stop_reason: Option<StopReason>,
    pub reduced_confidence: bool,
    pub notes: Vec<String>,
    pub cycles: Vec<CycleSummary>,
}

pub struct Synthesizer {
    brain: Arc<Brain>,
}

impl Synthesizer {
    pub fn new(brain: Arc<Brain>) -> Self {
        Self { brain }
    }

    /// Produce the report for `topic`.
    ///
    /// Cited sources are exactly the excerpted ones, so every citation was
    /// fetched successfully. With no excerpts and no summary there is
    /// nothing to write about, and a source-less report is returned without
    /// calling the model. A model error or timeout is
    /// `SynthesisUnavailable`.
    pub async fn synthesize(
        &self,
        topic: &str,
        state: &KnowledgeState,
        registry: &SourceRegistry,
        context: ReportContext,
    ) -> Result<ResearchReport, ResearchError> {
        let cited: Vec<&SourceRecord> = state
            .excerpts
            .iter()
            .filter_map(|e| registry.get(&e.url))
            .filter(|r| r.is_ok())
            .collect();

        let body = if state.excerpts.is_empty() && state.summary.trim().is_empty() {
            info!(topic, "No material gathered; writing empty-source report");
            format!(
                "# Research Report: {topic}\n\nNo sources could be found for this topic within \
                 the research budget ({} cycle(s)). Try a broader topic, another search provider, \
                 or more cycles.",
                context.cycles_used
            )
        } else {
            let prompt = prompts::report_prompt(
                topic,
                &state.summary,
                &state.excerpts,
                context.cycles_used,
                cited.len(),
            );
            self.brain
                .ask(prompts::REPORT_SYSTEM, &prompt)
                .await
                .map_err(|e| ResearchError::SynthesisUnavailable {
                    reason: e.to_string(),
                })?
        };

        if body.trim().is_empty() {
            return Err(ResearchError::SynthesisUnavailable {
                reason: "model returned an empty report".to_string(),
            });
        }

        let notes = if context.reduced_confidence {
            context.notes.clone()
        } else {
            Vec::new()
        };
        let markdown_body = ReportGenerator::compose(topic, &body, &cited, &notes);

        Ok(ResearchReport {
            topic: topic.to_string(),
            markdown_body,
            cited_sources: cited.iter().map(|r| r.url.clone()).collect(),
            cycles_used: context.cycles_used,
            status: context.status,
            stop_reason: context.stop_reason,
            reduced_confidence: context.reduced_confidence,
            notes: context.notes,
            sources: registry.records().iter().map(SourceEntry::from).collect(),
            cycles: context.cycles,
            summary: state.summary.clone(),
            generated_at: Utc::now(),
            model: self.brain.model_name().to_string(),
        })
    }
}
