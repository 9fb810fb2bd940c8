//! Prompt templates for planning, gap assessment, and report writing.

use super::knowledge::Excerpt;
use std::fmt::Write;

/// Upper bound on excerpt text placed in a single prompt.
pub const MAX_PROMPT_EXCERPT_CHARS: usize = 60_000;

pub const PLANNER_SYSTEM: &str = "You are a research assistant who writes web search queries. \
You answer with a JSON array of strings and nothing else.";

pub const ASSESSMENT_SYSTEM: &str = "You are a research assistant who reviews collected source \
excerpts and judges what is known and what is still missing. You answer with a single JSON \
object and nothing else.";

pub const REPORT_SYSTEM: &str = "You are a research analyst who writes clear, well-structured \
Markdown reports grounded only in the material provided.";

/// Prompt asking for the next cycle's search queries.
pub fn planner_prompt(
    topic: &str,
    open_gaps: &[String],
    summary: &str,
    cycle: usize,
    max_queries: usize,
) -> String {
    let mut prompt = format!("TOPIC: {topic}\nRESEARCH CYCLE: {cycle}\n\n");

    if summary.trim().is_empty() {
        prompt.push_str("Nothing has been researched yet.\n\n");
    } else {
        let _ = write!(prompt, "Current research summary:\n{}\n\n", summary.trim());
    }

    prompt.push_str("Open questions that still need sources:\n");
    for gap in open_gaps {
        let _ = writeln!(prompt, "- {gap}");
    }

    let _ = write!(
        prompt,
        "\nWrite at most {max_queries} web search queries that would find sources for the \
         open questions above. Use keywords, not questions. Each query must be different. \
         If nothing is left to research, return an empty array.\n\n\
         Respond with ONLY a JSON array of strings, for example:\n\
         [\"grid scale battery storage cost 2024\", \"pumped hydro capacity worldwide\"]"
    );
    prompt
}

/// Prompt asking for an updated summary and coverage assessment.
pub fn assessment_prompt(
    topic: &str,
    previous_summary: &str,
    excerpts: &[Excerpt],
    snippets: &[String],
) -> String {
    let mut prompt = format!("TOPIC: {topic}\n\n");

    if !previous_summary.trim().is_empty() {
        let _ = write!(
            prompt,
            "Summary so far:\n{}\n\n",
            previous_summary.trim()
        );
    }

    prompt.push_str("Source excerpts collected so far:\n\n");
    push_excerpts(&mut prompt, excerpts);

    if !snippets.is_empty() {
        prompt.push_str("\nSearch snippets from this cycle (not yet read in full):\n");
        for snippet in snippets {
            let _ = writeln!(prompt, "- {snippet}");
        }
    }

    prompt.push_str(
        "\nUpdate the research summary so it integrates every excerpt, keeping concrete \
         figures, dates, and names. Then list the subtopics that are now adequately covered \
         and the subtopics that still need sources. Use an empty gaps list when the topic is \
         covered well enough for a report.\n\n\
         Respond with ONLY this JSON object:\n\
         {\"summary\": \"...\", \"covered\": [\"...\"], \"gaps\": [\"...\"]}",
    );
    prompt
}

/// Prompt asking for the final Markdown report.
pub fn report_prompt(
    topic: &str,
    summary: &str,
    excerpts: &[Excerpt],
    cycles_used: usize,
    sources_count: usize,
) -> String {
    let mut prompt = format!("TOPIC: {topic}\n\n");

    if !summary.trim().is_empty() {
        let _ = write!(prompt, "Research summary:\n{}\n\n", summary.trim());
    }

    if excerpts.is_empty() {
        prompt.push_str("No source could be read. Base the report on the summary only and say so.\n\n");
    } else {
        prompt.push_str("Source excerpts:\n\n");
        push_excerpts(&mut prompt, excerpts);
    }

    let _ = write!(
        prompt,
        "\nResearch details:\n- Cycles completed: {cycles_used}\n- Sources analyzed: {sources_count}\n\n\
         Write a comprehensive research report in Markdown with:\n\
         1. An introduction explaining the topic and its significance\n\
         2. Main sections covering the key aspects of the topic\n\
         3. A conclusion summarizing the findings and open questions\n\n\
         Cite sources inline as [Source Title]. Do not write a sources or references \
         section; it is appended automatically."
    );
    prompt
}

fn push_excerpts(prompt: &mut String, excerpts: &[Excerpt]) {
    let mut budget = MAX_PROMPT_EXCERPT_CHARS;
    for (i, excerpt) in excerpts.iter().enumerate() {
        if budget == 0 {
            let _ = writeln!(prompt, "[{} more excerpt(s) omitted]", excerpts.len() - i);
            break;
        }
        let text: String = excerpt.text.chars().take(budget).collect();
        budget = budget.saturating_sub(text.chars().count());
        let _ = write!(
            prompt,
            "[{}] {} ({})\n{}\n\n",
            i + 1,
            excerpt.title,
            excerpt.url,
            text
        );
    }
}
