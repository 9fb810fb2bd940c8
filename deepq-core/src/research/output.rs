//! The research report and its Markdown/JSON renderings.

use super::session::{CycleSummary, SessionStatus, StopReason};
use super::sources::{FetchStatus, SourceRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;

/// Provenance of one attempted source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub cycle: usize,
    pub status: FetchStatus,
}

impl From<&SourceRecord> for SourceEntry {
    fn from(record: &SourceRecord) -> Self {
        Self {
            url: record.url.clone(),
            title: record.title.clone(),
            cycle: record.fetched_at_cycle,
            status: record.fetch_status.clone(),
        }
    }
}

/// Final output of a research run. Produced once, never modified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchReport {
    pub topic: String,
    pub markdown_body: String,
    /// URLs cited in the body, all fetched successfully.
    pub cited_sources: Vec<String>,
    pub cycles_used: usize,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    /// Some cycle added no readable source.
    pub reduced_confidence: bool,
    #[serde(default)]
    pub notes: Vec<String>,
    /// Every attempted URL, in attempt order.
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
    #[serde(default)]
    pub cycles: Vec<CycleSummary>,
    #[serde(default)]
    pub summary: String,
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub model: String,
}

impl ResearchReport {
    pub fn ok_source_count(&self) -> usize {
        self.sources.iter().filter(|s| s.status.is_ok()).count()
    }

    /// Write the Markdown body to `path` atomically.
    pub fn save_markdown(&self, path: &Path) -> std::io::Result<()> {
        atomic_write(path, self.markdown_body.as_bytes())
    }

    /// Write the whole report as pretty JSON to `path` atomically.
    pub fn save_json(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        atomic_write(path, &json)
    }
}

/// Assembles the final Markdown document around the model-written body.
pub struct ReportGenerator;

impl ReportGenerator {
    /// Title line, optional reduced-confidence note, body, then a sources
    /// section listing `cited` in order.
    pub fn compose(topic: &str, body: &str, cited: &[&SourceRecord], notes: &[String]) -> String {
        let body = strip_trailing_sources(body.trim());
        let mut out = String::new();

        if !body.starts_with("# ") {
            let _ = write!(out, "# Research Report: {topic}\n\n");
        }

        if !notes.is_empty() {
            out.push_str("> **Note:** reduced confidence.\n");
            for note in notes {
                let _ = writeln!(out, "> - {note}");
            }
            out.push('\n');
        }

        out.push_str(body);
        out.push_str("\n\n## Sources\n\n");
        if cited.is_empty() {
            out.push_str("No sources could be retrieved.\n");
        } else {
            for (i, source) in cited.iter().enumerate() {
                let _ = writeln!(out, "{}. [{}]({})", i + 1, source.display_title(), source.url);
            }
        }
        out
    }

    /// Short plain-text digest for terminals.
    pub fn digest(report: &ResearchReport) -> String {
        format!(
            "{} | status: {} | cycles: {} | sources: {} ok / {} attempted{}",
            report.topic,
            report.status,
            report.cycles_used,
            report.ok_source_count(),
            report.sources.len(),
            if report.reduced_confidence {
                " | reduced confidence"
            } else {
                ""
            }
        )
    }
}

/// Drop a "Sources"/"References" section the model wrote despite being
/// told not to, so only the generated list remains.
fn strip_trailing_sources(body: &str) -> &str {
    for heading in ["\n## Sources", "\n## References", "\n### Sources", "\n### References"] {
        if let Some(idx) = body.rfind(heading) {
            return body[..idx].trim_end();
        }
    }
    body
}

/// Write `data` to a temporary sibling, then rename over `path`.
pub fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    });
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}
