//! Source registry: every URL attempted during a run, exactly once.
//!
//! URLs are compared after [`normalize_url`], so `https://Example.com/a/`
//! and `https://example.com/a#intro` are the same source.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

/// Outcome of fetching a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Ok,
    Failed(String),
}

impl FetchStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, FetchStatus::Ok)
    }
}

/// One attempted URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Normalized URL.
    pub url: String,
    pub fetched_at_cycle: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Readable text, already truncated. Empty for failed fetches.
    #[serde(default)]
    pub extracted_text: String,
    pub fetch_status: FetchStatus,
}

impl SourceRecord {
    pub fn ok(
        url: impl Into<String>,
        cycle: usize,
        title: Option<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            fetched_at_cycle: cycle,
            title,
            extracted_text: text.into(),
            fetch_status: FetchStatus::Ok,
        }
    }

    pub fn failed(url: impl Into<String>, cycle: usize, reason: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            fetched_at_cycle: cycle,
            title: None,
            extracted_text: String::new(),
            fetch_status: FetchStatus::Failed(reason.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.fetch_status.is_ok()
    }

    /// Title if known, otherwise the URL.
    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(&self.url)
    }
}

/// Normalize a URL for identity comparison.
///
/// Only `http` and `https` URLs are accepted. Scheme and host are lowercased,
/// default ports dropped, the fragment removed, `utm_*` tracking parameters
/// removed, and a trailing slash on a non-root path stripped.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }

    url.set_fragment(None);

    if url.query().is_some() {
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| !k.starts_with("utm_"))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(kept);
        }
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    Some(url.to_string())
}

/// Registry of attempted sources, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    records: Vec<SourceRecord>,
    index: HashMap<String, usize>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `url` (normalized or not) has already been attempted.
    pub fn contains(&self, url: &str) -> bool {
        let key = normalize_url(url).unwrap_or_else(|| url.to_string());
        self.index.contains_key(&key)
    }

    /// Insert a record. Returns `false` and leaves the registry untouched if
    /// its URL is already present.
    pub fn insert(&mut self, mut record: SourceRecord) -> bool {
        let key = normalize_url(&record.url).unwrap_or_else(|| record.url.clone());
        if self.index.contains_key(&key) {
            return false;
        }
        record.url = key.clone();
        self.index.insert(key, self.records.len());
        self.records.push(record);
        true
    }

    pub fn get(&self, url: &str) -> Option<&SourceRecord> {
        let key = normalize_url(url).unwrap_or_else(|| url.to_string());
        self.index.get(&key).map(|&i| &self.records[i])
    }

    pub fn records(&self) -> &[SourceRecord] {
        &self.records
    }

    /// Successfully fetched records, in insertion order.
    pub fn ok_records(&self) -> impl Iterator<Item = &SourceRecord> {
        self.records.iter().filter(|r| r.is_ok())
    }

    pub fn ok_count(&self) -> usize {
        self.ok_records().count()
    }

    pub fn failed_count(&self) -> usize {
        self.records.len() - self.ok_count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
