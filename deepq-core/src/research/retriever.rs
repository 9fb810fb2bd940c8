//! Web retriever: fetch a page and reduce it to readable text.
//!
//! [`WebRetriever`] implementations may fail; [`retrieve`] wraps one call
//! with a timeout and turns every outcome into a [`SourceRecord`], so a bad
//! URL never escapes the cycle that attempted it.

use crate::config::FetchConfig;
use crate::error::FetchError;
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, HeaderMap, HeaderValue};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

use super::sources::SourceRecord;

/// A fetched page, before truncation.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    pub title: Option<String>,
    pub text: String,
}

/// Fetches a URL and extracts its readable text.
#[async_trait]
pub trait WebRetriever: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

/// Fetch `url` for `cycle`, bounded by `timeout`, and record the outcome.
///
/// Never fails: errors and timeouts become `FetchStatus::Failed`. Extracted
/// text is cut to `max_chars` characters.
pub async fn retrieve(
    retriever: &dyn WebRetriever,
    url: &str,
    cycle: usize,
    timeout: Duration,
    max_chars: usize,
) -> SourceRecord {
    match tokio::time::timeout(timeout, retriever.fetch(url)).await {
        Err(_) => SourceRecord::failed(url, cycle, FetchError::Timeout.to_string()),
        Ok(Err(e)) => SourceRecord::failed(url, cycle, e.to_string()),
        Ok(Ok(page)) => {
            let text = truncate_chars(page.text.trim(), max_chars);
            if text.is_empty() {
                SourceRecord::failed(url, cycle, FetchError::EmptyContent.to_string())
            } else {
                SourceRecord::ok(url, cycle, page.title, text)
            }
        }
    }
}

/// reqwest-backed retriever with browser-like headers.
pub struct HttpRetriever {
    client: Client,
}

impl HttpRetriever {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,text/plain;q=0.8,*/*;q=0.5",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| FetchError::Request {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self { client })
    }
}

#[async_trait]
impl WebRetriever for HttpRetriever {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(FetchError::InvalidUrl {
                url: url.to_string(),
            });
        }

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Request {
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/html")
            .to_lowercase();

        let is_html = content_type.contains("html") || content_type.contains("xml");
        let is_text = content_type.starts_with("text/") || content_type.contains("json");
        if !is_html && !is_text {
            return Err(FetchError::UnsupportedContent { content_type });
        }

        let body = response.text().await.map_err(|e| FetchError::Request {
            message: format!("Failed to read response body: {}", e),
        })?;
        debug!(url, bytes = body.len(), content_type = %content_type, "Fetched page");

        if is_html {
            Ok(FetchedPage {
                title: extract_title(&body),
                text: extract_text_from_html(&body),
            })
        } else {
            Ok(FetchedPage {
                title: None,
                text: collapse_lines(&body),
            })
        }
    }
}

/// Elements whose whole subtree is dropped.
const SKIPPED_ELEMENTS: &[&str] = &[
    "head", "title", "script", "style", "nav", "header", "footer", "noscript", "svg", "template",
];

const BLOCK_ELEMENTS: &[&str] = &[
    "p", "br", "div", "section", "article", "main", "aside", "h1", "h2", "h3", "h4", "h5", "h6",
    "li", "ul", "ol", "tr", "td", "th", "table", "blockquote", "pre", "hr", "dt", "dd",
];

/// HTML-to-text extraction.
///
/// Drops tags, the contents of [`SKIPPED_ELEMENTS`], and comments; breaks
/// lines at block elements; decodes common entities; trims every line and
/// drops blank ones.
pub fn extract_text_from_html(html: &str) -> String {
    let mut text = String::new();
    let mut in_tag = false;
    let mut in_comment = false;
    let mut building_tag = false;
    let mut tag_name = String::new();
    let mut skip_depth = 0usize;
    let mut last_tag_char = ' ';
    let mut chars = html.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_comment {
            if ch == '-' && chars.peek() == Some(&'-') {
                chars.next();
                if chars.peek() == Some(&'>') {
                    chars.next();
                    in_comment = false;
                }
            }
            continue;
        }
        if ch == '<' {
            in_tag = true;
            building_tag = true;
            tag_name.clear();
            last_tag_char = ' ';
            continue;
        }
        if in_tag {
            if ch == '>' {
                in_tag = false;
                building_tag = false;
                let tag = tag_name.to_lowercase();
                let (closing, name) = match tag.strip_prefix('/') {
                    Some(name) => (true, name),
                    None => (false, tag.as_str()),
                };
                // <svg ... /> opens nothing.
                let self_closing = last_tag_char == '/';

                if SKIPPED_ELEMENTS.contains(&name) {
                    if closing {
                        skip_depth = skip_depth.saturating_sub(1);
                    } else if !self_closing {
                        skip_depth += 1;
                    }
                } else if skip_depth == 0 && BLOCK_ELEMENTS.contains(&name) {
                    text.push('\n');
                }
                continue;
            }
            last_tag_char = ch;
            if building_tag {
                if tag_name.is_empty() && ch == '!' && chars.peek() == Some(&'-') {
                    // "<!--"
                    chars.next();
                    if chars.peek() == Some(&'-') {
                        chars.next();
                    }
                    in_tag = false;
                    in_comment = true;
                } else if ch.is_alphanumeric() || (ch == '/' && tag_name.is_empty()) {
                    tag_name.push(ch);
                } else {
                    building_tag = false;
                }
            }
            continue;
        }
        if skip_depth > 0 {
            continue;
        }
        text.push(ch);
    }

    collapse_lines(&decode_entities(&text))
}

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid regex"));

static NUMERIC_ENTITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&#(x[0-9a-fA-F]+|[0-9]+);").expect("valid regex"));

/// Text of the first `<title>` element, if any.
pub fn extract_title(html: &str) -> Option<String> {
    let raw = TITLE_RE.captures(html)?.get(1)?.as_str();
    let title = decode_entities(raw)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    (!title.is_empty()).then_some(title)
}

fn decode_entities(text: &str) -> String {
    let text = text
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ")
        .replace("&mdash;", "-")
        .replace("&ndash;", "-");

    let text = NUMERIC_ENTITY_RE
        .replace_all(&text, |caps: &regex::Captures<'_>| {
            let code = &caps[1];
            let value = match code.strip_prefix('x') {
                Some(hex) => u32::from_str_radix(hex, 16).ok(),
                None => code.parse::<u32>().ok(),
            };
            value
                .and_then(char::from_u32)
                .map(String::from)
                .unwrap_or_default()
        })
        .into_owned();

    // Last, so "&amp;lt;" stays "&lt;".
    text.replace("&amp;", "&")
}

/// Trim each line, collapse inner whitespace runs, drop empty lines.
fn collapse_lines(text: &str) -> String {
    text.lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// The first `max_chars` characters of `text`.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
