//! Search gateway: query text in, ranked candidate URLs out.
//!
//! Two providers are built in: Tavily (keyed, the default) and the keyless
//! DuckDuckGo instant-answer API. [`merge_results`] turns one cycle's
//! per-query result lists into a single deterministic candidate list.

use crate::config::SearchConfig;
use crate::error::SearchError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::sources::normalize_url;

const TAVILY_BASE_URL: &str = "https://api.tavily.com";
const DUCKDUCKGO_BASE_URL: &str = "https://api.duckduckgo.com";

/// One candidate page returned for a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub url: String,
    pub title: String,
    pub snippet: String,
    /// The query that produced this result.
    pub query_text: String,
    /// Position of that query in the cycle's plan.
    #[serde(default)]
    pub query_index: usize,
    /// Position in the provider's own ranking, 0-based.
    #[serde(default)]
    pub rank: usize,
}

/// A web search provider.
#[async_trait]
pub trait SearchGateway: Send + Sync {
    /// Return at most `limit` results for `query`, best first.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, SearchError>;

    /// Provider name for logs.
    fn name(&self) -> &str;
}

/// Merge one cycle's per-query result lists.
///
/// `per_query[i]` holds the results of the i-th planned query. Results are
/// ordered by (query position, provider rank, URL), URLs are normalized, and
/// a URL seen earlier in that order wins over later duplicates. Results with
/// unusable URLs are dropped.
pub fn merge_results(per_query: Vec<Vec<SearchResult>>) -> Vec<SearchResult> {
    let mut all: Vec<SearchResult> = per_query
        .into_iter()
        .enumerate()
        .flat_map(|(query_index, results)| {
            results
                .into_iter()
                .enumerate()
                .filter_map(move |(rank, mut result)| {
                    result.url = normalize_url(&result.url)?;
                    result.query_index = query_index;
                    result.rank = rank;
                    Some(result)
                })
        })
        .collect();

    all.sort_by(|a, b| {
        (a.query_index, a.rank, &a.url).cmp(&(b.query_index, b.rank, &b.url))
    });

    let mut seen = HashSet::new();
    all.retain(|r| seen.insert(r.url.clone()));
    all
}

fn build_client(provider: &str, timeout: Duration) -> Result<Client, SearchError> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("deepq/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| SearchError::Request {
            provider: provider.to_string(),
            message: format!("Failed to create HTTP client: {}", e),
        })
}

fn request_error(provider: &str, e: reqwest::Error) -> SearchError {
    SearchError::Request {
        provider: provider.to_string(),
        message: e.to_string(),
    }
}

/// Tavily search API.
pub struct TavilySearch {
    client: Client,
    base_url: String,
    api_key: String,
    search_depth: String,
}

impl TavilySearch {
    pub fn new(config: &SearchConfig, timeout: Duration) -> Result<Self, SearchError> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| SearchError::MissingApiKey {
                provider: "tavily".into(),
                env_var: config.api_key_env.clone(),
            })?;
        Ok(Self {
            client: build_client("tavily", timeout)?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| TAVILY_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            search_depth: config.search_depth.clone(),
        })
    }

    fn parse_response(body: &Value, query: &str, limit: usize) -> Vec<SearchResult> {
        body.get("results")
            .and_then(|r| r.as_array())
            .map(|results| {
                results
                    .iter()
                    .filter_map(|r| {
                        let url = r.get("url")?.as_str()?.trim();
                        if url.is_empty() {
                            return None;
                        }
                        Some(SearchResult {
                            url: url.to_string(),
                            title: r
                                .get("title")
                                .and_then(|t| t.as_str())
                                .unwrap_or("")
                                .to_string(),
                            snippet: r
                                .get("content")
                                .and_then(|c| c.as_str())
                                .unwrap_or("")
                                .to_string(),
                            query_text: query.to_string(),
                            query_index: 0,
                            rank: 0,
                        })
                    })
                    .take(limit)
                    .enumerate()
                    .map(|(rank, mut result)| {
                        result.rank = rank;
                        result
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl SearchGateway for TavilySearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, SearchError> {
        let url = format!("{}/search", self.base_url);
        debug!(query, limit, "Tavily search");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "query": query,
                "max_results": limit,
                "search_depth": self.search_depth,
            }))
            .send()
            .await
            .map_err(|e| request_error("tavily", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Request {
                provider: "tavily".into(),
                message: format!("HTTP {}: {}", status.as_u16(), body.chars().take(200).collect::<String>()),
            });
        }

        let body: Value = response.json().await.map_err(|e| SearchError::Parse {
            provider: "tavily".into(),
            message: e.to_string(),
        })?;

        Ok(Self::parse_response(&body, query, limit))
    }

    fn name(&self) -> &str {
        "tavily"
    }
}

/// DuckDuckGo instant-answer API. Needs no key but only returns
/// encyclopedic hits, so results are sparse for niche queries.
pub struct DuckDuckGoSearch {
    client: Client,
    base_url: String,
}

impl DuckDuckGoSearch {
    pub fn new(config: &SearchConfig, timeout: Duration) -> Result<Self, SearchError> {
        Ok(Self {
            client: build_client("duckduckgo", timeout)?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DUCKDUCKGO_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }

    fn topic_result(topic: &Value, query: &str) -> Option<SearchResult> {
        let text = topic.get("Text")?.as_str()?;
        let url = topic.get("FirstURL")?.as_str()?;
        if url.is_empty() {
            return None;
        }
        let title = text.split(" - ").next().unwrap_or(text);
        Some(SearchResult {
            url: url.to_string(),
            title: title.to_string(),
            snippet: text.to_string(),
            query_text: query.to_string(),
            query_index: 0,
            rank: 0,
        })
    }

    fn parse_response(body: &Value, query: &str, limit: usize) -> Vec<SearchResult> {
        let mut results = Vec::new();

        // Abstract (main answer)
        if let Some(abstract_text) = body.get("AbstractText").and_then(|v| v.as_str())
            && !abstract_text.is_empty()
            && let Some(url) = body.get("AbstractURL").and_then(|v| v.as_str())
            && !url.is_empty()
        {
            let title = body
                .get("Heading")
                .and_then(|v| v.as_str())
                .unwrap_or(query);
            results.push(SearchResult {
                url: url.to_string(),
                title: title.to_string(),
                snippet: abstract_text.to_string(),
                query_text: query.to_string(),
                query_index: 0,
                rank: 0,
            });
        }

        if let Some(res_array) = body.get("Results").and_then(|v| v.as_array()) {
            results.extend(res_array.iter().filter_map(|r| Self::topic_result(r, query)));
        }

        // Related topics, flattening grouped sub-topics.
        if let Some(topics) = body.get("RelatedTopics").and_then(|v| v.as_array()) {
            for topic in topics {
                if let Some(group) = topic.get("Topics").and_then(|v| v.as_array()) {
                    results.extend(group.iter().filter_map(|t| Self::topic_result(t, query)));
                } else if let Some(result) = Self::topic_result(topic, query) {
                    results.push(result);
                }
            }
        }

        results.truncate(limit);
        for (rank, result) in results.iter_mut().enumerate() {
            result.rank = rank;
        }
        results
    }
}

#[async_trait]
impl SearchGateway for DuckDuckGoSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, SearchError> {
        let url = format!(
            "{}/?q={}&format=json&no_html=1&skip_disambig=1",
            self.base_url,
            urlencoding::encode(query)
        );
        debug!(query, limit, "DuckDuckGo search");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| request_error("duckduckgo", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Request {
                provider: "duckduckgo".into(),
                message: format!("HTTP {}", status.as_u16()),
            });
        }

        // DuckDuckGo labels its JSON as application/x-javascript.
        let text = response
            .text()
            .await
            .map_err(|e| request_error("duckduckgo", e))?;
        let body: Value = serde_json::from_str(&text).map_err(|e| SearchError::Parse {
            provider: "duckduckgo".into(),
            message: e.to_string(),
        })?;

        Ok(Self::parse_response(&body, query, limit))
    }

    fn name(&self) -> &str {
        "duckduckgo"
    }
}

/// Create the configured search provider.
pub fn create_search_gateway(
    config: &SearchConfig,
    timeout: Duration,
) -> Result<Arc<dyn SearchGateway>, SearchError> {
    match config.provider.as_str() {
        "tavily" => Ok(Arc::new(TavilySearch::new(config, timeout)?)),
        "duckduckgo" | "ddg" => Ok(Arc::new(DuckDuckGoSearch::new(config, timeout)?)),
        other => Err(SearchError::UnknownProvider {
            name: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn result(url: &str, query: &str) -> SearchResult {
        SearchResult {
            url: url.to_string(),
            title: String::new(),
            snippet: String::new(),
            query_text: query.to_string(),
            query_index: 0,
            rank: 0,
        }
    }

    #[test]
    fn test_merge_orders_by_query_then_rank() {
        let merged = merge_results(vec![
            vec![result("https://b.example/", "q1"), result("https://a.example/", "q1")],
            vec![result("https://c.example/", "q2")],
        ]);
        let urls: Vec<&str> = merged.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["https://b.example/", "https://a.example/", "https://c.example/"]
        );
        assert_eq!(merged[1].rank, 1);
        assert_eq!(merged[2].query_index, 1);
    }

    #[test]
    fn test_merge_drops_duplicates_first_wins() {
        let merged = merge_results(vec![
            vec![result("https://shared.example/page", "q1")],
            vec![
                result("https://SHARED.example/page/", "q2"),
                result("https://only.example/", "q2"),
            ],
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].query_text, "q1");
        assert_eq!(merged[1].url, "https://only.example/");
    }

    #[test]
    fn test_merge_drops_unusable_urls() {
        let merged = merge_results(vec![vec![
            result("javascript:void(0)", "q"),
            result("https://ok.example/", "q"),
        ]]);
        assert_eq!(merged.len(), 1);
        // Rank reflects the provider's original position.
        assert_eq!(merged[0].rank, 1);
    }

    #[test]
    fn test_tavily_parse_response() {
        let body = json!({
            "results": [
                {"title": "One", "url": "https://one.example", "content": "first", "score": 0.9},
                {"title": "Blank", "url": "", "content": "skip"},
                {"title": "Two", "url": "https://two.example", "content": "second"},
                {"title": "Three", "url": "https://three.example", "content": "third"}
            ]
        });
        let results = TavilySearch::parse_response(&body, "q", 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].snippet, "first");
        assert_eq!(results[1].title, "Two");
        assert_eq!(results[1].rank, 1);
        assert!(TavilySearch::parse_response(&json!({}), "q", 5).is_empty());
    }

    #[test]
    fn test_duckduckgo_parse_response() {
        let body = json!({
            "Heading": "Rust",
            "AbstractText": "Rust is a language.",
            "AbstractURL": "https://en.wikipedia.org/wiki/Rust",
            "Results": [],
            "RelatedTopics": [
                {"Text": "Cargo - the Rust package manager", "FirstURL": "https://duckduckgo.com/Cargo"},
                {"Name": "See also", "Topics": [
                    {"Text": "Ferris - mascot", "FirstURL": "https://duckduckgo.com/Ferris"}
                ]}
            ]
        });
        let results = DuckDuckGoSearch::parse_response(&body, "rust", 10);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].title, "Rust");
        assert_eq!(results[1].title, "Cargo");
        assert_eq!(results[2].url, "https://duckduckgo.com/Ferris");
    }

    #[test]
    fn test_create_search_gateway() {
        let config = SearchConfig {
            provider: "duckduckgo".into(),
            ..Default::default()
        };
        let gateway = create_search_gateway(&config, Duration::from_secs(5)).unwrap();
        assert_eq!(gateway.name(), "duckduckgo");

        let config = SearchConfig {
            provider: "bing".into(),
            ..Default::default()
        };
        assert!(matches!(
            create_search_gateway(&config, Duration::from_secs(5)),
            Err(SearchError::UnknownProvider { .. })
        ));

        let config = SearchConfig {
            api_key_env: "DEEPQ_TEST_DEFINITELY_UNSET".into(),
            ..Default::default()
        };
        assert!(matches!(
            create_search_gateway(&config, Duration::from_secs(5)),
            Err(SearchError::MissingApiKey { .. })
        ));
    }

    #[tokio::test]
    async fn test_tavily_against_mock_server() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(header("authorization", "Bearer tvly-test"))
            .and(body_partial_json(json!({"query": "grid storage", "max_results": 3})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"title": "T", "url": "https://t.example", "content": "c"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = SearchConfig {
            api_key: Some("tvly-test".into()),
            base_url: Some(server.uri()),
            ..Default::default()
        };
        let tavily = TavilySearch::new(&config, Duration::from_secs(5)).unwrap();
        let results = tavily.search("grid storage", 3).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].query_text, "grid storage");
    }

    #[tokio::test]
    async fn test_tavily_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(432).set_body_string("quota"))
            .mount(&server)
            .await;

        let config = SearchConfig {
            api_key: Some("tvly-test".into()),
            base_url: Some(server.uri()),
            ..Default::default()
        };
        let tavily = TavilySearch::new(&config, Duration::from_secs(5)).unwrap();
        let err = tavily.search("q", 3).await.unwrap_err();
        assert!(err.to_string().contains("432"));
    }

    #[tokio::test]
    async fn test_duckduckgo_against_mock_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("q", "rust lang"))
            .and(query_param("format", "json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"AbstractText":"","RelatedTopics":[{"Text":"Rust - lang","FirstURL":"https://r.example"}]}"#,
            ))
            .mount(&server)
            .await;

        let config = SearchConfig {
            provider: "duckduckgo".into(),
            base_url: Some(server.uri()),
            ..Default::default()
        };
        let ddg = DuckDuckGoSearch::new(&config, Duration::from_secs(5)).unwrap();
        let results = ddg.search("rust lang", 5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].url, "https://r.example");
    }

    proptest! {
        #[test]
        fn prop_merge_is_unique_and_ordered(
            lists in proptest::collection::vec(
                proptest::collection::vec("[a-d]", 0..6), 0..4)
        ) {
            let per_query: Vec<Vec<SearchResult>> = lists
                .iter()
                .map(|l| l.iter().map(|p| result(&format!("https://x.example/{p}"), "q")).collect())
                .collect();
            let merged = merge_results(per_query);

            let mut seen = HashSet::new();
            for r in &merged {
                prop_assert!(seen.insert(r.url.clone()));
            }
            for pair in merged.windows(2) {
                prop_assert!((pair[0].query_index, pair[0].rank) < (pair[1].query_index, pair[1].rank));
            }
        }
    }
}
