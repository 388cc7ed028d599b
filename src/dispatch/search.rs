use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

const SEARCH_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_MAX_RESULTS: usize = 20;

/// One web search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub title: String,
    pub href: String,
    pub body: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<RawResult>,
}

#[derive(Deserialize)]
struct RawResult {
    #[serde(default)]
    title: String,
    url: Option<String>,
    href: Option<String>,
    content: Option<String>,
    body: Option<String>,
}

/// Client for a SearXNG-compatible JSON search endpoint.
pub struct SearchClient {
    client: Client,
    base_url: String,
    max_results: usize,
}

impl SearchClient {
    pub fn new(base_url: impl Into<String>, max_results: Option<usize>) -> Result<Self, RelayError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(SEARCH_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            max_results: max_results.unwrap_or(DEFAULT_MAX_RESULTS).max(1),
        })
    }

    /// `GET {base_url}?q=…&format=json`, returning at most `limit` hits
    /// (capped by the configured maximum). Hits without a link are dropped.
    pub async fn search(&self, query: &str, limit: Option<usize>) -> Result<Vec<SearchResult>, RelayError> {
        let limit = limit.unwrap_or(self.max_results).clamp(1, self.max_results);

        let response = self
            .client
            .get(&self.base_url)
            .query(&[("q", query), ("format", "json")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Upstream {
                provider: "search".to_string(),
                message: format!("search returned {status}"),
                status: Some(status.as_u16()),
            });
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| RelayError::SchemaParse(format!("search response: {e}")))?;

        let results: Vec<SearchResult> = parsed
            .results
            .into_iter()
            .filter_map(|r| {
                let href = r.url.or(r.href)?;
                Some(SearchResult {
                    title: r.title,
                    href,
                    body: r.content.or(r.body).unwrap_or_default(),
                })
            })
            .take(limit)
            .collect();

        tracing::debug!(query, hits = results.len(), "web search complete");
        Ok(results)
    }
}
