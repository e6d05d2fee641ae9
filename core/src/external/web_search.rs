//! Web search collaborator for the Autonomic Engine's web-explore level (§4.9):
//! multi-round, LLM-judged-sufficiency search bounded to a handful of pages.

use async_trait::async_trait;

use crate::error::CoreResult;

#[derive(Clone, Debug)]
pub struct SearchResult {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

#[async_trait]
pub trait WebSearcher: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> CoreResult<Vec<SearchResult>>;
    async fn fetch_page_text(&self, url: &str) -> CoreResult<String>;
}

/// `reqwest`-backed searcher hitting a configurable search API endpoint (the search
/// provider itself is an operator-supplied HTTP endpoint, not a specific vendor).
pub struct HttpWebSearcher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpWebSearcher {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), endpoint: endpoint.into() }
    }
}

#[async_trait]
impl WebSearcher for HttpWebSearcher {
    async fn search(&self, query: &str, max_results: usize) -> CoreResult<Vec<SearchResult>> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("limit", &max_results.to_string())])
            .send()
            .await
            .map_err(|e| crate::error::CoreError::kind(crate::error::ErrorKind::ToolError, e.to_string()))?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| crate::error::CoreError::kind(crate::error::ErrorKind::ParseError, e.to_string()))?;
        let results = body
            .get("results")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .take(max_results)
            .filter_map(|r| {
                Some(SearchResult {
                    url: r.get("url")?.as_str()?.to_string(),
                    title: r.get("title").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                    snippet: r.get("snippet").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                })
            })
            .collect();
        Ok(results)
    }

    async fn fetch_page_text(&self, url: &str) -> CoreResult<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| crate::error::CoreError::kind(crate::error::ErrorKind::ToolError, e.to_string()))?;
        response
            .text()
            .await
            .map_err(|e| crate::error::CoreError::kind(crate::error::ErrorKind::ToolError, e.to_string()))
    }
}
