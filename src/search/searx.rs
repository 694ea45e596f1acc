//! Searcher backed by a SearxNG instance's JSON API
//!
//! `GET {base}/search?q=<query>&format=json` returns direct answers,
//! infoboxes and ranked results. Widgets are served from the answers and
//! infoboxes (falling back to the top hit); full searches read the first
//! `complexity` results of every query.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{SearchError, SearchResult, Searcher, Widget};

#[derive(Debug, Default, Deserialize)]
struct SearxResponse {
    #[serde(default)]
    results: Vec<SearxHit>,
    #[serde(default)]
    answers: Vec<serde_json::Value>,
    #[serde(default)]
    infoboxes: Vec<SearxInfobox>,
}

#[derive(Debug, Deserialize)]
struct SearxHit {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct SearxInfobox {
    #[serde(default)]
    infobox: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    content: String,
}

#[derive(Clone)]
pub struct SearxSearcher {
    base_url: String,
    client: reqwest::Client,
}

impl SearxSearcher {
    pub const NAME: &'static str = "searx";

    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn query(&self, query: &str) -> Result<SearxResponse, SearchError> {
        let endpoint = format!("{}/search", self.base_url);
        let response = self
            .client
            .get(&endpoint)
            .query(&[("q", query), ("format", "json")])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SearchError::Status(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }
}

/// Results for a widget lookup: direct answers and infoboxes first, the
/// top ranked hit when there are none
fn widget_results(query: &str, widget: Widget, response: SearxResponse) -> Vec<SearchResult> {
    let mut results: Vec<SearchResult> = response
        .answers
        .iter()
        .filter_map(|answer| match answer {
            serde_json::Value::String(text) => Some(text.clone()),
            serde_json::Value::Object(map) => map
                .get("answer")
                .and_then(|a| a.as_str())
                .map(str::to_string),
            _ => None,
        })
        .map(|text| SearchResult {
            query: query.to_string(),
            title: widget.to_string(),
            url: None,
            content: text,
        })
        .collect();

    results.extend(response.infoboxes.into_iter().map(|infobox| SearchResult {
        query: query.to_string(),
        title: infobox.infobox,
        url: infobox.id,
        content: infobox.content,
    }));

    if results.is_empty() {
        results.extend(response.results.into_iter().take(1).map(|hit| to_result(query, hit)));
    }
    results
}

fn to_result(query: &str, hit: SearxHit) -> SearchResult {
    SearchResult {
        query: query.to_string(),
        title: hit.title,
        url: hit.url,
        content: hit.content,
    }
}

#[async_trait]
impl Searcher for SearxSearcher {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn search(
        &self,
        queries: &[String],
        complexity: u32,
        widget: Option<Widget>,
    ) -> Result<Vec<SearchResult>, SearchError> {
        if let Some(widget) = widget {
            let Some(query) = queries.first() else {
                return Ok(Vec::new());
            };
            let response = self.query(query).await?;
            return Ok(widget_results(query, widget, response));
        }

        let mut results = Vec::new();
        for query in queries {
            let response = self.query(query).await?;
            debug!(query = %query, hits = response.results.len(), "searx query finished");
            results.extend(
                response
                    .results
                    .into_iter()
                    .take(complexity as usize)
                    .map(|hit| to_result(query, hit)),
            );
        }
        Ok(results)
    }
}
