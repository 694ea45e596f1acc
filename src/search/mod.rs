//! Prompt classification and the search gate
//!
//! Before answering, the agent may ask the model whether the user's message
//! needs fresh information:
//!
//! ```text
//! message ──► classify (history-free backend call)
//!                │
//!                ├─ search = []          → answer with no extra context
//!                ├─ widget = "weather"   → one targeted fetch → 1 browser unit
//!                └─ otherwise            → full search → 1 browser unit per result
//! ```
//!
//! Searchers are registered explicitly by name in a [`SearcherRegistry`].

pub mod classify;
pub mod searx;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::lmc::{Lmc, Role};
use crate::metrics::SEARCHES;

pub use classify::{classify, parse_classification, ClassificationError, CLASSIFY_PROMPT};
pub use searx::SearxSearcher;

/// Most queries a classification may ask for
pub const MAX_QUERIES: usize = 3;

/// Pre-structured answer sources preferred over full browsing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Widget {
    Weather,
    Events,
    Showtimes,
    Reviews,
}

impl Widget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Widget::Weather => "weather",
            Widget::Events => "events",
            Widget::Showtimes => "showtimes",
            Widget::Reviews => "reviews",
        }
    }
}

impl fmt::Display for Widget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The model's judgement on whether a message needs a search
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Up to [`MAX_QUERIES`] queries; empty means no search
    #[serde(default)]
    pub search: Vec<String>,
    /// Result pages to consult; 0 prefers a widget
    #[serde(default)]
    pub complexity: u32,
    #[serde(default)]
    pub widget: Option<Widget>,
}

impl Classification {
    pub fn needs_search(&self) -> bool {
        !self.search.is_empty()
    }
}

/// One retrieved item, serialized as-is into a browser unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub query: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub content: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("search request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("search service returned status {0}")]
    Status(u16),

    #[error("could not encode search results: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A capability that can look things up on the web
#[async_trait]
pub trait Searcher: Send + Sync {
    /// Registry key, e.g. "searx"
    fn name(&self) -> &str;

    /// Run `queries`, consulting `complexity` result pages per query, or a
    /// single targeted fetch when `widget` is set.
    async fn search(
        &self,
        queries: &[String],
        complexity: u32,
        widget: Option<Widget>,
    ) -> Result<Vec<SearchResult>, SearchError>;
}

/// Explicit name → searcher table
#[derive(Clone, Default)]
pub struct SearcherRegistry {
    searchers: BTreeMap<String, Arc<dyn Searcher>>,
}

impl SearcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `searcher` under its own name, replacing any previous entry
    pub fn register(&mut self, searcher: Arc<dyn Searcher>) {
        self.searchers.insert(searcher.name().to_string(), searcher);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Searcher>> {
        self.searchers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.searchers.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.searchers.is_empty()
    }
}

/// Fetch the context a classification asks for, as browser info units.
///
/// A widget fetch yields exactly one unit holding all its results; a full
/// search yields one unit per result.
pub async fn gather_context(
    searcher: &dyn Searcher,
    classification: &Classification,
) -> Result<Vec<Lmc>, SearchError> {
    if !classification.needs_search() {
        SEARCHES.with_label_values(&["none"]).inc();
        return Ok(Vec::new());
    }

    if let Some(widget) = classification.widget {
        SEARCHES.with_label_values(&["widget"]).inc();
        info!(widget = %widget, queries = ?classification.search, "fetching widget");
        let results = searcher
            .search(&classification.search, classification.complexity, Some(widget))
            .await?;
        let content = serde_json::to_string(&results)?;
        return Ok(vec![Lmc::info(Role::Browser, content)]);
    }

    // a full search reads at least one page per query
    let pages = classification.complexity.max(1);
    SEARCHES.with_label_values(&["full"]).inc();
    info!(pages, queries = ?classification.search, "running full search");
    let results = searcher.search(&classification.search, pages, None).await?;

    results
        .iter()
        .map(|result| -> Result<Lmc, SearchError> {
            Ok(Lmc::info(Role::Browser, serde_json::to_string(result)?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::lmc::UnitType;

    #[derive(Default)]
    struct RecordingSearcher {
        seen: Mutex<Vec<(Vec<String>, u32, Option<Widget>)>>,
    }

    #[async_trait]
    impl Searcher for RecordingSearcher {
        fn name(&self) -> &str {
            "recording"
        }

        async fn search(
            &self,
            queries: &[String],
            complexity: u32,
            widget: Option<Widget>,
        ) -> Result<Vec<SearchResult>, SearchError> {
            self.seen
                .lock()
                .unwrap()
                .push((queries.to_vec(), complexity, widget));
            Ok(queries
                .iter()
                .map(|q| SearchResult {
                    query: q.clone(),
                    title: format!("About {q}"),
                    url: None,
                    content: "details".into(),
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_no_search_fetches_nothing() {
        let searcher = RecordingSearcher::default();
        let units = gather_context(&searcher, &Classification::default()).await.unwrap();
        assert!(units.is_empty());
        assert!(searcher.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_widget_yields_single_unit() {
        let searcher = RecordingSearcher::default();
        let classification = Classification {
            search: vec!["weather Tokyo".into()],
            complexity: 0,
            widget: Some(Widget::Weather),
        };
        let units = gather_context(&searcher, &classification).await.unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].role(), Role::Browser);
        assert_eq!(units[0].unit_type(), UnitType::Info);
        assert!(units[0].content().contains("weather Tokyo"));
        assert_eq!(
            searcher.seen.lock().unwrap()[0],
            (vec!["weather Tokyo".to_string()], 0, Some(Widget::Weather))
        );
    }

    #[tokio::test]
    async fn test_full_search_yields_unit_per_result() {
        let searcher = RecordingSearcher::default();
        let classification = Classification {
            search: vec!["rust 2026 release".into(), "rust edition".into()],
            complexity: 0,
            widget: None,
        };
        let units = gather_context(&searcher, &classification).await.unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(searcher.seen.lock().unwrap()[0].1, 1);
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = SearcherRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(RecordingSearcher::default()));
        assert!(registry.get("recording").is_some());
        assert!(registry.get("google").is_none());
        assert_eq!(registry.names(), vec!["recording"]);
    }
}
