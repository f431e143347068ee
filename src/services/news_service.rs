use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};
use url::Url;

use crate::config::ResearchConfig;
use crate::errors::SearchError;
use crate::external::search_provider::{SearchDepth, SearchProvider, SearchQuery};
use crate::models::RetrievedDocument;

/// Retriever: bounded news search on behalf of the research pipeline
pub struct NewsService {
    provider: Arc<dyn SearchProvider>,
    depth: SearchDepth,
    max_results: usize,
    recency_days: u32,
}

impl NewsService {
    pub fn new(provider: Arc<dyn SearchProvider>, config: &ResearchConfig) -> Self {
        info!("Initializing news retriever with provider: {}", provider.name());
        Self {
            provider,
            depth: config.search_depth,
            max_results: config.max_results_per_query,
            recency_days: config.recency_days,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Query with the configured depth, result count and day window
    pub fn default_query(&self, query: &str) -> SearchQuery {
        SearchQuery {
            query: query.trim().to_string(),
            depth: self.depth,
            max_results: self.max_results,
            recency_days: self.recency_days,
        }
    }

    /// One HTTP round trip to the search backend.
    ///
    /// An empty result is a success; upstream faults come back as
    /// `SearchError` for the caller to classify.
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<RetrievedDocument>, SearchError> {
        if query.query.is_empty() {
            warn!("Skipping empty search query");
            return Ok(Vec::new());
        }
        let documents = self.provider.search(query).await?;
        Ok(documents.into_iter().take(query.max_results).collect())
    }
}

/// Collapse documents that share a URL, keeping the longer snippet.
///
/// Documents are never collapsed by title: two outlets running the same
/// headline still contribute both bodies. First-seen order is preserved.
pub fn dedupe_by_url(documents: Vec<RetrievedDocument>) -> Vec<RetrievedDocument> {
    let mut position: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<RetrievedDocument> = Vec::with_capacity(documents.len());

    for doc in documents {
        let key = normalize_url(&doc.url);
        match position.get(&key) {
            Some(&idx) => {
                let existing = &mut unique[idx];
                if doc.snippet.len() > existing.snippet.len() {
                    existing.snippet = doc.snippet;
                }
                if existing.published_at.is_none() {
                    existing.published_at = doc.published_at;
                }
                existing.relevance_score = existing.relevance_score.max(doc.relevance_score);
            }
            None => {
                position.insert(key, unique.len());
                unique.push(doc);
            }
        }
    }
    unique
}

/// URL identity key: scheme and host lowercased, path and query kept as-is
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    match Url::parse(trimmed) {
        Ok(url) => url.as_str().trim_end_matches('/').to_string(),
        Err(_) => trimmed.trim_end_matches('/').to_string(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    type Responder = dyn Fn(&str) -> Result<Vec<RetrievedDocument>, SearchError> + Send + Sync;

    /// Scripted search backend that records every query it receives
    pub struct FakeSearch {
        responder: Box<Responder>,
        pub queries: Mutex<Vec<SearchQuery>>,
    }

    impl FakeSearch {
        pub fn new<F>(responder: F) -> Self
        where
            F: Fn(&str) -> Result<Vec<RetrievedDocument>, SearchError> + Send + Sync + 'static,
        {
            Self {
                responder: Box::new(responder),
                queries: Mutex::new(Vec::new()),
            }
        }

        pub fn query_texts(&self) -> Vec<String> {
            self.queries
                .lock()
                .unwrap()
                .iter()
                .map(|q| q.query.clone())
                .collect()
        }
    }

    #[async_trait]
    impl SearchProvider for FakeSearch {
        async fn search(&self, query: &SearchQuery) -> Result<Vec<RetrievedDocument>, SearchError> {
            self.queries.lock().unwrap().push(query.clone());
            (self.responder)(&query.query)
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    pub fn doc(title: &str, url: &str, snippet: &str) -> RetrievedDocument {
        RetrievedDocument {
            title: title.to_string(),
            url: url.to_string(),
            published_at: None,
            relevance_score: 0.5,
            snippet: snippet.to_string(),
        }
    }
}
