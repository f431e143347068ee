use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::SearchError;
use crate::models::RetrievedDocument;

/// How much effort the search backend spends per query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchDepth {
    Basic,
    Advanced,
}

impl SearchDepth {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchDepth::Basic => "basic",
            SearchDepth::Advanced => "advanced",
        }
    }
}

impl fmt::Display for SearchDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchDepth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "basic" => Ok(SearchDepth::Basic),
            "advanced" => Ok(SearchDepth::Advanced),
            other => Err(format!("unknown search depth '{}' (expected basic or advanced)", other)),
        }
    }
}

/// Parameters of a single news search
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub query: String,
    pub depth: SearchDepth,
    pub max_results: usize,
    pub recency_days: u32,
}

/// Trait for news search backends.
///
/// One call is one HTTP request; the returned sequence is finite and is not
/// resumed. Implementations report upstream faults as `SearchError` so the
/// caller can tell transient faults from permanent ones.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<RetrievedDocument>, SearchError>;

    fn name(&self) -> &'static str;
}
