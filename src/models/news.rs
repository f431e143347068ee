use serde::{Deserialize, Serialize};

use crate::models::research::RetrievedDocument;

/// Request parameters for `GET /api/news/search`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsQueryParams {
    /// Search query
    pub q: String,
    /// Number of days to look back (default: research recency window)
    pub days: Option<u32>,
    /// Maximum results (default: research max results per query)
    pub max_results: Option<usize>,
    /// `basic` or `advanced` (default: configured depth)
    pub depth: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsSearchResponse {
    pub query: String,
    pub provider: String,
    pub documents: Vec<RetrievedDocument>,
}
