use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::errors::SearchError;
use crate::external::search_provider::{SearchProvider, SearchQuery};
use crate::models::RetrievedDocument;

// Tavily caps max_results at 20 per request.
const TAVILY_MAX_RESULTS: usize = 20;

pub struct TavilyProvider {
    api_key: String,
    base_url: String,
    client: Client,
}

impl TavilyProvider {
    pub fn new(api_key: String, base_url: String) -> Result<Self, SearchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SearchError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[derive(Debug, Serialize)]
struct TavilyRequest<'a> {
    query: &'a str,
    search_depth: &'static str,
    topic: &'static str,
    days: u32,
    max_results: usize,
    include_answer: bool,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    title: String,
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    score: f64,
    #[serde(default)]
    published_date: Option<String>,
}

#[async_trait]
impl SearchProvider for TavilyProvider {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<RetrievedDocument>, SearchError> {
        info!(
            "Searching Tavily for '{}' (depth={}, max_results={}, days={})",
            query.query, query.depth, query.max_results, query.recency_days
        );

        let body = TavilyRequest {
            query: &query.query,
            search_depth: query.depth.as_str(),
            topic: "news",
            days: query.recency_days,
            max_results: query.max_results.min(TAVILY_MAX_RESULTS),
            include_answer: false,
        };

        let response = self
            .client
            .post(format!("{}/search", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SearchError::Timeout
                } else {
                    SearchError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!("Tavily rate limited query '{}'", query.query);
            return Err(SearchError::RateLimited);
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            error!("Tavily rejected the API key (status {})", status);
            return Err(SearchError::Unauthorized);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            error!("Tavily API error {}: {}", status, message);
            return Err(SearchError::BadResponse {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: TavilyResponse = response
            .json()
            .await
            .map_err(|e| SearchError::Parse(e.to_string()))?;

        let documents = into_documents(parsed, query.max_results);
        info!("Tavily returned {} documents for '{}'", documents.len(), query.query);
        Ok(documents)
    }

    fn name(&self) -> &'static str {
        "tavily"
    }
}

fn into_documents(response: TavilyResponse, max_results: usize) -> Vec<RetrievedDocument> {
    response
        .results
        .into_iter()
        .filter(|r| !r.url.trim().is_empty())
        .take(max_results)
        .map(|r| RetrievedDocument {
            title: r.title.trim().to_string(),
            url: r.url.trim().to_string(),
            published_at: r.published_date.as_deref().and_then(parse_published_date),
            relevance_score: r.score.clamp(0.0, 1.0),
            snippet: r.content.trim().to_string(),
        })
        .collect()
}

/// Parse the publication dates Tavily returns (RFC 2822, RFC 3339 or plain dates)
fn parse_published_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    warn!("Could not parse publication date '{}'", raw);
    None
}
