use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use tracing::info;

use crate::errors::AppError;
use crate::external::search_provider::{SearchDepth, SearchQuery};
use crate::models::{NewsQueryParams, NewsSearchResponse};
use crate::services::news_service::NewsService;
use crate::state::AppState;

const MAX_DAYS: u32 = 365;
const MAX_RESULTS: usize = 20;

pub fn router() -> Router<AppState> {
    Router::new().route("/search", get(search_news))
}

/// GET /api/news/search
///
/// Raw retriever output for one query.
///
/// Query parameters:
/// - `q`: search query (required)
/// - `days`: day window (default: configured recency, max 365)
/// - `max_results`: 1-20 (default: configured)
/// - `depth`: `basic` or `advanced` (default: configured)
async fn search_news(
    Query(params): Query<NewsQueryParams>,
    State(state): State<AppState>,
) -> Result<Json<NewsSearchResponse>, AppError> {
    info!("GET /api/news/search - q={}", params.q);
    let query = build_query(&state.news, &params)?;

    let documents = state.news.search(&query).await?;
    info!("Returning {} documents for '{}'", documents.len(), query.query);

    Ok(Json(NewsSearchResponse {
        query: query.query,
        provider: state.news.provider_name().to_string(),
        documents,
    }))
}

fn build_query(news: &NewsService, params: &NewsQueryParams) -> Result<SearchQuery, AppError> {
    let mut query = news.default_query(&params.q);
    if query.query.is_empty() {
        return Err(AppError::Validation("q must not be empty".to_string()));
    }

    if let Some(days) = params.days {
        if days == 0 || days > MAX_DAYS {
            return Err(AppError::Validation(format!("days must be between 1 and {}", MAX_DAYS)));
        }
        query.recency_days = days;
    }
    if let Some(max_results) = params.max_results {
        if max_results == 0 || max_results > MAX_RESULTS {
            return Err(AppError::Validation(format!(
                "max_results must be between 1 and {}",
                MAX_RESULTS
            )));
        }
        query.max_results = max_results;
    }
    if let Some(depth) = &params.depth {
        query.depth = depth.parse::<SearchDepth>()?;
    }
    Ok(query)
}
