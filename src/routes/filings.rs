use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use tracing::info;

use crate::errors::AppError;
use crate::models::{FilingContent, FilingContentParams, FilingSearchParams, FilingType, SecFiling};
use crate::state::AppState;

const DEFAULT_DAYS: i64 = 90;
const MAX_DAYS: i64 = 3650;
const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 100;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/content", get(get_filing_content))
        .route("/:ticker", get(get_filings))
}

/// GET /api/filings/:ticker
///
/// Query parameters:
/// - `form`: 8-K, 10-K, 10-Q or 4 (default: 8-K)
/// - `days`: look-back window (default: 90)
/// - `limit`: maximum filings (default: 20, max: 100)
async fn get_filings(
    Path(ticker): Path<String>,
    Query(params): Query<FilingSearchParams>,
    State(state): State<AppState>,
) -> Result<Json<Vec<SecFiling>>, AppError> {
    info!("GET /api/filings/{} - form={:?}", ticker, params.form);
    validate_ticker(&ticker)?;

    let filing_type = match &params.form {
        Some(form) => form.parse::<FilingType>()?,
        None => FilingType::EightK,
    };
    let days = params.days.unwrap_or(DEFAULT_DAYS);
    if !(1..=MAX_DAYS).contains(&days) {
        return Err(AppError::Validation(format!("days must be between 1 and {}", MAX_DAYS)));
    }
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let filings = state
        .sec
        .search_filings(&ticker, filing_type, days, limit)
        .await?;
    Ok(Json(filings))
}

/// GET /api/filings/content?url=
///
/// Cleaned text of a filing document hosted on sec.gov
async fn get_filing_content(
    Query(params): Query<FilingContentParams>,
    State(state): State<AppState>,
) -> Result<Json<FilingContent>, AppError> {
    info!("GET /api/filings/content - url={}", params.url);
    let text = state.sec.fetch_filing_content(&params.url).await?;
    Ok(Json(FilingContent {
        url: params.url,
        text,
    }))
}

fn validate_ticker(ticker: &str) -> Result<(), AppError> {
    let valid = !ticker.is_empty()
        && ticker.len() <= 10
        && ticker
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(AppError::Validation(format!("invalid ticker '{}'", ticker)))
    }
}
