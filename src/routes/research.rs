use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{error, info};
use uuid::Uuid;

use crate::db::research_run_queries;
use crate::errors::AppError;
use crate::models::{ResearchReport, ResearchRequest, ResearchRunSummary, RunListParams};
use crate::state::AppState;

const DEFAULT_RUN_LIMIT: i64 = 10;
const MAX_RUN_LIMIT: i64 = 50;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(run_research))
        .route("/runs/:run_id", get(get_run))
        .route("/companies/:company/runs", get(list_company_runs))
}

/// POST /api/research
///
/// Runs the research pipeline for one company and returns ranked topics.
/// When persistence is enabled the report is stored; a storage failure is
/// logged and the report is still returned.
async fn run_research(
    State(state): State<AppState>,
    Json(request): Json<ResearchRequest>,
) -> Result<Json<ResearchReport>, AppError> {
    info!("POST /api/research - company={}", request.company.trim());

    // Invalid input surfaces as a configuration error, mapped to 400
    let report = state.research.run(&request).await?;

    if let Some(pool) = &state.pool {
        match research_run_queries::insert(pool, &report).await {
            Ok(saved) => info!("Stored research run {} for {}", saved.id, saved.company),
            Err(e) => error!("Failed to store research run {}: {}", report.run_id, e),
        }
    }

    Ok(Json(report))
}

/// GET /api/research/runs/:run_id
async fn get_run(
    Path(run_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<ResearchReport>, AppError> {
    info!("GET /api/research/runs/{}", run_id);
    let pool = state.require_pool()?;

    let report = research_run_queries::fetch_report(pool, run_id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(report))
}

/// GET /api/research/companies/:company/runs
///
/// Query parameters:
/// - `limit`: number of runs (default: 10, max: 50)
async fn list_company_runs(
    Path(company): Path<String>,
    Query(params): Query<RunListParams>,
    State(state): State<AppState>,
) -> Result<Json<Vec<ResearchRunSummary>>, AppError> {
    let limit = run_limit(params.limit);
    info!("GET /api/research/companies/{}/runs (limit={})", company, limit);
    let pool = state.require_pool()?;

    let runs = research_run_queries::list_for_company(pool, company.trim(), limit).await?;
    Ok(Json(runs))
}

fn run_limit(requested: Option<i64>) -> i64 {
    requested
        .unwrap_or(DEFAULT_RUN_LIMIT)
        .clamp(1, MAX_RUN_LIMIT)
}
