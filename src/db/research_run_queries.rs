use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ResearchReport, ResearchRunSummary};

/// Store a finished pipeline run
pub async fn insert(pool: &PgPool, report: &ResearchReport) -> Result<ResearchRunSummary, sqlx::Error> {
    sqlx::query_as::<_, ResearchRunSummary>(
        r#"
        INSERT INTO research_runs (id, company, ticker, termination, iterations, topic_count, report, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id, company, ticker, termination, iterations, topic_count, created_at
        "#
    )
    .bind(report.run_id)
    .bind(&report.company)
    .bind(&report.ticker)
    .bind(report.termination.as_str())
    .bind(report.iterations as i32)
    .bind(report.topics.len() as i32)
    .bind(Json(report))
    .bind(report.finished_at)
    .fetch_one(pool)
    .await
}

/// Stored report of one run
pub async fn fetch_report(pool: &PgPool, run_id: Uuid) -> Result<Option<ResearchReport>, sqlx::Error> {
    let report = sqlx::query_scalar::<_, Json<ResearchReport>>(
        r#"
        SELECT report
        FROM research_runs
        WHERE id = $1
        "#
    )
    .bind(run_id)
    .fetch_optional(pool)
    .await?;
    Ok(report.map(|Json(report)| report))
}

/// Most recent runs for a company (case-insensitive match), newest first
pub async fn list_for_company(
    pool: &PgPool,
    company: &str,
    limit: i64,
) -> Result<Vec<ResearchRunSummary>, sqlx::Error> {
    sqlx::query_as::<_, ResearchRunSummary>(
        r#"
        SELECT id, company, ticker, termination, iterations, topic_count, created_at
        FROM research_runs
        WHERE LOWER(company) = LOWER($1)
        ORDER BY created_at DESC
        LIMIT $2
        "#
    )
    .bind(company)
    .bind(limit)
    .fetch_all(pool)
    .await
}
