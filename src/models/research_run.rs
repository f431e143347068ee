use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Listing row for a company's previous runs
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ResearchRunSummary {
    pub id: Uuid,
    pub company: String,
    pub ticker: Option<String>,
    pub termination: String,
    pub iterations: i32,
    pub topic_count: i32,
    pub created_at: DateTime<Utc>,
}

/// Query parameters for listing runs
#[derive(Debug, Clone, Deserialize)]
pub struct RunListParams {
    /// Number of runs to return (default: 10, max: 50)
    pub limit: Option<i64>,
}
