use std::sync::Arc;

use sqlx::PgPool;

use crate::errors::AppError;
use crate::services::news_service::NewsService;
use crate::services::research_service::ResearchService;
use crate::services::sec_edgar_service::SecEdgarService;

#[derive(Clone)]
pub struct AppState {
    /// `None` when `DATABASE_URL` is unset; stored-run endpoints answer 503
    pub pool: Option<PgPool>,
    pub research: Arc<ResearchService>,
    pub news: Arc<NewsService>,
    pub sec: Arc<SecEdgarService>,
}

impl AppState {
    pub fn require_pool(&self) -> Result<&PgPool, AppError> {
        self.pool
            .as_ref()
            .ok_or_else(|| AppError::Unavailable("research run persistence is disabled".to_string()))
    }
}
