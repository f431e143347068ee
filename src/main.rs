mod app;
mod config;
mod db;
mod errors;
mod external;
mod logging;
mod models;
mod routes;
mod services;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::external::tavily::TavilyProvider;
use crate::logging::{init_logging, LoggingConfig};
use crate::services::llm_service::LlmService;
use crate::services::news_service::NewsService;
use crate::services::research_service::ResearchService;
use crate::services::sec_edgar_service::SecEdgarService;
use crate::state::AppState;

const CACHE_CLEANUP_INTERVAL: Duration = Duration::from_secs(600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Logging first so configuration problems are reported
    init_logging(&LoggingConfig::from_env())?;

    let config = AppConfig::from_env().context("invalid configuration")?;

    let search = Arc::new(TavilyProvider::new(
        config.search.api_key.clone(),
        config.search.base_url.clone(),
    )?);
    let news = Arc::new(NewsService::new(search, &config.research));

    let llm = Arc::new(LlmService::new(&config.llm)?);
    info!("Using LLM model {}", llm.model());

    let research = Arc::new(ResearchService::new(
        news.clone(),
        llm.clone(),
        config.research.clone(),
    ));
    let sec = Arc::new(SecEdgarService::new(config.sec.user_agent.clone())?);

    let pool = match &config.server.database_url {
        Some(url) => Some(connect_database(url).await?),
        None => {
            warn!("DATABASE_URL not set; research runs will not be stored");
            None
        }
    };

    let cleanup_llm = llm.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CACHE_CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            cleanup_llm.cleanup();
        }
    });

    let state = AppState {
        pool,
        research,
        news,
        sec,
    };
    let app = app::create_app(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid HOST/PORT")?;
    let listener = TcpListener::bind(&addr).await?;
    info!(
        "Finwire backend running at http://{}/ (defaults: {} iterations, {} questions)",
        addr,
        config.research.max_iterations,
        config.research.max_questions_per_iteration
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn connect_database(url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to DATABASE_URL")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;
    info!("Database connected and migrations applied");
    Ok(pool)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
