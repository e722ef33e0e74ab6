use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::{Mutex, RwLock};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use reprint_common::Config;
use reprint_engine::install_signal_handlers;
use reprint_store::ArticleStore;

mod rest;
mod runner;
mod schedule;

use schedule::{ScheduleBook, Scheduler};

pub struct AppState {
    /// Read-mostly; swapped atomically by the reload endpoint. Running
    /// executions keep the snapshot they started with.
    pub config: RwLock<Config>,
    pub store: ArticleStore,
    /// One workflow execution at a time, process-wide.
    pub running: Arc<AtomicBool>,
    pub interrupted: Arc<AtomicBool>,
    pub schedules: Mutex<ScheduleBook>,
    pub scheduler: Scheduler,
}

impl AppState {
    pub async fn config_snapshot(&self) -> Config {
        self.config.read().await.clone()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("reprint=info".parse()?))
        .init();

    info!("Reprint control plane starting...");

    let config = Config::load()?;
    config.log_redacted();

    let store = ArticleStore::connect(&config.database.url()).await?;
    store.migrate().await?;

    let interrupted = Arc::new(AtomicBool::new(false));
    install_signal_handlers(interrupted.clone());

    let running = Arc::new(AtomicBool::new(false));
    let schedules = ScheduleBook::load(&config.scheduler.schedule_file);
    let scheduler = Scheduler::start().await?;

    let addr = format!("{}:{}", config.scheduler.host, config.scheduler.port);
    let state = Arc::new(AppState {
        config: RwLock::new(config),
        store,
        running,
        interrupted,
        schedules: Mutex::new(schedules),
        scheduler,
    });

    // Re-register every persisted schedule entry.
    schedule::reinstate_all(state.clone()).await?;

    let app = Router::new()
        .route("/", get(|| async { "ok" }))
        // One-shot triggers
        .route("/crawl", post(rest::crawl))
        .route("/crawl_content", post(rest::crawl_content))
        .route("/batch_publish_forum", post(rest::batch_publish_forum))
        // Status
        .route("/forum_publish_status", get(rest::forum_publish_status))
        .route("/api/crawl_status", get(rest::crawl_status))
        // Workflow
        .route("/api/workflow/run", post(rest::workflow_run))
        .route("/api/workflow/status", get(rest::workflow_status))
        .route("/api/workflow/status/{execution_id}", get(rest::workflow_status_one))
        // Schedules
        .route("/schedules", get(rest::list_schedules))
        .route("/schedule", post(rest::add_schedule))
        .route("/schedule_content", post(rest::add_content_schedule))
        .route("/delete_schedule", post(rest::delete_schedule))
        // Config
        .route("/reload_config", post(rest::reload_config))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    info!(addr = %addr, "Listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
