//! REST handlers. No business logic here: each handler validates input,
//! delegates to the runner or the store, and shapes a JSON response.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use reprint_common::{Article, ReprintError};
use reprint_engine::workflow::ExecuteOptions;
use reprint_engine::ProgressTracker;

use crate::runner::{self, RunGuard};
use crate::schedule::{ScheduleEntry, ScheduleKind, ScheduleType};
use crate::AppState;

// --- Request bodies ---

#[derive(Debug, Default, Deserialize)]
pub struct CrawlRequest {
    pub account: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CrawlContentRequest {
    pub source_type: Option<String>,
    pub limit: Option<u32>,
    pub batch_size: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PublishRequest {
    pub limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WorkflowRunRequest {
    pub steps: Option<Vec<String>>,
    pub from_step: Option<String>,
    pub execution_id: Option<String>,
    #[serde(default)]
    pub resume: bool,
}

#[derive(Debug, Deserialize)]
pub struct AddScheduleRequest {
    pub schedule_type: ScheduleType,
    #[serde(default)]
    pub days: Vec<u8>,
    pub time: String,
    pub account: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteScheduleRequest {
    pub job_id: String,
}

// --- Helpers ---

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({"success": false, "message": message}))).into_response()
}

fn internal_error(e: ReprintError) -> Response {
    warn!(error = %e, "Request failed");
    let status = match &e {
        ReprintError::CredentialsExpired(_) => StatusCode::UNAUTHORIZED,
        ReprintError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e.to_string())
}

fn busy() -> Response {
    error_response(
        StatusCode::CONFLICT,
        "another execution is already running".to_string(),
    )
}

fn article_brief(article: &Article) -> serde_json::Value {
    json!({
        "id": article.id,
        "title": article.title,
        "article_url": article.article_url,
        "source_type": article.source_type.as_str(),
        "source_name": article.source_name,
        "publish_timestamp": article.publish_timestamp,
        "crawl_status": article.crawl_status.as_str(),
    })
}

// --- One-shot triggers ---

pub async fn crawl(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CrawlRequest>>,
) -> Response {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    match runner::run_link_crawl(&state, req.account, req.limit).await {
        Ok(stats) => {
            let articles = state
                .store
                .recent_articles(30)
                .await
                .unwrap_or_default()
                .iter()
                .map(article_brief)
                .collect::<Vec<_>>();
            Json(json!({
                "success": true,
                "message": format!("discovery registered {} article link(s)", stats.new_links),
                "new_articles": stats.new_links,
                "accounts_checked": stats.accounts_checked,
                "articles": articles,
            }))
            .into_response()
        }
        Err(e) => internal_error(e),
    }
}

pub async fn crawl_content(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CrawlContentRequest>>,
) -> Response {
    let Some(_guard) = RunGuard::acquire(&state.running) else {
        return busy();
    };
    let req = body.map(|Json(b)| b).unwrap_or_default();
    match runner::run_content_crawl(&state, req.source_type, req.limit, req.batch_size).await {
        Ok(summary) => Json(json!({
            "success": true,
            "message": format!(
                "processed {} article(s): {} ok, {} failed",
                summary.total_processed, summary.successful, summary.failed
            ),
            "summary": summary,
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn batch_publish_forum(
    State(state): State<Arc<AppState>>,
    body: Option<Json<PublishRequest>>,
) -> Response {
    let Some(_guard) = RunGuard::acquire(&state.running) else {
        return busy();
    };
    let req = body.map(|Json(b)| b).unwrap_or_default();
    match runner::run_batch_publish(&state, req.limit).await {
        Ok(summary) => Json(json!({
            "success": true,
            "message": format!(
                "published {} of {} article(s)",
                summary.success, summary.total
            ),
            "summary": summary,
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

// --- Status ---

pub async fn forum_publish_status(State(state): State<Arc<AppState>>) -> Response {
    let count = match state.store.count_unpublished().await {
        Ok(count) => count,
        Err(e) => return internal_error(e),
    };
    let sample = match state.store.claim_unpublished(10).await {
        Ok(sample) => sample,
        Err(e) => return internal_error(e),
    };
    Json(json!({
        "success": true,
        "pending_count": count,
        "pending_articles": sample.iter().map(article_brief).collect::<Vec<_>>(),
    }))
    .into_response()
}

pub async fn crawl_status(State(state): State<Arc<AppState>>) -> Response {
    match state.store.stats().await {
        Ok(stats) => Json(json!({"success": true, "stats": stats})).into_response(),
        Err(e) => internal_error(e),
    }
}

// --- Workflow ---

pub async fn workflow_run(
    State(state): State<Arc<AppState>>,
    body: Option<Json<WorkflowRunRequest>>,
) -> Response {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let options = ExecuteOptions {
        steps: req.steps,
        from_step: req.from_step,
        execution_id: req.execution_id,
        resume: req.resume,
    };
    match runner::spawn_workflow(&state, options) {
        Ok(execution_id) => Json(json!({
            "success": true,
            "execution_id": execution_id,
            "message": "workflow started",
        }))
        .into_response(),
        Err(_) => busy(),
    }
}

pub async fn workflow_status(State(state): State<Arc<AppState>>) -> Response {
    let progress_dir = state.config.read().await.scheduler.progress_dir.clone();
    let tracker = ProgressTracker::new(progress_dir);
    let executions = tracker.recent_executions(10);
    Json(json!({"success": true, "executions": executions})).into_response()
}

pub async fn workflow_status_one(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> Response {
    let progress_dir = state.config.read().await.scheduler.progress_dir.clone();
    let tracker = ProgressTracker::new(progress_dir);
    match tracker.load_record(&execution_id) {
        Ok(record) => Json(json!({"success": true, "execution": record})).into_response(),
        Err(_) => error_response(
            StatusCode::NOT_FOUND,
            format!("execution {execution_id} not found"),
        ),
    }
}

// --- Config ---

/// Re-read the config file and swap the in-memory snapshot. Running
/// executions keep the snapshot they started with.
pub async fn reload_config(State(state): State<Arc<AppState>>) -> Response {
    match reprint_common::Config::load() {
        Ok(config) => {
            *state.config.write().await = config;
            Json(json!({"success": true, "message": "configuration reloaded"})).into_response()
        }
        Err(e) => internal_error(e),
    }
}

// --- Schedules ---

pub async fn list_schedules(State(state): State<Arc<AppState>>) -> Response {
    let book = state.schedules.lock().await;
    Json(json!({"success": true, "schedules": book.entries()})).into_response()
}

pub async fn add_schedule(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddScheduleRequest>,
) -> Response {
    add_entry(state, req, ScheduleKind::LinkCrawl).await
}

pub async fn add_content_schedule(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddScheduleRequest>,
) -> Response {
    add_entry(state, req, ScheduleKind::Workflow).await
}

async fn add_entry(
    state: Arc<AppState>,
    req: AddScheduleRequest,
    kind: ScheduleKind,
) -> Response {
    let entry = ScheduleEntry::new(
        kind,
        req.schedule_type,
        req.days,
        req.time,
        req.account,
        req.limit,
    );
    if let Err(e) = entry.cron_expression() {
        return error_response(StatusCode::BAD_REQUEST, e.to_string());
    }
    if let Err(e) = state.scheduler.register(state.clone(), &entry).await {
        return internal_error(e);
    }
    let mut book = state.schedules.lock().await;
    if let Err(e) = book.add(entry.clone()) {
        state.scheduler.unregister(&entry.id).await;
        return internal_error(e);
    }
    Json(json!({"success": true, "id": entry.id})).into_response()
}

pub async fn delete_schedule(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeleteScheduleRequest>,
) -> Response {
    state.scheduler.unregister(&req.job_id).await;
    let mut book = state.schedules.lock().await;
    match book.remove(&req.job_id) {
        Ok(true) => Json(json!({"success": true})).into_response(),
        Ok(false) => error_response(
            StatusCode::NOT_FOUND,
            format!("schedule {} not found", req.job_id),
        ),
        Err(e) => internal_error(e),
    }
}
