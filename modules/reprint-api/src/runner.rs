//! Shared trigger implementations used by both the REST handlers and the
//! cron jobs. Heavy work (browser, forum writes) is serialized through the
//! process-wide running flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tracing::{error, info};

use reprint_common::cookies::CookieJar;
use reprint_common::{ReprintError, Result, SourceType};
use reprint_crawler::{BatchSummary, BrowserFetcher, ContentExtractor, IntegratedCrawler, SiteRegistry};
use reprint_engine::workflow::{ExecuteOptions, WorkflowManager};
use reprint_publisher::{BatchPublisher, DiscuzPublisher, PublishSummary};
use reprint_wechat::{FakeidCache, LinkDiscoverer, WechatAuth, WechatClient};

use crate::AppState;

/// Holds the process-wide running flag; released on drop so a cancelled
/// handler cannot wedge the pipeline.
pub struct RunGuard(Arc<AtomicBool>);

impl RunGuard {
    pub fn acquire(flag: &Arc<AtomicBool>) -> Option<RunGuard> {
        if flag.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(RunGuard(flag.clone()))
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub use reprint_wechat::discovery::DiscoveryStats;

/// One-shot link discovery. Light enough to run unguarded: it only talks
/// to the WeChat backend and performs idempotent upserts.
pub async fn run_link_crawl(
    state: &Arc<AppState>,
    account: Option<String>,
    limit: Option<u32>,
) -> Result<DiscoveryStats> {
    let config = state.config_snapshot().await;
    let params = &config.workflow.steps.link_crawl.params;
    let auth = WechatAuth::load(&config.cfcj.wechat_auth_file)?;
    if !auth.is_complete() {
        return Err(ReprintError::CredentialsExpired(
            "wechat token/cookie missing; run the login flow".into(),
        ));
    }
    let client = WechatClient::new(auth);
    let cache = FakeidCache::open(&config.cfcj.fakeid_cache_file);
    let mut discoverer = LinkDiscoverer::new(client, state.store.clone(), cache);

    let accounts = match account {
        Some(account) => vec![account],
        None => params.accounts.clone(),
    };
    let limit_per_account = limit.unwrap_or(params.limit_per_account);
    discoverer
        .discover_all(
            &accounts,
            limit_per_account,
            params.total_limit.max(limit_per_account),
            &state.interrupted,
        )
        .await
}

/// One-shot content crawl with its own browser lifecycle. Caller must hold
/// the run guard.
pub async fn run_content_crawl(
    state: &Arc<AppState>,
    source_type: Option<String>,
    limit: Option<u32>,
    batch_size: Option<u32>,
) -> Result<BatchSummary> {
    let config = state.config_snapshot().await;
    let params = &config.workflow.steps.content_crawl.params;
    let cfcj = &config.cfcj;

    let registry = Arc::new(SiteRegistry::new(config.sites.clone())?);
    let driver = browser_driver_from(cfcj);
    let jar = CookieJar::open(&cfcj.cookie_file);
    let fetcher = BrowserFetcher::new(driver, jar, registry.clone(), cfcj.clone());
    let extractor = ContentExtractor::new(registry);
    let mut crawler = IntegratedCrawler::new(
        state.store.clone(),
        fetcher,
        extractor,
        Duration::from_secs(cfcj.request_delay_secs),
        state.interrupted.clone(),
    );

    let source_type = source_type
        .as_deref()
        .or(params.source_type.as_deref())
        .and_then(SourceType::parse);
    let result = crawler
        .batch(
            source_type,
            limit.unwrap_or(params.limit),
            batch_size.unwrap_or(params.batch_size),
        )
        .await;
    if let Err(e) = crawler.close().await {
        info!(error = %e, "Browser teardown reported an error");
    }
    result
}

/// One-shot forum publish. Caller must hold the run guard.
pub async fn run_batch_publish(state: &Arc<AppState>, limit: Option<u32>) -> Result<PublishSummary> {
    let config = state.config_snapshot().await;
    let params = &config.workflow.steps.forum_publish.params;
    let publisher = DiscuzPublisher::connect(
        &config.discuz_database,
        config.forum_publisher.clone(),
    )
    .await?;
    let batch = BatchPublisher::new(
        publisher,
        state.store.clone(),
        params,
        state.interrupted.clone(),
    );
    batch.publish_all(limit.unwrap_or(params.limit)).await
}

/// Start a workflow in the background, returning its execution id
/// immediately. Fails when another execution holds the run flag.
pub fn spawn_workflow(state: &Arc<AppState>, mut options: ExecuteOptions) -> Result<String> {
    let Some(guard) = RunGuard::acquire(&state.running) else {
        return Err(ReprintError::Config("a workflow execution is already running".into()));
    };

    let execution_id = options
        .execution_id
        .clone()
        .unwrap_or_else(|| Local::now().format("%Y%m%d_%H%M%S").to_string());
    options.execution_id = Some(execution_id.clone());

    let state = state.clone();
    let id_for_task = execution_id.clone();
    tokio::spawn(async move {
        let _guard = guard;
        // The execution keeps this snapshot even if the config is reloaded
        // while it runs.
        let config = state.config_snapshot().await;
        let manager = WorkflowManager::new(
            config,
            state.store.clone(),
            state.interrupted.clone(),
        );
        match manager.execute(options).await {
            Ok(outcome) => info!(
                execution_id = %id_for_task,
                success = outcome.success,
                status = ?outcome.status,
                "Workflow execution finished"
            ),
            Err(e) => error!(execution_id = %id_for_task, error = %e, "Workflow execution failed"),
        }
    });
    Ok(execution_id)
}

fn browser_driver_from(cfcj: &reprint_common::config::CrawlerConfig) -> browser_driver::ChromiumDriver {
    browser_driver::ChromiumDriver::new(browser_driver::DriverOptions {
        headless: cfcj.headless,
        user_agent: cfcj.user_agent.clone(),
        window_size: cfcj.window_size,
        request_timeout: Duration::from_secs(30),
    })
}
