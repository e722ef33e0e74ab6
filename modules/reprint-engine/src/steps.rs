//! Step bodies: each builds its collaborators from the execution's config
//! snapshot, runs, and returns a JSON result record for the journal.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use browser_driver::{ChromiumDriver, DriverOptions};
use reprint_common::cookies::CookieJar;
use reprint_common::{Config, ReprintError, Result, SourceType};
use reprint_crawler::{BrowserFetcher, ContentExtractor, IntegratedCrawler, SiteRegistry};
use reprint_publisher::{BatchPublisher, DiscuzPublisher};
use reprint_store::ArticleStore;
use reprint_wechat::{FakeidCache, LinkDiscoverer, WechatAuth, WechatClient};

pub struct StepExecutor {
    config: Config,
    store: ArticleStore,
    interrupted: Arc<AtomicBool>,
}

impl StepExecutor {
    pub fn new(config: Config, store: ArticleStore, interrupted: Arc<AtomicBool>) -> Self {
        StepExecutor {
            config,
            store,
            interrupted,
        }
    }

    pub async fn run(&self, step: &str) -> Result<serde_json::Value> {
        match step {
            "link_crawl" => self.link_crawl().await,
            "content_crawl" => self.content_crawl().await,
            "forum_publish" => self.forum_publish().await,
            other => Err(ReprintError::Config(format!("unknown step: {other}"))),
        }
    }

    /// Resolve the accounts the link gate and discoverer operate on.
    pub fn tracked_accounts(&self) -> Vec<String> {
        let params = &self.config.workflow.steps.link_crawl.params;
        if params.accounts.iter().any(|a| a == "all") {
            FakeidCache::open(&self.config.cfcj.fakeid_cache_file).account_names()
        } else {
            params.accounts.clone()
        }
    }

    async fn link_crawl(&self) -> Result<serde_json::Value> {
        let params = &self.config.workflow.steps.link_crawl.params;
        let auth = WechatAuth::load(&self.config.cfcj.wechat_auth_file)?;
        if !auth.is_complete() {
            return Err(ReprintError::CredentialsExpired(
                "wechat token/cookie missing; run the login flow".into(),
            ));
        }
        let client = WechatClient::new(auth);
        let cache = FakeidCache::open(&self.config.cfcj.fakeid_cache_file);
        let mut discoverer = LinkDiscoverer::new(client, self.store.clone(), cache);

        let stats = discoverer
            .discover_all(
                &params.accounts,
                params.limit_per_account,
                params.total_limit,
                &self.interrupted,
            )
            .await?;

        Ok(serde_json::json!({
            "new_articles": stats.new_links,
            "accounts_checked": stats.accounts_checked,
            "message": format!("link discovery registered {} article(s)", stats.new_links),
        }))
    }

    async fn content_crawl(&self) -> Result<serde_json::Value> {
        let params = &self.config.workflow.steps.content_crawl.params;
        let cfcj = &self.config.cfcj;

        let registry = Arc::new(SiteRegistry::new(self.config.sites.clone())?);
        let driver = ChromiumDriver::new(DriverOptions {
            headless: cfcj.headless,
            user_agent: cfcj.user_agent.clone(),
            window_size: cfcj.window_size,
            request_timeout: Duration::from_secs(30),
        });
        let jar = CookieJar::open(&cfcj.cookie_file);
        let fetcher = BrowserFetcher::new(driver, jar, registry.clone(), cfcj.clone());
        let extractor = ContentExtractor::new(registry);
        let mut crawler = IntegratedCrawler::new(
            self.store.clone(),
            fetcher,
            extractor,
            Duration::from_secs(cfcj.request_delay_secs),
            self.interrupted.clone(),
        );

        let source_type = params.source_type.as_deref().and_then(SourceType::parse);
        let result = crawler
            .batch(source_type, params.limit, params.batch_size)
            .await;
        // The browser comes down whether the batch succeeded or not.
        if let Err(e) = crawler.close().await {
            info!(error = %e, "Browser teardown after batch reported an error");
        }
        let summary = result?;

        Ok(serde_json::json!({
            "total_processed": summary.total_processed,
            "successful": summary.successful,
            "failed": summary.failed,
            "skipped": summary.skipped,
            "duration_secs": summary.duration_secs,
            "message": format!(
                "content crawl processed {} article(s): {} ok, {} failed",
                summary.total_processed, summary.successful, summary.failed
            ),
        }))
    }

    async fn forum_publish(&self) -> Result<serde_json::Value> {
        let params = &self.config.workflow.steps.forum_publish.params;
        let publisher = DiscuzPublisher::connect(
            &self.config.discuz_database,
            self.config.forum_publisher.clone(),
        )
        .await?;
        let batch = BatchPublisher::new(
            publisher,
            self.store.clone(),
            params,
            self.interrupted.clone(),
        );
        let summary = batch.publish_all(params.limit).await?;

        Ok(serde_json::json!({
            "total": summary.total,
            "success": summary.success,
            "failed": summary.failed,
            "message": format!(
                "forum publish: {} of {} article(s) published",
                summary.success, summary.total
            ),
        }))
    }
}
