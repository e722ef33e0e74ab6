//! The integrated crawl loop: claim pending rows, fetch, extract, write
//! back durable status transitions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};
use url::Url;

use browser_driver::BrowserDriver;
use reprint_common::{Article, Result, SourceType};
use reprint_store::ArticleStore;

use crate::extractor::ContentExtractor;
use crate::fetcher::BrowserFetcher;

/// Extra pause between batches, on top of the per-item delay.
const INTER_BATCH_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub total_processed: u32,
    pub successful: u32,
    pub failed: u32,
    pub skipped: u32,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct UrlOutcome {
    pub url: String,
    pub status: UrlStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub article_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct IntegratedCrawler<D: BrowserDriver> {
    store: ArticleStore,
    fetcher: BrowserFetcher<D>,
    extractor: ContentExtractor,
    request_delay: Duration,
    interrupted: Arc<AtomicBool>,
}

impl<D: BrowserDriver> IntegratedCrawler<D> {
    pub fn new(
        store: ArticleStore,
        fetcher: BrowserFetcher<D>,
        extractor: ContentExtractor,
        request_delay: Duration,
        interrupted: Arc<AtomicBool>,
    ) -> Self {
        IntegratedCrawler {
            store,
            fetcher,
            extractor,
            request_delay,
            interrupted,
        }
    }

    /// Tear down the browser and flush cookies. Call at the end of a run.
    pub async fn close(&mut self) -> Result<()> {
        self.fetcher.close().await
    }

    /// Crawl one article. Status transitions are durable before this
    /// returns; failures are recorded on the row and do not propagate.
    pub async fn crawl_one(&mut self, article: &Article) -> bool {
        info!(id = article.id, url = %article.article_url, "Crawling article");
        if let Err(e) = self.store.mark_crawling(article.id).await {
            error!(id = article.id, error = %e, "Cannot claim article for crawling");
            return false;
        }

        let html = match self.fetcher.fetch(&article.article_url).await {
            Ok(html) => html,
            Err(e) => {
                warn!(id = article.id, error = %e, "Fetch failed");
                self.record_failure(article.id, &e.to_string()).await;
                return false;
            }
        };

        let extracted = match self.extractor.extract(&html, &article.article_url) {
            Ok(extracted) => extracted,
            Err(e) => {
                warn!(id = article.id, error = %e, "Extraction failed");
                self.record_failure(article.id, &e.to_string()).await;
                return false;
            }
        };

        if extracted.content.is_empty() {
            self.record_failure(article.id, "extracted content is empty").await;
            return false;
        }

        match self
            .store
            .mark_completed(
                article.id,
                &extracted.title,
                &extracted.content,
                extracted.word_count as u32,
                &extracted.images,
            )
            .await
        {
            Ok(()) => {
                info!(
                    id = article.id,
                    words = extracted.word_count,
                    method = extracted.method,
                    "Article crawled"
                );
                true
            }
            Err(e) => {
                error!(id = article.id, error = %e, "Failed to persist crawl result");
                false
            }
        }
    }

    async fn record_failure(&self, id: i64, message: &str) {
        if let Err(e) = self.store.mark_failed(id, message).await {
            error!(id, error = %e, "Failed to record crawl failure");
        }
    }

    /// Sequentially process pending rows in batches with pacing delays.
    pub async fn batch(
        &mut self,
        source_type: Option<SourceType>,
        total_limit: u32,
        batch_size: u32,
    ) -> Result<BatchSummary> {
        let started = Utc::now();
        let mut summary = BatchSummary::default();

        let pending = self.store.claim_pending(source_type, total_limit).await?;
        if pending.is_empty() {
            info!("No pending articles to crawl");
            return Ok(summary);
        }
        let batch_size = batch_size.max(1) as usize;
        let batches = pending.len().div_ceil(batch_size);
        info!(articles = pending.len(), batches, "Starting content crawl");

        'outer: for (batch_idx, batch) in pending.chunks(batch_size).enumerate() {
            info!(batch = batch_idx + 1, of = batches, "Processing batch");
            for (i, article) in batch.iter().enumerate() {
                if self.interrupted.load(Ordering::Relaxed) {
                    info!("Content crawl interrupted");
                    break 'outer;
                }
                if Url::parse(&article.article_url).is_err() {
                    warn!(id = article.id, url = %article.article_url, "Dead URL, skipping");
                    if self.store.mark_crawling(article.id).await.is_ok() {
                        self.record_failure(article.id, "invalid article URL").await;
                    }
                    summary.skipped += 1;
                    summary.total_processed += 1;
                    continue;
                }
                if self.crawl_one(article).await {
                    summary.successful += 1;
                } else {
                    summary.failed += 1;
                }
                summary.total_processed += 1;

                let is_last_of_batch = i + 1 == batch.len();
                if !is_last_of_batch {
                    tokio::time::sleep(self.request_delay).await;
                }
            }
            if batch_idx + 1 < batches {
                tokio::time::sleep(self.request_delay + INTER_BATCH_DELAY).await;
            }
        }

        summary.duration_secs = (Utc::now() - started).num_milliseconds() as f64 / 1000.0;
        info!(
            processed = summary.total_processed,
            ok = summary.successful,
            failed = summary.failed,
            "Content crawl finished"
        );
        Ok(summary)
    }

    /// Register and immediately crawl a list of URLs. Already-known URLs
    /// are skipped; invalid ones are counted as skipped too.
    pub async fn crawl_urls(
        &mut self,
        urls: &[String],
        source_type: SourceType,
        source_name: &str,
    ) -> Result<Vec<UrlOutcome>> {
        let mut outcomes = Vec::with_capacity(urls.len());
        for url in urls {
            if self.interrupted.load(Ordering::Relaxed) {
                break;
            }
            if Url::parse(url).is_err() {
                outcomes.push(UrlOutcome {
                    url: url.clone(),
                    status: UrlStatus::Skipped,
                    article_id: None,
                    error: Some("invalid URL".into()),
                });
                continue;
            }
            if self.store.get_by_url(source_type, url).await?.is_some() {
                info!(url, "URL already registered, skipping");
                outcomes.push(UrlOutcome {
                    url: url.clone(),
                    status: UrlStatus::Skipped,
                    article_id: None,
                    error: None,
                });
                continue;
            }

            let id = self
                .store
                .upsert_link(source_type, url, None, None, Some(source_name))
                .await?;
            let article = match self.store.get(id).await? {
                Some(article) => article,
                None => {
                    outcomes.push(UrlOutcome {
                        url: url.clone(),
                        status: UrlStatus::Failed,
                        article_id: Some(id),
                        error: Some("row vanished after upsert".into()),
                    });
                    continue;
                }
            };
            let ok = self.crawl_one(&article).await;
            outcomes.push(UrlOutcome {
                url: url.clone(),
                status: if ok { UrlStatus::Success } else { UrlStatus::Failed },
                article_id: Some(id),
                error: None,
            });
        }
        Ok(outcomes)
    }
}
