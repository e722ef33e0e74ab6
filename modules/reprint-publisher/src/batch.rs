use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};

use reprint_common::config::ForumPublishParams;
use reprint_common::{Article, Result};
use reprint_store::ArticleStore;

use crate::discuz::DiscuzPublisher;

#[derive(Debug, Clone, Serialize)]
pub struct PublishOutcome {
    pub article_id: i64,
    pub title: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tid: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PublishSummary {
    pub total: u32,
    pub success: u32,
    pub failed: u32,
    pub details: Vec<PublishOutcome>,
}

/// Publishes unpublished completed articles one at a time, pacing
/// successful publishes with a randomized human-like interval.
pub struct BatchPublisher {
    publisher: DiscuzPublisher,
    store: ArticleStore,
    interval: (u64, u64),
    interrupted: Arc<AtomicBool>,
}

impl BatchPublisher {
    pub fn new(
        publisher: DiscuzPublisher,
        store: ArticleStore,
        params: &ForumPublishParams,
        interrupted: Arc<AtomicBool>,
    ) -> Self {
        BatchPublisher {
            publisher,
            store,
            interval: (params.interval_min, params.interval_max),
            interrupted,
        }
    }

    /// Publish one article and, only after the forum transaction commits,
    /// mark the source row. A failed publish leaves the row retryable.
    pub async fn publish_one(&self, article: &Article) -> PublishOutcome {
        match self.publisher.publish(article).await {
            Ok(ids) => {
                let marked = self.store.mark_published(article.id).await;
                if let Err(e) = &marked {
                    // The forum rows exist; the next run would duplicate
                    // them if this stayed unmarked. Surface loudly.
                    warn!(id = article.id, error = %e, "Published but failed to mark source row");
                }
                PublishOutcome {
                    article_id: article.id,
                    title: article.title.clone(),
                    success: marked.is_ok(),
                    tid: Some(ids.tid),
                    error: marked.err().map(|e| e.to_string()),
                }
            }
            Err(e) => {
                warn!(id = article.id, error = %e, "Forum publish failed");
                PublishOutcome {
                    article_id: article.id,
                    title: article.title.clone(),
                    success: false,
                    tid: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    pub async fn publish_all(&self, limit: u32) -> Result<PublishSummary> {
        let pending = self.store.claim_unpublished(limit).await?;
        let mut summary = PublishSummary {
            total: pending.len() as u32,
            ..PublishSummary::default()
        };
        if pending.is_empty() {
            info!("No articles waiting for forum publish");
            return Ok(summary);
        }
        info!(articles = pending.len(), "Starting batch publish");

        let total = pending.len();
        for (i, article) in pending.iter().enumerate() {
            if self.interrupted.load(Ordering::Relaxed) {
                info!("Batch publish interrupted");
                break;
            }
            let outcome = self.publish_one(article).await;
            let succeeded = outcome.success;
            if succeeded {
                summary.success += 1;
            } else {
                summary.failed += 1;
            }
            summary.details.push(outcome);

            if succeeded && i + 1 < total {
                let wait = rand::rng().random_range(self.interval.0..=self.interval.1);
                info!(wait_secs = wait, "Pacing before next publish");
                tokio::time::sleep(Duration::from_secs(wait)).await;
            }
        }

        info!(
            total = summary.total,
            ok = summary.success,
            failed = summary.failed,
            "Batch publish finished"
        );
        Ok(summary)
    }

    /// Pending counts plus a sample of waiting articles, for the status
    /// endpoint.
    pub async fn publish_status(&self) -> Result<(u64, Vec<Article>)> {
        let count = self.store.count_unpublished().await?;
        let sample = self.store.claim_unpublished(10).await?;
        Ok((count, sample))
    }
}
