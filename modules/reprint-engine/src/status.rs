//! Gate checks: decide whether each step has work to do before running it.

use chrono::Local;
use serde::Serialize;
use tracing::warn;

use reprint_common::config::{ContentCrawlParams, ForumPublishParams, LinkCrawlParams};
use reprint_common::SourceType;
use reprint_store::ArticleStore;

/// Re-crawl an account once its latest fetch is at least this old.
const ACCOUNT_REFRESH_HOURS: i64 = 12;

#[derive(Debug, Clone, Serialize)]
pub struct GateDecision {
    pub should_execute: bool,
    pub reason: String,
    pub details: serde_json::Value,
    pub estimated_work: u32,
}

impl GateDecision {
    fn skip(reason: impl Into<String>) -> Self {
        GateDecision {
            should_execute: false,
            reason: reason.into(),
            details: serde_json::Value::Null,
            estimated_work: 0,
        }
    }
}

pub struct StatusChecker {
    store: ArticleStore,
}

impl StatusChecker {
    pub fn new(store: ArticleStore) -> Self {
        StatusChecker { store }
    }

    /// Per-account recency heuristic: crawl accounts never fetched or not
    /// fetched in the last 12 hours. A check error defaults to execute —
    /// missing a crawl is worse than an extra one.
    pub async fn check_link_crawl(
        &self,
        params: &LinkCrawlParams,
        accounts: &[String],
    ) -> GateDecision {
        let mut account_details = serde_json::Map::new();
        let mut estimated = 0u32;
        let now = Local::now().naive_local();

        for account in accounts {
            let (total, last_fetch) = match self.store.account_fetch_summary(account).await {
                Ok(summary) => summary,
                Err(e) => {
                    warn!(account, error = %e, "Link gate check failed, defaulting to execute");
                    return GateDecision {
                        should_execute: true,
                        reason: format!("status check failed, defaulting to execute: {e}"),
                        details: serde_json::Value::Null,
                        estimated_work: params.total_limit,
                    };
                }
            };

            let (should_crawl, reason) = match (total, last_fetch) {
                (0, _) => (true, "first crawl for this account".to_string()),
                (_, None) => (true, "no fetch record".to_string()),
                (_, Some(last)) => {
                    let hours = (now - last).num_minutes() as f64 / 60.0;
                    if hours >= ACCOUNT_REFRESH_HOURS as f64 {
                        (true, format!("{hours:.1}h since last fetch"))
                    } else {
                        (false, format!("fetched {hours:.1}h ago, within refresh window"))
                    }
                }
            };
            let estimate = if should_crawl { params.limit_per_account } else { 0 };
            estimated += estimate;
            account_details.insert(
                account.clone(),
                serde_json::json!({
                    "total_articles": total,
                    "last_fetch_time": last_fetch,
                    "estimated_new": estimate,
                    "reason": reason,
                }),
            );
        }

        let estimated = estimated.min(params.total_limit);
        let due = account_details
            .values()
            .filter(|d| d["estimated_new"].as_u64().unwrap_or(0) > 0)
            .count();
        GateDecision {
            should_execute: estimated > 0,
            reason: if estimated > 0 {
                format!("{due} account(s) due for discovery, up to {estimated} new links")
            } else {
                format!(
                    "all accounts fetched within the last {ACCOUNT_REFRESH_HOURS}h"
                )
            },
            details: serde_json::json!({
                "accounts": account_details,
                "total_limit": params.total_limit,
            }),
            estimated_work: estimated,
        }
    }

    /// Execute iff there are rows waiting for a content crawl. A check
    /// error skips the step (running a browser on bad state helps nobody).
    pub async fn check_content_crawl(&self, params: &ContentCrawlParams) -> GateDecision {
        let source_type = params.source_type.as_deref().and_then(SourceType::parse);
        let pending = match self.store.count_pending(source_type).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "Content gate check failed, skipping step");
                return GateDecision::skip(format!("status check failed: {e}"));
            }
        };
        let actual = pending.min(params.limit as u64) as u32;
        GateDecision {
            should_execute: actual > 0,
            reason: if actual > 0 {
                format!("{pending} article(s) pending content, will process {actual}")
            } else {
                "no articles pending content crawl".to_string()
            },
            details: serde_json::json!({
                "total_pending": pending,
                "limit": params.limit,
                "batch_size": params.batch_size,
            }),
            estimated_work: actual,
        }
    }

    /// Execute iff completed, unpublished articles exist. A check error
    /// skips the step.
    pub async fn check_forum_publish(&self, params: &ForumPublishParams) -> GateDecision {
        let pending = match self.store.count_unpublished().await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "Publish gate check failed, skipping step");
                return GateDecision::skip(format!("status check failed: {e}"));
            }
        };
        let actual = pending.min(params.limit as u64) as u32;
        GateDecision {
            should_execute: actual > 0,
            reason: if actual > 0 {
                format!("{pending} article(s) waiting for forum publish, will publish {actual}")
            } else {
                "no articles waiting for forum publish".to_string()
            },
            details: serde_json::json!({
                "total_pending": pending,
                "limit": params.limit,
                "interval_min": params.interval_min,
                "interval_max": params.interval_max,
            }),
            estimated_work: actual,
        }
    }
}
