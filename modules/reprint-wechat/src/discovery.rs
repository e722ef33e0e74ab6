use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use reprint_common::{ReprintError, Result, SourceType};
use reprint_store::ArticleStore;

use crate::client::WechatClient;

/// Minimum pause between per-account backend calls.
const ACCOUNT_DELAY: Duration = Duration::from_secs(1);

/// Persistent display-name -> fakeid cache, written through on every
/// successful resolution. Display names are mutable on the platform;
/// fakeids are stable.
#[derive(Debug)]
pub struct FakeidCache {
    path: PathBuf,
    map: BTreeMap<String, String>,
}

impl FakeidCache {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let map = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        FakeidCache { path, map }
    }

    pub fn get(&self, account: &str) -> Option<&str> {
        self.map.get(account).filter(|v| !v.is_empty()).map(String::as_str)
    }

    pub fn insert(&mut self, account: &str, fakeid: &str) {
        self.map.insert(account.to_string(), fakeid.to_string());
        if let Err(e) = self.persist() {
            warn!(path = %self.path.display(), error = %e, "Failed to persist fakeid cache");
        }
    }

    /// All tracked account names. The cache doubles as the account roster
    /// when a step is configured with accounts = ["all"].
    pub fn account_names(&self) -> Vec<String> {
        self.map.keys().cloned().collect()
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| ReprintError::Config(format!("creating cache dir: {e}")))?;
            }
        }
        let json = serde_json::to_string_pretty(&self.map)
            .map_err(|e| ReprintError::Config(format!("serializing fakeid cache: {e}")))?;
        fs::write(&self.path, json)
            .map_err(|e| ReprintError::Config(format!("writing fakeid cache: {e}")))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryStats {
    pub accounts_checked: u32,
    pub accounts_skipped: u32,
    pub new_links: u32,
}

/// Walks tracked accounts and registers every discovered article link in
/// the store. Credential and rate-limit failures abort the walk; anything
/// else degrades to an empty per-account result.
pub struct LinkDiscoverer {
    client: WechatClient,
    store: ArticleStore,
    cache: FakeidCache,
    account_delay: Duration,
}

impl LinkDiscoverer {
    pub fn new(client: WechatClient, store: ArticleStore, cache: FakeidCache) -> Self {
        LinkDiscoverer {
            client,
            store,
            cache,
            account_delay: ACCOUNT_DELAY,
        }
    }

    /// Resolve the configured account list: the literal "all" expands to
    /// every account in the fakeid cache.
    pub fn resolve_accounts(&self, configured: &[String]) -> Vec<String> {
        if configured.iter().any(|a| a == "all") {
            self.cache.account_names()
        } else {
            configured.to_vec()
        }
    }

    /// Discover recent links for one account. Returns how many links were
    /// registered (idempotent upserts; re-discoveries count too).
    pub async fn discover_account(&mut self, account: &str, limit: u32) -> Result<u32> {
        let fakeid = match self.cache.get(account) {
            Some(fakeid) => fakeid.to_string(),
            None => match self.client.search_biz(account).await? {
                Some(fakeid) => {
                    self.cache.insert(account, &fakeid);
                    fakeid
                }
                None => {
                    warn!(account, "No fakeid; skipping account");
                    return Ok(0);
                }
            },
        };

        let articles = self.client.list_published(account, &fakeid, limit).await?;
        let mut upserted = 0u32;
        for article in &articles {
            self.store
                .upsert_link(
                    SourceType::Wechat,
                    &article.link,
                    Some(&article.title),
                    Some(article.publish_time),
                    Some(account),
                )
                .await?;
            upserted += 1;
        }
        info!(account, links = upserted, "Account discovery complete");
        Ok(upserted)
    }

    /// Discover across all requested accounts, stopping at `total_limit`
    /// registered links or when the interrupt flag is raised.
    pub async fn discover_all(
        &mut self,
        accounts: &[String],
        limit_per_account: u32,
        total_limit: u32,
        interrupted: &Arc<AtomicBool>,
    ) -> Result<DiscoveryStats> {
        let accounts = self.resolve_accounts(accounts);
        let mut stats = DiscoveryStats::default();

        info!(accounts = accounts.len(), "Starting link discovery");
        for (i, account) in accounts.iter().enumerate() {
            if interrupted.load(Ordering::Relaxed) {
                info!("Link discovery interrupted");
                break;
            }
            if stats.new_links >= total_limit {
                stats.accounts_skipped += (accounts.len() - i) as u32;
                break;
            }

            let remaining = total_limit - stats.new_links;
            let per_account = limit_per_account.min(remaining);
            stats.new_links += self.discover_account(account, per_account).await?;
            stats.accounts_checked += 1;

            if i + 1 < accounts.len() {
                tokio::time::sleep(self.account_delay).await;
            }
        }
        info!(
            checked = stats.accounts_checked,
            links = stats.new_links,
            "Link discovery finished"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fakeid_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("name2fakeid.json");

        let mut cache = FakeidCache::open(&path);
        assert!(cache.get("舞林攻略指南").is_none());
        cache.insert("舞林攻略指南", "Mzg4MDcwNTQxMw==");

        let reloaded = FakeidCache::open(&path);
        assert_eq!(reloaded.get("舞林攻略指南"), Some("Mzg4MDcwNTQxMw=="));
        assert_eq!(reloaded.account_names(), vec!["舞林攻略指南".to_string()]);
    }

    #[test]
    fn empty_fakeid_is_treated_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("name2fakeid.json");
        fs::write(&path, r#"{"某号": ""}"#).unwrap();

        let cache = FakeidCache::open(&path);
        assert!(cache.get("某号").is_none());
        // Still listed as tracked, so discovery will resolve it.
        assert_eq!(cache.account_names().len(), 1);
    }
}
