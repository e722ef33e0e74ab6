//! Layered JSON configuration. Every tunable has a default; only database
//! credentials are hard requirements. The engine takes a snapshot per
//! execution, so a reload never changes a run in flight.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::info;

use crate::error::{ReprintError, Result};
use crate::sites::{self, SiteRule};

pub const CONFIG_PATH_ENV: &str = "REPRINT_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/settings.json";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub discuz_database: DatabaseConfig,
    #[serde(default)]
    pub forum_publisher: ForumPublisherConfig,
    #[serde(default)]
    pub sites: HashMap<String, SiteRule>,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub cfcj: CrawlerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    #[serde(default = "default_charset")]
    pub charset: String,
}

impl DatabaseConfig {
    pub fn url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForumPublisherConfig {
    #[serde(default = "default_forum_id")]
    pub target_forum_id: u32,
    #[serde(default = "default_publisher_uid")]
    pub publisher_user_id: u32,
    #[serde(default)]
    pub publisher_username: String,
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,
}

impl Default for ForumPublisherConfig {
    fn default() -> Self {
        ForumPublisherConfig {
            target_forum_id: default_forum_id(),
            publisher_user_id: default_publisher_uid(),
            publisher_username: String::new(),
            table_prefix: default_table_prefix(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub steps: StepsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StepsConfig {
    pub link_crawl: StepConfig<LinkCrawlParams>,
    pub content_crawl: StepConfig<ContentCrawlParams>,
    pub forum_publish: StepConfig<ForumPublishParams>,
}

impl Default for StepsConfig {
    fn default() -> Self {
        StepsConfig {
            link_crawl: StepConfig {
                enabled: true,
                timeout_secs: 600,
                retry_count: 2,
                params: LinkCrawlParams::default(),
            },
            content_crawl: StepConfig {
                enabled: true,
                timeout_secs: 1800,
                retry_count: 1,
                params: ContentCrawlParams::default(),
            },
            forum_publish: StepConfig {
                enabled: true,
                timeout_secs: 3600,
                retry_count: 1,
                params: ForumPublishParams::default(),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "P: serde::Deserialize<'de> + Default"))]
pub struct StepConfig<P> {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub timeout_secs: u64,
    pub retry_count: u32,
    #[serde(default)]
    pub params: P,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkCrawlParams {
    pub limit_per_account: u32,
    pub total_limit: u32,
    /// Account display names, or the single entry "all" for every account
    /// in the fakeid cache.
    pub accounts: Vec<String>,
}

impl Default for LinkCrawlParams {
    fn default() -> Self {
        LinkCrawlParams {
            limit_per_account: 10,
            total_limit: 50,
            accounts: vec!["all".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContentCrawlParams {
    pub source_type: Option<String>,
    pub limit: u32,
    pub batch_size: u32,
}

impl Default for ContentCrawlParams {
    fn default() -> Self {
        ContentCrawlParams {
            source_type: None,
            limit: 50,
            batch_size: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForumPublishParams {
    pub limit: u32,
    pub interval_min: u64,
    pub interval_max: u64,
}

impl Default for ForumPublishParams {
    fn default() -> Self {
        ForumPublishParams {
            limit: 100,
            interval_min: 60,
            interval_max: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub host: String,
    pub port: u16,
    pub schedule_file: PathBuf,
    pub progress_dir: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            schedule_file: PathBuf::from("config/schedule.json"),
            progress_dir: PathBuf::from("logs"),
        }
    }
}

/// Browser/crawler tunables, section name kept from the legacy config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    pub headless: bool,
    pub user_agent: String,
    pub window_size: (u32, u32),
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub cf_wait_secs: u64,
    pub request_delay_secs: u64,
    pub cookie_file: PathBuf,
    pub wechat_auth_file: PathBuf,
    pub fakeid_cache_file: PathBuf,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        CrawlerConfig {
            headless: true,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .to_string(),
            window_size: (1920, 1080),
            max_retries: 2,
            retry_delay_secs: 3,
            cf_wait_secs: 10,
            request_delay_secs: 2,
            cookie_file: PathBuf::from("data/cookies.json"),
            wechat_auth_file: PathBuf::from("data/id_info.json"),
            fakeid_cache_file: PathBuf::from("data/name2fakeid.json"),
        }
    }
}

impl Config {
    /// Load from `$REPRINT_CONFIG` or the default path.
    pub fn load() -> Result<Config> {
        let path = env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Config::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<Config> {
        let raw = fs::read_to_string(path).map_err(|e| {
            ReprintError::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        let mut config: Config = serde_json::from_str(&raw).map_err(|e| {
            ReprintError::Config(format!("cannot parse config {}: {e}", path.display()))
        })?;
        config.merge_default_sites();
        config.validate()?;
        info!(path = %path.display(), sites = config.sites.len(), "Configuration loaded");
        Ok(config)
    }

    /// Built-in site rules fill any key the user config does not define.
    fn merge_default_sites(&mut self) {
        for (key, rule) in sites::default_rules() {
            self.sites.entry(key).or_insert(rule);
        }
    }

    fn validate(&self) -> Result<()> {
        validate_db("database", &self.database)?;
        validate_db("discuz_database", &self.discuz_database)?;
        let p = &self.workflow.steps.forum_publish.params;
        if p.interval_min > p.interval_max {
            return Err(ReprintError::Config(format!(
                "forum_publish interval_min ({}) exceeds interval_max ({})",
                p.interval_min, p.interval_max
            )));
        }
        Ok(())
    }

    /// Log connection targets without leaking credentials.
    pub fn log_redacted(&self) {
        info!(
            "database = {}:{}/{}",
            self.database.host, self.database.port, self.database.database
        );
        info!(
            "discuz_database = {}:{}/{}",
            self.discuz_database.host, self.discuz_database.port, self.discuz_database.database
        );
        info!(
            "forum_publisher = fid {} / uid {}",
            self.forum_publisher.target_forum_id, self.forum_publisher.publisher_user_id
        );
    }
}

fn validate_db(section: &str, db: &DatabaseConfig) -> Result<()> {
    for (field, value) in [
        ("host", &db.host),
        ("user", &db.user),
        ("database", &db.database),
    ] {
        if value.is_empty() {
            return Err(ReprintError::Config(format!(
                "{section}.{field} is required"
            )));
        }
    }
    Ok(())
}

fn default_true() -> bool {
    true
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_charset() -> String {
    "utf8mb4".to_string()
}

fn default_forum_id() -> u32 {
    2
}

fn default_publisher_uid() -> u32 {
    4
}

fn default_table_prefix() -> String {
    "pre_".to_string()
}
