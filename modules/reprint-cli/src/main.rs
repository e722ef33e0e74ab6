//! Operator CLI for the reprint pipeline.
//!
//! Exit codes: 0 success, 2 WeChat credentials expired, 3 rate limited,
//! 1 anything else — automation wraps these to decide whether to page the
//! operator for a re-login or simply retry later.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use browser_driver::{ChromiumDriver, DriverOptions};
use reprint_common::cookies::CookieJar;
use reprint_common::{Config, ReprintError, Result, SourceType};
use reprint_crawler::{BrowserFetcher, ContentExtractor, IntegratedCrawler, SiteRegistry};
use reprint_engine::workflow::{ExecuteOptions, WorkflowManager};
use reprint_engine::{install_signal_handlers, ProgressTracker};
use reprint_publisher::{BatchPublisher, DiscuzPublisher};
use reprint_store::ArticleStore;
use reprint_wechat::{FakeidCache, LinkDiscoverer, WechatAuth, WechatClient};

#[derive(Parser)]
#[command(name = "reprint")]
#[command(about = "Content aggregation and forum republish pipeline")]
#[command(version)]
struct Cli {
    /// Config file path (defaults to $REPRINT_CONFIG or config/settings.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover recent article links from tracked WeChat accounts
    CrawlLinks {
        /// Single account to check instead of the configured list
        #[arg(long)]
        account: Option<String>,
        /// Per-account article limit
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Fetch and extract content for pending articles
    CrawlContent {
        #[arg(long)]
        source_type: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        batch_size: Option<u32>,
    },
    /// Crawl an explicit list of URLs
    CrawlUrls {
        urls: Vec<String>,
        #[arg(long, default_value = "external")]
        source_type: String,
        #[arg(long, default_value = "manual")]
        source_name: String,
    },
    /// Publish completed articles into the Discuz forum
    Publish {
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Run, resume, or inspect workflow executions
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
    /// Per-source crawl statistics
    Stats,
}

#[derive(Subcommand)]
enum WorkflowCommands {
    /// Run the full workflow (or a subset of steps)
    Run {
        /// Steps to run, in order
        #[arg(long, value_delimiter = ',')]
        steps: Option<Vec<String>>,
        /// Start from this step
        #[arg(long)]
        from_step: Option<String>,
    },
    /// Resume an interrupted execution by id
    Resume { execution_id: String },
    /// Show gate decisions and recent executions
    Status {
        execution_id: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("reprint=info".parse().expect("valid directive")),
        )
        .init();

    let runtime = tokio::runtime::Runtime::new().expect("Failed to build tokio runtime");
    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Some(path) = &cli.config {
        std::env::set_var(reprint_common::config::CONFIG_PATH_ENV, path);
    }
    let config = Config::load()?;
    let store = ArticleStore::connect(&config.database.url()).await?;
    store.migrate().await?;

    let interrupted = Arc::new(AtomicBool::new(false));
    install_signal_handlers(interrupted.clone());

    match cli.command {
        Commands::CrawlLinks { account, limit } => {
            crawl_links(&config, &store, account, limit, &interrupted).await
        }
        Commands::CrawlContent {
            source_type,
            limit,
            batch_size,
        } => {
            let params = &config.workflow.steps.content_crawl.params;
            let mut crawler = build_crawler(&config, &store, &interrupted)?;
            let summary = crawler
                .batch(
                    source_type
                        .as_deref()
                        .or(params.source_type.as_deref())
                        .and_then(SourceType::parse),
                    limit.unwrap_or(params.limit),
                    batch_size.unwrap_or(params.batch_size),
                )
                .await;
            crawler.close().await?;
            let summary = summary?;
            println!(
                "processed {} article(s): {} ok, {} failed",
                summary.total_processed, summary.successful, summary.failed
            );
            Ok(())
        }
        Commands::CrawlUrls {
            urls,
            source_type,
            source_name,
        } => {
            let source_type = SourceType::parse(&source_type).ok_or_else(|| {
                ReprintError::Config(format!("unknown source type: {source_type}"))
            })?;
            let mut crawler = build_crawler(&config, &store, &interrupted)?;
            let outcomes = crawler.crawl_urls(&urls, source_type, &source_name).await;
            crawler.close().await?;
            for outcome in outcomes? {
                println!("{}", serde_json::to_string(&outcome).unwrap_or_default());
            }
            Ok(())
        }
        Commands::Publish { limit } => {
            let params = &config.workflow.steps.forum_publish.params;
            let publisher =
                DiscuzPublisher::connect(&config.discuz_database, config.forum_publisher.clone())
                    .await?;
            let batch =
                BatchPublisher::new(publisher, store.clone(), params, interrupted.clone());
            let summary = batch.publish_all(limit.unwrap_or(params.limit)).await?;
            println!(
                "published {} of {} article(s)",
                summary.success, summary.total
            );
            Ok(())
        }
        Commands::Workflow { command } => workflow(command, config, store, interrupted).await,
        Commands::Stats => {
            let stats = store.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats).unwrap_or_default());
            Ok(())
        }
    }
}

async fn crawl_links(
    config: &Config,
    store: &ArticleStore,
    account: Option<String>,
    limit: Option<u32>,
    interrupted: &Arc<AtomicBool>,
) -> Result<()> {
    let params = &config.workflow.steps.link_crawl.params;
    let auth = WechatAuth::load(&config.cfcj.wechat_auth_file)?;
    if !auth.is_complete() {
        return Err(ReprintError::CredentialsExpired(
            "wechat token/cookie missing; run the login flow".into(),
        ));
    }
    let client = WechatClient::new(auth);
    let cache = FakeidCache::open(&config.cfcj.fakeid_cache_file);
    let mut discoverer = LinkDiscoverer::new(client, store.clone(), cache);

    let accounts = match account {
        Some(account) => vec![account],
        None => params.accounts.clone(),
    };
    let limit_per_account = limit.unwrap_or(params.limit_per_account);
    let stats = discoverer
        .discover_all(
            &accounts,
            limit_per_account,
            params.total_limit.max(limit_per_account),
            interrupted,
        )
        .await?;
    println!(
        "checked {} account(s), registered {} article link(s)",
        stats.accounts_checked, stats.new_links
    );
    Ok(())
}

fn build_crawler(
    config: &Config,
    store: &ArticleStore,
    interrupted: &Arc<AtomicBool>,
) -> Result<IntegratedCrawler<ChromiumDriver>> {
    let cfcj = &config.cfcj;
    let registry = Arc::new(SiteRegistry::new(config.sites.clone())?);
    let driver = ChromiumDriver::new(DriverOptions {
        headless: cfcj.headless,
        user_agent: cfcj.user_agent.clone(),
        window_size: cfcj.window_size,
        request_timeout: Duration::from_secs(30),
    });
    let jar = CookieJar::open(&cfcj.cookie_file);
    let fetcher = BrowserFetcher::new(driver, jar, registry.clone(), cfcj.clone());
    let extractor = ContentExtractor::new(registry);
    Ok(IntegratedCrawler::new(
        store.clone(),
        fetcher,
        extractor,
        Duration::from_secs(cfcj.request_delay_secs),
        interrupted.clone(),
    ))
}

async fn workflow(
    command: WorkflowCommands,
    config: Config,
    store: ArticleStore,
    interrupted: Arc<AtomicBool>,
) -> Result<()> {
    let manager = WorkflowManager::new(config.clone(), store, interrupted);
    match command {
        WorkflowCommands::Run { steps, from_step } => {
            let outcome = manager
                .execute(ExecuteOptions {
                    steps,
                    from_step,
                    execution_id: None,
                    resume: false,
                })
                .await?;
            info!(
                execution_id = %outcome.execution_id,
                success = outcome.success,
                "Workflow finished"
            );
            println!("{}", serde_json::to_string_pretty(&outcome).unwrap_or_default());
            if outcome.success {
                Ok(())
            } else {
                Err(workflow_failure(&outcome))
            }
        }
        WorkflowCommands::Resume { execution_id } => {
            let outcome = manager
                .execute(ExecuteOptions {
                    steps: None,
                    from_step: None,
                    execution_id: Some(execution_id),
                    resume: true,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&outcome).unwrap_or_default());
            if outcome.success {
                Ok(())
            } else {
                Err(workflow_failure(&outcome))
            }
        }
        WorkflowCommands::Status { execution_id } => {
            match execution_id {
                Some(id) => {
                    let tracker = ProgressTracker::new(&config.scheduler.progress_dir);
                    let record = tracker.load_record(&id)?;
                    println!("{}", serde_json::to_string_pretty(&record).unwrap_or_default());
                }
                None => {
                    let gates = manager.check_status().await;
                    let tracker = ProgressTracker::new(&config.scheduler.progress_dir);
                    let recent = tracker.recent_executions(5);
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&serde_json::json!({
                            "gates": gates,
                            "recent_executions": recent,
                        }))
                        .unwrap_or_default()
                    );
                }
            }
            Ok(())
        }
    }
}

/// Map a failed workflow to the most specific exit-code-bearing error its
/// step records carry.
fn workflow_failure(outcome: &reprint_engine::WorkflowOutcome) -> ReprintError {
    for record in outcome.steps.values() {
        if let Some(error) = &record.error {
            if error.starts_with("CREDENTIALS_EXPIRED") {
                return ReprintError::CredentialsExpired(error.clone());
            }
            if error.starts_with("RATE_LIMITED") {
                return ReprintError::RateLimited(error.clone());
            }
        }
    }
    ReprintError::Config("workflow finished with failed or interrupted steps".into())
}
