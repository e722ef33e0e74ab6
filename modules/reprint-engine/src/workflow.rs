//! The workflow manager: sequences the three steps with gating, retries,
//! timeouts, journaling, and cooperative interruption.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use reprint_common::{Config, ReprintError, Result};
use reprint_store::ArticleStore;

use crate::progress::{ExecutionStatus, ProgressTracker, StepRecord, StepStatus, Summary};
use crate::status::StatusChecker;
use crate::steps::StepExecutor;

pub const STEP_ORDER: [&str; 3] = ["link_crawl", "content_crawl", "forum_publish"];

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Subset of steps to run; None = all enabled steps in order.
    pub steps: Option<Vec<String>>,
    /// Start from this step, skipping earlier ones.
    pub from_step: Option<String>,
    /// Id for a fresh execution (defaults to a timestamp).
    pub execution_id: Option<String>,
    /// Resume the execution named by `execution_id` instead of starting new.
    pub resume: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowOutcome {
    pub success: bool,
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub summary: Summary,
    pub steps: BTreeMap<String, StepRecord>,
}

pub struct WorkflowManager {
    config: Config,
    store: ArticleStore,
    progress_dir: PathBuf,
    interrupted: Arc<AtomicBool>,
}

impl WorkflowManager {
    pub fn new(config: Config, store: ArticleStore, interrupted: Arc<AtomicBool>) -> Self {
        let progress_dir = config.scheduler.progress_dir.clone();
        WorkflowManager {
            config,
            store,
            progress_dir,
            interrupted,
        }
    }

    /// Gate decisions for every enabled step, without running anything.
    pub async fn check_status(&self) -> serde_json::Value {
        let checker = StatusChecker::new(self.store.clone());
        let executor = StepExecutor::new(
            self.config.clone(),
            self.store.clone(),
            self.interrupted.clone(),
        );
        let steps = &self.config.workflow.steps;
        let accounts = executor.tracked_accounts();

        let link = checker.check_link_crawl(&steps.link_crawl.params, &accounts).await;
        let content = checker.check_content_crawl(&steps.content_crawl.params).await;
        let publish = checker.check_forum_publish(&steps.forum_publish.params).await;
        serde_json::json!({
            "link_crawl": link,
            "content_crawl": content,
            "forum_publish": publish,
        })
    }

    pub async fn execute(&self, options: ExecuteOptions) -> Result<WorkflowOutcome> {
        let mut tracker = ProgressTracker::new(&self.progress_dir);
        let execution_id = if options.resume {
            let id = options.execution_id.clone().ok_or_else(|| {
                ReprintError::Config("resume requires an execution id".into())
            })?;
            tracker.load_execution(&id)?;
            id
        } else {
            tracker.start_execution(options.execution_id.clone())?
        };

        let checker = StatusChecker::new(self.store.clone());
        let executor = StepExecutor::new(
            self.config.clone(),
            self.store.clone(),
            self.interrupted.clone(),
        );

        let plan = self.plan_steps(&options)?;
        info!(execution_id = %execution_id, steps = ?plan, "Executing workflow");

        let mut any_failed = false;
        for step in plan {
            if self.interrupted.load(Ordering::Relaxed) {
                info!("Workflow interrupted before step {step}");
                break;
            }

            // Resume semantics: only a completed step is never re-run.
            // Failed, skipped, and mid-flight steps all go back through
            // their gate — a skip recorded off a transient check failure
            // must not outlive the condition that caused it.
            if options.resume && tracker.step_status(step) == Some(StepStatus::Completed) {
                info!(step, "Step already completed, not re-running");
                continue;
            }

            if !self.step_enabled(step) {
                tracker.step_skipped(step, "step disabled in config")?;
                continue;
            }

            let gate = self.gate(&checker, &executor, step).await;
            if !gate.should_execute {
                info!(step, reason = %gate.reason, "Gate says skip");
                tracker.step_skipped(step, &gate.reason)?;
                continue;
            }

            tracker.step_running(step)?;
            if !self.run_step(&executor, &mut tracker, step).await? {
                any_failed = true;
            }
        }

        let interrupted = self.interrupted.load(Ordering::Relaxed);
        let final_status = if interrupted {
            ExecutionStatus::Interrupted
        } else {
            ExecutionStatus::Completed
        };
        tracker.finish_execution(final_status)?;

        let record = tracker
            .record()
            .ok_or_else(|| ReprintError::Config("execution record missing".into()))?;
        Ok(WorkflowOutcome {
            success: !interrupted && !any_failed,
            execution_id,
            status: final_status,
            summary: record.summary.clone(),
            steps: record.steps.clone(),
        })
    }

    /// Run a step under its timeout with its retry budget. Returns whether
    /// the step ultimately completed. Errors from the tracker itself
    /// propagate; step failures never do.
    async fn run_step(
        &self,
        executor: &StepExecutor,
        tracker: &mut ProgressTracker,
        step: &str,
    ) -> Result<bool> {
        let (timeout_secs, retry_count) = self.step_budget(step);
        let timeout = Duration::from_secs(timeout_secs);

        let mut last_error = String::new();
        for attempt in 0..=retry_count {
            if self.interrupted.load(Ordering::Relaxed) {
                break;
            }
            if attempt > 0 {
                info!(step, attempt, "Retrying step");
                tracker.log("warn", &format!("step {step}: retry {attempt}"), Some(step))?;
            }

            let result = match tokio::time::timeout(timeout, executor.run(step)).await {
                Ok(result) => result,
                Err(_) => Err(ReprintError::Timeout(timeout_secs)),
            };

            match result {
                Ok(value) => {
                    tracker.step_completed(step, value)?;
                    return Ok(true);
                }
                Err(e @ ReprintError::CredentialsExpired(_)) => {
                    // Not retryable; reported with a stable reason string so
                    // operators can be notified to re-login.
                    error!(step, error = %e, "Credentials expired");
                    tracker.step_failed(step, &format!("CREDENTIALS_EXPIRED: {e}"))?;
                    return Ok(false);
                }
                Err(e @ ReprintError::RateLimited(_)) => {
                    error!(step, error = %e, "Rate limited");
                    tracker.step_failed(step, &format!("RATE_LIMITED: {e}"))?;
                    return Ok(false);
                }
                Err(e) => {
                    warn!(step, attempt, error = %e, "Step attempt failed");
                    last_error = e.to_string();
                }
            }
        }

        tracker.step_failed(step, &last_error)?;
        Ok(false)
    }

    async fn gate(
        &self,
        checker: &StatusChecker,
        executor: &StepExecutor,
        step: &str,
    ) -> crate::status::GateDecision {
        let steps = &self.config.workflow.steps;
        match step {
            "link_crawl" => {
                let accounts = executor.tracked_accounts();
                checker.check_link_crawl(&steps.link_crawl.params, &accounts).await
            }
            "content_crawl" => checker.check_content_crawl(&steps.content_crawl.params).await,
            "forum_publish" => checker.check_forum_publish(&steps.forum_publish.params).await,
            _ => crate::status::GateDecision {
                should_execute: false,
                reason: format!("unknown step: {step}"),
                details: serde_json::Value::Null,
                estimated_work: 0,
            },
        }
    }

    fn plan_steps(&self, options: &ExecuteOptions) -> Result<Vec<&'static str>> {
        let mut plan: Vec<&'static str> = match &options.steps {
            Some(requested) => {
                let mut plan = Vec::new();
                for name in requested {
                    let step = STEP_ORDER
                        .iter()
                        .find(|s| **s == *name)
                        .ok_or_else(|| {
                            ReprintError::Config(format!("unknown step: {name}"))
                        })?;
                    plan.push(*step);
                }
                plan
            }
            None => STEP_ORDER.to_vec(),
        };
        if let Some(from) = &options.from_step {
            let idx = plan
                .iter()
                .position(|s| *s == from.as_str())
                .ok_or_else(|| ReprintError::Config(format!("unknown start step: {from}")))?;
            plan = plan.split_off(idx);
        }
        Ok(plan)
    }

    fn step_enabled(&self, step: &str) -> bool {
        let steps = &self.config.workflow.steps;
        match step {
            "link_crawl" => steps.link_crawl.enabled,
            "content_crawl" => steps.content_crawl.enabled,
            "forum_publish" => steps.forum_publish.enabled,
            _ => false,
        }
    }

    fn step_budget(&self, step: &str) -> (u64, u32) {
        let steps = &self.config.workflow.steps;
        match step {
            "link_crawl" => (steps.link_crawl.timeout_secs, steps.link_crawl.retry_count),
            "content_crawl" => (
                steps.content_crawl.timeout_secs,
                steps.content_crawl.retry_count,
            ),
            "forum_publish" => (
                steps.forum_publish.timeout_secs,
                steps.forum_publish.retry_count,
            ),
            _ => (3600, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ExecuteOptions {
        ExecuteOptions::default()
    }

    fn manager_for_plan_tests() -> WorkflowManager {
        // plan_steps and step_budget never touch the store or the network;
        // a lazily-connecting pool is enough to build the manager.
        let config: Config = serde_json::from_str(
            r#"{
                "database": {"host": "db", "user": "u", "password": "p", "database": "wz"},
                "discuz_database": {"host": "db", "user": "u", "password": "p", "database": "bbs"}
            }"#,
        )
        .unwrap();
        let pool = sqlx::mysql::MySqlPoolOptions::new()
            .connect_lazy("mysql://u:p@localhost:3306/wz")
            .unwrap();
        WorkflowManager::new(
            config,
            ArticleStore::new(pool),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[tokio::test]
    async fn default_plan_is_the_full_order() {
        let manager = manager_for_plan_tests();
        assert_eq!(manager.plan_steps(&options()).unwrap(), STEP_ORDER.to_vec());
    }

    #[tokio::test]
    async fn from_step_drops_earlier_steps() {
        let manager = manager_for_plan_tests();
        let plan = manager
            .plan_steps(&ExecuteOptions {
                from_step: Some("content_crawl".into()),
                ..options()
            })
            .unwrap();
        assert_eq!(plan, vec!["content_crawl", "forum_publish"]);
    }

    #[tokio::test]
    async fn explicit_step_subset_is_validated() {
        let manager = manager_for_plan_tests();
        let plan = manager
            .plan_steps(&ExecuteOptions {
                steps: Some(vec!["forum_publish".into()]),
                ..options()
            })
            .unwrap();
        assert_eq!(plan, vec!["forum_publish"]);

        assert!(manager
            .plan_steps(&ExecuteOptions {
                steps: Some(vec!["nope".into()]),
                ..options()
            })
            .is_err());
    }

    #[tokio::test]
    async fn step_budgets_come_from_config() {
        let manager = manager_for_plan_tests();
        assert_eq!(manager.step_budget("link_crawl"), (600, 2));
        assert_eq!(manager.step_budget("content_crawl"), (1800, 1));
        assert_eq!(manager.step_budget("forum_publish"), (3600, 1));
    }

    /// Config for resume tests: only link_crawl enabled, pointing at files
    /// under `dir` and an unreachable database so every check fails fast.
    fn resume_config(dir: &std::path::Path) -> Config {
        serde_json::from_value(serde_json::json!({
            "database": {"host": "db", "user": "u", "password": "p", "database": "wz"},
            "discuz_database": {"host": "db", "user": "u", "password": "p", "database": "bbs"},
            "workflow": {"steps": {
                "link_crawl": {
                    "enabled": true, "timeout_secs": 5, "retry_count": 0,
                    "params": {"limit_per_account": 1, "total_limit": 1, "accounts": ["测试号"]}
                },
                "content_crawl": {"enabled": false, "timeout_secs": 5, "retry_count": 0},
                "forum_publish": {"enabled": false, "timeout_secs": 5, "retry_count": 0}
            }},
            "scheduler": {"progress_dir": dir.join("logs")},
            "cfcj": {
                "wechat_auth_file": dir.join("missing_auth.json"),
                "fakeid_cache_file": dir.join("name2fakeid.json")
            }
        }))
        .unwrap()
    }

    fn unreachable_store() -> ArticleStore {
        let pool = sqlx::mysql::MySqlPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_millis(100))
            .connect_lazy("mysql://u:p@127.0.0.1:1/none")
            .unwrap();
        ArticleStore::new(pool)
    }

    #[tokio::test(start_paused = true)]
    async fn resume_reevaluates_previously_skipped_steps() {
        let dir = tempfile::tempdir().unwrap();
        let config = resume_config(dir.path());
        let progress_dir = config.scheduler.progress_dir.clone();

        // A previous run recorded link_crawl as skipped off a transient
        // status-check failure, then got interrupted.
        let mut tracker = ProgressTracker::new(&progress_dir);
        tracker.start_execution(Some("E1".into())).unwrap();
        tracker
            .step_skipped("link_crawl", "status check failed")
            .unwrap();
        tracker
            .finish_execution(ExecutionStatus::Interrupted)
            .unwrap();

        let manager = WorkflowManager::new(
            config,
            unreachable_store(),
            Arc::new(AtomicBool::new(false)),
        );
        let outcome = manager
            .execute(ExecuteOptions {
                execution_id: Some("E1".into()),
                resume: true,
                ..ExecuteOptions::default()
            })
            .await
            .unwrap();

        // The skip did not stick: the gate ran again (defaulting to execute
        // on check error) and the step actually executed, failing on the
        // missing auth file instead of staying skipped.
        let link = &outcome.steps["link_crawl"];
        assert_eq!(link.status, StepStatus::Failed);
        assert!(link
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("wechat auth"));
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn resume_never_reruns_completed_steps() {
        let dir = tempfile::tempdir().unwrap();
        let config = resume_config(dir.path());
        let progress_dir = config.scheduler.progress_dir.clone();

        let mut tracker = ProgressTracker::new(&progress_dir);
        tracker.start_execution(Some("E2".into())).unwrap();
        tracker.step_running("link_crawl").unwrap();
        tracker
            .step_completed("link_crawl", serde_json::json!({"new_articles": 7}))
            .unwrap();
        tracker
            .finish_execution(ExecutionStatus::Interrupted)
            .unwrap();

        let manager = WorkflowManager::new(
            config,
            unreachable_store(),
            Arc::new(AtomicBool::new(false)),
        );
        let outcome = manager
            .execute(ExecuteOptions {
                execution_id: Some("E2".into()),
                resume: true,
                ..ExecuteOptions::default()
            })
            .await
            .unwrap();

        // The completed step kept its original result untouched; the
        // disabled steps were recorded as skipped without touching the
        // (unreachable) database.
        assert!(outcome.success);
        let link = &outcome.steps["link_crawl"];
        assert_eq!(link.status, StepStatus::Completed);
        assert_eq!(
            link.result,
            Some(serde_json::json!({"new_articles": 7}))
        );
        assert_eq!(outcome.steps["content_crawl"].status, StepStatus::Skipped);
        assert_eq!(outcome.steps["forum_publish"].status, StepStatus::Skipped);
    }
}
