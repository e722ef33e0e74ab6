//! Persistent schedule entries and their in-memory cron jobs.
//!
//! Entries are immutable once added: the file is append/delete only, and
//! every entry is re-registered into the cron scheduler at startup.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use reprint_common::{ReprintError, Result};

use crate::{runner, AppState};

const DAY_NAMES: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    /// One-shot WeChat link discovery.
    LinkCrawl,
    /// Full three-step workflow.
    Workflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    Daily,
    Weekly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    pub kind: ScheduleKind,
    pub schedule_type: ScheduleType,
    /// Weekly only: days of week, 0 = Monday .. 6 = Sunday.
    #[serde(default)]
    pub days: Vec<u8>,
    /// HH:MM, local time.
    pub time: String,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    pub created_at: String,
}

impl ScheduleEntry {
    pub fn new(
        kind: ScheduleKind,
        schedule_type: ScheduleType,
        days: Vec<u8>,
        time: String,
        account: Option<String>,
        limit: Option<u32>,
    ) -> Self {
        ScheduleEntry {
            id: format!("job_{}", Local::now().format("%Y%m%d%H%M%S%3f")),
            kind,
            schedule_type,
            days,
            time,
            account,
            limit,
            created_at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }

    /// Six-field cron expression (with seconds) for the scheduler.
    pub fn cron_expression(&self) -> Result<String> {
        let (hour, minute) = parse_time(&self.time)?;
        match self.schedule_type {
            ScheduleType::Daily => Ok(format!("0 {minute} {hour} * * *")),
            ScheduleType::Weekly => {
                if self.days.is_empty() {
                    return Err(ReprintError::Config(
                        "weekly schedule needs at least one day".into(),
                    ));
                }
                let mut names = Vec::new();
                for day in &self.days {
                    let name = DAY_NAMES.get(*day as usize).ok_or_else(|| {
                        ReprintError::Config(format!("day out of range: {day}"))
                    })?;
                    names.push(*name);
                }
                Ok(format!("0 {minute} {hour} * * {}", names.join(",")))
            }
        }
    }
}

fn parse_time(time: &str) -> Result<(u8, u8)> {
    let (h, m) = time
        .split_once(':')
        .ok_or_else(|| ReprintError::Config(format!("bad time: {time}")))?;
    let hour: u8 = h
        .parse()
        .map_err(|_| ReprintError::Config(format!("bad hour: {time}")))?;
    let minute: u8 = m
        .parse()
        .map_err(|_| ReprintError::Config(format!("bad minute: {time}")))?;
    if hour > 23 || minute > 59 {
        return Err(ReprintError::Config(format!("time out of range: {time}")));
    }
    Ok((hour, minute))
}

/// The on-disk schedule list.
#[derive(Debug)]
pub struct ScheduleBook {
    path: PathBuf,
    entries: Vec<ScheduleEntry>,
}

impl ScheduleBook {
    pub fn load(path: &Path) -> Self {
        let entries = fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        ScheduleBook {
            path: path.to_path_buf(),
            entries,
        }
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    pub fn add(&mut self, entry: ScheduleEntry) -> Result<()> {
        self.entries.push(entry);
        self.persist()
    }

    pub fn remove(&mut self, id: &str) -> Result<bool> {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        let removed = self.entries.len() != before;
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| ReprintError::Config(format!("creating schedule dir: {e}")))?;
            }
        }
        let json = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| ReprintError::Config(format!("serializing schedules: {e}")))?;
        fs::write(&self.path, json)
            .map_err(|e| ReprintError::Config(format!("writing schedules: {e}")))?;
        Ok(())
    }
}

/// In-memory cron scheduler plus the entry-id -> job-id mapping.
pub struct Scheduler {
    inner: JobScheduler,
    jobs: Mutex<HashMap<String, uuid::Uuid>>,
}

impl Scheduler {
    pub async fn start() -> anyhow::Result<Self> {
        let mut inner = JobScheduler::new().await?;
        inner.start().await?;
        Ok(Scheduler {
            inner,
            jobs: Mutex::new(HashMap::new()),
        })
    }

    pub async fn register(&self, state: Arc<AppState>, entry: &ScheduleEntry) -> Result<()> {
        let cron = entry.cron_expression()?;
        let entry_for_job = entry.clone();
        let job = Job::new_async(cron.as_str(), move |_id, _sched| {
            let state = state.clone();
            let entry = entry_for_job.clone();
            Box::pin(async move {
                run_scheduled(state, entry).await;
            })
        })
        .map_err(|e| ReprintError::Config(format!("cron job {}: {e}", entry.id)))?;

        let mut sched = self.inner.clone();
        let job_id = sched
            .add(job)
            .await
            .map_err(|e| ReprintError::Config(format!("registering job {}: {e}", entry.id)))?;
        self.jobs.lock().await.insert(entry.id.clone(), job_id);
        info!(id = %entry.id, cron = %cron, "Schedule registered");
        Ok(())
    }

    pub async fn unregister(&self, entry_id: &str) {
        let job_id = self.jobs.lock().await.remove(entry_id);
        if let Some(job_id) = job_id {
            let mut sched = self.inner.clone();
            if let Err(e) = sched.remove(&job_id).await {
                warn!(id = entry_id, error = %e, "Failed to remove cron job");
            }
        }
    }
}

/// Register every persisted entry at startup.
pub async fn reinstate_all(state: Arc<AppState>) -> anyhow::Result<()> {
    let entries: Vec<ScheduleEntry> = state.schedules.lock().await.entries().to_vec();
    for entry in entries {
        if let Err(e) = state.scheduler.register(state.clone(), &entry).await {
            warn!(id = %entry.id, error = %e, "Could not reinstate schedule entry");
        }
    }
    Ok(())
}

async fn run_scheduled(state: Arc<AppState>, entry: ScheduleEntry) {
    info!(id = %entry.id, kind = ?entry.kind, "Scheduled job firing");
    let result = match entry.kind {
        ScheduleKind::LinkCrawl => {
            runner::run_link_crawl(&state, entry.account.clone(), entry.limit)
                .await
                .map(|stats| format!("{} new link(s)", stats.new_links))
        }
        ScheduleKind::Workflow => runner::spawn_workflow(&state, Default::default())
            .map(|id| format!("execution {id}")),
    };
    match result {
        Ok(msg) => info!(id = %entry.id, %msg, "Scheduled job done"),
        Err(e) => error!(id = %entry.id, error = %e, "Scheduled job failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(schedule_type: ScheduleType, days: Vec<u8>, time: &str) -> ScheduleEntry {
        ScheduleEntry::new(
            ScheduleKind::LinkCrawl,
            schedule_type,
            days,
            time.to_string(),
            None,
            Some(10),
        )
    }

    #[test]
    fn daily_cron_expression() {
        let e = entry(ScheduleType::Daily, vec![], "09:30");
        assert_eq!(e.cron_expression().unwrap(), "0 30 9 * * *");
    }

    #[test]
    fn weekly_cron_expression_uses_day_names() {
        let e = entry(ScheduleType::Weekly, vec![0, 4], "23:05");
        assert_eq!(e.cron_expression().unwrap(), "0 5 23 * * Mon,Fri");
    }

    #[test]
    fn weekly_without_days_is_rejected() {
        assert!(entry(ScheduleType::Weekly, vec![], "09:00")
            .cron_expression()
            .is_err());
    }

    #[test]
    fn bad_times_are_rejected() {
        assert!(entry(ScheduleType::Daily, vec![], "25:00").cron_expression().is_err());
        assert!(entry(ScheduleType::Daily, vec![], "0930").cron_expression().is_err());
        assert!(entry(ScheduleType::Daily, vec![], "09:61").cron_expression().is_err());
    }

    #[test]
    fn book_round_trips_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.json");

        let mut book = ScheduleBook::load(&path);
        let e = entry(ScheduleType::Daily, vec![], "08:00");
        let id = e.id.clone();
        book.add(e).unwrap();

        let reloaded = ScheduleBook::load(&path);
        assert_eq!(reloaded.entries().len(), 1);
        assert_eq!(reloaded.entries()[0].id, id);

        let mut book = reloaded;
        assert!(book.remove(&id).unwrap());
        assert!(!book.remove(&id).unwrap());
        assert!(ScheduleBook::load(&path).entries().is_empty());
    }
}
