//! Durable execution journal: one JSON file per execution, atomically
//! rewritten on every state transition so a crash can always resume from
//! the last completed step.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use reprint_common::{ReprintError, Result};

/// Log ring bounds: at the high-water mark the oldest entries are dropped
/// down to the low-water mark.
const LOG_HIGH_WATER: usize = 1000;
const LOG_LOW_WATER: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StepRecord {
    fn new() -> Self {
        StepRecord {
            status: StepStatus::Pending,
            start_time: None,
            end_time: None,
            duration_secs: None,
            result: None,
            error: None,
            reason: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Summary {
    pub total_steps: u32,
    pub completed_steps: u32,
    pub failed_steps: u32,
    pub skipped_steps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: NaiveDateTime,
    pub level: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub start_time: NaiveDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<NaiveDateTime>,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default)]
    pub steps: BTreeMap<String, StepRecord>,
    #[serde(default)]
    pub summary: Summary,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration_secs: Option<f64>,
}

pub struct ProgressTracker {
    dir: PathBuf,
    current: Option<ExecutionRecord>,
}

impl ProgressTracker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ProgressTracker {
            dir: dir.into(),
            current: None,
        }
    }

    /// Begin a fresh execution. The id defaults to a local timestamp.
    pub fn start_execution(&mut self, execution_id: Option<String>) -> Result<String> {
        let id = execution_id
            .unwrap_or_else(|| Local::now().format("%Y%m%d_%H%M%S").to_string());
        self.current = Some(ExecutionRecord {
            execution_id: id.clone(),
            start_time: Local::now().naive_local(),
            end_time: None,
            status: ExecutionStatus::Running,
            current_step: None,
            steps: BTreeMap::new(),
            summary: Summary::default(),
            logs: Vec::new(),
            total_duration_secs: None,
        });
        self.save()?;
        info!(execution_id = %id, "Execution started");
        Ok(id)
    }

    /// Load a previous execution for resume.
    pub fn load_execution(&mut self, execution_id: &str) -> Result<()> {
        let path = self.record_path(execution_id);
        let record = read_record(&path)?;
        info!(execution_id, status = ?record.status, "Execution loaded for resume");
        self.current = Some(record);
        Ok(())
    }

    pub fn record(&self) -> Option<&ExecutionRecord> {
        self.current.as_ref()
    }

    pub fn step_status(&self, step: &str) -> Option<StepStatus> {
        self.current
            .as_ref()
            .and_then(|r| r.steps.get(step))
            .map(|s| s.status)
    }

    pub fn step_running(&mut self, step: &str) -> Result<()> {
        // A step re-entering running (resume, retry) takes back whatever
        // outcome it had, so the summary reflects this run.
        if let Some(current) = self.current.as_mut() {
            if let Some(record) = current.steps.get(step) {
                match record.status {
                    StepStatus::Completed => {
                        current.summary.completed_steps =
                            current.summary.completed_steps.saturating_sub(1)
                    }
                    StepStatus::Failed => {
                        current.summary.failed_steps =
                            current.summary.failed_steps.saturating_sub(1)
                    }
                    StepStatus::Skipped => {
                        current.summary.skipped_steps =
                            current.summary.skipped_steps.saturating_sub(1)
                    }
                    _ => {}
                }
            }
        }
        self.touch_step(step, |record| {
            record.status = StepStatus::Running;
            record.start_time = Some(Local::now().naive_local());
            record.end_time = None;
            record.duration_secs = None;
            record.error = None;
            record.reason = None;
        })?;
        if let Some(current) = self.current.as_mut() {
            current.current_step = Some(step.to_string());
        }
        self.log("info", &format!("step {step}: running"), Some(step))
    }

    pub fn step_completed(&mut self, step: &str, result: serde_json::Value) -> Result<()> {
        self.finish_step(step, StepStatus::Completed, |record| {
            record.result = Some(result);
        })?;
        self.log("info", &format!("step {step}: completed"), Some(step))
    }

    pub fn step_failed(&mut self, step: &str, error: &str) -> Result<()> {
        let error = error.to_string();
        self.finish_step(step, StepStatus::Failed, move |record| {
            record.error = Some(error);
        })?;
        self.log("error", &format!("step {step}: failed"), Some(step))
    }

    pub fn step_skipped(&mut self, step: &str, reason: &str) -> Result<()> {
        let reason = reason.to_string();
        self.finish_step(step, StepStatus::Skipped, move |record| {
            record.reason = Some(reason);
        })?;
        self.log("info", &format!("step {step}: skipped"), Some(step))
    }

    /// Append a log entry, trimming the ring when it overflows.
    pub fn log(&mut self, level: &str, message: &str, step: Option<&str>) -> Result<()> {
        let Some(current) = self.current.as_mut() else { return Ok(()) };
        current.logs.push(LogEntry {
            timestamp: Local::now().naive_local(),
            level: level.to_string(),
            message: message.to_string(),
            step: step.map(String::from),
        });
        if current.logs.len() > LOG_HIGH_WATER {
            let drop = current.logs.len() - LOG_LOW_WATER;
            current.logs.drain(..drop);
        }
        self.save()
    }

    pub fn finish_execution(&mut self, status: ExecutionStatus) -> Result<()> {
        let Some(current) = self.current.as_mut() else { return Ok(()) };
        let now = Local::now().naive_local();
        current.end_time = Some(now);
        current.status = status;
        current.current_step = None;
        current.total_duration_secs =
            Some((now - current.start_time).num_milliseconds() as f64 / 1000.0);
        let id = current.execution_id.clone();
        self.save()?;
        info!(execution_id = %id, status = ?status, "Execution finished");
        Ok(())
    }

    /// Executions still marked running on disk, newest first.
    pub fn resumable_executions(&self) -> Vec<ExecutionRecord> {
        let mut records = self.all_executions();
        records.retain(|r| r.status == ExecutionStatus::Running);
        records
    }

    /// Most recent executions, newest first.
    pub fn recent_executions(&self, limit: usize) -> Vec<ExecutionRecord> {
        let mut records = self.all_executions();
        records.truncate(limit);
        records
    }

    pub fn load_record(&self, execution_id: &str) -> Result<ExecutionRecord> {
        read_record(&self.record_path(execution_id))
    }

    fn all_executions(&self) -> Vec<ExecutionRecord> {
        let Ok(entries) = fs::read_dir(&self.dir) else { return Vec::new() };
        let mut records: Vec<ExecutionRecord> = entries
            .flatten()
            .filter(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.starts_with("progress_") && name.ends_with(".json")
            })
            .filter_map(|e| match read_record(&e.path()) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(path = %e.path().display(), error = %err, "Unreadable progress file");
                    None
                }
            })
            .collect();
        records.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        records
    }

    fn touch_step(&mut self, step: &str, apply: impl FnOnce(&mut StepRecord)) -> Result<()> {
        let Some(current) = self.current.as_mut() else { return Ok(()) };
        let is_new = !current.steps.contains_key(step);
        let record = current
            .steps
            .entry(step.to_string())
            .or_insert_with(StepRecord::new);
        apply(record);
        if is_new {
            current.summary.total_steps += 1;
        }
        self.save()
    }

    fn finish_step(
        &mut self,
        step: &str,
        status: StepStatus,
        apply: impl FnOnce(&mut StepRecord),
    ) -> Result<()> {
        let Some(current) = self.current.as_mut() else { return Ok(()) };
        let is_new = !current.steps.contains_key(step);
        let record = current
            .steps
            .entry(step.to_string())
            .or_insert_with(StepRecord::new);
        let previous = record.status;
        let now = Local::now().naive_local();
        record.status = status;
        record.end_time = Some(now);
        if let Some(start) = record.start_time {
            record.duration_secs = Some((now - start).num_milliseconds() as f64 / 1000.0);
        }
        apply(record);

        if is_new {
            current.summary.total_steps += 1;
        }
        if previous != status {
            // A re-finished step (resume paths) trades its old counter for
            // the new one.
            match previous {
                StepStatus::Completed => {
                    current.summary.completed_steps =
                        current.summary.completed_steps.saturating_sub(1)
                }
                StepStatus::Failed => {
                    current.summary.failed_steps =
                        current.summary.failed_steps.saturating_sub(1)
                }
                StepStatus::Skipped => {
                    current.summary.skipped_steps =
                        current.summary.skipped_steps.saturating_sub(1)
                }
                _ => {}
            }
            match status {
                StepStatus::Completed => current.summary.completed_steps += 1,
                StepStatus::Failed => current.summary.failed_steps += 1,
                StepStatus::Skipped => current.summary.skipped_steps += 1,
                _ => {}
            }
        }
        if current.current_step.as_deref() == Some(step) {
            current.current_step = None;
        }
        self.save()
    }

    fn record_path(&self, execution_id: &str) -> PathBuf {
        self.dir.join(format!("progress_{execution_id}.json"))
    }

    /// Atomic write: temp file in the same directory, then rename.
    fn save(&self) -> Result<()> {
        let Some(current) = self.current.as_ref() else { return Ok(()) };
        fs::create_dir_all(&self.dir)
            .map_err(|e| ReprintError::Config(format!("creating progress dir: {e}")))?;
        let path = self.record_path(&current.execution_id);
        let json = serde_json::to_string_pretty(current)
            .map_err(|e| ReprintError::Config(format!("serializing progress: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .map_err(|e| ReprintError::Config(format!("writing progress: {e}")))?;
        fs::rename(&tmp, &path)
            .map_err(|e| ReprintError::Config(format!("replacing progress: {e}")))?;
        Ok(())
    }
}

fn read_record(path: &Path) -> Result<ExecutionRecord> {
    let raw = fs::read_to_string(path)
        .map_err(|e| ReprintError::Config(format!("reading {}: {e}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|e| ReprintError::Config(format!("parsing {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = ProgressTracker::new(dir.path());

        let id = tracker.start_execution(Some("20240501_120000".into())).unwrap();
        tracker.step_running("link_crawl").unwrap();
        tracker
            .step_completed("link_crawl", serde_json::json!({"new_articles": 2}))
            .unwrap();
        tracker.step_running("content_crawl").unwrap();
        // Crash here: reload from disk.

        let mut resumed = ProgressTracker::new(dir.path());
        resumed.load_execution(&id).unwrap();
        let record = resumed.record().unwrap();
        assert_eq!(record.status, ExecutionStatus::Running);
        assert_eq!(
            resumed.step_status("link_crawl"),
            Some(StepStatus::Completed)
        );
        assert_eq!(
            resumed.step_status("content_crawl"),
            Some(StepStatus::Running)
        );
        assert_eq!(record.summary.completed_steps, 1);
    }

    #[test]
    fn completed_steps_are_not_rerun_on_resume() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = ProgressTracker::new(dir.path());
        let id = tracker.start_execution(None).unwrap();
        tracker.step_running("link_crawl").unwrap();
        tracker.step_completed("link_crawl", serde_json::json!({})).unwrap();

        let mut resumed = ProgressTracker::new(dir.path());
        resumed.load_execution(&id).unwrap();
        assert_eq!(
            resumed.step_status("link_crawl"),
            Some(StepStatus::Completed)
        );
    }

    #[test]
    fn rerunning_a_step_takes_back_its_previous_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = ProgressTracker::new(dir.path());
        tracker.start_execution(None).unwrap();
        tracker.step_skipped("link_crawl", "status check failed").unwrap();
        assert_eq!(tracker.record().unwrap().summary.skipped_steps, 1);

        // Re-entering running clears the old outcome and its counter.
        tracker.step_running("link_crawl").unwrap();
        let record = tracker.record().unwrap();
        assert_eq!(record.summary.skipped_steps, 0);
        assert_eq!(record.summary.total_steps, 1);
        let step = &record.steps["link_crawl"];
        assert_eq!(step.status, StepStatus::Running);
        assert!(step.reason.is_none());
        assert!(step.end_time.is_none());

        tracker
            .step_completed("link_crawl", serde_json::json!({}))
            .unwrap();
        let summary = &tracker.record().unwrap().summary;
        assert_eq!(summary.completed_steps, 1);
        assert_eq!(summary.skipped_steps, 0);
        assert_eq!(summary.total_steps, 1);
    }

    #[test]
    fn log_ring_drops_oldest_on_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = ProgressTracker::new(dir.path());
        tracker.start_execution(None).unwrap();
        for i in 0..1001 {
            tracker.log("info", &format!("entry {i}"), None).unwrap();
        }
        let record = tracker.record().unwrap();
        assert_eq!(record.logs.len(), LOG_LOW_WATER);
        assert_eq!(record.logs.last().unwrap().message, "entry 1000");
        assert_eq!(record.logs.first().unwrap().message, "entry 501");
    }

    #[test]
    fn finish_sets_duration_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = ProgressTracker::new(dir.path());
        let id = tracker.start_execution(None).unwrap();
        tracker.finish_execution(ExecutionStatus::Interrupted).unwrap();

        let record = tracker.load_record(&id).unwrap();
        assert_eq!(record.status, ExecutionStatus::Interrupted);
        assert!(record.end_time.is_some());
        assert!(record.total_duration_secs.is_some());
        assert!(record.current_step.is_none());
    }

    #[test]
    fn resumable_lists_only_running_executions() {
        let dir = tempfile::tempdir().unwrap();
        let mut t1 = ProgressTracker::new(dir.path());
        t1.start_execution(Some("20240501_010000".into())).unwrap();
        t1.finish_execution(ExecutionStatus::Completed).unwrap();

        let mut t2 = ProgressTracker::new(dir.path());
        t2.start_execution(Some("20240501_020000".into())).unwrap();
        // Left running.

        let resumable = t2.resumable_executions();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].execution_id, "20240501_020000");

        let recent = t2.recent_executions(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].execution_id, "20240501_020000");
    }

    #[test]
    fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = ProgressTracker::new(dir.path());
        tracker.start_execution(None).unwrap();
        tracker.step_running("link_crawl").unwrap();
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
