//! Job and sheet status tracking
//!
//! Every sheet walks Pending -> Ingesting -> Validating -> Inserting ->
//! Completed, or drops into Failed or Cancelled. The job state is derived
//! from its sheets, never set independently of them (except for job-level
//! failures before any sheet starts).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetState {
    Pending,
    Ingesting,
    Validating,
    Inserting,
    Completed,
    Failed,
    Cancelled,
}

impl SheetState {
    pub fn as_str(&self) -> &str {
        match self {
            SheetState::Pending => "pending",
            SheetState::Ingesting => "ingesting",
            SheetState::Validating => "validating",
            SheetState::Inserting => "inserting",
            SheetState::Completed => "completed",
            SheetState::Failed => "failed",
            SheetState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SheetState::Completed | SheetState::Failed | SheetState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Started,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &str {
        match self {
            JobState::Started => "started",
            JobState::Completed => "completed",
            JobState::CompletedWithErrors => "completed_with_errors",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Started)
    }
}

/// Live counters for one sheet of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetStatus {
    pub sheet: String,
    pub state: SheetState,
    /// Data rows read out of the workbook
    pub processed: u64,
    /// Rows staged as valid after validation
    pub valid: u64,
    /// Rows rejected during ingest or validation
    pub errors: u64,
    /// Valid rows inserted into the master store
    pub inserted: u64,
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SheetStatus {
    pub fn new(sheet: impl Into<String>) -> Self {
        Self {
            sheet: sheet.into(),
            state: SheetState::Pending,
            processed: 0,
            valid: 0,
            errors: 0,
            inserted: 0,
            message: None,
            updated_at: Utc::now(),
        }
    }
}

/// One tracked migration job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub source: String,
    pub state: JobState,
    pub sheets: Vec<SheetStatus>,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Derive the job state from its sheet states. Cancellation dominates, a
/// running sheet keeps the job started, and any failed sheet or row-level
/// trouble degrades the job to completed-with-errors. `Failed` is reserved
/// for job-level setup errors (unreadable source, broken plan) and is never
/// produced by sheet aggregation.
pub fn aggregate(sheets: &[SheetStatus]) -> JobState {
    if sheets.iter().any(|s| s.state == SheetState::Cancelled) {
        return JobState::Cancelled;
    }
    if sheets.iter().any(|s| !s.state.is_terminal()) {
        return JobState::Started;
    }
    if sheets.iter().any(|s| s.state == SheetState::Failed)
        || sheets.iter().any(|s| s.errors > 0)
    {
        return JobState::CompletedWithErrors;
    }
    JobState::Completed
}

/// Shared in-memory registry of job records. Cheap to clone, safe to poll
/// from other tasks while a job runs.
#[derive(Debug, Clone, Default)]
pub struct StatusTracker {
    inner: Arc<RwLock<HashMap<Uuid, JobRecord>>>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_job(&self, job_id: Uuid, source: &str, sheets: &[String]) {
        let record = JobRecord {
            job_id,
            source: source.to_string(),
            state: JobState::Started,
            sheets: sheets.iter().map(|s| SheetStatus::new(s.as_str())).collect(),
            message: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.inner
            .write()
            .expect("status tracker lock poisoned")
            .insert(job_id, record);
    }

    /// Apply a mutation to one sheet's status.
    pub fn update_sheet<F>(&self, job_id: Uuid, sheet: &str, f: F)
    where
        F: FnOnce(&mut SheetStatus),
    {
        let mut jobs = self.inner.write().expect("status tracker lock poisoned");
        if let Some(job) = jobs.get_mut(&job_id) {
            if let Some(status) = job.sheets.iter_mut().find(|s| s.sheet == sheet) {
                f(status);
                status.updated_at = Utc::now();
            }
        }
    }

    pub fn set_sheet_state(&self, job_id: Uuid, sheet: &str, state: SheetState) {
        self.update_sheet(job_id, sheet, |s| s.state = state);
    }

    /// Recompute and store the job state from its sheets; used once all
    /// sheet tasks have settled.
    pub fn finish_job(&self, job_id: Uuid, cancelled: bool) -> Option<JobState> {
        let mut jobs = self.inner.write().expect("status tracker lock poisoned");
        let job = jobs.get_mut(&job_id)?;
        let state = if cancelled {
            JobState::Cancelled
        } else {
            aggregate(&job.sheets)
        };
        job.state = state;
        job.finished_at = Some(Utc::now());
        Some(state)
    }

    /// Mark a job failed before (or regardless of) sheet progress.
    pub fn fail_job(&self, job_id: Uuid, message: &str) {
        let mut jobs = self.inner.write().expect("status tracker lock poisoned");
        if let Some(job) = jobs.get_mut(&job_id) {
            job.state = JobState::Failed;
            job.message = Some(message.to_string());
            job.finished_at = Some(Utc::now());
        }
    }

    pub fn snapshot(&self, job_id: Uuid) -> Option<JobRecord> {
        self.inner
            .read()
            .expect("status tracker lock poisoned")
            .get(&job_id)
            .cloned()
    }

    pub fn job_ids(&self) -> Vec<Uuid> {
        self.inner
            .read()
            .expect("status tracker lock poisoned")
            .keys()
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sheet(state: SheetState, errors: u64) -> SheetStatus {
        SheetStatus {
            state,
            errors,
            ..SheetStatus::new("s")
        }
    }

    #[test]
    fn all_clean_sheets_complete_the_job() {
        let sheets = vec![sheet(SheetState::Completed, 0), sheet(SheetState::Completed, 0)];
        assert_eq!(aggregate(&sheets), JobState::Completed);
    }

    #[test]
    fn row_errors_degrade_to_completed_with_errors() {
        let sheets = vec![sheet(SheetState::Completed, 0), sheet(SheetState::Completed, 3)];
        assert_eq!(aggregate(&sheets), JobState::CompletedWithErrors);
    }

    #[test]
    fn one_failed_sheet_degrades_not_fails() {
        let sheets = vec![sheet(SheetState::Completed, 0), sheet(SheetState::Failed, 0)];
        assert_eq!(aggregate(&sheets), JobState::CompletedWithErrors);
    }

    #[test]
    fn all_failed_sheets_still_degrade_not_fail() {
        // Failed is reserved for job-level setup errors
        let sheets = vec![sheet(SheetState::Failed, 0), sheet(SheetState::Failed, 0)];
        assert_eq!(aggregate(&sheets), JobState::CompletedWithErrors);
    }

    #[test]
    fn cancellation_dominates() {
        let sheets = vec![sheet(SheetState::Completed, 0), sheet(SheetState::Cancelled, 0)];
        assert_eq!(aggregate(&sheets), JobState::Cancelled);
    }

    #[test]
    fn running_sheet_keeps_the_job_started() {
        let sheets = vec![sheet(SheetState::Completed, 0), sheet(SheetState::Validating, 0)];
        assert_eq!(aggregate(&sheets), JobState::Started);
    }

    #[test]
    fn tracker_snapshots_are_independent_copies() {
        let tracker = StatusTracker::new();
        let job_id = Uuid::new_v4();
        tracker.create_job(job_id, "in.xlsx", &["Orders".to_string()]);
        tracker.update_sheet(job_id, "Orders", |s| {
            s.state = SheetState::Ingesting;
            s.processed = 10;
        });

        let snap = tracker.snapshot(job_id).unwrap();
        assert_eq!(snap.state, JobState::Started);
        assert_eq!(snap.sheets[0].processed, 10);

        tracker.update_sheet(job_id, "Orders", |s| s.processed = 20);
        assert_eq!(snap.sheets[0].processed, 10);
    }

    #[test]
    fn finish_job_derives_terminal_state() {
        let tracker = StatusTracker::new();
        let job_id = Uuid::new_v4();
        tracker.create_job(job_id, "in.xlsx", &["A".to_string()]);
        tracker.set_sheet_state(job_id, "A", SheetState::Completed);
        assert_eq!(tracker.finish_job(job_id, false), Some(JobState::Completed));
        assert!(tracker.snapshot(job_id).unwrap().finished_at.is_some());
    }
}
