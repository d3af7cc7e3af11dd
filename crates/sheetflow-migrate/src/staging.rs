//! Staging and master store seams
//!
//! Ingest lands every row in a staging store first; validation and insert
//! work off staged pages, so a crashed job can be inspected row by row and
//! re-run idempotently. Both stores are trait objects so tests and the CLI
//! default to the in-memory implementations while deployments use Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::JobRecord;
use sheetflow_common::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    /// Landed from the workbook, not yet validated
    Staged,
    /// Passed the validation chain
    Valid,
    /// Rejected during ingest or validation
    Error,
    /// Inserted into the master store
    Inserted,
}

impl RowStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RowStatus::Staged => "staged",
            RowStatus::Valid => "valid",
            RowStatus::Error => "error",
            RowStatus::Inserted => "inserted",
        }
    }
}

/// One workbook row parked in the staging store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedRow {
    pub job_id: Uuid,
    pub sheet: String,
    /// 1-based row number in the source sheet
    pub row_num: u32,
    /// Converted field values as a JSON object, or the raw cell snapshot
    /// for rows that never converted
    pub payload: serde_json::Value,
    pub status: RowStatus,
    pub error_rule: Option<String>,
    pub error_message: Option<String>,
    pub staged_at: DateTime<Utc>,
}

impl StagedRow {
    pub fn staged(job_id: Uuid, sheet: &str, row_num: u32, payload: serde_json::Value) -> Self {
        Self {
            job_id,
            sheet: sheet.to_string(),
            row_num,
            payload,
            status: RowStatus::Staged,
            error_rule: None,
            error_message: None,
            staged_at: Utc::now(),
        }
    }

    pub fn rejected(
        job_id: Uuid,
        sheet: &str,
        row_num: u32,
        payload: serde_json::Value,
        rule: &str,
        message: &str,
    ) -> Self {
        Self {
            job_id,
            sheet: sheet.to_string(),
            row_num,
            payload,
            status: RowStatus::Error,
            error_rule: Some(rule.to_string()),
            error_message: Some(message.to_string()),
            staged_at: Utc::now(),
        }
    }
}

/// Status change for one staged row.
#[derive(Debug, Clone)]
pub struct RowMark {
    pub row_num: u32,
    pub status: RowStatus,
    pub error_rule: Option<String>,
    pub error_message: Option<String>,
}

impl RowMark {
    pub fn valid(row_num: u32) -> Self {
        Self {
            row_num,
            status: RowStatus::Valid,
            error_rule: None,
            error_message: None,
        }
    }

    pub fn error(row_num: u32, rule: &str, message: &str) -> Self {
        Self {
            row_num,
            status: RowStatus::Error,
            error_rule: Some(rule.to_string()),
            error_message: Some(message.to_string()),
        }
    }

    pub fn inserted(row_num: u32) -> Self {
        Self {
            row_num,
            status: RowStatus::Inserted,
            error_rule: None,
            error_message: None,
        }
    }
}

/// Per-sheet staging counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StagingCounts {
    pub staged: u64,
    pub valid: u64,
    pub error: u64,
    pub inserted: u64,
}

impl StagingCounts {
    pub fn total(&self) -> u64 {
        self.staged + self.valid + self.error + self.inserted
    }
}

/// Row-level staging area for one or more jobs.
#[async_trait]
pub trait StagingStore: Send + Sync {
    async fn stage_rows(&self, rows: Vec<StagedRow>) -> Result<()>;

    /// Page rows of one status in row-number order.
    async fn fetch_page(
        &self,
        job_id: Uuid,
        sheet: &str,
        status: RowStatus,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<StagedRow>>;

    async fn apply_marks(&self, job_id: Uuid, sheet: &str, marks: Vec<RowMark>) -> Result<u64>;

    async fn counts(&self, job_id: Uuid, sheet: &str) -> Result<StagingCounts>;

    /// Remove every staged row of a job; returns how many were dropped.
    async fn delete_job(&self, job_id: Uuid) -> Result<u64>;

    /// Upsert the job status record so it survives a process restart
    /// alongside the staged rows.
    async fn save_status(&self, job: &JobRecord) -> Result<()>;

    async fn load_status(&self, job_id: Uuid) -> Result<Option<JobRecord>>;
}

/// Destination for validated rows.
#[async_trait]
pub trait MasterStore: Send + Sync {
    /// Insert one batch into `target_table`; returns the inserted count.
    async fn insert_batch(
        &self,
        job_id: Uuid,
        target_table: &str,
        rows: &[StagedRow],
    ) -> Result<u64>;
}
