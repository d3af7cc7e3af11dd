//! In-memory store implementations
//!
//! Default backing for tests and single-shot CLI runs. Everything lives in
//! one mutex-guarded vector per store; fine for workbook-sized data, not a
//! deployment target.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::staging::{MasterStore, RowMark, RowStatus, StagedRow, StagingCounts, StagingStore};
use crate::status::JobRecord;
use sheetflow_common::Result;

#[derive(Debug, Default)]
pub struct InMemoryStagingStore {
    rows: Mutex<Vec<StagedRow>>,
    status: Mutex<HashMap<Uuid, JobRecord>>,
}

impl InMemoryStagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all_rows(&self) -> Vec<StagedRow> {
        self.rows.lock().expect("staging lock poisoned").clone()
    }
}

#[async_trait]
impl StagingStore for InMemoryStagingStore {
    async fn stage_rows(&self, mut new_rows: Vec<StagedRow>) -> Result<()> {
        let mut rows = self.rows.lock().expect("staging lock poisoned");
        rows.append(&mut new_rows);
        Ok(())
    }

    async fn fetch_page(
        &self,
        job_id: Uuid,
        sheet: &str,
        status: RowStatus,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<StagedRow>> {
        let rows = self.rows.lock().expect("staging lock poisoned");
        let mut matching: Vec<StagedRow> = rows
            .iter()
            .filter(|r| r.job_id == job_id && r.sheet == sheet && r.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.row_num);
        Ok(matching
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn apply_marks(&self, job_id: Uuid, sheet: &str, marks: Vec<RowMark>) -> Result<u64> {
        let mut rows = self.rows.lock().expect("staging lock poisoned");
        let mut applied = 0u64;
        for mark in marks {
            if let Some(row) = rows
                .iter_mut()
                .find(|r| r.job_id == job_id && r.sheet == sheet && r.row_num == mark.row_num)
            {
                row.status = mark.status;
                row.error_rule = mark.error_rule;
                row.error_message = mark.error_message;
                applied += 1;
            }
        }
        Ok(applied)
    }

    async fn counts(&self, job_id: Uuid, sheet: &str) -> Result<StagingCounts> {
        let rows = self.rows.lock().expect("staging lock poisoned");
        let mut counts = StagingCounts::default();
        for row in rows.iter().filter(|r| r.job_id == job_id && r.sheet == sheet) {
            match row.status {
                RowStatus::Staged => counts.staged += 1,
                RowStatus::Valid => counts.valid += 1,
                RowStatus::Error => counts.error += 1,
                RowStatus::Inserted => counts.inserted += 1,
            }
        }
        Ok(counts)
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<u64> {
        let mut rows = self.rows.lock().expect("staging lock poisoned");
        let before = rows.len();
        rows.retain(|r| r.job_id != job_id);
        Ok((before - rows.len()) as u64)
    }

    async fn save_status(&self, job: &JobRecord) -> Result<()> {
        self.status
            .lock()
            .expect("status lock poisoned")
            .insert(job.job_id, job.clone());
        Ok(())
    }

    async fn load_status(&self, job_id: Uuid) -> Result<Option<JobRecord>> {
        Ok(self
            .status
            .lock()
            .expect("status lock poisoned")
            .get(&job_id)
            .cloned())
    }
}

/// Inserted master rows, kept with their target table for assertions.
#[derive(Debug, Clone)]
pub struct MasterRow {
    pub job_id: Uuid,
    pub target_table: String,
    pub row_num: u32,
    pub payload: serde_json::Value,
}

#[derive(Debug, Default)]
pub struct InMemoryMasterStore {
    rows: Mutex<Vec<MasterRow>>,
}

impl InMemoryMasterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows_for(&self, target_table: &str) -> Vec<MasterRow> {
        self.rows
            .lock()
            .expect("master lock poisoned")
            .iter()
            .filter(|r| r.target_table == target_table)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().expect("master lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MasterStore for InMemoryMasterStore {
    async fn insert_batch(
        &self,
        job_id: Uuid,
        target_table: &str,
        batch: &[StagedRow],
    ) -> Result<u64> {
        let mut rows = self.rows.lock().expect("master lock poisoned");
        for row in batch {
            rows.push(MasterRow {
                job_id,
                target_table: target_table.to_string(),
                row_num: row.row_num,
                payload: row.payload.clone(),
            });
        }
        Ok(batch.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(job_id: Uuid, num: u32) -> StagedRow {
        StagedRow::staged(job_id, "Orders", num, json!({"n": num}))
    }

    #[tokio::test]
    async fn pages_come_back_in_row_order() {
        let store = InMemoryStagingStore::new();
        let job_id = Uuid::new_v4();
        store
            .stage_rows(vec![row(job_id, 5), row(job_id, 2), row(job_id, 9)])
            .await
            .unwrap();

        let page = store
            .fetch_page(job_id, "Orders", RowStatus::Staged, 0, 2)
            .await
            .unwrap();
        assert_eq!(page.iter().map(|r| r.row_num).collect::<Vec<_>>(), vec![2, 5]);

        let rest = store
            .fetch_page(job_id, "Orders", RowStatus::Staged, 2, 10)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].row_num, 9);
    }

    #[tokio::test]
    async fn marks_move_rows_between_statuses() {
        let store = InMemoryStagingStore::new();
        let job_id = Uuid::new_v4();
        store
            .stage_rows(vec![row(job_id, 1), row(job_id, 2)])
            .await
            .unwrap();

        let applied = store
            .apply_marks(
                job_id,
                "Orders",
                vec![RowMark::valid(1), RowMark::error(2, "pattern", "no match")],
            )
            .await
            .unwrap();
        assert_eq!(applied, 2);

        let counts = store.counts(job_id, "Orders").await.unwrap();
        assert_eq!(counts.staged, 0);
        assert_eq!(counts.valid, 1);
        assert_eq!(counts.error, 1);
    }

    #[tokio::test]
    async fn delete_job_clears_only_that_job() {
        let store = InMemoryStagingStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.stage_rows(vec![row(a, 1), row(b, 1)]).await.unwrap();

        assert_eq!(store.delete_job(a).await.unwrap(), 1);
        assert_eq!(store.counts(b, "Orders").await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn job_status_round_trips() {
        use crate::status::JobState;

        let store = InMemoryStagingStore::new();
        let job_id = Uuid::new_v4();
        assert!(store.load_status(job_id).await.unwrap().is_none());

        let record = JobRecord {
            job_id,
            source: "in.xlsx".to_string(),
            state: JobState::Started,
            sheets: Vec::new(),
            message: None,
            started_at: chrono::Utc::now(),
            finished_at: None,
        };
        store.save_status(&record).await.unwrap();

        let loaded = store.load_status(job_id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Started);
        assert_eq!(loaded.source, "in.xlsx");
    }
}
