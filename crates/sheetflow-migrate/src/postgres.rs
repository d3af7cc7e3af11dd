//! Postgres-backed stores (behind the `database` feature)
//!
//! Staging rows live in one shared `sheetflow_staged_rows` table keyed by
//! job, sheet and row number. Master inserts target per-plan tables that
//! must exist with a `(job_id uuid, row_num integer, payload jsonb)`
//! shape.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use crate::staging::{MasterStore, RowMark, RowStatus, StagedRow, StagingCounts, StagingStore};
use crate::status::JobRecord;
use sheetflow_common::{Result, SheetflowError};

fn db_err(e: sqlx::Error) -> SheetflowError {
    SheetflowError::Staging(e.to_string())
}

fn status_from_str(s: &str) -> RowStatus {
    match s {
        "valid" => RowStatus::Valid,
        "error" => RowStatus::Error,
        "inserted" => RowStatus::Inserted,
        _ => RowStatus::Staged,
    }
}

/// Reject identifiers that cannot be a plain SQL table name; target tables
/// come from plan files, not from workbook data, but they still get
/// checked before interpolation.
fn checked_table_name(name: &str) -> Result<&str> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if ok {
        Ok(name)
    } else {
        Err(SheetflowError::Config(format!(
            "invalid target table name '{name}'"
        )))
    }
}

pub struct PgStagingStore {
    pool: PgPool,
}

impl PgStagingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the staging and status tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sheetflow_staged_rows (
                job_id UUID NOT NULL,
                sheet TEXT NOT NULL,
                row_num INTEGER NOT NULL,
                payload JSONB NOT NULL,
                status TEXT NOT NULL,
                error_rule TEXT,
                error_message TEXT,
                staged_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (job_id, sheet, row_num)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sheetflow_job_status (
                job_id UUID PRIMARY KEY,
                source TEXT NOT NULL,
                state TEXT NOT NULL,
                message TEXT,
                started_at TIMESTAMPTZ NOT NULL,
                finished_at TIMESTAMPTZ,
                record JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sheetflow_sheet_status (
                job_id UUID NOT NULL,
                sheet TEXT NOT NULL,
                state TEXT NOT NULL,
                processed BIGINT NOT NULL,
                valid BIGINT NOT NULL,
                errors BIGINT NOT NULL,
                inserted BIGINT NOT NULL,
                message TEXT,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (job_id, sheet)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl StagingStore for PgStagingStore {
    async fn stage_rows(&self, rows: Vec<StagedRow>) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO sheetflow_staged_rows
                    (job_id, sheet, row_num, payload, status, error_rule, error_message, staged_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (job_id, sheet, row_num) DO UPDATE SET
                    payload = EXCLUDED.payload,
                    status = EXCLUDED.status,
                    error_rule = EXCLUDED.error_rule,
                    error_message = EXCLUDED.error_message,
                    staged_at = EXCLUDED.staged_at
                "#,
            )
            .bind(row.job_id)
            .bind(&row.sheet)
            .bind(row.row_num as i32)
            .bind(&row.payload)
            .bind(row.status.as_str())
            .bind(&row.error_rule)
            .bind(&row.error_message)
            .bind(row.staged_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
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
        let rows = sqlx::query(
            r#"
            SELECT job_id, sheet, row_num, payload, status, error_rule, error_message, staged_at
            FROM sheetflow_staged_rows
            WHERE job_id = $1 AND sheet = $2 AND status = $3
            ORDER BY row_num
            OFFSET $4 LIMIT $5
            "#,
        )
        .bind(job_id)
        .bind(sheet)
        .bind(status.as_str())
        .bind(offset as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status").map_err(db_err)?;
            out.push(StagedRow {
                job_id: row.try_get("job_id").map_err(db_err)?,
                sheet: row.try_get("sheet").map_err(db_err)?,
                row_num: row.try_get::<i32, _>("row_num").map_err(db_err)? as u32,
                payload: row.try_get("payload").map_err(db_err)?,
                status: status_from_str(&status),
                error_rule: row.try_get("error_rule").map_err(db_err)?,
                error_message: row.try_get("error_message").map_err(db_err)?,
                staged_at: row.try_get("staged_at").map_err(db_err)?,
            });
        }
        Ok(out)
    }

    async fn apply_marks(&self, job_id: Uuid, sheet: &str, marks: Vec<RowMark>) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut applied = 0u64;
        for mark in marks {
            let result = sqlx::query(
                r#"
                UPDATE sheetflow_staged_rows
                SET status = $1, error_rule = $2, error_message = $3
                WHERE job_id = $4 AND sheet = $5 AND row_num = $6
                "#,
            )
            .bind(mark.status.as_str())
            .bind(&mark.error_rule)
            .bind(&mark.error_message)
            .bind(job_id)
            .bind(sheet)
            .bind(mark.row_num as i32)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            applied += result.rows_affected();
        }
        tx.commit().await.map_err(db_err)?;
        Ok(applied)
    }

    async fn counts(&self, job_id: Uuid, sheet: &str) -> Result<StagingCounts> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n
            FROM sheetflow_staged_rows
            WHERE job_id = $1 AND sheet = $2
            GROUP BY status
            "#,
        )
        .bind(job_id)
        .bind(sheet)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut counts = StagingCounts::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(db_err)?;
            let n: i64 = row.try_get("n").map_err(db_err)?;
            match status_from_str(&status) {
                RowStatus::Staged => counts.staged = n as u64,
                RowStatus::Valid => counts.valid = n as u64,
                RowStatus::Error => counts.error = n as u64,
                RowStatus::Inserted => counts.inserted = n as u64,
            }
        }
        Ok(counts)
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sheetflow_staged_rows WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        debug!(%job_id, dropped = result.rows_affected(), "staging rows deleted");
        Ok(result.rows_affected())
    }

    async fn save_status(&self, job: &JobRecord) -> Result<()> {
        // The full record goes out as JSONB for exact reloads; the flat
        // columns exist for operator queries.
        let record = serde_json::to_value(job)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            r#"
            INSERT INTO sheetflow_job_status
                (job_id, source, state, message, started_at, finished_at, record)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (job_id) DO UPDATE SET
                state = EXCLUDED.state,
                message = EXCLUDED.message,
                finished_at = EXCLUDED.finished_at,
                record = EXCLUDED.record
            "#,
        )
        .bind(job.job_id)
        .bind(&job.source)
        .bind(job.state.as_str())
        .bind(&job.message)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(&record)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        for sheet in &job.sheets {
            sqlx::query(
                r#"
                INSERT INTO sheetflow_sheet_status
                    (job_id, sheet, state, processed, valid, errors, inserted, message, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (job_id, sheet) DO UPDATE SET
                    state = EXCLUDED.state,
                    processed = EXCLUDED.processed,
                    valid = EXCLUDED.valid,
                    errors = EXCLUDED.errors,
                    inserted = EXCLUDED.inserted,
                    message = EXCLUDED.message,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(job.job_id)
            .bind(&sheet.sheet)
            .bind(sheet.state.as_str())
            .bind(sheet.processed as i64)
            .bind(sheet.valid as i64)
            .bind(sheet.errors as i64)
            .bind(sheet.inserted as i64)
            .bind(&sheet.message)
            .bind(sheet.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn load_status(&self, job_id: Uuid) -> Result<Option<JobRecord>> {
        let row = sqlx::query("SELECT record FROM sheetflow_job_status WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match row {
            Some(row) => {
                let record: serde_json::Value = row.try_get("record").map_err(db_err)?;
                Ok(Some(serde_json::from_value(record)?))
            },
            None => Ok(None),
        }
    }
}

pub struct PgMasterStore {
    pool: PgPool,
}

impl PgMasterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MasterStore for PgMasterStore {
    async fn insert_batch(
        &self,
        job_id: Uuid,
        target_table: &str,
        rows: &[StagedRow],
    ) -> Result<u64> {
        let table = checked_table_name(target_table)?;
        let sql = format!(
            "INSERT INTO {table} (job_id, row_num, payload) VALUES ($1, $2, $3) \
             ON CONFLICT DO NOTHING"
        );

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut inserted = 0u64;
        for row in rows {
            let result = sqlx::query(&sql)
                .bind(job_id)
                .bind(row.row_num as i32)
                .bind(&row.payload)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            inserted += result.rows_affected();
        }
        tx.commit().await.map_err(db_err)?;
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_checked_before_interpolation() {
        assert!(checked_table_name("orders").is_ok());
        assert!(checked_table_name("order_lines_2").is_ok());
        assert!(checked_table_name("").is_err());
        assert!(checked_table_name("1orders").is_err());
        assert!(checked_table_name("orders; drop table x").is_err());
    }
}
