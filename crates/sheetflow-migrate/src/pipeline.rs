//! Migration pipeline
//!
//! Runs one workbook through three stages per sheet:
//!
//! 1. ingest: stream the sheet into the staging store (conversion failures
//!    land as error rows, everything else as staged rows)
//! 2. validate: page staged rows through the plan's validation chain and
//!    cross-row uniqueness, marking them valid or error
//! 3. insert: page valid rows into the master store in retried batches
//!
//! Sheets run concurrently up to `sheet_parallelism`; each sheet opens its
//! own archive handle so the stages never share a reader. Cancellation is
//! observed at stage and page boundaries, and stops staging writes
//! immediately.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::plan::{MigrationPlan, SheetPlan};
use crate::staging::{MasterStore, RowMark, RowStatus, StagedRow, StagingStore};
use crate::status::{JobState, SheetState, SheetStatus, StatusTracker};
use sheetflow_common::{Result, SheetflowError};
use sheetflow_core::{
    DynamicRecord, FieldValue, ProcessingConfig, ProcessingOutcome, RecordDescriptor, SinkClosed,
    StreamingRowProcessor, ValidationChain,
};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub processing: ProcessingConfig,
    /// Staged rows fetched per validation page
    pub page_size: u64,
    /// Valid rows per master insert batch
    pub insert_batch_size: usize,
    /// Attempts per insert batch before the sheet fails
    pub max_insert_retries: u32,
    pub retry_backoff_ms: u64,
    /// Keep processing remaining sheets after one fails
    pub continue_on_sheet_failure: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            processing: ProcessingConfig::default(),
            page_size: 1000,
            insert_batch_size: 500,
            max_insert_retries: 3,
            retry_backoff_ms: 200,
            continue_on_sheet_failure: true,
        }
    }
}

/// Final outcome of one migration job.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_id: Uuid,
    pub state: JobState,
    pub sheets: Vec<SheetStatus>,
    pub elapsed: Duration,
}

impl JobResult {
    pub fn processed(&self) -> u64 {
        self.sheets.iter().map(|s| s.processed).sum()
    }

    pub fn inserted(&self) -> u64 {
        self.sheets.iter().map(|s| s.inserted).sum()
    }

    pub fn errors(&self) -> u64 {
        self.sheets.iter().map(|s| s.errors).sum()
    }

    pub fn summary(&self) -> String {
        let mut out = format!(
            "job {} {}: {} rows, {} inserted, {} errors in {:.1}s",
            self.job_id,
            self.state.as_str(),
            self.processed(),
            self.inserted(),
            self.errors(),
            self.elapsed.as_secs_f64(),
        );
        for sheet in &self.sheets {
            out.push_str(&format!(
                "\n  {} [{}]: {} rows, {} valid, {} inserted, {} errors",
                sheet.sheet,
                sheet.state.as_str(),
                sheet.processed,
                sheet.valid,
                sheet.inserted,
                sheet.errors,
            ));
            if let Some(message) = &sheet.message {
                out.push_str(&format!(" ({message})"));
            }
        }
        out
    }
}

struct CompiledSheet {
    plan: SheetPlan,
    descriptor: Arc<RecordDescriptor>,
    chain: ValidationChain,
}

/// Orchestrates staged workbook migrations against a pair of stores.
#[derive(Clone)]
pub struct MigrationPipeline {
    staging: Arc<dyn StagingStore>,
    master: Arc<dyn MasterStore>,
    tracker: StatusTracker,
    config: PipelineConfig,
}

impl MigrationPipeline {
    pub fn new(
        staging: Arc<dyn StagingStore>,
        master: Arc<dyn MasterStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            staging,
            master,
            tracker: StatusTracker::new(),
            config,
        }
    }

    pub fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    /// Push the tracker's current view of the job through to the staging
    /// store, so the durable backend can answer status queries after a
    /// restart. Failures are logged, not fatal: status persistence must
    /// never take down a running job.
    async fn persist_status(&self, job_id: Uuid) {
        if let Some(record) = self.tracker.snapshot(job_id) {
            if let Err(e) = self.staging.save_status(&record).await {
                warn!(%job_id, error = %e, "job status write-through failed");
            }
        }
    }

    /// Run one job to completion. Plan compile errors fail fast; everything
    /// after job creation is folded into the job state, so the returned
    /// result is the authoritative record of what happened.
    pub async fn run(
        &self,
        job_id: Uuid,
        source: impl AsRef<Path>,
        plan: &MigrationPlan,
        cancel: CancellationToken,
    ) -> Result<JobResult> {
        let started = Instant::now();
        let source = source.as_ref().to_path_buf();

        let mut compiled = Vec::with_capacity(plan.sheets.len());
        for sheet_plan in &plan.sheets {
            compiled.push(CompiledSheet {
                plan: sheet_plan.clone(),
                descriptor: sheet_plan.descriptor()?,
                chain: sheet_plan
                    .validation_chain()?
                    .fail_fast(self.config.processing.strict_validation),
            });
        }

        let sheet_names = plan.sheet_names();
        self.tracker
            .create_job(job_id, &source.display().to_string(), &sheet_names);
        self.persist_status(job_id).await;
        info!(%job_id, source = %source.display(), sheets = sheet_names.len(), "migration job started");

        // A re-run of the same job id starts from a clean staging slate
        match self.staging.delete_job(job_id).await {
            Ok(0) => {},
            Ok(dropped) => debug!(%job_id, dropped, "cleared staging leftovers from earlier run"),
            Err(e) => {
                self.tracker.fail_job(job_id, &e.to_string());
                self.persist_status(job_id).await;
                return Ok(self.result_from_tracker(job_id, started));
            },
        }

        let parallelism = self.config.processing.sheet_parallelism.max(1);
        let permits = Arc::new(Semaphore::new(parallelism));
        let mut tasks = JoinSet::new();

        for sheet in compiled {
            let pipeline = self.clone();
            let permits = Arc::clone(&permits);
            let source = source.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                pipeline.run_sheet(job_id, &source, sheet, cancel).await;
            });
        }
        while tasks.join_next().await.is_some() {}

        let state = self
            .tracker
            .finish_job(job_id, cancel.is_cancelled())
            .unwrap_or(JobState::Failed);
        self.persist_status(job_id).await;
        let result = self.result_from_tracker(job_id, started);
        info!(%job_id, state = state.as_str(), "migration job finished");
        Ok(result)
    }

    fn result_from_tracker(&self, job_id: Uuid, started: Instant) -> JobResult {
        let snapshot = self.tracker.snapshot(job_id);
        JobResult {
            job_id,
            state: snapshot.as_ref().map(|j| j.state).unwrap_or(JobState::Failed),
            sheets: snapshot.map(|j| j.sheets).unwrap_or_default(),
            elapsed: started.elapsed(),
        }
    }

    /// Drive one sheet through all three stages, folding failures into the
    /// sheet state.
    async fn run_sheet(
        &self,
        job_id: Uuid,
        source: &Path,
        sheet: CompiledSheet,
        cancel: CancellationToken,
    ) {
        let sheet_name = sheet.plan.sheet.clone();
        match self.run_sheet_stages(job_id, source, sheet, &cancel).await {
            Ok(()) => {
                self.tracker
                    .set_sheet_state(job_id, &sheet_name, SheetState::Completed);
                info!(%job_id, sheet = %sheet_name, "sheet completed");
            },
            Err(SheetflowError::Cancelled) => {
                self.tracker
                    .set_sheet_state(job_id, &sheet_name, SheetState::Cancelled);
                info!(%job_id, sheet = %sheet_name, "sheet cancelled");
            },
            Err(e) => {
                error!(%job_id, sheet = %sheet_name, error = %e, "sheet failed");
                let message = e.to_string();
                self.tracker.update_sheet(job_id, &sheet_name, |s| {
                    s.state = SheetState::Failed;
                    s.message = Some(message.clone());
                });
                if !self.config.continue_on_sheet_failure {
                    warn!(%job_id, "stopping remaining sheets after failure");
                    cancel.cancel();
                }
            },
        }
        self.persist_status(job_id).await;
    }

    async fn run_sheet_stages(
        &self,
        job_id: Uuid,
        source: &Path,
        sheet: CompiledSheet,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let CompiledSheet {
            plan,
            descriptor,
            chain,
        } = sheet;

        self.ingest_stage(job_id, source, &plan, Arc::clone(&descriptor), cancel)
            .await?;
        self.validate_stage(job_id, &plan, &descriptor, &chain, cancel)
            .await?;
        self.insert_stage(job_id, &plan, cancel).await?;
        Ok(())
    }

    /// Stage 1: stream the sheet off the workbook into staging. The parse
    /// runs on a blocking thread; rows cross back over a bounded channel so
    /// a slow store applies backpressure to the parser.
    async fn ingest_stage(
        &self,
        job_id: Uuid,
        source: &Path,
        plan: &SheetPlan,
        descriptor: Arc<RecordDescriptor>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(SheetflowError::Cancelled);
        }
        let sheet_name = plan.sheet.clone();
        self.tracker
            .set_sheet_state(job_id, &sheet_name, SheetState::Ingesting);
        self.persist_status(job_id).await;

        let mut processing = self.config.processing.clone();
        processing.job_id = Some(job_id);
        let (tx, mut rx) = mpsc::channel::<Vec<StagedRow>>(2);
        let parse = spawn_sheet_parse(
            source.to_path_buf(),
            sheet_name.clone(),
            processing,
            descriptor,
            job_id,
            tx,
        );

        let mut staged = 0u64;
        let mut errors = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Returning drops the receiver, so the parser's sends
                    // fail and nothing more reaches staging
                    return Err(SheetflowError::Cancelled);
                },
                received = rx.recv() => match received {
                    Some(rows) => {
                        for row in &rows {
                            match row.status {
                                RowStatus::Error => errors += 1,
                                _ => staged += 1,
                            }
                        }
                        self.staging.stage_rows(rows).await?;
                        self.tracker.update_sheet(job_id, &sheet_name, |s| {
                            s.processed = staged + errors;
                            s.errors = errors;
                        });
                    },
                    None => break,
                },
            }
        }

        let outcome = parse
            .await
            .map_err(|e| SheetflowError::Stage(format!("ingest task failed: {e}")))??;
        self.tracker.update_sheet(job_id, &sheet_name, |s| {
            s.processed = outcome.processed;
            s.errors = outcome.errors;
        });
        match outcome.outcome {
            ProcessingOutcome::AbortedOnErrorThreshold => {
                return Err(SheetflowError::ErrorThreshold {
                    errors: outcome.errors,
                    row: outcome.abort_row.unwrap_or_default(),
                });
            },
            // The receiver only disappears when the job is torn down
            ProcessingOutcome::SinkClosed => return Err(SheetflowError::Cancelled),
            _ => {},
        }
        debug!(%job_id, sheet = %sheet_name, staged, errors, "ingest stage done");
        Ok(())
    }

    /// Stage 2: page staged rows through the validation chain plus the
    /// plan's cross-row uniqueness constraint. Every fetched row leaves the
    /// staged status, so paging always reads from offset zero.
    async fn validate_stage(
        &self,
        job_id: Uuid,
        plan: &SheetPlan,
        descriptor: &RecordDescriptor,
        chain: &ValidationChain,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let sheet_name = plan.sheet.as_str();
        self.tracker
            .set_sheet_state(job_id, sheet_name, SheetState::Validating);
        self.persist_status(job_id).await;

        let unique_fields = if plan.unique_fields.is_empty() {
            &self.config.processing.unique_fields
        } else {
            &plan.unique_fields
        };
        let code_maps = plan.code_maps();
        let mut seen_keys: HashSet<String> = HashSet::new();
        let mut valid = 0u64;
        let mut invalid = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(SheetflowError::Cancelled);
            }
            let page = self
                .staging
                .fetch_page(job_id, sheet_name, RowStatus::Staged, 0, self.config.page_size)
                .await?;
            if page.is_empty() {
                break;
            }

            let mut marks = Vec::with_capacity(page.len());
            for row in &page {
                let mut record = DynamicRecord::from_json(descriptor, &row.payload);
                normalize_record(&mut record, &code_maps);
                let result = chain.validate(&record, row.row_num);
                if !result.is_valid() {
                    let first = &result.errors[0];
                    invalid += 1;
                    marks.push(RowMark::error(row.row_num, first.rule, &first.message));
                    continue;
                }
                if !unique_fields.is_empty() {
                    let key = unique_key(&record, unique_fields);
                    if !seen_keys.insert(key) {
                        invalid += 1;
                        marks.push(RowMark::error(
                            row.row_num,
                            "unique_fields",
                            "duplicate key for unique fields",
                        ));
                        continue;
                    }
                }
                valid += 1;
                marks.push(RowMark::valid(row.row_num));
            }
            self.staging.apply_marks(job_id, sheet_name, marks).await?;
            self.tracker.update_sheet(job_id, sheet_name, |s| {
                s.valid = valid;
                s.errors += invalid;
            });
            invalid = 0;
        }
        debug!(%job_id, sheet = %sheet_name, valid, "validate stage done");
        Ok(())
    }

    /// Stage 3: move valid rows into the master store in retried batches.
    async fn insert_stage(
        &self,
        job_id: Uuid,
        plan: &SheetPlan,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let sheet_name = plan.sheet.as_str();
        self.tracker
            .set_sheet_state(job_id, sheet_name, SheetState::Inserting);
        self.persist_status(job_id).await;

        let mut inserted = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(SheetflowError::Cancelled);
            }
            let page = self
                .staging
                .fetch_page(
                    job_id,
                    sheet_name,
                    RowStatus::Valid,
                    0,
                    self.config.insert_batch_size as u64,
                )
                .await?;
            if page.is_empty() {
                break;
            }

            inserted += self
                .insert_with_retry(job_id, &plan.target_table, &page)
                .await?;
            let marks = page.iter().map(|r| RowMark::inserted(r.row_num)).collect();
            self.staging.apply_marks(job_id, sheet_name, marks).await?;
            self.tracker
                .update_sheet(job_id, sheet_name, |s| s.inserted = inserted);
        }
        debug!(%job_id, sheet = %sheet_name, inserted, "insert stage done");
        Ok(())
    }

    async fn insert_with_retry(
        &self,
        job_id: Uuid,
        target_table: &str,
        page: &[StagedRow],
    ) -> Result<u64> {
        let max_attempts = self.config.max_insert_retries.max(1);
        let mut attempt = 1;
        loop {
            match self.master.insert_batch(job_id, target_table, page).await {
                Ok(count) => return Ok(count),
                Err(e) if attempt < max_attempts => {
                    warn!(
                        %job_id,
                        target_table,
                        attempt,
                        error = %e,
                        "insert batch failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(
                        self.config.retry_backoff_ms * u64::from(attempt),
                    ))
                    .await;
                    attempt += 1;
                },
                Err(e) => {
                    return Err(SheetflowError::Staging(format!(
                        "insert into {target_table} failed after {attempt} attempts: {e}"
                    )))
                },
            }
        }
    }
}

/// Trim text fields and apply the plan's per-field code maps. Works on the
/// rehydrated record only; the raw staged payload is never touched.
fn normalize_record(record: &mut DynamicRecord, code_maps: &[(&str, &HashMap<String, String>)]) {
    let updates: Vec<(String, FieldValue)> = record
        .fields()
        .filter_map(|(field, value)| {
            let FieldValue::Text(text) = value else {
                return None;
            };
            let trimmed = text.trim();
            let mapped = code_maps
                .iter()
                .find(|(f, _)| *f == field)
                .and_then(|(_, m)| m.get(trimmed))
                .map(String::as_str)
                .unwrap_or(trimmed);
            if mapped == text {
                None
            } else {
                Some((field.to_string(), FieldValue::Text(mapped.to_string())))
            }
        })
        .collect();
    for (field, value) in updates {
        record.set(field, value);
    }
}

fn unique_key(record: &DynamicRecord, fields: &[String]) -> String {
    let mut key = String::new();
    for field in fields {
        if let Some(value) = record.get(field) {
            key.push_str(&value.display_string());
        }
        key.push('\u{1}');
    }
    key
}

/// Run the sheet parse on a blocking thread, handing row batches back over
/// `tx`. The channel is bounded, so `blocking_send` is the backpressure
/// point. A closed channel (receiver dropped on cancellation) surfaces as
/// [`SinkClosed`], which stops the engine instead of letting a detached
/// parse grind through the rest of the sheet.
fn spawn_sheet_parse(
    source: PathBuf,
    sheet: String,
    processing: ProcessingConfig,
    descriptor: Arc<RecordDescriptor>,
    job_id: Uuid,
    tx: mpsc::Sender<Vec<StagedRow>>,
) -> tokio::task::JoinHandle<Result<sheetflow_core::ProcessingResult>> {
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&source)?;
        let processor = StreamingRowProcessor::new(&processing);
        processor.process_dynamic_with(
            std::io::BufReader::new(file),
            Some(sheet.as_str()),
            descriptor,
            None,
            |batch| {
                let rows: Vec<StagedRow> = batch
                    .iter()
                    .map(|(row_num, record)| {
                        StagedRow::staged(job_id, &sheet, row_num, record.to_json())
                    })
                    .collect();
                tx.blocking_send(rows)
                    .map_err(|_| anyhow::Error::new(SinkClosed))
            },
            |failure| {
                let row = StagedRow::rejected(
                    job_id,
                    &sheet,
                    failure.row,
                    failure.raw.clone(),
                    &failure.rule,
                    &failure.message,
                );
                // Best effort: a closed channel means the job is cancelled
                let _ = tx.blocking_send(vec![row]);
            },
        )
    })
}
