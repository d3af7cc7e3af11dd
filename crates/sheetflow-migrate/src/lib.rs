//! Workbook migration pipeline
//!
//! Orchestrates the synchronous streaming engine from `sheetflow-core` into
//! an async three-stage pipeline per sheet: ingest rows into a staging
//! store, validate the staged rows, then insert the valid ones into the
//! master store in retried batches. Sheets run with bounded parallelism and
//! every job is trackable and cancellable through [`runner::AsyncJobRunner`].
//!
//! Stores are trait seams: in-memory implementations ship in [`memory`],
//! Postgres-backed ones live behind the `database` feature.

pub mod memory;
pub mod pipeline;
pub mod plan;
pub mod runner;
pub mod staging;
pub mod status;

#[cfg(feature = "database")]
pub mod postgres;

pub use pipeline::{JobResult, MigrationPipeline, PipelineConfig};
pub use plan::{ColumnSpec, MigrationPlan, SheetPlan};
pub use runner::AsyncJobRunner;
pub use staging::{MasterStore, RowMark, RowStatus, StagedRow, StagingCounts, StagingStore};
pub use status::{JobRecord, JobState, SheetState, SheetStatus, StatusTracker};
