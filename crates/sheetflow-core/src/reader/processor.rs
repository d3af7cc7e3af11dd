//! Streaming row processor
//!
//! Drives the incremental pull over a sheet part and turns completed rows
//! into typed record batches. The batch callback is invoked synchronously at
//! batch-size boundaries; that synchronous handoff is the backpressure
//! mechanism that bounds memory at O(batch_size) regardless of sheet size.

use std::io::{Read, Seek};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::container::WorkbookContainer;
use super::rows::{RawRow, RowReader};
use super::{DynamicFactory, RecordFactory, TypedFactory};
use crate::config::ProcessingConfig;
use crate::convert::convert_cell;
use crate::schema::{ColumnRef, FieldValue, RecordDescriptor, SheetRecord};
use crate::strategy::ReadStrategyRegistry;
use crate::validate::{RequiredFields, ValidationChain};
use sheetflow_common::Result;

/// An ordered, bounded group of records plus their 1-based source row
/// numbers. Transient: lives only between "batch full" and "callback
/// returns".
#[derive(Debug)]
pub struct Batch<T> {
    records: Vec<T>,
    row_numbers: Vec<u32>,
}

impl<T> Batch<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            row_numbers: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn push(&mut self, row_num: u32, record: T) {
        self.records.push(record);
        self.row_numbers.push(row_num);
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
        self.row_numbers.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[T] {
        &self.records
    }

    pub fn row_numbers(&self) -> &[u32] {
        &self.row_numbers
    }

    /// (source row number, record) pairs in source order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.row_numbers.iter().copied().zip(self.records.iter())
    }
}

/// Sentinel error for batch callbacks whose downstream consumer has gone
/// away. Unlike other callback failures, which are counted and survived,
/// this one stops the stream: there is nobody left to deliver to.
#[derive(Debug, thiserror::Error)]
#[error("batch consumer closed")]
pub struct SinkClosed;

/// One row that could not be turned into a clean record. Recorded and
/// counted, never thrown.
#[derive(Debug, Clone)]
pub struct RowFailure {
    pub row: u32,
    pub column: Option<String>,
    /// Failing rule name, or "conversion" / "batch_callback"
    pub rule: String,
    pub message: String,
    /// Raw token snapshot for the audit trail (column letters -> raw text)
    pub raw: serde_json::Value,
}

/// Terminal state of one sheet stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Completed,
    AbortedOnErrorThreshold,
    /// The batch consumer reported [`SinkClosed`] and the stream stopped early
    SinkClosed,
    /// Sheet was registered but not present in the workbook
    SheetMissing,
}

/// Per-sheet stream summary, produced once at completion.
#[derive(Debug, Clone)]
pub struct ProcessingResult {
    pub sheet: String,
    /// Data rows consumed (header and fully blank rows excluded)
    pub processed: u64,
    /// Rows that failed conversion, validation, or batch delivery
    pub errors: u64,
    pub elapsed: Duration,
    pub outcome: ProcessingOutcome,
    /// Row number at which the stream stopped early, when it did
    pub abort_row: Option<u32>,
}

impl ProcessingResult {
    pub fn rows_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.processed as f64 / secs
        } else {
            0.0
        }
    }

    pub(crate) fn missing(sheet: &str) -> Self {
        Self {
            sheet: sheet.to_string(),
            processed: 0,
            errors: 0,
            elapsed: Duration::ZERO,
            outcome: ProcessingOutcome::SheetMissing,
            abort_row: None,
        }
    }
}

pub(crate) enum RowFlow {
    Continue,
    Abort,
}

/// Per-sheet row engine shared by the single-sheet processor and the
/// multi-sheet dispatcher. Holds exactly one batch in flight.
pub(crate) struct SheetEngine<'c, F, CB, EB>
where
    F: RecordFactory,
    CB: FnMut(&Batch<F::Record>) -> anyhow::Result<()>,
    EB: FnMut(&RowFailure),
{
    config: &'c ProcessingConfig,
    factory: F,
    chain: Option<&'c ValidationChain>,
    on_batch: CB,
    on_failure: EB,
    batch: Batch<F::Record>,
    /// Column index -> binding index, built from the header row
    header_map: Option<Vec<(u32, usize)>>,
    processed: u64,
    errors: u64,
    memory_warned: bool,
    sink_closed: bool,
}

impl<'c, F, CB, EB> SheetEngine<'c, F, CB, EB>
where
    F: RecordFactory,
    CB: FnMut(&Batch<F::Record>) -> anyhow::Result<()>,
    EB: FnMut(&RowFailure),
{
    pub(crate) fn new(
        config: &'c ProcessingConfig,
        factory: F,
        chain: Option<&'c ValidationChain>,
        on_batch: CB,
        on_failure: EB,
    ) -> Self {
        let batch = Batch::with_capacity(config.batch_size);
        Self {
            config,
            factory,
            chain,
            on_batch,
            on_failure,
            batch,
            header_map: None,
            processed: 0,
            errors: 0,
            memory_warned: false,
            sink_closed: false,
        }
    }

    /// Whether the descriptor needs a header row at all (purely positional
    /// schemas start on data immediately).
    fn needs_header(&self) -> bool {
        self.factory
            .descriptor()
            .bindings()
            .iter()
            .any(|b| matches!(b.column, ColumnRef::Name(_)))
    }

    fn build_header_map(&mut self, row: &RawRow) {
        let descriptor = self.factory.descriptor();
        let mut map = Vec::new();
        for cell in &row.cells {
            let header = cell.scalar.raw_string();
            if let Some(index) = descriptor.index_for_header(&header) {
                map.push((cell.column, index));
            } else {
                debug!(column = %cell.column_ref, header = %header, "unbound header column");
            }
        }
        self.header_map = Some(map);
    }

    fn binding_for_column(&self, column: u32) -> Option<&crate::schema::ColumnBinding> {
        let descriptor = self.factory.descriptor();
        if let Some(map) = &self.header_map {
            if let Some(&(_, index)) = map.iter().find(|(col, _)| *col == column) {
                return Some(&descriptor.bindings()[index]);
            }
        }
        descriptor.binding_for_position(column)
    }

    /// Feed one raw row through convert + validate + batch. Fully blank
    /// rows are skipped without counting.
    pub(crate) fn offer_row(&mut self, row: &RawRow, sheet: &str) -> Result<RowFlow> {
        // Blank rows never bind headers; a padded sheet may lead with one.
        if row.is_blank() {
            return Ok(RowFlow::Continue);
        }
        if self.header_map.is_none() && self.needs_header() {
            self.build_header_map(row);
            return Ok(RowFlow::Continue);
        }

        self.processed += 1;
        self.report_progress(sheet);

        let mut record = self.factory.create();
        let mut conversion_errors: Vec<(String, String)> = Vec::new();
        for cell in &row.cells {
            let Some(binding) = self.binding_for_column(cell.column) else {
                continue;
            };
            match convert_cell(
                &cell.scalar,
                binding.field_type,
                binding.format.as_deref(),
                row.row_num,
                &cell.column_ref,
            ) {
                Ok(value) => {
                    if let (Some(max), FieldValue::Text(text)) = (binding.max_length, &value) {
                        if text.chars().count() > max {
                            conversion_errors.push((
                                cell.column_ref.clone(),
                                format!(
                                    "field '{}' exceeds max length {}",
                                    binding.field, max
                                ),
                            ));
                            continue;
                        }
                    }
                    let field = binding.field.clone();
                    self.factory.assign(&mut record, &field, value);
                },
                Err(e) => conversion_errors.push((cell.column_ref.clone(), e.to_string())),
            }
        }

        if !conversion_errors.is_empty() {
            self.errors += 1;
            let (column, _) = &conversion_errors[0];
            let failure = RowFailure {
                row: row.row_num,
                column: Some(column.clone()),
                rule: "conversion".to_string(),
                message: conversion_errors
                    .iter()
                    .map(|(_, m)| m.as_str())
                    .collect::<Vec<_>>()
                    .join("; "),
                raw: row.raw_snapshot(),
            };
            (self.on_failure)(&failure);
            return Ok(self.check_abort(row.row_num));
        }

        if let Some(chain) = self.chain {
            let result = chain.validate(&record, row.row_num);
            if !result.is_valid() {
                self.errors += 1;
                let first = &result.errors[0];
                let failure = RowFailure {
                    row: row.row_num,
                    column: None,
                    rule: first.rule.to_string(),
                    message: result
                        .errors
                        .iter()
                        .map(|e| e.message.as_str())
                        .collect::<Vec<_>>()
                        .join("; "),
                    raw: row.raw_snapshot(),
                };
                (self.on_failure)(&failure);
                return Ok(self.check_abort(row.row_num));
            }
        }

        self.batch.push(row.row_num, record);
        if self.batch.len() >= self.config.batch_size {
            if let RowFlow::Abort = self.flush(sheet) {
                return Ok(RowFlow::Abort);
            }
        }

        Ok(self.check_abort(row.row_num))
    }

    /// Every data row passes through here, error rows included, so interval
    /// boundaries are never silently skipped.
    fn report_progress(&self, sheet: &str) {
        if let Some(interval) = self.config.progress_report_interval {
            if self.processed % interval == 0 {
                info!(
                    sheet = %sheet,
                    rows = self.processed,
                    errors = self.errors,
                    "streaming progress"
                );
            }
        }
    }

    fn check_abort(&self, row: u32) -> RowFlow {
        if let Some(max) = self.config.max_errors_before_abort {
            if self.errors > max {
                warn!(
                    row,
                    errors = self.errors,
                    max,
                    "error threshold exceeded, aborting sheet"
                );
                return RowFlow::Abort;
            }
        }
        RowFlow::Continue
    }

    /// Hand the current batch to the callback, synchronously, and start a
    /// fresh one. Callback failures are counted as row-level errors and the
    /// parse continues, unless the callback reports [`SinkClosed`], which
    /// aborts the stream.
    fn flush(&mut self, sheet: &str) -> RowFlow {
        if self.batch.is_empty() {
            return RowFlow::Continue;
        }

        if !self.memory_warned {
            // Advisory only: estimates the in-flight batch footprint, does
            // not throttle (backpressure already bounds memory)
            let estimate = self.batch.len() * std::mem::size_of::<F::Record>();
            if estimate > self.config.memory_threshold_mb * 1024 * 1024 {
                warn!(
                    sheet = %sheet,
                    estimated_bytes = estimate,
                    threshold_mb = self.config.memory_threshold_mb,
                    "in-flight batch estimate above memory threshold"
                );
                self.memory_warned = true;
            }
        }

        if let Err(e) = (self.on_batch)(&self.batch) {
            self.errors += self.batch.len() as u64;
            if e.downcast_ref::<SinkClosed>().is_some() {
                self.sink_closed = true;
                warn!(
                    sheet = %sheet,
                    rows = self.batch.len(),
                    "batch consumer closed, stopping stream"
                );
                self.batch.clear();
                return RowFlow::Abort;
            }
            warn!(
                sheet = %sheet,
                rows = self.batch.len(),
                error = %e,
                "batch callback failed, rows counted as errors"
            );
        }
        self.batch.clear();
        RowFlow::Continue
    }

    /// Flush the final partial batch and produce the sheet summary.
    pub(crate) fn finish(
        mut self,
        sheet: &str,
        started: Instant,
        abort_row: Option<u32>,
    ) -> ProcessingResult {
        if abort_row.is_none() {
            self.flush(sheet);
        }
        let outcome = if self.sink_closed {
            ProcessingOutcome::SinkClosed
        } else if abort_row.is_some() {
            ProcessingOutcome::AbortedOnErrorThreshold
        } else {
            ProcessingOutcome::Completed
        };
        let result = ProcessingResult {
            sheet: sheet.to_string(),
            processed: self.processed,
            errors: self.errors,
            elapsed: started.elapsed(),
            outcome,
            abort_row,
        };
        info!(
            sheet = %sheet,
            processed = result.processed,
            errors = result.errors,
            outcome = ?result.outcome,
            rows_per_sec = format!("{:.0}", result.rows_per_sec()),
            "sheet stream finished"
        );
        result
    }

    /// Drive a row reader to completion (or abort) through this engine.
    pub(crate) fn drain(mut self, rows: &mut RowReader<'_>, sheet: &str) -> Result<ProcessingResult> {
        let started = Instant::now();
        let mut abort_row = None;
        while let Some(row) = rows.next_row()? {
            if let RowFlow::Abort = self.offer_row(&row, sheet)? {
                abort_row = Some(row.row_num);
                break;
            }
        }
        Ok(self.finish(sheet, started, abort_row))
    }
}

/// The streaming row processor: single-sheet entry points over the shared
/// engine. Single-threaded by construction; the pull parse is strictly
/// sequential and `on_batch` runs on the caller's thread.
pub struct StreamingRowProcessor<'c> {
    config: &'c ProcessingConfig,
}

impl<'c> StreamingRowProcessor<'c> {
    pub fn new(config: &'c ProcessingConfig) -> Self {
        Self { config }
    }

    /// Stream one sheet (`None` = first sheet) into typed record batches.
    pub fn process_typed<T, R, CB>(
        &self,
        source: R,
        sheet: Option<&str>,
        chain: Option<&ValidationChain>,
        on_batch: CB,
    ) -> Result<ProcessingResult>
    where
        T: SheetRecord,
        R: Read + Seek,
        CB: FnMut(&Batch<T>) -> anyhow::Result<()>,
    {
        self.process_typed_with(source, sheet, chain, on_batch, |_| {})
    }

    /// Same as [`process_typed`](Self::process_typed) with a row-failure
    /// sink for audit trails.
    pub fn process_typed_with<T, R, CB, EB>(
        &self,
        source: R,
        sheet: Option<&str>,
        chain: Option<&ValidationChain>,
        on_batch: CB,
        on_failure: EB,
    ) -> Result<ProcessingResult>
    where
        T: SheetRecord,
        R: Read + Seek,
        CB: FnMut(&Batch<T>) -> anyhow::Result<()>,
        EB: FnMut(&RowFailure),
    {
        self.run(source, sheet, TypedFactory::<T>::new(), chain, on_batch, on_failure)
    }

    /// Stream one sheet into dynamic records per a runtime descriptor.
    pub fn process_dynamic_with<R, CB, EB>(
        &self,
        source: R,
        sheet: Option<&str>,
        descriptor: Arc<RecordDescriptor>,
        chain: Option<&ValidationChain>,
        on_batch: CB,
        on_failure: EB,
    ) -> Result<ProcessingResult>
    where
        R: Read + Seek,
        CB: FnMut(&Batch<crate::schema::DynamicRecord>) -> anyhow::Result<()>,
        EB: FnMut(&RowFailure),
    {
        self.run(
            source,
            sheet,
            DynamicFactory::new(descriptor),
            chain,
            on_batch,
            on_failure,
        )
    }

    fn run<F, R, CB, EB>(
        &self,
        source: R,
        sheet: Option<&str>,
        factory: F,
        chain: Option<&ValidationChain>,
        on_batch: CB,
        on_failure: EB,
    ) -> Result<ProcessingResult>
    where
        F: RecordFactory,
        R: Read + Seek,
        CB: FnMut(&Batch<F::Record>) -> anyhow::Result<()>,
        EB: FnMut(&RowFailure),
    {
        let registry = ReadStrategyRegistry::standard();
        let strategy = registry.select(self.config);
        debug!(strategy = strategy.name(), job = ?self.config.job_id, "read strategy selected");

        // Without an explicit chain, the config's required fields still apply
        let implicit_chain = match (&chain, self.config.required_fields.is_empty()) {
            (None, false) => Some(
                ValidationChain::new()
                    .fail_fast(self.config.strict_validation)
                    .with_rule(RequiredFields::new(self.config.required_fields.clone())),
            ),
            _ => None,
        };
        let chain = chain.or(implicit_chain.as_ref());

        let mut container = WorkbookContainer::open(source)?;
        let engine = SheetEngine::new(self.config, factory, chain, on_batch, on_failure);
        match sheet {
            Some(name) => {
                let sheet_name = name.to_string();
                let mut rows = container.rows(&sheet_name)?;
                engine.drain(&mut rows, &sheet_name)
            },
            None => {
                let (sheet_name, mut rows) = container.first_sheet_rows()?;
                engine.drain(&mut rows, &sheet_name)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_tracks_row_numbers_in_order() {
        let mut batch: Batch<u32> = Batch::with_capacity(4);
        batch.push(2, 20);
        batch.push(5, 50);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.row_numbers(), &[2, 5]);
        let pairs: Vec<_> = batch.iter().collect();
        assert_eq!(pairs, vec![(2, &20), (5, &50)]);
        batch.clear();
        assert!(batch.is_empty());
    }

    #[test]
    fn leading_blank_rows_do_not_bind_the_header() {
        use super::super::rows::RawCell;
        use crate::convert::CellScalar;
        use crate::schema::{ColumnBinding, DynamicRecord, FieldType, RecordSchema};

        let config = ProcessingConfig::default();
        let descriptor = Arc::new(RecordDescriptor::compile(RecordSchema::new(vec![
            ColumnBinding::new("code", "Code", FieldType::String),
        ])));

        let cell = |scalar: CellScalar| RawCell {
            column: 0,
            column_ref: "A".to_string(),
            scalar,
        };
        let row = |row_num, scalar| RawRow {
            row_num,
            cells: vec![cell(scalar)],
        };

        let mut collected: Vec<DynamicRecord> = Vec::new();
        let mut engine = SheetEngine::new(
            &config,
            DynamicFactory::new(descriptor),
            None,
            |batch: &Batch<DynamicRecord>| {
                collected.extend(batch.records().iter().cloned());
                Ok(())
            },
            |_failure: &RowFailure| {},
        );

        let started = Instant::now();
        engine.offer_row(&row(1, CellScalar::Blank), "Parts").unwrap();
        engine
            .offer_row(&row(2, CellScalar::Text("Code".into())), "Parts")
            .unwrap();
        engine
            .offer_row(&row(3, CellScalar::Text("X-1".into())), "Parts")
            .unwrap();
        let result = engine.finish("Parts", started, None);

        assert_eq!(result.processed, 1);
        assert_eq!(result.errors, 0);
        assert_eq!(collected.len(), 1);
        assert_eq!(
            collected[0].get("code"),
            Some(&FieldValue::Text("X-1".to_string()))
        );
    }

    #[test]
    fn rows_per_sec_handles_zero_elapsed() {
        let result = ProcessingResult {
            sheet: "Sheet1".to_string(),
            processed: 100,
            errors: 0,
            elapsed: Duration::ZERO,
            outcome: ProcessingOutcome::Completed,
            abort_row: None,
        };
        assert_eq!(result.rows_per_sec(), 0.0);

        let result = ProcessingResult {
            elapsed: Duration::from_secs(2),
            ..result
        };
        assert_eq!(result.rows_per_sec(), 50.0);
    }
}
