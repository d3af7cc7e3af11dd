//! Record-set export
//!
//! Three write strategies: a plain in-memory workbook for small sets, a
//! constant-memory workbook for mid-size sets, and delimited text for
//! everything beyond that (or when the caller prefers text for large data).
//! Each strategy opens a [`WriteSink`] that is fed batch by batch;
//! [`RecordSetWriter`] handles selection when the set size is not known up
//! front.

use std::path::{Path, PathBuf};

use rust_xlsxwriter::{Workbook, Worksheet, XlsxError};
use tracing::{debug, info};

use crate::config::ProcessingConfig;
use crate::schema::FieldValue;
use crate::strategy::{WriteStrategy, WriteStrategyRegistry};
use sheetflow_common::{Result, SheetflowError};

fn write_err(e: XlsxError) -> SheetflowError {
    SheetflowError::Write(e.to_string())
}

fn csv_err(e: csv::Error) -> SheetflowError {
    SheetflowError::Write(e.to_string())
}

fn write_cell(worksheet: &mut Worksheet, row: u32, col: u16, value: &FieldValue) -> Result<()> {
    match value {
        FieldValue::Text(s) => {
            worksheet.write_string(row, col, s.as_str()).map_err(write_err)?;
        },
        FieldValue::Integer(v) => {
            worksheet.write_number(row, col, *v as f64).map_err(write_err)?;
        },
        FieldValue::Decimal(v) => {
            worksheet.write_number(row, col, *v).map_err(write_err)?;
        },
        FieldValue::Boolean(b) => {
            worksheet.write_boolean(row, col, *b).map_err(write_err)?;
        },
        // Dates go out as ISO text, typing is the reader's concern
        FieldValue::Date(_) | FieldValue::DateTime(_) => {
            worksheet
                .write_string(row, col, value.display_string())
                .map_err(write_err)?;
        },
        FieldValue::Empty => {},
    }
    Ok(())
}

/// Incremental consumer for one record set. Batches must arrive in row
/// order; `finish` flushes and closes the output.
pub trait WriteSink {
    fn write_batch(&mut self, rows: &[Vec<FieldValue>]) -> Result<()>;
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Workbook-backed sink shared by both workbook strategies. The worksheet
/// itself decides whether rows stay in memory or flush constantly.
struct WorkbookSink {
    workbook: Workbook,
    path: PathBuf,
    next_row: u32,
}

impl WorkbookSink {
    fn open(mut workbook: Workbook, path: &Path, sheet: &str, headers: &[String]) -> Result<Self> {
        let worksheet = workbook.worksheet_from_index(0).map_err(write_err)?;
        worksheet.set_name(sheet).map_err(write_err)?;
        for (col, header) in headers.iter().enumerate() {
            worksheet
                .write_string(0, col as u16, header.as_str())
                .map_err(write_err)?;
        }
        Ok(Self {
            workbook,
            path: path.to_path_buf(),
            next_row: 1,
        })
    }
}

impl WriteSink for WorkbookSink {
    fn write_batch(&mut self, rows: &[Vec<FieldValue>]) -> Result<()> {
        let worksheet = self.workbook.worksheet_from_index(0).map_err(write_err)?;
        for row in rows {
            for (col, value) in row.iter().enumerate() {
                write_cell(worksheet, self.next_row, col as u16, value)?;
            }
            self.next_row += 1;
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.workbook.save(&self.path).map_err(write_err)
    }
}

struct DelimitedSink {
    writer: csv::Writer<std::fs::File>,
}

impl WriteSink for DelimitedSink {
    fn write_batch(&mut self, rows: &[Vec<FieldValue>]) -> Result<()> {
        for row in rows {
            let record: Vec<String> = row.iter().map(|v| v.display_string()).collect();
            self.writer.write_record(&record).map_err(csv_err)?;
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Whole workbook assembled in memory before saving. Fastest for small
/// sets.
pub struct InMemoryWorkbook;

impl WriteStrategy for InMemoryWorkbook {
    fn name(&self) -> &'static str {
        "in_memory_workbook"
    }

    fn priority(&self) -> u8 {
        30
    }

    fn supports(&self, records: u64, cells: u64, config: &ProcessingConfig) -> bool {
        records <= config.in_memory_max_records && cells <= config.in_memory_max_cells
    }

    fn open(
        &self,
        path: &Path,
        sheet: &str,
        headers: &[String],
        _config: &ProcessingConfig,
    ) -> Result<Box<dyn WriteSink>> {
        let mut workbook = Workbook::new();
        workbook.add_worksheet();
        Ok(Box::new(WorkbookSink::open(workbook, path, sheet, headers)?))
    }
}

/// Constant-memory workbook: rows are flushed to a temp file as they are
/// written, so the footprint stays flat for mid-size sets. Rows must be
/// written strictly in order, which the sink contract already requires.
pub struct StreamingWorkbook;

impl WriteStrategy for StreamingWorkbook {
    fn name(&self) -> &'static str {
        "streaming_workbook"
    }

    fn priority(&self) -> u8 {
        20
    }

    fn supports(&self, records: u64, cells: u64, config: &ProcessingConfig) -> bool {
        if config.prefer_csv_for_large_data {
            return false;
        }
        records <= config.streaming_max_records && cells <= config.streaming_max_cells
    }

    fn open(
        &self,
        path: &Path,
        sheet: &str,
        headers: &[String],
        _config: &ProcessingConfig,
    ) -> Result<Box<dyn WriteSink>> {
        let mut workbook = Workbook::new();
        workbook.add_worksheet_with_constant_memory();
        Ok(Box::new(WorkbookSink::open(workbook, path, sheet, headers)?))
    }
}

/// Delimited text fallback. Always applicable, loses workbook typing, and
/// is the only sensible answer past the streaming limits.
pub struct DelimitedText;

impl WriteStrategy for DelimitedText {
    fn name(&self) -> &'static str {
        "delimited_text"
    }

    fn priority(&self) -> u8 {
        10
    }

    fn supports(&self, _records: u64, _cells: u64, _config: &ProcessingConfig) -> bool {
        true
    }

    fn open(
        &self,
        path: &Path,
        _sheet: &str,
        headers: &[String],
        config: &ProcessingConfig,
    ) -> Result<Box<dyn WriteSink>> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(config.csv_delimiter)
            .from_path(path)
            .map_err(csv_err)?;
        writer.write_record(headers).map_err(csv_err)?;
        Ok(Box::new(DelimitedSink { writer }))
    }
}

enum WriterState {
    /// Still small enough that the final shape may pick the in-memory
    /// workbook; rows are held back until we know.
    Buffering(Vec<Vec<FieldValue>>),
    Streaming {
        sink: Box<dyn WriteSink>,
        strategy: &'static str,
    },
}

/// Batch-feed writer for record sets whose size is not known up front.
///
/// Batches are buffered only while the set still fits the in-memory
/// workbook thresholds, so small sets get exact strategy selection. Once
/// the buffer outgrows those limits the accumulated rows are replayed into
/// a streaming sink (constant-memory workbook, or delimited text under
/// `prefer_csv_for_large_data`) and later batches flow straight through,
/// keeping memory bounded for arbitrarily large sets.
pub struct RecordSetWriter<'c> {
    path: PathBuf,
    sheet: String,
    headers: Vec<String>,
    config: &'c ProcessingConfig,
    registry: WriteStrategyRegistry,
    state: WriterState,
    records: u64,
    cells: u64,
}

impl<'c> RecordSetWriter<'c> {
    pub fn create(
        path: &Path,
        sheet: impl Into<String>,
        headers: Vec<String>,
        config: &'c ProcessingConfig,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            sheet: sheet.into(),
            headers,
            config,
            registry: WriteStrategyRegistry::standard(),
            state: WriterState::Buffering(Vec::new()),
            records: 0,
            cells: 0,
        }
    }

    /// Feed one batch of rows, in source order.
    pub fn push_batch(&mut self, rows: &[Vec<FieldValue>]) -> Result<()> {
        self.records += rows.len() as u64;
        self.cells += rows.iter().map(|r| r.len() as u64).sum::<u64>();
        if let WriterState::Streaming { sink, .. } = &mut self.state {
            return sink.write_batch(rows);
        }
        if let WriterState::Buffering(buffer) = &mut self.state {
            buffer.extend(rows.iter().cloned());
        }
        if self.records > self.config.in_memory_max_records
            || self.cells > self.config.in_memory_max_cells
        {
            self.escalate()?;
        }
        Ok(())
    }

    /// The set has outgrown the in-memory workbook; pick a streaming-capable
    /// strategy for the counts so far and replay the buffer into it.
    fn escalate(&mut self) -> Result<()> {
        let WriterState::Buffering(buffer) = &mut self.state else {
            return Ok(());
        };
        let buffer = std::mem::take(buffer);
        let strategy = self.registry.select(self.records, self.cells, self.config);
        debug!(
            strategy = strategy.name(),
            buffered = buffer.len(),
            "record set outgrew the in-memory writer"
        );
        let mut sink = strategy.open(&self.path, &self.sheet, &self.headers, self.config)?;
        sink.write_batch(&buffer)?;
        self.state = WriterState::Streaming {
            sink,
            strategy: strategy.name(),
        };
        Ok(())
    }

    /// Close the output. Returns the name of the strategy that was used.
    pub fn finish(self) -> Result<&'static str> {
        let used = match self.state {
            WriterState::Streaming { sink, strategy } => {
                sink.finish()?;
                strategy
            },
            WriterState::Buffering(buffer) => {
                let strategy = self.registry.select(self.records, self.cells, self.config);
                debug!(
                    strategy = strategy.name(),
                    records = self.records,
                    cells = self.cells,
                    "write strategy selected"
                );
                let mut sink =
                    strategy.open(&self.path, &self.sheet, &self.headers, self.config)?;
                sink.write_batch(&buffer)?;
                sink.finish()?;
                strategy.name()
            },
        };
        info!(
            path = %self.path.display(),
            strategy = used,
            records = self.records,
            "record set written"
        );
        Ok(used)
    }
}

/// Write a fully materialised record set to `path`, picking the strategy
/// from the data shape. Returns the name of the strategy that was used.
pub fn write_records(
    path: &Path,
    sheet: &str,
    headers: &[String],
    rows: &[Vec<FieldValue>],
    config: &ProcessingConfig,
) -> Result<&'static str> {
    let records = rows.len() as u64;
    let cells: u64 = rows.iter().map(|r| r.len() as u64).sum();

    let registry = WriteStrategyRegistry::standard();
    let strategy = registry.select(records, cells, config);
    debug!(
        strategy = strategy.name(),
        records, cells, "write strategy selected"
    );

    let mut sink = strategy.open(path, sheet, headers, config)?;
    sink.write_batch(rows)?;
    sink.finish()?;
    info!(
        path = %path.display(),
        strategy = strategy.name(),
        records,
        "record set written"
    );
    Ok(strategy.name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessingConfig;
    use chrono::NaiveDate;

    fn headers() -> Vec<String> {
        vec!["code".to_string(), "qty".to_string(), "when".to_string()]
    }

    fn rows() -> Vec<Vec<FieldValue>> {
        vec![
            vec![
                FieldValue::Text("A-1".to_string()),
                FieldValue::Integer(3),
                FieldValue::Date(NaiveDate::from_ymd_opt(2023, 6, 15).unwrap()),
            ],
            vec![
                FieldValue::Text("B-2".to_string()),
                FieldValue::Decimal(1.5),
                FieldValue::Empty,
            ],
        ]
    }

    #[test]
    fn small_set_is_written_as_workbook() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.xlsx");
        let config = ProcessingConfig::default();
        let used = write_records(&path, "Parts", &headers(), &rows(), &config).unwrap();
        assert_eq!(used, "in_memory_workbook");
        assert!(path.exists());
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn tiny_limits_force_delimited_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let config = ProcessingConfig::builder()
            .in_memory_limits(1, 2)
            .streaming_limits(1, 2)
            .csv_delimiter(b';')
            .build();
        let used = write_records(&path, "Parts", &headers(), &rows(), &config).unwrap();
        assert_eq!(used, "delimited_text");

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("code;qty;when"));
        assert_eq!(lines.next(), Some("A-1;3;2023-06-15"));
    }

    #[test]
    fn delimited_round_trips_empty_cells_as_blank() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let config = ProcessingConfig::builder()
            .in_memory_limits(0, 0)
            .streaming_limits(0, 0)
            .build();
        write_records(&path, "Parts", &headers(), &rows(), &config).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.lines().nth(2).unwrap().ends_with(','));
    }

    #[test]
    fn batch_feed_keeps_small_sets_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.xlsx");
        let config = ProcessingConfig::default();
        let mut writer = RecordSetWriter::create(&path, "Parts", headers(), &config);
        writer.push_batch(&rows()).unwrap();
        let used = writer.finish().unwrap();
        assert_eq!(used, "in_memory_workbook");
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn batch_feed_escalates_to_streaming_workbook() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.xlsx");
        let config = ProcessingConfig::builder().in_memory_limits(3, 1_000).build();
        let mut writer = RecordSetWriter::create(&path, "Parts", headers(), &config);
        for _ in 0..4 {
            writer.push_batch(&rows()).unwrap();
        }
        let used = writer.finish().unwrap();
        assert_eq!(used, "streaming_workbook");
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn batch_feed_escalation_honours_csv_preference() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.csv");
        let config = ProcessingConfig::builder()
            .in_memory_limits(1, 10)
            .prefer_csv_for_large_data(true)
            .build();
        let mut writer = RecordSetWriter::create(&path, "Parts", headers(), &config);
        writer.push_batch(&rows()).unwrap();
        writer.push_batch(&rows()).unwrap();
        let used = writer.finish().unwrap();
        assert_eq!(used, "delimited_text");

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        // Buffered rows were replayed ahead of the later batch
        assert_eq!(lines.next(), Some("code,qty,when"));
        assert_eq!(lines.next(), Some("A-1,3,2023-06-15"));
        assert_eq!(text.lines().count(), 5);
    }
}
