//! Sheetflow core engine
//!
//! Streaming ingestion of large .xlsx workbooks into typed record batches,
//! with bounded memory regardless of input size.
//!
//! The engine is deliberately synchronous: the underlying XML pull parse is
//! strictly sequential, and backpressure comes from the batch callback being
//! invoked synchronously, so the parser never holds more than one batch in
//! flight per sheet. Concurrency belongs to the layers above (see the
//! `sheetflow-migrate` crate).
//!
//! # Example
//!
//! ```rust,ignore
//! use sheetflow_core::{ProcessingConfig, StreamingRowProcessor};
//!
//! let config = ProcessingConfig::builder().batch_size(500).build();
//! let processor = StreamingRowProcessor::new(&config);
//! let result = processor.process_typed::<Order, _, _>(
//!     std::io::Cursor::new(bytes),
//!     None, // first sheet
//!     Some(&chain),
//!     |batch| {
//!         persist(batch.records())?;
//!         Ok(())
//!     },
//! )?;
//! println!("{} rows at {:.0} rows/sec", result.processed, result.rows_per_sec());
//! ```

pub mod config;
pub mod convert;
pub mod reader;
pub mod schema;
pub mod strategy;
pub mod validate;
pub mod writer;

pub use config::{ProcessingConfig, ProcessingConfigBuilder};
pub use convert::{convert_cell, CellScalar, ConversionError};
pub use reader::dispatcher::MultiSheetDispatcher;
pub use reader::processor::{
    Batch, ProcessingOutcome, ProcessingResult, RowFailure, SinkClosed, StreamingRowProcessor,
};
pub use schema::{
    descriptor_for, reset_descriptor_cache, ColumnBinding, ColumnRef, DynamicRecord, FieldLookup,
    FieldType, FieldValue, RecordDescriptor, RecordSchema, SheetRecord,
};
pub use strategy::{ReadStrategy, ReadStrategyRegistry, WriteStrategy, WriteStrategyRegistry};
pub use validate::{
    EnumMembership, NumericRange, PatternRule, RequiredFields, ValidationChain, ValidationError,
    ValidationResult, ValidationRule,
};
pub use writer::{write_records, RecordSetWriter, WriteSink};

pub use sheetflow_common::{Result, Severity, SheetflowError};
