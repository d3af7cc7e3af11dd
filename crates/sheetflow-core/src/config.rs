//! Processing configuration
//!
//! An immutable value describing every option the engine recognizes. Built
//! via the builder, then treated as read-only and shared freely across
//! concurrent sheet pipelines.

use uuid::Uuid;

/// Configuration for streaming read/write processing.
#[derive(Debug, Clone)]
pub struct ProcessingConfig {
    /// Records per batch handed to the batch callback
    pub batch_size: usize,
    /// Advisory threshold for the estimated in-flight batch footprint
    pub memory_threshold_mb: usize,
    /// Upper bound on concurrently processed sheets (used by orchestrators)
    pub sheet_parallelism: usize,
    /// Record count at or below which the in-memory workbook writer applies
    pub in_memory_max_records: u64,
    /// Cell count at or below which the in-memory workbook writer applies
    pub in_memory_max_cells: u64,
    /// Record count at or below which the streaming workbook writer applies
    pub streaming_max_records: u64,
    /// Cell count at or below which the streaming workbook writer applies
    pub streaming_max_cells: u64,
    /// Force delimited-text output regardless of size
    pub prefer_csv_for_large_data: bool,
    /// Delimiter used by the delimited-text writer
    pub csv_delimiter: u8,
    /// The batch callback may be invoked from concurrent logical batches
    pub parallel_batches: bool,
    /// Emit a progress log every N row boundaries
    pub progress_report_interval: Option<u64>,
    /// Abort the sheet once this many row errors have accumulated
    pub max_errors_before_abort: Option<u64>,
    /// Fields that must be present and non-blank
    pub required_fields: Vec<String>,
    /// Fields the insert collaborator should treat as conflict keys
    pub unique_fields: Vec<String>,
    /// Strict mode: the validation chain stops at the first failing rule
    pub strict_validation: bool,
    /// Correlation id for monitoring/metrics
    pub job_id: Option<Uuid>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            memory_threshold_mb: 512,
            sheet_parallelism: 2,
            in_memory_max_records: 50_000,
            in_memory_max_cells: 1_000_000,
            streaming_max_records: 2_000_000,
            streaming_max_cells: 5_000_000,
            prefer_csv_for_large_data: false,
            csv_delimiter: b',',
            parallel_batches: false,
            progress_report_interval: None,
            max_errors_before_abort: None,
            required_fields: Vec::new(),
            unique_fields: Vec::new(),
            strict_validation: false,
            job_id: None,
        }
    }
}

impl ProcessingConfig {
    pub fn builder() -> ProcessingConfigBuilder {
        ProcessingConfigBuilder::default()
    }
}

/// Builder for ProcessingConfig
#[derive(Default)]
pub struct ProcessingConfigBuilder {
    config: ProcessingConfig,
}

impl ProcessingConfigBuilder {
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size.max(1);
        self
    }

    pub fn memory_threshold_mb(mut self, mb: usize) -> Self {
        self.config.memory_threshold_mb = mb;
        self
    }

    pub fn sheet_parallelism(mut self, sheets: usize) -> Self {
        self.config.sheet_parallelism = sheets.max(1);
        self
    }

    pub fn in_memory_limits(mut self, max_records: u64, max_cells: u64) -> Self {
        self.config.in_memory_max_records = max_records;
        self.config.in_memory_max_cells = max_cells;
        self
    }

    pub fn streaming_limits(mut self, max_records: u64, max_cells: u64) -> Self {
        self.config.streaming_max_records = max_records;
        self.config.streaming_max_cells = max_cells;
        self
    }

    pub fn prefer_csv_for_large_data(mut self, prefer: bool) -> Self {
        self.config.prefer_csv_for_large_data = prefer;
        self
    }

    pub fn csv_delimiter(mut self, delimiter: u8) -> Self {
        self.config.csv_delimiter = delimiter;
        self
    }

    pub fn parallel_batches(mut self, parallel: bool) -> Self {
        self.config.parallel_batches = parallel;
        self
    }

    pub fn progress_report_interval(mut self, rows: u64) -> Self {
        self.config.progress_report_interval = Some(rows.max(1));
        self
    }

    pub fn max_errors_before_abort(mut self, max: u64) -> Self {
        self.config.max_errors_before_abort = Some(max);
        self
    }

    pub fn required_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.required_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn unique_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.unique_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn strict_validation(mut self, strict: bool) -> Self {
        self.config.strict_validation = strict;
        self
    }

    pub fn job_id(mut self, id: Uuid) -> Self {
        self.config.job_id = Some(id);
        self
    }

    pub fn build(self) -> ProcessingConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProcessingConfig::default();
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.in_memory_max_records, 50_000);
        assert_eq!(config.streaming_max_cells, 5_000_000);
        assert!(!config.prefer_csv_for_large_data);
        assert!(config.max_errors_before_abort.is_none());
    }

    #[test]
    fn test_builder_clamps_zero_batch_size() {
        let config = ProcessingConfig::builder().batch_size(0).build();
        assert_eq!(config.batch_size, 1);
    }

    #[test]
    fn test_builder_fields() {
        let config = ProcessingConfig::builder()
            .batch_size(250)
            .max_errors_before_abort(10)
            .required_fields(["name", "code"])
            .strict_validation(true)
            .build();

        assert_eq!(config.batch_size, 250);
        assert_eq!(config.max_errors_before_abort, Some(10));
        assert_eq!(config.required_fields, vec!["name", "code"]);
        assert!(config.strict_validation);
    }
}
