//! Read and write strategy selection
//!
//! Strategies self-describe what they support; registries pick the highest
//! priority candidate that supports the current configuration (reads) or
//! the data shape (writes). Both registries carry an always-applicable
//! fallback so selection never fails.

use std::path::Path;

use crate::config::ProcessingConfig;
use crate::writer::{DelimitedText, InMemoryWorkbook, StreamingWorkbook, WriteSink};
use sheetflow_common::Result;

/// How row batches are delivered to the caller.
pub trait ReadStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn priority(&self) -> u8;
    fn supports(&self, config: &ProcessingConfig) -> bool;
    /// Whether batch callbacks may be invoked from worker threads.
    fn parallel_callbacks(&self) -> bool;
}

/// Batches delivered in source order on the calling thread.
pub struct SequentialRead;

impl ReadStrategy for SequentialRead {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn priority(&self) -> u8 {
        10
    }

    fn supports(&self, _config: &ProcessingConfig) -> bool {
        true
    }

    fn parallel_callbacks(&self) -> bool {
        false
    }
}

/// Parse stays sequential, batch callbacks run on worker threads. Only
/// offered when the caller opted in; order across batches is not
/// guaranteed.
pub struct ParallelBatchRead;

impl ReadStrategy for ParallelBatchRead {
    fn name(&self) -> &'static str {
        "parallel_batch"
    }

    fn priority(&self) -> u8 {
        20
    }

    fn supports(&self, config: &ProcessingConfig) -> bool {
        config.parallel_batches
    }

    fn parallel_callbacks(&self) -> bool {
        true
    }
}

pub struct ReadStrategyRegistry {
    strategies: Vec<Box<dyn ReadStrategy>>,
    fallback: SequentialRead,
}

impl ReadStrategyRegistry {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
            fallback: SequentialRead,
        }
    }

    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(SequentialRead));
        registry.register(Box::new(ParallelBatchRead));
        registry
    }

    pub fn register(&mut self, strategy: Box<dyn ReadStrategy>) {
        self.strategies.push(strategy);
    }

    /// Highest priority strategy that supports the configuration.
    pub fn select(&self, config: &ProcessingConfig) -> &dyn ReadStrategy {
        self.strategies
            .iter()
            .filter(|s| s.supports(config))
            .max_by_key(|s| s.priority())
            .map(|s| s.as_ref())
            .unwrap_or(&self.fallback)
    }
}

impl Default for ReadStrategyRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// How a record set is materialised on disk. `supports` sees the data
/// shape known so far; oversized sets degrade to delimited text. `open`
/// returns a sink that is fed batch by batch, so no strategy forces the
/// caller to hold the whole set in memory.
pub trait WriteStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn priority(&self) -> u8;
    fn supports(&self, records: u64, cells: u64, config: &ProcessingConfig) -> bool;
    fn open(
        &self,
        path: &Path,
        sheet: &str,
        headers: &[String],
        config: &ProcessingConfig,
    ) -> Result<Box<dyn WriteSink>>;
}

pub struct WriteStrategyRegistry {
    strategies: Vec<Box<dyn WriteStrategy>>,
    fallback: DelimitedText,
}

impl WriteStrategyRegistry {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
            fallback: DelimitedText,
        }
    }

    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(InMemoryWorkbook));
        registry.register(Box::new(StreamingWorkbook));
        registry.register(Box::new(DelimitedText));
        registry
    }

    pub fn register(&mut self, strategy: Box<dyn WriteStrategy>) {
        self.strategies.push(strategy);
    }

    /// Highest priority strategy that supports the data shape.
    pub fn select(&self, records: u64, cells: u64, config: &ProcessingConfig) -> &dyn WriteStrategy {
        self.strategies
            .iter()
            .filter(|s| s.supports(records, cells, config))
            .max_by_key(|s| s.priority())
            .map(|s| s.as_ref())
            .unwrap_or(&self.fallback)
    }
}

impl Default for WriteStrategyRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_read_is_the_default() {
        let config = ProcessingConfig::default();
        let registry = ReadStrategyRegistry::standard();
        assert_eq!(registry.select(&config).name(), "sequential");
    }

    #[test]
    fn parallel_batches_opt_in_wins_on_priority() {
        let config = ProcessingConfig::builder().parallel_batches(true).build();
        let registry = ReadStrategyRegistry::standard();
        let strategy = registry.select(&config);
        assert_eq!(strategy.name(), "parallel_batch");
        assert!(strategy.parallel_callbacks());
    }

    #[test]
    fn small_data_selects_in_memory_workbook() {
        let config = ProcessingConfig::default();
        let registry = WriteStrategyRegistry::standard();
        assert_eq!(registry.select(100, 1_000, &config).name(), "in_memory_workbook");
    }

    #[test]
    fn mid_size_data_selects_streaming_workbook() {
        let config = ProcessingConfig::default();
        let registry = WriteStrategyRegistry::standard();
        let records = config.in_memory_max_records + 1;
        assert_eq!(
            registry.select(records, records * 5, &config).name(),
            "streaming_workbook"
        );
    }

    #[test]
    fn csv_preference_degrades_large_data_to_delimited() {
        let config = ProcessingConfig::builder()
            .prefer_csv_for_large_data(true)
            .build();
        let registry = WriteStrategyRegistry::standard();
        let records = config.in_memory_max_records + 1;
        assert_eq!(
            registry.select(records, records * 5, &config).name(),
            "delimited_text"
        );
    }

    #[test]
    fn oversized_data_always_falls_back_to_delimited() {
        let config = ProcessingConfig::default();
        let registry = WriteStrategyRegistry::standard();
        let records = config.streaming_max_records + 1;
        assert_eq!(
            registry.select(records, records * 10, &config).name(),
            "delimited_text"
        );
    }
}
