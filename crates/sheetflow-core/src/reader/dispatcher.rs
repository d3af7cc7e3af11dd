//! Multi-sheet dispatch
//!
//! Routes the sheets of one workbook to per-sheet record handlers in a
//! single container pass. Each registration owns its validation chain and
//! callbacks; sheets present in the workbook but never registered are
//! skipped, registered sheets absent from the workbook yield a zero-count
//! result rather than an error.

use std::io::{Read, Seek};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info};

use super::container::WorkbookContainer;
use super::processor::{Batch, ProcessingResult, RowFailure, SheetEngine};
use super::rows::RowReader;
use super::{DynamicFactory, TypedFactory};
use crate::config::ProcessingConfig;
use crate::schema::{DynamicRecord, RecordDescriptor, SheetRecord};
use crate::validate::ValidationChain;
use sheetflow_common::Result;

/// Run-once handler for one registered sheet. Consumed on use so the
/// callbacks can be moved into the engine.
trait SheetSink {
    fn run_once(
        self: Box<Self>,
        config: &ProcessingConfig,
        rows: &mut RowReader<'_>,
        sheet: &str,
    ) -> Result<ProcessingResult>;
}

struct TypedSink<T, CB, EB> {
    chain: Option<ValidationChain>,
    on_batch: CB,
    on_failure: EB,
    _marker: PhantomData<fn() -> T>,
}

impl<T, CB, EB> SheetSink for TypedSink<T, CB, EB>
where
    T: SheetRecord,
    CB: FnMut(&Batch<T>) -> anyhow::Result<()>,
    EB: FnMut(&RowFailure),
{
    fn run_once(
        self: Box<Self>,
        config: &ProcessingConfig,
        rows: &mut RowReader<'_>,
        sheet: &str,
    ) -> Result<ProcessingResult> {
        let TypedSink {
            chain,
            on_batch,
            on_failure,
            _marker,
        } = *self;
        let engine = SheetEngine::new(
            config,
            TypedFactory::<T>::new(),
            chain.as_ref(),
            on_batch,
            on_failure,
        );
        engine.drain(rows, sheet)
    }
}

struct DynamicSink<CB, EB> {
    descriptor: Arc<RecordDescriptor>,
    chain: Option<ValidationChain>,
    on_batch: CB,
    on_failure: EB,
}

impl<CB, EB> SheetSink for DynamicSink<CB, EB>
where
    CB: FnMut(&Batch<DynamicRecord>) -> anyhow::Result<()>,
    EB: FnMut(&RowFailure),
{
    fn run_once(
        self: Box<Self>,
        config: &ProcessingConfig,
        rows: &mut RowReader<'_>,
        sheet: &str,
    ) -> Result<ProcessingResult> {
        let DynamicSink {
            descriptor,
            chain,
            on_batch,
            on_failure,
        } = *self;
        let engine = SheetEngine::new(
            config,
            DynamicFactory::new(descriptor),
            chain.as_ref(),
            on_batch,
            on_failure,
        );
        engine.drain(rows, sheet)
    }
}

/// Streams every registered sheet of one workbook through its own handler,
/// sequentially, in registration order.
pub struct MultiSheetDispatcher<'c> {
    config: &'c ProcessingConfig,
    sinks: Vec<(String, Box<dyn SheetSink + 'c>)>,
}

impl<'c> MultiSheetDispatcher<'c> {
    pub fn new(config: &'c ProcessingConfig) -> Self {
        Self {
            config,
            sinks: Vec::new(),
        }
    }

    /// Register a typed handler for one sheet name.
    pub fn register_typed<T, CB, EB>(
        mut self,
        sheet: &str,
        chain: Option<ValidationChain>,
        on_batch: CB,
        on_failure: EB,
    ) -> Self
    where
        T: SheetRecord,
        CB: FnMut(&Batch<T>) -> anyhow::Result<()> + 'c,
        EB: FnMut(&RowFailure) + 'c,
    {
        self.sinks.push((
            sheet.to_string(),
            Box::new(TypedSink::<T, CB, EB> {
                chain,
                on_batch,
                on_failure,
                _marker: PhantomData,
            }),
        ));
        self
    }

    /// Register a dynamic handler driven by a runtime descriptor.
    pub fn register_dynamic<CB, EB>(
        mut self,
        sheet: &str,
        descriptor: Arc<RecordDescriptor>,
        chain: Option<ValidationChain>,
        on_batch: CB,
        on_failure: EB,
    ) -> Self
    where
        CB: FnMut(&Batch<DynamicRecord>) -> anyhow::Result<()> + 'c,
        EB: FnMut(&RowFailure) + 'c,
    {
        self.sinks.push((
            sheet.to_string(),
            Box::new(DynamicSink {
                descriptor,
                chain,
                on_batch,
                on_failure,
            }),
        ));
        self
    }

    pub fn registered_sheets(&self) -> Vec<&str> {
        self.sinks.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Open the workbook once and drain each registered sheet. Results come
    /// back in registration order.
    pub fn process<R: Read + Seek>(self, source: R) -> Result<Vec<ProcessingResult>> {
        let mut container = WorkbookContainer::open(source)?;
        let available = container.sheet_names();
        info!(
            registered = self.sinks.len(),
            available = available.len(),
            "dispatching workbook sheets"
        );

        let config = self.config;
        let mut results = Vec::with_capacity(self.sinks.len());
        for (name, sink) in self.sinks {
            if !container.has_sheet(&name) {
                debug!(sheet = %name, "registered sheet not present in workbook");
                results.push(ProcessingResult::missing(&name));
                continue;
            }
            let mut rows = container.rows(&name)?;
            results.push(sink.run_once(config, &mut rows, &name)?);
        }
        Ok(results)
    }
}
