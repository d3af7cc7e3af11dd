//! Streaming workbook reading
//!
//! The container module resolves sheet parts inside the zip; the rows module
//! pull-parses one sheet part incrementally; the processor turns raw rows
//! into typed record batches; the dispatcher routes several sheets through
//! one container pass.

pub mod container;
pub mod dispatcher;
pub mod processor;
pub mod rows;

pub use container::{SheetMeta, WorkbookContainer};
pub use rows::{RawCell, RawRow, RowReader};

use std::marker::PhantomData;
use std::sync::Arc;

use crate::schema::{
    descriptor_for, DynamicRecord, FieldLookup, FieldValue, RecordDescriptor, SheetRecord,
};

/// Seam between the row engine and the concrete record representation:
/// typed structs and runtime-configured dynamic records drive the same
/// parse through this trait.
pub(crate) trait RecordFactory {
    type Record: FieldLookup + Send + 'static;

    fn descriptor(&self) -> &RecordDescriptor;
    fn create(&self) -> Self::Record;
    fn assign(&self, record: &mut Self::Record, field: &str, value: FieldValue);
}

pub(crate) struct TypedFactory<T> {
    descriptor: Arc<RecordDescriptor>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: SheetRecord> TypedFactory<T> {
    pub(crate) fn new() -> Self {
        Self {
            descriptor: descriptor_for::<T>(),
            _marker: PhantomData,
        }
    }
}

impl<T: SheetRecord> RecordFactory for TypedFactory<T> {
    type Record = T;

    fn descriptor(&self) -> &RecordDescriptor {
        &self.descriptor
    }

    fn create(&self) -> T {
        T::default()
    }

    fn assign(&self, record: &mut T, field: &str, value: FieldValue) {
        record.set_field(field, value);
    }
}

pub(crate) struct DynamicFactory {
    descriptor: Arc<RecordDescriptor>,
}

impl DynamicFactory {
    pub(crate) fn new(descriptor: Arc<RecordDescriptor>) -> Self {
        Self { descriptor }
    }
}

impl RecordFactory for DynamicFactory {
    type Record = DynamicRecord;

    fn descriptor(&self) -> &RecordDescriptor {
        &self.descriptor
    }

    fn create(&self) -> DynamicRecord {
        DynamicRecord::new()
    }

    fn assign(&self, record: &mut DynamicRecord, field: &str, value: FieldValue) {
        record.set(field, value);
    }
}
