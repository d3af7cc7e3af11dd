//! End-to-end streaming tests over real workbook bytes.

use std::io::Cursor;
use std::sync::Arc;

use chrono::NaiveDate;
use rust_xlsxwriter::Workbook;

use sheetflow_core::{
    ColumnBinding, FieldLookup, FieldType, FieldValue, MultiSheetDispatcher, ProcessingConfig,
    ProcessingOutcome, RecordDescriptor, RecordSchema, RequiredFields, SheetRecord, SinkClosed,
    StreamingRowProcessor, ValidationChain,
};

#[derive(Debug, Default, Clone)]
struct Order {
    code: Option<String>,
    qty: Option<i64>,
    price: Option<f64>,
    shipped: Option<NaiveDate>,
}

impl FieldLookup for Order {
    fn field_value(&self, field: &str) -> Option<FieldValue> {
        match field {
            "code" => self.code.clone().map(FieldValue::Text),
            "qty" => self.qty.map(FieldValue::Integer),
            "price" => self.price.map(FieldValue::Decimal),
            "shipped" => self.shipped.map(FieldValue::Date),
            _ => None,
        }
    }
}

impl SheetRecord for Order {
    fn schema() -> RecordSchema {
        RecordSchema::new(vec![
            ColumnBinding::new("code", "Code", FieldType::String).required(),
            ColumnBinding::new("qty", "Qty", FieldType::Integer),
            ColumnBinding::new("price", "Price", FieldType::Decimal),
            ColumnBinding::new("shipped", "Shipped", FieldType::Date),
        ])
    }

    fn set_field(&mut self, field: &str, value: FieldValue) {
        match (field, value) {
            ("code", FieldValue::Text(v)) => self.code = Some(v),
            ("qty", FieldValue::Integer(v)) => self.qty = Some(v),
            ("price", FieldValue::Decimal(v)) => self.price = Some(v),
            ("shipped", FieldValue::Date(v)) => self.shipped = Some(v),
            _ => {},
        }
    }
}

/// Build an order sheet with `rows` data rows below a header row. Every
/// third row gets a price, row numbers are encoded into the code column.
fn order_workbook(rows: u32) -> Vec<u8> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("Orders").unwrap();
    sheet.write_string(0, 0, "Code").unwrap();
    sheet.write_string(0, 1, "Qty").unwrap();
    sheet.write_string(0, 2, "Price").unwrap();
    sheet.write_string(0, 3, "Shipped").unwrap();
    for i in 0..rows {
        let r = i + 1;
        sheet.write_string(r, 0, format!("ORD-{i}")).unwrap();
        sheet.write_number(r, 1, f64::from(i % 7)).unwrap();
        if i % 3 == 0 {
            sheet.write_number(r, 2, 9.99).unwrap();
        }
        // serial 45092 is 2023-06-15
        sheet.write_number(r, 3, 45092.0).unwrap();
    }
    workbook.save_to_buffer().unwrap()
}

#[test]
fn batches_arrive_at_batch_size_with_a_short_tail() {
    let bytes = order_workbook(250);
    let config = ProcessingConfig::builder().batch_size(100).build();
    let processor = StreamingRowProcessor::new(&config);

    let mut sizes = Vec::new();
    let result = processor
        .process_typed::<Order, _, _>(Cursor::new(bytes), Some("Orders"), None, |batch| {
            sizes.push(batch.len());
            Ok(())
        })
        .unwrap();

    assert_eq!(sizes, vec![100, 100, 50]);
    assert_eq!(result.processed, 250);
    assert_eq!(result.errors, 0);
    assert_eq!(result.outcome, ProcessingOutcome::Completed);
}

#[test]
fn totals_do_not_depend_on_batch_size() {
    let bytes = order_workbook(83);
    let mut totals = Vec::new();
    for batch_size in [1, 7, 83, 500] {
        let config = ProcessingConfig::builder().batch_size(batch_size).build();
        let processor = StreamingRowProcessor::new(&config);
        let mut seen = 0u64;
        let result = processor
            .process_typed::<Order, _, _>(
                Cursor::new(bytes.clone()),
                None,
                None,
                |batch| {
                    seen += batch.len() as u64;
                    Ok(())
                },
            )
            .unwrap();
        totals.push((result.processed, result.errors, seen));
    }
    assert!(totals.iter().all(|t| *t == (83, 0, 83)));
}

#[test]
fn typed_fields_are_populated_from_cells() {
    let bytes = order_workbook(5);
    let config = ProcessingConfig::default();
    let processor = StreamingRowProcessor::new(&config);

    let mut orders: Vec<Order> = Vec::new();
    processor
        .process_typed::<Order, _, _>(Cursor::new(bytes), None, None, |batch| {
            orders.extend(batch.records().iter().cloned());
            Ok(())
        })
        .unwrap();

    assert_eq!(orders.len(), 5);
    assert_eq!(orders[0].code.as_deref(), Some("ORD-0"));
    assert_eq!(orders[0].qty, Some(0));
    assert_eq!(orders[0].price, Some(9.99));
    assert_eq!(orders[1].price, None);
    assert_eq!(
        orders[0].shipped,
        Some(NaiveDate::from_ymd_opt(2023, 6, 15).unwrap())
    );
}

#[test]
fn conversion_failures_are_counted_not_thrown() {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.write_string(0, 0, "Code").unwrap();
    sheet.write_string(0, 1, "Qty").unwrap();
    sheet.write_string(1, 0, "GOOD").unwrap();
    sheet.write_number(1, 1, 4.0).unwrap();
    sheet.write_string(2, 0, "BAD").unwrap();
    sheet.write_string(2, 1, "not a number").unwrap();
    let bytes = workbook.save_to_buffer().unwrap();

    let config = ProcessingConfig::default();
    let processor = StreamingRowProcessor::new(&config);
    let mut failures = Vec::new();
    let mut good = 0usize;
    let result = processor
        .process_typed_with::<Order, _, _, _>(
            Cursor::new(bytes),
            None,
            None,
            |batch| {
                good += batch.len();
                Ok(())
            },
            |failure| failures.push(failure.clone()),
        )
        .unwrap();

    assert_eq!(result.processed, 2);
    assert_eq!(result.errors, 1);
    assert_eq!(good, 1);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].rule, "conversion");
    assert_eq!(failures[0].row, 3);
    assert!(failures[0].raw.get("B").is_some());
}

#[test]
fn validation_chain_rejects_rows_missing_required_fields() {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.write_string(0, 0, "Code").unwrap();
    sheet.write_string(0, 1, "Qty").unwrap();
    sheet.write_string(1, 0, "A").unwrap();
    sheet.write_number(1, 1, 1.0).unwrap();
    // code missing on the second data row
    sheet.write_number(2, 1, 2.0).unwrap();
    let bytes = workbook.save_to_buffer().unwrap();

    let chain = ValidationChain::new().with_rule(RequiredFields::new(["code"]));
    let config = ProcessingConfig::default();
    let processor = StreamingRowProcessor::new(&config);

    let mut failures = Vec::new();
    let result = processor
        .process_typed_with::<Order, _, _, _>(
            Cursor::new(bytes),
            None,
            Some(&chain),
            |_batch| Ok(()),
            |failure| failures.push(failure.clone()),
        )
        .unwrap();

    assert_eq!(result.processed, 2);
    assert_eq!(result.errors, 1);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].rule, "required_fields");
}

#[test]
fn error_threshold_aborts_the_sheet() {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.write_string(0, 0, "Code").unwrap();
    sheet.write_string(0, 1, "Qty").unwrap();
    for i in 0..30u32 {
        let r = i + 1;
        sheet.write_string(r, 0, format!("ORD-{i}")).unwrap();
        sheet.write_string(r, 1, "bogus").unwrap();
    }
    let bytes = workbook.save_to_buffer().unwrap();

    let config = ProcessingConfig::builder().max_errors_before_abort(10).build();
    let processor = StreamingRowProcessor::new(&config);
    let result = processor
        .process_typed::<Order, _, _>(Cursor::new(bytes), None, None, |_batch| Ok(()))
        .unwrap();

    assert_eq!(result.outcome, ProcessingOutcome::AbortedOnErrorThreshold);
    assert_eq!(result.errors, 11);
    assert_eq!(result.processed, 11);
    // Header is row 1, so the eleventh error lands on row 12
    assert_eq!(result.abort_row, Some(12));
}

#[test]
fn failing_batch_callback_counts_the_whole_batch_as_errors() {
    let bytes = order_workbook(25);
    let config = ProcessingConfig::builder().batch_size(10).build();
    let processor = StreamingRowProcessor::new(&config);

    let mut deliveries = 0;
    let result = processor
        .process_typed::<Order, _, _>(Cursor::new(bytes), None, None, |_batch| {
            deliveries += 1;
            if deliveries == 2 {
                anyhow::bail!("downstream unavailable");
            }
            Ok(())
        })
        .unwrap();

    assert_eq!(deliveries, 3);
    assert_eq!(result.processed, 25);
    assert_eq!(result.errors, 10);
    assert_eq!(result.outcome, ProcessingOutcome::Completed);
}

#[test]
fn closed_sink_stops_the_stream_after_one_delivery() {
    let bytes = order_workbook(10_000);
    let config = ProcessingConfig::builder().batch_size(10).build();
    let processor = StreamingRowProcessor::new(&config);

    let mut deliveries = 0u32;
    let result = processor
        .process_typed::<Order, _, _>(Cursor::new(bytes), None, None, |_batch| {
            deliveries += 1;
            Err(anyhow::Error::new(SinkClosed))
        })
        .unwrap();

    // The parse must not grind through the remaining rows once the
    // consumer is gone
    assert_eq!(deliveries, 1);
    assert_eq!(result.processed, 10);
    assert_eq!(result.errors, 10);
    assert_eq!(result.outcome, ProcessingOutcome::SinkClosed);
}

#[test]
fn progress_is_reported_when_the_interval_row_fails() {
    use std::sync::Mutex;

    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.write_string(0, 0, "Code").unwrap();
    sheet.write_string(0, 1, "Qty").unwrap();
    sheet.write_string(1, 0, "A").unwrap();
    sheet.write_number(1, 1, 1.0).unwrap();
    // The second data row sits exactly on the interval boundary and fails
    // conversion
    sheet.write_string(2, 0, "B").unwrap();
    sheet.write_string(2, 1, "bogus").unwrap();
    sheet.write_string(3, 0, "C").unwrap();
    sheet.write_number(3, 1, 3.0).unwrap();
    let bytes = workbook.save_to_buffer().unwrap();

    let config = ProcessingConfig::builder().progress_report_interval(2).build();

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let capture = Capture::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_writer({
            let capture = capture.clone();
            move || capture.clone()
        })
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        let processor = StreamingRowProcessor::new(&config);
        processor
            .process_typed::<Order, _, _>(Cursor::new(bytes), None, None, |_batch| Ok(()))
            .unwrap();
    });

    let logs = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
    assert!(
        logs.contains("streaming progress"),
        "interval landing on an error row must still log progress: {logs}"
    );
}

#[test]
fn dispatcher_routes_sheets_and_reports_missing_ones() {
    let mut workbook = Workbook::new();
    let orders = workbook.add_worksheet();
    orders.set_name("Orders").unwrap();
    orders.write_string(0, 0, "Code").unwrap();
    orders.write_string(1, 0, "A").unwrap();
    orders.write_string(2, 0, "B").unwrap();
    let unregistered = workbook.add_worksheet();
    unregistered.set_name("Scratch").unwrap();
    unregistered.write_string(0, 0, "ignored").unwrap();
    let bytes = workbook.save_to_buffer().unwrap();

    let config = ProcessingConfig::default();
    let mut order_rows = 0u64;
    let results = MultiSheetDispatcher::new(&config)
        .register_typed::<Order, _, _>(
            "Orders",
            None,
            |batch| {
                order_rows += batch.len() as u64;
                Ok(())
            },
            |_failure| {},
        )
        .register_typed::<Order, _, _>("Absent", None, |_batch| Ok(()), |_failure| {})
        .process(Cursor::new(bytes))
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].sheet, "Orders");
    assert_eq!(results[0].processed, 2);
    assert_eq!(results[0].outcome, ProcessingOutcome::Completed);
    assert_eq!(results[1].sheet, "Absent");
    assert_eq!(results[1].outcome, ProcessingOutcome::SheetMissing);
    assert_eq!(order_rows, 2);
}

#[test]
fn dynamic_records_follow_a_runtime_descriptor() {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.write_string(0, 0, "Part Code").unwrap();
    sheet.write_string(0, 1, "In Stock").unwrap();
    sheet.write_string(1, 0, "W-100").unwrap();
    sheet.write_string(1, 1, "yes").unwrap();
    let bytes = workbook.save_to_buffer().unwrap();

    let descriptor = Arc::new(RecordDescriptor::compile(RecordSchema::new(vec![
        ColumnBinding::new("part_code", "Part Code", FieldType::String),
        ColumnBinding::new("in_stock", "In Stock", FieldType::Boolean),
    ])));

    let config = ProcessingConfig::default();
    let processor = StreamingRowProcessor::new(&config);
    let mut records = Vec::new();
    processor
        .process_dynamic_with(
            Cursor::new(bytes),
            None,
            descriptor,
            None,
            |batch| {
                records.extend(batch.records().iter().cloned());
                Ok(())
            },
            |_failure| {},
        )
        .unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].get("part_code"),
        Some(&FieldValue::Text("W-100".to_string()))
    );
    assert_eq!(records[0].get("in_stock"), Some(&FieldValue::Boolean(true)));
}
