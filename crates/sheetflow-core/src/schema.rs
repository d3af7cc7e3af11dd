//! Record schemas and field mapping
//!
//! Target record types declare their column bindings through an explicit
//! registration table ([`SheetRecord::schema`]) built once per type. The
//! compiled [`RecordDescriptor`] (normalized header lookup, positional
//! lookup) is cached process-wide keyed by type identity, so per-row mapping
//! is plain hash lookups with no repeated scanning.

use chrono::{NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Declared type of a bound field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Decimal,
    Boolean,
    Date,
    #[serde(rename = "datetime")]
    DateTime,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Decimal => "decimal",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::DateTime => "datetime",
        }
    }
}

/// A typed field value after conversion.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Decimal(f64),
    Boolean(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    /// Blank cell; absence, not an error
    Empty,
}

impl FieldValue {
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Empty => true,
            FieldValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// String form used by pattern/enum validation and delimited output.
    pub fn display_string(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Integer(i) => i.to_string(),
            FieldValue::Decimal(d) => d.to_string(),
            FieldValue::Boolean(b) => b.to_string(),
            FieldValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            FieldValue::DateTime(dt) => dt.format("%Y-%m-%dT%H:%M:%S").to_string(),
            FieldValue::Empty => String::new(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(i) => Some(*i as f64),
            FieldValue::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    /// Rehydrate a value from its JSON payload form, guided by the declared
    /// type (JSON has fewer scalar kinds than we do).
    pub fn from_json(value: &serde_json::Value, field_type: FieldType) -> FieldValue {
        use serde_json::Value;
        match value {
            Value::Null => FieldValue::Empty,
            Value::Bool(b) => FieldValue::Boolean(*b),
            Value::Number(n) => match field_type {
                FieldType::Integer => n
                    .as_i64()
                    .map(FieldValue::Integer)
                    .unwrap_or(FieldValue::Empty),
                _ => n
                    .as_f64()
                    .map(FieldValue::Decimal)
                    .unwrap_or(FieldValue::Empty),
            },
            Value::String(s) => match field_type {
                FieldType::Date => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .map(FieldValue::Date)
                    .unwrap_or_else(|_| FieldValue::Text(s.clone())),
                FieldType::DateTime => NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
                    .map(FieldValue::DateTime)
                    .unwrap_or_else(|_| FieldValue::Text(s.clone())),
                _ => FieldValue::Text(s.clone()),
            },
            _ => FieldValue::Empty,
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Text(s) => serializer.serialize_str(s),
            FieldValue::Integer(i) => serializer.serialize_i64(*i),
            FieldValue::Decimal(d) => serializer.serialize_f64(*d),
            FieldValue::Boolean(b) => serializer.serialize_bool(*b),
            FieldValue::Date(d) => serializer.serialize_str(&d.format("%Y-%m-%d").to_string()),
            FieldValue::DateTime(dt) => {
                serializer.serialize_str(&dt.format("%Y-%m-%dT%H:%M:%S").to_string())
            },
            FieldValue::Empty => serializer.serialize_unit(),
        }
    }
}

/// Where a field's values come from: a named header column or a fixed
/// 0-based position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRef {
    Name(String),
    Position(u32),
}

/// Binding of one target field to one source column.
#[derive(Debug, Clone)]
pub struct ColumnBinding {
    pub field: String,
    pub column: ColumnRef,
    pub field_type: FieldType,
    pub required: bool,
    pub max_length: Option<usize>,
    /// Format hint, currently meaningful for date/datetime fields
    pub format: Option<String>,
}

impl ColumnBinding {
    pub fn new(
        field: impl Into<String>,
        column: impl Into<String>,
        field_type: FieldType,
    ) -> Self {
        Self {
            field: field.into(),
            column: ColumnRef::Name(column.into()),
            field_type,
            required: false,
            max_length: None,
            format: None,
        }
    }

    pub fn at_position(
        field: impl Into<String>,
        position: u32,
        field_type: FieldType,
    ) -> Self {
        Self {
            field: field.into(),
            column: ColumnRef::Position(position),
            field_type,
            required: false,
            max_length: None,
            format: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_max_length(mut self, len: usize) -> Self {
        self.max_length = Some(len);
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }
}

/// Declarative registration table for a record type.
#[derive(Debug, Clone, Default)]
pub struct RecordSchema {
    pub bindings: Vec<ColumnBinding>,
}

impl RecordSchema {
    pub fn new(bindings: Vec<ColumnBinding>) -> Self {
        Self { bindings }
    }
}

/// Read access to a record's fields by name, used by validation and writers.
pub trait FieldLookup {
    fn field_value(&self, field: &str) -> Option<FieldValue>;
}

/// A typed target record with a declarative column schema and compiled-in
/// accessors. `set_field` with an unknown field name is a no-op (unbound
/// fields are simply ignored).
pub trait SheetRecord: FieldLookup + Default + Send + 'static {
    fn schema() -> RecordSchema;
    fn set_field(&mut self, field: &str, value: FieldValue);
}

/// Compiled, immutable lookup tables for one record type.
#[derive(Debug)]
pub struct RecordDescriptor {
    bindings: Vec<ColumnBinding>,
    by_header: HashMap<String, usize>,
    by_position: HashMap<u32, usize>,
}

fn normalize_header(header: &str) -> String {
    header.trim().to_lowercase()
}

impl RecordDescriptor {
    /// Compile a schema into lookup tables. Duplicate or blank column
    /// bindings are skipped, not errors.
    pub fn compile(schema: RecordSchema) -> Self {
        let mut bindings = Vec::with_capacity(schema.bindings.len());
        let mut by_header = HashMap::new();
        let mut by_position = HashMap::new();

        for binding in schema.bindings {
            match &binding.column {
                ColumnRef::Name(name) => {
                    let key = normalize_header(name);
                    if key.is_empty() {
                        debug!(field = %binding.field, "skipping binding with blank column name");
                        continue;
                    }
                    if by_header.contains_key(&key) {
                        debug!(field = %binding.field, column = %name, "skipping duplicate column binding");
                        continue;
                    }
                    by_header.insert(key, bindings.len());
                },
                ColumnRef::Position(pos) => {
                    if by_position.contains_key(pos) {
                        debug!(field = %binding.field, position = pos, "skipping duplicate positional binding");
                        continue;
                    }
                    by_position.insert(*pos, bindings.len());
                },
            }
            bindings.push(binding);
        }

        Self {
            bindings,
            by_header,
            by_position,
        }
    }

    pub fn binding_for_header(&self, header: &str) -> Option<&ColumnBinding> {
        self.by_header
            .get(&normalize_header(header))
            .map(|&i| &self.bindings[i])
    }

    /// Index into [`bindings`](Self::bindings) for a header cell.
    pub fn index_for_header(&self, header: &str) -> Option<usize> {
        self.by_header.get(&normalize_header(header)).copied()
    }

    pub fn binding_for_position(&self, position: u32) -> Option<&ColumnBinding> {
        self.by_position.get(&position).map(|&i| &self.bindings[i])
    }

    pub fn bindings(&self) -> &[ColumnBinding] {
        &self.bindings
    }

    pub fn required_fields(&self) -> Vec<String> {
        self.bindings
            .iter()
            .filter(|b| b.required)
            .map(|b| b.field.clone())
            .collect()
    }
}

static DESCRIPTOR_CACHE: Lazy<RwLock<HashMap<TypeId, Arc<RecordDescriptor>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Descriptor for a record type, compiled on first use and cached.
///
/// Safe for concurrent first-use: two threads may both compile, but only one
/// descriptor instance is ever published.
pub fn descriptor_for<T: SheetRecord>() -> Arc<RecordDescriptor> {
    let key = TypeId::of::<T>();
    if let Some(descriptor) = DESCRIPTOR_CACHE
        .read()
        .expect("descriptor cache poisoned")
        .get(&key)
    {
        return Arc::clone(descriptor);
    }

    // Compile outside the write lock; a concurrent build is wasted work,
    // not a correctness problem.
    let compiled = Arc::new(RecordDescriptor::compile(T::schema()));
    let mut cache = DESCRIPTOR_CACHE.write().expect("descriptor cache poisoned");
    Arc::clone(cache.entry(key).or_insert(compiled))
}

/// Drop all cached descriptors. Test hook; descriptors are otherwise
/// process-lifetime.
pub fn reset_descriptor_cache() {
    DESCRIPTOR_CACHE
        .write()
        .expect("descriptor cache poisoned")
        .clear();
}

/// A record whose fields are defined by runtime configuration rather than a
/// compiled type. Payload form is a flat JSON object, which is what the
/// staging stores persist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DynamicRecord {
    values: BTreeMap<String, FieldValue>,
}

impl DynamicRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, field: impl Into<String>, value: FieldValue) {
        self.values.insert(field.into(), value);
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Rebuild a record from its JSON payload form, re-typing each field per
    /// the descriptor's declared types.
    pub fn from_json(descriptor: &RecordDescriptor, payload: &serde_json::Value) -> Self {
        let mut record = Self::new();
        let Some(object) = payload.as_object() else {
            return record;
        };
        for binding in descriptor.bindings() {
            if let Some(value) = object.get(&binding.field) {
                record.set(
                    binding.field.clone(),
                    FieldValue::from_json(value, binding.field_type),
                );
            }
        }
        record
    }
}

impl Serialize for DynamicRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (field, value) in &self.values {
            map.serialize_entry(field, value)?;
        }
        map.end()
    }
}

impl FieldLookup for DynamicRecord {
    fn field_value(&self, field: &str) -> Option<FieldValue> {
        self.values.get(field).cloned()
    }
}
