//! Validation chain
//!
//! An ordered list of composable, data-configured rules. Rules are keyed by
//! field name, never by record type, so the same rule implementations serve
//! every sheet. Results merge by concatenation; a record can carry several
//! simultaneous errors. Fail-fast mode stops the chain at the first failing
//! rule for a record.

use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;

use crate::schema::FieldLookup;
use sheetflow_common::{Result, SheetflowError};

/// One field failed one rule. Non-fatal; recorded and counted.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationError {
    pub field: String,
    pub value: String,
    pub row: u32,
    pub rule: &'static str,
    pub message: String,
}

/// Accumulated outcome of running a chain against one record.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
    }
}

/// A single composable rule.
pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn validate(&self, record: &dyn FieldLookup, row: u32) -> ValidationResult;
}

/// Null/blank check over a set of field names.
pub struct RequiredFields {
    fields: Vec<String>,
}

impl RequiredFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl ValidationRule for RequiredFields {
    fn name(&self) -> &'static str {
        "required_fields"
    }

    fn validate(&self, record: &dyn FieldLookup, row: u32) -> ValidationResult {
        let mut result = ValidationResult::ok();
        for field in &self.fields {
            let missing = record
                .field_value(field)
                .map_or(true, |value| value.is_empty());
            if missing {
                result.errors.push(ValidationError {
                    field: field.clone(),
                    value: String::new(),
                    row,
                    rule: self.name(),
                    message: format!("required field '{field}' is missing or blank"),
                });
            }
        }
        result
    }
}

/// Regex match against a field's string form. Blank values pass (that is
/// the required-fields rule's call).
pub struct PatternRule {
    field: String,
    pattern: Regex,
}

impl PatternRule {
    pub fn new(field: impl Into<String>, pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| SheetflowError::Config(format!("invalid pattern: {e}")))?;
        Ok(Self {
            field: field.into(),
            pattern,
        })
    }
}

impl ValidationRule for PatternRule {
    fn name(&self) -> &'static str {
        "pattern"
    }

    fn validate(&self, record: &dyn FieldLookup, row: u32) -> ValidationResult {
        let mut result = ValidationResult::ok();
        if let Some(value) = record.field_value(&self.field) {
            if value.is_empty() {
                return result;
            }
            let text = value.display_string();
            if !self.pattern.is_match(&text) {
                result.errors.push(ValidationError {
                    field: self.field.clone(),
                    value: text,
                    row,
                    rule: self.name(),
                    message: format!(
                        "field '{}' does not match pattern {}",
                        self.field, self.pattern
                    ),
                });
            }
        }
        result
    }
}

/// Value must belong to a configured allowed set (string form comparison).
pub struct EnumMembership {
    field: String,
    allowed: HashSet<String>,
}

impl EnumMembership {
    pub fn new<I, S>(field: impl Into<String>, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            field: field.into(),
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }
}

impl ValidationRule for EnumMembership {
    fn name(&self) -> &'static str {
        "enum_membership"
    }

    fn validate(&self, record: &dyn FieldLookup, row: u32) -> ValidationResult {
        let mut result = ValidationResult::ok();
        if let Some(value) = record.field_value(&self.field) {
            if value.is_empty() {
                return result;
            }
            let text = value.display_string();
            if !self.allowed.contains(&text) {
                result.errors.push(ValidationError {
                    field: self.field.clone(),
                    value: text.clone(),
                    row,
                    rule: self.name(),
                    message: format!("'{}' is not an allowed value for '{}'", text, self.field),
                });
            }
        }
        result
    }
}

/// Numeric bounds check; non-numeric values fail the rule.
pub struct NumericRange {
    field: String,
    min: Option<f64>,
    max: Option<f64>,
}

impl NumericRange {
    pub fn new(field: impl Into<String>, min: Option<f64>, max: Option<f64>) -> Self {
        Self {
            field: field.into(),
            min,
            max,
        }
    }
}

impl ValidationRule for NumericRange {
    fn name(&self) -> &'static str {
        "numeric_range"
    }

    fn validate(&self, record: &dyn FieldLookup, row: u32) -> ValidationResult {
        let mut result = ValidationResult::ok();
        let Some(value) = record.field_value(&self.field) else {
            return result;
        };
        if value.is_empty() {
            return result;
        }

        let mut fail = |message: String| {
            result.errors.push(ValidationError {
                field: self.field.clone(),
                value: value.display_string(),
                row,
                rule: "numeric_range",
                message,
            });
        };

        match value.as_f64() {
            None => fail(format!("field '{}' is not numeric", self.field)),
            Some(n) => {
                if let Some(min) = self.min {
                    if n < min {
                        fail(format!("field '{}' is below minimum {}", self.field, min));
                    }
                }
                if let Some(max) = self.max {
                    if n > max {
                        fail(format!("field '{}' is above maximum {}", self.field, max));
                    }
                }
            },
        }
        result
    }
}

/// Ordered rule chain. Order matters only for report readability; results
/// merge rather than short-circuit, unless fail-fast is requested.
#[derive(Default)]
pub struct ValidationChain {
    rules: Vec<Box<dyn ValidationRule>>,
    fail_fast: bool,
}

impl ValidationChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_rule(mut self, rule: impl ValidationRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn push(&mut self, rule: Box<dyn ValidationRule>) {
        self.rules.push(rule);
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn validate(&self, record: &dyn FieldLookup, row: u32) -> ValidationResult {
        let mut result = ValidationResult::ok();
        for rule in &self.rules {
            let partial = rule.validate(record, row);
            let failed = !partial.is_valid();
            result.merge(partial);
            if failed && self.fail_fast {
                break;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DynamicRecord, FieldValue};

    fn sample_record() -> DynamicRecord {
        let mut record = DynamicRecord::new();
        record.set("code", FieldValue::Text("AB-12".into()));
        record.set("status", FieldValue::Text("ACTIVE".into()));
        record.set("amount", FieldValue::Decimal(150.0));
        record.set("note", FieldValue::Empty);
        record
    }

    fn chain() -> ValidationChain {
        ValidationChain::new()
            .with_rule(RequiredFields::new(["code", "note"]))
            .with_rule(PatternRule::new("code", r"^[A-Z]{2}-\d+$").unwrap())
            .with_rule(EnumMembership::new("status", ["ACTIVE", "RETIRED"]))
            .with_rule(NumericRange::new("amount", Some(0.0), Some(100.0)))
    }

    #[test]
    fn test_errors_accumulate_across_rules() {
        let result = chain().validate(&sample_record(), 7);
        // blank required 'note' + amount above maximum
        assert_eq!(result.errors.len(), 2);
        assert_eq!(result.errors[0].rule, "required_fields");
        assert_eq!(result.errors[1].rule, "numeric_range");
        assert!(result.errors.iter().all(|e| e.row == 7));
    }

    #[test]
    fn test_fail_fast_stops_at_first_failing_rule() {
        let result = chain().fail_fast(true).validate(&sample_record(), 7);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].rule, "required_fields");
    }

    #[test]
    fn test_valid_record_passes() {
        let mut record = sample_record();
        record.set("note", FieldValue::Text("ok".into()));
        record.set("amount", FieldValue::Decimal(99.5));
        let result = chain().validate(&record, 1);
        assert!(result.is_valid(), "errors: {:?}", result.errors);
    }

    #[test]
    fn test_pattern_skips_blank_values() {
        let mut record = DynamicRecord::new();
        record.set("code", FieldValue::Empty);
        let chain =
            ValidationChain::new().with_rule(PatternRule::new("code", r"^\d+$").unwrap());
        assert!(chain.validate(&record, 1).is_valid());
    }

    #[test]
    fn test_enum_membership_rejects_unknown_value() {
        let mut record = sample_record();
        record.set("status", FieldValue::Text("UNKNOWN".into()));
        let result = chain().validate(&record, 2);
        assert!(result.errors.iter().any(|e| e.rule == "enum_membership"));
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        assert!(PatternRule::new("code", "(unclosed").is_err());
    }
}
