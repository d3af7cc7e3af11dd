//! Cell value conversion
//!
//! Converts a raw cell token into the declared field type. Conversion never
//! panics and never aborts the parse: malformed input comes back as a
//! [`ConversionError`] carrying row/column context so the caller decides
//! whether to skip the row or trip the abort threshold.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use thiserror::Error;

use crate::schema::{FieldType, FieldValue};

/// Raw cell token as produced by the row reader, before typing.
#[derive(Debug, Clone, PartialEq)]
pub enum CellScalar {
    /// Shared, inline, or formula-string content
    Text(String),
    /// Numeric content, including date serials
    Number(f64),
    Bool(bool),
    Blank,
}

impl CellScalar {
    pub fn raw_string(&self) -> String {
        match self {
            CellScalar::Text(s) => s.clone(),
            CellScalar::Number(n) => n.to_string(),
            CellScalar::Bool(b) => b.to_string(),
            CellScalar::Blank => String::new(),
        }
    }
}

/// One cell failed to convert. Non-fatal; recorded and counted.
#[derive(Debug, Clone, Error)]
#[error("row {row}, column {column}: cannot read {raw:?} as {target}: {reason}")]
pub struct ConversionError {
    pub row: u32,
    pub column: String,
    pub raw: String,
    pub target: &'static str,
    pub reason: String,
}

/// Excel's day zero (the 1900 date system, with its phantom leap day
/// already absorbed by anchoring at 1899-12-30).
fn excel_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1899, 12, 30).expect("static date")
}

fn serial_to_date(serial: f64) -> Option<NaiveDate> {
    let days = serial.floor() as i64;
    if !(0..=2_958_465).contains(&days) {
        // beyond year 9999
        return None;
    }
    excel_epoch().checked_add_signed(Duration::days(days))
}

fn serial_to_datetime(serial: f64) -> Option<NaiveDateTime> {
    let date = serial_to_date(serial)?;
    let seconds = ((serial - serial.floor()) * 86_400.0).round() as i64;
    date.and_hms_opt(0, 0, 0)?
        .checked_add_signed(Duration::seconds(seconds))
}

/// Accepted date patterns when no (or an unmatched) format hint is given.
/// Two-plus patterns keep ingestion resilient to locale differences.
const DATE_PATTERNS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%Y/%m/%d"];
const DATETIME_PATTERNS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

fn parse_date(text: &str, format: Option<&str>) -> Option<NaiveDate> {
    if let Some(fmt) = format {
        if let Ok(date) = NaiveDate::parse_from_str(text, fmt) {
            return Some(date);
        }
    }
    DATE_PATTERNS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
}

fn parse_datetime(text: &str, format: Option<&str>) -> Option<NaiveDateTime> {
    if let Some(fmt) = format {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(dt);
        }
    }
    DATETIME_PATTERNS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| parse_date(text, format).and_then(|d| d.and_hms_opt(0, 0, 0)))
}

fn error(
    scalar: &CellScalar,
    target: FieldType,
    row: u32,
    column: &str,
    reason: impl Into<String>,
) -> ConversionError {
    ConversionError {
        row,
        column: column.to_string(),
        raw: scalar.raw_string(),
        target: target.as_str(),
        reason: reason.into(),
    }
}

/// Convert a raw cell token into the declared field type.
///
/// Blank tokens become [`FieldValue::Empty`] for every target type; whether
/// absence is acceptable is the validation chain's business, not ours.
pub fn convert_cell(
    scalar: &CellScalar,
    target: FieldType,
    format: Option<&str>,
    row: u32,
    column: &str,
) -> Result<FieldValue, ConversionError> {
    if matches!(scalar, CellScalar::Blank) {
        return Ok(FieldValue::Empty);
    }
    if let CellScalar::Text(s) = scalar {
        if s.trim().is_empty() {
            return Ok(FieldValue::Empty);
        }
    }

    match target {
        FieldType::String => Ok(match scalar {
            CellScalar::Text(s) => FieldValue::Text(s.clone()),
            CellScalar::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                FieldValue::Text(format!("{}", *n as i64))
            },
            CellScalar::Number(n) => FieldValue::Text(n.to_string()),
            CellScalar::Bool(b) => FieldValue::Text(b.to_string()),
            CellScalar::Blank => FieldValue::Empty,
        }),

        FieldType::Integer => match scalar {
            CellScalar::Number(n) if n.fract() == 0.0 => Ok(FieldValue::Integer(*n as i64)),
            CellScalar::Number(_) => Err(error(scalar, target, row, column, "fractional value")),
            CellScalar::Text(s) => s
                .trim()
                .parse::<i64>()
                .map(FieldValue::Integer)
                .map_err(|e| error(scalar, target, row, column, e.to_string())),
            CellScalar::Bool(b) => Ok(FieldValue::Integer(i64::from(*b))),
            CellScalar::Blank => Ok(FieldValue::Empty),
        },

        FieldType::Decimal => match scalar {
            CellScalar::Number(n) => Ok(FieldValue::Decimal(*n)),
            CellScalar::Text(s) => s
                .trim()
                .parse::<f64>()
                .map(FieldValue::Decimal)
                .map_err(|e| error(scalar, target, row, column, e.to_string())),
            CellScalar::Bool(_) => Err(error(scalar, target, row, column, "boolean cell")),
            CellScalar::Blank => Ok(FieldValue::Empty),
        },

        FieldType::Boolean => match scalar {
            CellScalar::Bool(b) => Ok(FieldValue::Boolean(*b)),
            CellScalar::Number(n) => Ok(FieldValue::Boolean(*n != 0.0)),
            CellScalar::Text(s) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "y" | "1" => Ok(FieldValue::Boolean(true)),
                "false" | "no" | "n" | "0" => Ok(FieldValue::Boolean(false)),
                _ => Err(error(scalar, target, row, column, "not a boolean token")),
            },
            CellScalar::Blank => Ok(FieldValue::Empty),
        },

        FieldType::Date => match scalar {
            CellScalar::Number(n) => serial_to_date(*n)
                .map(FieldValue::Date)
                .ok_or_else(|| error(scalar, target, row, column, "serial out of range")),
            CellScalar::Text(s) => parse_date(s.trim(), format)
                .map(FieldValue::Date)
                .ok_or_else(|| error(scalar, target, row, column, "unrecognized date format")),
            _ => Err(error(scalar, target, row, column, "not a date cell")),
        },

        FieldType::DateTime => match scalar {
            CellScalar::Number(n) => serial_to_datetime(*n)
                .map(FieldValue::DateTime)
                .ok_or_else(|| error(scalar, target, row, column, "serial out of range")),
            CellScalar::Text(s) => parse_datetime(s.trim(), format)
                .map(FieldValue::DateTime)
                .ok_or_else(|| {
                    error(scalar, target, row, column, "unrecognized datetime format")
                }),
            _ => Err(error(scalar, target, row, column, "not a datetime cell")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_converts_to_empty_for_all_types() {
        for target in [
            FieldType::String,
            FieldType::Integer,
            FieldType::Decimal,
            FieldType::Boolean,
            FieldType::Date,
            FieldType::DateTime,
        ] {
            let value = convert_cell(&CellScalar::Blank, target, None, 1, "A").unwrap();
            assert_eq!(value, FieldValue::Empty, "target {:?}", target);
        }
        let value =
            convert_cell(&CellScalar::Text("   ".into()), FieldType::Integer, None, 1, "A")
                .unwrap();
        assert_eq!(value, FieldValue::Empty);
    }

    #[test]
    fn test_integer_conversion() {
        let value =
            convert_cell(&CellScalar::Number(42.0), FieldType::Integer, None, 1, "B").unwrap();
        assert_eq!(value, FieldValue::Integer(42));

        let value =
            convert_cell(&CellScalar::Text(" 17 ".into()), FieldType::Integer, None, 1, "B")
                .unwrap();
        assert_eq!(value, FieldValue::Integer(17));

        let err = convert_cell(&CellScalar::Number(1.5), FieldType::Integer, None, 3, "B")
            .unwrap_err();
        assert_eq!(err.row, 3);
        assert_eq!(err.column, "B");
        assert_eq!(err.target, "integer");
    }

    #[test]
    fn test_numeric_string_keeps_integer_form() {
        let value =
            convert_cell(&CellScalar::Number(12345.0), FieldType::String, None, 1, "C").unwrap();
        assert_eq!(value, FieldValue::Text("12345".into()));
    }

    #[test]
    fn test_boolean_tokens() {
        for (token, expected) in [("yes", true), ("FALSE", false), ("1", true), ("n", false)] {
            let value = convert_cell(
                &CellScalar::Text(token.into()),
                FieldType::Boolean,
                None,
                1,
                "D",
            )
            .unwrap();
            assert_eq!(value, FieldValue::Boolean(expected), "token {token}");
        }
        assert!(convert_cell(
            &CellScalar::Text("maybe".into()),
            FieldType::Boolean,
            None,
            1,
            "D"
        )
        .is_err());
    }

    #[test]
    fn test_excel_serial_date() {
        // 2023-06-15 is serial 45092 in the 1900 date system
        let value =
            convert_cell(&CellScalar::Number(45092.0), FieldType::Date, None, 1, "E").unwrap();
        assert_eq!(
            value,
            FieldValue::Date(NaiveDate::from_ymd_opt(2023, 6, 15).unwrap())
        );
    }

    #[test]
    fn test_serial_datetime_carries_time_fraction() {
        // noon on 2023-06-15
        let value =
            convert_cell(&CellScalar::Number(45092.5), FieldType::DateTime, None, 1, "E")
                .unwrap();
        assert_eq!(
            value,
            FieldValue::DateTime(
                NaiveDate::from_ymd_opt(2023, 6, 15)
                    .unwrap()
                    .and_hms_opt(12, 0, 0)
                    .unwrap()
            )
        );
    }

    #[test]
    fn test_date_format_hint_and_fallbacks() {
        let hinted = convert_cell(
            &CellScalar::Text("15.06.2023".into()),
            FieldType::Date,
            Some("%d.%m.%Y"),
            1,
            "F",
        )
        .unwrap();
        assert_eq!(
            hinted,
            FieldValue::Date(NaiveDate::from_ymd_opt(2023, 6, 15).unwrap())
        );

        // Hint misses, locale fallbacks still accept it
        let fallback = convert_cell(
            &CellScalar::Text("2023-06-15".into()),
            FieldType::Date,
            Some("%d.%m.%Y"),
            1,
            "F",
        )
        .unwrap();
        assert_eq!(
            fallback,
            FieldValue::Date(NaiveDate::from_ymd_opt(2023, 6, 15).unwrap())
        );

        let err = convert_cell(
            &CellScalar::Text("not a date".into()),
            FieldType::Date,
            None,
            9,
            "F",
        )
        .unwrap_err();
        assert!(err.to_string().contains("row 9"));
    }

    #[test]
    fn test_decimal_rejects_bool() {
        assert!(
            convert_cell(&CellScalar::Bool(true), FieldType::Decimal, None, 1, "G").is_err()
        );
    }
}
