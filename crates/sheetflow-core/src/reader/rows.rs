//! Incremental row pull over one sheet part
//!
//! Drives a quick-xml pull parse over `<sheetData>` and yields one
//! [`RawRow`] per completed `<row>` element. The full sheet DOM is never
//! materialized; memory use is bounded by the widest single row.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::io::BufReader;
use std::sync::Arc;
use tracing::debug;

use crate::convert::CellScalar;
use sheetflow_common::{Result, SheetflowError};

/// One cell of a raw row, with its 0-based column index and A1 letters.
#[derive(Debug, Clone)]
pub struct RawCell {
    pub column: u32,
    pub column_ref: String,
    pub scalar: CellScalar,
}

/// One completed source row (1-based row number).
#[derive(Debug, Clone)]
pub struct RawRow {
    pub row_num: u32,
    pub cells: Vec<RawCell>,
}

impl RawRow {
    pub fn is_blank(&self) -> bool {
        self.cells
            .iter()
            .all(|c| matches!(c.scalar, CellScalar::Blank))
    }

    /// JSON snapshot of the raw tokens, keyed by column letters. Used for
    /// audit records of rows that failed to convert.
    pub fn raw_snapshot(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .cells
            .iter()
            .map(|c| {
                (
                    c.column_ref.clone(),
                    serde_json::Value::String(c.scalar.raw_string()),
                )
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

/// Convert 0-based column index to A1 letters ("AB" for 27).
pub fn column_letters(mut column: u32) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push(b'A' + (column % 26) as u8);
        if column < 26 {
            break;
        }
        column = column / 26 - 1;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

/// Parse an A1 cell reference ("C5") into a 0-based column index. References
/// too wide to fit in a u32 return `None`, same as a malformed reference, and
/// the caller falls back to positional handling.
fn parse_cell_ref(cell_ref: &str) -> Option<u32> {
    let letters: String = cell_ref.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    if letters.is_empty() {
        return None;
    }
    let mut column: u32 = 0;
    for ch in letters.chars() {
        let digit = ch.to_ascii_uppercase() as u32 - 'A' as u32 + 1;
        column = column.checked_mul(26)?.checked_add(digit)?;
    }
    Some(column - 1)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CellKind {
    Number,
    Shared,
    Bool,
    InlineStr,
    Str,
}

struct PendingCell {
    column: u32,
    kind: CellKind,
    value: Option<String>,
}

fn xml_err(e: impl std::fmt::Display) -> SheetflowError {
    SheetflowError::Xml(e.to_string())
}

/// Pull-reader over one sheet part.
pub struct RowReader<'a> {
    reader: Reader<BufReader<zip::read::ZipFile<'a>>>,
    shared: Arc<Vec<String>>,
    buf: Vec<u8>,
    /// Fallback counter when rows carry no `r` attribute
    next_row_num: u32,
    finished: bool,
}

impl<'a> RowReader<'a> {
    pub(crate) fn new(part: zip::read::ZipFile<'a>, shared: Arc<Vec<String>>) -> Self {
        Self {
            reader: Reader::from_reader(BufReader::new(part)),
            shared,
            buf: Vec::with_capacity(512),
            next_row_num: 1,
            finished: false,
        }
    }

    /// Next completed row, or `None` at end of sheet data.
    pub fn next_row(&mut self) -> Result<Option<RawRow>> {
        if self.finished {
            return Ok(None);
        }

        let mut row: Option<RawRow> = None;
        let mut next_column: u32 = 0;
        let mut cell: Option<PendingCell> = None;
        let mut in_value = false;
        let mut in_inline_text = false;

        loop {
            self.buf.clear();
            let event = self.reader.read_event_into(&mut self.buf).map_err(xml_err)?;
            match event {
                Event::Start(ref e) => match e.local_name().as_ref() {
                    b"row" => {
                        let row_num = row_number(e).unwrap_or(self.next_row_num);
                        self.next_row_num = row_num + 1;
                        row = Some(RawRow {
                            row_num,
                            cells: Vec::new(),
                        });
                        next_column = 0;
                    },
                    b"c" if row.is_some() => {
                        cell = Some(start_cell(e, next_column));
                    },
                    b"v" => in_value = true,
                    b"t" if cell.as_ref().is_some_and(|c| c.kind == CellKind::InlineStr) => {
                        in_inline_text = true;
                    },
                    _ => {},
                },
                Event::Empty(ref e) => match e.local_name().as_ref() {
                    b"c" => {
                        if let Some(row) = row.as_mut() {
                            let pending = start_cell(e, next_column);
                            next_column = pending.column + 1;
                            row.cells.push(finish_cell(&self.shared, pending));
                        }
                    },
                    b"row" => {
                        let row_num = row_number(e).unwrap_or(self.next_row_num);
                        self.next_row_num = row_num + 1;
                        return Ok(Some(RawRow {
                            row_num,
                            cells: Vec::new(),
                        }));
                    },
                    _ => {},
                },
                Event::Text(ref t) => {
                    if in_value || in_inline_text {
                        if let Some(cell) = cell.as_mut() {
                            let text = t.unescape().map_err(xml_err)?;
                            cell.value.get_or_insert_with(String::new).push_str(&text);
                        }
                    }
                },
                Event::End(ref e) => match e.local_name().as_ref() {
                    b"v" => in_value = false,
                    b"t" => in_inline_text = false,
                    b"c" => {
                        if let (Some(row), Some(pending)) = (row.as_mut(), cell.take()) {
                            next_column = pending.column + 1;
                            row.cells.push(finish_cell(&self.shared, pending));
                        }
                    },
                    b"row" => {
                        if let Some(row) = row.take() {
                            return Ok(Some(row));
                        }
                    },
                    b"sheetData" => {
                        self.finished = true;
                        return Ok(None);
                    },
                    _ => {},
                },
                Event::Eof => {
                    self.finished = true;
                    return Ok(None);
                },
                _ => {},
            }
        }
    }

}

fn finish_cell(shared: &[String], pending: PendingCell) -> RawCell {
    let scalar = match (pending.kind, pending.value) {
        (_, None) => CellScalar::Blank,
        (CellKind::Shared, Some(raw)) => match raw.trim().parse::<usize>() {
            Ok(index) => match shared.get(index) {
                Some(text) => CellScalar::Text(text.clone()),
                None => {
                    debug!(index, "shared string index out of range");
                    CellScalar::Blank
                },
            },
            Err(_) => {
                debug!(raw = %raw, "unparsable shared string index");
                CellScalar::Blank
            },
        },
        (CellKind::Bool, Some(raw)) => CellScalar::Bool(raw.trim() == "1"),
        (CellKind::Str | CellKind::InlineStr, Some(raw)) => CellScalar::Text(raw),
        (CellKind::Number, Some(raw)) => match raw.trim().parse::<f64>() {
            Ok(n) => CellScalar::Number(n),
            // Unexpected token in a numeric cell; surface it as text and
            // let conversion report a typed error with context
            Err(_) => CellScalar::Text(raw),
        },
    };

    RawCell {
        column: pending.column,
        column_ref: column_letters(pending.column),
        scalar,
    }
}

fn row_number(e: &BytesStart<'_>) -> Option<u32> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == b"r")
        .and_then(|a| a.unescape_value().ok())
        .and_then(|v| v.trim().parse::<u32>().ok())
}

fn start_cell(e: &BytesStart<'_>, fallback_column: u32) -> PendingCell {
    let mut column = fallback_column;
    let mut kind = CellKind::Number;
    for attr in e.attributes().flatten() {
        match attr.key.as_ref() {
            b"r" => {
                if let Ok(value) = attr.unescape_value() {
                    if let Some(parsed) = parse_cell_ref(&value) {
                        column = parsed;
                    }
                }
            },
            b"t" => {
                if let Ok(value) = attr.unescape_value() {
                    kind = match value.as_ref() {
                        "s" => CellKind::Shared,
                        "b" => CellKind::Bool,
                        "inlineStr" => CellKind::InlineStr,
                        "str" => CellKind::Str,
                        _ => CellKind::Number,
                    };
                }
            },
            _ => {},
        }
    }
    PendingCell {
        column,
        kind,
        value: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_letters() {
        assert_eq!(column_letters(0), "A");
        assert_eq!(column_letters(25), "Z");
        assert_eq!(column_letters(26), "AA");
        assert_eq!(column_letters(27), "AB");
        assert_eq!(column_letters(701), "ZZ");
        assert_eq!(column_letters(702), "AAA");
    }

    #[test]
    fn test_parse_cell_ref() {
        assert_eq!(parse_cell_ref("A1"), Some(0));
        assert_eq!(parse_cell_ref("C5"), Some(2));
        assert_eq!(parse_cell_ref("AA10"), Some(26));
        assert_eq!(parse_cell_ref("ZZ1"), Some(701));
        assert_eq!(parse_cell_ref("123"), None);
        // Wider than any real sheet; must not overflow, just fall back
        assert_eq!(parse_cell_ref("AAAAAAAA1"), None);
        assert_eq!(parse_cell_ref("ZZZZZZZZZZ99"), None);
    }

    #[test]
    fn test_raw_snapshot_keys_by_letters() {
        let row = RawRow {
            row_num: 4,
            cells: vec![
                RawCell {
                    column: 0,
                    column_ref: "A".into(),
                    scalar: CellScalar::Text("x".into()),
                },
                RawCell {
                    column: 2,
                    column_ref: "C".into(),
                    scalar: CellScalar::Number(7.0),
                },
            ],
        };
        let snapshot = row.raw_snapshot();
        assert_eq!(snapshot["A"], "x");
        assert_eq!(snapshot["C"], "7");
    }
}
