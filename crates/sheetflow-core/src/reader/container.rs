//! Workbook container access
//!
//! Opens the zip container, resolves sheet names to their XML parts through
//! `xl/workbook.xml` and `xl/_rels/workbook.xml.rels`, and loads the
//! shared-strings table. Sheet data itself is never read here; callers get
//! a [`RowReader`] that pulls rows incrementally.

use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::{BufReader, Read, Seek};
use std::sync::Arc;
use tracing::debug;
use zip::ZipArchive;

use super::rows::RowReader;
use sheetflow_common::{Result, SheetflowError};

/// One sheet's name and the zip part holding its data, in workbook order.
#[derive(Debug, Clone)]
pub struct SheetMeta {
    pub name: String,
    pub part: String,
}

/// An opened workbook container.
pub struct WorkbookContainer<R: Read + Seek> {
    archive: ZipArchive<R>,
    sheets: Vec<SheetMeta>,
    shared_strings: Arc<Vec<String>>,
}

fn container_err(e: impl std::fmt::Display) -> SheetflowError {
    SheetflowError::Container(e.to_string())
}

fn xml_err(e: impl std::fmt::Display) -> SheetflowError {
    SheetflowError::Xml(e.to_string())
}

impl<R: Read + Seek> WorkbookContainer<R> {
    pub fn open(reader: R) -> Result<Self> {
        let mut archive = ZipArchive::new(reader).map_err(container_err)?;
        let names_and_rids = read_sheet_entries(&mut archive)?;
        let targets = read_relationships(&mut archive)?;
        let shared_strings = Arc::new(read_shared_strings(&mut archive)?);

        let mut sheets = Vec::with_capacity(names_and_rids.len());
        for (name, rid) in names_and_rids {
            let Some(target) = targets.iter().find(|(id, _)| *id == rid).map(|(_, t)| t)
            else {
                debug!(sheet = %name, rid = %rid, "sheet has no relationship target, skipping");
                continue;
            };
            let part = if let Some(stripped) = target.strip_prefix('/') {
                stripped.to_string()
            } else {
                format!("xl/{target}")
            };
            sheets.push(SheetMeta { name, part });
        }

        debug!(
            sheets = sheets.len(),
            shared_strings = shared_strings.len(),
            "workbook container opened"
        );

        Ok(Self {
            archive,
            sheets,
            shared_strings,
        })
    }

    /// Sheet names in workbook declaration order.
    pub fn sheet_names(&self) -> Vec<String> {
        self.sheets.iter().map(|s| s.name.clone()).collect()
    }

    pub fn has_sheet(&self, name: &str) -> bool {
        self.sheets.iter().any(|s| s.name == name)
    }

    /// Begin an incremental row pull over one sheet.
    pub fn rows(&mut self, sheet_name: &str) -> Result<RowReader<'_>> {
        let part = self
            .sheets
            .iter()
            .find(|s| s.name == sheet_name)
            .map(|s| s.part.clone())
            .ok_or_else(|| SheetflowError::SheetNotFound(sheet_name.to_string()))?;

        let file = self.archive.by_name(&part).map_err(container_err)?;
        Ok(RowReader::new(file, Arc::clone(&self.shared_strings)))
    }

    /// Row pull over the first sheet in the workbook.
    pub fn first_sheet_rows(&mut self) -> Result<(String, RowReader<'_>)> {
        let name = self
            .sheets
            .first()
            .map(|s| s.name.clone())
            .ok_or_else(|| SheetflowError::Container("workbook has no sheets".into()))?;
        let reader = self.rows(&name)?;
        Ok((name, reader))
    }
}

/// Sheet (name, r:id) pairs from xl/workbook.xml, in declared order.
fn read_sheet_entries<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
) -> Result<Vec<(String, String)>> {
    let part = archive.by_name("xl/workbook.xml").map_err(container_err)?;
    let mut reader = Reader::from_reader(BufReader::new(part));

    let mut entries = Vec::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(e) | Event::Empty(e) => {
                if e.local_name().as_ref() == b"sheet" {
                    let mut name = String::new();
                    let mut rid = String::new();
                    for attr in e.attributes().flatten() {
                        match attr.key.as_ref() {
                            b"name" => name = attr.unescape_value().map_err(xml_err)?.to_string(),
                            b"r:id" => rid = attr.unescape_value().map_err(xml_err)?.to_string(),
                            _ => {},
                        }
                    }
                    if !name.is_empty() && !rid.is_empty() {
                        entries.push((name, rid));
                    }
                }
            },
            Event::Eof => break,
            _ => {},
        }
        buf.clear();
    }
    Ok(entries)
}

/// Relationship (Id, Target) pairs from xl/_rels/workbook.xml.rels.
fn read_relationships<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
) -> Result<Vec<(String, String)>> {
    let part = archive
        .by_name("xl/_rels/workbook.xml.rels")
        .map_err(container_err)?;
    let mut reader = Reader::from_reader(BufReader::new(part));

    let mut rels = Vec::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(e) | Event::Empty(e) => {
                if e.local_name().as_ref() == b"Relationship" {
                    let mut id = String::new();
                    let mut target = String::new();
                    for attr in e.attributes().flatten() {
                        match attr.key.as_ref() {
                            b"Id" => id = attr.unescape_value().map_err(xml_err)?.to_string(),
                            b"Target" => {
                                target = attr.unescape_value().map_err(xml_err)?.to_string()
                            },
                            _ => {},
                        }
                    }
                    if !id.is_empty() && !target.is_empty() {
                        rels.push((id, target));
                    }
                }
            },
            Event::Eof => break,
            _ => {},
        }
        buf.clear();
    }
    Ok(rels)
}

/// The shared-strings table. Absent part means an empty table, not an error.
/// Rich-text runs inside one `<si>` are concatenated.
fn read_shared_strings<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Result<Vec<String>> {
    let part = match archive.by_name("xl/sharedStrings.xml") {
        Ok(part) => part,
        Err(zip::result::ZipError::FileNotFound) => return Ok(Vec::new()),
        Err(e) => return Err(container_err(e)),
    };
    let mut reader = Reader::from_reader(BufReader::new(part));

    let mut strings = Vec::new();
    let mut buf = Vec::new();
    let mut current = String::new();
    let mut in_item = false;
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"si" => {
                    in_item = true;
                    current.clear();
                },
                b"t" if in_item => in_text = true,
                _ => {},
            },
            Event::Text(t) if in_text => {
                current.push_str(&t.unescape().map_err(xml_err)?);
            },
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"si" => {
                    in_item = false;
                    strings.push(std::mem::take(&mut current));
                },
                _ => {},
            },
            Event::Eof => break,
            _ => {},
        }
        buf.clear();
    }
    Ok(strings)
}
