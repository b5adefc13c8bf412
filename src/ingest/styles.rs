//! Cell fill extraction straight from the OOXML package.
//!
//! The spreadsheet reader only exposes values, so highlighted cells are found
//! by walking `styles.xml` (fills and cell formats) and the `s` attribute of
//! each `<c>` element in the worksheet parts.

use quick_xml::{events::Event, Reader};
use std::{
    collections::{HashMap, HashSet},
    fs::File,
    io::{BufReader, Read, Seek},
    path::Path,
};
use zip::{result::ZipError, ZipArchive};

/// Zero-based `(row, col)` coordinates of highlighted cells, per sheet name.
pub type HighlightMap = HashMap<String, HashSet<(u32, u32)>>;

#[derive(Debug, thiserror::Error)]
pub enum StyleError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] ZipError),

    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),
}

pub fn read_highlights(path: &Path) -> Result<HighlightMap, StyleError> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;

    let Some(styles) = read_part(&mut archive, "xl/styles.xml")? else {
        return Ok(HighlightMap::new());
    };
    let highlighted_formats = highlighted_formats(&styles)?;
    if !highlighted_formats.iter().any(|h| *h) {
        return Ok(HighlightMap::new());
    }

    let workbook = read_part(&mut archive, "xl/workbook.xml")?.unwrap_or_default();
    let rels = read_part(&mut archive, "xl/_rels/workbook.xml.rels")?.unwrap_or_default();
    let targets = relationship_targets(&rels)?;

    let mut map = HighlightMap::new();
    for (name, rel_id) in sheet_entries(&workbook)? {
        let Some(target) = targets.get(&rel_id) else {
            continue;
        };
        let Some(xml) = read_part(&mut archive, &resolve_target(target))? else {
            continue;
        };
        let cells = highlighted_cells(&xml, &highlighted_formats)?;
        if !cells.is_empty() {
            map.insert(name, cells);
        }
    }

    Ok(map)
}

fn read_part<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Option<String>, StyleError> {
    match archive.by_name(name) {
        Ok(mut entry) => {
            let mut content = String::new();
            entry.read_to_string(&mut content)?;
            Ok(Some(content))
        }
        Err(ZipError::FileNotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn resolve_target(target: &str) -> String {
    match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("xl/{}", target),
    }
}

fn attr(element: &quick_xml::events::BytesStart<'_>, key: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == key)
        .and_then(|a| a.unescape_value().ok())
        .map(|value| value.into_owned())
}

/// A fill counts as highlighted when it has a visible pattern in a non-white colour.
fn fill_is_highlight(pattern: Option<&str>, color: Option<&FillColor>) -> bool {
    let visible = matches!(pattern, Some(p) if p != "none" && p != "gray125");
    if !visible {
        return false;
    }
    match color {
        Some(FillColor::Rgb(rgb)) => !rgb.to_ascii_uppercase().ends_with("FFFFFF"),
        Some(FillColor::Indexed(index)) => !matches!(index.as_str(), "1" | "9" | "64"),
        Some(FillColor::Theme(theme)) => theme != "0",
        None => true,
    }
}

#[derive(Debug, Clone)]
enum FillColor {
    Rgb(String),
    Indexed(String),
    Theme(String),
}

fn fill_color(element: &quick_xml::events::BytesStart<'_>) -> Option<FillColor> {
    attr(element, b"rgb")
        .map(FillColor::Rgb)
        .or_else(|| attr(element, b"indexed").map(FillColor::Indexed))
        .or_else(|| attr(element, b"theme").map(FillColor::Theme))
}

/// For every cell format index, whether its fill is a highlight.
fn highlighted_formats(styles: &str) -> Result<Vec<bool>, StyleError> {
    let mut reader = Reader::from_str(styles);
    reader.config_mut().trim_text(true);

    let mut fills: Vec<bool> = Vec::new();
    let mut formats: Vec<usize> = Vec::new();
    let mut in_fills = false;
    let mut in_cell_xfs = false;
    let mut pattern: Option<String> = None;
    let mut color: Option<FillColor> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"fills" => in_fills = true,
                b"cellXfs" => in_cell_xfs = true,
                b"fill" if in_fills => {
                    pattern = None;
                    color = None;
                }
                b"patternFill" if in_fills => pattern = attr(&e, b"patternType"),
                b"xf" if in_cell_xfs => {
                    formats.push(attr(&e, b"fillId").and_then(|v| v.parse().ok()).unwrap_or(0))
                }
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"patternFill" if in_fills => pattern = attr(&e, b"patternType"),
                b"fgColor" if in_fills => color = fill_color(&e),
                b"xf" if in_cell_xfs => {
                    formats.push(attr(&e, b"fillId").and_then(|v| v.parse().ok()).unwrap_or(0))
                }
                _ => {}
            },
            Event::End(e) => match e.local_name().as_ref() {
                b"fills" => in_fills = false,
                b"cellXfs" => in_cell_xfs = false,
                b"fill" if in_fills => {
                    fills.push(fill_is_highlight(pattern.as_deref(), color.as_ref()))
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(formats
        .into_iter()
        .map(|fill| fills.get(fill).copied().unwrap_or(false))
        .collect())
}

/// `(sheet name, relationship id)` in workbook order.
fn sheet_entries(workbook: &str) -> Result<Vec<(String, String)>, StyleError> {
    let mut reader = Reader::from_str(workbook);
    let mut entries = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheet" => {
                if let (Some(name), Some(id)) = (attr(&e, b"name"), attr(&e, b"id")) {
                    entries.push((name, id));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(entries)
}

fn relationship_targets(rels: &str) -> Result<HashMap<String, String>, StyleError> {
    let mut reader = Reader::from_str(rels);
    let mut targets = HashMap::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Relationship" => {
                if let (Some(id), Some(target)) = (attr(&e, b"Id"), attr(&e, b"Target")) {
                    targets.insert(id, target);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(targets)
}

fn highlighted_cells(sheet: &str, formats: &[bool]) -> Result<HashSet<(u32, u32)>, StyleError> {
    let mut reader = Reader::from_str(sheet);
    let mut cells = HashSet::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"c" => {
                let highlighted = attr(&e, b"s")
                    .and_then(|s| s.parse::<usize>().ok())
                    .and_then(|s| formats.get(s).copied())
                    .unwrap_or(false);
                if highlighted {
                    if let Some(coords) = attr(&e, b"r").as_deref().and_then(parse_cell_ref) {
                        cells.insert(coords);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(cells)
}

/// `"AB12"` -> `(11, 27)`, zero-based.
pub fn parse_cell_ref(reference: &str) -> Option<(u32, u32)> {
    let split = reference.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = reference.split_at(split);
    if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let col = letters
        .chars()
        .try_fold(0u32, |acc, c| {
            acc.checked_mul(26)?
                .checked_add(c.to_ascii_uppercase() as u32 - 'A' as u32 + 1)
        })?
        .checked_sub(1)?;
    let row = digits.parse::<u32>().ok()?.checked_sub(1)?;
    Some((row, col))
}
