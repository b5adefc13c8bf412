//! Spreadsheet loading into an in-memory grid of cells.

use calamine::{open_workbook_auto, Data, Reader};
use std::path::Path;

use super::{styles, IngestError};

#[derive(Debug, Clone, PartialEq, Default)]
pub enum CellValue {
    #[default]
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
}

impl CellValue {
    pub fn is_blank(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Text used when the cell is part of a header.
    pub fn display(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Text(s) => s.clone(),
            CellValue::Number(n) => super::coerce::format_number(*n),
            CellValue::Bool(b) => b.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Cell {
    pub value: CellValue,
    /// Solid non-white background fill.
    pub highlighted: bool,
}

impl Cell {
    pub fn new(value: CellValue) -> Self {
        Self {
            value,
            highlighted: false,
        }
    }
}

/// One worksheet. `rows[0]` is spreadsheet row 1, `rows[r][0]` is column A.
#[derive(Debug, Clone, Default)]
pub struct SheetGrid {
    pub name: String,
    pub rows: Vec<Vec<Cell>>,
}

impl SheetGrid {
    pub fn new(name: impl Into<String>, rows: Vec<Vec<Cell>>) -> Self {
        Self {
            name: name.into(),
            rows,
        }
    }

    /// Row by 1-based spreadsheet number.
    pub fn row(&self, number: usize) -> Option<&[Cell]> {
        number
            .checked_sub(1)
            .and_then(|index| self.rows.get(index))
            .map(Vec::as_slice)
    }

    fn mark_highlighted(&mut self, row: usize, col: usize) {
        if self.rows.len() <= row {
            self.rows.resize_with(row + 1, Vec::new);
        }
        let cells = &mut self.rows[row];
        if cells.len() <= col {
            cells.resize_with(col + 1, Cell::default);
        }
        cells[col].highlighted = true;
    }
}

fn convert(data: &Data) -> CellValue {
    match data {
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::Float(f) => CellValue::Number(*f),
        Data::String(s) => CellValue::Text(s.clone()),
        Data::Bool(b) => CellValue::Bool(*b),
        Data::DateTime(dt) => CellValue::Number(dt.as_f64()),
        Data::DateTimeIso(s) => CellValue::Text(s.clone()),
        _ => CellValue::Empty,
    }
}

/// Read every sheet of the workbook at `path`, in workbook order.
///
/// Fill colours are only available for OOXML files; when they cannot be read
/// the grid is returned without highlight information.
pub fn read_workbook(path: &Path) -> Result<Vec<SheetGrid>, IngestError> {
    let mut workbook = open_workbook_auto(path)?;
    let names = workbook.sheet_names().to_owned();

    let mut highlights = match styles::read_highlights(path) {
        Ok(map) => map,
        Err(e) => {
            tracing::warn!(error = %e, "Cell styles unavailable, highlight fallback disabled");
            Default::default()
        }
    };

    let mut sheets = Vec::with_capacity(names.len());
    for name in names {
        let range = workbook.worksheet_range(&name)?;
        let (first_row, first_col) = range.start().unwrap_or((0, 0));

        let mut rows: Vec<Vec<Cell>> = vec![Vec::new(); first_row as usize];
        for source in range.rows() {
            let mut cells = vec![Cell::default(); first_col as usize];
            cells.extend(source.iter().map(|data| Cell::new(convert(data))));
            rows.push(cells);
        }

        let mut grid = SheetGrid::new(name.clone(), rows);
        if let Some(marked) = highlights.remove(&name) {
            for (row, col) in marked {
                grid.mark_highlighted(row as usize, col as usize);
            }
        }

        tracing::debug!(sheet = %grid.name, rows = grid.rows.len(), "Sheet loaded");
        sheets.push(grid);
    }

    Ok(sheets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_xlsxwriter::{Color, Format, Workbook};

    #[test]
    fn test_row_uses_spreadsheet_numbering() {
        let grid = SheetGrid::new(
            "S",
            vec![
                vec![Cell::new(CellValue::Text("first".into()))],
                vec![Cell::new(CellValue::Number(2.0))],
            ],
        );
        assert_eq!(grid.row(1).unwrap()[0].value, CellValue::Text("first".into()));
        assert_eq!(grid.row(2).unwrap()[0].value, CellValue::Number(2.0));
        assert!(grid.row(0).is_none());
        assert!(grid.row(3).is_none());
    }

    #[test]
    fn test_read_workbook_values_and_highlights() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firme.xlsx");

        let mut workbook = Workbook::new();
        let yellow = Format::new().set_background_color(Color::Yellow);
        {
            let sheet = workbook.add_worksheet();
            sheet.set_name("Master").unwrap();
            sheet.write_string(1, 0, "N°").unwrap();
            sheet.write_string(1, 1, "Titolare").unwrap();
            sheet.write_number(2, 0, 7).unwrap();
            sheet.write_string(2, 1, "Mario Rossi").unwrap();
            sheet.write_blank(2, 4, &yellow).unwrap();
        }
        {
            let sheet = workbook.add_worksheet();
            sheet.set_name("Rinnovi 2024").unwrap();
            sheet.write_boolean(0, 0, true).unwrap();
        }
        workbook.save(&path).unwrap();

        let sheets = read_workbook(&path).unwrap();
        assert_eq!(sheets.len(), 2);
        assert_eq!(sheets[0].name, "Master");
        assert_eq!(sheets[1].name, "Rinnovi 2024");

        let header = sheets[0].row(2).unwrap();
        assert_eq!(header[0].value, CellValue::Text("N°".into()));

        let data = sheets[0].row(3).unwrap();
        assert_eq!(data[0].value, CellValue::Number(7.0));
        assert_eq!(data[1].value, CellValue::Text("Mario Rossi".into()));
        assert!(!data[1].highlighted);
        assert!(data[4].highlighted);
        assert!(data[4].value.is_blank());

        assert_eq!(sheets[1].row(1).unwrap()[0].value, CellValue::Bool(true));
    }

    #[test]
    fn test_read_workbook_rejects_non_spreadsheet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.xlsx");
        std::fs::write(&path, b"not a workbook").unwrap();

        assert!(read_workbook(&path).is_err());
    }
}
