use std::io::Cursor;

use calamine::{Data, Reader};

use crate::detector::{DetectedFormat, LoadedSource, SourceContent};
use crate::error::{ExtratoError, Result};
use crate::money::{excel_serial_to_date, format_date};

use super::{normalize_table, NormalizedRows, RowNormalizer};

/// xlsx/xls/ods workbooks; only the first sheet is read.
pub struct SpreadsheetNormalizer;

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::String(s) => s.clone(),
        Data::Float(f) if f.fract() == 0.0 => format!("{f:.0}"),
        Data::Float(f) => format!("{f:.2}"),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => excel_serial_to_date(dt.as_f64()).map(format_date).unwrap_or_default(),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Error(_) | Data::Empty => String::new(),
    }
}

/// Reads the first worksheet into text cells. Leading empty rows are kept
/// so row indexes match the sheet's line numbers.
pub fn read_grid(bytes: &[u8]) -> Result<Vec<Vec<String>>> {
    let mut workbook = calamine::open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| ExtratoError::UnsupportedFormat(format!("unreadable spreadsheet: {e}")))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| ExtratoError::UnsupportedFormat("the workbook has no sheets".into()))?
        .map_err(|e| ExtratoError::UnsupportedFormat(format!("unreadable sheet: {e}")))?;

    let offset = range.start().map(|(row, _)| row as usize).unwrap_or(0);
    let mut grid = vec![Vec::new(); offset];
    grid.extend(range.rows().map(|row| row.iter().map(cell_text).collect::<Vec<_>>()));
    Ok(grid)
}

impl RowNormalizer for SpreadsheetNormalizer {
    fn normalize(&self, source: &LoadedSource, format: &DetectedFormat) -> Result<NormalizedRows> {
        let SourceContent::Grid(grid) = &source.content else {
            return Err(ExtratoError::UnsupportedFormat("expected a spreadsheet".into()));
        };
        let rows: Vec<(usize, Vec<String>)> = grid.iter().cloned().enumerate().map(|(i, r)| (i + 1, r)).collect();
        normalize_table(&rows, format.document_type)
    }
}
