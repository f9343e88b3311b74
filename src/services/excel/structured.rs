use std::io::Cursor;

use bytes::Bytes;
use calamine::{Data, Reader, Sheets, Xls, Xlsb, Xlsx};

use super::metadata;
use super::parser::{DecodeRequest, WorkbookDecoder};
use super::types::{CellValue, ExtractionMethod, ParsedWorkbook, RawSheet, SheetFormat};
use super::utils::{excel_serial_to_datetime, parse_date_string};
use crate::error::EngineError;

/// First tier: full decode through calamine, keeping typed values, dates and
/// formula counts.
pub struct StructuredDecoder;

pub fn open_workbook(data: &Bytes, format: SheetFormat) -> Result<Sheets<Cursor<Bytes>>, EngineError> {
    let cursor = Cursor::new(data.clone());
    let failed = |e: String| EngineError::ParseFailure(format!("Failed to open {} workbook: {}", format.extension(), e));
    let workbook = match format {
        SheetFormat::Xls => Sheets::Xls(Xls::new(cursor).map_err(|e| failed(e.to_string()))?),
        SheetFormat::Xlsx | SheetFormat::Xlsm => {
            Sheets::Xlsx(Xlsx::new(cursor).map_err(|e| failed(e.to_string()))?)
        }
        SheetFormat::Xlsb => Sheets::Xlsb(Xlsb::new(cursor).map_err(|e| failed(e.to_string()))?),
    };
    Ok(workbook)
}

/// Sheet names in workbook order, without decoding any cells.
pub fn sheet_names(data: &Bytes, format: SheetFormat) -> Result<Vec<String>, EngineError> {
    let workbook = open_workbook(data, format)?;
    Ok(workbook.sheet_names().to_vec())
}

pub fn convert_cell(cell: &Data) -> CellValue {
    match cell {
        Data::Empty => CellValue::Empty,
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::Float(f) => CellValue::Number(*f),
        Data::String(s) => CellValue::Text(s.clone()),
        Data::Bool(b) => CellValue::Bool(*b),
        Data::DateTime(d) => excel_serial_to_datetime(d.as_f64())
            .map(CellValue::Date)
            .unwrap_or(CellValue::Number(d.as_f64())),
        Data::DateTimeIso(s) => parse_date_string(s)
            .map(CellValue::Date)
            .unwrap_or_else(|| CellValue::Text(s.clone())),
        Data::Error(e) => CellValue::Error(e.to_string()),
        #[allow(unreachable_patterns)]
        other => CellValue::Text(other.to_string()),
    }
}

impl WorkbookDecoder for StructuredDecoder {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Structured
    }

    fn supports(&self, _format: SheetFormat) -> bool {
        true
    }

    fn decode(
        &self,
        data: &Bytes,
        format: SheetFormat,
        request: &DecodeRequest,
    ) -> Result<ParsedWorkbook, EngineError> {
        let mut workbook = open_workbook(data, format)?;
        let sheet_names: Vec<String> = workbook.sheet_names().to_vec();
        tracing::debug!("Found {} sheets: {:?}", sheet_names.len(), sheet_names);

        let mut sheets = Vec::new();
        for (index, name) in sheet_names.iter().enumerate() {
            if !request.wants(index) {
                continue;
            }
            match workbook.worksheet_range(name) {
                Ok(range) => {
                    let rows: Vec<Vec<CellValue>> = range
                        .rows()
                        .map(|row| row.iter().map(convert_cell).collect())
                        .collect();
                    let total_columns = range.get_size().1;
                    let formula_cells = workbook
                        .worksheet_formula(name)
                        .map(|f| f.used_cells().filter(|(_, _, formula)| !formula.is_empty()).count())
                        .unwrap_or(0);
                    sheets.push(RawSheet {
                        name: name.clone(),
                        index,
                        rows,
                        total_columns,
                        formula_cells,
                        error: None,
                    });
                }
                Err(e) => {
                    tracing::warn!("Failed to read worksheet {}: {}", name, e);
                    sheets.push(RawSheet::failed(name.clone(), index, e.to_string()));
                }
            }
        }

        if !sheet_names.is_empty() && sheets.iter().all(|s| s.error.is_some()) && request.sheet_filter.is_none() {
            return Err(EngineError::ParseFailure("no worksheet could be read".to_string()));
        }

        let mut metadata = metadata::inspect(data, format);
        metadata.has_formulas = sheets.iter().any(|s| s.formula_cells > 0);
        metadata.skipped_sheets = sheet_names.len().saturating_sub(request.max_sheets);
        metadata.sheet_names = sheet_names;

        let confidence = if format.has_xml_worksheets() { 0.95 } else { 0.9 };

        Ok(ParsedWorkbook {
            content: String::new(),
            sheets,
            metadata,
            confidence,
            extraction_method: ExtractionMethod::Structured,
            fallbacks: Vec::new(),
        })
    }
}
