use std::io::Cursor;

use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use zip::ZipArchive;

use super::metadata::{self, read_zip_entry, unescape_xml};
use super::parser::{DecodeRequest, WorkbookDecoder};
use super::types::{parse_number, CellValue, ExtractionMethod, ParsedWorkbook, RawSheet, SheetFormat};
use crate::error::EngineError;

static SHEET_PART_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^xl/worksheets/sheet(\d+)\.xml$").expect("valid regex"));
static SHEET_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<sheet\b[^>]*?\bname="([^"]*)""#).expect("valid regex"));
static SHARED_STRING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<si>(.*?)</si>").expect("valid regex"));
static TEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<t(?:\s[^>]*)?>(.*?)</t>").expect("valid regex"));
static ROW_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<row\b([^>]*?)(?:/>|>(.*?)</row>)").expect("valid regex"));
static CELL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<c\b([^>]*?)(?:/>|>(.*?)</c>)").expect("valid regex"));
static ROW_NUM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\br="(\d+)""#).expect("valid regex"));
static CELL_REF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\br="([A-Z]+)(\d+)""#).expect("valid regex"));
static CELL_TYPE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\bt="(\w+)""#).expect("valid regex"));
static VALUE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<v>(.*?)</v>").expect("valid regex"));
static FORMULA_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<f[\s>/]").expect("valid regex"));

/// Second tier for OOXML containers: pulls `<row>`/`<c>`/`<v>` nodes straight
/// out of the worksheet parts without a full spreadsheet model. No styles, so
/// dates come through as serial numbers.
pub struct ContainerXmlDecoder;

/// Worksheet bounds of the OOXML format.
pub const MAX_SHEET_ROWS: usize = 1_048_576;
pub const MAX_SHEET_COLUMNS: usize = 16_384;
/// Cells a single scanned sheet may materialize.
const MAX_SCANNED_CELLS: usize = 10_000_000;

/// Converts column letters ("A", "AB") to a zero-based index. `None` past the
/// last worksheet column.
pub fn column_index(letters: &str) -> Option<usize> {
    let one_based = letters.bytes().try_fold(0usize, |acc, b| {
        acc.checked_mul(26)?.checked_add(usize::from(b.checked_sub(b'A')?) + 1)
    })?;
    one_based.checked_sub(1).filter(|&i| i < MAX_SHEET_COLUMNS)
}

fn out_of_bounds(what: &str, value: &str) -> EngineError {
    EngineError::ParseFailure(format!("{} {} is outside the worksheet grid", what, value))
}

fn shared_strings(archive: &mut ZipArchive<Cursor<Bytes>>) -> Result<Vec<String>, EngineError> {
    let Some(xml) = read_zip_entry(archive, "xl/sharedStrings.xml")? else {
        return Ok(Vec::new());
    };
    Ok(SHARED_STRING_RE
        .captures_iter(&xml)
        .map(|si| {
            let body = si.get(1).map_or("", |m| m.as_str());
            TEXT_RE
                .captures_iter(body)
                .filter_map(|t| t.get(1))
                .map(|t| unescape_xml(t.as_str()))
                .collect::<String>()
        })
        .collect())
}

fn decode_cell(attrs: &str, body: &str, strings: &[String]) -> CellValue {
    let cell_type = CELL_TYPE_RE
        .captures(attrs)
        .and_then(|c| c.get(1))
        .map_or("n", |m| m.as_str());
    let raw_value = VALUE_RE.captures(body).and_then(|c| c.get(1)).map(|m| m.as_str());

    match cell_type {
        "s" => raw_value
            .and_then(|v| v.trim().parse::<usize>().ok())
            .and_then(|i| strings.get(i))
            .map(|s| CellValue::Text(s.clone()))
            .unwrap_or(CellValue::Empty),
        "inlineStr" => {
            let text: String = TEXT_RE
                .captures_iter(body)
                .filter_map(|t| t.get(1))
                .map(|t| unescape_xml(t.as_str()))
                .collect();
            CellValue::Text(text)
        }
        "str" => raw_value.map_or(CellValue::Empty, |v| CellValue::Text(unescape_xml(v))),
        "b" => raw_value.map_or(CellValue::Empty, |v| CellValue::Bool(v.trim() == "1")),
        "e" => raw_value.map_or(CellValue::Empty, |v| CellValue::Error(unescape_xml(v))),
        _ => match raw_value {
            Some(v) => parse_number(v)
                .map(CellValue::Number)
                .unwrap_or_else(|| CellValue::Text(unescape_xml(v))),
            None => CellValue::Empty,
        },
    }
}

/// Scans one worksheet part. Rows are placed by their `r` attribute; gap rows
/// stay as empty vectors and rows are not padded to the widest one.
pub fn scan_worksheet(xml: &str, strings: &[String]) -> Result<(Vec<Vec<CellValue>>, usize, usize), EngineError> {
    let mut positioned: Vec<(usize, Vec<CellValue>)> = Vec::new();
    let mut formula_cells = 0;
    let mut max_columns = 0;
    let mut materialized = 0usize;

    for (ordinal, row) in ROW_RE.captures_iter(xml).enumerate() {
        let row_attrs = row.get(1).map_or("", |m| m.as_str());
        let row_body = row.get(2).map_or("", |m| m.as_str());
        let row_number = match ROW_NUM_RE.captures(row_attrs) {
            Some(c) => c[1]
                .parse::<usize>()
                .ok()
                .filter(|n| (1..=MAX_SHEET_ROWS).contains(n))
                .ok_or_else(|| out_of_bounds("row", &c[1]))?,
            None => ordinal + 1,
        };
        if row_number > MAX_SHEET_ROWS {
            return Err(out_of_bounds("row", &row_number.to_string()));
        }

        let mut cells: Vec<CellValue> = Vec::new();
        for cell in CELL_RE.captures_iter(row_body) {
            let attrs = cell.get(1).map_or("", |m| m.as_str());
            let body = cell.get(2).map_or("", |m| m.as_str());
            let col = match CELL_REF_RE.captures(attrs) {
                Some(c) => column_index(&c[1]).ok_or_else(|| out_of_bounds("column", &c[1]))?,
                None if cells.len() < MAX_SHEET_COLUMNS => cells.len(),
                None => return Err(out_of_bounds("column", &(cells.len() + 1).to_string())),
            };
            if FORMULA_RE.is_match(body) {
                formula_cells += 1;
            }
            if cells.len() <= col {
                materialized += col + 1 - cells.len();
                if materialized > MAX_SCANNED_CELLS {
                    return Err(EngineError::ParseFailure(format!(
                        "worksheet expands past {} cells",
                        MAX_SCANNED_CELLS
                    )));
                }
                cells.resize(col + 1, CellValue::Empty);
            }
            cells[col] = decode_cell(attrs, body, strings);
        }
        max_columns = max_columns.max(cells.len());
        positioned.push((row_number, cells));
    }

    let Some(first) = positioned.iter().map(|(n, _)| *n).min() else {
        return Ok((Vec::new(), 0, formula_cells));
    };
    let last = positioned.iter().map(|(n, _)| *n).max().unwrap_or(first);
    let mut rows = vec![Vec::new(); last - first + 1];
    for (number, cells) in positioned {
        rows[number - first] = cells;
    }
    Ok((rows, max_columns, formula_cells))
}

impl WorkbookDecoder for ContainerXmlDecoder {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::ContainerXml
    }

    fn supports(&self, format: SheetFormat) -> bool {
        format.has_xml_worksheets()
    }

    fn decode(
        &self,
        data: &Bytes,
        format: SheetFormat,
        request: &DecodeRequest,
    ) -> Result<ParsedWorkbook, EngineError> {
        let mut archive = ZipArchive::new(Cursor::new(data.clone()))?;

        let mut parts: Vec<(usize, String)> = archive
            .file_names()
            .filter_map(|name| {
                SHEET_PART_RE
                    .captures(name)
                    .and_then(|c| c[1].parse::<usize>().ok())
                    .map(|n| (n, name.to_string()))
            })
            .collect();
        if parts.is_empty() {
            return Err(EngineError::ParseFailure("container has no worksheet parts".to_string()));
        }
        parts.sort_by_key(|(n, _)| *n);

        // Sheet N is paired with the Nth <sheet> entry of workbook.xml.
        let names: Vec<String> = read_zip_entry(&mut archive, "xl/workbook.xml")?
            .map(|xml| {
                SHEET_NAME_RE
                    .captures_iter(&xml)
                    .map(|c| unescape_xml(&c[1]))
                    .collect()
            })
            .unwrap_or_default();
        let strings = shared_strings(&mut archive)?;

        let mut sheets = Vec::new();
        for (index, (number, part)) in parts.iter().enumerate() {
            if !request.wants(index) {
                continue;
            }
            let name = names
                .get(index)
                .cloned()
                .unwrap_or_else(|| format!("Sheet{}", number));
            match read_zip_entry(&mut archive, part) {
                Ok(Some(xml)) => {
                    let (rows, total_columns, formula_cells) = scan_worksheet(&xml, &strings)?;
                    sheets.push(RawSheet { name, index, rows, total_columns, formula_cells, error: None });
                }
                Ok(None) => sheets.push(RawSheet::failed(name, index, "worksheet part missing")),
                Err(e) => sheets.push(RawSheet::failed(name, index, e.to_string())),
            }
        }

        let mut metadata = metadata::inspect(data, format);
        metadata.has_formulas = sheets.iter().any(|s| s.formula_cells > 0);
        metadata.skipped_sheets = parts.len().saturating_sub(request.max_sheets);
        metadata.sheet_names = if names.len() == parts.len() {
            names
        } else {
            parts.iter().map(|(n, _)| format!("Sheet{}", n)).collect()
        };

        Ok(ParsedWorkbook {
            content: String::new(),
            sheets,
            metadata,
            confidence: 0.7,
            extraction_method: ExtractionMethod::ContainerXml,
            fallbacks: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_letters() {
        assert_eq!(column_index("A"), Some(0));
        assert_eq!(column_index("Z"), Some(25));
        assert_eq!(column_index("AA"), Some(26));
        assert_eq!(column_index("AB"), Some(27));
        assert_eq!(column_index("XFD"), Some(MAX_SHEET_COLUMNS - 1));
        assert_eq!(column_index("XFE"), None);
        assert_eq!(column_index("ZZZZZZZZZZZZZZZZ"), None);
    }

    #[test]
    fn scans_rows_cells_and_gaps() {
        let strings = vec!["Name".to_string(), "Alice".to_string()];
        let xml = r#"<worksheet><sheetData>
            <row r="1"><c r="A1" t="s"><v>0</v></c><c r="C1" t="inlineStr"><is><t>Amount</t></is></c></row>
            <row r="2"><c r="A2" t="s"><v>1</v></c><c r="B2" t="b"><v>1</v></c><c r="C2"><f>SUM(1,2)</f><v>3</v></c></row>
            <row r="4"><c r="A4" t="str"><v>a &amp; b</v></c><c r="B4"/></row>
        </sheetData></worksheet>"#;
        let (rows, columns, formulas) = scan_worksheet(xml, &strings).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(columns, 3);
        assert_eq!(formulas, 1);
        assert_eq!(rows[0][0], CellValue::Text("Name".into()));
        assert_eq!(rows[0][1], CellValue::Empty);
        assert_eq!(rows[0][2], CellValue::Text("Amount".into()));
        assert_eq!(rows[1][1], CellValue::Bool(true));
        assert_eq!(rows[1][2], CellValue::Number(3.0));
        assert!(rows[2].is_empty());
        assert_eq!(rows[3].len(), 2);
        assert_eq!(rows[3][0], CellValue::Text("a & b".into()));
    }

    #[test]
    fn empty_sheet_scans_to_nothing() {
        let (rows, columns, _) = scan_worksheet("<worksheet><sheetData/></worksheet>", &[]).unwrap();
        assert!(rows.is_empty());
        assert_eq!(columns, 0);
    }

    #[test]
    fn oversized_column_reference_is_a_parse_failure() {
        let xml = r#"<row r="1"><c r="ZZZZZZZZZZZZZZZZ1"><v>1</v></c></row>"#;
        assert!(matches!(scan_worksheet(xml, &[]), Err(EngineError::ParseFailure(_))));
    }

    #[test]
    fn row_numbers_past_the_grid_are_rejected() {
        let xml = r#"<row r="1"><c r="A1"><v>1</v></c></row><row r="20000000"><c r="A20000000"><v>2</v></c></row>"#;
        assert!(matches!(scan_worksheet(xml, &[]), Err(EngineError::ParseFailure(_))));

        let xml = r#"<row r="99999999999999999999999"><c><v>2</v></c></row>"#;
        assert!(matches!(scan_worksheet(xml, &[]), Err(EngineError::ParseFailure(_))));
    }

    #[test]
    fn distant_rows_leave_unallocated_gaps() {
        let xml = r#"<row r="1"><c r="A1"><v>1</v></c><c r="C1"><v>1</v></c></row><row r="1048576"><c r="A1048576"><v>2</v></c></row>"#;
        let (rows, columns, _) = scan_worksheet(xml, &[]).unwrap();
        assert_eq!(rows.len(), MAX_SHEET_ROWS);
        assert_eq!(columns, 3);
        assert!(rows[1..MAX_SHEET_ROWS - 1].iter().all(|r| r.capacity() == 0));
        assert_eq!(rows[MAX_SHEET_ROWS - 1], vec![CellValue::Number(2.0)]);
    }
}
