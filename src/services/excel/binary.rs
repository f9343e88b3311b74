use std::collections::HashSet;

use bytes::Bytes;

use super::metadata;
use super::parser::{DecodeRequest, WorkbookDecoder};
use super::types::{CellValue, ExtractionMethod, ParsedWorkbook, RawSheet, SheetFormat};
use crate::error::EngineError;

const SIGNATURES: [&[u8; 4]; 3] = [b"TEXT", b"LABE", b"STRI"];
const MIN_RUN: usize = 4;
const MAX_STRINGS: usize = 5_000;
const HIGH_YIELD: usize = 20;

/// Compound-document stream names that show up as text but carry no data.
const STRUCTURAL_NAMES: [&str; 6] = [
    "Root Entry",
    "Workbook",
    "Book",
    "SummaryInformation",
    "DocumentSummaryInformation",
    "_VBA_PROJECT",
];

/// Third tier for legacy binaries: recovers text runs from the raw buffer.
pub struct BinaryScanDecoder;

fn is_printable(b: u8) -> bool {
    (0x20..=0x7e).contains(&b) || b >= 0xc0
}

fn looks_meaningful(s: &str) -> bool {
    let trimmed = s.trim();
    let alnum = trimmed.chars().filter(|c| c.is_alphanumeric()).count();
    alnum >= 2 && alnum * 2 >= trimmed.chars().count() && !STRUCTURAL_NAMES.contains(&trimmed)
}

/// Printable text right after a record signature.
pub fn signature_strings(data: &[u8]) -> Vec<String> {
    let mut found = Vec::new();
    for signature in SIGNATURES {
        let mut pos = 0;
        while let Some(offset) = data[pos..].windows(4).position(|w| w == signature.as_slice()) {
            let mut start = pos + offset + 4;
            let skip_limit = (start + 8).min(data.len());
            while start < skip_limit && !is_printable(data[start]) {
                start += 1;
            }
            let end = data[start..]
                .iter()
                .position(|b| !is_printable(*b))
                .map_or(data.len(), |p| start + p);
            if end - start >= 3 {
                found.push(latin1(&data[start..end]));
            }
            pos = pos + offset + 4;
            if pos >= data.len() {
                break;
            }
        }
    }
    found
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|b| *b as char).collect()
}

/// Runs of Latin-1 text of at least `MIN_RUN` bytes.
pub fn latin_runs(data: &[u8]) -> Vec<String> {
    data.split(|b| !is_printable(*b))
        .filter(|run| run.len() >= MIN_RUN)
        .map(latin1)
        .collect()
}

/// Runs of UTF-16LE text (printable byte followed by a zero byte).
pub fn utf16_runs(data: &[u8]) -> Vec<String> {
    let mut runs = Vec::new();
    let mut current: Vec<u16> = Vec::new();
    let flush = |current: &mut Vec<u16>, runs: &mut Vec<String>| {
        if current.len() >= MIN_RUN {
            runs.push(String::from_utf16_lossy(current));
        }
        current.clear();
    };
    for pair in data.chunks_exact(2) {
        if pair[1] == 0 && is_printable(pair[0]) {
            current.push(pair[0] as u16);
        } else {
            flush(&mut current, &mut runs);
        }
    }
    flush(&mut current, &mut runs);
    runs
}

/// Deduplicated, noise-filtered strings in discovery order.
pub fn extract_strings(data: &[u8]) -> Vec<String> {
    let mut seen = HashSet::new();
    signature_strings(data)
        .into_iter()
        .chain(utf16_runs(data))
        .chain(latin_runs(data))
        .map(|s| s.trim().to_string())
        .filter(|s| looks_meaningful(s))
        .filter(|s| seen.insert(s.clone()))
        .take(MAX_STRINGS)
        .collect()
}

impl WorkbookDecoder for BinaryScanDecoder {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::BinaryScan
    }

    fn supports(&self, format: SheetFormat) -> bool {
        !format.is_zip_container()
    }

    fn decode(
        &self,
        data: &Bytes,
        format: SheetFormat,
        request: &DecodeRequest,
    ) -> Result<ParsedWorkbook, EngineError> {
        let strings = extract_strings(data);
        if strings.is_empty() {
            return Err(EngineError::ParseFailure("no text runs found in binary".to_string()));
        }
        let confidence = if strings.len() >= HIGH_YIELD { 0.5 } else { 0.2 };
        tracing::debug!("Binary scan recovered {} strings", strings.len());

        let mut sheets = Vec::new();
        if request.wants(0) {
            sheets.push(RawSheet {
                name: "Extracted Text".to_string(),
                index: 0,
                rows: strings.into_iter().map(|s| vec![CellValue::Text(s)]).collect(),
                total_columns: 1,
                formula_cells: 0,
                error: None,
            });
        }

        let mut metadata = metadata::inspect(data, format);
        metadata.sheet_names = vec!["Extracted Text".to_string()];

        Ok(ParsedWorkbook {
            content: String::new(),
            sheets,
            metadata,
            confidence,
            extraction_method: ExtractionMethod::BinaryScan,
            fallbacks: Vec::new(),
        })
    }
}
