use std::fmt::Write as _;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

use bytes::Bytes;

use super::binary::BinaryScanDecoder;
use super::container::ContainerXmlDecoder;
use super::structured::StructuredDecoder;
use super::types::{ExtractionMethod, ParsedWorkbook, RawSheet, SheetFormat, WorkbookMetadata};
use crate::error::EngineError;

const CONTENT_ROWS_PER_SHEET: usize = 10;
const CONTENT_MAX_CHARS: usize = 8_000;

/// Which sheets a decoder should materialize.
#[derive(Debug, Clone, Default)]
pub struct DecodeRequest {
    pub max_sheets: usize,
    /// Restrict decoding to these workbook sheet indices (parallel chunks).
    pub sheet_filter: Option<Vec<usize>>,
}

impl DecodeRequest {
    pub fn new(max_sheets: usize) -> Self {
        Self { max_sheets, sheet_filter: None }
    }

    pub fn for_sheets(max_sheets: usize, sheets: Vec<usize>) -> Self {
        Self { max_sheets, sheet_filter: Some(sheets) }
    }

    /// Whether the sheet at `index` is in scope.
    pub fn wants(&self, index: usize) -> bool {
        index < self.max_sheets
            && self.sheet_filter.as_ref().map_or(true, |f| f.contains(&index))
    }
}

/// One tier of the decoding chain.
pub trait WorkbookDecoder: Send + Sync {
    fn method(&self) -> ExtractionMethod;

    fn supports(&self, format: SheetFormat) -> bool;

    fn decode(
        &self,
        data: &Bytes,
        format: SheetFormat,
        request: &DecodeRequest,
    ) -> Result<ParsedWorkbook, EngineError>;
}

/// Last resort tier: never fails, carries only a description.
pub struct PlaceholderDecoder;

impl WorkbookDecoder for PlaceholderDecoder {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Placeholder
    }

    fn supports(&self, _format: SheetFormat) -> bool {
        true
    }

    fn decode(
        &self,
        data: &Bytes,
        format: SheetFormat,
        _request: &DecodeRequest,
    ) -> Result<ParsedWorkbook, EngineError> {
        Ok(ParsedWorkbook {
            content: format!(
                "Unable to extract cell data from this {} file ({} bytes). \
                 The file may be encrypted, corrupted or use unsupported features.",
                format.extension().to_uppercase(),
                data.len()
            ),
            sheets: Vec::new(),
            metadata: WorkbookMetadata::default(),
            confidence: 0.1,
            extraction_method: ExtractionMethod::Placeholder,
            fallbacks: Vec::new(),
        })
    }
}

/// Ordered decoder chain; each tier runs only if the previous one failed.
pub struct TieredParser {
    decoders: Vec<Box<dyn WorkbookDecoder>>,
}

impl Default for TieredParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TieredParser {
    pub fn new() -> Self {
        Self::with_decoders(vec![
            Box::new(StructuredDecoder),
            Box::new(ContainerXmlDecoder),
            Box::new(BinaryScanDecoder),
            Box::new(PlaceholderDecoder),
        ])
    }

    pub fn with_decoders(decoders: Vec<Box<dyn WorkbookDecoder>>) -> Self {
        Self { decoders }
    }

    pub fn parse(
        &self,
        data: &Bytes,
        format: SheetFormat,
        request: &DecodeRequest,
    ) -> Result<ParsedWorkbook, EngineError> {
        let start = Instant::now();
        let mut fallbacks = Vec::new();

        for decoder in self.decoders.iter().filter(|d| d.supports(format)) {
            let method = decoder.method();
            let outcome = catch_unwind(AssertUnwindSafe(|| decoder.decode(data, format, request)))
                .unwrap_or_else(|panic| Err(EngineError::ParseFailure(panic_message(panic.as_ref()))));
            match outcome {
                Ok(mut parsed) => {
                    tracing::info!(
                        "Decoded {} workbook with {:?} in {:?} ({} sheets, confidence {:.2})",
                        format.extension(),
                        method,
                        start.elapsed(),
                        parsed.sheets.len(),
                        parsed.confidence
                    );
                    parsed.fallbacks = fallbacks;
                    if parsed.content.is_empty() {
                        parsed.content = render_content(&parsed.sheets);
                    }
                    return Ok(parsed);
                }
                Err(e) => {
                    tracing::warn!("Decoder {:?} failed, trying next tier: {}", method, e);
                    fallbacks.push(format!("{:?}: {}", method, e));
                }
            }
        }

        Err(EngineError::ParseFailure(format!(
            "all decoders failed: {}",
            fallbacks.join("; ")
        )))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("decoder panicked: {}", detail)
}

/// Bounded plain-text rendering of the first rows of every sheet.
pub fn render_content(sheets: &[RawSheet]) -> String {
    let mut content = String::new();
    for sheet in sheets {
        let _ = writeln!(content, "=== Sheet: {} ({} rows) ===", sheet.name, sheet.rows.len());
        for row in sheet.rows.iter().take(CONTENT_ROWS_PER_SHEET) {
            let line = row.iter().map(|c| c.to_string()).collect::<Vec<_>>().join("\t");
            let _ = writeln!(content, "{}", line.trim_end());
        }
        if content.len() > CONTENT_MAX_CHARS {
            let mut cut = CONTENT_MAX_CHARS;
            while !content.is_char_boundary(cut) {
                cut -= 1;
            }
            content.truncate(cut);
            content.push_str("\n...");
            break;
        }
    }
    content
}
