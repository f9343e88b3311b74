use std::io::{Cursor, Read};

use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use zip::ZipArchive;

use super::types::{SheetFormat, WorkbookMetadata};
use crate::error::EngineError;

static CREATOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<dc:creator[^>]*>(.*?)</dc:creator>").expect("valid regex"));
static TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<dc:title[^>]*>(.*?)</dc:title>").expect("valid regex"));

/// Reads one part of a zip container into a string.
pub fn read_zip_entry(
    archive: &mut ZipArchive<Cursor<Bytes>>,
    name: &str,
) -> Result<Option<String>, EngineError> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut content = String::new();
    entry.read_to_string(&mut content)?;
    Ok(Some(content))
}

pub fn unescape_xml(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Document properties and feature flags that don't depend on cell decoding.
pub fn inspect(data: &Bytes, format: SheetFormat) -> WorkbookMetadata {
    let result = if format.is_zip_container() {
        inspect_container(data)
    } else {
        Ok(inspect_legacy(data))
    };
    result.unwrap_or_else(|e| {
        tracing::debug!("Metadata inspection failed: {}", e);
        WorkbookMetadata::default()
    })
}

fn inspect_container(data: &Bytes) -> Result<WorkbookMetadata, EngineError> {
    let mut archive = ZipArchive::new(Cursor::new(data.clone()))?;
    let mut metadata = WorkbookMetadata::default();

    for name in archive.file_names() {
        if name.starts_with("xl/charts/") {
            metadata.has_charts = true;
        } else if name.starts_with("xl/media/") {
            metadata.has_images = true;
        } else if name.ends_with("vbaProject.bin") {
            metadata.has_macros = true;
        }
    }

    if let Some(core) = read_zip_entry(&mut archive, "docProps/core.xml")? {
        metadata.author = capture_text(&CREATOR_RE, &core);
        metadata.title = capture_text(&TITLE_RE, &core);
    }

    Ok(metadata)
}

fn capture_text(re: &Regex, haystack: &str) -> Option<String> {
    re.captures(haystack)
        .and_then(|c| c.get(1))
        .map(|m| unescape_xml(m.as_str().trim()))
        .filter(|s| !s.is_empty())
}

fn inspect_legacy(data: &[u8]) -> WorkbookMetadata {
    let marker: Vec<u8> = "_VBA_PROJECT".encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
    WorkbookMetadata {
        has_macros: data.windows(marker.len()).any(|w| w == marker.as_slice()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    fn container(parts: &[(&str, &str)]) -> Bytes {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in parts {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        Bytes::from(writer.finish().unwrap().into_inner())
    }

    #[test]
    fn reads_core_properties_and_features() {
        let data = container(&[
            (
                "docProps/core.xml",
                "<cp:coreProperties><dc:title>Q1 Budget</dc:title><dc:creator>Finance &amp; Ops</dc:creator></cp:coreProperties>",
            ),
            ("xl/charts/chart1.xml", "<c/>"),
            ("xl/vbaProject.bin", "bin"),
        ]);
        let metadata = inspect(&data, SheetFormat::Xlsm);
        assert_eq!(metadata.title.as_deref(), Some("Q1 Budget"));
        assert_eq!(metadata.author.as_deref(), Some("Finance & Ops"));
        assert!(metadata.has_charts);
        assert!(metadata.has_macros);
        assert!(!metadata.has_images);
    }

    #[test]
    fn legacy_macro_marker() {
        let mut data = b"header".to_vec();
        data.extend("_VBA_PROJECT".encode_utf16().flat_map(|u| u.to_le_bytes()));
        assert!(inspect(&Bytes::from(data), SheetFormat::Xls).has_macros);
    }
}
