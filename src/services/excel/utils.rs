use std::collections::HashSet;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use once_cell::sync::Lazy;
use regex::Regex;

use super::types::{parse_number, CellValue, ColumnType};

static DATE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^\d{4}-\d{1,2}-\d{1,2}(?:[ T]\d{1,2}:\d{2}(?::\d{2})?)?$",
        r"^\d{4}/\d{1,2}/\d{1,2}$",
        r"^\d{1,2}-\d{1,2}-\d{4}$",
        r"^\d{1,2}/\d{1,2}/\d{4}$",
        r"^\d{1,2}\.\d{1,2}\.\d{4}$",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

const DATE_FORMATS: [&str; 6] = [
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%d-%m-%Y",
    "%d/%m/%Y",
    "%m/%d/%Y",
    "%d.%m.%Y",
];

const DATETIME_FORMATS: [&str; 4] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"];

pub fn clean_column_name(name: &str, existing_names: &mut HashSet<String>) -> String {
    let base_name = name
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect::<String>()
        .to_lowercase();

    let mut cleaned = if base_name.chars().next().map_or(true, |c| !c.is_alphabetic()) {
        format!("col_{}", base_name)
    } else {
        base_name
    };

    // If the name already exists, add a numeric suffix
    let mut counter = 1;
    let original_name = cleaned.clone();
    while !existing_names.insert(cleaned.clone()) {
        cleaned = format!("{}_{}", original_name, counter);
        counter += 1;
    }

    cleaned
}

pub fn is_date_string(s: &str) -> bool {
    let s = s.trim();
    DATE_PATTERNS.iter().any(|re| re.is_match(s))
}

pub fn parse_date_string(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if !is_date_string(s) {
        return None;
    }
    for format in DATETIME_FORMATS.iter() {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt);
        }
    }
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(s, format).ok())
        .map(|d| d.and_time(NaiveTime::MIN))
}

/// Converts an Excel serial day number (1900 date system) to a timestamp.
pub fn excel_serial_to_datetime(serial: f64) -> Option<NaiveDateTime> {
    if !serial.is_finite() || serial < 0.0 {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_time(NaiveTime::MIN);
    let millis = (serial * 86_400_000.0).round() as i64;
    epoch.checked_add_signed(chrono::Duration::milliseconds(millis))
}

pub fn is_boolean_word(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "true" | "false" | "yes" | "no"
    )
}

/// Per-cell type vote used by column inference. Empty cells do not vote.
pub fn classify_cell(value: &CellValue) -> Option<ColumnType> {
    match value {
        CellValue::Empty => None,
        CellValue::Number(_) => Some(ColumnType::Number),
        CellValue::Date(_) => Some(ColumnType::Date),
        CellValue::Bool(_) => Some(ColumnType::Boolean),
        CellValue::Error(_) => Some(ColumnType::Text),
        CellValue::Text(s) => {
            let s = s.trim();
            if s.is_empty() {
                None
            } else if is_boolean_word(s) {
                Some(ColumnType::Boolean)
            } else if parse_date_string(s).is_some() {
                Some(ColumnType::Date)
            } else if parse_number(s).is_some() {
                Some(ColumnType::Number)
            } else {
                Some(ColumnType::Text)
            }
        }
    }
}

pub fn cell_as_date(value: &CellValue) -> Option<NaiveDateTime> {
    match value {
        CellValue::Date(d) => Some(*d),
        CellValue::Text(s) => parse_date_string(s),
        _ => None,
    }
}

pub fn weekday_label(date: &NaiveDateTime) -> String {
    date.weekday().to_string()
}

/// True when a non-empty cell counts as header-like text.
pub fn is_text_cell(value: &CellValue) -> bool {
    matches!(classify_cell(value), Some(ColumnType::Text))
}
