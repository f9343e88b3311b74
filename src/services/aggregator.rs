use std::collections::{BTreeMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{AnalysisSection, BusinessInsights, ContentStatistics, PatternDetection, Structure};
use crate::services::excel::types::{CellValue, ColumnType, ParsedWorkbook, SheetProfile};
use crate::services::stats::AdvancedAnalysis;

/// Sheets with more rows than this are reported as large.
const LARGE_SHEET_ROWS: usize = 100_000;
/// Share of a column's text values that must match for a pattern to be reported.
const PATTERN_SHARE: f64 = 0.5;
const LANGUAGE_SAMPLE_WORDS: usize = 5_000;

static PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("email", r"^[\w.+-]+@[\w-]+(\.[\w-]+)+$"),
        ("url", r"^(?i)(https?://|www\.)\S+$"),
        ("phone", r"^\+?\(?\d[\d\s().-]{6,}\d$"),
        ("currency", r"^(?:[$€£¥]\s?-?[\d,]+(?:\.\d+)?|-?[\d,]+(?:\.\d+)?\s?(?:USD|EUR|GBP|BRL))$"),
        ("percentage", r"^-?\d+(?:[.,]\d+)?\s?%$"),
        ("identifier", r"^[A-Z]{2,5}[-_]?\d{3,}$"),
    ]
    .into_iter()
    .map(|(kind, pattern)| (kind, Regex::new(pattern).expect("valid regex")))
    .collect()
});

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\p{L}+").expect("valid regex"));

const STOPWORDS: &[(&str, &[&str])] = &[
    ("en", &["the", "and", "of", "to", "in", "for", "is", "with", "total", "date", "name"]),
    ("pt", &["de", "da", "do", "que", "não", "para", "por", "uma", "valor", "data", "nome"]),
    ("es", &["el", "la", "los", "las", "que", "para", "con", "una", "del", "fecha", "nombre"]),
    ("fr", &["le", "les", "des", "et", "pour", "avec", "une", "du", "montant", "nom"]),
    ("de", &["der", "die", "das", "und", "mit", "für", "ein", "eine", "datum", "betrag"]),
];

/// Totals across sheets. Sums and maxima only, so the order sheets or
/// chunks arrive in does not matter; details are sorted by workbook position.
pub fn build_structure(mut sheets: Vec<SheetProfile>) -> Structure {
    sheets.sort_by_key(|s| s.index);
    Structure {
        sheets: sheets.len(),
        total_rows: sheets.iter().map(|s| s.rows).sum(),
        total_columns: sheets.iter().map(|s| s.columns).max().unwrap_or(0),
        total_cells: sheets.iter().map(|s| s.cells).sum(),
        sheet_details: sheets,
    }
}

fn text_values(sheet: &SheetProfile, col: usize) -> impl Iterator<Item = &str> {
    sheet.data.iter().filter_map(move |row| match row.get(col) {
        Some(CellValue::Text(s)) if !s.trim().is_empty() => Some(s.trim()),
        _ => None,
    })
}

pub fn detect_patterns(sheets: &[SheetProfile]) -> Vec<PatternDetection> {
    let mut found = Vec::new();
    for sheet in sheets {
        for column in &sheet.column_profiles {
            // formatted numbers stored as text only say something about units
            let kinds: &[&str] = match column.inferred_type {
                ColumnType::Text | ColumnType::Mixed => &[],
                ColumnType::Number => &["currency", "percentage"],
                _ => continue,
            };
            let values: Vec<&str> = text_values(sheet, column.index).collect();
            if values.is_empty() {
                continue;
            }
            for (kind, regex) in PATTERNS.iter().filter(|(k, _)| kinds.is_empty() || kinds.contains(k)) {
                let matches = values.iter().filter(|v| regex.is_match(v)).count();
                if matches as f64 >= values.len() as f64 * PATTERN_SHARE {
                    found.push(PatternDetection {
                        kind: kind.to_string(),
                        sheet: sheet.name.clone(),
                        column: column.name.clone(),
                        matches,
                    });
                    break;
                }
            }
        }
    }
    found
}

/// Stopword vote over headers and text cells. `unknown` when nothing scores.
pub fn detect_language(sheets: &[SheetProfile]) -> String {
    let mut scores: BTreeMap<&str, usize> = BTreeMap::new();
    let words = sheets
        .iter()
        .flat_map(|s| {
            let cells = s.data.iter().flatten().filter_map(|c| match c {
                CellValue::Text(t) => Some(t.as_str()),
                _ => None,
            });
            s.headers.iter().map(String::as_str).chain(cells)
        })
        .flat_map(|text| WORD.find_iter(text).map(|m| m.as_str().to_lowercase()))
        .take(LANGUAGE_SAMPLE_WORDS);

    for word in words {
        for (lang, stopwords) in STOPWORDS {
            if stopwords.contains(&word.as_str()) {
                *scores.entry(*lang).or_insert(0) += 1;
            }
        }
    }
    scores
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(a.0)))
        .map(|(lang, _)| lang.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn content_statistics(sheets: &[SheetProfile]) -> ContentStatistics {
    let count = |kind: ColumnType| -> usize { sheets.iter().map(|s| s.columns_of(kind).count()).sum() };
    let total: usize = sheets.iter().map(|s| s.data.len() * s.columns).sum();
    let filled = sheets.iter().flat_map(|s| s.data.iter().flatten()).filter(|c| !c.is_empty()).count();
    ContentStatistics {
        numeric_columns: count(ColumnType::Number),
        text_columns: count(ColumnType::Text),
        date_columns: count(ColumnType::Date),
        filled_cells: filled,
        empty_cells: total - filled,
        fill_rate: if total == 0 { 0.0 } else { filled as f64 / total as f64 * 100.0 },
    }
}

fn qualified(sheet: &SheetProfile, column: &str) -> String {
    format!("{}!{}", sheet.name, column)
}

pub fn business_insights(
    sheets: &[SheetProfile],
    statistics: &ContentStatistics,
    patterns: &[PatternDetection],
    advanced: Option<&AdvancedAnalysis>,
) -> BusinessInsights {
    let readable: Vec<&SheetProfile> = sheets.iter().filter(|s| s.error.is_none()).collect();
    let total_columns: usize = readable.iter().map(|s| s.columns).sum();

    let empty_columns: Vec<String> = readable
        .iter()
        .flat_map(|s| s.columns_of(ColumnType::Empty).map(move |c| qualified(s, &c.name)))
        .collect();
    let mixed_type_columns: Vec<String> = readable
        .iter()
        .flat_map(|s| s.columns_of(ColumnType::Mixed).map(move |c| qualified(s, &c.name)))
        .collect();
    let large_sheets: Vec<String> = readable
        .iter()
        .filter(|s| s.rows > LARGE_SHEET_ROWS)
        .map(|s| s.name.clone())
        .collect();

    let data_quality_score = if total_columns == 0 {
        0.0
    } else {
        let fill = statistics.fill_rate / 100.0;
        let consistent = 1.0 - mixed_type_columns.len() as f64 / total_columns as f64;
        let populated = 1.0 - empty_columns.len() as f64 / total_columns as f64;
        ((0.6 * fill + 0.25 * consistent + 0.15 * populated) * 1000.0).round() / 10.0
    };

    let mut insights = Vec::new();
    let rows: usize = readable.iter().map(|s| s.rows).sum();
    insights.push(format!("{} readable sheet(s) with {} rows in total", readable.len(), rows));
    if statistics.numeric_columns > 0 {
        insights.push(format!("{} numeric column(s) available for quantitative analysis", statistics.numeric_columns));
    }
    if statistics.date_columns > 0 {
        insights.push(format!("{} date column(s) allow time-based analysis", statistics.date_columns));
    }
    let kinds: HashSet<&str> = patterns.iter().map(|p| p.kind.as_str()).collect();
    if kinds.contains("email") || kinds.contains("phone") {
        insights.push("Contact information detected; the workbook may hold personal data".to_string());
    }
    if kinds.contains("currency") {
        insights.push("Currency values stored as text detected".to_string());
    }
    for sheet in readable.iter().filter(|s| s.sampling.coverage < 100.0) {
        insights.push(format!(
            "Sheet '{}' was sampled ({:.1}% of {} rows analyzed)",
            sheet.name, sheet.sampling.coverage, sheet.sampling.original_rows
        ));
    }
    if let Some(advanced) = advanced {
        let summary = &advanced.summary;
        if summary.total_anomalies > 0 {
            insights.push(format!(
                "{} anomalies found, {} of them critical",
                summary.total_anomalies, summary.critical_anomalies
            ));
        }
        if summary.strong_correlations > 0 {
            insights.push(format!("{} strong correlation(s) between columns", summary.strong_correlations));
        }
    }

    let mut recommendations = Vec::new();
    if !empty_columns.is_empty() {
        recommendations.push(format!("Remove or fill {} empty column(s)", empty_columns.len()));
    }
    if !mixed_type_columns.is_empty() {
        recommendations.push(format!(
            "Standardize value types in mixed columns: {}",
            mixed_type_columns.join(", ")
        ));
    }
    if total_columns > 0 && statistics.fill_rate < 80.0 {
        recommendations.push(format!(
            "Review missing values; {:.1}% of data cells are empty",
            100.0 - statistics.fill_rate
        ));
    }
    if !large_sheets.is_empty() {
        recommendations.push("Consider splitting large sheets or moving them to a database".to_string());
    }
    let failed: Vec<&str> = sheets.iter().filter(|s| s.error.is_some()).map(|s| s.name.as_str()).collect();
    if !failed.is_empty() {
        recommendations.push(format!("Check unreadable sheets: {}", failed.join(", ")));
    }
    if advanced.is_none() && statistics.numeric_columns >= 2 {
        recommendations.push("Enable advanced analysis to explore correlations and anomalies".to_string());
    }

    BusinessInsights {
        data_quality_score,
        empty_columns,
        large_sheets,
        mixed_type_columns,
        insights,
        recommendations,
    }
}

/// The `analysis` section of a result. Only reads parser fields every tier
/// fills, so the decoder that produced them does not matter.
pub fn analysis_section(
    sheets: &[SheetProfile],
    parsed: &ParsedWorkbook,
    advanced: Option<&AdvancedAnalysis>,
) -> AnalysisSection {
    let mut data_types = BTreeMap::new();
    for sheet in sheets {
        for (kind, count) in &sheet.data_types {
            *data_types.entry(*kind).or_insert(0) += count;
        }
    }
    let patterns = detect_patterns(sheets);
    let statistics = content_statistics(sheets);
    let business_insights = business_insights(sheets, &statistics, &patterns, advanced);

    AnalysisSection {
        language: detect_language(sheets),
        data_types,
        patterns,
        statistics,
        business_insights,
        confidence: parsed.confidence,
        extraction_method: parsed.extraction_method,
        fallbacks: parsed.fallbacks.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalysisOptions;
    use crate::services::excel::analyzer::SheetAnalyzer;
    use crate::services::excel::types::RawSheet;

    fn text(s: &str) -> CellValue {
        CellValue::Text(s.to_string())
    }

    fn sheet(name: &str, index: usize, rows: Vec<Vec<CellValue>>) -> SheetProfile {
        let options = AnalysisOptions::default();
        let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
        let raw = RawSheet { name: name.into(), index, total_columns: columns, rows, ..Default::default() };
        SheetAnalyzer::new(&options).analyze(&raw)
    }

    fn contacts() -> SheetProfile {
        let mut rows = vec![vec![text("Name"), text("Email"), text("Amount")]];
        for i in 0..10 {
            rows.push(vec![
                text(&format!("Person {}", i)),
                text(&format!("person{}@example.com", i)),
                CellValue::Number(i as f64 * 10.0),
            ]);
        }
        sheet("Contacts", 0, rows)
    }

    #[test]
    fn structure_is_order_independent() {
        let a = sheet("A", 0, vec![vec![text("x"), text("y")], vec![CellValue::Number(1.0), CellValue::Number(2.0)]]);
        let b = sheet("B", 1, vec![vec![text("x")], vec![CellValue::Number(1.0)], vec![CellValue::Number(3.0)]]);
        let forward = build_structure(vec![a.clone(), b.clone()]);
        let backward = build_structure(vec![b, a]);
        assert_eq!(forward, backward);
        assert_eq!(forward.total_rows, 5);
        assert_eq!(forward.total_columns, 2);
        assert_eq!(forward.total_cells, 4 + 3);
        assert_eq!(forward.sheet_details[0].name, "A");
    }

    #[test]
    fn email_column_is_detected() {
        let patterns = detect_patterns(&[contacts()]);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].kind, "email");
        assert_eq!(patterns[0].column, "Email");
        assert_eq!(patterns[0].matches, 10);
    }

    #[test]
    fn currency_text_in_numeric_column() {
        let mut rows = vec![vec![text("Price")]];
        rows.extend(["$10", "$12.50", "$1,200"].iter().map(|v| vec![text(v)]));
        let patterns = detect_patterns(&[sheet("Prices", 0, rows)]);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].kind, "currency");
        assert_eq!(patterns[0].matches, 3);
    }

    #[test]
    fn language_vote() {
        let pt = sheet("P", 0, vec![vec![text("Nome do cliente"), text("Valor da venda")], vec![text("João da Silva"), text("para")]]);
        assert_eq!(detect_language(&[pt]), "pt");
        assert_eq!(detect_language(&[contacts()]), "en");
        let numbers = sheet("N", 0, vec![vec![CellValue::Number(1.0)]]);
        assert_eq!(detect_language(&[numbers]), "unknown");
    }

    #[test]
    fn insights_reflect_quality() {
        let mut rows = vec![vec![text("Id"), text("Notes"), text("Mixed")]];
        for i in 0..10 {
            let mixed = if i % 2 == 0 { CellValue::Number(i as f64) } else { text("n/a") };
            rows.push(vec![CellValue::Number(i as f64), CellValue::Empty, mixed]);
        }
        let sheets = vec![sheet("Data", 0, rows)];
        let statistics = content_statistics(&sheets);
        assert_eq!(statistics.filled_cells, 20);
        assert_eq!(statistics.empty_cells, 10);

        let insights = business_insights(&sheets, &statistics, &[], None);
        assert_eq!(insights.empty_columns, vec!["Data!Notes"]);
        assert_eq!(insights.mixed_type_columns, vec!["Data!Mixed"]);
        assert!(insights.data_quality_score > 0.0 && insights.data_quality_score < 100.0);
        assert!(insights.recommendations.iter().any(|r| r.starts_with("Remove or fill 1")));
        assert!(insights.recommendations.iter().any(|r| r.contains("Data!Mixed")));
    }
}
