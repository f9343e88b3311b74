//! Pattern mining over categorical columns: frequent itemsets, association
//! rules, value transitions and contrast patterns between the two largest
//! classes of a column.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use super::correlation::CategoricalSeries;

const MIN_CONFIDENCE: f64 = 0.6;
const MIN_TRANSITIONS: usize = 2;
const MIN_CONTRAST: f64 = 0.2;
const MAX_REPORTED: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Itemset {
    pub items: Vec<String>,
    pub count: usize,
    pub support: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssociationRule {
    pub antecedent: String,
    pub consequent: String,
    pub support: f64,
    pub confidence: f64,
    pub lift: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SequentialPattern {
    pub column: String,
    pub from: String,
    pub to: String,
    pub count: usize,
    pub support: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContrastPattern {
    pub item: String,
    pub support_a: f64,
    pub support_b: f64,
    pub difference: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContrastReport {
    pub column: String,
    pub class_a: String,
    pub class_b: String,
    pub size_a: usize,
    pub size_b: usize,
    pub patterns: Vec<ContrastPattern>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternReport {
    pub min_support: f64,
    pub transactions: usize,
    pub frequent_itemsets: Vec<Itemset>,
    pub association_rules: Vec<AssociationRule>,
    pub sequential_patterns: Vec<SequentialPattern>,
    pub contrast: Option<ContrastReport>,
}

fn item(column: &str, value: &str) -> String {
    format!("{}={}", column, value)
}

/// One transaction per row: the set of `column=value` items present.
pub fn transactions(columns: &[CategoricalSeries<'_>]) -> Vec<BTreeSet<String>> {
    let rows = columns.iter().map(|c| c.values.len()).max().unwrap_or(0);
    (0..rows)
        .map(|r| {
            columns
                .iter()
                .filter_map(|c| c.values.get(r).and_then(|v| v.as_deref()).map(|v| item(c.name, v)))
                .collect()
        })
        .filter(|t: &BTreeSet<String>| !t.is_empty())
        .collect()
}

/// Frequent single items and pairs (Apriori pruned at the first level).
pub fn frequent_itemsets(transactions: &[BTreeSet<String>], min_support: f64) -> Vec<Itemset> {
    let n = transactions.len();
    if n == 0 {
        return Vec::new();
    }
    let support = |count: usize| count as f64 / n as f64;

    let mut singles: BTreeMap<&str, usize> = BTreeMap::new();
    for t in transactions {
        for i in t {
            *singles.entry(i.as_str()).or_default() += 1;
        }
    }
    let frequent: BTreeSet<&str> = singles
        .iter()
        .filter(|(_, c)| support(**c) >= min_support)
        .map(|(i, _)| *i)
        .collect();

    let mut pairs: BTreeMap<(&str, &str), usize> = BTreeMap::new();
    for t in transactions {
        let kept: Vec<&str> = t.iter().map(String::as_str).filter(|i| frequent.contains(i)).collect();
        for a in 0..kept.len() {
            for b in (a + 1)..kept.len() {
                *pairs.entry((kept[a], kept[b])).or_default() += 1;
            }
        }
    }

    let mut itemsets: Vec<Itemset> = frequent
        .iter()
        .map(|i| Itemset { items: vec![i.to_string()], count: singles[i], support: support(singles[i]) })
        .chain(pairs.into_iter().filter(|(_, c)| support(*c) >= min_support).map(|((a, b), count)| {
            Itemset { items: vec![a.to_string(), b.to_string()], count, support: support(count) }
        }))
        .collect();
    itemsets.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.items.cmp(&b.items)));
    itemsets
}

/// Rules `A -> B` from frequent pairs, both directions.
pub fn association_rules(itemsets: &[Itemset]) -> Vec<AssociationRule> {
    let singles: BTreeMap<&str, f64> = itemsets
        .iter()
        .filter(|s| s.items.len() == 1)
        .map(|s| (s.items[0].as_str(), s.support))
        .collect();
    let mut rules = Vec::new();
    for pair in itemsets.iter().filter(|s| s.items.len() == 2) {
        for (a, b) in [(&pair.items[0], &pair.items[1]), (&pair.items[1], &pair.items[0])] {
            let (Some(sa), Some(sb)) = (singles.get(a.as_str()), singles.get(b.as_str())) else {
                continue;
            };
            let confidence = pair.support / sa;
            if confidence >= MIN_CONFIDENCE {
                rules.push(AssociationRule {
                    antecedent: a.clone(),
                    consequent: b.clone(),
                    support: pair.support,
                    confidence,
                    lift: confidence / sb,
                });
            }
        }
    }
    rules.sort_by(|a, b| b.lift.total_cmp(&a.lift).then_with(|| a.antecedent.cmp(&b.antecedent)));
    rules.truncate(MAX_REPORTED);
    rules
}

/// Value changes between consecutive rows of each column. Rows must already
/// be in time order.
pub fn sequential_patterns(columns: &[CategoricalSeries<'_>], min_support: f64) -> Vec<SequentialPattern> {
    let mut patterns = Vec::new();
    for column in columns {
        let values: Vec<&str> = column.values.iter().filter_map(|v| v.as_deref()).collect();
        if values.len() < 3 {
            continue;
        }
        let mut transitions: BTreeMap<(&str, &str), usize> = BTreeMap::new();
        for w in values.windows(2) {
            if w[0] != w[1] {
                *transitions.entry((w[0], w[1])).or_default() += 1;
            }
        }
        let total = values.len() - 1;
        patterns.extend(transitions.into_iter().filter_map(|((from, to), count)| {
            let support = count as f64 / total as f64;
            (count >= MIN_TRANSITIONS && support >= min_support).then(|| SequentialPattern {
                column: column.name.to_string(),
                from: from.to_string(),
                to: to.to_string(),
                count,
                support,
            })
        }));
    }
    patterns.sort_by(|a, b| b.count.cmp(&a.count));
    patterns.truncate(MAX_REPORTED);
    patterns
}

/// Compares item supports between the two most frequent values of the
/// column with the fewest distinct values (at least two).
pub fn contrast_patterns(columns: &[CategoricalSeries<'_>]) -> Option<ContrastReport> {
    fn class_counts<'a>(c: &'a CategoricalSeries<'_>) -> BTreeMap<&'a str, usize> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for v in c.values.iter().flatten() {
            *counts.entry(v.as_str()).or_default() += 1;
        }
        counts
    }

    let (pivot, counts) = columns
        .iter()
        .map(|c| (c, class_counts(c)))
        .filter(|(_, counts)| counts.len() >= 2)
        .min_by_key(|(_, counts)| counts.len())?;

    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    let ((class_a, size_a), (class_b, size_b)) = (ranked[0], ranked[1]);

    let mut in_a: BTreeMap<String, usize> = BTreeMap::new();
    let mut in_b: BTreeMap<String, usize> = BTreeMap::new();
    for other in columns.iter().filter(|c| c.name != pivot.name) {
        for (class, value) in pivot.values.iter().zip(other.values.iter()) {
            let (Some(class), Some(value)) = (class, value) else { continue };
            let key = item(other.name, value);
            if class == class_a {
                *in_a.entry(key).or_default() += 1;
            } else if class == class_b {
                *in_b.entry(key).or_default() += 1;
            }
        }
    }

    let keys: BTreeSet<&String> = in_a.keys().chain(in_b.keys()).collect();
    let mut patterns: Vec<ContrastPattern> = keys
        .into_iter()
        .filter_map(|key| {
            let support_a = in_a.get(key).copied().unwrap_or(0) as f64 / size_a as f64;
            let support_b = in_b.get(key).copied().unwrap_or(0) as f64 / size_b as f64;
            let difference = support_a - support_b;
            (difference.abs() >= MIN_CONTRAST).then(|| ContrastPattern {
                item: key.clone(),
                support_a,
                support_b,
                difference,
            })
        })
        .collect();
    patterns.sort_by(|a, b| b.difference.abs().total_cmp(&a.difference.abs()));
    patterns.truncate(MAX_REPORTED);

    Some(ContrastReport {
        column: pivot.name.to_string(),
        class_a: class_a.to_string(),
        class_b: class_b.to_string(),
        size_a,
        size_b,
        patterns,
    })
}

pub fn analyze(columns: &[CategoricalSeries<'_>], min_support: f64) -> PatternReport {
    let transactions = transactions(columns);
    let frequent_itemsets = frequent_itemsets(&transactions, min_support);
    let association_rules = association_rules(&frequent_itemsets);
    PatternReport {
        min_support,
        transactions: transactions.len(),
        frequent_itemsets,
        association_rules,
        sequential_patterns: sequential_patterns(columns, min_support),
        contrast: contrast_patterns(columns),
    }
}
