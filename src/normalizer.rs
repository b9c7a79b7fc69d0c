//! Converts raw cells of a located table into canonical typed values.
//!
//! Normalization never fails: anything that cannot be typed stays a string and is flagged
//! so validation can judge whether it matters.

use crate::locator::TableRegion;
use crate::workbook::{CellValue, Sheet};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

const CURRENCY_SYMBOLS: [char; 5] = ['$', '€', '£', '¥', '₹'];
const CURRENCY_CODES: [&str; 7] = ["USD", "EUR", "GBP", "AUD", "CAD", "NZD", "US"];
const NULL_MARKERS: [&str; 6] = ["-", "–", "—", "n/a", "na", "nil"];

const DATE_FORMATS: [&str; 11] = [
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%d/%m/%Y",
    "%d.%m.%Y",
    "%d-%b-%Y",
    "%d %b %Y",
    "%d %B %Y",
    "%b %d, %Y",
    "%B %d, %Y",
    "%b %d %Y",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NormalizedValue {
    Null,
    Boolean(bool),
    Number(f64),
    Date(NaiveDate),
    String(String),
}

impl NormalizedValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellFlag {
    /// Text that sits in a numeric or date column but matched no typing rule.
    Untyped,
    /// The source cell held a formula error.
    FormulaError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedCell {
    pub column: String,
    pub value: NormalizedValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag: Option<CellFlag>,
}

/// One data row of a table, keyed by the region's header labels in column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRow {
    /// 0-based row index in the source sheet.
    pub source_row: u32,
    pub cells: Vec<NormalizedCell>,
}

impl NormalizedRow {
    pub fn get(&self, column: &str) -> Option<&NormalizedValue> {
        self.cells
            .iter()
            .find(|cell| cell.column == column)
            .map(|cell| &cell.value)
    }

    pub fn has_flags(&self) -> bool {
        self.cells.iter().any(|cell| cell.flag.is_some())
    }
}

/// Normalizes every data row of `region`. Merged cells take their anchor's value first.
pub fn normalize_region(sheet: &Sheet, region: &TableRegion) -> Vec<NormalizedRow> {
    let bbox = &region.bbox;
    let mut rows: Vec<NormalizedRow> = region
        .data_rows()
        .map(|row| NormalizedRow {
            source_row: row,
            cells: (bbox.left..=bbox.right)
                .zip(region.headers.iter())
                .map(|(col, label)| {
                    let (value, flag) = normalize_cell(sheet.resolved_value(row, col));
                    NormalizedCell {
                        column: label.clone(),
                        value,
                        flag,
                    }
                })
                .collect(),
        })
        .collect();

    flag_untyped_strings(&mut rows, region.headers.len());
    rows
}

/// Strings in a column whose typed values are mostly numbers or dates are flagged.
fn flag_untyped_strings(rows: &mut [NormalizedRow], width: usize) {
    for col in 0..width {
        let (mut typed, mut strings) = (0usize, 0usize);
        for row in rows.iter() {
            match row.cells.get(col).map(|c| &c.value) {
                Some(NormalizedValue::Number(_)) | Some(NormalizedValue::Date(_)) => typed += 1,
                Some(NormalizedValue::String(_)) => strings += 1,
                _ => {}
            }
        }
        if typed > strings {
            for cell in rows.iter_mut().filter_map(|row| row.cells.get_mut(col)) {
                if matches!(cell.value, NormalizedValue::String(_)) && cell.flag.is_none() {
                    cell.flag = Some(CellFlag::Untyped);
                }
            }
        }
    }
}

pub fn normalize_cell(raw: &CellValue) -> (NormalizedValue, Option<CellFlag>) {
    match raw {
        CellValue::Empty => (NormalizedValue::Null, None),
        CellValue::Number(n) if n.is_finite() => (NormalizedValue::Number(*n), None),
        CellValue::Number(n) => (NormalizedValue::String(n.to_string()), Some(CellFlag::Untyped)),
        CellValue::Date(d) => (NormalizedValue::Date(*d), None),
        CellValue::Bool(b) => (NormalizedValue::Boolean(*b), None),
        CellValue::Error(_) => (NormalizedValue::Null, Some(CellFlag::FormulaError)),
        CellValue::Text(text) => (normalize_text(text), None),
    }
}

pub fn normalize_text(raw: &str) -> NormalizedValue {
    let text = raw.trim();
    if text.is_empty() || NULL_MARKERS.iter().any(|m| text.eq_ignore_ascii_case(m)) {
        return NormalizedValue::Null;
    }
    if text.eq_ignore_ascii_case("true") {
        return NormalizedValue::Boolean(true);
    }
    if text.eq_ignore_ascii_case("false") {
        return NormalizedValue::Boolean(false);
    }
    if let Some(n) = parse_number(text) {
        return NormalizedValue::Number(n);
    }
    if let Some(d) = parse_date(text) {
        return NormalizedValue::Date(d);
    }
    NormalizedValue::String(text.to_string())
}

/// Parses accounting-style numbers: currency symbols or codes, thousands separators,
/// parenthesized or signed negatives and trailing percent signs.
pub fn parse_number(raw: &str) -> Option<f64> {
    let mut text = raw.trim();
    let mut negative = false;
    let mut parenthesized = false;

    loop {
        let before = text;
        if !parenthesized {
            if let Some(inner) = text.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
                parenthesized = true;
                negative = !negative;
                text = inner;
            }
        }
        if let Some(rest) = text
            .strip_prefix('-')
            .or_else(|| text.strip_prefix('\u{2212}'))
        {
            negative = !negative;
            text = rest;
        } else if let Some(rest) = text.strip_prefix('+') {
            text = rest;
        }
        text = strip_currency(text.trim()).trim();
        if text == before {
            break;
        }
    }

    let mut percent = false;
    if let Some(inner) = text.strip_suffix('%') {
        percent = true;
        text = inner.trim_end();
    }

    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, ' ' | '\u{a0}' | '\''))
        .collect();
    let (int_part, frac_part) = match cleaned.split_once('.') {
        Some((int_part, frac_part)) => (int_part, frac_part),
        None => (cleaned.as_str(), ""),
    };

    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !valid_integer_part(int_part) || !frac_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let literal = format!(
        "{}.{}",
        if int_part.is_empty() { "0".to_string() } else { int_part.replace(',', "") },
        if frac_part.is_empty() { "0" } else { frac_part }
    );
    let value: f64 = literal.parse().ok()?;
    let value = if negative { -value } else { value };
    Some(if percent { value / 100.0 } else { value })
}

fn strip_currency(text: &str) -> &str {
    let mut text = text;
    for code in CURRENCY_CODES {
        if let Some(rest) = text.strip_prefix(code) {
            text = rest.trim_start();
        }
        if let Some(rest) = text.strip_suffix(code) {
            text = rest.trim_end();
        }
    }
    text.trim_start_matches(&CURRENCY_SYMBOLS[..])
        .trim_end_matches(&CURRENCY_SYMBOLS[..])
}

/// Digits, optionally grouped in threes by commas.
fn valid_integer_part(int_part: &str) -> bool {
    if int_part.is_empty() {
        return true;
    }
    let all_digits = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    let mut groups = int_part.split(',');
    let first = groups.next().unwrap_or("");
    if !int_part.contains(',') {
        return all_digits(first);
    }
    (1..=3).contains(&first.len())
        && all_digits(first)
        && groups.all(|g| g.len() == 3 && all_digits(g))
}

/// Parses a textual date. Slash dates are tried month-first before day-first.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let text = raw.trim();
    let date_part = match text.char_indices().nth(10) {
        Some((idx, 'T')) | Some((idx, ' ')) if text[..idx].contains('-') => &text[..idx],
        _ => text,
    };
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date_part, fmt).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::{BoundingBox, TableRegion};
    use crate::workbook::MergeSpan;

    #[test]
    fn test_currency_and_parenthesized_negatives() {
        assert_eq!(parse_number("$1,234.50"), Some(1234.50));
        assert_eq!(parse_number("(200)"), Some(-200.0));
        assert_eq!(parse_number("($1,000)"), Some(-1000.0));
        assert_eq!(parse_number("-$5"), Some(-5.0));
        assert_eq!(parse_number("EUR 2 500"), Some(2500.0));
        assert_eq!(parse_number("£.75"), Some(0.75));
        assert_eq!(parse_number("12.5%"), Some(0.125));
        assert_eq!(parse_number("2023"), Some(2023.0));
    }

    #[test]
    fn test_rejects_non_numeric_text() {
        assert_eq!(parse_number("Cash at bank"), None);
        assert_eq!(parse_number("1,23"), None);
        assert_eq!(parse_number("1e5"), None);
        assert_eq!(parse_number("inf"), None);
        assert_eq!(parse_number("$"), None);
        assert_eq!(parse_number("()"), None);
        assert_eq!(parse_number("1.2.3"), None);
    }

    #[test]
    fn test_parse_dates() {
        let dec31 = NaiveDate::from_ymd_opt(2023, 12, 31).unwrap();
        assert_eq!(parse_date("2023-12-31"), Some(dec31));
        assert_eq!(parse_date("12/31/2023"), Some(dec31));
        assert_eq!(parse_date("31/12/2023"), Some(dec31));
        assert_eq!(parse_date("31 Dec 2023"), Some(dec31));
        assert_eq!(parse_date("December 31, 2023"), Some(dec31));
        assert_eq!(parse_date("2023-12-31T00:00:00"), Some(dec31));
        assert_eq!(
            parse_date("03/04/2023"),
            NaiveDate::from_ymd_opt(2023, 3, 4)
        );
        assert_eq!(parse_date("FY2023"), None);
    }

    #[test]
    fn test_normalize_text_rules() {
        assert_eq!(normalize_text("  "), NormalizedValue::Null);
        assert_eq!(normalize_text("—"), NormalizedValue::Null);
        assert_eq!(normalize_text("N/A"), NormalizedValue::Null);
        assert_eq!(normalize_text("TRUE"), NormalizedValue::Boolean(true));
        assert_eq!(normalize_text("$1,234.50"), NormalizedValue::Number(1234.5));
        assert_eq!(
            normalize_text("Prepaid expenses"),
            NormalizedValue::String("Prepaid expenses".to_string())
        );
    }

    #[test]
    fn test_formula_errors_become_flagged_nulls() {
        let (value, flag) = normalize_cell(&CellValue::Error("#DIV/0!".to_string()));
        assert_eq!(value, NormalizedValue::Null);
        assert_eq!(flag, Some(CellFlag::FormulaError));
    }

    fn text(s: &str) -> CellValue {
        CellValue::Text(s.to_string())
    }

    #[test]
    fn test_normalize_region_propagates_merges_and_flags() {
        let sheet = crate::workbook::Sheet::from_values(
            "BS",
            0,
            vec![
                vec![text("Item"), text("2023"), text("2022")],
                vec![text("Current assets"), text("$1,000"), CellValue::Number(900.0)],
                vec![text("Prepaid"), text("see note"), text("(50)")],
                vec![text("Deferred tax"), CellValue::Number(70.0), CellValue::Empty],
            ],
        )
        .with_merges(&[MergeSpan {
            top: 3,
            left: 1,
            bottom: 3,
            right: 2,
        }]);
        let region = TableRegion {
            sheet_index: 0,
            sheet_name: "BS".to_string(),
            bbox: BoundingBox {
                top: 0,
                left: 0,
                bottom: 3,
                right: 2,
            },
            headers: vec!["Item".into(), "2023".into(), "2022".into()],
        };

        let rows = normalize_region(&sheet, &region);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].source_row, 1);
        assert_eq!(rows[0].get("2023"), Some(&NormalizedValue::Number(1000.0)));
        assert_eq!(rows[1].get("2022"), Some(&NormalizedValue::Number(-50.0)));

        let note = &rows[1].cells[1];
        assert_eq!(note.value, NormalizedValue::String("see note".to_string()));
        assert_eq!(note.flag, Some(CellFlag::Untyped));
        assert!(rows[1].has_flags());
        assert_eq!(rows[0].cells[0].flag, None);

        assert_eq!(rows[2].get("2022"), Some(&NormalizedValue::Number(70.0)));
    }
}
