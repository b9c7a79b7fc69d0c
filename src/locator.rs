//! Heuristic detection of rectangular header + data tables inside a sheet.
//!
//! Rows are scanned top to bottom. A header candidate is a row made mostly of labels; it
//! opens a table only when a mostly numeric row follows within `max_header_gap` rows. The
//! table runs until the first row that is empty inside the table's columns or whose cells
//! fall mostly outside them. Trailing rows without values are trimmed. Header-like rows
//! met while a table is open stay inside it as anomaly rows.

use crate::config::LocatorConfig;
use crate::normalizer::{parse_date, parse_number};
use crate::workbook::{CellValue, Sheet};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::RangeInclusive;

/// Inclusive, 0-based cell rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: u32,
    pub left: u32,
    pub bottom: u32,
    pub right: u32,
}

impl BoundingBox {
    pub fn width(&self) -> u32 {
        self.right - self.left + 1
    }

    /// Spreadsheet notation, e.g. `B3:D10`.
    pub fn a1(&self) -> String {
        format!(
            "{}{}:{}{}",
            column_letter(self.left),
            self.top + 1,
            column_letter(self.right),
            self.bottom + 1
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRegion {
    pub sheet_index: usize,
    pub sheet_name: String,
    pub bbox: BoundingBox,
    /// One label per column of `bbox`, taken from the top row.
    pub headers: Vec<String>,
}

impl TableRegion {
    pub fn data_rows(&self) -> RangeInclusive<u32> {
        self.bbox.top + 1..=self.bbox.bottom
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellKind {
    Empty,
    Label,
    Value,
}

fn classify(value: &CellValue, header_context: bool) -> CellKind {
    match value {
        CellValue::Empty => CellKind::Empty,
        CellValue::Bool(_) => CellKind::Label,
        CellValue::Error(_) => CellKind::Value,
        CellValue::Date(_) if header_context => CellKind::Label,
        CellValue::Date(_) => CellKind::Value,
        CellValue::Number(n) if header_context && is_year(*n) => CellKind::Label,
        CellValue::Number(_) => CellKind::Value,
        CellValue::Text(text) if text.trim().is_empty() => CellKind::Empty,
        CellValue::Text(text) => match parse_number(text) {
            Some(n) if header_context && is_year(n) => CellKind::Label,
            Some(_) => CellKind::Value,
            None if parse_date(text).is_some() && !header_context => CellKind::Value,
            None => CellKind::Label,
        },
    }
}

/// Period headers such as `2023` are labels, not data.
fn is_year(n: f64) -> bool {
    n.fract() == 0.0 && (1900.0..=2100.0).contains(&n)
}

/// Cell kinds of one row restricted to a column window.
struct RowProfile {
    cols: Vec<(u32, CellKind)>,
}

impl RowProfile {
    fn new(sheet: &Sheet, row: u32, cols: RangeInclusive<u32>, header_context: bool) -> Self {
        let cols = cols
            .filter_map(|col| match classify(sheet.resolved_value(row, col), header_context) {
                CellKind::Empty => None,
                kind => Some((col, kind)),
            })
            .collect();
        Self { cols }
    }

    fn is_empty(&self) -> bool {
        self.cols.is_empty()
    }

    fn count(&self, kind: CellKind) -> usize {
        self.cols.iter().filter(|(_, k)| *k == kind).count()
    }

    fn ratio(&self, kind: CellKind) -> f64 {
        if self.cols.is_empty() {
            0.0
        } else {
            self.count(kind) as f64 / self.cols.len() as f64
        }
    }

    fn first_col(&self) -> Option<u32> {
        self.cols.first().map(|(c, _)| *c)
    }

    fn last_col(&self) -> Option<u32> {
        self.cols.last().map(|(c, _)| *c)
    }
}

pub struct TableLocator {
    config: LocatorConfig,
}

impl TableLocator {
    pub fn new(config: LocatorConfig) -> Self {
        Self { config }
    }

    /// Returns the sheet's table regions in top-to-bottom order. An empty result is not an error.
    pub fn locate(&self, sheet: &Sheet) -> Vec<TableRegion> {
        let full_width = match sheet.width() {
            0 => return Vec::new(),
            w => 0..=w - 1,
        };
        let mut regions = Vec::new();
        let mut row = 0;

        while row < sheet.height() {
            let header = RowProfile::new(sheet, row, full_width.clone(), true);
            if !self.is_header(&header) {
                row += 1;
                continue;
            }

            match self.extend_region(sheet, row, &header) {
                Some(region) => {
                    debug!(
                        "Sheet '{}': table at {} with {} column(s)",
                        sheet.name,
                        region.bbox.a1(),
                        region.headers.len()
                    );
                    row = region.bbox.bottom + 1;
                    regions.push(region);
                }
                None => row += 1,
            }
        }

        regions
    }

    fn is_header(&self, profile: &RowProfile) -> bool {
        profile.cols.len() >= self.config.min_header_cells
            && profile.ratio(CellKind::Label) >= self.config.header_text_ratio
    }

    fn is_data(&self, profile: &RowProfile, header_cols: &[u32]) -> bool {
        let under_header = profile
            .cols
            .iter()
            .any(|(c, k)| *k == CellKind::Value && header_cols.contains(c));
        under_header && profile.ratio(CellKind::Value) >= self.config.data_numeric_ratio
    }

    fn extend_region(
        &self,
        sheet: &Sheet,
        header_row: u32,
        header: &RowProfile,
    ) -> Option<TableRegion> {
        let header_cols: Vec<u32> = header.cols.iter().map(|(c, _)| *c).collect();
        let (header_first, header_last) = (header.first_col()?, header.last_col()?);

        // First data row, allowing a few anomaly rows in between.
        let mut first_data = None;
        let last_probe = header_row + 1 + self.config.max_header_gap as u32;
        for probe in header_row + 1..=last_probe.min(sheet.height().saturating_sub(1)) {
            let profile = RowProfile::new(sheet, probe, 0..=header_last, false);
            if profile.is_empty() {
                break;
            }
            if self.is_data(&profile, &header_cols) {
                // A caption above the real header: let the scan reopen the table one row lower.
                let own_header = RowProfile::new(sheet, probe, 0..=sheet.width() - 1, true);
                if self.is_header(&own_header) {
                    return None;
                }
                first_data = Some((probe, profile));
                break;
            }
        }
        let (first_data_row, first_profile) = first_data?;

        let left = header_first.min(first_profile.first_col().unwrap_or(header_first));
        let right = header_last;
        let mut last_data_row = first_data_row;

        for row in first_data_row + 1..sheet.height() {
            let inside = RowProfile::new(sheet, row, left..=right, false);
            if inside.is_empty() {
                break;
            }
            let everywhere = RowProfile::new(sheet, row, 0..=sheet.width() - 1, false);
            let outside = everywhere.cols.len() - inside.cols.len();
            if outside * 2 > everywhere.cols.len() {
                break;
            }
            if self.is_data(&inside, &header_cols) {
                last_data_row = row;
            }
        }

        let bbox = BoundingBox {
            top: header_row,
            left,
            bottom: last_data_row,
            right,
        };
        let headers = header_labels(sheet, header_row, left..=right);
        debug_assert_eq!(headers.len() as u32, bbox.width());

        Some(TableRegion {
            sheet_index: sheet.index,
            sheet_name: sheet.name.clone(),
            bbox,
            headers,
        })
    }
}

fn header_labels(sheet: &Sheet, row: u32, cols: RangeInclusive<u32>) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    cols.map(|col| {
        let label = match sheet.resolved_value(row, col) {
            CellValue::Text(t) if !t.trim().is_empty() => t.trim().to_string(),
            CellValue::Number(n) if n.fract() == 0.0 => format!("{}", *n as i64),
            CellValue::Number(n) => n.to_string(),
            CellValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            CellValue::Bool(b) => b.to_string(),
            _ => format!("Column {}", column_letter(col)),
        };
        let count = seen.entry(label.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            format!("{} ({})", label, count)
        } else {
            label
        }
    })
    .collect()
}

/// 0-based column index to spreadsheet letters (0 → A, 26 → AA).
pub fn column_letter(col: u32) -> String {
    let mut n = col + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = ((n - 1) % 26) as u8;
        letters.push((b'A' + rem) as char);
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> CellValue {
        CellValue::Text(s.to_string())
    }

    fn n(v: f64) -> CellValue {
        CellValue::Number(v)
    }

    const E: CellValue = CellValue::Empty;

    fn locate(rows: Vec<Vec<CellValue>>) -> Vec<TableRegion> {
        let sheet = Sheet::from_values("Sheet1", 0, rows);
        TableLocator::new(LocatorConfig::default()).locate(&sheet)
    }

    #[test]
    fn test_finds_table_below_title() {
        let regions = locate(vec![
            vec![t("Acme Ltd - Statement of Financial Position")],
            vec![],
            vec![t("Item"), t("2023"), t("2022")],
            vec![t("Current assets"), t("$1,000"), n(900.0)],
            vec![t("Prepaid expenses"), n(120.0), n(80.0)],
            vec![t("Deferred tax assets"), n(30.0), t("(10)")],
            vec![],
            vec![t("Approved by the board")],
        ]);

        assert_eq!(regions.len(), 1);
        let region = &regions[0];
        assert_eq!(
            region.bbox,
            BoundingBox {
                top: 2,
                left: 0,
                bottom: 5,
                right: 2
            }
        );
        assert_eq!(region.headers, vec!["Item", "2023", "2022"]);
        assert_eq!(region.bbox.a1(), "A3:C6");
        assert_eq!(region.data_rows().count(), 3);
    }

    #[test]
    fn test_caption_row_does_not_replace_header() {
        let regions = locate(vec![
            vec![t("Statement of financial position"), t("AUD thousands")],
            vec![t("Item"), t("2023"), t("2022")],
            vec![t("Current assets"), n(100.0), n(90.0)],
            vec![t("Non-current assets"), n(40.0), n(35.0)],
        ]);

        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].headers, vec!["Item", "2023", "2022"]);
        assert_eq!(
            regions[0].bbox,
            BoundingBox {
                top: 1,
                left: 0,
                bottom: 3,
                right: 2
            }
        );
    }

    #[test]
    fn test_numeric_year_headers_count_as_labels() {
        let regions = locate(vec![
            vec![t("Metric"), n(2023.0), n(2022.0)],
            vec![t("Current assets"), n(500.0), n(450.0)],
        ]);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].headers, vec!["Metric", "2023", "2022"]);
    }

    #[test]
    fn test_multiple_tables_in_order() {
        let regions = locate(vec![
            vec![t("Asset"), t("Amount")],
            vec![t("Cash"), n(10.0)],
            vec![t("Receivables"), n(20.0)],
            vec![],
            vec![t("Liability"), t("Amount")],
            vec![t("Payables"), n(5.0)],
        ]);

        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].bbox.top, 0);
        assert_eq!(regions[0].bbox.bottom, 2);
        assert_eq!(regions[1].bbox.top, 4);
        assert_eq!(regions[1].bbox.bottom, 5);
        assert_eq!(regions[1].headers, vec!["Liability", "Amount"]);
    }

    #[test]
    fn test_label_column_without_header_is_included() {
        let regions = locate(vec![
            vec![E, t("FY2023"), t("FY2022")],
            vec![t("Current assets"), n(1.0), n(2.0)],
            vec![t("Non-current assets"), n(3.0), n(4.0)],
        ]);

        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].bbox.left, 0);
        assert_eq!(regions[0].headers, vec!["Column A", "FY2023", "FY2022"]);
    }

    #[test]
    fn test_overlapping_header_rows_stay_in_first_table() {
        let regions = locate(vec![
            vec![t("Item"), t("2023"), t("2023")],
            vec![E, t("Actual"), t("Budget")],
            vec![t("Revenue"), n(100.0), n(90.0)],
            vec![t("Operating costs"), t("Actual"), t("Budget")],
            vec![t("Salaries"), n(40.0), n(42.0)],
        ]);

        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].bbox.top, 0);
        assert_eq!(regions[0].bbox.bottom, 4);
        assert_eq!(regions[0].headers, vec!["Item", "2023", "2023 (2)"]);
    }

    #[test]
    fn test_text_only_sheet_has_no_tables() {
        let regions = locate(vec![
            vec![t("Notes to the financial statements")],
            vec![t("Basis of preparation"), t("These statements are prepared...")],
            vec![t("Going concern"), t("The directors consider...")],
        ]);
        assert!(regions.is_empty());
        assert!(locate(Vec::new()).is_empty());
    }

    #[test]
    fn test_trailing_text_rows_are_trimmed() {
        let regions = locate(vec![
            vec![t("Item"), t("Amount")],
            vec![t("Cash"), n(10.0)],
            vec![t("* unaudited"), E],
        ]);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].bbox.bottom, 1);
    }

    #[test]
    fn test_row_outside_layout_ends_table() {
        let regions = locate(vec![
            vec![t("Item"), t("Amount"), E, E, E],
            vec![t("Cash"), n(10.0), E, E, E],
            vec![t("Bank"), n(5.0), n(1.0), n(2.0), n(3.0)],
            vec![t("Debtors"), n(7.0), E, E, E],
        ]);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].bbox.bottom, 1);
    }

    #[test]
    fn test_column_letters() {
        assert_eq!(column_letter(0), "A");
        assert_eq!(column_letter(25), "Z");
        assert_eq!(column_letter(26), "AA");
        assert_eq!(column_letter(701), "ZZ");
    }
}
