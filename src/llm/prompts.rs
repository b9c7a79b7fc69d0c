// Prompt text for table-level metric extraction

use crate::llm::types::{ExtractionRequest, Truncation};
use crate::normalizer::{NormalizedRow, NormalizedValue};
use std::fmt::Write;

pub const DEFAULT_SYSTEM_PROMPT: &str = r#"
You are a Financial Statement Analyst extracting structured metrics from spreadsheet tables.

## YOUR MISSION
You receive ONE table taken from a spreadsheet, already cleaned into typed rows, together
with a target schema of metrics. Map rows of the table onto the metrics in the schema.

## CRITICAL RULES
✅ DO:
- Use the canonical metric `name` from the target schema, never the row label
- Copy numbers exactly as they appear in the table (no rounding, no unit conversion)
- Report the value for the most recent period as `value` and the prior period as `previous`
- Report `source_row` as the spreadsheet row number shown in the table (e.g. "row 12")
- Report `label` as the row label you read the value from
- Give a `confidence` between 0.0 and 1.0

❌ DO NOT:
- Invent metrics that are not in the target schema
- Report the same metric twice
- Compute values that are not present in the table
- Guess at values hidden in omitted rows

## OMITTED ROWS
Large tables are cut. A line starting with "... " tells you how many rows were left out
and the totals of their numeric columns. Do not report values from omitted rows.

## OUTPUT FORMAT
Return ONLY valid JSON matching the response schema. No commentary.
"#;

/// Renders the user message for one table.
pub fn render_user_prompt(request: &ExtractionRequest) -> String {
    let mut prompt = String::new();

    let _ = writeln!(
        prompt,
        "## TABLE\nSheet: {}\nRange: {}\n",
        request.sheet_name,
        request.region.a1()
    );

    let _ = writeln!(prompt, "| row | {} |", request.headers.join(" | "));
    let _ = writeln!(
        prompt,
        "|-----|{}",
        request.headers.iter().map(|_| "-----|").collect::<String>()
    );
    for row in &request.rows {
        prompt.push_str(&render_row(row, &request.headers));
    }
    if let Some(truncation) = &request.truncation {
        prompt.push_str(&render_truncation(truncation));
    }

    let _ = writeln!(
        prompt,
        "\n## TARGET SCHEMA\n{}",
        serde_json::to_string_pretty(&request.target_schema).unwrap_or_default()
    );
    let _ = writeln!(
        prompt,
        "\n## RESPONSE SCHEMA\n{}",
        serde_json::to_string_pretty(&request.response_schema).unwrap_or_default()
    );

    if let Some(context) = &request.corrective_context {
        let _ = writeln!(
            prompt,
            "\n## CORRECTION REQUIRED\nYour previous answer was rejected.\n\n{}",
            context
        );
    }

    prompt
}

fn render_row(row: &NormalizedRow, headers: &[String]) -> String {
    let cells: Vec<String> = headers
        .iter()
        .map(|header| row.get(header).map(render_value).unwrap_or_default())
        .collect();
    format!("| row {} | {} |\n", row.source_row + 1, cells.join(" | "))
}

fn render_value(value: &NormalizedValue) -> String {
    match value {
        NormalizedValue::Null => String::new(),
        NormalizedValue::Boolean(b) => b.to_string(),
        NormalizedValue::Number(n) => n.to_string(),
        NormalizedValue::Date(d) => d.format("%Y-%m-%d").to_string(),
        NormalizedValue::String(s) => s.replace('|', "/"),
    }
}

fn render_truncation(truncation: &Truncation) -> String {
    let mut line = format!(
        "... {} more rows omitted (rows {} to {})",
        truncation.omitted_rows,
        truncation.first_omitted_row + 1,
        truncation.last_omitted_row + 1
    );
    if !truncation.omitted_numeric_totals.is_empty() {
        let totals: Vec<String> = truncation
            .omitted_numeric_totals
            .iter()
            .map(|(column, total)| format!("{}: {}", column, total))
            .collect();
        let _ = write!(line, "; totals of omitted values: {}", totals.join(", "));
    }
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::BoundingBox;
    use crate::normalizer::NormalizedCell;
    use std::collections::BTreeMap;

    fn request() -> ExtractionRequest {
        ExtractionRequest {
            sheet_name: "Balance".to_string(),
            region: BoundingBox {
                top: 2,
                left: 0,
                bottom: 4,
                right: 1,
            },
            headers: vec!["Item".to_string(), "2024".to_string()],
            rows: vec![NormalizedRow {
                source_row: 3,
                cells: vec![
                    NormalizedCell {
                        column: "Item".to_string(),
                        value: NormalizedValue::String("Current assets".to_string()),
                        flag: None,
                    },
                    NormalizedCell {
                        column: "2024".to_string(),
                        value: NormalizedValue::Number(1200.5),
                        flag: None,
                    },
                ],
            }],
            truncation: None,
            target_schema: serde_json::json!({ "fields": [] }),
            response_schema: serde_json::json!({ "type": "object" }),
            corrective_context: None,
        }
    }

    #[test]
    fn test_prompt_contains_table_rows() {
        let prompt = render_user_prompt(&request());
        assert!(prompt.contains("Range: A3:B5"));
        assert!(prompt.contains("| row | Item | 2024 |"));
        assert!(prompt.contains("| row 4 | Current assets | 1200.5 |"));
        assert!(!prompt.contains("CORRECTION REQUIRED"));
    }

    #[test]
    fn test_prompt_marks_truncation_and_correction() {
        let mut totals = BTreeMap::new();
        totals.insert("2024".to_string(), 900.0);
        let mut req = request().with_corrective_context("missing required field 'current_assets'");
        req.truncation = Some(Truncation {
            total_rows: 12,
            included_rows: 2,
            omitted_rows: 10,
            first_omitted_row: 6,
            last_omitted_row: 15,
            omitted_numeric_totals: totals,
        });

        let prompt = render_user_prompt(&req);
        assert!(prompt.contains(
            "... 10 more rows omitted (rows 7 to 16); totals of omitted values: 2024: 900"
        ));
        assert!(prompt.contains("CORRECTION REQUIRED"));
        assert!(prompt.contains("missing required field 'current_assets'"));
    }
}
