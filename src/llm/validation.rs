//! Defensive parsing of model output into typed metric candidates, and the feedback text
//! used for the single repair attempt.

use crate::llm::types::RawModelOutput;
use crate::locator::TableRegion;
use crate::normalizer::{parse_date, parse_number, NormalizedValue};
use crate::report::{MetricCandidate, Provenance};
use crate::schema::{FieldType, MetricField, MetricSchema};
use log::{debug, warn};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;

const RAW_ECHO_LIMIT: usize = 500;

/// Every problem found in one model response.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub errors: Vec<String>,
    /// The parsed submission, or `None` when the output was not JSON at all.
    pub submission: Option<Value>,
    pub raw: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.errors.join("; "))
    }
}

impl std::error::Error for ValidationError {}

impl ValidationError {
    /// Corrective context sent with the repair attempt.
    pub fn feedback(
        &self,
        response_schema: &Value,
        attempt: usize,
        max_attempts: usize,
    ) -> String {
        match &self.submission {
            Some(submission) => build_validation_feedback(
                response_schema,
                submission,
                &self.errors,
                attempt,
                max_attempts,
            ),
            None => build_parse_error_feedback(
                &self.raw,
                &self.errors.join("; "),
                attempt,
                max_attempts,
                response_schema,
            ),
        }
    }
}

pub struct OutputValidator<'a> {
    schema: &'a MetricSchema,
    max_abs_value: f64,
    default_confidence: f64,
}

impl<'a> OutputValidator<'a> {
    pub fn new(schema: &'a MetricSchema, max_abs_value: f64, default_confidence: f64) -> Self {
        Self {
            schema,
            max_abs_value,
            default_confidence,
        }
    }

    pub fn validate(
        &self,
        output: &RawModelOutput,
        region: &TableRegion,
    ) -> Result<Vec<MetricCandidate>, ValidationError> {
        let cleaned = clean_json_output(&output.text);
        let parsed: Value = serde_json::from_str(&cleaned).map_err(|e| ValidationError {
            errors: vec![format!("response is not valid JSON: {}", e)],
            submission: None,
            raw: output.text.clone(),
        })?;

        let mut errors = Vec::new();
        let entries = match &parsed {
            Value::Object(map) => match map.get("metrics") {
                Some(Value::Array(entries)) => entries.as_slice(),
                _ => {
                    errors.push("expected an object with a 'metrics' array".to_string());
                    &[]
                }
            },
            Value::Array(entries) => entries.as_slice(),
            _ => {
                errors.push("expected an object with a 'metrics' array".to_string());
                &[]
            }
        };

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for (i, entry) in entries.iter().enumerate() {
            let Some(object) = entry.as_object() else {
                errors.push(format!("metrics[{}]: expected an object, got {}", i, entry));
                continue;
            };
            let Some(name) = object.get("name").and_then(Value::as_str) else {
                errors.push(format!("metrics[{}]: missing string field 'name'", i));
                continue;
            };
            let Some(field) = self.schema.resolve(name) else {
                warn!("Ignoring metric '{}' that is not part of the schema", name);
                continue;
            };
            if !seen.insert(field.name.clone()) {
                errors.push(format!(
                    "metrics[{}]: duplicate entry for '{}'",
                    i, field.name
                ));
                continue;
            }
            match self.candidate(i, field, object, region) {
                Ok(Some(candidate)) => candidates.push(candidate),
                Ok(None) => debug!("Metric '{}' reported without a value", field.name),
                Err(mut entry_errors) => errors.append(&mut entry_errors),
            }
        }

        for field in self.schema.required_fields() {
            if !seen.contains(&field.name) {
                errors.push(format!("missing required field '{}'", field.name));
            }
        }

        if errors.is_empty() && candidates.is_empty() {
            errors.push("no metrics from the target schema were found".to_string());
        }

        if errors.is_empty() {
            Ok(candidates)
        } else {
            Err(ValidationError {
                errors,
                submission: Some(parsed),
                raw: output.text.clone(),
            })
        }
    }

    fn candidate(
        &self,
        index: usize,
        field: &MetricField,
        object: &Map<String, Value>,
        region: &TableRegion,
    ) -> Result<Option<MetricCandidate>, Vec<String>> {
        let mut errors = Vec::new();
        let at = |msg: String| format!("metrics[{}] '{}': {}", index, field.name, msg);

        let value = match object.get("value") {
            None | Some(Value::Null) => {
                if field.required {
                    errors.push(at("required value is missing".to_string()));
                }
                None
            }
            Some(raw) => match self.typed(field.field_type, raw) {
                Ok(value) => Some(value),
                Err(msg) => {
                    errors.push(at(format!("value {}", msg)));
                    None
                }
            },
        };

        let previous = match object.get("previous") {
            None | Some(Value::Null) => None,
            Some(raw) => match self.typed(field.field_type, raw) {
                Ok(value) => Some(value),
                Err(msg) => {
                    errors.push(at(format!("previous {}", msg)));
                    None
                }
            },
        };

        let confidence = match object.get("confidence") {
            None | Some(Value::Null) => self.default_confidence,
            Some(raw) => match raw.as_f64() {
                Some(c) if (0.0..=1.0).contains(&c) => c,
                _ => {
                    errors.push(at(format!(
                        "confidence must be between 0.0 and 1.0, got {}",
                        raw
                    )));
                    self.default_confidence
                }
            },
        };

        let data_rows = region.data_rows();
        let source_row = match object.get("source_row") {
            None | Some(Value::Null) => None,
            // reported 1-based, stored 0-based
            Some(raw) => match raw
                .as_u64()
                .and_then(|row| row.checked_sub(1))
                .and_then(|row| u32::try_from(row).ok())
                .filter(|row| data_rows.contains(row))
            {
                Some(row) => Some(row),
                None => {
                    errors.push(at(format!(
                        "source_row {} is outside the table rows {} to {}",
                        raw,
                        data_rows.start() + 1,
                        data_rows.end() + 1
                    )));
                    None
                }
            },
        };

        let label = object
            .get("label")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string);

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(value.map(|value| MetricCandidate {
            field: field.name.clone(),
            value,
            previous,
            label,
            confidence,
            provenance: Provenance {
                sheet_name: region.sheet_name.clone(),
                sheet_index: region.sheet_index,
                region: region.bbox,
                source_row,
            },
        }))
    }

    fn typed(&self, field_type: FieldType, raw: &Value) -> Result<NormalizedValue, String> {
        match field_type {
            FieldType::Number => {
                let number = match raw {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => parse_number(s),
                    _ => None,
                }
                .ok_or_else(|| format!("must be a number, got {}", raw))?;
                if !number.is_finite() {
                    return Err(format!("must be finite, got {}", number));
                }
                if number.abs() > self.max_abs_value {
                    return Err(format!(
                        "{} exceeds the plausible magnitude {}",
                        number, self.max_abs_value
                    ));
                }
                Ok(NormalizedValue::Number(number))
            }
            FieldType::Date => raw
                .as_str()
                .and_then(parse_date)
                .map(NormalizedValue::Date)
                .ok_or_else(|| format!("must be a date, got {}", raw)),
            FieldType::Boolean => match raw {
                Value::Bool(b) => Ok(NormalizedValue::Boolean(*b)),
                Value::String(s) if s.eq_ignore_ascii_case("true") => {
                    Ok(NormalizedValue::Boolean(true))
                }
                Value::String(s) if s.eq_ignore_ascii_case("false") => {
                    Ok(NormalizedValue::Boolean(false))
                }
                _ => Err(format!("must be a boolean, got {}", raw)),
            },
            FieldType::String => match raw {
                Value::String(s) if !s.trim().is_empty() => {
                    Ok(NormalizedValue::String(s.trim().to_string()))
                }
                Value::Number(n) => Ok(NormalizedValue::String(n.to_string())),
                _ => Err(format!("must be a non-empty string, got {}", raw)),
            },
        }
    }
}

/// Strips markdown fences and prose around the JSON payload.
pub fn clean_json_output(raw: &str) -> String {
    if let Some(start) = raw.find(|c| c == '{' || c == '[') {
        let close = if raw[start..].starts_with('{') { '}' } else { ']' };
        if let Some(end) = raw.rfind(close) {
            if end > start {
                return raw[start..=end].to_string();
            }
        }
    }
    raw.trim().to_string()
}

pub fn build_validation_feedback(
    schema: &Value,
    submission: &Value,
    errors: &[String],
    attempt: usize,
    max_attempts: usize,
) -> String {
    let mut feedback = format!(
        "Attempt {}/{}: validation failed.\n\nErrors:\n",
        attempt, max_attempts
    );
    for error in errors {
        feedback.push_str("  - ");
        feedback.push_str(error);
        feedback.push('\n');
    }

    feedback.push_str("\nExpected schema:\n");
    feedback.push_str(&serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string()));

    feedback.push_str("\n\nYour submission:\n");
    feedback.push_str(
        &serde_json::to_string_pretty(submission).unwrap_or_else(|_| submission.to_string()),
    );

    feedback.push_str("\n\nPlease fix all errors and resubmit.");
    feedback
}

pub fn build_parse_error_feedback(
    raw_text: &str,
    parse_error: &str,
    attempt: usize,
    max_attempts: usize,
    schema: &Value,
) -> String {
    let mut feedback = format!(
        "Attempt {}/{}: could not parse your response as JSON.\n\nParse error: {}\n\n",
        attempt, max_attempts, parse_error
    );

    feedback.push_str(&format!("Your response (first {} chars):\n", RAW_ECHO_LIMIT));
    let mut truncated: String = raw_text.chars().take(RAW_ECHO_LIMIT).collect();
    if raw_text.chars().count() > RAW_ECHO_LIMIT {
        truncated.push_str("...");
    }
    feedback.push_str(&truncated);

    feedback.push_str("\n\nExpected schema:\n");
    feedback.push_str(&serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string()));

    feedback.push_str("\n\nPlease respond with valid JSON matching the schema above.");
    feedback
}
