use crate::error::{PipelineError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    #[schemars(description = "Free text value")]
    String,

    #[schemars(
        description = "Monetary or numeric value. Plain JSON number, negatives as '-' (not parentheses), no currency symbols or thousands separators."
    )]
    Number,

    #[schemars(description = "Calendar date in YYYY-MM-DD format")]
    Date,

    #[schemars(description = "true or false")]
    Boolean,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct MetricField {
    #[schemars(description = "Canonical metric name. Output entries must use this exact name.")]
    pub name: String,

    #[schemars(description = "Type the metric value must have")]
    pub field_type: FieldType,

    #[serde(default)]
    #[schemars(description = "If true, every table must report this metric")]
    pub required: bool,

    #[serde(default)]
    #[schemars(description = "What the metric means in the source report")]
    pub description: Option<String>,

    #[serde(default)]
    #[schemars(
        description = "Row labels under which this metric commonly appears (e.g. 'non-current assets')"
    )]
    pub aliases: Vec<String>,
}

impl MetricField {
    pub fn number(name: &str, aliases: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            field_type: FieldType::Number,
            required: false,
            description: None,
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Target shape every extracted metric must conform to. Loaded once and shared read-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct MetricSchema {
    pub fields: Vec<MetricField>,
}

impl MetricSchema {
    pub fn new(fields: Vec<MetricField>) -> Result<Self> {
        let schema = Self { fields };
        schema.validate()?;
        Ok(schema)
    }

    /// The balance sheet metrics tracked by default.
    pub fn default_financial() -> Self {
        Self {
            fields: vec![
                MetricField::number(
                    "non_current_assets",
                    &["non current assets", "non-current assets"],
                ),
                MetricField::number("current_assets", &["current assets"]),
                MetricField::number(
                    "prepaid_expenses",
                    &["prepaid expenses", "prepaid expense"],
                ),
                MetricField::number(
                    "deferred_tax_assets",
                    &["deferred tax assets", "deferred tax asset"],
                ),
            ],
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let schema: Self = serde_json::from_str(json)?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(PipelineError::InvalidSchema(
                "schema must declare at least one field".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(PipelineError::InvalidSchema(
                    "field names must not be blank".to_string(),
                ));
            }
            // a field's own aliases may collapse onto its name
            let keys: HashSet<String> = std::iter::once(&field.name)
                .chain(field.aliases.iter())
                .map(|key| canonical_key(key))
                .collect();
            for key in keys {
                if !seen.insert(key.clone()) {
                    return Err(PipelineError::InvalidSchema(format!(
                        "field '{}' reuses a name or alias already declared ('{}')",
                        field.name, key
                    )));
                }
            }
        }
        Ok(())
    }

    /// Looks a field up by its name or any alias, ignoring case, spacing and separators.
    pub fn resolve(&self, name: &str) -> Option<&MetricField> {
        let key = canonical_key(name);
        self.fields.iter().find(|field| {
            canonical_key(&field.name) == key
                || field.aliases.iter().any(|a| canonical_key(a) == key)
        })
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &MetricField> {
        self.fields.iter().filter(|f| f.required)
    }

    /// Description of the target fields embedded in every extraction request.
    pub fn describe(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn canonical_key(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Shape the model is asked to answer with.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ModelResponse {
    #[schemars(
        description = "One entry per metric found in the table. Each metric name may appear at most once."
    )]
    pub metrics: Vec<ModelMetric>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ModelMetric {
    #[schemars(description = "Canonical metric name from the target schema")]
    pub name: String,

    #[schemars(description = "Value for the current reporting period, typed per the schema")]
    pub value: serde_json::Value,

    #[serde(default)]
    #[schemars(description = "Value for the previous reporting period, if the table shows one")]
    pub previous: Option<serde_json::Value>,

    #[serde(default)]
    #[schemars(description = "The row label the value was read from, verbatim")]
    pub label: Option<String>,

    #[serde(default)]
    #[schemars(description = "Spreadsheet row number (1-based) the value was read from")]
    pub source_row: Option<u32>,

    #[serde(default)]
    #[schemars(description = "Confidence between 0.0 and 1.0 that the mapping is correct")]
    pub confidence: Option<f64>,
}

impl ModelResponse {
    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(ModelResponse)
    }

    pub fn schema_as_value() -> serde_json::Value {
        serde_json::to_value(Self::generate_json_schema()).unwrap_or(serde_json::Value::Null)
    }
}
