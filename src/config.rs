use crate::error::{PipelineError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Runtime knobs consumed by the pipeline. Every field has a default so a partial
/// JSON document is enough to override a single setting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Uploads above this size are rejected before parsing.
    pub max_file_size_bytes: u64,
    /// Upper bound on the declared cell count of a single sheet.
    pub max_sheet_cells: u64,
    /// Data rows sent to the adapter per table; the rest are replaced by a truncation marker.
    pub max_rows_per_table: usize,
    pub retry: RetryPolicy,
    /// Timeout applied to each individual adapter call.
    pub adapter_timeout_ms: u64,
    /// Wall-clock ceiling for a whole run.
    pub run_deadline_ms: u64,
    pub max_concurrent_tables: usize,
    /// Numeric metric values with a larger magnitude are rejected as implausible.
    pub max_abs_metric_value: f64,
    /// Confidence assigned when the model does not report one.
    pub default_confidence: f64,
    pub locator: LocatorConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: 2 * 1024 * 1024,
            max_sheet_cells: 1_000_000,
            max_rows_per_table: 200,
            retry: RetryPolicy::default(),
            adapter_timeout_ms: 60_000,
            run_deadline_ms: 300_000,
            max_concurrent_tables: 4,
            max_abs_metric_value: 1e15,
            default_confidence: 0.5,
            locator: LocatorConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_timeout_ms)
    }

    pub fn run_deadline(&self) -> Duration {
        Duration::from_millis(self.run_deadline_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_file_size_bytes == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_file_size_bytes must be greater than zero".to_string(),
            ));
        }
        if self.max_rows_per_table == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_rows_per_table must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_tables == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_concurrent_tables must be greater than zero".to_string(),
            ));
        }
        if self.adapter_timeout_ms == 0 || self.run_deadline_ms == 0 {
            return Err(PipelineError::InvalidConfig(
                "adapter_timeout_ms and run_deadline_ms must be greater than zero".to_string(),
            ));
        }
        if !self.max_abs_metric_value.is_finite() || self.max_abs_metric_value <= 0.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "max_abs_metric_value must be a positive finite number, got {}",
                self.max_abs_metric_value
            )));
        }
        if !(0.0..=1.0).contains(&self.default_confidence) {
            return Err(PipelineError::InvalidConfig(format!(
                "default_confidence {} must be between 0.0 and 1.0",
                self.default_confidence
            )));
        }
        self.retry.validate()?;
        self.locator.validate()
    }
}

/// Retry schedule for transient adapter failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first call, so an adapter sees at most `max_retries + 1` calls.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Adds up to 25% random jitter to each wait.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = self.multiplier.powi(retry.min(30) as i32);
        let base = (self.initial_backoff_ms as f64 * exp).min(self.max_backoff_ms as f64);
        let millis = if self.jitter && base > 0.0 {
            base + rand::thread_rng().gen_range(0.0..=base * 0.25)
        } else {
            base
        };
        Duration::from_millis(millis.round() as u64)
    }

    fn validate(&self) -> Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(PipelineError::InvalidConfig(
                "retry.max_backoff_ms must not be smaller than retry.initial_backoff_ms"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Heuristic thresholds used by the table locator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LocatorConfig {
    /// Fraction of a row's non-empty cells that must be labels for it to be a header.
    pub header_text_ratio: f64,
    pub min_header_cells: usize,
    /// Fraction of a row's non-empty cells that must be numbers or dates for it to be data.
    pub data_numeric_ratio: f64,
    /// Non-data rows tolerated between a header and its first data row.
    pub max_header_gap: usize,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            header_text_ratio: 0.6,
            min_header_cells: 2,
            data_numeric_ratio: 0.5,
            max_header_gap: 1,
        }
    }
}

impl LocatorConfig {
    fn validate(&self) -> Result<()> {
        for (name, ratio) in [
            ("header_text_ratio", self.header_text_ratio),
            ("data_numeric_ratio", self.data_numeric_ratio),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(PipelineError::InvalidConfig(format!(
                    "locator.{} must be in (0.0, 1.0], got {}",
                    name, ratio
                )));
            }
        }
        if self.min_header_cells == 0 {
            return Err(PipelineError::InvalidConfig(
                "locator.min_header_cells must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
