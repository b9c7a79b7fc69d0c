use crate::locator::BoundingBox;
use crate::normalizer::NormalizedRow;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Everything the extraction capability needs to map one table onto the metric schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub sheet_name: String,
    pub region: BoundingBox,
    pub headers: Vec<String>,
    pub rows: Vec<NormalizedRow>,
    /// Present when rows beyond the configured limit were left out.
    pub truncation: Option<Truncation>,
    pub target_schema: serde_json::Value,
    pub response_schema: serde_json::Value,
    /// Validation errors from a previous answer, set only on the repair attempt.
    pub corrective_context: Option<String>,
}

impl ExtractionRequest {
    pub fn with_corrective_context(&self, context: impl Into<String>) -> Self {
        Self {
            corrective_context: Some(context.into()),
            ..self.clone()
        }
    }
}

/// Marker describing the rows that were not sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Truncation {
    pub total_rows: usize,
    pub included_rows: usize,
    pub omitted_rows: usize,
    /// 0-based sheet rows of the first and last omitted row.
    pub first_omitted_row: u32,
    pub last_omitted_row: u32,
    /// Sum of the numeric values left out, per column.
    pub omitted_numeric_totals: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawModelOutput {
    pub text: String,
}

impl RawModelOutput {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterErrorKind {
    Timeout,
    RateLimited,
    InvalidRequest,
    ProviderError,
}

impl AdapterErrorKind {
    /// Only timeouts and rate limits are worth retrying.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Timeout | Self::RateLimited)
    }
}

impl fmt::Display for AdapterErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate limited",
            Self::InvalidRequest => "invalid request",
            Self::ProviderError => "provider error",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub message: String,
}

impl AdapterError {
    pub fn new(kind: AdapterErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Timeout, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::RateLimited, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::InvalidRequest, message)
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::ProviderError, message)
    }
}

/// Progress notifications emitted while a workbook is processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExtractionEvent {
    Starting { tables: usize },
    TableStarted { table: usize },
    Retry { table: usize, attempt: u32, error: String },
    CorrectionNeeded { table: usize, reason: String },
    TableFinished { table: usize, success: bool },
    Finished,
}
