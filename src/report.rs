//! Per-table outcomes and the consolidated report for one upload.

use crate::locator::{BoundingBox, TableRegion};
use crate::normalizer::NormalizedValue;
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Where a candidate came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub sheet_name: String,
    pub sheet_index: usize,
    pub region: BoundingBox,
    /// 0-based sheet row the value was read from, when the model reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_row: Option<u32>,
}

/// One validated metric value mapped from a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricCandidate {
    /// Canonical field name from the metric schema.
    pub field: String,
    pub value: NormalizedValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<NormalizedValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub confidence: f64,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ValidationFailed,
    AdapterPermanentError,
    RetriesExhausted,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ValidationFailed => "validation failed",
            Self::AdapterPermanentError => "adapter permanent error",
            Self::RetriesExhausted => "retries exhausted",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableOutcome {
    Extracted {
        candidates: Vec<MetricCandidate>,
        /// Adapter calls spent on this table, retries and repair included.
        adapter_calls: u32,
        repaired: bool,
    },
    Failed {
        kind: FailureKind,
        reason: String,
    },
}

impl TableOutcome {
    pub fn failed(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Extracted { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Failed { kind, .. } => Some(*kind),
            Self::Extracted { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableResult {
    pub sheet_name: String,
    pub sheet_index: usize,
    pub region: BoundingBox,
    pub headers: Vec<String>,
    pub outcome: TableOutcome,
}

impl TableResult {
    pub fn new(region: &TableRegion, outcome: TableOutcome) -> Self {
        Self {
            sheet_name: region.sheet_name.clone(),
            sheet_index: region.sheet_index,
            region: region.bbox,
            headers: region.headers.clone(),
            outcome,
        }
    }

    pub fn candidates(&self) -> &[MetricCandidate] {
        match &self.outcome {
            TableOutcome::Extracted { candidates, .. } => candidates,
            TableOutcome::Failed { .. } => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetSummary {
    pub name: String,
    pub index: usize,
    pub tables_found: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Complete,
    Partial,
    Failed,
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportResult {
    pub upload_id: Uuid,
    pub processed_at: DateTime<Utc>,
    pub status: ReportStatus,
    pub sheets: Vec<SheetSummary>,
    /// Sheet order, then top-to-bottom within a sheet.
    pub tables: Vec<TableResult>,
}

impl ReportResult {
    pub fn candidates(&self) -> impl Iterator<Item = &MetricCandidate> {
        self.tables.iter().flat_map(|table| table.candidates().iter())
    }

    pub fn failures(&self) -> impl Iterator<Item = &TableResult> {
        self.tables.iter().filter(|table| !table.outcome.is_success())
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Merges per-table results into a [`ReportResult`].
pub struct ReportAggregator;

impl ReportAggregator {
    pub fn status(tables: &[TableResult]) -> ReportStatus {
        let succeeded = tables.iter().filter(|t| t.outcome.is_success()).count();
        if succeeded == tables.len() {
            ReportStatus::Complete
        } else if succeeded == 0 {
            ReportStatus::Failed
        } else {
            ReportStatus::Partial
        }
    }

    /// `tables` may arrive in completion order; each carries its discovery index.
    pub fn aggregate(
        upload_id: Uuid,
        sheets: Vec<SheetSummary>,
        mut tables: Vec<(usize, TableResult)>,
    ) -> ReportResult {
        tables.sort_by_key(|(index, _)| *index);
        let tables: Vec<TableResult> = tables.into_iter().map(|(_, table)| table).collect();
        let status = Self::status(&tables);

        info!(
            "Report {} aggregated: {} ({} tables, {} failed)",
            upload_id,
            status,
            tables.len(),
            tables.iter().filter(|t| !t.outcome.is_success()).count()
        );

        ReportResult {
            upload_id,
            processed_at: Utc::now(),
            status,
            sheets,
            tables,
        }
    }
}
