//! # Financial Report Extractor
//!
//! A library for turning uploaded spreadsheet financial reports into validated, structured
//! metric records with the help of a language model.
//!
//! ## Core Concepts
//!
//! - **Workbook**: the uploaded file parsed into sheets of raw cells (merges included)
//! - **Table Region**: a header row plus data rows found inside a sheet by heuristics
//! - **Normalization**: currency, thousands separators, parentheses negatives, percentages
//!   and dates become canonical typed values
//! - **Extraction**: each table is sent to an [`ExtractionAdapter`]; the answer is parsed
//!   defensively, validated against the [`MetricSchema`] and repaired at most once
//! - **Failure isolation**: a table that fails is recorded in the report ledger and never
//!   aborts its siblings; the report status is `complete`, `partial` or `failed`
//!
//! ## Example
//!
//! ```rust,ignore
//! use fin_report_extractor::*;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let pipeline = ReportPipeline::new(
//!     PipelineConfig::default(),
//!     MetricSchema::default_financial(),
//!     Arc::new(GeminiAdapter::from_env(DEFAULT_GEMINI_MODEL)?),
//!     Arc::new(InMemoryReportRepository::new()),
//! )?;
//!
//! let upload = UploadedFile::new("balance.xlsx", None, std::fs::read("balance.xlsx")?);
//! let report = pipeline.process_upload(&upload, &CancellationToken::new()).await?;
//!
//! for candidate in report.candidates() {
//!     println!("{} = {:?}", candidate.field, candidate.value);
//! }
//! ```

pub mod config;
pub mod error;
pub mod llm;
pub mod locator;
pub mod normalizer;
pub mod pipeline;
pub mod report;
pub mod repository;
pub mod schema;
pub mod workbook;

pub use config::{LocatorConfig, PipelineConfig, RetryPolicy};
pub use error::{PipelineError, Result};
pub use llm::{
    AdapterError, AdapterErrorKind, ExtractionAdapter, ExtractionEvent, ExtractionRequest,
    RawModelOutput, RunControl, TableExtractor, Truncation,
};
#[cfg(feature = "gemini")]
pub use llm::{GeminiAdapter, DEFAULT_GEMINI_MODEL};
pub use locator::{BoundingBox, TableLocator, TableRegion};
pub use normalizer::{normalize_region, NormalizedRow, NormalizedValue};
pub use pipeline::ReportPipeline;
pub use report::{
    FailureKind, MetricCandidate, Provenance, ReportAggregator, ReportResult, ReportStatus,
    SheetSummary, TableOutcome, TableResult,
};
pub use repository::{InMemoryReportRepository, ReportRepository};
pub use schema::{FieldType, MetricField, MetricSchema};
pub use workbook::{CellValue, Sheet, SpreadsheetFormat, UploadedFile, Workbook, WorkbookLoader};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct EchoCurrentAssets;

    #[async_trait]
    impl ExtractionAdapter for EchoCurrentAssets {
        async fn extract(
            &self,
            request: &ExtractionRequest,
        ) -> std::result::Result<RawModelOutput, AdapterError> {
            let row = request
                .rows
                .iter()
                .find(|row| {
                    matches!(
                        row.get("Item"),
                        Some(NormalizedValue::String(s)) if s == "Current assets"
                    )
                })
                .ok_or_else(|| AdapterError::invalid_request("row not found"))?;
            let value = row.get("2024").and_then(NormalizedValue::as_number);
            let previous = row.get("2023").and_then(NormalizedValue::as_number);
            Ok(RawModelOutput::new(
                serde_json::json!({
                    "metrics": [{
                        "name": "current assets",
                        "value": value,
                        "previous": previous,
                        "source_row": row.source_row + 1,
                        "confidence": 0.95
                    }]
                })
                .to_string(),
            ))
        }
    }

    fn text(s: &str) -> CellValue {
        CellValue::Text(s.to_string())
    }

    #[tokio::test]
    async fn test_end_to_end_processing() {
        let sheet = Sheet::from_values(
            "Balance Sheet",
            0,
            vec![
                vec![text("ACME Ltd - Statement of financial position")],
                vec![],
                vec![text("Item"), text("2024"), text("2023")],
                vec![text("Current assets"), text("$1,250.00"), text("(300)")],
                vec![text("Prepaid expenses"), CellValue::Number(40.0), CellValue::Number(35.0)],
            ],
        );
        let workbook = Workbook::new(Uuid::new_v4(), vec![sheet]).unwrap();
        let repository = Arc::new(InMemoryReportRepository::new());
        let pipeline = ReportPipeline::new(
            PipelineConfig::default(),
            MetricSchema::default_financial(),
            Arc::new(EchoCurrentAssets),
            repository.clone(),
        )
        .unwrap();

        let report = pipeline
            .process_workbook(&workbook, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, ReportStatus::Complete);
        assert_eq!(report.sheets[0].tables_found, 1);
        let candidate = report.candidates().next().unwrap();
        assert_eq!(candidate.field, "current_assets");
        assert_eq!(candidate.value, NormalizedValue::Number(1250.0));
        assert_eq!(candidate.previous, Some(NormalizedValue::Number(-300.0)));
        assert_eq!(candidate.provenance.source_row, Some(3));
        assert_eq!(candidate.provenance.region.a1(), "A3:C5");

        let stored = repository.get(workbook.upload_id()).await.unwrap().unwrap();
        assert_eq!(stored, report);
    }
}
