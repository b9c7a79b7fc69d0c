use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::llm::{ExtractionAdapter, ExtractionEvent, RunControl, TableExtractor};
use crate::locator::{TableLocator, TableRegion};
use crate::normalizer::normalize_region;
use crate::report::{ReportAggregator, ReportResult, SheetSummary, TableResult};
use crate::repository::ReportRepository;
use crate::schema::MetricSchema;
use crate::workbook::{Sheet, UploadedFile, Workbook, WorkbookLoader};
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

/// One upload in, one persisted [`ReportResult`] out.
pub struct ReportPipeline {
    config: Arc<PipelineConfig>,
    schema: Arc<MetricSchema>,
    adapter: Arc<dyn ExtractionAdapter>,
    repository: Arc<dyn ReportRepository>,
    progress: Option<Sender<ExtractionEvent>>,
}

impl ReportPipeline {
    pub fn new(
        config: PipelineConfig,
        schema: MetricSchema,
        adapter: Arc<dyn ExtractionAdapter>,
        repository: Arc<dyn ReportRepository>,
    ) -> Result<Self> {
        config.validate()?;
        schema.validate()?;
        Ok(Self {
            config: Arc::new(config),
            schema: Arc::new(schema),
            adapter,
            repository,
            progress: None,
        })
    }

    pub fn with_progress(mut self, progress: Sender<ExtractionEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn schema(&self) -> &MetricSchema {
        &self.schema
    }

    /// Fails only for input errors or when the report cannot be persisted. Every
    /// table-level problem is recorded in the returned report instead.
    pub async fn process_upload(
        &self,
        upload: &UploadedFile,
        cancel: &CancellationToken,
    ) -> Result<ReportResult> {
        info!(
            "Processing upload {} ('{}', {} bytes)",
            upload.upload_id,
            upload.filename,
            upload.bytes.len()
        );
        let workbook = WorkbookLoader::new(&self.config).load(upload)?;
        self.process_workbook(&workbook, cancel).await
    }

    pub async fn process_workbook(
        &self,
        workbook: &Workbook,
        cancel: &CancellationToken,
    ) -> Result<ReportResult> {
        let started = Instant::now();
        let locator = TableLocator::new(self.config.locator.clone());

        let mut sheets = Vec::with_capacity(workbook.sheets().len());
        let mut jobs = Vec::new();
        for sheet in workbook.sheets() {
            let regions = locator.locate(sheet);
            if regions.is_empty() {
                debug!("Sheet '{}' contains no tables", sheet.name);
            }
            sheets.push(SheetSummary {
                name: sheet.name.clone(),
                index: sheet.index,
                tables_found: regions.len(),
            });
            jobs.extend(regions.into_iter().map(|region| (sheet, region)));
        }

        info!(
            "Upload {}: {} tables located across {} sheets",
            workbook.upload_id(),
            jobs.len(),
            sheets.len()
        );
        self.send_event(ExtractionEvent::Starting { tables: jobs.len() });

        let control = RunControl::new(cancel);
        let tables = self.run_tables(jobs, &control).await;
        self.send_event(ExtractionEvent::Finished);

        let report = ReportAggregator::aggregate(workbook.upload_id(), sheets, tables);
        self.repository
            .save(&report)
            .await
            .map_err(|e| match e {
                PipelineError::Persistence { .. } => e,
                other => PipelineError::Persistence {
                    upload_id: report.upload_id.to_string(),
                    details: other.to_string(),
                },
            })?;

        info!(
            "Upload {} finished as {} in {:?}",
            report.upload_id,
            report.status,
            started.elapsed()
        );
        Ok(report)
    }

    /// Runs tables with bounded concurrency. Results come back in completion order, each
    /// tagged with its discovery index.
    async fn run_tables(
        &self,
        jobs: Vec<(&Sheet, TableRegion)>,
        control: &RunControl,
    ) -> Vec<(usize, TableResult)> {
        let total = jobs.len();
        let mut extractor = TableExtractor::new(
            self.adapter.clone(),
            self.schema.clone(),
            self.config.clone(),
        );
        if let Some(tx) = &self.progress {
            extractor = extractor.with_progress(tx.clone());
        }
        let extractor = &extractor;

        let mut pending = stream::iter(jobs.into_iter().enumerate())
            .map(move |(index, (sheet, region))| async move {
                let rows = if control.is_cancelled() {
                    Vec::new()
                } else {
                    normalize_region(sheet, &region)
                };
                let outcome = extractor.extract(index, &region, rows, control).await;
                (index, TableResult::new(&region, outcome))
            })
            .buffer_unordered(self.config.max_concurrent_tables);

        let deadline = tokio::time::sleep(self.config.run_deadline());
        tokio::pin!(deadline);

        let mut results = Vec::with_capacity(total);
        loop {
            tokio::select! {
                next = pending.next() => match next {
                    Some(result) => results.push(result),
                    None => break,
                },
                _ = &mut deadline, if !control.is_cancelled() => {
                    warn!(
                        "Run deadline of {:?} exceeded with {} of {} tables finished",
                        self.config.run_deadline(),
                        results.len(),
                        total
                    );
                    control.expire_deadline();
                }
            }
        }
        results
    }

    /// Progress is best effort: a full or closed channel never holds up extraction.
    fn send_event(&self, event: ExtractionEvent) {
        if let Some(tx) = &self.progress {
            if let Err(err) = tx.try_send(event) {
                debug!("Dropping progress event: {}", err);
            }
        }
    }
}
