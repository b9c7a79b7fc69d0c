use crate::config::PipelineConfig;
use crate::llm::adapter::ExtractionAdapter;
use crate::llm::types::*;
use crate::llm::validation::OutputValidator;
use crate::locator::TableRegion;
use crate::normalizer::NormalizedRow;
use crate::report::{FailureKind, TableOutcome};
use crate::schema::{MetricSchema, ModelResponse};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

/// Validation passes allowed per table: the first answer and one repair.
const MAX_VALIDATION_ATTEMPTS: usize = 2;

/// Cancellation shared by every table of one run.
///
/// Wraps a child of the caller's token, so expiring the run deadline never cancels the
/// caller's own token.
#[derive(Debug, Clone)]
pub struct RunControl {
    token: CancellationToken,
    deadline_exceeded: Arc<AtomicBool>,
}

impl RunControl {
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            deadline_exceeded: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn expire_deadline(&self) {
        self.deadline_exceeded.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn reason(&self) -> &'static str {
        if self.deadline_exceeded.load(Ordering::SeqCst) {
            "run deadline exceeded"
        } else {
            "run cancelled"
        }
    }

    fn outcome(&self, stage: &str) -> TableOutcome {
        TableOutcome::failed(FailureKind::Cancelled, format!("{} {}", self.reason(), stage))
    }
}

/// Drives one table through adapter calls, validation and the repair cycle.
pub struct TableExtractor {
    adapter: Arc<dyn ExtractionAdapter>,
    schema: Arc<MetricSchema>,
    config: Arc<PipelineConfig>,
    target_schema: serde_json::Value,
    response_schema: serde_json::Value,
    progress: Option<Sender<ExtractionEvent>>,
}

impl TableExtractor {
    pub fn new(
        adapter: Arc<dyn ExtractionAdapter>,
        schema: Arc<MetricSchema>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        let target_schema = schema.describe();
        Self {
            adapter,
            schema,
            config,
            target_schema,
            response_schema: ModelResponse::schema_as_value(),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Sender<ExtractionEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Builds the adapter payload, cutting rows beyond `max_rows_per_table`.
    pub fn build_request(
        &self,
        region: &TableRegion,
        mut rows: Vec<NormalizedRow>,
    ) -> ExtractionRequest {
        let limit = self.config.max_rows_per_table;
        let total_rows = rows.len();
        let truncation = if total_rows > limit {
            let omitted = rows.split_off(limit);
            let mut omitted_numeric_totals = BTreeMap::new();
            for cell in omitted.iter().flat_map(|row| row.cells.iter()) {
                if let Some(n) = cell.value.as_number() {
                    *omitted_numeric_totals.entry(cell.column.clone()).or_insert(0.0) += n;
                }
            }
            debug!(
                "Table {}!{} truncated to {} of {} rows",
                region.sheet_name,
                region.bbox.a1(),
                limit,
                total_rows
            );
            Some(Truncation {
                total_rows,
                included_rows: limit,
                omitted_rows: omitted.len(),
                first_omitted_row: omitted.first().map(|r| r.source_row).unwrap_or_default(),
                last_omitted_row: omitted.last().map(|r| r.source_row).unwrap_or_default(),
                omitted_numeric_totals,
            })
        } else {
            None
        };

        ExtractionRequest {
            sheet_name: region.sheet_name.clone(),
            region: region.bbox,
            headers: region.headers.clone(),
            rows,
            truncation,
            target_schema: self.target_schema.clone(),
            response_schema: self.response_schema.clone(),
            corrective_context: None,
        }
    }

    /// Never fails: every problem becomes a classified [`TableOutcome::Failed`].
    pub async fn extract(
        &self,
        table: usize,
        region: &TableRegion,
        rows: Vec<NormalizedRow>,
        control: &RunControl,
    ) -> TableOutcome {
        if control.is_cancelled() {
            return control.outcome("before extraction started");
        }
        self.send_event(ExtractionEvent::TableStarted { table });

        let outcome = self.run(table, region, rows, control).await;
        if let TableOutcome::Failed { kind, reason } = &outcome {
            warn!(
                "Table {} ({}!{}) failed: {}: {}",
                table,
                region.sheet_name,
                region.bbox.a1(),
                kind,
                reason
            );
        }

        self.send_event(ExtractionEvent::TableFinished {
            table,
            success: outcome.is_success(),
        });
        outcome
    }

    async fn run(
        &self,
        table: usize,
        region: &TableRegion,
        rows: Vec<NormalizedRow>,
        control: &RunControl,
    ) -> TableOutcome {
        let validator = OutputValidator::new(
            &self.schema,
            self.config.max_abs_metric_value,
            self.config.default_confidence,
        );
        let request = self.build_request(region, rows);
        let mut calls = 0u32;

        let output = match self.call_with_retry(table, &request, control, &mut calls).await {
            Ok(output) => output,
            Err(outcome) => return outcome,
        };

        let error = match validator.validate(&output, region) {
            Ok(candidates) => {
                debug!("Table {} produced {} candidates", table, candidates.len());
                return TableOutcome::Extracted {
                    candidates,
                    adapter_calls: calls,
                    repaired: false,
                };
            }
            Err(error) => error,
        };

        warn!("Table {} output failed validation, requesting repair: {}", table, error);
        self.send_event(ExtractionEvent::CorrectionNeeded {
            table,
            reason: error.to_string(),
        });

        let repair = request.with_corrective_context(error.feedback(
            &self.response_schema,
            1,
            MAX_VALIDATION_ATTEMPTS,
        ));
        let output = match self.call_with_retry(table, &repair, control, &mut calls).await {
            Ok(output) => output,
            Err(outcome) => return outcome,
        };

        match validator.validate(&output, region) {
            Ok(candidates) => TableOutcome::Extracted {
                candidates,
                adapter_calls: calls,
                repaired: true,
            },
            Err(error) => TableOutcome::failed(
                FailureKind::ValidationFailed,
                format!("output still invalid after repair: {}", error),
            ),
        }
    }

    /// One logical adapter call with per-call timeout and bounded retry of transient errors.
    async fn call_with_retry(
        &self,
        table: usize,
        request: &ExtractionRequest,
        control: &RunControl,
        calls: &mut u32,
    ) -> std::result::Result<RawModelOutput, TableOutcome> {
        let policy = &self.config.retry;
        let timeout = self.config.adapter_timeout();
        let mut retries = 0u32;

        loop {
            if control.is_cancelled() {
                return Err(control.outcome("before adapter call"));
            }
            *calls += 1;
            debug!(
                "Table {} adapter call {} via {}",
                table,
                calls,
                self.adapter.name()
            );

            let result = tokio::select! {
                biased;
                _ = control.cancelled() => return Err(control.outcome("during adapter call")),
                result = tokio::time::timeout(timeout, self.adapter.extract(request)) => {
                    result.unwrap_or_else(|_| {
                        Err(AdapterError::timeout(format!(
                            "no response within {} ms",
                            timeout.as_millis()
                        )))
                    })
                }
            };

            let error = match result {
                Ok(output) => return Ok(output),
                Err(error) => error,
            };

            if !error.kind.is_transient() {
                return Err(TableOutcome::failed(
                    FailureKind::AdapterPermanentError,
                    error.to_string(),
                ));
            }
            if retries >= policy.max_retries {
                return Err(TableOutcome::failed(
                    FailureKind::RetriesExhausted,
                    format!("{} (gave up after {} attempts)", error, retries + 1),
                ));
            }

            let wait = policy.backoff(retries);
            retries += 1;
            warn!(
                "Table {} transient adapter error ({}), retry {}/{} in {:?}",
                table, error, retries, policy.max_retries, wait
            );
            self.send_event(ExtractionEvent::Retry {
                table,
                attempt: retries,
                error: error.to_string(),
            });

            tokio::select! {
                biased;
                _ = control.cancelled() => return Err(control.outcome("while waiting to retry")),
                _ = tokio::time::sleep(wait) => {}
            }
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::locator::BoundingBox;
    use crate::normalizer::{NormalizedCell, NormalizedValue};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedAdapter {
        responses: Mutex<VecDeque<std::result::Result<RawModelOutput, AdapterError>>>,
        calls: AtomicUsize,
        contexts: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedAdapter {
        fn new(responses: Vec<std::result::Result<&str, AdapterError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(
                    responses
                        .into_iter()
                        .map(|r| r.map(RawModelOutput::new))
                        .collect(),
                ),
                calls: AtomicUsize::new(0),
                contexts: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ExtractionAdapter for ScriptedAdapter {
        async fn extract(
            &self,
            request: &ExtractionRequest,
        ) -> std::result::Result<RawModelOutput, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.contexts
                .lock()
                .unwrap()
                .push(request.corrective_context.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AdapterError::provider("script exhausted")))
        }
    }

    struct SlowAdapter;

    #[async_trait]
    impl ExtractionAdapter for SlowAdapter {
        async fn extract(
            &self,
            _request: &ExtractionRequest,
        ) -> std::result::Result<RawModelOutput, AdapterError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(RawModelOutput::new("{}"))
        }
    }

    const VALID: &str = r#"{"metrics": [{"name": "current_assets", "value": 120}]}"#;
    const INVALID: &str = r#"{"metrics": [{"name": "current_assets", "value": "n/a?"}]}"#;

    fn config() -> Arc<PipelineConfig> {
        Arc::new(PipelineConfig {
            retry: RetryPolicy {
                max_retries: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
                multiplier: 2.0,
                jitter: false,
            },
            adapter_timeout_ms: 50,
            max_rows_per_table: 2,
            ..PipelineConfig::default()
        })
    }

    fn extractor(adapter: Arc<dyn ExtractionAdapter>) -> TableExtractor {
        TableExtractor::new(adapter, Arc::new(MetricSchema::default_financial()), config())
    }

    fn region() -> TableRegion {
        TableRegion {
            sheet_index: 0,
            sheet_name: "Sheet1".to_string(),
            bbox: BoundingBox {
                top: 0,
                left: 0,
                bottom: 4,
                right: 1,
            },
            headers: vec!["Item".to_string(), "Amount".to_string()],
        }
    }

    fn rows(count: u32) -> Vec<NormalizedRow> {
        (1..=count)
            .map(|source_row| NormalizedRow {
                source_row,
                cells: vec![
                    NormalizedCell {
                        column: "Item".to_string(),
                        value: NormalizedValue::String(format!("line {}", source_row)),
                        flag: None,
                    },
                    NormalizedCell {
                        column: "Amount".to_string(),
                        value: NormalizedValue::Number(f64::from(source_row) * 10.0),
                        flag: None,
                    },
                ],
            })
            .collect()
    }

    fn control() -> RunControl {
        RunControl::new(&CancellationToken::new())
    }

    #[test]
    fn test_build_request_truncates_with_totals() {
        let extractor = extractor(ScriptedAdapter::new(vec![]));
        let request = extractor.build_request(&region(), rows(4));

        assert_eq!(request.rows.len(), 2);
        let truncation = request.truncation.unwrap();
        assert_eq!(truncation.total_rows, 4);
        assert_eq!(truncation.omitted_rows, 2);
        assert_eq!(truncation.first_omitted_row, 3);
        assert_eq!(truncation.last_omitted_row, 4);
        assert_eq!(truncation.omitted_numeric_totals["Amount"], 70.0);
        assert!(request.corrective_context.is_none());
    }

    #[tokio::test]
    async fn test_valid_first_answer() {
        let adapter = ScriptedAdapter::new(vec![Ok(VALID)]);
        let outcome = extractor(adapter.clone())
            .extract(0, &region(), rows(2), &control())
            .await;

        match outcome {
            TableOutcome::Extracted {
                candidates,
                adapter_calls,
                repaired,
            } => {
                assert_eq!(candidates.len(), 1);
                assert_eq!(adapter_calls, 1);
                assert!(!repaired);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn test_single_repair_with_corrective_context() {
        let adapter = ScriptedAdapter::new(vec![Ok(INVALID), Ok(VALID)]);
        let outcome = extractor(adapter.clone())
            .extract(0, &region(), rows(2), &control())
            .await;

        assert!(matches!(outcome, TableOutcome::Extracted { repaired: true, .. }));
        let contexts = adapter.contexts.lock().unwrap().clone();
        assert!(contexts[0].is_none());
        let feedback = contexts[1].as_ref().unwrap();
        assert!(feedback.contains("Attempt 1/2"));
        assert!(feedback.contains("must be a number"));
    }

    #[tokio::test]
    async fn test_invalid_twice_fails_after_two_calls() {
        let adapter = ScriptedAdapter::new(vec![Ok(INVALID), Ok(INVALID), Ok(VALID)]);
        let outcome = extractor(adapter.clone())
            .extract(0, &region(), rows(2), &control())
            .await;

        assert_eq!(outcome.failure_kind(), Some(FailureKind::ValidationFailed));
        assert_eq!(adapter.calls(), 2);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let adapter = ScriptedAdapter::new(vec![
            Err(AdapterError::rate_limited("slow down")),
            Err(AdapterError::timeout("busy")),
            Ok(VALID),
        ]);
        let outcome = extractor(adapter.clone())
            .extract(0, &region(), rows(2), &control())
            .await;

        assert!(matches!(outcome, TableOutcome::Extracted { adapter_calls: 3, .. }));
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let adapter = ScriptedAdapter::new(vec![
            Err(AdapterError::rate_limited("1")),
            Err(AdapterError::rate_limited("2")),
            Err(AdapterError::rate_limited("3")),
            Ok(VALID),
        ]);
        let outcome = extractor(adapter.clone())
            .extract(0, &region(), rows(2), &control())
            .await;

        assert_eq!(outcome.failure_kind(), Some(FailureKind::RetriesExhausted));
        assert_eq!(adapter.calls(), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let adapter = ScriptedAdapter::new(vec![
            Err(AdapterError::invalid_request("bad key")),
            Ok(VALID),
        ]);
        let outcome = extractor(adapter.clone())
            .extract(0, &region(), rows(2), &control())
            .await;

        assert_eq!(outcome.failure_kind(), Some(FailureKind::AdapterPermanentError));
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn test_per_call_timeout_counts_as_transient() {
        let outcome = extractor(Arc::new(SlowAdapter))
            .extract(0, &region(), rows(2), &control())
            .await;

        match outcome {
            TableOutcome::Failed { kind, reason } => {
                assert_eq!(kind, FailureKind::RetriesExhausted);
                assert!(reason.contains("no response within 50 ms"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_in_flight_call() {
        let token = CancellationToken::new();
        let control = RunControl::new(&token);
        let mut config = (*config()).clone();
        config.adapter_timeout_ms = 10_000;
        let extractor = TableExtractor::new(
            Arc::new(SlowAdapter),
            Arc::new(MetricSchema::default_financial()),
            Arc::new(config),
        );

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let outcome = extractor.extract(0, &region(), rows(2), &control).await;
        match outcome {
            TableOutcome::Failed { kind, reason } => {
                assert_eq!(kind, FailureKind::Cancelled);
                assert_eq!(reason, "run cancelled during adapter call");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deadline_reason_and_parent_token() {
        let parent = CancellationToken::new();
        let control = RunControl::new(&parent);
        control.expire_deadline();

        let adapter = ScriptedAdapter::new(vec![Ok(VALID)]);
        let outcome = extractor(adapter.clone())
            .extract(3, &region(), rows(2), &control)
            .await;

        assert_eq!(
            outcome,
            TableOutcome::failed(
                FailureKind::Cancelled,
                "run deadline exceeded before extraction started"
            )
        );
        assert_eq!(adapter.calls(), 0);
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_progress_events() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let adapter = ScriptedAdapter::new(vec![Ok(INVALID), Ok(VALID)]);
        let extractor = extractor(adapter).with_progress(tx);
        extractor.extract(7, &region(), rows(2), &control()).await;
        drop(extractor);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert!(matches!(events[0], ExtractionEvent::TableStarted { table: 7 }));
        assert!(matches!(events[1], ExtractionEvent::CorrectionNeeded { table: 7, .. }));
        assert!(matches!(
            events[2],
            ExtractionEvent::TableFinished {
                table: 7,
                success: true
            }
        ));
    }
}
