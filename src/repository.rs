use crate::error::Result;
use crate::report::ReportResult;
use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Persistence collaborator. `save` must be an idempotent upsert keyed by upload id since
/// the pipeline delivers at least once.
#[async_trait]
pub trait ReportRepository: Send + Sync {
    async fn save(&self, report: &ReportResult) -> Result<()>;

    async fn get(&self, upload_id: Uuid) -> Result<Option<ReportResult>>;
}

#[derive(Debug, Default)]
pub struct InMemoryReportRepository {
    reports: RwLock<HashMap<Uuid, ReportResult>>,
}

impl InMemoryReportRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.reports.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.reports.read().await.is_empty()
    }
}

#[async_trait]
impl ReportRepository for InMemoryReportRepository {
    async fn save(&self, report: &ReportResult) -> Result<()> {
        debug!("Saving report {}", report.upload_id);
        self.reports
            .write()
            .await
            .insert(report.upload_id, report.clone());
        Ok(())
    }

    async fn get(&self, upload_id: Uuid) -> Result<Option<ReportResult>> {
        Ok(self.reports.read().await.get(&upload_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{ReportAggregator, ReportStatus};

    #[tokio::test]
    async fn test_save_is_an_upsert() {
        let repo = InMemoryReportRepository::new();
        let upload_id = Uuid::new_v4();
        let first = ReportAggregator::aggregate(upload_id, Vec::new(), Vec::new());

        repo.save(&first).await.unwrap();
        repo.save(&first).await.unwrap();

        assert_eq!(repo.len().await, 1);
        let stored = repo.get(upload_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReportStatus::Complete);
        assert!(repo.get(Uuid::new_v4()).await.unwrap().is_none());
    }
}
