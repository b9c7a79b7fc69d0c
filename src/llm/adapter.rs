use crate::llm::types::{AdapterError, ExtractionRequest, RawModelOutput};
use async_trait::async_trait;

/// Boundary to the language-model capability.
///
/// Implementations must be stateless with respect to a request: the pipeline calls
/// `extract` concurrently for different tables and repeats it for the same request when
/// retrying, so a call may not have side effects beyond the call itself.
#[async_trait]
pub trait ExtractionAdapter: Send + Sync {
    async fn extract(&self, request: &ExtractionRequest) -> Result<RawModelOutput, AdapterError>;

    /// Short identifier used in logs.
    fn name(&self) -> &str {
        "adapter"
    }
}
