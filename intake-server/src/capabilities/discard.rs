use async_trait::async_trait;
use intake_core::{FileProcessor, ProcessRequest, ProcessorError};
use tracing::debug;

/// Accepts every file without touching it. The success sweep then deletes
/// the source.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardProcessor;

#[async_trait]
impl FileProcessor for DiscardProcessor {
    async fn process(&self, request: &ProcessRequest) -> Result<(), ProcessorError> {
        debug!(target: "intake::capability", path = %request.source.display(), "discarding");
        Ok(())
    }
}
