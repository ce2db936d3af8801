use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    metric_consts::{CONTENT_FAILED, CONTENT_INGESTED, CONTENT_ROW_MISSING, CONTENT_SKIPPED},
    sink::{ContentMetadata, ContentVectorSink, SinkError},
    store::{RelationalStore, RowUpdate, StoreError},
    types::ContentReadyEvent,
};

use super::{BatchHandler, BatchReport};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("vector index upsert failed: {0}")]
    Sink(#[from] SinkError),
    #[error("status update failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Ingested,
    /// Indexed, but there was no `videos` row to flip.
    RowMissing,
    /// No embedding yet; upstream re-emits once there is one.
    NoEmbedding,
    WrongDimension,
}

/// Moves content vectors from ready events into the vector index and the store.
pub struct ContentHandler {
    sink: Arc<dyn ContentVectorSink>,
    store: Arc<dyn RelationalStore>,
    dimension: usize,
}

impl ContentHandler {
    pub fn new(
        sink: Arc<dyn ContentVectorSink>,
        store: Arc<dyn RelationalStore>,
        dimension: usize,
    ) -> Self {
        Self {
            sink,
            store,
            dimension,
        }
    }

    /// The store is only touched once the index has the vector, so a row is never
    /// marked ready for content that can't be recommended.
    pub async fn ingest(&self, event: &ContentReadyEvent) -> Result<IngestOutcome, IngestError> {
        let Some(embedding) = &event.embedding else {
            return Ok(IngestOutcome::NoEmbedding);
        };
        if embedding.len() != self.dimension {
            return Ok(IngestOutcome::WrongDimension);
        }

        self.sink
            .upsert(&event.id, embedding, &ContentMetadata::from(event))
            .await?;

        match self.store.mark_content_ready(&event.id, embedding).await? {
            RowUpdate::Updated => Ok(IngestOutcome::Ingested),
            RowUpdate::Missing => Ok(IngestOutcome::RowMissing),
        }
    }
}

#[async_trait]
impl BatchHandler for ContentHandler {
    type Event = ContentReadyEvent;

    async fn handle_batch(&self, batch: Vec<ContentReadyEvent>) -> BatchReport {
        let mut report = BatchReport::default();

        for event in &batch {
            match self.ingest(event).await {
                Ok(IngestOutcome::Ingested) => {
                    debug!(video_id = %event.id, "ingested content vector");
                    counter!(CONTENT_INGESTED).increment(1);
                    report.processed += 1;
                }
                Ok(IngestOutcome::RowMissing) => {
                    counter!(CONTENT_INGESTED).increment(1);
                    counter!(CONTENT_ROW_MISSING).increment(1);
                    report.processed += 1;
                }
                Ok(IngestOutcome::NoEmbedding) => {
                    info!(
                        video_id = %event.id,
                        status = event.status.as_str(),
                        "no embedding yet, skipping"
                    );
                    counter!(CONTENT_SKIPPED, "cause" => "no_embedding").increment(1);
                    report.skipped += 1;
                }
                Ok(IngestOutcome::WrongDimension) => {
                    warn!(
                        video_id = %event.id,
                        len = event.embedding.as_ref().map_or(0, Vec::len),
                        expected = self.dimension,
                        "embedding has wrong dimension, skipping"
                    );
                    counter!(CONTENT_SKIPPED, "cause" => "wrong_dimension").increment(1);
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(video_id = %event.id, "failed to ingest content: {e}");
                    counter!(CONTENT_FAILED).increment(1);
                    report.failed += 1;
                }
            }
        }

        report
    }
}

/// Drop a video from the vector index so it stops being recommended. Its `videos`
/// row belongs to whoever deleted it.
pub async fn remove_content(sink: &dyn ContentVectorSink, video_id: &str) -> Result<(), SinkError> {
    sink.delete(video_id).await?;
    info!(video_id, "removed content vector");
    Ok(())
}
