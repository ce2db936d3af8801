use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
    aggregator::{Aggregation, EmbeddingAggregator},
    metric_consts::{
        UNRESOLVED_CONTENT, USER_GROUPS_FAILED, USER_GROUPS_SKIPPED, USER_GROUPS_UPDATED,
    },
    store::{RelationalStore, StoreError},
    types::InteractionEvent,
};

use super::{BatchHandler, BatchReport};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Error)]
pub enum GroupError {
    #[error("failed to resolve content vectors: {0}")]
    Resolve(#[source] StoreError),
    #[error("failed to read prior embedding: {0}")]
    ReadPrior(#[source] StoreError),
    #[error("failed to write embedding: {0}")]
    Write(#[source] StoreError),
}

/// What happened to one user's slice of the batch.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupOutcome {
    Updated(Aggregation),
    /// None of the referenced content resolved to a usable vector, or the weights
    /// summed to zero. Nothing was written.
    NoDelta,
}

/// Split a batch by user. Every event lands in exactly one group; groups come out
/// in order of each user's first event and keep their events in arrival order.
pub fn group_by_user(batch: Vec<InteractionEvent>) -> Vec<(String, Vec<InteractionEvent>)> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<InteractionEvent>)> = Vec::new();

    for event in batch {
        match index.get(&event.user_id) {
            Some(&i) => groups[i].1.push(event),
            None => {
                index.insert(event.user_id.clone(), groups.len());
                groups.push((event.user_id.clone(), vec![event]));
            }
        }
    }
    groups
}

/// Folds interaction batches into per-user embeddings.
pub struct InteractionHandler {
    store: Arc<dyn RelationalStore>,
    aggregator: EmbeddingAggregator,
    clock: Clock,
}

impl InteractionHandler {
    pub fn new(store: Arc<dyn RelationalStore>, aggregator: EmbeddingAggregator) -> Self {
        Self::with_clock(store, aggregator, Arc::new(Utc::now))
    }

    pub fn with_clock(
        store: Arc<dyn RelationalStore>,
        aggregator: EmbeddingAggregator,
        clock: Clock,
    ) -> Self {
        Self {
            store,
            aggregator,
            clock,
        }
    }

    pub async fn process_user(
        &self,
        user_id: &str,
        interactions: &[InteractionEvent],
    ) -> Result<GroupOutcome, GroupError> {
        let mut seen = HashSet::new();
        let video_ids: Vec<String> = interactions
            .iter()
            .filter(|i| seen.insert(i.video_id.as_str()))
            .map(|i| i.video_id.clone())
            .collect();

        let vectors = self
            .store
            .content_vectors(&video_ids)
            .await
            .map_err(GroupError::Resolve)?;

        let unresolved = video_ids.len().saturating_sub(vectors.len());
        if unresolved > 0 {
            debug!(user_id, unresolved, "some content has no stored vector yet");
            counter!(UNRESOLVED_CONTENT).increment(unresolved as u64);
        }

        let prior = self
            .store
            .user_embedding(user_id)
            .await
            .map_err(GroupError::ReadPrior)?;

        let now = (self.clock)();
        let pairs = interactions
            .iter()
            .map(|i| (i, vectors.get(&i.video_id).map(Vec::as_slice)));

        let Some(aggregation) = self.aggregator.aggregate(prior.as_ref(), pairs, now) else {
            return Ok(GroupOutcome::NoDelta);
        };

        self.store
            .upsert_user_embedding(user_id, &aggregation.vector, now)
            .await
            .map_err(GroupError::Write)?;

        Ok(GroupOutcome::Updated(aggregation))
    }
}

#[async_trait]
impl BatchHandler for InteractionHandler {
    type Event = InteractionEvent;

    async fn handle_batch(&self, batch: Vec<InteractionEvent>) -> BatchReport {
        let mut report = BatchReport::default();

        // Keep going after a failure: the batch will be redelivered whole anyway,
        // and the other users' writes are no worse for having happened
        for (user_id, interactions) in group_by_user(batch) {
            match self.process_user(&user_id, &interactions).await {
                Ok(GroupOutcome::Updated(aggregation)) => {
                    debug!(
                        user_id,
                        interactions_used = aggregation.interactions_used,
                        merged = aggregation.merged_with_prior,
                        "updated user embedding"
                    );
                    counter!(USER_GROUPS_UPDATED).increment(1);
                    report.processed += 1;
                }
                Ok(GroupOutcome::NoDelta) => {
                    info!(
                        user_id,
                        interactions = interactions.len(),
                        "no usable content vectors, leaving embedding as is"
                    );
                    counter!(USER_GROUPS_SKIPPED).increment(1);
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(user_id, "failed to update user embedding: {e}");
                    counter!(USER_GROUPS_FAILED).increment(1);
                    report.failed += 1;
                }
            }
        }

        report
    }
}
