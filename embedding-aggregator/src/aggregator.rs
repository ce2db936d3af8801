use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::types::{InteractionEvent, StoredEmbedding};

/// Weight halves every half-life.
pub const DECAY_FACTOR: f64 = 0.5;
pub const DEFAULT_HALF_LIFE_DAYS: f64 = 30.0;
/// Share of the merged vector taken from the user's (decayed) history.
pub const DEFAULT_MERGE_ALPHA: f64 = 0.7;
pub const DEFAULT_DIMENSION: usize = 1536;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregatorSettings {
    pub dimension: usize,
    pub half_life_days: f64,
    pub alpha: f64,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            dimension: DEFAULT_DIMENSION,
            half_life_days: DEFAULT_HALF_LIFE_DAYS,
            alpha: DEFAULT_MERGE_ALPHA,
        }
    }
}

/// `0.5 ^ (days / half_life)`. Elapsed time is taken at millisecond resolution, and
/// negative spans (an event stamped in the future) count as no time at all.
pub fn decay(elapsed: chrono::Duration, half_life_days: f64) -> f64 {
    let days = (elapsed.num_milliseconds().max(0) as f64) / MILLIS_PER_DAY;
    DECAY_FACTOR.powf(days / half_life_days)
}

/// `alpha * prior + (1 - alpha) * delta`, elementwise.
pub fn merge(prior: &[f64], delta: &[f64], alpha: f64) -> Vec<f64> {
    prior
        .iter()
        .zip(delta)
        .map(|(p, d)| alpha * p + (1.0 - alpha) * d)
        .collect()
}

/// Running weighted sum for a delta vector. Vectors of the wrong length are
/// refused rather than truncated or padded.
#[derive(Debug, Clone)]
pub struct DeltaAccumulator {
    sum: Vec<f64>,
    total_weight: f64,
    accepted: usize,
}

impl DeltaAccumulator {
    pub fn new(dimension: usize) -> Self {
        Self {
            sum: vec![0.0; dimension],
            total_weight: 0.0,
            accepted: 0,
        }
    }

    pub fn add(&mut self, vector: &[f64], weight: f64) -> bool {
        if vector.len() != self.sum.len() || !weight.is_finite() {
            return false;
        }
        for (acc, x) in self.sum.iter_mut().zip(vector) {
            *acc += weight * x;
        }
        self.total_weight += weight;
        self.accepted += 1;
        true
    }

    pub fn accepted(&self) -> usize {
        self.accepted
    }

    /// The weighted centroid, or `None` if nothing was added or the weights cancel out.
    pub fn finish(self) -> Option<Vec<f64>> {
        if self.accepted == 0 || self.total_weight == 0.0 {
            return None;
        }
        let total = self.total_weight;
        let centroid: Vec<f64> = self.sum.into_iter().map(|x| x / total).collect();
        centroid.iter().all(|x| x.is_finite()).then_some(centroid)
    }
}

/// What aggregating one user's batch produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub vector: Vec<f64>,
    pub merged_with_prior: bool,
    pub interactions_used: usize,
}

#[derive(Debug, Clone)]
pub struct EmbeddingAggregator {
    settings: AggregatorSettings,
}

impl EmbeddingAggregator {
    pub fn new(settings: AggregatorSettings) -> Self {
        Self { settings }
    }

    pub fn decay_since(&self, then: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        decay(now - then, self.settings.half_life_days)
    }

    /// Weighted centroid of the resolved content vectors, each interaction weighted
    /// by its score times its age decay. Pairs without a vector are skipped.
    pub fn delta<'a, I>(&self, pairs: I, now: DateTime<Utc>) -> Option<Vec<f64>>
    where
        I: IntoIterator<Item = (&'a InteractionEvent, Option<&'a [f64]>)>,
    {
        self.accumulate(pairs, now).finish()
    }

    fn accumulate<'a, I>(&self, pairs: I, now: DateTime<Utc>) -> DeltaAccumulator
    where
        I: IntoIterator<Item = (&'a InteractionEvent, Option<&'a [f64]>)>,
    {
        let mut acc = DeltaAccumulator::new(self.settings.dimension);
        for (interaction, vector) in pairs {
            let Some(vector) = vector else {
                continue;
            };
            let weight = interaction.weighted_score * self.decay_since(interaction.timestamp, now);
            if !acc.add(vector, weight) {
                warn!(
                    video_id = %interaction.video_id,
                    len = vector.len(),
                    expected = self.settings.dimension,
                    "skipping content vector with wrong dimension"
                );
            }
        }
        acc
    }

    /// The stored vector scaled down by the time since it was last written.
    pub fn decay_prior(&self, prior: &StoredEmbedding, now: DateTime<Utc>) -> Vec<f64> {
        let factor = self.decay_since(prior.updated_at, now);
        prior.vector.iter().map(|x| x * factor).collect()
    }

    /// Full update for one user: delta from the batch, merged into the decayed prior
    /// when there is one. `None` means the batch carried nothing usable.
    ///
    /// This isn't idempotent. Running it again over its own output with the same
    /// batch pulls the vector further towards the delta.
    pub fn aggregate<'a, I>(
        &self,
        prior: Option<&StoredEmbedding>,
        pairs: I,
        now: DateTime<Utc>,
    ) -> Option<Aggregation>
    where
        I: IntoIterator<Item = (&'a InteractionEvent, Option<&'a [f64]>)>,
    {
        let acc = self.accumulate(pairs, now);
        let interactions_used = acc.accepted();
        let delta = acc.finish()?;

        let prior = prior.filter(|p| {
            let fits = p.vector.len() == self.settings.dimension;
            if !fits {
                warn!(
                    len = p.vector.len(),
                    expected = self.settings.dimension,
                    "ignoring stored embedding with wrong dimension"
                );
            }
            fits
        });

        let Some(prior) = prior else {
            debug!(interactions_used, "no prior embedding, using delta as-is");
            return Some(Aggregation {
                vector: delta,
                merged_with_prior: false,
                interactions_used,
            });
        };

        let decayed = self.decay_prior(prior, now);
        Some(Aggregation {
            vector: merge(&decayed, &delta, self.settings.alpha),
            merged_with_prior: true,
            interactions_used,
        })
    }
}
