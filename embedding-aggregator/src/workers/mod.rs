use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, gauge, histogram};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    health::{ComponentStatus, HealthHandle},
    metric_consts::{
        BATCHES_COMMITTED, BATCHES_WITHHELD, BATCH_SIZE, BATCH_TIME, COMMIT_FAILURES,
        POLL_FAILURES,
    },
    source::{EventSource, SourceError},
};

pub mod content;
pub mod interactions;

/// How a worker waits for work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Longest a single poll may block.
    pub max_wait: Duration,
    /// Pause after an empty poll, or after a batch had to be withheld.
    pub idle_interval: Duration,
    /// Poll errors in a row before the broker connection is given up on.
    pub max_consecutive_failures: u32,
}

/// Tally of one batch. Only a batch with no failures is committed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

/// The per-role part of a worker: what to do with a decoded batch.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    type Event: Send;

    async fn handle_batch(&self, batch: Vec<Self::Event>) -> BatchReport;
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("{worker}: broker connection lost: {source}")]
    BrokerLost {
        worker: &'static str,
        source: SourceError,
    },
}

/// What a single iteration of the loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iteration {
    /// Nothing arrived before the poll deadline.
    Empty,
    /// The batch was fully handled and its offsets committed.
    Committed(BatchReport),
    /// Something in the batch failed; it was rewound for redelivery.
    Withheld(BatchReport),
    /// The batch was handled but the commit didn't go through, so it will be
    /// delivered again.
    CommitFailed(BatchReport),
    /// The poll itself failed with a recoverable error.
    PollFailed,
}

/// Drives one consumption loop: poll, handle, commit or rewind. Strictly
/// sequential, so one worker never has two batches in flight.
pub struct Worker<S, H> {
    name: &'static str,
    source: S,
    handler: H,
    policy: PollPolicy,
    liveness: Option<HealthHandle>,
    consecutive_poll_failures: u32,
}

impl<S, H> Worker<S, H>
where
    S: EventSource,
    H: BatchHandler<Event = S::Event>,
{
    pub fn new(name: &'static str, source: S, handler: H, policy: PollPolicy) -> Self {
        Self {
            name,
            source,
            handler,
            policy,
            liveness: None,
            consecutive_poll_failures: 0,
        }
    }

    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub async fn run_once(&mut self) -> Result<Iteration, WorkerError> {
        let batch = match self.source.poll(self.policy.max_wait).await {
            Ok(batch) => {
                self.consecutive_poll_failures = 0;
                batch
            }
            Err(e) => return self.poll_failed(e).await,
        };

        if batch.is_empty() {
            return Ok(Iteration::Empty);
        }

        let labels = [("worker", self.name)];
        gauge!(BATCH_SIZE, &labels).set(batch.len() as f64);
        let start = Instant::now();

        let report = self.handler.handle_batch(batch).await;
        histogram!(BATCH_TIME, &labels).record(start.elapsed().as_millis() as f64);

        if !report.is_complete() {
            warn!(
                worker = self.name,
                processed = report.processed,
                skipped = report.skipped,
                failed = report.failed,
                "batch incomplete, withholding commit"
            );
            counter!(BATCHES_WITHHELD, &labels).increment(1);
            self.rewind().await;
            return Ok(Iteration::Withheld(report));
        }

        if let Err(e) = self.source.commit().await {
            error!(worker = self.name, "failed to commit batch: {e}");
            counter!(COMMIT_FAILURES, &labels).increment(1);
            self.rewind().await;
            return Ok(Iteration::CommitFailed(report));
        }

        debug!(
            worker = self.name,
            processed = report.processed,
            skipped = report.skipped,
            "committed batch"
        );
        counter!(BATCHES_COMMITTED, &labels).increment(1);
        Ok(Iteration::Committed(report))
    }

    /// Loop until `shutdown` fires or the broker is gone for good. Shutdown is only
    /// observed between iterations and while idle, never mid-batch.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        info!(worker = self.name, "starting");

        while !shutdown.is_cancelled() {
            self.report_healthy();

            let iteration = match self.run_once().await {
                Ok(iteration) => iteration,
                Err(e) => {
                    error!(worker = self.name, "stopping: {e}");
                    if let Some(liveness) = &self.liveness {
                        liveness.report_status(ComponentStatus::Unhealthy);
                    }
                    return Err(e);
                }
            };

            if matches!(iteration, Iteration::Committed(_)) {
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => {},
                _ = tokio::time::sleep(self.policy.idle_interval) => {},
            }
        }

        info!(worker = self.name, "shut down");
        Ok(())
    }

    async fn poll_failed(&mut self, e: SourceError) -> Result<Iteration, WorkerError> {
        counter!(POLL_FAILURES, "worker" => self.name).increment(1);
        self.consecutive_poll_failures += 1;

        if e.is_fatal() || self.consecutive_poll_failures >= self.policy.max_consecutive_failures
        {
            return Err(WorkerError::BrokerLost {
                worker: self.name,
                source: e,
            });
        }

        warn!(
            worker = self.name,
            failures = self.consecutive_poll_failures,
            "poll failed: {e}"
        );
        // Whatever was read before the error goes back on the queue
        self.rewind().await;
        Ok(Iteration::PollFailed)
    }

    async fn rewind(&mut self) {
        if let Err(e) = self.source.rollback().await {
            // Redelivery still happens from the last commit once the consumer
            // rejoins, so this is only worth a warning
            warn!(worker = self.name, "failed to rewind source: {e}");
        }
    }

    fn report_healthy(&self) {
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy();
        }
    }
}
