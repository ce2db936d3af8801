use std::{collections::BTreeMap, fmt, time::Duration};

use rdkafka::{
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::KafkaError,
    types::RDKafkaErrorCode,
    ClientConfig, Message, Offset, TopicPartitionList,
};
use tracing::{debug, info};

use crate::config::{ConsumerConfig, KafkaConfig};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// A single-topic consumer that hands out messages in batches and only moves the
/// group's committed position when told to.
///
/// Offsets are never stored or committed automatically. Every message returned by
/// `recv_batch` is tracked as pending until either `commit` (the batch's side effects
/// are durable) or `rewind` (they aren't, and the batch must be seen again) is called.
pub struct BatchConsumer {
    consumer: StreamConsumer,
    topic: String,
    group: String,
    pending: BTreeMap<i32, PendingRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingRange {
    first: i64,
    last: i64,
}

/// A message copied out of the consumer's buffer, payload undecoded.
pub struct RawMessage {
    pub partition: i32,
    pub offset: i64,
    pub payload: Option<Vec<u8>>,
}

impl fmt::Debug for RawMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ partition: {}, offset: {}, bytes: {} }}",
            self.partition,
            self.offset,
            self.payload.as_ref().map(Vec::len).unwrap_or_default()
        )
    }
}

impl BatchConsumer {
    pub fn subscribe(
        common_config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
    ) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &common_config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &consumer_config.group)
            .set(
                "auto.offset.reset",
                &common_config.kafka_consumer_offset_reset,
            )
            .set(
                "session.timeout.ms",
                common_config.kafka_session_timeout_ms.to_string(),
            )
            // Positions only move when a batch has been fully handled
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false");

        if common_config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka consumer configuration: {:?}", client_config);
        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[consumer_config.topic.as_str()])?;

        info!(
            topic = %consumer_config.topic,
            group = %consumer_config.group,
            "subscribed"
        );

        Ok(Self {
            consumer,
            topic: consumer_config.topic.clone(),
            group: consumer_config.group.clone(),
            pending: BTreeMap::new(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Number of partitions with uncommitted messages.
    pub fn pending_partitions(&self) -> usize {
        self.pending.len()
    }

    /// Receive up to `max` messages, returning early once `max_wait` has elapsed. An
    /// empty vec means nothing arrived in time. A broker error aborts the batch; the
    /// messages read before it stay pending, so callers should `rewind`.
    pub async fn recv_batch(
        &mut self,
        max: usize,
        max_wait: Duration,
    ) -> Result<Vec<RawMessage>, KafkaError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        let mut batch = Vec::with_capacity(max.min(1024));

        while batch.len() < max {
            let message = match tokio::time::timeout_at(deadline, self.consumer.recv()).await {
                Err(_elapsed) => break,
                Ok(result) => result?,
            };

            let raw = RawMessage {
                partition: message.partition(),
                offset: message.offset(),
                payload: message.payload().map(<[u8]>::to_vec),
            };

            self.pending
                .entry(raw.partition)
                .and_modify(|range| {
                    range.first = range.first.min(raw.offset);
                    range.last = range.last.max(raw.offset);
                })
                .or_insert(PendingRange {
                    first: raw.offset,
                    last: raw.offset,
                });

            batch.push(raw);
        }

        Ok(batch)
    }

    /// Durably commit everything handed out since the last commit or rewind.
    pub fn commit(&mut self) -> Result<(), KafkaError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let mut positions = TopicPartitionList::new();
        for (partition, range) in &self.pending {
            // The committed offset is the next one to read
            positions.add_partition_offset(
                &self.topic,
                *partition,
                Offset::Offset(range.last + 1),
            )?;
        }

        self.consumer.commit(&positions, CommitMode::Sync)?;
        debug!(
            topic = %self.topic,
            group = %self.group,
            partitions = self.pending.len(),
            "committed batch"
        );
        self.pending.clear();
        Ok(())
    }

    /// Move the read position back to the start of the pending messages, so the next
    /// `recv_batch` sees them again. Pending state is dropped even on error: if the
    /// seek failed because the partition was revoked, the next owner resumes from the
    /// last commit anyway.
    pub fn rewind(&mut self) -> Result<(), KafkaError> {
        let pending = std::mem::take(&mut self.pending);
        for (partition, range) in pending {
            self.consumer.seek(
                &self.topic,
                partition,
                Offset::Offset(range.first),
                SEEK_TIMEOUT,
            )?;
            debug!(topic = %self.topic, partition, offset = range.first, "rewound partition");
        }
        Ok(())
    }
}

/// Whether a consumer error means the client instance can't recover.
pub fn is_fatal(error: &KafkaError) -> bool {
    matches!(
        error.rdkafka_error_code(),
        Some(RDKafkaErrorCode::Fatal)
            | Some(RDKafkaErrorCode::Authentication)
            | Some(RDKafkaErrorCode::SaslAuthenticationFailed)
    )
}
