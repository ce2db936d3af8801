use std::{marker::PhantomData, time::Duration};

use async_trait::async_trait;
use common_kafka::{
    batch_consumer::{is_fatal, BatchConsumer, RawMessage},
    config::{ConsumerConfig, KafkaConfig},
};
use metrics::counter;
use rdkafka::error::KafkaError;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    metric_consts::{MALFORMED_MESSAGES, MESSAGES_RECEIVED},
    types::BrokerEvent,
};

#[derive(Debug, Error)]
pub enum SourceError {
    /// The broker hiccuped; the batch can be retried.
    #[error("transient broker error: {0}")]
    Transient(String),
    /// The client can't recover and the worker should stop.
    #[error("fatal broker error: {0}")]
    Fatal(String),
}

impl SourceError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Fatal(_))
    }
}

impl From<KafkaError> for SourceError {
    fn from(error: KafkaError) -> Self {
        if is_fatal(&error) {
            SourceError::Fatal(error.to_string())
        } else {
            SourceError::Transient(error.to_string())
        }
    }
}

/// Pull interface over an offset-addressed log.
///
/// `poll` returns the next batch of decoded events, possibly empty, and never waits
/// longer than `max_wait`. After the batch's side effects are durable the caller
/// `commit`s; if they aren't, it calls `rollback` and the next `poll` sees the same
/// events again.
#[async_trait]
pub trait EventSource: Send {
    type Event: Send;

    async fn poll(&mut self, max_wait: Duration) -> Result<Vec<Self::Event>, SourceError>;

    async fn commit(&mut self) -> Result<(), SourceError>;

    async fn rollback(&mut self) -> Result<(), SourceError>;
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid event: {0}")]
    Invalid(String),
}

impl DecodeError {
    fn cause(&self) -> &'static str {
        match self {
            DecodeError::Empty => "empty",
            DecodeError::Json(_) => "json",
            DecodeError::Invalid(_) => "invalid",
        }
    }
}

pub fn decode<T>(payload: Option<&[u8]>) -> Result<T, DecodeError>
where
    T: BrokerEvent + serde::de::DeserializeOwned,
{
    let payload = payload.ok_or(DecodeError::Empty)?;
    let event: T = serde_json::from_slice(payload)?;
    event.validate().map_err(DecodeError::Invalid)?;
    Ok(event)
}

/// Kafka-backed source of one event type. Malformed messages are logged, counted
/// and dropped; their offsets still commit with the rest of the batch, so they
/// are gone for good. A batch with nothing left after decoding is committed
/// straight away.
pub struct KafkaEventSource<T> {
    consumer: BatchConsumer,
    max_batch_size: usize,
    _event: PhantomData<fn() -> T>,
}

impl<T> KafkaEventSource<T> {
    pub fn subscribe(
        kafka: &KafkaConfig,
        consumer: &ConsumerConfig,
        max_batch_size: usize,
    ) -> Result<Self, SourceError> {
        Ok(Self {
            consumer: BatchConsumer::subscribe(kafka, consumer)?,
            max_batch_size,
            _event: PhantomData,
        })
    }

    fn decode_batch(&self, raw: Vec<RawMessage>) -> Vec<T>
    where
        T: BrokerEvent + serde::de::DeserializeOwned,
    {
        let topic = self.consumer.topic().to_string();
        counter!(MESSAGES_RECEIVED, "topic" => topic.clone()).increment(raw.len() as u64);

        raw.into_iter()
            .filter_map(|message| match decode::<T>(message.payload.as_deref()) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(
                        topic = %topic,
                        partition = message.partition,
                        offset = message.offset,
                        "dropping malformed message: {e}"
                    );
                    counter!(MALFORMED_MESSAGES, "topic" => topic.clone(), "cause" => e.cause())
                        .increment(1);
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl<T> EventSource for KafkaEventSource<T>
where
    T: BrokerEvent + serde::de::DeserializeOwned,
{
    type Event = T;

    async fn poll(&mut self, max_wait: Duration) -> Result<Vec<T>, SourceError> {
        let raw = self
            .consumer
            .recv_batch(self.max_batch_size, max_wait)
            .await?;
        let received = raw.len();
        let events = self.decode_batch(raw);

        // Nothing reaches the worker, so nothing would ever commit these offsets
        if events.is_empty() && received > 0 {
            debug!(
                topic = self.consumer.topic(),
                dropped = received,
                "committing batch of malformed messages"
            );
            self.consumer.commit()?;
        }
        Ok(events)
    }

    async fn commit(&mut self) -> Result<(), SourceError> {
        Ok(self.consumer.commit()?)
    }

    async fn rollback(&mut self) -> Result<(), SourceError> {
        Ok(self.consumer.rewind()?)
    }
}

#[cfg(test)]
mod tests {
    use rdkafka::{
        mocking::MockCluster,
        producer::{DefaultProducerContext, FutureProducer, FutureRecord},
        ClientConfig,
    };

    use super::*;
    use crate::types::{ContentReadyEvent, InteractionEvent};

    #[test]
    fn decodes_valid_interaction() {
        let payload = br#"{"userId":"u","videoId":"v","viewDuration":3,"liked":false,
            "commented":false,"shared":false,"timestamp":"2024-01-01T00:00:00Z","weightedScore":0.4}"#;
        let event: InteractionEvent = decode(Some(&payload[..])).unwrap();
        assert_eq!(event.video_id, "v");
    }

    #[test]
    fn classifies_bad_payloads() {
        assert!(matches!(
            decode::<InteractionEvent>(None),
            Err(DecodeError::Empty)
        ));
        assert!(matches!(
            decode::<InteractionEvent>(Some(&b"{not json"[..])),
            Err(DecodeError::Json(_))
        ));
        let blank_user = br#"{"userId":"","videoId":"v","timestamp":"2024-01-01T00:00:00Z","weightedScore":1}"#;
        assert!(matches!(
            decode::<InteractionEvent>(Some(&blank_user[..])),
            Err(DecodeError::Invalid(_))
        ));
        let bad_vector = br#"{"id":"v","userId":"u","title":"t","fileUrl":"f",
            "createdAt":"2024-01-01T00:00:00Z","status":"ready","embedding":[1, null]}"#;
        assert!(matches!(
            decode::<ContentReadyEvent>(Some(&bad_vector[..])),
            Err(DecodeError::Json(_))
        ));
    }

    const TOPIC: &str = "interactions-source-test";
    const WAIT: Duration = Duration::from_secs(30);

    fn mock_kafka() -> (MockCluster<'static, DefaultProducerContext>, KafkaConfig) {
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        cluster
            .create_topic(TOPIC, 1, 1)
            .expect("failed to create mock topic");

        let config = KafkaConfig {
            kafka_hosts: cluster.bootstrap_servers(),
            kafka_tls: false,
            kafka_consumer_offset_reset: "earliest".to_string(),
            kafka_session_timeout_ms: 10000,
        };
        (cluster, config)
    }

    async fn produce(config: &KafkaConfig, payloads: &[String]) {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.kafka_hosts)
            .create()
            .expect("failed to create mock producer");

        for payload in payloads {
            producer
                .send(
                    FutureRecord::<(), _>::to(TOPIC).payload(payload.as_str()),
                    Duration::from_secs(5),
                )
                .await
                .expect("failed to produce");
        }
    }

    fn interaction_json(user_id: &str, video_id: &str) -> String {
        format!(
            r#"{{"userId":"{user_id}","videoId":"{video_id}","timestamp":"2024-01-01T00:00:00Z","weightedScore":1}}"#
        )
    }

    // Sized to the messages each test expects, so polls return as soon as they're in
    fn subscribe(
        config: &KafkaConfig,
        group: &str,
        batch_size: usize,
    ) -> KafkaEventSource<InteractionEvent> {
        KafkaEventSource::subscribe(config, &ConsumerConfig::new(group, TOPIC), batch_size)
            .unwrap()
    }

    #[tokio::test]
    async fn malformed_message_is_dropped_from_a_mixed_batch() {
        let (_cluster, config) = mock_kafka();
        produce(
            &config,
            &[
                interaction_json("alice", "cats"),
                "{garbage".to_string(),
                interaction_json("bob", "dogs"),
            ],
        )
        .await;

        let mut source = subscribe(&config, "mixed-batch", 3);
        let events = source.poll(WAIT).await.unwrap();
        let users: Vec<&str> = events.iter().map(|e| e.user_id.as_str()).collect();
        assert_eq!(users, vec!["alice", "bob"]);
        source.commit().await.unwrap();
        drop(source);

        // The next member of the group starts after all three offsets
        produce(&config, &[interaction_json("carol", "birds")]).await;
        let mut next = subscribe(&config, "mixed-batch", 1);
        let events = next.poll(WAIT).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].user_id, "carol");
    }

    #[tokio::test]
    async fn batch_of_only_malformed_messages_is_committed() {
        let (_cluster, config) = mock_kafka();
        produce(&config, &["{not json".to_string(), "garbage".to_string()]).await;

        let mut source = subscribe(&config, "all-malformed", 2);
        let events = source.poll(WAIT).await.unwrap();
        assert!(events.is_empty());
        // Committed without any help from the caller
        assert_eq!(source.consumer.pending_partitions(), 0);
        drop(source);

        produce(&config, &[interaction_json("alice", "cats")]).await;
        let mut next = subscribe(&config, "all-malformed", 1);
        let events = next.poll(WAIT).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].user_id, "alice");
    }
}
