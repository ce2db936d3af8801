#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;

use embedding_aggregator::{
    sink::{ContentMetadata, ContentVectorSink, SinkError},
    source::{EventSource, SourceError},
    store::{RelationalStore, RowUpdate, StoreError},
    types::{ContentReadyEvent, ContentStatus, InteractionEvent, StoredEmbedding},
    workers::PollPolicy,
};

pub const DIM: usize = 4;

pub fn policy() -> PollPolicy {
    PollPolicy {
        max_wait: Duration::from_millis(10),
        idle_interval: Duration::from_millis(10),
        max_consecutive_failures: 3,
    }
}

pub fn unit(axis: usize) -> Vec<f64> {
    let mut v = vec![0.0; DIM];
    v[axis] = 1.0;
    v
}

pub fn interaction(
    user_id: &str,
    video_id: &str,
    score: f64,
    timestamp: DateTime<Utc>,
) -> InteractionEvent {
    InteractionEvent {
        user_id: user_id.to_string(),
        video_id: video_id.to_string(),
        view_duration_seconds: 30.0,
        liked: true,
        commented: false,
        shared: false,
        timestamp,
        weighted_score: score,
    }
}

pub fn content_ready(id: &str, embedding: Option<Vec<f64>>) -> ContentReadyEvent {
    ContentReadyEvent {
        id: id.to_string(),
        user_id: "creator".to_string(),
        title: format!("video {id}"),
        description: None,
        file_url: format!("https://cdn.example.com/{id}.mp4"),
        created_at: Utc::now(),
        metadata: serde_json::Value::Null,
        status: ContentStatus::Ready,
        duration_seconds: Some(60.0),
        embedding,
        trending_score: 0.0,
    }
}

/// In-memory log. A rollback puts the in-flight batch back at the head, so the
/// next poll sees it again, the same as a Kafka rewind.
pub struct FakeSource<E> {
    queue: VecDeque<Vec<E>>,
    in_flight: Option<Vec<E>>,
    poll_errors: VecDeque<SourceError>,
    pub polls: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub committed: Vec<E>,
}

impl<E: Clone> FakeSource<E> {
    pub fn new(batches: Vec<Vec<E>>) -> Self {
        Self {
            queue: batches.into(),
            in_flight: None,
            poll_errors: VecDeque::new(),
            polls: 0,
            commits: 0,
            rollbacks: 0,
            committed: Vec::new(),
        }
    }

    pub fn failing_with(mut self, errors: Vec<SourceError>) -> Self {
        self.poll_errors = errors.into();
        self
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}

#[async_trait]
impl<E: Clone + Send> EventSource for FakeSource<E> {
    type Event = E;

    async fn poll(&mut self, _max_wait: Duration) -> Result<Vec<E>, SourceError> {
        self.polls += 1;
        if let Some(e) = self.poll_errors.pop_front() {
            return Err(e);
        }
        let batch = self.queue.pop_front().unwrap_or_default();
        if !batch.is_empty() {
            self.in_flight = Some(batch.clone());
        }
        Ok(batch)
    }

    async fn commit(&mut self) -> Result<(), SourceError> {
        self.commits += 1;
        if let Some(batch) = self.in_flight.take() {
            self.committed.extend(batch);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SourceError> {
        self.rollbacks += 1;
        if let Some(batch) = self.in_flight.take() {
            self.queue.push_front(batch);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeStore {
    pub videos: Mutex<HashMap<String, (String, Option<Vec<f64>>)>>,
    pub users: Mutex<HashMap<String, StoredEmbedding>>,
    /// Resolving any of these ids fails the whole lookup.
    pub unreachable_videos: Mutex<HashSet<String>>,
    pub user_writes: Mutex<Vec<(String, Vec<f64>)>>,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_video(&self, id: &str, embedding: Option<Vec<f64>>) {
        self.videos
            .lock()
            .unwrap()
            .insert(id.to_string(), ("processing".to_string(), embedding));
    }

    pub fn set_user(&self, user_id: &str, vector: Vec<f64>, updated_at: DateTime<Utc>) {
        self.users
            .lock()
            .unwrap()
            .insert(user_id.to_string(), StoredEmbedding { vector, updated_at });
    }

    pub fn make_unreachable(&self, video_id: &str) {
        self.unreachable_videos
            .lock()
            .unwrap()
            .insert(video_id.to_string());
    }

    pub fn heal(&self) {
        self.unreachable_videos.lock().unwrap().clear();
    }

    pub fn user(&self, user_id: &str) -> Option<StoredEmbedding> {
        self.users.lock().unwrap().get(user_id).cloned()
    }

    pub fn video_status(&self, id: &str) -> Option<String> {
        self.videos
            .lock()
            .unwrap()
            .get(id)
            .map(|(status, _)| status.clone())
    }

    pub fn writes_for(&self, user_id: &str) -> usize {
        self.user_writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(user, _)| user == user_id)
            .count()
    }
}

#[async_trait]
impl RelationalStore for FakeStore {
    async fn content_vectors(
        &self,
        video_ids: &[String],
    ) -> Result<HashMap<String, Vec<f64>>, StoreError> {
        let unreachable = self.unreachable_videos.lock().unwrap();
        if video_ids.iter().any(|id| unreachable.contains(id)) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }

        let videos = self.videos.lock().unwrap();
        Ok(video_ids
            .iter()
            .filter_map(|id| {
                let (_, embedding) = videos.get(id)?;
                Some((id.clone(), embedding.clone()?))
            })
            .collect())
    }

    async fn user_embedding(&self, user_id: &str) -> Result<Option<StoredEmbedding>, StoreError> {
        Ok(self.user(user_id))
    }

    async fn upsert_user_embedding(
        &self,
        user_id: &str,
        vector: &[f64],
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.user_writes
            .lock()
            .unwrap()
            .push((user_id.to_string(), vector.to_vec()));
        self.set_user(user_id, vector.to_vec(), updated_at);
        Ok(())
    }

    async fn mark_content_ready(
        &self,
        video_id: &str,
        vector: &[f64],
    ) -> Result<RowUpdate, StoreError> {
        let mut videos = self.videos.lock().unwrap();
        match videos.get_mut(video_id) {
            Some(row) => {
                *row = ("ready".to_string(), Some(vector.to_vec()));
                Ok(RowUpdate::Updated)
            }
            None => Ok(RowUpdate::Missing),
        }
    }
}

#[derive(Default)]
pub struct FakeSink {
    pub vectors: Mutex<HashMap<String, (Vec<f64>, ContentMetadata)>>,
    pub upserts: Mutex<Vec<String>>,
    pub rejected: Mutex<HashSet<String>>,
}

impl FakeSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reject(&self, id: &str) {
        self.rejected.lock().unwrap().insert(id.to_string());
    }

    pub fn accept_all(&self) {
        self.rejected.lock().unwrap().clear();
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts.lock().unwrap().len()
    }

    pub fn vector(&self, id: &str) -> Option<Vec<f64>> {
        self.vectors
            .lock()
            .unwrap()
            .get(id)
            .map(|(vector, _)| vector.clone())
    }
}

#[async_trait]
impl ContentVectorSink for FakeSink {
    async fn upsert(
        &self,
        id: &str,
        vector: &[f64],
        metadata: &ContentMetadata,
    ) -> Result<(), SinkError> {
        if self.rejected.lock().unwrap().contains(id) {
            return Err(SinkError::Status {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: "overloaded".to_string(),
            });
        }
        self.upserts.lock().unwrap().push(id.to_string());
        self.vectors
            .lock()
            .unwrap()
            .insert(id.to_string(), (vector.to_vec(), metadata.clone()));
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), SinkError> {
        self.vectors.lock().unwrap().remove(id);
        Ok(())
    }

    async fn query(&self, _vector: &[f64], top_k: usize) -> Result<Vec<String>, SinkError> {
        let mut ids: Vec<String> = self.vectors.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids.truncate(top_k);
        Ok(ids)
    }
}

pub fn assert_close(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len(), "{actual:?} != {expected:?}");
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-9, "{actual:?} != {expected:?}");
    }
}
