use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::histogram;
use reqwest::{header, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;
use url::Url;

use crate::{metric_consts::VECTOR_INDEX_REQUEST_TIME, types::ContentReadyEvent};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("invalid vector index url: {0}")]
    Url(#[from] url::ParseError),
    #[error("vector index request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("vector index returned {status}: {body}")]
    Status { status: StatusCode, body: String },
}

/// Metadata stored alongside a content vector, returned with query matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentMetadata {
    pub title: String,
    // The index rejects null metadata values, so absent fields are left out
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub user_id: String,
    #[serde(rename = "duration", skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    pub trending_score: f64,
}

impl From<&ContentReadyEvent> for ContentMetadata {
    fn from(event: &ContentReadyEvent) -> Self {
        Self {
            title: event.title.clone(),
            description: event.description.clone(),
            user_id: event.user_id.clone(),
            duration_seconds: event.duration_seconds,
            trending_score: event.trending_score,
        }
    }
}

/// The external nearest-neighbour index. Entries are keyed on content id and an
/// upsert fully replaces any previous entry, so repeating one is harmless.
#[async_trait]
pub trait ContentVectorSink: Send + Sync {
    async fn upsert(
        &self,
        id: &str,
        vector: &[f64],
        metadata: &ContentMetadata,
    ) -> Result<(), SinkError>;

    async fn delete(&self, id: &str) -> Result<(), SinkError>;

    /// Ids of the `top_k` nearest entries, best first.
    async fn query(&self, vector: &[f64], top_k: usize) -> Result<Vec<String>, SinkError>;
}

#[derive(Serialize)]
struct IndexedVector<'a> {
    id: &'a str,
    values: &'a [f64],
    metadata: &'a ContentMetadata,
}

#[derive(Serialize)]
struct UpsertRequest<'a> {
    vectors: [IndexedVector<'a>; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
}

#[derive(Serialize)]
struct DeleteRequest<'a> {
    ids: [&'a str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    vector: &'a [f64],
    top_k: usize,
    include_metadata: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Deserialize)]
struct QueryMatch {
    id: String,
}

/// Client for a Pinecone-compatible REST index.
#[derive(Clone)]
pub struct VectorIndexClient {
    client: reqwest::Client,
    base: Url,
    api_key: Option<String>,
    namespace: Option<String>,
}

impl VectorIndexClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        namespace: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SinkError> {
        // Url::join drops the last path segment unless the base ends with a slash
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base,
            api_key,
            namespace,
        })
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &'static str,
        body: &B,
    ) -> Result<reqwest::Response, SinkError> {
        let url = self.base.join(path)?;
        let mut request = self
            .client
            .post(url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.header("Api-Key", key);
        }

        let start = Instant::now();
        let response = request.send().await;
        let outcome = match &response {
            Ok(r) if r.status().is_success() => "success",
            _ => "failure",
        };
        histogram!(VECTOR_INDEX_REQUEST_TIME, "path" => path, "outcome" => outcome)
            .record(start.elapsed().as_millis() as f64);

        let response = response?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(path, %status, "vector index request rejected: {body}");
            return Err(SinkError::Status { status, body });
        }
        Ok(response)
    }
}

#[async_trait]
impl ContentVectorSink for VectorIndexClient {
    async fn upsert(
        &self,
        id: &str,
        vector: &[f64],
        metadata: &ContentMetadata,
    ) -> Result<(), SinkError> {
        let body = UpsertRequest {
            vectors: [IndexedVector {
                id,
                values: vector,
                metadata,
            }],
            namespace: self.namespace.as_deref(),
        };
        self.post("vectors/upsert", &body).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), SinkError> {
        let body = DeleteRequest {
            ids: [id],
            namespace: self.namespace.as_deref(),
        };
        self.post("vectors/delete", &body).await?;
        Ok(())
    }

    async fn query(&self, vector: &[f64], top_k: usize) -> Result<Vec<String>, SinkError> {
        let body = QueryRequest {
            vector,
            top_k,
            include_metadata: false,
            namespace: self.namespace.as_deref(),
        };
        let response: QueryResponse = self.post("query", &body).await?.json().await?;
        Ok(response.matches.into_iter().map(|m| m.id).collect())
    }
}
