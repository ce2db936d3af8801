use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// One user's engagement with one video, as emitted by the analytics batch
/// endpoint. `weighted_score` is computed upstream and used as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionEvent {
    pub user_id: String,
    pub video_id: String,
    #[serde(rename = "viewDuration", alias = "viewDurationSeconds", default)]
    pub view_duration_seconds: f64,
    #[serde(default)]
    pub liked: bool,
    #[serde(default)]
    pub commented: bool,
    #[serde(default)]
    pub shared: bool,
    #[serde(rename = "timestamp", deserialize_with = "deserialize_utc")]
    pub timestamp: DateTime<Utc>,
    pub weighted_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentStatus {
    Processing,
    Ready,
    Failed,
}

impl ContentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentStatus::Processing => "processing",
            ContentStatus::Ready => "ready",
            ContentStatus::Failed => "failed",
        }
    }
}

/// Emitted once per video when upstream processing finishes. Only events carrying
/// an embedding are ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentReadyEvent {
    pub id: String,
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub file_url: String,
    #[serde(rename = "createdAt", deserialize_with = "deserialize_utc")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub status: ContentStatus,
    #[serde(rename = "duration", alias = "durationSeconds", default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub embedding: Option<Vec<f64>>,
    #[serde(default)]
    pub trending_score: f64,
}

/// A user's persisted preference vector.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEmbedding {
    pub vector: Vec<f64>,
    pub updated_at: DateTime<Utc>,
}

/// Decoded messages must pass a sanity check before they reach a worker. Anything
/// failing it is dropped at the broker boundary like a JSON error.
pub trait BrokerEvent: Send + 'static {
    fn validate(&self) -> Result<(), String>;
}

impl BrokerEvent for InteractionEvent {
    fn validate(&self) -> Result<(), String> {
        if self.user_id.is_empty() {
            return Err("empty userId".to_string());
        }
        if self.video_id.is_empty() {
            return Err("empty videoId".to_string());
        }
        if !self.weighted_score.is_finite() {
            return Err(format!("non-finite weightedScore {}", self.weighted_score));
        }
        Ok(())
    }
}

impl BrokerEvent for ContentReadyEvent {
    fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("empty id".to_string());
        }
        if let Some(embedding) = &self.embedding {
            if embedding.iter().any(|x| !x.is_finite()) {
                return Err("non-finite value in embedding".to_string());
            }
        }
        Ok(())
    }
}

// Producers don't agree on timestamps: JS sends RFC 3339 with a zone, python's
// utcnow().isoformat() sends none. Zoneless values are UTC.
fn deserialize_utc<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_utc(&raw).map_err(serde::de::Error::custom)
}

pub fn parse_utc(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("invalid timestamp {raw:?}: {e}"))
}
