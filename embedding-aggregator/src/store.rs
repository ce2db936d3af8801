use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{error, warn};

use crate::{
    metric_consts::CORRUPT_STORED_VECTORS,
    types::{ContentStatus, StoredEmbedding},
    vector::{format_vector, parse_vector},
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Whether a status update found the video's row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowUpdate {
    Updated,
    Missing,
}

/// The two tables this service touches: `videos` (status and content vector) and
/// `user_embeddings` (one row per user).
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Stored vectors for whichever of `video_ids` have one. Ids without a usable
    /// vector are simply absent from the map.
    async fn content_vectors(
        &self,
        video_ids: &[String],
    ) -> Result<HashMap<String, Vec<f64>>, StoreError>;

    async fn user_embedding(&self, user_id: &str) -> Result<Option<StoredEmbedding>, StoreError>;

    /// Insert-or-update, keyed on user. `updated_at` never moves backwards.
    async fn upsert_user_embedding(
        &self,
        user_id: &str,
        vector: &[f64],
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Flip the video to ready and record its vector.
    async fn mark_content_ready(
        &self,
        video_id: &str,
        vector: &[f64],
    ) -> Result<RowUpdate, StoreError>;
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_stored(table: &'static str, key: &str, raw: &str) -> Option<Vec<f64>> {
    match parse_vector(raw) {
        Ok(vector) => Some(vector),
        Err(e) => {
            error!(table, key, "unreadable stored vector: {e}");
            counter!(CORRUPT_STORED_VECTORS, "table" => table).increment(1);
            None
        }
    }
}

#[async_trait]
impl RelationalStore for PgStore {
    async fn content_vectors(
        &self,
        video_ids: &[String],
    ) -> Result<HashMap<String, Vec<f64>>, StoreError> {
        if video_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT id, embedding
            FROM videos
            WHERE id = ANY($1) AND embedding IS NOT NULL
            "#,
        )
        .bind(video_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut vectors = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let raw: String = row.try_get("embedding")?;
            if let Some(vector) = parse_stored("videos", &id, &raw) {
                vectors.insert(id, vector);
            }
        }
        Ok(vectors)
    }

    async fn user_embedding(&self, user_id: &str) -> Result<Option<StoredEmbedding>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT embedding, updated_at
            FROM user_embeddings
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let raw: String = row.try_get("embedding")?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

        // A row we can't read is overwritten by the next successful aggregation
        // rather than wedging the batch forever
        Ok(parse_stored("user_embeddings", user_id, &raw)
            .map(|vector| StoredEmbedding { vector, updated_at }))
    }

    async fn upsert_user_embedding(
        &self,
        user_id: &str,
        vector: &[f64],
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_embeddings (user_id, embedding, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE SET
                embedding = EXCLUDED.embedding,
                updated_at = GREATEST(user_embeddings.updated_at, EXCLUDED.updated_at)
            "#,
        )
        .bind(user_id)
        .bind(format_vector(vector))
        .bind(updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_content_ready(
        &self,
        video_id: &str,
        vector: &[f64],
    ) -> Result<RowUpdate, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE videos
            SET status = $2, embedding = $3
            WHERE id = $1
            "#,
        )
        .bind(video_id)
        .bind(ContentStatus::Ready.as_str())
        .bind(format_vector(vector))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(video_id, "no videos row to mark ready");
            return Ok(RowUpdate::Missing);
        }
        Ok(RowUpdate::Updated)
    }
}
