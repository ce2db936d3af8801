use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use crate::{
    sink::{ContentVectorSink, SinkError},
    store::{RelationalStore, StoreError},
};

pub const DEFAULT_LIMIT: usize = 20;

#[derive(Debug, Error)]
pub enum RecommendError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

impl IntoResponse for RecommendError {
    fn into_response(self) -> Response {
        error!("recommendation lookup failed: {self}");
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

/// Nearest content to the user's embedding, paged by `offset` and `limit`. A user
/// with no embedding yet gets nothing rather than an error.
pub async fn recommend(
    store: &dyn RelationalStore,
    sink: &dyn ContentVectorSink,
    user_id: &str,
    limit: usize,
    offset: usize,
) -> Result<Vec<String>, RecommendError> {
    let Some(embedding) = store.user_embedding(user_id).await? else {
        return Ok(vec![]);
    };
    if limit == 0 {
        return Ok(vec![]);
    }

    let ranked = sink
        .query(&embedding.vector, limit.saturating_add(offset))
        .await?;
    Ok(ranked.into_iter().skip(offset).take(limit).collect())
}

#[derive(Clone)]
pub struct RecommendationState {
    pub store: Arc<dyn RelationalStore>,
    pub sink: Arc<dyn ContentVectorSink>,
}

#[derive(Debug, Deserialize)]
pub struct RecommendationParams {
    pub user_id: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationResponse {
    pub video_ids: Vec<String>,
}

pub async fn recommendations_handler(
    State(state): State<RecommendationState>,
    Query(params): Query<RecommendationParams>,
) -> Result<Json<RecommendationResponse>, RecommendError> {
    let video_ids = recommend(
        state.store.as_ref(),
        state.sink.as_ref(),
        &params.user_id,
        params.limit,
        params.offset,
    )
    .await?;
    Ok(Json(RecommendationResponse { video_ids }))
}
