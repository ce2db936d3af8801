use std::{future::ready, sync::Arc};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get},
    Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::{
    app_context::AppContext, recommendations::recommendations_handler, sink::ContentVectorSink,
    workers::content::remove_content,
};

// Batch times and vector index calls, in milliseconds
const BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0,
];

pub async fn index() -> &'static str {
    "embedding aggregator"
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .install_recorder()
}

async fn readiness(State(context): State<Arc<AppContext>>) -> StatusCode {
    match sqlx::query("SELECT 1").execute(&context.pool).await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            error!("readiness check failed: {e}");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn remove_content_handler(
    State(sink): State<Arc<dyn ContentVectorSink>>,
    Path(video_id): Path<String>,
) -> StatusCode {
    match remove_content(sink.as_ref(), &video_id).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => {
            error!(video_id, "failed to remove content: {e}");
            StatusCode::BAD_GATEWAY
        }
    }
}

pub fn router(context: Arc<AppContext>, metrics: PrometheusHandle) -> Router {
    let liveness = context.clone();

    let api = Router::new()
        .route("/api/recommendations", get(recommendations_handler))
        .with_state(context.recommendation_state());

    let content = Router::new()
        .route("/api/content/:video_id", delete(remove_content_handler))
        .with_state(context.sink.clone());

    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(readiness))
        .route(
            "/_liveness",
            get(move || ready(liveness.health_registry.get_status())),
        )
        .route("/metrics", get(move || ready(metrics.render())))
        .with_state(context)
        .merge(api)
        .merge(content)
}

pub async fn serve(
    router: Router,
    bind: &str,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}
