use std::{sync::Arc, time::Duration};

use anyhow::Result;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::info;

use crate::{
    aggregator::EmbeddingAggregator,
    config::Config,
    health::HealthRegistry,
    recommendations::RecommendationState,
    sink::{ContentVectorSink, VectorIndexClient},
    source::KafkaEventSource,
    store::{PgStore, RelationalStore},
    types::{ContentReadyEvent, InteractionEvent},
    workers::{content::ContentHandler, interactions::InteractionHandler, Worker},
};

pub type InteractionWorker = Worker<KafkaEventSource<InteractionEvent>, InteractionHandler>;
pub type ContentWorker = Worker<KafkaEventSource<ContentReadyEvent>, ContentHandler>;

// Slack on top of a worker's own idle and poll time before it counts as stalled
const LIVENESS_GRACE: Duration = Duration::from_secs(60);

/// Every client the process holds, built once at startup and handed to whoever
/// needs it.
pub struct AppContext {
    pub config: Config,
    pub health_registry: HealthRegistry,
    pub pool: PgPool,
    pub store: Arc<dyn RelationalStore>,
    pub sink: Arc<dyn ContentVectorSink>,
}

impl AppContext {
    pub async fn new(config: Config) -> Result<Self> {
        let health_registry = HealthRegistry::new("liveness");

        let options = PgPoolOptions::new().max_connections(config.max_pg_connections);
        let pool = options.connect(&config.database_url).await?;

        if config.run_migrations {
            info!("running migrations");
            sqlx::migrate!("./migrations").run(&pool).await?;
        }

        let sink = VectorIndexClient::new(
            &config.vector_index_url,
            config.vector_index_api_key.clone(),
            config.vector_index_namespace.clone(),
            config.vector_index_timeout(),
        )?;

        Ok(Self {
            health_registry,
            store: Arc::new(PgStore::new(pool.clone())),
            sink: Arc::new(sink),
            pool,
            config,
        })
    }

    pub fn recommendation_state(&self) -> RecommendationState {
        RecommendationState {
            store: self.store.clone(),
            sink: self.sink.clone(),
        }
    }

    pub fn interactions_worker(&self) -> Result<InteractionWorker> {
        let policy = self.config.interactions_poll_policy();
        let source = KafkaEventSource::subscribe(
            &self.config.kafka,
            &self.config.interactions_consumer(),
            self.config.max_events_per_batch,
        )?;
        let handler = InteractionHandler::new(
            self.store.clone(),
            EmbeddingAggregator::new(self.config.aggregator_settings()),
        );
        let liveness = self.health_registry.register(
            "interactions",
            policy.idle_interval + policy.max_wait + LIVENESS_GRACE,
        );

        Ok(Worker::new("interactions", source, handler, policy).with_liveness(liveness))
    }

    pub fn content_worker(&self) -> Result<ContentWorker> {
        let policy = self.config.content_poll_policy();
        let source = KafkaEventSource::subscribe(
            &self.config.kafka,
            &self.config.content_consumer(),
            self.config.max_events_per_batch,
        )?;
        let handler = ContentHandler::new(
            self.sink.clone(),
            self.store.clone(),
            self.config.embedding_dimension,
        );
        let liveness = self.health_registry.register(
            "content",
            policy.idle_interval + policy.max_wait + LIVENESS_GRACE,
        );

        Ok(Worker::new("content", source, handler, policy).with_liveness(liveness))
    }
}
