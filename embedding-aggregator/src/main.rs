use std::sync::Arc;

use anyhow::{anyhow, Context};
use embedding_aggregator::{
    app_context::AppContext,
    config::Config,
    server::{router, serve, setup_metrics_recorder},
};
use tokio::{
    signal::unix::{signal, Signal, SignalKind},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

async fn wait_for_signal(mut term: Signal, mut interrupt: Signal) {
    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = interrupt.recv() => info!("received SIGINT"),
    };
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_with_defaults().context("failed to load config")?;
    config.validate()?;

    let term = signal(SignalKind::terminate())?;
    let interrupt = signal(SignalKind::interrupt())?;

    let metrics = setup_metrics_recorder()?;
    let context = Arc::new(AppContext::new(config.clone()).await?);

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let interactions = context.interactions_worker()?;
    tasks.spawn(interactions.run(shutdown.clone()));
    let content = context.content_worker()?;
    tasks.spawn(content.run(shutdown.clone()));

    let bind = config.bind();
    let app = router(context.clone(), metrics);
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = serve(app, &bind, server_shutdown).await {
            error!("http server stopped: {e}");
        }
    });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal(term, interrupt).await;
        signal_shutdown.cancel();
    });

    let mut failure = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = match joined {
            Ok(result) => result.map_err(anyhow::Error::from),
            Err(e) => Err(anyhow!("worker task panicked: {e}")),
        };
        if let Err(e) = outcome {
            // One worker down takes the process down, so the supervisor restarts both
            error!("{e:#}");
            shutdown.cancel();
            failure.get_or_insert(e);
        }
    }

    info!("workers stopped");
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
