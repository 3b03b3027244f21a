use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use cmp_api::{config::AppConfig, multiplexer::SseMultiplexer, routes, state::AppState};
use cmp_events::{EventBus, FrameCodec, NatsConfig, NatsEventBus, SseFrameCodec};
use cmp_eventstore::{EventStore, EventStoreConfig};
use cmp_outbox::{OutboxWorker, OutboxWorkerConfig, PgOutboxRepository};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "cmp-api")]
#[command(about = "CMP event plane API service")]
struct Args {
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Tracing first, before anything logs.
    {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let args = Args::parse();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %args.bind,
        "starting CMP API server"
    );

    let config = AppConfig::from_env();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    // Event bus: the process cannot run without it.
    let codec = FrameCodec::new(config.bus.compression, config.bus.compression_threshold);
    let bus: Arc<dyn EventBus> = Arc::new(
        NatsEventBus::connect(NatsConfig::new(&config.bus.url), codec).await?,
    );

    // Event store: optional. Without it the multiplexer is live-only.
    let store = match &config.redis_url {
        Some(url) => match EventStore::connect(EventStoreConfig::new(url)).await {
            Ok(store) => Some(store),
            Err(e) => {
                warn!(error = %e, "event store unavailable, running live-only");
                None
            }
        },
        None => {
            warn!("REDIS_URL not set, replay and connection mirroring disabled");
            None
        }
    };

    let cancel = CancellationToken::new();

    let multiplexer = SseMultiplexer::new(
        store,
        SseFrameCodec::new(config.bus.compression_threshold),
        config.sse.clone(),
        config.batch.clone(),
    );
    multiplexer
        .start(bus.clone(), cancel.clone())
        .await
        .map_err(|e| anyhow::anyhow!("multiplexer start failed: {e}"))?;

    // Outbox worker: optional, enabled by DATABASE_URL.
    let outbox_worker = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
            let repository = Arc::new(PgOutboxRepository::new(pool));
            let worker = Arc::new(OutboxWorker::new(
                repository,
                bus.clone(),
                OutboxWorkerConfig::from_env(),
            ));
            let worker_task = worker.clone();
            let worker_cancel = cancel.clone();
            tokio::spawn(async move { worker_task.start(worker_cancel).await });
            Some(worker)
        }
        None => {
            info!("DATABASE_URL not set, outbox worker disabled");
            None
        }
    };

    let state = AppState::new(config, bus, multiplexer, outbox_worker);
    let app = routes::router(state);

    let addr: SocketAddr = args.bind.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "listening");

    let shutdown_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown_cancel.cancel();
        })
        .await?;

    cancel.cancel();
    info!("CMP API server stopped");
    Ok(())
}
