//! Accept position events over HTTP and merge them into contact events.
use std::sync::Arc;

use contact_common::store::{ContactStore, MemoryStore, PgStore};
use contact_ingest::auth::JwtVerifier;
use contact_ingest::config::Config;
use contact_ingest::retention::Purger;
use contact_ingest::{pipeline, router};
use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = Config::init_from_env().wrap_err("invalid configuration")?;

    let store: Arc<dyn ContactStore> = if config.memory_store {
        info!("using an in-memory store, nothing will be persisted");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(
            PgStore::new(&config.database_url, config.max_pg_connections)
                .await
                .wrap_err("failed to connect to the database")?,
        )
    };

    let purger = if config.retention_days > 0 {
        let purger = Purger::new(store.clone(), config.retention_days);
        Some(purger.spawn(config.purge_interval()))
    } else {
        info!("retention disabled, stored data is never purged");
        None
    };

    let settings = config.pipeline();
    let (events, pipeline) = pipeline::start(store.clone(), settings);

    let state = router::State {
        store,
        events,
        accuracy_threshold: settings.accuracy_threshold,
    };
    let verifier = Arc::new(JwtVerifier::new(&config.device_token_secret));
    let app = router::router(state, verifier, config.export_prometheus);

    let bind = config.bind();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .wrap_err_with(|| format!("failed to bind {}", bind))?;

    info!("listening on {}", bind);

    // The router owns the last sender of the ingestion queue: dropping it once serving is
    // over lets the pipeline drain.
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown())
        .await
        .wrap_err("server failed")?;

    if let Some(purger) = purger {
        purger.abort();
    }
    pipeline.drain().await;
    info!("shutdown finished");

    Ok(())
}
