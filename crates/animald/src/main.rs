use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod response;
mod service;
mod store;

use config::{Bus, Config};
use dbus_interface::{AnimalService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("animald starting");

    let config = Config::from_env();
    let settings = &config.pipeline;
    tracing::info!(
        oracle = %settings.oracle,
        workers = config.workers,
        queue_depth = config.queue_depth,
        "configuration loaded"
    );

    // Prototypes are shared read-only across workers; sessions are not.
    let registry = settings.load_registry().context("failed to load prototypes")?;
    let mut workers = Vec::with_capacity(config.workers);
    for n in 0..config.workers {
        let classifier = settings
            .build(registry.clone())
            .with_context(|| format!("failed to build pipeline for worker {n}"))?;
        workers.push(classifier);
    }

    let engine = engine::spawn_engine(workers, config.queue_depth, config.request_timeout())?;
    let store = store::ResultStore::open(&config.results_dir).await?;
    let service = AnimalService {
        service: service::ClassifyService::new(engine, store, settings.oracle, config.workers),
    };

    let builder = match config.bus {
        Bus::Session => zbus::connection::Builder::session()?,
        Bus::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "animald ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("animald shutting down");

    Ok(())
}
