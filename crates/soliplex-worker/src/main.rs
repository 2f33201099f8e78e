use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use soliplex_core::{ArtifactBackend, IngesterConfig};
use soliplex_engine::{builtin_handlers, Dispatcher, Registry, Worker, WorkerConfig};
use soliplex_storage::{
    ArtifactStore, DbArtifactStore, FsArtifactStore, IngestStore, PostgresStore, S3ArtifactStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "soliplex_worker=info,soliplex_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("soliplex-worker starting...");

    let config = IngesterConfig::from_env()?;

    let store = PostgresStore::connect(&config.database_url).await?;
    tracing::info!("database connection established");

    let artifacts: Arc<dyn ArtifactStore> = match config.artifact_backend {
        ArtifactBackend::Fs => Arc::new(FsArtifactStore::new(
            &config.artifact_root,
            config.storage_root.as_str(),
        )),
        ArtifactBackend::Db => Arc::new(DbArtifactStore::new(
            store.pool().clone(),
            config.storage_root.as_str(),
        )),
        // The artifact root doubles as the bucket name on the object store
        ArtifactBackend::S3 => Arc::new(
            S3ArtifactStore::from_env(
                config.artifact_root.as_str(),
                config.storage_root.as_str(),
            )
            .await,
        ),
    };

    let store: Arc<dyn IngestStore> = Arc::new(store);
    let handlers = Arc::new(builtin_handlers(store.clone(), artifacts));

    let registry = Arc::new(Registry::new(&config.workflow_dir, &config.param_dir));
    registry.load(&handlers)?;

    let dispatcher = Arc::new(Dispatcher::new(
        store,
        registry,
        handlers,
        config.retry.clone(),
    ));

    let worker = Arc::new(Worker::new(
        dispatcher,
        WorkerConfig::from_ingester(&config),
    ));
    tracing::info!(worker_id = %worker.worker_id(), "worker initialized");

    let runner = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining");
    worker.shutdown();

    runner.await??;
    Ok(())
}
