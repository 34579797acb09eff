//! Monitor process: runs the stuck-job, auto-retry, cleanup and
//! health-beat sweeps on their configured cadences.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pipeline_core::blob::S3BlobStore;
use pipeline_core::collaborators::{FakeDocumentConverter, FakePageExtractor, FakeTranscriber};
use pipeline_core::config::PipelineConfig;
use pipeline_core::core::PipelineCore;
use pipeline_core::monitor;
use pipeline_core::queue::PostgresQueue;
use pipeline_core::search::{InMemoryResultIndex, MeilisearchIndex, ResultIndex};
use pipeline_core::store::{PostgresMetadataStore, RedisStatusCache};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pipeline_core=info,pipeline_monitor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting pipeline monitor");

    let config = PipelineConfig::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;

    let metadata = PostgresMetadataStore::new(pool.clone());
    metadata.ensure_schema().await?;

    let cache = RedisStatusCache::connect(&config.redis_url).await?;
    let blobs = S3BlobStore::from_endpoint(config.s3_endpoint.as_deref(), &config.s3_region).await;

    let search: Arc<dyn ResultIndex> = match &config.search_endpoint {
        Some(endpoint) => Arc::new(MeilisearchIndex::new(endpoint.clone())),
        None => Arc::new(InMemoryResultIndex::new()),
    };

    let queue = PostgresQueue::new(pool);
    queue.ensure_schema().await?;

    let core = Arc::new(PipelineCore::new(
        Arc::new(metadata),
        Arc::new(cache),
        Arc::new(blobs),
        search,
        Arc::new(queue),
        Arc::new(FakeDocumentConverter),
        Arc::new(FakeTranscriber),
        Arc::new(FakePageExtractor::default()),
        config,
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    monitor::run(core, shutdown_rx).await;
    tracing::info!("pipeline monitor stopped");
    Ok(())
}
