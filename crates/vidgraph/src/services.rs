//! Wiring of the runtime components from a [`Config`].
//!
//! The CLI and the HTTP server both start here: one SQLite pool, migrated,
//! shared by the graph store and (with `jobs.backend = "sqlite"`) the job
//! table.

use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;

use vidgraph_core::store::memory::InMemoryJobStore;
use vidgraph_core::store::{GraphStore, JobStore};

use crate::config::Config;
use crate::coordinator::{Coordinator, Pipeline};
use crate::db;
use crate::extraction::ExtractionWorker;
use crate::migrate;
use crate::receiver::UploadReceiver;
use crate::sqlite_jobs::SqliteJobStore;
use crate::sqlite_store::SqliteGraphStore;
use crate::writer::GraphWriter;

#[derive(Clone)]
pub struct Services {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub graph: Arc<dyn GraphStore>,
    pub coordinator: Coordinator,
}

impl Services {
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations_on(&pool).await?;

        let jobs: Arc<dyn JobStore> = match config.jobs.backend.as_str() {
            "memory" => Arc::new(InMemoryJobStore::new(config.jobs.capacity)),
            _ => Arc::new(SqliteJobStore::new(pool.clone())),
        };
        let graph: Arc<dyn GraphStore> = Arc::new(SqliteGraphStore::new(pool.clone()));

        let pipeline = Pipeline {
            receiver: UploadReceiver::from_config(config),
            worker: ExtractionWorker::from_config(config),
            writer: GraphWriter::new(graph.clone(), config.writer.policy()),
        };
        let coordinator = Coordinator::new(
            jobs,
            pipeline,
            config.retry.policy(),
            config.jobs.max_concurrent,
        );

        tracing::debug!(
            db = %config.db.path.display(),
            storage = %config.storage.root.display(),
            jobs_backend = %config.jobs.backend,
            extractor = coordinator.worker().extractor_name(),
            "services ready"
        );

        Ok(Self {
            config: Arc::new(config.clone()),
            pool,
            graph,
            coordinator,
        })
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}
