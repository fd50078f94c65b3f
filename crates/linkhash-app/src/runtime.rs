//! Wiring of store, queue, dispatcher, service and worker pool.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, WorkerConfig};
use crate::digest::{BloomDigestEngine, DigestEngine};
use crate::error::AppError;
use crate::paths::AppPaths;
use crate::services::{Dispatcher, FlumeQueue, JobStore, LinkageService, Worker, WorkerPool};

/// A running coordinator: the service handle plus the pool consuming its
/// queue. Must be created inside a tokio runtime.
pub struct LinkageRuntime {
    service: LinkageService,
    pool: WorkerPool,
}

impl LinkageRuntime {
    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let paths = AppPaths::new(&config.storage.path)?;
        let store = JobStore::open_with_map_size(&paths, config.storage.map_size_bytes)?;
        Ok(Self::start(
            Arc::new(store),
            Arc::new(BloomDigestEngine::new()),
            &config.workers,
        ))
    }

    pub fn start(
        store: Arc<JobStore>,
        engine: Arc<dyn DigestEngine>,
        workers: &WorkerConfig,
    ) -> Self {
        let (queue, receiver) = FlumeQueue::bounded(
            workers.queue_capacity,
            Duration::from_millis(workers.enqueue_timeout_ms),
        );
        let dispatcher = Dispatcher::builder()
            .queue(Arc::new(queue))
            .chunk_size(workers.chunk_size)
            .build();
        let service = LinkageService::builder()
            .store(Arc::clone(&store))
            .engine(Arc::clone(&engine))
            .dispatcher(dispatcher)
            .build();
        let pool = WorkerPool::spawn(Worker::new(store, engine), receiver, workers.concurrency);
        Self { service, pool }
    }

    pub fn service(&self) -> LinkageService {
        self.service.clone()
    }

    /// Stop the pool without waiting for queued tasks.
    pub async fn shutdown(self) {
        self.pool.shutdown().await;
    }

    /// Close the queue and wait until every queued chunk is processed.
    ///
    /// Service clones handed out earlier keep the queue open; drop them first.
    pub async fn drain(self) {
        let Self { service, pool } = self;
        drop(service);
        pool.join().await;
    }
}
