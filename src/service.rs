// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Service wiring and lifecycle.
//!
//! [`PlanSyncService`] owns every adapter handle: primary store, queue,
//! search index and validator are built once in [`PlanSyncService::connect`]
//! (or [`PlanSyncService::in_memory`]) and shared as `Arc`s. Nothing lives in
//! globals.
//!
//! ```text
//! Connecting -> Ready -> Running -> ShuttingDown -> Stopped
//!                 |                      ^
//!                 +----------------------+  (shutdown without worker)
//! ```

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cdc::publisher::ChangePublisher;
use crate::config::PlanSyncConfig;
use crate::index::elastic::ElasticIndex;
use crate::index::memory::InMemoryIndex;
use crate::index::{IndexError, SearchIndex};
use crate::metrics;
use crate::queue::memory::InMemoryQueue;
use crate::queue::redis::RedisQueue;
use crate::queue::{DurableQueue, QueueError};
use crate::repository::PlanRepository;
use crate::storage::memory::InMemoryStore;
use crate::storage::redis::RedisStore;
use crate::storage::traits::{PrimaryStore, StorageError};
use crate::validation::{StructuralValidator, Validator};
use crate::worker::{IndexSyncWorker, WorkerStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Connecting to Redis and the search index
    Connecting,
    /// Repository usable, worker not started
    Ready,
    /// Worker consuming the change queue
    Running,
    /// Waiting for the worker to finish its current delivery
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Primary store: {0}")]
    Storage(#[from] StorageError),
    #[error("Queue: {0}")]
    Queue(#[from] QueueError),
    #[error("Search index: {0}")]
    Index(#[from] IndexError),
}

pub struct PlanSyncService {
    config: PlanSyncConfig,
    repository: Arc<PlanRepository>,
    queue: Arc<dyn DurableQueue>,
    index: Arc<dyn SearchIndex>,
    worker: Arc<IndexSyncWorker>,
    state: watch::Sender<ServiceState>,
    shutdown: watch::Sender<bool>,
    worker_task: Mutex<Option<JoinHandle<Result<(), QueueError>>>>,
}

impl PlanSyncService {
    /// Connect to Redis and Elasticsearch and make sure the index exists.
    pub async fn connect(config: PlanSyncConfig) -> Result<Self, ServiceError> {
        let start = Instant::now();
        info!(
            redis = %config.redis_url,
            prefix = ?config.redis_prefix,
            queue = %config.queue_name,
            index_url = %config.index_url,
            index = %config.index_name,
            "Connecting plan-sync backends..."
        );
        metrics::set_service_state(&ServiceState::Connecting.to_string());

        let store = RedisStore::with_prefix(&config.redis_url, config.redis_prefix.as_deref())
            .await
            .inspect_err(|_| metrics::record_connection_error("redis"))?;
        // Separate connection: the worker's blocking pops must not stall store commands
        let queue = RedisQueue::connect(&config.redis_url, &config.queue_name)
            .await
            .inspect_err(|_| metrics::record_connection_error("redis"))?;
        let index = ElasticIndex::new(&config.index_url, &config.index_name)?;
        let created = index
            .ensure_index()
            .await
            .inspect_err(|_| metrics::record_connection_error("elasticsearch"))?;

        info!(index_created = created, elapsed = ?start.elapsed(), "Backends connected");
        Ok(Self::from_parts(
            config,
            Arc::new(store),
            Arc::new(queue),
            Arc::new(index),
            Arc::new(StructuralValidator::new()),
        ))
    }

    /// Everything in process: for tests, demos and embedding.
    #[must_use]
    pub fn in_memory(config: PlanSyncConfig) -> Self {
        Self::from_parts(
            config,
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryQueue::new()),
            Arc::new(InMemoryIndex::new()),
            Arc::new(StructuralValidator::new()),
        )
    }

    pub fn from_parts(
        config: PlanSyncConfig,
        store: Arc<dyn PrimaryStore>,
        queue: Arc<dyn DurableQueue>,
        index: Arc<dyn SearchIndex>,
        validator: Arc<dyn Validator>,
    ) -> Self {
        let publisher = ChangePublisher::new(queue.clone());
        let repository = PlanRepository::new(store, validator, publisher).with_options(config.repository_options());
        let worker = IndexSyncWorker::new(queue.clone(), index.clone(), config.worker_config());
        let (state, _) = watch::channel(ServiceState::Ready);
        let (shutdown, _) = watch::channel(false);
        metrics::set_service_state(&ServiceState::Ready.to_string());

        Self {
            config,
            repository: Arc::new(repository),
            queue,
            index,
            worker: Arc::new(worker),
            state,
            shutdown,
            worker_task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &PlanSyncConfig {
        &self.config
    }

    #[must_use]
    pub fn repository(&self) -> Arc<PlanRepository> {
        self.repository.clone()
    }

    #[must_use]
    pub fn queue(&self) -> Arc<dyn DurableQueue> {
        self.queue.clone()
    }

    #[must_use]
    pub fn index(&self) -> Arc<dyn SearchIndex> {
        self.index.clone()
    }

    #[must_use]
    pub fn worker(&self) -> Arc<IndexSyncWorker> {
        self.worker.clone()
    }

    #[must_use]
    pub fn worker_stats(&self) -> WorkerStats {
        self.worker.stats()
    }

    #[must_use]
    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ServiceState) {
        self.state.send_replace(state);
        metrics::set_service_state(&state.to_string());
    }

    /// Spawn the index sync worker. Returns false if it is already running.
    pub fn start_worker(&self) -> bool {
        let mut task = self.worker_task.lock();
        if task.is_some() {
            return false;
        }
        let worker = self.worker.clone();
        let shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(async move { worker.run(shutdown).await }));
        self.set_state(ServiceState::Running);
        info!(queue = %self.config.queue_name, "Index sync worker spawned");
        true
    }

    /// Signal the worker and wait for it to finish its current delivery.
    pub async fn shutdown(&self) {
        info!("Initiating plan-sync shutdown...");
        self.set_state(ServiceState::ShuttingDown);
        self.shutdown.send_replace(true);

        let task = self.worker_task.lock().take();
        if let Some(task) = task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Worker stopped with a queue error"),
                Err(e) => error!(error = %e, "Worker task panicked or was cancelled"),
            }
        }

        let stats = self.worker.stats();
        self.set_state(ServiceState::Stopped);
        info!(
            applied = stats.applied,
            requeued = stats.requeued,
            dead_lettered = stats.dead_lettered,
            "Plan-sync shutdown complete"
        );
    }
}
