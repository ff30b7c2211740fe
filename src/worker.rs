// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Index sync worker: applies change events to the search index.
//!
//! A single sequential consumer. Each delivery is applied in full before it
//! is acknowledged, so a crash mid-apply leaves it unacknowledged and it is
//! delivered again. Every apply is idempotent (index, upsert, delete of an
//! absent document), so duplicates converge to the same index state.
//!
//! # Event Handling
//!
//! ```text
//! create plan     index parent (join "plan"), index each service routed to it
//! update plan     upsert parent fields, upsert each service under the plan
//! delete plan     delete parent, delete-by-query its children
//! create service  index child, routing = parentId
//! update service  look up child under its parent; index if absent, else upsert
//! delete service  delete by id, routing = parentId
//! ```
//!
//! # Failure Handling
//!
//! - index errors: nack for redelivery after a short backoff, until
//!   `max_delivery_attempts`, then dead-letter
//! - undecodable payloads and service events without a parent: dead-letter
//!   immediately
//!
//! Running more than one worker on the same queue breaks per-plan ordering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cdc::{ChangeAction, ChangeEvent, EntityKind};
use crate::document::PlanDocument;
use crate::index::{plan_body, service_body, IndexError, IndexQuery, SearchIndex, PARENT_ID_FIELD};
use crate::metrics;
use crate::queue::{Delivery, DurableQueue, QueueError};
use crate::resilience::retry::RetryConfig;

#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("Index operation failed: {0}")]
    Retryable(#[from] IndexError),
    #[error("Malformed event: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Deliveries of one message before it is dead-lettered.
    pub max_delivery_attempts: u32,
    /// How long a single receive blocks before the shutdown signal is rechecked.
    pub receive_timeout: Duration,
    /// Delay before a failed delivery is handed back to the queue.
    pub redelivery_backoff: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_delivery_attempts: 5,
            receive_timeout: Duration::from_secs(1),
            redelivery_backoff: RetryConfig::query(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub applied: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Requeued,
    DeadLettered,
}

#[derive(Default)]
struct Counters {
    applied: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
}

pub struct IndexSyncWorker {
    queue: Arc<dyn DurableQueue>,
    index: Arc<dyn SearchIndex>,
    config: WorkerConfig,
    counters: Counters,
}

impl IndexSyncWorker {
    pub fn new(queue: Arc<dyn DurableQueue>, index: Arc<dyn SearchIndex>, config: WorkerConfig) -> Self {
        Self {
            queue,
            index,
            config,
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            applied: self.counters.applied.load(Ordering::Relaxed),
            requeued: self.counters.requeued.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Consume until `shutdown` turns true (or its sender is dropped).
    ///
    /// Deliveries left in flight by a previous consumer are recovered first.
    /// The signal is only observed between deliveries; one that is being
    /// applied always runs to its ack or nack. When settling fails the
    /// delivery is recovered to the head of the queue before anything else is
    /// received, so it is applied again ahead of later events.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), QueueError> {
        let recovered = self.queue.recover().await?;
        if recovered > 0 {
            metrics::record_recovered(recovered);
        }
        info!(recovered, max_attempts = self.config.max_delivery_attempts, "Index sync worker started");
        metrics::set_worker_running(true);

        let backoff = RetryConfig::daemon();
        let mut consecutive_failures = 0usize;
        let mut unsettled = false;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if unsettled {
                match self.queue.recover().await {
                    Ok(recovered) => {
                        unsettled = false;
                        consecutive_failures = 0;
                        metrics::record_recovered(recovered);
                        info!(recovered, "Recovered unsettled delivery");
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        let delay = backoff.delay_for_attempt(consecutive_failures);
                        warn!(error = %e, attempt = consecutive_failures, next_retry = ?delay, "Recovering unsettled delivery failed");
                        metrics::record_connection_error("queue");
                        tokio::select! {
                            biased;
                            changed = shutdown.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
                continue;
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = self.queue.receive(self.config.receive_timeout) => {
                    match received {
                        Ok(Some(delivery)) => {
                            consecutive_failures = 0;
                            if let Err(e) = self.handle_delivery(delivery).await {
                                error!(error = %e, "Failed to settle delivery");
                                metrics::record_connection_error("queue");
                                unsettled = true;
                            }
                        }
                        Ok(None) => consecutive_failures = 0,
                        Err(e) => {
                            consecutive_failures += 1;
                            let delay = backoff.delay_for_attempt(consecutive_failures);
                            warn!(error = %e, attempt = consecutive_failures, next_retry = ?delay, "Queue receive failed");
                            metrics::record_connection_error("queue");
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }

        metrics::set_worker_running(false);
        let stats = self.stats();
        info!(
            applied = stats.applied,
            requeued = stats.requeued,
            dead_lettered = stats.dead_lettered,
            "Index sync worker stopped"
        );
        Ok(())
    }

    /// Receive and handle at most one delivery.
    pub async fn process_next(&self) -> Result<Option<Outcome>, QueueError> {
        match self.queue.receive(self.config.receive_timeout).await? {
            Some(delivery) => self.handle_delivery(delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Handle whatever is ready now, without waiting. Returns how many
    /// deliveries were handled.
    pub async fn drain(&self) -> Result<usize, QueueError> {
        let mut handled = 0usize;
        while let Some(delivery) = self.queue.receive(Duration::ZERO).await? {
            self.handle_delivery(delivery).await?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Apply one delivery and settle it with the queue.
    pub async fn handle_delivery(&self, delivery: Delivery) -> Result<Outcome, QueueError> {
        let event = match ChangeEvent::from_slice(&delivery.payload) {
            Ok(event) => event,
            Err(e) => {
                return self
                    .dead_letter(&delivery, &format!("undecodable event: {e}"), "malformed")
                    .await;
            }
        };

        let label = event.label();
        let start = Instant::now();
        match self.apply(&event).await {
            Ok(()) => {
                self.queue.ack(&delivery).await?;
                self.counters.applied.fetch_add(1, Ordering::Relaxed);
                metrics::record_applied(label);
                metrics::record_apply_latency(label, start.elapsed());
                debug!(event_id = %event.event_id, event = label, attempt = delivery.attempt, "Applied event");
                Ok(Outcome::Applied)
            }
            Err(ApplyError::Malformed(reason)) => self.dead_letter(&delivery, &reason, "malformed").await,
            Err(ApplyError::Retryable(e)) if delivery.attempt >= self.config.max_delivery_attempts => {
                let reason = format!("gave up after {} attempts: {e}", delivery.attempt);
                self.dead_letter(&delivery, &reason, "exhausted").await
            }
            Err(ApplyError::Retryable(e)) => {
                let delay = self.config.redelivery_backoff.delay_for_attempt(delivery.attempt as usize);
                warn!(
                    event_id = %event.event_id,
                    event = label,
                    attempt = delivery.attempt,
                    error = %e,
                    next_retry = ?delay,
                    "Apply failed, requeueing"
                );
                tokio::time::sleep(delay).await;
                self.queue.nack(&delivery, true).await?;
                self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                metrics::record_requeued(label);
                Ok(Outcome::Requeued)
            }
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str, kind: &str) -> Result<Outcome, QueueError> {
        error!(delivery = %delivery.id, attempt = delivery.attempt, reason, "Dead-lettering event");
        self.queue.dead_letter(delivery, reason).await?;
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        metrics::record_dead_lettered(kind);
        Ok(Outcome::DeadLettered)
    }

    /// Apply one event to the index. Safe to repeat.
    #[tracing::instrument(skip(self, event), fields(event_id = %event.event_id, event = event.label()))]
    pub async fn apply(&self, event: &ChangeEvent) -> Result<(), ApplyError> {
        let object_id = event
            .object_id()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ApplyError::Malformed("payload without objectId".to_string()))?;

        match (event.action, event.entity_kind) {
            (ChangeAction::Create, EntityKind::Plan) => {
                let (fields, services) = plan_parts(&event.payload)?;
                self.index.index_doc(object_id, &plan_body(fields), None).await?;
                for service in services {
                    let body = service_body(service.body, object_id);
                    self.index.index_doc(&service.object_id, &body, Some(object_id)).await?;
                }
            }
            (ChangeAction::Update, EntityKind::Plan) => {
                let (fields, services) = plan_parts(&event.payload)?;
                self.index.update_doc(object_id, &plan_body(fields), None, true).await?;
                for service in services {
                    self.upsert_service(&service.object_id, service.body, object_id).await?;
                }
            }
            (ChangeAction::Delete, EntityKind::Plan) => {
                self.index.delete_doc(object_id, None).await?;
                let removed = self.index.delete_by_query(&IndexQuery::children_of(object_id)).await?;
                debug!(object_id, removed, "Removed children of deleted plan");
            }
            (ChangeAction::Create, EntityKind::Service) => {
                let parent = service_parent(event)?;
                let body = service_body(service_fields(&event.payload)?, parent);
                self.index.index_doc(object_id, &body, Some(parent)).await?;
            }
            (ChangeAction::Update, EntityKind::Service) => {
                let parent = service_parent(event)?;
                self.upsert_service(object_id, service_fields(&event.payload)?, parent).await?;
            }
            (ChangeAction::Delete, EntityKind::Service) => {
                let parent = service_parent(event)?;
                self.index.delete_doc(object_id, Some(parent)).await?;
            }
        }
        Ok(())
    }

    async fn upsert_service(&self, service_id: &str, fields: Map<String, Value>, parent_id: &str) -> Result<(), ApplyError> {
        let body = service_body(fields, parent_id);
        let existing = self.index.search(&IndexQuery::child_of(service_id, parent_id)).await?;
        if existing.is_empty() {
            self.index.index_doc(service_id, &body, Some(parent_id)).await?;
        } else {
            self.index.update_doc(service_id, &body, Some(parent_id), true).await?;
        }
        Ok(())
    }
}

fn plan_parts(payload: &Value) -> Result<(Map<String, Value>, Vec<crate::document::LinkedService>), ApplyError> {
    let document = PlanDocument::from_value(payload.clone()).map_err(|e| ApplyError::Malformed(e.to_string()))?;
    Ok(document.into_parts())
}

fn service_fields(payload: &Value) -> Result<Map<String, Value>, ApplyError> {
    payload
        .as_object()
        .cloned()
        .ok_or_else(|| ApplyError::Malformed("service payload must be a JSON object".to_string()))
}

fn service_parent(event: &ChangeEvent) -> Result<&str, ApplyError> {
    event
        .parent_id
        .as_deref()
        .or_else(|| event.payload.get(PARENT_ID_FIELD).and_then(Value::as_str))
        .filter(|parent| !parent.is_empty())
        .ok_or_else(|| ApplyError::Malformed(format!("{} event without parentId", event.label())))
}
