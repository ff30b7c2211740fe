// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable queue seam between the change publisher and the index sync worker.
//!
//! Contract:
//! - at-least-once delivery, FIFO per queue
//! - one unacknowledged delivery per consumer (prefetch of exactly one)
//! - [`DurableQueue::nack`] with `requeue = true` returns the delivery to the
//!   head of the queue so ordering is preserved across retries
//! - [`DurableQueue::nack`] with `requeue = false` (or
//!   [`DurableQueue::dead_letter`]) moves it to a dead-letter list
//! - [`DurableQueue::recover`] returns deliveries orphaned by a crashed
//!   consumer to the head of the queue
//!
//! Implementations:
//! - [`memory::InMemoryQueue`]: process-local, for tests and embedding
//! - [`redis::RedisQueue`]: Redis reliable-queue (ready list, processing list)

pub mod memory;
pub mod redis;

use std::time::Duration;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(String),
    #[error("Queue operation failed: {0}")]
    Operation(String),
    #[error("Unknown delivery '{0}'")]
    UnknownDelivery(String),
}

impl QueueError {
    /// Connection-level failures that a retry may clear.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// A message handed to the consumer, pending acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Delivery tag, stable across redeliveries of the same message.
    pub id: String,
    pub payload: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Append a persistent message.
    async fn enqueue(&self, payload: &[u8]) -> Result<(), QueueError>;

    /// Wait up to `timeout` for the next message. `Ok(None)` on timeout.
    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError>;

    /// Move a delivery to the dead-letter list, recording why.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        tracing::warn!(delivery = %delivery.id, attempt = delivery.attempt, reason, "Dead-lettering delivery");
        self.nack(delivery, false).await
    }

    /// Requeue deliveries left unacknowledged by a previous consumer.
    /// Returns how many were recovered.
    async fn recover(&self) -> Result<usize, QueueError>;
}
