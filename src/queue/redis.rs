// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis reliable queue.
//!
//! # Key Layout
//!
//! ```text
//! {name}:ready          LIST   message ids; LPUSH to enqueue, the right end is the head
//! {name}:processing     LIST   ids handed to the consumer, not yet settled
//! {name}:payloads       HASH   id -> event bytes
//! {name}:attempts       HASH   id -> delivery count
//! {name}:dead           LIST   dead-lettered ids
//! {name}:dead_payloads  HASH   id -> event bytes for dead-lettered ids
//! ```
//!
//! `BRPOPLPUSH ready processing` moves the head into the processing list
//! atomically, so a consumer that dies mid-apply leaves its delivery in
//! `processing` for [`DurableQueue::recover`] to put back.
//!
//! Durability of enqueued and unacknowledged messages is that of the Redis
//! server (AOF `appendfsync` policy). The queue should use its own connection:
//! blocking pops would otherwise stall commands multiplexed on a shared one.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Value};
use tracing::{debug, warn};

use super::{Delivery, DurableQueue, QueueError};
use crate::resilience::retry::{retry, RetryConfig};

#[derive(Clone)]
pub struct RedisQueue {
    manager: ConnectionManager,
    name: String,
    ready_key: String,
    processing_key: String,
    payload_key: String,
    attempts_key: String,
    dead_key: String,
    dead_payload_key: String,
}

impl RedisQueue {
    pub async fn connect(redis_url: &str, name: &str) -> Result<Self, QueueError> {
        let client = Client::open(redis_url).map_err(|e| QueueError::Unavailable(e.to_string()))?;
        let manager = retry("redis_queue_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| QueueError::Unavailable(e.to_string()))?;
        Ok(Self::from_connection(manager, name))
    }

    pub fn from_connection(manager: ConnectionManager, name: &str) -> Self {
        Self {
            manager,
            name: name.to_string(),
            ready_key: format!("{name}:ready"),
            processing_key: format!("{name}:processing"),
            payload_key: format!("{name}:payloads"),
            attempts_key: format!("{name}:attempts"),
            dead_key: format!("{name}:dead"),
            dead_payload_key: format!("{name}:dead_payloads"),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of messages waiting for delivery.
    pub async fn len(&self) -> Result<u64, QueueError> {
        let mut conn = self.manager.clone();
        redis::cmd("LLEN")
            .arg(&self.ready_key)
            .query_async(&mut conn)
            .await
            .map_err(op_err)
    }

    /// Number of dead-lettered messages.
    pub async fn dead_len(&self) -> Result<u64, QueueError> {
        let mut conn = self.manager.clone();
        redis::cmd("LLEN")
            .arg(&self.dead_key)
            .query_async(&mut conn)
            .await
            .map_err(op_err)
    }

    async fn pop_next(&self, timeout: Duration) -> Result<Option<String>, QueueError> {
        let mut conn = self.manager.clone();
        if timeout.is_zero() {
            return redis::cmd("RPOPLPUSH")
                .arg(&self.ready_key)
                .arg(&self.processing_key)
                .query_async(&mut conn)
                .await
                .map_err(op_err);
        }
        // Fractional timeouts need Redis 6+; 0 would block forever.
        let secs = timeout.as_secs_f64().max(0.01);
        redis::cmd("BRPOPLPUSH")
            .arg(&self.ready_key)
            .arg(&self.processing_key)
            .arg(secs)
            .query_async(&mut conn)
            .await
            .map_err(op_err)
    }
}

fn op_err(err: redis::RedisError) -> QueueError {
    if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
        QueueError::Unavailable(err.to_string())
    } else {
        QueueError::Operation(err.to_string())
    }
}

#[async_trait]
impl DurableQueue for RedisQueue {
    async fn enqueue(&self, payload: &[u8]) -> Result<(), QueueError> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut conn = self.manager.clone();

        let mut pipeline = redis::pipe();
        pipeline.atomic();
        pipeline.cmd("HSET").arg(&self.payload_key).arg(&id).arg(payload);
        pipeline.cmd("LPUSH").arg(&self.ready_key).arg(&id);

        let _: Vec<Value> = pipeline.query_async(&mut conn).await.map_err(op_err)?;
        debug!(queue = %self.name, id = %id, "Enqueued message");
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let Some(id) = self.pop_next(timeout).await? else {
            return Ok(None);
        };

        let mut conn = self.manager.clone();
        let payload: Option<Vec<u8>> = redis::cmd("HGET")
            .arg(&self.payload_key)
            .arg(&id)
            .query_async(&mut conn)
            .await
            .map_err(op_err)?;

        let Some(payload) = payload else {
            warn!(queue = %self.name, id = %id, "Dropping message id with no payload");
            let _: i64 = redis::cmd("LREM")
                .arg(&self.processing_key)
                .arg(1)
                .arg(&id)
                .query_async(&mut conn)
                .await
                .map_err(op_err)?;
            return Err(QueueError::Operation(format!("missing payload for message {id}")));
        };

        let attempt: i64 = redis::cmd("HINCRBY")
            .arg(&self.attempts_key)
            .arg(&id)
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(op_err)?;

        Ok(Some(Delivery {
            id,
            payload,
            attempt: u32::try_from(attempt).unwrap_or(u32::MAX),
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let mut pipeline = redis::pipe();
        pipeline.atomic();
        pipeline.cmd("LREM").arg(&self.processing_key).arg(1).arg(&delivery.id);
        pipeline.cmd("HDEL").arg(&self.payload_key).arg(&delivery.id);
        pipeline.cmd("HDEL").arg(&self.attempts_key).arg(&delivery.id);

        let results: Vec<i64> = pipeline.query_async(&mut conn).await.map_err(op_err)?;
        if results.first().copied().unwrap_or(0) == 0 {
            return Err(QueueError::UnknownDelivery(delivery.id.clone()));
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let mut pipeline = redis::pipe();
        pipeline.atomic();
        pipeline.cmd("LREM").arg(&self.processing_key).arg(1).arg(&delivery.id);
        if requeue {
            // Right end is the head: the message is delivered next.
            pipeline.cmd("RPUSH").arg(&self.ready_key).arg(&delivery.id);
        } else {
            pipeline.cmd("HSET").arg(&self.dead_payload_key).arg(&delivery.id).arg(&delivery.payload);
            pipeline.cmd("HDEL").arg(&self.payload_key).arg(&delivery.id);
            pipeline.cmd("HDEL").arg(&self.attempts_key).arg(&delivery.id);
            pipeline.cmd("LPUSH").arg(&self.dead_key).arg(&delivery.id);
        }

        let results: Vec<i64> = pipeline.query_async(&mut conn).await.map_err(op_err)?;
        if results.first().copied().unwrap_or(0) == 0 {
            return Err(QueueError::UnknownDelivery(delivery.id.clone()));
        }
        Ok(())
    }

    async fn recover(&self) -> Result<usize, QueueError> {
        let mut recovered = 0usize;
        loop {
            let mut conn = self.manager.clone();
            // Newest first onto the head, so the oldest ends up delivered first.
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&self.processing_key)
                .arg(&self.ready_key)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await
                .map_err(op_err)?;
            match moved {
                Some(_) => recovered += 1,
                None => break,
            }
        }
        if recovered > 0 {
            warn!(queue = %self.name, recovered, "Requeued deliveries left in flight by a previous consumer");
        }
        Ok(recovered)
    }
}
