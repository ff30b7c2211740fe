// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change publisher: serializes events onto the durable queue.
//!
//! Publishing happens after the primary store commit and is never rolled
//! back. A process crash between commit and publish loses the event; there is
//! no outbox.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error};

use super::ChangeEvent;
use crate::metrics;
use crate::queue::{DurableQueue, QueueError};
use crate::resilience::retry::{retry_if, RetryConfig};

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to serialize change event: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Failed to enqueue change event: {0}")]
    Queue(#[from] QueueError),
}

#[derive(Clone)]
pub struct ChangePublisher {
    queue: Arc<dyn DurableQueue>,
    retry: RetryConfig,
}

impl ChangePublisher {
    pub fn new(queue: Arc<dyn DurableQueue>) -> Self {
        Self {
            queue,
            retry: RetryConfig::query(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn queue(&self) -> &Arc<dyn DurableQueue> {
        &self.queue
    }

    pub async fn publish(&self, event: &ChangeEvent) -> Result<(), PublishError> {
        let label = event.label();
        let bytes = event.to_bytes().inspect_err(|_| metrics::record_publish_failure(label))?;

        let result = retry_if("publish_event", &self.retry, QueueError::is_transient, || self.queue.enqueue(&bytes)).await;
        match result {
            Ok(()) => {
                metrics::record_published(label);
                debug!(
                    event_id = %event.event_id,
                    event = label,
                    object_id = event.object_id().unwrap_or_default(),
                    "Published change event"
                );
                Ok(())
            }
            Err(e) => {
                metrics::record_publish_failure(label);
                error!(
                    event_id = %event.event_id,
                    event = label,
                    object_id = event.object_id().unwrap_or_default(),
                    error = %e,
                    "Failed to publish change event"
                );
                Err(e.into())
            }
        }
    }

    /// Publish in order, stopping at the first failure. Returns how many were
    /// published alongside the error.
    pub async fn publish_all(&self, events: &[ChangeEvent]) -> Result<usize, (usize, PublishError)> {
        for (published, event) in events.iter().enumerate() {
            self.publish(event).await.map_err(|e| (published, e))?;
        }
        Ok(events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::InMemoryQueue;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_enqueues_json() {
        let queue = Arc::new(InMemoryQueue::new());
        let publisher = ChangePublisher::new(queue.clone());

        let event = ChangeEvent::delete_plan("plan-1");
        publisher.publish(&event).await.unwrap();

        let delivery = queue.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(ChangeEvent::from_slice(&delivery.payload).unwrap(), event);
    }

    #[tokio::test]
    async fn test_publish_all_preserves_order() {
        let queue = Arc::new(InMemoryQueue::new());
        let publisher = ChangePublisher::new(queue.clone());

        let events = vec![
            ChangeEvent::delete_service("svc-1", "plan-1"),
            ChangeEvent::delete_plan("plan-1"),
        ];
        assert_eq!(publisher.publish_all(&events).await.unwrap(), 2);

        let labels: Vec<&str> = queue
            .pending_payloads()
            .iter()
            .map(|p| ChangeEvent::from_slice(p).unwrap().label())
            .collect();
        assert_eq!(labels, vec!["delete_service", "delete_plan"]);
    }
}
