// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{Delivery, DurableQueue, QueueError};

#[derive(Debug, Clone)]
struct Message {
    seq: u64,
    payload: Vec<u8>,
    attempt: u32,
}

impl Message {
    fn tag(&self) -> String {
        format!("mem-{}", self.seq)
    }
}

#[derive(Default)]
struct State {
    ready: VecDeque<Message>,
    /// Keyed by sequence so recovery restores original order.
    in_flight: BTreeMap<u64, Message>,
    dead: Vec<Delivery>,
}

/// Process-local queue with the same delivery contract as the Redis queue.
pub struct InMemoryQueue {
    state: Mutex<State>,
    notify: Notify,
    next_seq: AtomicU64,
    prefetch: usize,
}

impl InMemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::with_prefetch(1)
    }

    #[must_use]
    pub fn with_prefetch(prefetch: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            next_seq: AtomicU64::new(1),
            prefetch: prefetch.max(1),
        }
    }

    /// Messages waiting for delivery
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().ready.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().ready.is_empty()
    }

    /// Deliveries handed out but not yet acknowledged
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    #[must_use]
    pub fn dead_letters(&self) -> Vec<Delivery> {
        self.state.lock().dead.clone()
    }

    /// Payloads waiting for delivery, head first
    #[must_use]
    pub fn pending_payloads(&self) -> Vec<Vec<u8>> {
        self.state.lock().ready.iter().map(|m| m.payload.clone()).collect()
    }

    fn try_take(&self) -> Option<Delivery> {
        let mut state = self.state.lock();
        if state.in_flight.len() >= self.prefetch {
            return None;
        }
        let mut message = state.ready.pop_front()?;
        message.attempt += 1;
        let delivery = Delivery {
            id: message.tag(),
            payload: message.payload.clone(),
            attempt: message.attempt,
        };
        state.in_flight.insert(message.seq, message);
        Some(delivery)
    }

    fn take_in_flight(&self, state: &mut State, delivery: &Delivery) -> Result<Message, QueueError> {
        let seq = delivery
            .id
            .strip_prefix("mem-")
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| QueueError::UnknownDelivery(delivery.id.clone()))?;
        state
            .in_flight
            .remove(&seq)
            .ok_or_else(|| QueueError::UnknownDelivery(delivery.id.clone()))
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableQueue for InMemoryQueue {
    async fn enqueue(&self, payload: &[u8]) -> Result<(), QueueError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.state.lock().ready.push_back(Message {
            seq,
            payload: payload.to_vec(),
            attempt: 0,
        });
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(delivery) = self.try_take() {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.try_take());
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock();
            self.take_in_flight(&mut state, delivery)?;
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock();
            let message = self.take_in_flight(&mut state, delivery)?;
            if requeue {
                state.ready.push_front(message);
            } else {
                state.dead.push(delivery.clone());
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn recover(&self) -> Result<usize, QueueError> {
        let recovered = {
            let mut state = self.state.lock();
            let orphaned = std::mem::take(&mut state.in_flight);
            let count = orphaned.len();
            for (_, message) in orphaned.into_iter().rev() {
                state.ready.push_front(message);
            }
            count
        };
        if recovered > 0 {
            self.notify.notify_one();
        }
        Ok(recovered)
    }
}
