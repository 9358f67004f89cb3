use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::storage::queue::{AckMode, Broker, Delivery, Envelope};

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<String>,
    unacked: Vec<String>,
}

/// In-process broker with the same delivery semantics as the Redis one.
///
/// Used for standalone runs where producer and worker share a process.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    published: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting on `queue`
    #[cfg(test)]
    pub fn pending(&self, queue: &str) -> usize {
        self.with_queue(queue, |state| state.ready.len())
    }

    /// Messages received from `queue` and not yet acknowledged
    #[cfg(test)]
    pub fn unacked(&self, queue: &str) -> usize {
        self.with_queue(queue, |state| state.unacked.len())
    }

    fn with_queue<T>(&self, queue: &str, f: impl FnOnce(&mut QueueState) -> T) -> T {
        let mut queues = match self.queues.lock() {
            Ok(queues) => queues,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(queues.entry(queue.to_string()).or_default())
    }

    fn try_take(&self, queue: &str, ack_mode: AckMode) -> Option<Delivery> {
        let raw = self.with_queue(queue, |state| {
            let raw = state.ready.pop_front()?;
            if ack_mode == AckMode::Manual {
                state.unacked.push(raw.clone());
            }
            Some(raw)
        })?;

        Some(Delivery {
            queue: queue.to_string(),
            envelope: Envelope::from_wire(&raw),
            ack_mode,
            raw,
        })
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, queue: &str, envelope: &Envelope) -> Result<()> {
        let raw = envelope.to_wire();
        self.with_queue(queue, |state| state.ready.push_back(raw));
        self.published.notify_waiters();
        Ok(())
    }

    async fn receive(&self, queue: &str, ack_mode: AckMode, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before looking, so a publish in between is not missed
            let published = self.published.notified();
            tokio::pin!(published);
            published.as_mut().enable();

            if let Some(delivery) = self.try_take(queue, ack_mode) {
                return Ok(Some(delivery));
            }

            if tokio::time::timeout_at(deadline, published).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        if delivery.ack_mode == AckMode::Auto {
            return Ok(());
        }
        self.with_queue(&delivery.queue, |state| {
            if let Some(index) = state.unacked.iter().position(|raw| *raw == delivery.raw) {
                state.unacked.remove(index);
            }
        });
        Ok(())
    }

    async fn recover(&self, queue: &str) -> Result<usize> {
        let recovered = self.with_queue(queue, |state| {
            let unacked = std::mem::take(&mut state.unacked);
            let count = unacked.len();
            state.ready.extend(unacked);
            count
        });
        if recovered > 0 {
            self.published.notify_waiters();
        }
        Ok(recovered)
    }
}
