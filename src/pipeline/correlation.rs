use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::crawler::task::{ResultPath, TaskId};

/// What happened to a result handed to `complete`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Delivered to a waiting caller
    Delivered,
    /// Nobody is waiting: fire-and-forget task, or the caller gave up
    Unclaimed,
}

/// Callers of one gateway blocked on an answer, keyed by task id.
///
/// Only waiters are held. A result nobody waits for is handed back as
/// `Unclaimed` and not kept, so the table never outgrows the requests in
/// flight. Every operation takes the lock for a single map access.
#[derive(Default)]
pub struct CorrelationTable {
    waiters: Mutex<HashMap<TaskId, oneshot::Sender<ResultPath>>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_waiters<T>(&self, f: impl FnOnce(&mut HashMap<TaskId, oneshot::Sender<ResultPath>>) -> T) -> T {
        let mut waiters = match self.waiters.lock() {
            Ok(waiters) => waiters,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut waiters)
    }

    /// Register interest in `id`. Call before the task is published; the
    /// receiver resolves when `complete` is called for it.
    pub fn register(&self, id: TaskId) -> oneshot::Receiver<ResultPath> {
        let (tx, rx) = oneshot::channel();
        self.with_waiters(|waiters| waiters.insert(id, tx));
        rx
    }

    /// Hand over a result. A duplicate for an id already answered is
    /// unclaimed.
    pub fn complete(&self, id: TaskId, path: ResultPath) -> Completion {
        match self.with_waiters(|waiters| waiters.remove(&id)) {
            Some(tx) => match tx.send(path) {
                Ok(()) => Completion::Delivered,
                Err(_) => Completion::Unclaimed,
            },
            None => Completion::Unclaimed,
        }
    }

    /// Stop waiting for `id`
    pub fn forget(&self, id: &TaskId) {
        self.with_waiters(|waiters| waiters.remove(id));
    }

    /// Drop waiters whose caller went away without `forget`. Returns how many
    /// were dropped.
    pub fn prune(&self) -> usize {
        let removed = self.with_waiters(|waiters| {
            let before = waiters.len();
            waiters.retain(|_, tx| !tx.is_closed());
            before - waiters.len()
        });
        if removed > 0 {
            debug!(removed, "Pruned abandoned waiters");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.with_waiters(|waiters| waiters.len())
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
