use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cli::config::{GatewaySettings, QueueNames};
use crate::crawler::task::{CrawlTask, ResultPath, TaskId};
use crate::pipeline::correlation::{Completion, CorrelationTable};
use crate::storage::queue::{AckMode, Broker, Delivery, Envelope};

/// Accepts (start, target) submissions, queues them for workers and routes
/// answers back by task id.
///
/// Answers only reach callers while `consume_results` is running somewhere
/// for this gateway.
pub struct Gateway {
    broker: Arc<dyn Broker>,
    queues: QueueNames,
    settings: GatewaySettings,
    table: CorrelationTable,
    receive_wait: Duration,
}

impl Gateway {
    pub fn new(
        broker: Arc<dyn Broker>,
        queues: QueueNames,
        settings: GatewaySettings,
        receive_wait: Duration,
    ) -> Self {
        Self {
            broker,
            queues,
            settings,
            table: CorrelationTable::new(),
            receive_wait,
        }
    }

    async fn enqueue(&self, task: &CrawlTask) -> Result<()> {
        self.broker
            .publish(&self.queues.tasks, &Envelope::new(task.to_wire()))
            .await
            .context("Failed to queue task")
    }

    /// Queue a task and return its id without waiting for the answer.
    /// The gateway's results consumer logs the answer under that id.
    pub async fn submit(&self, start_url: &str, target_url: &str) -> Result<TaskId> {
        let id = TaskId::generate();
        let task = CrawlTask::new(start_url, target_url).with_id(id.clone());
        self.enqueue(&task).await?;
        info!(task_id = %id, start_url = %task.start_url, target_url = %task.target_url, "Task submitted");
        Ok(id)
    }

    /// Queue a task and wait for its answer.
    pub async fn request(&self, start_url: &str, target_url: &str) -> Result<ResultPath> {
        let id = TaskId::generate();
        let task = CrawlTask::new(start_url, target_url).with_id(id.clone());

        // Registered before publishing so a fast answer cannot slip past
        let answer = self.table.register(id.clone());
        if let Err(e) = self.enqueue(&task).await {
            self.table.forget(&id);
            return Err(e);
        }
        debug!(task_id = %id, in_flight = self.table.len(), "Waiting for answer");

        match tokio::time::timeout(self.settings.request_timeout(), answer).await {
            Ok(Ok(path)) => Ok(path),
            Ok(Err(_)) => {
                self.table.forget(&id);
                Err(anyhow!("Gateway dropped request {}", id))
            }
            Err(_) => {
                self.table.forget(&id);
                Err(anyhow!(
                    "No answer for task {} within {:?}",
                    id,
                    self.settings.request_timeout()
                ))
            }
        }
    }

    /// Route one message from the results queue
    fn route_result(&self, delivery: &Delivery) {
        let path = match ResultPath::from_wire(delivery.body()) {
            Ok(path) => path,
            Err(e) => {
                warn!(message_id = %delivery.envelope.message_id, "Ignoring malformed result: {}", e);
                return;
            }
        };

        let Some(correlation_id) = delivery.envelope.correlation_id.clone() else {
            info!(start_url = %path.start_url, target_url = %path.target_url, "Untagged result: {}", path);
            return;
        };

        let id = TaskId::from(correlation_id);
        info!(task_id = %id, found = path.is_found(), "Result: {}", path);
        if self.table.complete(id.clone(), path) == Completion::Unclaimed {
            debug!(task_id = %id, "No caller waiting for this result");
        }
    }

    /// Drain the results queue until `shutdown` turns true.
    ///
    /// Results are auto-acknowledged; a redelivered duplicate is logged and
    /// otherwise ignored.
    pub async fn consume_results(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(queue = %self.queues.results, "Consuming results");

        let mut next_prune = Instant::now() + self.settings.prune_interval();
        while !*shutdown.borrow_and_update() {
            self.consume_next(&mut next_prune).await;
        }

        Ok(())
    }

    /// One receive, then a prune if one is due, whatever the receive returned
    async fn consume_next(&self, next_prune: &mut Instant) {
        match self
            .broker
            .receive(&self.queues.results, AckMode::Auto, self.receive_wait)
            .await
        {
            Ok(Some(delivery)) => self.route_result(&delivery),
            Ok(None) => {}
            Err(e) => {
                error!("Failed to receive result: {:#}", e);
                tokio::time::sleep(self.receive_wait).await;
            }
        }

        let now = Instant::now();
        if now >= *next_prune {
            self.table.prune();
            *next_prune = now + self.settings.prune_interval();
        }
    }

    /// Answer requests arriving on the RPC queue until `shutdown` turns true.
    ///
    /// Each request body is `[start, target]`; the reply goes to the request's
    /// `reply_to` queue with its `correlation_id`. Requests run concurrently
    /// and are acknowledged once their reply is sent.
    pub async fn serve_rpc(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let recovered = self
            .broker
            .recover(&self.queues.rpc)
            .await
            .context("Failed to recover unacknowledged RPC requests")?;
        if recovered > 0 {
            info!(recovered, "Redelivering RPC requests from a previous run");
        }

        info!(queue = %self.queues.rpc, "Awaiting RPC requests");

        while !*shutdown.borrow_and_update() {
            match self
                .broker
                .receive(&self.queues.rpc, AckMode::Manual, self.receive_wait)
                .await
            {
                Ok(Some(delivery)) => {
                    let gateway = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = gateway.answer_rpc(delivery).await {
                            error!("RPC request failed: {:#}", e);
                        }
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Failed to receive RPC request: {:#}", e);
                    tokio::time::sleep(self.receive_wait).await;
                }
            }
        }

        Ok(())
    }

    async fn answer_rpc(&self, delivery: Delivery) -> Result<()> {
        let Some(reply_to) = delivery.envelope.reply_to.clone() else {
            warn!(message_id = %delivery.envelope.message_id, "Dropping RPC request without reply_to");
            return self.broker.ack(&delivery).await;
        };

        let request = match CrawlTask::from_wire(delivery.body()) {
            Ok(request) => request,
            Err(e) => {
                warn!(message_id = %delivery.envelope.message_id, "Dropping malformed RPC request: {}", e);
                return self.broker.ack(&delivery).await;
            }
        };

        // A failed request is acknowledged too; its caller has given up by now
        let path = match self.request(&request.start_url, &request.target_url).await {
            Ok(path) => path,
            Err(e) => {
                warn!(
                    correlation_id = ?delivery.envelope.correlation_id,
                    "Dropping RPC request without a reply: {:#}", e
                );
                return self.broker.ack(&delivery).await;
            }
        };

        let mut reply = Envelope::new(path.to_wire());
        if let Some(correlation_id) = &delivery.envelope.correlation_id {
            reply = reply.with_correlation_id(correlation_id.clone());
        }
        self.broker
            .publish(&reply_to, &reply)
            .await
            .context("Failed to send RPC reply")?;

        self.broker.ack(&delivery).await
    }
}
