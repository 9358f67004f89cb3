use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cli::config::QueueNames;
use crate::crawler::coordinator::{Coordinator, CrawlOutcome};
use crate::crawler::task::CrawlTask;
use crate::storage::queue::{AckMode, Broker, Delivery, Envelope};
use crate::utils::metrics::MetricsCollector;

/// Pause after a broker error before trying again
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// What the worker did with one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    /// Answered (found or not) and acknowledged
    Answered { found: bool },
    /// Undecodable; dead-lettered if configured, then acknowledged
    Rejected,
}

/// Pulls tasks off the work queue one at a time and answers each on the
/// results queue.
pub struct Worker {
    broker: Arc<dyn Broker>,
    coordinator: Coordinator,
    queues: QueueNames,
    metrics: MetricsCollector,
    receive_wait: Duration,
}

impl Worker {
    pub fn new(
        broker: Arc<dyn Broker>,
        coordinator: Coordinator,
        queues: QueueNames,
        metrics: MetricsCollector,
        receive_wait: Duration,
    ) -> Self {
        Self {
            broker,
            coordinator,
            queues,
            metrics,
            receive_wait,
        }
    }

    /// Consume tasks until `shutdown` turns true.
    ///
    /// Tasks this consumer left unacknowledged in an earlier life are put
    /// back on the queue first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let recovered = self
            .broker
            .recover(&self.queues.tasks)
            .await
            .context("Failed to recover unacknowledged tasks")?;
        if recovered > 0 {
            info!(recovered, "Redelivering tasks from a previous run");
        }

        info!(queue = %self.queues.tasks, "Waiting for tasks");

        while !*shutdown.borrow_and_update() {
            let delivery = match self
                .broker
                .receive(&self.queues.tasks, AckMode::Manual, self.receive_wait)
                .await
            {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => {
                    error!("Failed to receive task: {:#}", e);
                    tokio::time::sleep(ERROR_BACKOFF).await;
                    continue;
                }
            };

            // An unacknowledged task is redelivered by the next `recover`
            if let Err(e) = self.process(delivery).await {
                error!("Task processing error: {:#}", e);
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }

        info!("Worker stopped");
        Ok(())
    }

    /// Run one task to completion: crawl, publish the answer, acknowledge.
    ///
    /// The acknowledgment only happens after the answer is published, so a
    /// failure at any point leaves the task to be redelivered.
    pub async fn process(&self, delivery: Delivery) -> Result<Processed> {
        let task = match CrawlTask::from_wire(delivery.body()) {
            Ok(task) => task,
            Err(e) => {
                warn!(message_id = %delivery.envelope.message_id, "Dropping malformed task: {}", e);
                self.metrics.record_malformed().await;
                if let Some(dead_letter) = &self.queues.dead_letter {
                    self.broker
                        .publish(dead_letter, &delivery.envelope)
                        .await
                        .context("Failed to dead-letter malformed task")?;
                }
                self.broker.ack(&delivery).await?;
                return Ok(Processed::Rejected);
            }
        };

        let task_id = task.id.as_ref().map(|id| id.to_string()).unwrap_or_default();
        debug!(task_id = %task_id, start_url = %task.start_url, target_url = %task.target_url, "Processing task");

        let outcome = self.coordinator.run(&task.start_url, &task.target_url).await;
        if outcome == CrawlOutcome::Abandoned {
            warn!(
                task_id = %task_id,
                start_url = %task.start_url,
                target_url = %task.target_url,
                "Crawl deadline passed; answering no path although the target may be reachable"
            );
        }
        let path = outcome.into_result_path(&task.start_url, &task.target_url);
        let found = path.is_found();

        let mut answer = Envelope::new(path.to_wire());
        if let Some(id) = &task.id {
            answer = answer.with_correlation_id(id.as_str());
        }
        self.broker
            .publish(&self.queues.results, &answer)
            .await
            .context("Failed to publish result")?;

        self.broker.ack(&delivery).await?;

        self.metrics.record_task().await;
        let metrics = self.metrics.get_metrics().await;
        info!(
            task_id = %task_id,
            found,
            hops = path.hops.len(),
            tasks_processed = metrics.tasks_processed,
            fetches = metrics.fetches,
            fetch_failures = metrics.fetch_failures,
            branches = metrics.branches_spawned,
            crawl_ms = metrics.last_crawl_ms,
            "Task answered"
        );

        Ok(Processed::Answered { found })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::CrawlerSettings;
    use crate::crawler::task::{ResultPath, TaskId};
    use crate::crawler::testing::GraphFetcher;
    use crate::storage::memory::MemoryBroker;

    const WAIT: Duration = Duration::from_millis(50);

    fn graph() -> GraphFetcher {
        GraphFetcher::new()
            .edge("http://a.test/", "http://b.test/")
            .edge("http://b.test/", "http://c.test/")
            .edge("http://a.test/", "http://d.test/")
    }

    fn worker(broker: Arc<MemoryBroker>) -> Worker {
        let metrics = MetricsCollector::new();
        let settings = CrawlerSettings {
            max_depth: 3,
            max_concurrent_fetches: 4,
            crawl_timeout_secs: Some(10),
        };
        let coordinator = Coordinator::new(Arc::new(graph()), settings, metrics.clone());
        Worker::new(broker, coordinator, QueueNames::default(), metrics, WAIT)
    }

    async fn next_task(broker: &MemoryBroker) -> Delivery {
        broker
            .receive("workers", AckMode::Manual, WAIT)
            .await
            .unwrap()
            .expect("a task on the queue")
    }

    #[tokio::test]
    async fn test_answers_and_acknowledges() {
        let broker = Arc::new(MemoryBroker::new());
        let task = CrawlTask::new("http://a.test/", "http://c.test/").with_id(TaskId::from("7"));
        broker.publish("workers", &Envelope::new(task.to_wire())).await.unwrap();
        let worker = worker(Arc::clone(&broker));

        let processed = worker.process(next_task(&broker).await).await.unwrap();

        assert_eq!(processed, Processed::Answered { found: true });
        assert_eq!(broker.unacked("workers"), 0);

        let result = broker.receive("results", AckMode::Auto, WAIT).await.unwrap().unwrap();
        assert_eq!(result.envelope.correlation_id.as_deref(), Some("7"));
        assert_eq!(
            result.body(),
            r#"["http://a.test/","http://c.test/","http://b.test/","http://c.test/"]"#
        );
    }

    #[tokio::test]
    async fn test_untagged_task_gets_untagged_empty_answer() {
        let broker = Arc::new(MemoryBroker::new());
        broker
            .publish("workers", &Envelope::new(r#"["http://a.test/", "http://zzz.test/"]"#))
            .await
            .unwrap();
        let worker = worker(Arc::clone(&broker));

        let processed = worker.process(next_task(&broker).await).await.unwrap();

        assert_eq!(processed, Processed::Answered { found: false });
        let result = broker.receive("results", AckMode::Auto, WAIT).await.unwrap().unwrap();
        assert_eq!(result.envelope.correlation_id, None);
        assert_eq!(
            ResultPath::from_wire(result.body()).unwrap(),
            ResultPath::not_found("http://a.test/", "http://zzz.test/")
        );
    }

    #[tokio::test]
    async fn test_malformed_task_is_dead_lettered() {
        let broker = Arc::new(MemoryBroker::new());
        broker.publish("workers", &Envelope::new("garbage")).await.unwrap();
        let worker = worker(Arc::clone(&broker));

        let processed = worker.process(next_task(&broker).await).await.unwrap();

        assert_eq!(processed, Processed::Rejected);
        assert_eq!(broker.unacked("workers"), 0);
        assert_eq!(broker.pending("results"), 0);
        assert_eq!(broker.pending("workers:dead"), 1);
        assert_eq!(worker.metrics.get_metrics().await.malformed_tasks, 1);
    }

    #[tokio::test]
    async fn test_redelivery_after_crash_gives_same_answer() {
        let broker = Arc::new(MemoryBroker::new());
        let task = CrawlTask::new("http://a.test/", "http://c.test/").with_id(TaskId::from("9"));
        broker.publish("workers", &Envelope::new(task.to_wire())).await.unwrap();

        // First worker takes the task and dies before acknowledging it
        let lost = next_task(&broker).await;
        drop(lost);
        assert_eq!(broker.unacked("workers"), 1);

        let (stop, shutdown) = watch::channel(false);
        let worker = Arc::new(worker(Arc::clone(&broker)));
        let running = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.run(shutdown).await })
        };

        let result = broker
            .receive("results", AckMode::Auto, Duration::from_secs(5))
            .await
            .unwrap()
            .expect("redelivered task answered");
        stop.send_replace(true);
        running.await.unwrap().unwrap();

        assert_eq!(result.envelope.correlation_id.as_deref(), Some("9"));
        assert_eq!(
            ResultPath::from_wire(result.body()).unwrap().hops,
            vec!["http://b.test/".to_string(), "http://c.test/".to_string()]
        );
        assert_eq!(broker.unacked("workers"), 0);
    }
}
