use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, Client};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cli::config::BrokerSettings;
use crate::storage::queue::{AckMode, Broker, Delivery, Envelope};

/// Redis-backed broker.
///
/// Each queue is a list: producers `LPUSH`, consumers pop from the right, so
/// a queue is FIFO. A manual-ack receive atomically moves the message into
/// this consumer's processing list (`<queue>:processing:<consumer>`), and the
/// ack removes it from there. Whatever is left in the processing list after a
/// crash is put back by `recover`.
pub struct RedisBroker {
    client: Client,
    consumer_name: String,

    /// Connection for non-blocking commands
    conn: Mutex<MultiplexedConnection>,

    /// One connection per consumed queue; a blocking pop holds up everything
    /// queued behind it on the same connection
    blocking: Mutex<HashMap<String, MultiplexedConnection>>,
}

impl RedisBroker {
    /// Connect to Redis as a consumer for `role`. Failure here is fatal for
    /// the process.
    pub async fn connect(settings: &BrokerSettings, role: &str) -> Result<Self> {
        let client = Client::open(settings.redis_url.clone())
            .context(format!("Invalid Redis URL {}", settings.redis_url))?;

        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .context(format!("Failed to connect to Redis at {}", settings.redis_url))?;

        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .context(format!("Redis at {} did not answer PING", settings.redis_url))?;

        let consumer_name = settings.consumer_name(role);
        info!(consumer = %consumer_name, "Connected to broker at {}", settings.redis_url);

        Ok(Self {
            client,
            consumer_name,
            conn: Mutex::new(conn),
            blocking: Mutex::new(HashMap::new()),
        })
    }

    fn processing_key(&self, queue: &str) -> String {
        format!("{}:processing:{}", queue, self.consumer_name)
    }

    async fn blocking_connection(&self, queue: &str) -> Result<MultiplexedConnection> {
        let mut connections = self.blocking.lock().await;
        if let Some(conn) = connections.get(queue) {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to open Redis consumer connection")?;
        connections.insert(queue.to_string(), conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, queue: &str, envelope: &Envelope) -> Result<()> {
        let mut conn = self.conn.lock().await;

        redis::cmd("LPUSH")
            .arg(queue)
            .arg(envelope.to_wire())
            .query_async::<_, ()>(&mut *conn)
            .await
            .context(format!("Failed to publish to queue {}", queue))?;

        debug!(queue, message_id = %envelope.message_id, "Published message");

        Ok(())
    }

    async fn receive(&self, queue: &str, ack_mode: AckMode, wait: Duration) -> Result<Option<Delivery>> {
        let mut conn = self.blocking_connection(queue).await?;
        let timeout_secs = wait.as_secs().max(1);

        let raw: Option<String> = match ack_mode {
            AckMode::Manual => redis::cmd("BRPOPLPUSH")
                .arg(queue)
                .arg(self.processing_key(queue))
                .arg(timeout_secs)
                .query_async(&mut conn)
                .await
                .context(format!("Failed to receive from queue {}", queue))?,
            AckMode::Auto => redis::cmd("BRPOP")
                .arg(queue)
                .arg(timeout_secs)
                .query_async::<_, Option<(String, String)>>(&mut conn)
                .await
                .context(format!("Failed to receive from queue {}", queue))?
                .map(|(_, raw)| raw),
        };

        Ok(raw.map(|raw| Delivery {
            queue: queue.to_string(),
            envelope: Envelope::from_wire(&raw),
            ack_mode,
            raw,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        if delivery.ack_mode == AckMode::Auto {
            return Ok(());
        }

        let mut conn = self.conn.lock().await;

        redis::cmd("LREM")
            .arg(self.processing_key(&delivery.queue))
            .arg(1)
            .arg(&delivery.raw)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to acknowledge message")?;

        debug!(queue = %delivery.queue, message_id = %delivery.envelope.message_id, "Acknowledged message");

        Ok(())
    }

    async fn recover(&self, queue: &str) -> Result<usize> {
        let processing_key = self.processing_key(queue);
        let mut conn = self.conn.lock().await;
        let mut recovered = 0;

        // Recovered messages rejoin at the back of the queue
        loop {
            let moved: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(&processing_key)
                .arg(queue)
                .query_async(&mut *conn)
                .await
                .context(format!("Failed to recover unacknowledged messages for {}", queue))?;

            if moved.is_none() {
                break;
            }
            recovered += 1;
        }

        if recovered > 0 {
            info!(queue, recovered, "Requeued unacknowledged messages");
        }

        Ok(recovered)
    }
}
