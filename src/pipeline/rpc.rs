use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::crawler::task::{CrawlTask, ResultPath};
use crate::storage::queue::{AckMode, Broker, Envelope};

/// Ask a gateway's RPC queue for a path and wait for the reply.
///
/// The reply comes back on a private queue named after the call, so
/// concurrent callers never read each other's answers.
pub async fn call(
    broker: &dyn Broker,
    rpc_queue: &str,
    start_url: &str,
    target_url: &str,
    timeout: Duration,
    receive_wait: Duration,
) -> Result<ResultPath> {
    let correlation_id = Uuid::new_v4().to_string();
    let reply_queue = format!("{}:reply:{}", rpc_queue, correlation_id);

    let request = Envelope::new(CrawlTask::new(start_url, target_url).to_wire())
        .with_correlation_id(correlation_id.clone())
        .with_reply_to(reply_queue.clone());
    broker
        .publish(rpc_queue, &request)
        .await
        .context("Failed to send RPC request")?;
    debug!(correlation_id = %correlation_id, "RPC request sent");

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(anyhow!("No RPC reply within {:?}", timeout));
        }

        let Some(reply) = broker
            .receive(&reply_queue, AckMode::Auto, remaining.min(receive_wait))
            .await?
        else {
            continue;
        };

        if reply.envelope.correlation_id.as_deref() != Some(correlation_id.as_str()) {
            warn!(
                expected = %correlation_id,
                got = ?reply.envelope.correlation_id,
                "Discarding reply for another request"
            );
            continue;
        }

        return ResultPath::from_wire(reply.body()).context("Malformed RPC reply");
    }
}
