use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

use crate::cli::config::AppConfig;
use crate::crawler::coordinator::Coordinator;
use crate::crawler::fetcher::HttpLinkFetcher;
use crate::pipeline::gateway::Gateway;
use crate::pipeline::rpc;
use crate::pipeline::worker::Worker;
use crate::storage::memory::MemoryBroker;
use crate::storage::queue::Broker;
use crate::storage::redis_broker::RedisBroker;
use crate::utils::metrics::MetricsCollector;

/// A shutdown signal that turns true on Ctrl-C
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested, finishing current work"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        tx.send_replace(true);
    });
    rx
}

fn load_config(config_path: Option<&Path>, depth: Option<u32>) -> Result<AppConfig> {
    let mut config = AppConfig::load(config_path)?;
    if let Some(d) = depth {
        config.crawler.max_depth = d;
    }
    Ok(config)
}

async fn connect_broker(config: &AppConfig, role: &str) -> Result<Arc<dyn Broker>> {
    let broker = RedisBroker::connect(&config.broker, role)
        .await
        .context("Cannot reach the message broker")?;
    Ok(Arc::new(broker))
}

fn coordinator(config: &AppConfig, metrics: MetricsCollector) -> Result<Coordinator> {
    let fetcher = HttpLinkFetcher::new(&config.fetcher)?;
    Ok(Coordinator::new(Arc::new(fetcher), config.crawler.clone(), metrics))
}

fn print_path(path: &crate::crawler::task::ResultPath) {
    if path.is_found() {
        println!("Path found ({} hops):", path.hops.len());
        println!("  {}", path.start_url);
        for hop in &path.hops {
            println!("  -> {}", hop);
        }
    } else {
        println!("No path from {} to {} within the depth limit", path.start_url, path.target_url);
    }
    println!("{}", path.to_wire());
}

/// Run a worker until Ctrl-C
pub async fn worker(config_path: Option<&Path>, name: Option<String>, depth: Option<u32>) -> Result<()> {
    let mut config = load_config(config_path, depth)?;
    if let Some(name) = name {
        config.broker.consumer_name = Some(name);
    }

    let broker = connect_broker(&config, "worker").await?;
    let metrics = MetricsCollector::new();
    let worker = Worker::new(
        broker,
        coordinator(&config, metrics.clone())?,
        config.broker.queues.clone(),
        metrics,
        config.broker.receive_wait(),
    );

    info!(
        consumer = %config.broker.consumer_name("worker"),
        max_depth = config.crawler.max_depth,
        "Worker ready"
    );
    worker.run(shutdown_on_ctrl_c()).await
}

/// Run a gateway until Ctrl-C
pub async fn gateway(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path, None)?;
    let broker = connect_broker(&config, "gateway").await?;
    let gateway = Arc::new(Gateway::new(
        broker,
        config.broker.queues.clone(),
        config.gateway.clone(),
        config.broker.receive_wait(),
    ));

    let shutdown = shutdown_on_ctrl_c();
    let results = {
        let gateway = Arc::clone(&gateway);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { gateway.consume_results(shutdown).await })
    };
    let rpc = tokio::spawn(Arc::clone(&gateway).serve_rpc(shutdown));

    results.await.context("Results consumer panicked")??;
    rpc.await.context("RPC server panicked")??;

    info!("Gateway stopped");
    Ok(())
}

/// Queue a task without waiting (fire-and-forget)
pub async fn submit(config_path: Option<&Path>, start: String, target: String) -> Result<()> {
    let config = load_config(config_path, None)?;
    let broker = connect_broker(&config, "client").await?;
    let gateway = Gateway::new(
        broker,
        config.broker.queues.clone(),
        config.gateway.clone(),
        config.broker.receive_wait(),
    );

    let id = gateway.submit(&start, &target).await?;

    println!("{}", id);
    info!("The gateway logs the result under task id {}", id);
    Ok(())
}

/// Ask a gateway over the RPC queue and wait for the answer
pub async fn request(config_path: Option<&Path>, start: String, target: String, timeout: Option<u64>) -> Result<()> {
    let config = load_config(config_path, None)?;
    let broker = connect_broker(&config, "client").await?;
    let timeout = timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.gateway.request_timeout());

    let path = rpc::call(
        broker.as_ref(),
        &config.broker.queues.rpc,
        &start,
        &target,
        timeout,
        config.broker.receive_wait(),
    )
    .await?;

    print_path(&path);
    Ok(())
}

/// Crawl directly in this process
pub async fn search(config_path: Option<&Path>, start: String, target: String, depth: Option<u32>) -> Result<()> {
    let config = load_config(config_path, depth)?;
    let coordinator = coordinator(&config, MetricsCollector::new())?;

    let path = coordinator
        .run(&start, &target)
        .await
        .into_result_path(start.trim(), target.trim());

    print_path(&path);
    Ok(())
}

/// Gateway, worker and queues all in this process
pub async fn standalone(config_path: Option<&Path>, start: String, target: String, depth: Option<u32>) -> Result<()> {
    let config = load_config(config_path, depth)?;
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let wait = Duration::from_millis(100);

    let metrics = MetricsCollector::new();
    let worker = Worker::new(
        Arc::clone(&broker),
        coordinator(&config, metrics.clone())?,
        config.broker.queues.clone(),
        metrics.clone(),
        wait,
    );
    let gateway = Arc::new(Gateway::new(
        broker,
        config.broker.queues.clone(),
        config.gateway.clone(),
        wait,
    ));

    let (stop, shutdown) = watch::channel(false);
    let worker_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.run(shutdown).await })
    };
    let results_task = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move { gateway.consume_results(shutdown).await })
    };

    let answer = gateway.request(&start, &target).await;

    stop.send_replace(true);
    worker_task.await.context("Worker panicked")??;
    results_task.await.context("Results consumer panicked")??;

    let path = answer?;
    print_path(&path);

    let metrics = metrics.get_metrics().await;
    info!(
        fetches = metrics.fetches,
        fetch_failures = metrics.fetch_failures,
        branches = metrics.branches_spawned,
        crawl_ms = metrics.last_crawl_ms,
        "Standalone run finished"
    );
    Ok(())
}

/// Write the default configuration
pub async fn init_config(config_path: Option<&Path>) -> Result<()> {
    let default_path = AppConfig::default_path();
    let path = config_path.unwrap_or(&default_path);

    AppConfig::default().save_to_file(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

/// Show the current configuration
pub async fn show_config(config_path: Option<&Path>) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    println!("Current configuration:");
    println!("{}", serde_yaml::to_string(&config).context("Failed to serialize configuration")?);
    Ok(())
}
