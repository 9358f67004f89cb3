use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info};

/// Environment variable that overrides `broker.redis_url`
pub const REDIS_URL_ENV: &str = "PATH_CRAWLER_REDIS_URL";

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub crawler: CrawlerSettings,
    pub fetcher: FetcherSettings,
    pub broker: BrokerSettings,
    pub gateway: GatewaySettings,
}

/// Search settings shared by every crawl a process runs
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CrawlerSettings {
    /// Deepest level a branch may be spawned at
    pub max_depth: u32,
    /// Page fetches allowed in flight at once, across all branches
    pub max_concurrent_fetches: usize,
    /// Give up on a crawl after this many seconds and answer "no path" even
    /// if branches are still running. No limit when absent.
    pub crawl_timeout_secs: Option<u64>,
}

/// HTTP fetch settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FetcherSettings {
    pub user_agent: String,
    pub timeout_secs: u64,
    /// Extra attempts after a transient failure
    pub retries: u32,
    pub retry_backoff_ms: u64,
    /// Links matching any of these regexes are never followed
    pub ignore_patterns: Vec<String>,
}

/// Message broker settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerSettings {
    pub redis_url: String,
    /// Names this process's unacknowledged-message list; keep it stable
    /// across restarts so in-flight tasks are redelivered. Two live
    /// processes must never share one. Defaults to `<role>-<hostname>`.
    pub consumer_name: Option<String>,
    /// How long one blocking receive waits before checking for shutdown
    pub receive_wait_secs: u64,
    pub queues: QueueNames,
}

/// Queue names
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct QueueNames {
    pub tasks: String,
    pub results: String,
    pub rpc: String,
    pub dead_letter: Option<String>,
}

/// Gateway settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GatewaySettings {
    /// How long a correlated request waits for its result
    pub request_timeout_secs: u64,
    /// How often the results consumer drops waiters whose caller went away
    pub prune_interval_secs: u64,
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_concurrent_fetches: 64,
            crawl_timeout_secs: None,
        }
    }
}

impl CrawlerSettings {
    pub fn crawl_timeout(&self) -> Option<Duration> {
        self.crawl_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self {
            user_agent: format!("path-crawler/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 10,
            retries: 1,
            retry_backoff_ms: 250,
            ignore_patterns: vec![
                r"(?i)\.(jpg|jpeg|png|gif|svg|css|js|pdf|zip|mp4)$".to_string(),
            ],
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            consumer_name: None,
            receive_wait_secs: 1,
            queues: QueueNames::default(),
        }
    }
}

impl BrokerSettings {
    /// The configured consumer name, or one derived from the role and host
    pub fn consumer_name(&self, role: &str) -> String {
        match &self.consumer_name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => format!("{}-{}", role, host_name()),
        }
    }

    pub fn receive_wait(&self) -> Duration {
        Duration::from_secs(self.receive_wait_secs.max(1))
    }
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            tasks: "workers".to_string(),
            results: "results".to_string(),
            rpc: "rpc_queue".to_string(),
            dead_letter: Some("workers:dead".to_string()),
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 900,
            prune_interval_secs: 60,
        }
    }
}

impl GatewaySettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(1))
    }
}

fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

impl AppConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "path-crawler", "path-crawler") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        path
    }

    pub fn default_path() -> PathBuf {
        Self::config_dir().join("default.yaml")
    }

    /// Load from `path` when given, otherwise from the default location,
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::load_default()?,
        };
        config.apply_env();
        Ok(config)
    }

    /// Load the default configuration
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_path();

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_to_file(&config_path)?;
            Ok(config)
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        Self::from_yaml(&contents).context(format!("Failed to parse configuration file: {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(REDIS_URL_ENV) {
            if !url.trim().is_empty() {
                debug!("Using broker URL from {}", REDIS_URL_ENV);
                self.broker.redis_url = url;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let config = AppConfig::from_yaml(
            r#"
crawler:
  max_depth: 10
broker:
  queues:
    dead_letter: null
"#,
        )
        .unwrap();

        assert_eq!(config.crawler.max_depth, 10);
        assert_eq!(config.crawler.max_concurrent_fetches, 64);
        assert_eq!(config.broker.queues.tasks, "workers");
        assert_eq!(config.broker.queues.results, "results");
        assert_eq!(config.broker.queues.dead_letter, None);
        assert_eq!(config.gateway.request_timeout_secs, 900);
    }

    #[test]
    fn test_save_and_load_file() {
        let path = std::env::temp_dir()
            .join(format!("path-crawler-config-{}", uuid::Uuid::new_v4()))
            .join("config.yaml");
        let mut config = AppConfig::default();
        config.crawler.max_depth = 5;
        config.fetcher.retries = 0;

        config.save_to_file(&path).unwrap();
        let loaded = AppConfig::load_from_file(&path).unwrap();

        assert_eq!(loaded.crawler.max_depth, 5);
        assert_eq!(loaded.fetcher.retries, 0);
        assert_eq!(loaded.broker.queues, QueueNames::default());

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_defaults_leave_crawls_unbounded() {
        let config = AppConfig::default();

        assert_eq!(config.crawler.crawl_timeout_secs, None);
        assert_eq!(config.crawler.crawl_timeout(), None);
    }

    #[test]
    fn test_consumer_name_defaults_per_role_and_host() {
        let mut broker = BrokerSettings::default();

        let worker = broker.consumer_name("worker");
        assert!(worker.starts_with("worker-"));
        assert_ne!(worker, "worker-");
        assert_ne!(worker, broker.consumer_name("gateway"));

        broker.consumer_name = Some("crawler-7".to_string());
        assert_eq!(broker.consumer_name("worker"), "crawler-7");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(AppConfig::load_from_file(Path::new("/nonexistent/path-crawler.yaml")).is_err());
    }
}
