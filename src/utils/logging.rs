use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter for this crate's output: `RUST_LOG` first, then our defaults
fn env_filter(verbose: bool) -> Result<EnvFilter> {
    let level = if verbose { "debug" } else { "info" };
    Ok(EnvFilter::from_default_env()
        .add_directive(format!("path_crawler={}", level).parse()?)
        .add_directive("warn".parse()?))
}

/// Initialize the logging system.
///
/// With `log_file`, everything also goes to that file without ANSI colors.
/// The file is appended to, so a restarted worker keeps its history.
pub fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let stderr_layer = fmt::layer().with_target(verbose).with_writer(std::io::stderr);

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create log directory: {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .context(format!("Failed to open log file: {}", path.display()))?;
            Some(fmt::layer().with_target(true).with_ansi(false).with_writer(file))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter(verbose)?)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(())
}

/// Default log file for a process role ("worker", "gateway", ...)
pub fn default_log_file(role: &str) -> PathBuf {
    let mut path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "path-crawler", "path-crawler") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        PathBuf::from("./logs")
    };

    path.push(format!("{}.log", role));
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_levels() {
        assert!(env_filter(false).unwrap().to_string().contains("path_crawler=info"));
        assert!(env_filter(true).unwrap().to_string().contains("path_crawler=debug"));
    }

    #[test]
    fn test_default_log_file_is_per_role() {
        let worker = default_log_file("worker");
        let gateway = default_log_file("gateway");

        assert_eq!(worker.file_name().unwrap(), "worker.log");
        assert_eq!(worker.parent(), gateway.parent());
    }
}
