use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::logging::LogConfig;
use crate::registry::DEFAULT_PLUGINS_PATH;

/// 128 MiB, the largest request body a worker accepts.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;

#[derive(Parser, Debug, Clone)]
#[command(name = "fleet-aggregator", about = "Hierarchical metrics aggregation workers")]
pub struct Options {
    /// Address every worker accepts on.
    #[arg(long, env = "AGGREGATOR_LISTEN", default_value = "[::]:10000")]
    pub listen: String,

    /// Number of worker processes.
    #[arg(long, env = "AGGREGATOR_WORKERS", default_value_t = 4, value_parser = clap::value_parser!(u16).range(1..))]
    pub workers: u16,

    /// Concurrent aggregations per worker.
    #[arg(long, env = "AGGREGATOR_THREADS", default_value_t = 4, value_parser = clap::value_parser!(u16).range(1..))]
    pub threads: u16,

    #[arg(long, env = "PLUGINS_PATH", default_value = DEFAULT_PLUGINS_PATH)]
    pub plugins_path: PathBuf,

    /// Seconds between plugin directory re-scans.
    #[arg(long, env = "AGGREGATOR_RELOAD_INTERVAL", default_value_t = 300)]
    pub reload_interval: u64,

    #[arg(long, env = "AGGREGATOR_MAX_MESSAGE_SIZE", default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    pub max_message_size: usize,

    #[arg(long = "loglevel", env = "AGGREGATOR_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "AGGREGATOR_LOG_JSON")]
    pub log_json: bool,

    /// Run as a pool member serving `--listen` (set by the supervisor).
    #[arg(long, hide = true)]
    pub worker: bool,
}

impl Options {
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval)
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level.clone(),
            json_format: self.log_json,
        }
    }

    /// Command line handed to each worker process. The address is passed
    /// already resolved so every worker binds exactly what the supervisor holds.
    pub fn worker_args(&self, addr: SocketAddr) -> Vec<String> {
        let mut args = vec![
            "--worker".to_owned(),
            format!("--listen={addr}"),
            format!("--threads={}", self.threads),
            format!("--plugins-path={}", self.plugins_path.display()),
            format!("--reload-interval={}", self.reload_interval),
            format!("--max-message-size={}", self.max_message_size),
            format!("--loglevel={}", self.log_level),
        ];
        if self.log_json {
            args.push("--log-json".to_owned());
        }
        args
    }
}
