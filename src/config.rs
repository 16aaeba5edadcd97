use crate::application::poller::PollSettings;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line and environment configuration of the replay driver.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// CSV file of `type, user, order, amount` commands to replay
    pub input: PathBuf,

    /// Base URL of the accrual service
    #[arg(long, env = "ACCRUAL_SYSTEM_ADDRESS", default_value = "http://localhost:8282")]
    pub accrual_address: String,

    /// Maximum number of accrual queries running at once (at least 2)
    #[arg(long, env = "LOYALTY_SERVICE_RATE_LIMIT", default_value_t = 10)]
    pub concurrency: usize,

    /// Counted retries per order before it is left for the next recovery sweep
    #[arg(long, env = "LOYALTY_SERVICE_MAX_TRIES", default_value_t = 10)]
    pub max_tries: u32,

    /// Delay before re-asking about an unfinished order
    #[arg(long, default_value_t = 15)]
    pub retry_delay_secs: u64,

    /// Delay after the accrual service rate limited us
    #[arg(long, default_value_t = 60)]
    pub rate_limit_cooldown_secs: u64,

    /// How long to wait for running queries on shutdown
    #[arg(long, default_value_t = 5)]
    pub shutdown_timeout_secs: u64,

    /// Timeout of a single accrual query
    #[arg(long, default_value_t = 10)]
    pub request_timeout_secs: u64,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Default log filter, overridden by RUST_LOG
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            max_attempts: self.max_tries,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            rate_limit_cooldown: Duration::from_secs(self.rate_limit_cooldown_secs),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
