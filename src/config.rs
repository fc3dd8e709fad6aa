//! Daemon configuration: command-line flags with environment fallbacks.
//!
//! `.env` is loaded by `main` before parsing, so every flag can also come from
//! a dotenv file.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::models::IndicatorAccess;
use crate::platform::discord::DEFAULT_API_BASE;
use crate::reconcile::{ReconcilerSettings, DEFAULT_GROUP_LABEL};
use crate::scheduler::DEFAULT_SYNC_INTERVAL;
use crate::watcher::DEFAULT_WATCH_INTERVAL;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("DISCORD_TOKEN is required unless --dry-run is set")]
    MissingToken,
    #[error("METRICS_URL is required unless --dry-run is set")]
    MissingMetricsUrl,
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "stat_channels")]
#[command(about = "Keeps per-guild price and halving countdown channels in sync", long_about = None)]
#[command(version)]
pub struct Config {
    /// Bot token
    #[arg(long, env = "DISCORD_TOKEN", hide_env_values = true)]
    pub discord_token: Option<String>,

    #[arg(long, env = "DISCORD_API_BASE", default_value = DEFAULT_API_BASE)]
    pub discord_api_base: String,

    #[arg(long, env = "DISCORD_TIMEOUT_SECS", default_value_t = 15)]
    pub discord_timeout_secs: u64,

    /// Stats endpoint returning `bigPrice` and `blocksUntilHalving`
    #[arg(long, env = "METRICS_URL")]
    pub metrics_url: Option<String>,

    #[arg(long, env = "METRICS_TIMEOUT_SECS", default_value_t = 10)]
    pub metrics_timeout_secs: u64,

    /// Sled database directory
    #[arg(long, env = "DATA_DIR", default_value = "stat_channels_data")]
    pub data_dir: PathBuf,

    #[arg(long, env = "SYNC_INTERVAL_SECS", default_value_t = DEFAULT_SYNC_INTERVAL.as_secs())]
    pub sync_interval_secs: u64,

    #[arg(long, env = "WATCH_INTERVAL_SECS", default_value_t = DEFAULT_WATCH_INTERVAL.as_secs())]
    pub watch_interval_secs: u64,

    /// Longest 429 `retry_after` honoured before giving up on a call
    #[arg(long, env = "RATE_LIMIT_WAIT_SECS", default_value_t = 30)]
    pub rate_limit_wait_secs: u64,

    /// Status API bind address
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:11111")]
    pub http_addr: SocketAddr,

    /// Name of the category holding the indicators
    #[arg(long, env = "GROUP_LABEL", default_value = DEFAULT_GROUP_LABEL)]
    pub group_label: String,

    #[arg(long, env = "INDICATOR_ACCESS", value_enum, default_value_t = IndicatorAccess::Locked)]
    pub indicator_access: IndicatorAccess,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Also write daily rolling log files here
    #[arg(long, env = "LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Run against an in-memory platform; no token needed
    #[arg(long)]
    pub dry_run: bool,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.dry_run {
            if self.discord_token.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::MissingToken);
            }
            if self.metrics_url.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::MissingMetricsUrl);
            }
        }
        if self.sync_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval("SYNC_INTERVAL_SECS"));
        }
        if self.watch_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval("WATCH_INTERVAL_SECS"));
        }
        Ok(())
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            group_label: self.group_label.clone(),
            access: self.indicator_access,
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs)
    }

    pub fn metrics_timeout(&self) -> Duration {
        Duration::from_secs(self.metrics_timeout_secs)
    }

    pub fn discord_timeout(&self) -> Duration {
        Duration::from_secs(self.discord_timeout_secs)
    }

    pub fn rate_limit_wait(&self) -> Duration {
        Duration::from_secs(self.rate_limit_wait_secs)
    }
}
