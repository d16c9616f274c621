//! # Relay Configuration
//!
//! Both binaries resolve their configuration in layers, each overriding the
//! previous one field by field when it supplies a value:
//!
//! 1. built-in defaults
//! 2. a JSON file with camelCase keys (`--config-path`, or the binary's
//!    default file name in the working directory when present)
//! 3. environment variables (`RELAY_*`, `.env` files included)
//! 4. command-line flags
//!
//! Layers 3 and 4 come from one `clap` parse. The raw `*Args` structs keep
//! every field optional so they can be merged; `resolve` turns the merged
//! result into a validated `*Config`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::EnvelopeCodec;
use crate::core::{PublisherSettings, SubscriberSettings};
use crate::errors::{RelayError, RelayResult};
use crate::retrieve::ForwarderSettings;
use crate::retry::RetryPolicy;

/// Config file read by `relay_publisher` when no path is given.
pub const DEFAULT_PUBLISHER_CONFIG: &str = "relay_publisher.json";
/// Config file read by `relay_subscriber` when no path is given.
pub const DEFAULT_SUBSCRIBER_CONFIG: &str = "relay_subscriber.json";

fn fatal(message: impl Into<String>) -> RelayError {
    RelayError::FatalConfig(message.into())
}

fn secs_f64(key: &str, value: f64) -> RelayResult<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| fatal(format!("{} must be a non-negative number of seconds, got {}", key, value)))
}

/// Longest accepted retry backoff cap.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30 * 24 * 3600);

fn positive(key: &str, value: Duration) -> RelayResult<Duration> {
    if value.is_zero() {
        return Err(fatal(format!("{} must be greater than zero", key)));
    }
    Ok(value)
}

fn read_config_file<T: DeserializeOwned>(path: &Path, explicit: bool) -> RelayResult<Option<T>> {
    if !path.exists() {
        if explicit {
            return Err(fatal(format!("config file {} not found", path.display())));
        }
        tracing::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            path.display()
        );
        return Ok(None);
    }
    let text = fs::read_to_string(path).map_err(|e| fatal(format!("cannot read {}: {}", path.display(), e)))?;
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| fatal(format!("invalid config file {}: {}", path.display(), e)))
}

/// Retry-queue keys shared by both binaries.
#[derive(Args, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryArgs {
    /// Attempts before a failed frame is dead-lettered.
    #[clap(long, env = "RELAY_RETRY_MAX_RETRIES")]
    pub retry_max_retries: Option<u32>,

    /// Delay before the first retry, in seconds.
    #[clap(long, env = "RELAY_RETRY_BASE_DELAY_SECS")]
    pub retry_base_delay_secs: Option<f64>,

    /// Cap on the exponential retry delay, in seconds.
    #[clap(long, env = "RELAY_RETRY_MAX_BACKOFF_SECS")]
    pub retry_max_backoff_secs: Option<f64>,

    /// Add up to one second of random jitter to retry delays.
    #[clap(long, env = "RELAY_RETRY_JITTER")]
    pub retry_jitter: Option<bool>,

    /// Retry worker threads.
    #[clap(long, env = "RELAY_RETRY_WORKERS")]
    pub retry_workers: Option<usize>,

    /// Maximum number of frames waiting for a retry.
    #[clap(long, env = "RELAY_RETRY_CAPACITY")]
    pub retry_capacity: Option<usize>,

    /// Period of the retry-queue size log line.
    #[clap(long, env = "RELAY_RETRY_STATS_INTERVAL_SECS")]
    pub retry_stats_interval_secs: Option<u64>,
}

impl RetryArgs {
    fn defaults() -> Self {
        let d = RetryPolicy::default();
        Self {
            retry_max_retries: Some(d.max_retries),
            retry_base_delay_secs: Some(d.base_delay.as_secs_f64()),
            retry_max_backoff_secs: Some(d.max_backoff.as_secs_f64()),
            retry_jitter: Some(d.jitter),
            retry_workers: Some(d.worker_count),
            retry_capacity: Some(d.capacity),
            retry_stats_interval_secs: Some(d.stats_interval.as_secs()),
        }
    }

    fn merge(self, other: RetryArgs) -> RetryArgs {
        RetryArgs {
            retry_max_retries: other.retry_max_retries.or(self.retry_max_retries),
            retry_base_delay_secs: other.retry_base_delay_secs.or(self.retry_base_delay_secs),
            retry_max_backoff_secs: other.retry_max_backoff_secs.or(self.retry_max_backoff_secs),
            retry_jitter: other.retry_jitter.or(self.retry_jitter),
            retry_workers: other.retry_workers.or(self.retry_workers),
            retry_capacity: other.retry_capacity.or(self.retry_capacity),
            retry_stats_interval_secs: other.retry_stats_interval_secs.or(self.retry_stats_interval_secs),
        }
    }

    fn resolve(&self) -> RelayResult<RetryPolicy> {
        let d = RetryPolicy::default();
        let max_retries = self.retry_max_retries.unwrap_or(d.max_retries);
        if max_retries == 0 {
            return Err(fatal("retry_max_retries must be at least 1"));
        }
        let capacity = self.retry_capacity.unwrap_or(d.capacity);
        if capacity == 0 {
            return Err(fatal("retry_capacity must be greater than zero"));
        }
        let max_backoff = match self.retry_max_backoff_secs {
            Some(v) => secs_f64("retry_max_backoff_secs", v)?,
            None => d.max_backoff,
        };
        if max_backoff > MAX_RETRY_BACKOFF {
            return Err(fatal(format!(
                "retry_max_backoff_secs must be at most {} seconds",
                MAX_RETRY_BACKOFF.as_secs()
            )));
        }
        Ok(RetryPolicy {
            max_retries,
            base_delay: match self.retry_base_delay_secs {
                Some(v) => secs_f64("retry_base_delay_secs", v)?,
                None => d.base_delay,
            },
            max_backoff,
            jitter: self.retry_jitter.unwrap_or(d.jitter),
            worker_count: self.retry_workers.unwrap_or(d.worker_count).max(1),
            capacity,
            stats_interval: positive(
                "retry_stats_interval_secs",
                self.retry_stats_interval_secs
                    .map(Duration::from_secs)
                    .unwrap_or(d.stats_interval),
            )?,
        })
    }
}

/// Logging keys shared by both binaries.
#[derive(Args, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogArgs {
    /// Directory for log files.
    #[clap(long, env = "RELAY_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Logging level (trace, debug, info, warn, error).
    #[clap(long, env = "RELAY_LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl LogArgs {
    fn defaults() -> Self {
        Self {
            log_dir: Some(PathBuf::from("./log")),
            log_level: Some("info".to_string()),
        }
    }

    fn merge(self, other: LogArgs) -> LogArgs {
        LogArgs {
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
        }
    }

    fn resolve(&self) -> LogConfig {
        LogConfig {
            dir: self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./log")),
            level: self.log_level.clone().unwrap_or_else(|| "info".to_string()),
        }
    }
}

/// Where and how verbosely to log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    /// Directory of the daily rotating JSON log files.
    pub dir: PathBuf,
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
}

/// Raw publisher settings as parsed from one layer.
#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Edge-side telemetry relay: HTTP ingestion and frame publisher", version)]
#[serde(rename_all = "camelCase")]
pub struct PublisherArgs {
    /// Path to the JSON configuration file.
    #[clap(long, env = "RELAY_PUBLISHER_CONFIG_PATH")]
    pub config_path: Option<PathBuf>,

    /// Port of the HTTP ingestion API.
    #[clap(long, env = "RELAY_API_PORT")]
    pub api_port: Option<u16>,

    /// Transport bind address, e.g. tcp://0.0.0.0:6666.
    #[clap(long, env = "RELAY_BIND_ADDRESS")]
    pub bind_address: Option<String>,

    /// Relay queue capacity.
    #[clap(long, env = "RELAY_QUEUE_CAPACITY")]
    pub queue_capacity: Option<usize>,

    /// Seconds an ingestion request waits for queue room.
    #[clap(long, env = "RELAY_ENQUEUE_TIMEOUT_SECS")]
    pub enqueue_timeout_secs: Option<u64>,

    /// Seconds between heartbeat frames.
    #[clap(long, env = "RELAY_HEARTBEAT_INTERVAL_SECS")]
    pub heartbeat_interval_secs: Option<u64>,

    /// Seconds to wait after a failed heartbeat.
    #[clap(long, env = "RELAY_HEARTBEAT_RETRY_SECS")]
    pub heartbeat_retry_secs: Option<u64>,

    /// Retry-queue keys.
    #[clap(flatten)]
    #[serde(flatten)]
    pub retry: RetryArgs,

    /// Logging keys.
    #[clap(flatten)]
    #[serde(flatten)]
    pub log: LogArgs,
}

impl PublisherArgs {
    fn defaults() -> Self {
        Self {
            config_path: None,
            api_port: Some(6100),
            bind_address: Some("tcp://0.0.0.0:6666".to_string()),
            queue_capacity: Some(1000),
            enqueue_timeout_secs: Some(5),
            heartbeat_interval_secs: Some(60),
            heartbeat_retry_secs: Some(30),
            retry: RetryArgs::defaults(),
            log: LogArgs::defaults(),
        }
    }

    // Merge two PublisherArgs, where 'other' overrides 'self' for Some values
    fn merge(self, other: PublisherArgs) -> PublisherArgs {
        PublisherArgs {
            config_path: other.config_path.or(self.config_path),
            api_port: other.api_port.or(self.api_port),
            bind_address: other.bind_address.or(self.bind_address),
            queue_capacity: other.queue_capacity.or(self.queue_capacity),
            enqueue_timeout_secs: other.enqueue_timeout_secs.or(self.enqueue_timeout_secs),
            heartbeat_interval_secs: other.heartbeat_interval_secs.or(self.heartbeat_interval_secs),
            heartbeat_retry_secs: other.heartbeat_retry_secs.or(self.heartbeat_retry_secs),
            retry: self.retry.merge(other.retry),
            log: self.log.merge(other.log),
        }
    }
}

/// Validated configuration of `relay_publisher`.
#[derive(Debug, Clone, PartialEq)]
pub struct PublisherConfig {
    /// HTTP ingestion port.
    pub api_port: u16,
    /// Transport bind address.
    pub bind_address: String,
    /// Relay queue capacity.
    pub queue_capacity: usize,
    /// How long an ingestion request waits for queue room.
    pub enqueue_timeout: Duration,
    /// Heartbeat period.
    pub heartbeat_interval: Duration,
    /// Pause after a failed heartbeat.
    pub heartbeat_retry: Duration,
    /// Retry policy for failed sends.
    pub retry: RetryPolicy,
    /// Logging destination.
    pub log: LogConfig,
}

impl PublisherConfig {
    /// Parses env/CLI and resolves all layers.
    pub fn load() -> RelayResult<Self> {
        Self::from_args(PublisherArgs::parse())
    }

    /// Resolves all layers with `cli` (env + flags) as the top layer.
    pub fn from_args(cli: PublisherArgs) -> RelayResult<Self> {
        let explicit = cli.config_path.is_some();
        let path = cli
            .config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PUBLISHER_CONFIG));

        let mut merged = PublisherArgs::defaults();
        if let Some(file) = read_config_file::<PublisherArgs>(&path, explicit)? {
            merged = merged.merge(file);
        }
        Self::resolve(merged.merge(cli))
    }

    fn resolve(args: PublisherArgs) -> RelayResult<Self> {
        let bind_address = args
            .bind_address
            .filter(|a| !a.trim().is_empty())
            .ok_or_else(|| fatal("bind_address must not be empty"))?;
        let queue_capacity = args.queue_capacity.unwrap_or(1000);
        if queue_capacity == 0 {
            return Err(fatal("queue_capacity must be greater than zero"));
        }
        Ok(Self {
            api_port: args.api_port.unwrap_or(6100),
            bind_address,
            queue_capacity,
            enqueue_timeout: Duration::from_secs(args.enqueue_timeout_secs.unwrap_or(5)),
            heartbeat_interval: positive(
                "heartbeat_interval_secs",
                Duration::from_secs(args.heartbeat_interval_secs.unwrap_or(60)),
            )?,
            heartbeat_retry: positive(
                "heartbeat_retry_secs",
                Duration::from_secs(args.heartbeat_retry_secs.unwrap_or(30)),
            )?,
            retry: args.retry.resolve()?,
            log: args.log.resolve(),
        })
    }

    /// Publisher thread settings derived from this configuration.
    pub fn publisher_settings(&self) -> PublisherSettings {
        PublisherSettings {
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_retry: self.heartbeat_retry,
            retry: self.retry.clone(),
            ..PublisherSettings::default()
        }
    }
}

/// Raw subscriber settings as parsed from one layer.
#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Internal-side telemetry relay: frame subscriber and forwarder", version)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberArgs {
    /// Path to the JSON configuration file.
    #[clap(long, env = "RELAY_SUBSCRIBER_CONFIG_PATH")]
    pub config_path: Option<PathBuf>,

    /// Publisher address, e.g. tcp://10.0.0.1:6666. Required.
    #[clap(long, env = "RELAY_CONNECT_ADDRESS")]
    pub connect_address: Option<String>,

    /// Base64 AES key (16, 24 or 32 bytes). Required.
    #[clap(long, env = "RELAY_AES_KEY", hide_env_values = true)]
    pub aes_key: Option<String>,

    /// Receive timeout in milliseconds.
    #[clap(long, env = "RELAY_RECV_TIMEOUT_MS")]
    pub recv_timeout_ms: Option<u64>,

    /// Silence after which the publisher is considered gone.
    #[clap(long, env = "RELAY_HEARTBEAT_TIMEOUT_SECS")]
    pub heartbeat_timeout_secs: Option<u64>,

    /// Period of the heartbeat liveness check.
    #[clap(long, env = "RELAY_LIVENESS_CHECK_SECS")]
    pub liveness_check_secs: Option<u64>,

    /// Pause after a receive error.
    #[clap(long, env = "RELAY_RECEIVE_ERROR_BACKOFF_SECS")]
    pub receive_error_backoff_secs: Option<u64>,

    /// Analytics API host, e.g. http://10.0.0.5. Required.
    #[clap(long, env = "RELAY_FORWARD_HOST")]
    pub forward_host: Option<String>,

    /// API path for ranking payloads.
    #[clap(long, env = "RELAY_FORWARD_TOP_PATH")]
    pub forward_top_path: Option<String>,

    /// API path for transaction payloads.
    #[clap(long, env = "RELAY_FORWARD_DEAL_PATH")]
    pub forward_deal_path: Option<String>,

    /// Value of the crawler-code request header.
    #[clap(long, env = "RELAY_CRAWLER_CODE")]
    pub crawler_code: Option<String>,

    /// Analytics API timeout in seconds.
    #[clap(long, env = "RELAY_FORWARD_TIMEOUT_SECS")]
    pub forward_timeout_secs: Option<u64>,

    /// Set to false to acknowledge payloads without forwarding.
    #[clap(long, env = "RELAY_PUSH_DATA")]
    pub push_data: Option<bool>,

    /// Retry-queue keys.
    #[clap(flatten)]
    #[serde(flatten)]
    pub retry: RetryArgs,

    /// Logging keys.
    #[clap(flatten)]
    #[serde(flatten)]
    pub log: LogArgs,
}

impl SubscriberArgs {
    fn defaults() -> Self {
        let forward = ForwarderSettings::new("");
        Self {
            config_path: None,
            connect_address: None,
            aes_key: None,
            recv_timeout_ms: Some(10_000),
            heartbeat_timeout_secs: Some(900),
            liveness_check_secs: Some(10),
            receive_error_backoff_secs: Some(10),
            forward_host: None,
            forward_top_path: Some(forward.top_path),
            forward_deal_path: Some(forward.deal_path),
            crawler_code: Some(forward.crawler_code),
            forward_timeout_secs: Some(forward.timeout.as_secs()),
            push_data: Some(true),
            retry: RetryArgs::defaults(),
            log: LogArgs::defaults(),
        }
    }

    fn merge(self, other: SubscriberArgs) -> SubscriberArgs {
        SubscriberArgs {
            config_path: other.config_path.or(self.config_path),
            connect_address: other.connect_address.or(self.connect_address),
            aes_key: other.aes_key.or(self.aes_key),
            recv_timeout_ms: other.recv_timeout_ms.or(self.recv_timeout_ms),
            heartbeat_timeout_secs: other.heartbeat_timeout_secs.or(self.heartbeat_timeout_secs),
            liveness_check_secs: other.liveness_check_secs.or(self.liveness_check_secs),
            receive_error_backoff_secs: other.receive_error_backoff_secs.or(self.receive_error_backoff_secs),
            forward_host: other.forward_host.or(self.forward_host),
            forward_top_path: other.forward_top_path.or(self.forward_top_path),
            forward_deal_path: other.forward_deal_path.or(self.forward_deal_path),
            crawler_code: other.crawler_code.or(self.crawler_code),
            forward_timeout_secs: other.forward_timeout_secs.or(self.forward_timeout_secs),
            push_data: other.push_data.or(self.push_data),
            retry: self.retry.merge(other.retry),
            log: self.log.merge(other.log),
        }
    }
}

/// Validated configuration of `relay_subscriber`.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Publisher address.
    pub connect_address: String,
    /// Envelope codec built from the configured key.
    pub codec: EnvelopeCodec,
    /// Receive timeout.
    pub recv_timeout: Duration,
    /// Heartbeat silence tolerated before reconnecting.
    pub heartbeat_timeout: Duration,
    /// Liveness check period.
    pub liveness_check: Duration,
    /// Pause after a receive error.
    pub receive_error_backoff: Duration,
    /// Analytics API settings.
    pub forwarder: ForwarderSettings,
    /// Retry policy for failed data frames.
    pub retry: RetryPolicy,
    /// Logging destination.
    pub log: LogConfig,
}

impl SubscriberConfig {
    /// Parses env/CLI and resolves all layers.
    pub fn load() -> RelayResult<Self> {
        Self::from_args(SubscriberArgs::parse())
    }

    /// Resolves all layers with `cli` (env + flags) as the top layer.
    pub fn from_args(cli: SubscriberArgs) -> RelayResult<Self> {
        let explicit = cli.config_path.is_some();
        let path = cli
            .config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SUBSCRIBER_CONFIG));

        let mut merged = SubscriberArgs::defaults();
        if let Some(file) = read_config_file::<SubscriberArgs>(&path, explicit)? {
            merged = merged.merge(file);
        }
        Self::resolve(merged.merge(cli))
    }

    fn resolve(args: SubscriberArgs) -> RelayResult<Self> {
        let connect_address = args
            .connect_address
            .filter(|a| !a.trim().is_empty())
            .ok_or_else(|| fatal("connect_address is required"))?;
        let aes_key = args
            .aes_key
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| fatal("aes_key is required"))?;
        let codec = EnvelopeCodec::from_base64_key(&aes_key)?;

        let forward_host = args
            .forward_host
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| fatal("forward_host is required"))?;
        let parsed = url::Url::parse(&forward_host)
            .map_err(|e| fatal(format!("forward_host {:?} is not a URL: {}", forward_host, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(fatal(format!("forward_host must be http or https, got {}", parsed.scheme())));
        }

        let mut forwarder = ForwarderSettings::new(forward_host);
        if let Some(path) = args.forward_top_path {
            forwarder.top_path = path;
        }
        if let Some(path) = args.forward_deal_path {
            forwarder.deal_path = path;
        }
        if let Some(code) = args.crawler_code {
            forwarder.crawler_code = code;
        }
        forwarder.timeout = positive(
            "forward_timeout_secs",
            Duration::from_secs(args.forward_timeout_secs.unwrap_or(30)),
        )?;
        forwarder.push_data = args.push_data.unwrap_or(true);

        Ok(Self {
            connect_address,
            codec,
            recv_timeout: positive(
                "recv_timeout_ms",
                Duration::from_millis(args.recv_timeout_ms.unwrap_or(10_000)),
            )?,
            heartbeat_timeout: positive(
                "heartbeat_timeout_secs",
                Duration::from_secs(args.heartbeat_timeout_secs.unwrap_or(900)),
            )?,
            liveness_check: positive(
                "liveness_check_secs",
                Duration::from_secs(args.liveness_check_secs.unwrap_or(10)),
            )?,
            receive_error_backoff: Duration::from_secs(args.receive_error_backoff_secs.unwrap_or(10)),
            forwarder,
            retry: args.retry.resolve()?,
            log: args.log.resolve(),
        })
    }

    /// Subscriber thread settings derived from this configuration.
    pub fn subscriber_settings(&self) -> SubscriberSettings {
        SubscriberSettings {
            recv_timeout: self.recv_timeout,
            heartbeat_timeout: self.heartbeat_timeout,
            liveness_check: self.liveness_check,
            receive_error_backoff: self.receive_error_backoff,
            retry: self.retry.clone(),
            ..SubscriberSettings::default()
        }
    }
}
