use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Highest room id the chat server accepts on `/chat/{room}`.
pub const MAX_ROOM_ID: u8 = 20;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub warmup: WarmupConfig,
    #[serde(default)]
    pub measurement: MeasurementConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Reject configurations that cannot produce a meaningful run.
    pub fn validate(&self) -> anyhow::Result<()> {
        let url = url::Url::parse(&self.target.server_url)
            .with_context(|| format!("Invalid server_url: {}", self.target.server_url))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            bail!(
                "server_url must be ws:// or wss:// (got {})",
                self.target.server_url
            );
        }
        if self.target.room_min == 0
            || self.target.room_max > MAX_ROOM_ID
            || self.target.room_min > self.target.room_max
        {
            bail!(
                "room range {}..={} must lie within 1..={}",
                self.target.room_min,
                self.target.room_max,
                MAX_ROOM_ID
            );
        }
        if self.target.response_timeout_ms == 0 {
            bail!("response_timeout_ms must be non-zero");
        }
        if self.generator.channel_capacity == 0 {
            bail!("generator.channel_capacity must be non-zero");
        }
        if self.metrics.channel_capacity == 0 {
            bail!("metrics.channel_capacity must be non-zero");
        }
        if self.metrics.bucket_secs == 0 {
            bail!("metrics.bucket_secs must be non-zero");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.warmup.total() > self.generator.total_messages {
            bail!(
                "warmup needs {} messages but only {} are generated",
                self.warmup.total(),
                self.generator.total_messages
            );
        }
        Ok(())
    }

    pub fn measurement_messages(&self) -> u64 {
        self.generator
            .total_messages
            .saturating_sub(self.warmup.total())
    }

    /// Worker count for the measurement phase; `0` in the file means "size to the host".
    pub fn measurement_workers(&self) -> usize {
        if self.measurement.workers == 0 {
            num_cpus::get() * 4
        } else {
            self.measurement.workers
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            response_timeout: Duration::from_millis(self.target.response_timeout_ms),
            max_reconnects: self.retry.max_reconnects,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// WebSocket base URL; workers append `/chat/{room}`
    pub server_url: String,
    /// Handshake timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// How long a worker waits for the response to one attempt
    pub response_timeout_ms: u64,
    /// Lowest room id a worker may pick
    pub room_min: u8,
    /// Highest room id a worker may pick
    pub room_max: u8,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080".to_string(),
            connect_timeout_ms: 10_000,
            response_timeout_ms: 5_000,
            room_min: 1,
            room_max: MAX_ROOM_ID,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Messages produced over the whole run (warmup + measurement)
    pub total_messages: u64,
    /// Capacity of the shared message channel; the generator waits when it is full
    pub channel_capacity: usize,
    /// Log generation progress every N messages
    pub progress_every: u64,
    /// Optional seed for a reproducible message stream
    pub seed: Option<u64>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            total_messages: 500_000,
            channel_capacity: 10_000,
            progress_every: 50_000,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupConfig {
    pub workers: usize,
    pub messages_per_worker: u64,
    /// Upper bound on waiting for every warmup worker to finish
    pub join_timeout_ms: u64,
}

impl WarmupConfig {
    pub fn total(&self) -> u64 {
        self.workers as u64 * self.messages_per_worker
    }
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            workers: 32,
            messages_per_worker: 1000,
            join_timeout_ms: 5 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementConfig {
    /// Worker count; 0 means four per available CPU
    pub workers: usize,
    pub join_timeout_ms: u64,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            join_timeout_ms: 10 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delivery attempts per message, including the first
    pub max_attempts: u32,
    /// Backoff after attempt k is base_delay_ms * 2^k
    pub base_delay_ms: u64,
    /// Reconnects a worker may make after the server closes its connection
    pub max_reconnects: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_reconnects: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Capacity of the metrics channel; records are dropped (and counted) when full
    pub channel_capacity: usize,
    /// Directory for CSV, throughput and summary files
    pub output_dir: PathBuf,
    /// Width of the throughput-over-time buckets
    pub bucket_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 100_000,
            output_dir: PathBuf::from("results"),
            bucket_secs: 10,
        }
    }
}
