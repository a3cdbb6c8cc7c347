use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::logging::LoggingConfig;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_index")]
    pub index: String,
    /// Mapping type sent as `_type`; an empty string omits it.
    #[serde(default = "default_doc_type")]
    pub doc_type: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            host: default_host(),
            port: default_port(),
            index: default_index(),
            doc_type: default_doc_type(),
        }
    }
}

fn default_scheme() -> String {
    "http".to_string()
}
fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    9200
}
fn default_index() -> String {
    "stacktrace".to_string()
}
fn default_doc_type() -> String {
    "goroutine".to_string()
}

impl BackendConfig {
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    pub fn doc_type(&self) -> Option<&str> {
        if self.doc_type.is_empty() {
            None
        } else {
            Some(&self.doc_type)
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    /// Concurrent delivery workers (bulk connections).
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Documents buffered between the builder and the workers.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Maximum documents per bulk request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    /// Completion monitor re-check interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            queue_capacity: 1024,
            batch_size: 100,
            max_retries: 5,
            retry_backoff_ms: 1000,
            attempt_timeout_secs: 30,
            poll_interval_ms: 2000,
        }
    }
}

fn default_workers() -> usize {
    5
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_batch_size() -> usize {
    100
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_backoff_ms() -> u64 {
    1000
}
fn default_attempt_timeout_secs() -> u64 {
    30
}
fn default_poll_interval_ms() -> u64 {
    2000
}

impl DeliveryConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate backend
    if config.backend.host.is_empty() {
        anyhow::bail!("backend.host must not be empty");
    }
    if config.backend.port == 0 {
        anyhow::bail!("backend.port must be > 0");
    }
    if config.backend.index.is_empty() {
        anyhow::bail!("backend.index must not be empty");
    }
    match config.backend.scheme.as_str() {
        "http" | "https" => {}
        other => anyhow::bail!("Unknown backend scheme: '{}'. Must be http or https.", other),
    }

    // Validate delivery
    if config.delivery.workers == 0 {
        anyhow::bail!("delivery.workers must be > 0");
    }
    if config.delivery.queue_capacity == 0 {
        anyhow::bail!("delivery.queue_capacity must be > 0");
    }
    if config.delivery.batch_size == 0 {
        anyhow::bail!("delivery.batch_size must be > 0");
    }
    if config.delivery.poll_interval_ms == 0 {
        anyhow::bail!("delivery.poll_interval_ms must be > 0");
    }
    if config.delivery.attempt_timeout_secs == 0 {
        anyhow::bail!("delivery.attempt_timeout_secs must be > 0");
    }

    Ok(())
}
