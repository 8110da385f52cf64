//! Configuration.
//!
//! The broker configuration is a JSON file read once at startup; the CLI
//! flags have an identical uppercased environment variable surface
//! (flag wins, env fills in when the flag is absent).

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use throttle_common::DecodeStrategy;

/// Default broker configuration file location.
pub const DEFAULT_BROKER_CONFIG_FILE: &str = "/etc/telemetry-filter/broker-config.json";
/// Default number of event workers.
pub const DEFAULT_WORKER_COUNT: usize = 10;
/// Default HTTP introspection listen address.
pub const DEFAULT_HTTP_LISTEN: &str = "0.0.0.0:9088";
/// Default Kafka consumer session timeout.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(20);

/// Per-source-topic filter settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicFilterConfig {
    /// Minimum seconds between consecutive forwards of the same sensor.
    #[serde(rename = "ThrottlePeriodSeconds")]
    pub throttle_period_seconds: u32,
    /// Explicit destination topic; derived from the suffix when absent.
    #[serde(rename = "DestinationTopicName", default)]
    pub destination_topic_name: Option<String>,
}

/// Process-global broker configuration, immutable after load.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(rename = "BrokerAddress")]
    pub broker_address: String,
    #[serde(rename = "ConsumerGroup")]
    pub consumer_group: String,
    #[serde(rename = "FilteredTopicSuffix")]
    pub filtered_topic_suffix: String,
    #[serde(rename = "TopicsToFilter")]
    pub topics_to_filter: HashMap<String, TopicFilterConfig>,
}

impl BrokerConfig {
    /// Read and validate the broker configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read broker config file {}", path.display()))?;
        let config: BrokerConfig = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse broker config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.broker_address.is_empty() {
            bail!("BrokerAddress must not be empty");
        }
        if self.consumer_group.is_empty() {
            bail!("ConsumerGroup must not be empty");
        }
        if self.topics_to_filter.is_empty() {
            bail!("TopicsToFilter must name at least one source topic");
        }
        if let Some(topic) = self.topics_to_filter.keys().find(|t| t.is_empty()) {
            bail!("TopicsToFilter contains an empty topic name: {topic:?}");
        }
        Ok(())
    }

    /// The topics the consumer subscribes to.
    pub fn source_topics(&self) -> Vec<&str> {
        self.topics_to_filter.keys().map(String::as_str).collect()
    }

    /// Destination topic for a source topic: the explicit name when
    /// configured, otherwise source topic plus the filtered suffix.
    pub fn destination_topic(&self, source_topic: &str) -> Option<String> {
        let filter = self.topics_to_filter.get(source_topic)?;
        Some(match &filter.destination_topic_name {
            Some(explicit) => explicit.clone(),
            None => format!("{source_topic}{}", self.filtered_topic_suffix),
        })
    }
}

/// Resolved CLI/env options.
#[derive(Debug, Clone)]
pub struct FilterOptions {
    pub broker_config_file: PathBuf,
    pub worker_count: usize,
    pub http_listen: SocketAddr,
    pub decode_strategy: DecodeStrategy,
    pub consumer_session_timeout: Duration,
}

/// Raw flag values before env fallback; mirrors the CLI surface.
#[derive(Debug, Clone, Default)]
pub struct RawOptions {
    pub broker_config_file: Option<PathBuf>,
    pub worker_count: Option<usize>,
    pub http_listen: Option<String>,
    pub decode_strategy: Option<String>,
    pub consumer_session_timeout_seconds: Option<u64>,
}

impl FilterOptions {
    /// Layer flags over uppercased env vars over defaults.
    pub fn resolve(raw: RawOptions) -> Result<Self> {
        let broker_config_file = raw
            .broker_config_file
            .or_else(|| env::var("BROKER_CONFIG_FILE").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BROKER_CONFIG_FILE));

        let worker_count = match raw.worker_count {
            Some(count) => count,
            None => env_parse("WORKER_COUNT")?.unwrap_or(DEFAULT_WORKER_COUNT),
        };
        if worker_count == 0 {
            bail!("worker_count must be at least 1");
        }

        let http_listen = raw
            .http_listen
            .or_else(|| env::var("HTTP_LISTEN").ok())
            .unwrap_or_else(|| DEFAULT_HTTP_LISTEN.to_string());
        let http_listen: SocketAddr = http_listen
            .parse()
            .with_context(|| format!("invalid http_listen address {http_listen:?}"))?;

        let decode_strategy = raw
            .decode_strategy
            .or_else(|| env::var("DECODE_STRATEGY").ok())
            .map(|s| DecodeStrategy::from_str(&s).map_err(anyhow::Error::msg))
            .transpose()?
            .unwrap_or_default();

        let session_timeout_seconds = match raw.consumer_session_timeout_seconds {
            Some(seconds) => seconds,
            None => env_parse("CONSUMER_SESSION_TIMEOUT_SECONDS")?
                .unwrap_or(DEFAULT_SESSION_TIMEOUT.as_secs()),
        };
        if session_timeout_seconds == 0 {
            bail!("consumer_session_timeout_seconds must be at least 1");
        }

        Ok(Self {
            broker_config_file,
            worker_count,
            http_listen,
            decode_strategy,
            consumer_session_timeout: Duration::from_secs(session_timeout_seconds),
        })
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => {
            let parsed = value
                .parse()
                .with_context(|| format!("invalid {name} value {value:?}"))?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}
