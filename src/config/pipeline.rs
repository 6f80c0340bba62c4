//! Pipeline tuning: queue name, producer batch/pacing, consumer prefetch/work.
//!
//! Read from an optional TOML file. Every field has a default, so an empty
//! file (or no file) yields the stock pipeline.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Well-known queue shared by producer and consumer.
pub const DEFAULT_QUEUE: &str = "orders-task";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSettings {
    pub queue: String,
    pub producer: ProducerSettings,
    pub consumer: ConsumerSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            producer: ProducerSettings::default(),
            consumer: ConsumerSettings::default(),
        }
    }
}

impl PipelineSettings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read pipeline file {}: {e}", path.display()))
        })?;
        Self::parse(&content).map_err(|e| match e {
            Error::Configuration(msg) => {
                Error::Configuration(format!("bad pipeline file {}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self> {
        let settings: Self =
            toml::from_str(content).map_err(|e| Error::Configuration(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check settings after every override has been applied.
    pub fn validate(&self) -> Result<()> {
        if self.queue.is_empty() {
            return Err(Error::Configuration("queue name is empty".to_string()));
        }
        if self.consumer.max_deliveries == Some(0) {
            return Err(Error::Configuration(
                "consumer.max_deliveries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProducerSettings {
    /// Orders to publish before exiting.
    pub batch_count: usize,
    /// Pause after each publish. A throttle only.
    pub publish_interval_ms: u64,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            batch_count: 200,
            publish_interval_ms: 750,
        }
    }
}

impl ProducerSettings {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsumerSettings {
    /// Delivered-but-unacknowledged cap.
    pub prefetch: u16,
    /// Simulated work per order.
    pub work_delay_ms: u64,
    /// Drop a message after this many deliveries. None = redeliver forever.
    pub max_deliveries: Option<u32>,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            prefetch: 1,
            work_delay_ms: 5_000,
            max_deliveries: None,
        }
    }
}

impl ConsumerSettings {
    pub fn work_delay(&self) -> Duration {
        Duration::from_millis(self.work_delay_ms)
    }
}
