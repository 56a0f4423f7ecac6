//! Configuration for the workflow engine

use serde::{Deserialize, Serialize};
use workflow_bus::InMemoryBusConfig;
use workflow_types::RetryConfig;

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retry policy applied when neither the step nor its workflow sets one
    #[serde(default)]
    pub retry: RetrySettings,

    /// In-memory bus configuration
    #[serde(default)]
    pub bus: InMemoryBusConfig,

    /// Execution settings
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Default retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total executions allowed per step, including the first
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Delay between attempts in milliseconds
    #[serde(default)]
    pub delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            delay_ms: 0,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        RetryConfig::new(settings.attempts).with_delay_ms(settings.delay_ms)
    }
}

/// Execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// How long `start`/`resume` wait for a terminal event; 0 waits forever
    #[serde(default)]
    pub finish_timeout_ms: u64,

    /// Processor workers subscribed by `WorkflowRuntime::start_workers`
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            finish_timeout_ms: 0,
            workers: default_workers(),
        }
    }
}

impl ExecutionConfig {
    pub fn finish_timeout(&self) -> Option<std::time::Duration> {
        if self.finish_timeout_ms == 0 {
            None
        } else {
            Some(std::time::Duration::from_millis(self.finish_timeout_ms))
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Enable JSON output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_attempts() -> u32 {
    1
}

fn default_workers() -> usize {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

impl EngineConfig {
    /// Load configuration from file and environment
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        // Add default configuration
        builder = builder.add_source(config::Config::try_from(&EngineConfig::default())?);

        // Add file configuration if provided
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        // Add environment variables, e.g. WORKFLOW_RETRY__ATTEMPTS=3
        builder = builder.add_source(
            config::Environment::with_prefix("WORKFLOW")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Retry policy used when neither step nor workflow configures one
    pub fn default_retry(&self) -> RetryConfig {
        RetryConfig::from(&self.retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.retry.attempts, 1);
        assert_eq!(config.bus.max_redeliveries, 3);
        assert_eq!(config.bus.queue_topics, vec!["workflows".to_string()]);
        assert!(config.execution.finish_timeout().is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = EngineConfig::load(Some("does-not-exist")).unwrap();
        assert_eq!(config.execution.workers, 2);
        assert_eq!(config.default_retry(), RetryConfig::new(1));
    }
}
