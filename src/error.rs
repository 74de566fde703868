//! Configuration errors.
//!
//! Everything in here is fatal and detected before the first virtual user is
//! spawned. Failures that happen while a test runs (request errors, workload
//! errors, threshold breaches) are recorded as metrics instead.

use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid base URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Invalid duration '{value}' for {field}")]
    Duration { field: String, value: String },

    #[error("Schedule for '{0}' is empty")]
    EmptySchedule(String),

    #[error("Invalid threshold '{expression}' on '{metric}': {reason}")]
    Threshold {
        metric: String,
        expression: String,
        reason: String,
    },

    #[error("Scenario '{scenario}' references unknown workload '{exec}'")]
    UnknownWorkload { scenario: String, exec: String },

    #[error("Invalid flow '{flow}': {reason}")]
    Flow { flow: String, reason: String },

    #[error("Invalid header '{0}'")]
    Header(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn duration(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Duration {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn threshold(
        metric: impl Into<String>,
        expression: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Threshold {
            metric: metric.into(),
            expression: expression.into(),
            reason: reason.into(),
        }
    }
}
