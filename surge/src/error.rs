//! Error taxonomy of a load run.
//!
//! Only [`ConfigError`] and [`SinkError`] ever reach the caller of
//! [`crate::Scenario::run`]. Network errors and failed checks are outcomes,
//! not errors: they are recorded as metrics and the run carries on.

use std::time::Duration;

use crate::metric::MetricKind;

/// Top level error returned by a run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The run was rejected before any virtual user was spawned.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The metric sink detected an invariant violation; the summary cannot be trusted.
    #[error("metric sink error: {0}")]
    Sink(#[from] SinkError),
}

/// Invalid run configuration. Always detected before the run starts.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("at least one stage is required")]
    EmptyStages,

    #[error("stages add up to a zero run duration")]
    ZeroDuration,

    #[error("stage durations overflow the run duration")]
    DurationOverflow,

    #[error("tick must be greater than zero")]
    ZeroTick,

    #[error("max_retries must allow at least one attempt")]
    ZeroAttempts,

    #[error("invalid base url {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("invalid threshold {expression:?}: {reason}")]
    InvalidThreshold { expression: String, reason: String },

    #[error("threshold references unknown metric {0:?}")]
    UnknownMetric(String),

    #[error("{aggregation} cannot be applied to {kind} metric {metric:?}")]
    AggregationMismatch {
        metric: String,
        kind: MetricKind,
        aggregation: String,
    },

    #[error("could not parse configuration: {0}")]
    Parse(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        ConfigError::Parse(value.to_string())
    }
}

/// Errors raised by [`crate::MetricSink`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SinkError {
    /// A metric name was written as two different kinds.
    #[error("metric {name:?} is a {existing}, cannot record a {attempted} sample")]
    KindMismatch {
        name: String,
        existing: MetricKind,
        attempted: MetricKind,
    },

    /// The sink was sealed for summarization and accepts no more samples.
    #[error("metric sink is sealed")]
    Sealed,
}

/// A transport level failure: no response was received.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Other(String),
}

#[cfg(feature = "builtins")]
impl From<reqwest::Error> for TransportError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_connect() {
            TransportError::Connect(value.to_string())
        } else {
            TransportError::Other(value.to_string())
        }
    }
}
