//! Run configuration.
//!
//! Durations are written the way k6 scripts write them (`"30s"`, `"1m"`,
//! `"500ms"`):
//!
//! ```rust
//! use std::time::Duration;
//! use surge::RunConfig;
//!
//! let config = RunConfig::from_json(r#"{
//!     "base_url": "http://localhost:8080/api",
//!     "stages": [
//!         { "duration": "1m", "target": 500 },
//!         { "duration": "3m", "target": 500 },
//!         { "duration": "1m", "target": 0 }
//!     ],
//!     "thresholds": [
//!         { "metric": "http_req_duration", "condition": "p(95)<500" },
//!         { "metric": "http_req_duration{type:create}", "condition": "p(95)<600" },
//!         { "metric": "errors", "condition": "rate<0.1" }
//!     ]
//! }"#).unwrap();
//!
//! assert_eq!(config.total_duration(), Ok(Duration::from_secs(300)));
//! assert_eq!(config.max_retries, 3);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    error::ConfigError, executor::Stage, retry::RetryPolicy, threshold::ThresholdSpec,
    workflow::MetricDecl,
};

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_iteration_pause() -> Duration {
    Duration::from_secs(1)
}

fn default_graceful_stop() -> Duration {
    Duration::from_secs(30)
}

fn default_tick() -> Duration {
    Duration::from_millis(100)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct RunConfig {
    /// Root of the service under test; request paths are appended to it.
    #[builder(setter(into))]
    pub base_url: String,
    /// Target concurrency curve.
    pub stages: Vec<Stage>,
    #[serde(default)]
    #[builder(default)]
    pub thresholds: Vec<ThresholdSpec>,
    /// Total attempts per operation, the first one included.
    #[serde(default = "default_max_retries")]
    #[builder(default = default_max_retries())]
    pub max_retries: u32,
    /// Pause before each retry of a network error.
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    #[builder(default = default_retry_delay())]
    pub retry_delay: Duration,
    /// Upper bound of a single attempt.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    #[builder(default = default_request_timeout())]
    pub request_timeout: Duration,
    /// Pause of a virtual user between two iterations.
    #[serde(default = "default_iteration_pause", with = "humantime_serde")]
    #[builder(default = default_iteration_pause())]
    pub iteration_pause: Duration,
    /// How long to wait for stopping virtual users once the stages are over.
    #[serde(default = "default_graceful_stop", with = "humantime_serde")]
    #[builder(default = default_graceful_stop())]
    pub graceful_stop: Duration,
    /// How often the ramp controller reconciles active users with the target.
    #[serde(default = "default_tick", with = "humantime_serde")]
    #[builder(default = default_tick())]
    pub tick: Duration,
}

impl RunConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Sum of all stage durations: the global run timeout.
    pub fn total_duration(&self) -> Result<Duration, ConfigError> {
        self.stages
            .iter()
            .try_fold(Duration::ZERO, |total, s| total.checked_add(s.duration))
            .ok_or(ConfigError::DurationOverflow)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_delay)
    }

    /// Reject configurations that cannot run, before anything is spawned.
    ///
    /// `metrics` are the metrics the workflow records; every threshold must
    /// reference one of them with an aggregation that fits its kind.
    pub fn validate(&self, metrics: &[MetricDecl]) -> Result<(), ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::EmptyStages);
        }
        if self.total_duration()?.is_zero() {
            return Err(ConfigError::ZeroDuration);
        }
        if self.tick.is_zero() {
            return Err(ConfigError::ZeroTick);
        }
        if self.max_retries == 0 {
            return Err(ConfigError::ZeroAttempts);
        }

        let url = url::Url::parse(&self.base_url).map_err(|e| ConfigError::InvalidBaseUrl {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidBaseUrl {
                url: self.base_url.clone(),
                reason: format!("unsupported scheme {:?}", url.scheme()),
            });
        }

        for threshold in &self.thresholds {
            let decl = metrics
                .iter()
                .find(|m| m.name == threshold.metric)
                .ok_or_else(|| ConfigError::UnknownMetric(threshold.metric.clone()))?;
            if !threshold.condition.aggregation.applies_to(decl.kind) {
                return Err(ConfigError::AggregationMismatch {
                    metric: threshold.metric.clone(),
                    kind: decl.kind,
                    aggregation: threshold.condition.aggregation.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metric::MetricKind, workflow::builtin_metrics};

    fn metrics() -> Vec<MetricDecl> {
        builtin_metrics(&["create", "get"])
    }

    fn minimal() -> RunConfig {
        RunConfig::builder()
            .base_url("http://localhost:8080/api")
            .stages(vec![Stage::new(Duration::from_secs(1), 10)])
            .build()
    }

    #[test]
    fn defaults() {
        let config = RunConfig::from_json(
            r#"{"base_url": "http://localhost", "stages": [{"duration": "10s", "target": 1}]}"#,
        )
        .unwrap();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay, Duration::from_secs(1));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.iteration_pause, Duration::from_secs(1));
        assert!(config.thresholds.is_empty());
        let built = RunConfig::builder()
            .base_url("http://localhost")
            .stages(config.stages.clone())
            .build();
        assert_eq!(config, built);
    }

    #[test]
    fn minimal_is_valid() {
        assert_eq!(minimal().validate(&metrics()), Ok(()));
    }

    #[test]
    fn empty_stages() {
        let mut config = minimal();
        config.stages.clear();
        assert_eq!(config.validate(&metrics()), Err(ConfigError::EmptyStages));
    }

    #[test]
    fn zero_duration() {
        let mut config = minimal();
        config.stages = vec![Stage::new(Duration::ZERO, 5)];
        assert_eq!(config.validate(&metrics()), Err(ConfigError::ZeroDuration));
    }

    #[test]
    fn negative_duration_does_not_parse() {
        let parsed = RunConfig::from_json(
            r#"{"base_url": "http://localhost", "stages": [{"duration": "-10s", "target": 1}]}"#,
        );
        assert!(matches!(parsed, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn overflowing_stages() {
        let mut config = minimal();
        config.stages = vec![
            Stage::new(Duration::MAX, 10),
            Stage::new(Duration::from_secs(1), 0),
        ];
        assert_eq!(config.total_duration(), Err(ConfigError::DurationOverflow));
        assert_eq!(
            config.validate(&metrics()),
            Err(ConfigError::DurationOverflow)
        );
    }

    #[test]
    fn huge_stages_from_json() {
        let config = RunConfig::from_json(
            r#"{"base_url": "http://localhost", "stages": [
                {"duration": "10000000000000000000s", "target": 1},
                {"duration": "10000000000000000000s", "target": 1}
            ]}"#,
        )
        .unwrap();
        assert_eq!(
            config.validate(&metrics()),
            Err(ConfigError::DurationOverflow)
        );
    }

    #[test]
    fn zero_tick() {
        let mut config = minimal();
        config.tick = Duration::ZERO;
        assert_eq!(config.validate(&metrics()), Err(ConfigError::ZeroTick));

        let parsed = RunConfig::from_json(
            r#"{"base_url": "http://localhost", "tick": "0s",
                "stages": [{"duration": "10s", "target": 1}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.validate(&metrics()), Err(ConfigError::ZeroTick));
    }

    #[test]
    fn zero_attempts() {
        let mut config = minimal();
        config.max_retries = 0;
        assert_eq!(config.validate(&metrics()), Err(ConfigError::ZeroAttempts));
    }

    #[test]
    fn bad_base_url() {
        let mut config = minimal();
        config.base_url = "localhost:8080".into();
        assert!(matches!(
            config.validate(&metrics()),
            Err(ConfigError::InvalidBaseUrl { .. })
        ));
    }

    #[test]
    fn threshold_on_unknown_metric() {
        let mut config = minimal();
        config.thresholds = vec![ThresholdSpec::parse("checks", "rate>0.9").unwrap()];
        assert_eq!(
            config.validate(&metrics()),
            Err(ConfigError::UnknownMetric("checks".into()))
        );
    }

    #[test]
    fn threshold_aggregation_must_fit_kind() {
        let mut config = minimal();
        config.thresholds = vec![ThresholdSpec::parse("errors", "p(95)<0.1").unwrap()];
        assert_eq!(
            config.validate(&metrics()),
            Err(ConfigError::AggregationMismatch {
                metric: "errors".into(),
                kind: MetricKind::Rate,
                aggregation: "p(95)".into(),
            })
        );
    }
}
