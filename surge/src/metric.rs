use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

/// The kind of a named metric. A name keeps the kind it was first recorded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Monotonically increasing integer.
    Counter,
    /// Fraction of boolean observations that were `true`.
    Rate,
    /// Distribution of numeric observations.
    Trend,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricKind::Counter => "counter",
            MetricKind::Rate => "rate",
            MetricKind::Trend => "trend",
        };
        f.write_str(name)
    }
}

/// A `Sample` is a single observation written into the [`crate::MetricSink`].
///
/// Samples are the most granular level of data a virtual user produces: one
/// request latency, one passed or failed check, one finished iteration. They are
/// folded into an [`crate::aggregate::MetricValue`] as soon as they are recorded and
/// are never retained individually, except as trend values.
///
/// ## Example
/// ```rust
/// use surge::metric::{MetricKind, Sample};
///
/// let latency = Sample::Trend(42.0);
/// assert_eq!(latency.kind(), MetricKind::Trend);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Sample {
    /// Increment of a counter.
    Counter(u64),
    /// One boolean observation of a rate.
    Rate(bool),
    /// One numeric observation of a trend, latencies are in milliseconds.
    Trend(f64),
}

impl Sample {
    /// A latency as a trend sample in milliseconds.
    pub fn latency(duration: Duration) -> Self {
        Sample::Trend(duration.as_nanos() as f64 / 1_000_000.0)
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Sample::Counter(_) => MetricKind::Counter,
            Sample::Rate(_) => MetricKind::Rate,
            Sample::Trend(_) => MetricKind::Trend,
        }
    }
}
