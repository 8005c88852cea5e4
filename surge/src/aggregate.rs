use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::{
    error::SinkError,
    metric::{MetricKind, Sample},
};

/// The `Aggregate` trait defines how raw samples are folded into a mergeable
/// representation that keeps everything later analysis needs.
///
/// Aggregates store compact raw data (counts, observation lists). Derived values such
/// as averages or percentiles are computed on demand from a sealed
/// [`crate::sink::Snapshot`], never while virtual users are still writing.
///
/// # Implementor notes
/// - `merge` must be **associative** and **commutative**: series are merged in
///   arbitrary order when a threshold or summary selects several tagged series of
///   the same metric.
/// - `consume` is on the hot path of every virtual user and must not allocate
///   beyond amortized vector growth.
///
/// # Example
/// ```rust
/// use surge::aggregate::{Aggregate, Counter};
///
/// let mut left = Counter::new();
/// left.aggregate(&[1, 2, 3]);
///
/// let mut right = Counter::new();
/// right.consume(&4);
///
/// left.merge(right);
/// assert_eq!(left.value(), 10);
/// ```
pub trait Aggregate
where
    Self: Serialize + PartialEq + Send + Sync + Debug + Clone,
{
    /// The observation type this aggregate summarizes.
    type Sample;

    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Fold several samples into the current instance.
    fn aggregate(&mut self, samples: &[Self::Sample]) {
        samples.iter().for_each(|s| self.consume(s));
    }

    /// Fold a single sample into the aggregate.
    fn consume(&mut self, sample: &Self::Sample);

    /// Combine two aggregates into one.
    fn merge(&mut self, other: Self);
}

/// Sum of all increments. Never decreases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    count: u64,
}

impl Counter {
    pub fn value(&self) -> u64 {
        self.count
    }
}

impl Aggregate for Counter {
    type Sample = u64;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, sample: &Self::Sample) {
        self.count = self.count.saturating_add(*sample);
    }

    fn merge(&mut self, other: Self) {
        self.count = self.count.saturating_add(other.count);
    }
}

/// Count of `true` observations over all observations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    trues: u64,
    total: u64,
}

impl Rate {
    pub fn trues(&self) -> u64 {
        self.trues
    }

    pub fn falses(&self) -> u64 {
        self.total - self.trues
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// `trues / total`, or `None` when nothing was observed.
    pub fn value(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.trues as f64 / self.total as f64)
        }
    }
}

impl Aggregate for Rate {
    type Sample = bool;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, sample: &Self::Sample) {
        self.total += 1;
        if *sample {
            self.trues += 1;
        }
    }

    fn merge(&mut self, other: Self) {
        self.trues += other.trues;
        self.total += other.total;
    }
}

/// Unordered multiset of numeric observations.
///
/// Every value is retained so that any percentile can be computed exactly. Merging
/// concatenates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    values: Vec<f64>,
}

impl Trend {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The observations sorted ascending with a total order on `f64`.
    pub fn sorted(&self) -> Vec<f64> {
        let mut sorted = self.values.clone();
        sorted.sort_by(f64::total_cmp);
        sorted
    }

    /// Nearest-rank percentile, `None` for an empty trend.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        percentile(&self.sorted(), p)
    }

    /// All descriptive statistics in one pass over a single sort.
    pub fn stats(&self) -> Option<TrendStats> {
        if self.values.is_empty() {
            return None;
        }
        let sorted = self.sorted();
        let sum: f64 = sorted.iter().sum();
        Some(TrendStats {
            count: sorted.len() as u64,
            avg: sum / sorted.len() as f64,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            med: percentile(&sorted, 50.0)?,
            p90: percentile(&sorted, 90.0)?,
            p95: percentile(&sorted, 95.0)?,
        })
    }
}

impl Aggregate for Trend {
    type Sample = f64;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, sample: &Self::Sample) {
        self.values.push(*sample);
    }

    fn merge(&mut self, mut other: Self) {
        self.values.append(&mut other.values);
    }
}

/// Descriptive statistics of a non-empty [`Trend`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendStats {
    pub count: u64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub med: f64,
    pub p90: f64,
    pub p95: f64,
}

/// Nearest-rank percentile over an ascending slice.
///
/// The result is the smallest value such that at least `p` percent of the values
/// are less than or equal to it: `sorted[ceil(p/100 * n) - 1]`. `p` is clamped to
/// `[0, 100]` and `p = 0` yields the minimum.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let p = if p.is_nan() { 0.0 } else { p.clamp(0.0, 100.0) };
    let rank = (p * sorted.len() as f64 / 100.0).ceil() as usize;
    let index = rank.saturating_sub(1).min(sorted.len() - 1);
    Some(sorted[index])
}

/// The aggregate behind one metric series, whichever its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricValue {
    Counter(Counter),
    Rate(Rate),
    Trend(Trend),
}

impl MetricValue {
    pub fn empty(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => MetricValue::Counter(Counter::new()),
            MetricKind::Rate => MetricValue::Rate(Rate::new()),
            MetricKind::Trend => MetricValue::Trend(Trend::new()),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Counter(_) => MetricKind::Counter,
            MetricValue::Rate(_) => MetricKind::Rate,
            MetricValue::Trend(_) => MetricKind::Trend,
        }
    }

    /// Number of observations, or the counter total.
    pub fn count(&self) -> u64 {
        match self {
            MetricValue::Counter(c) => c.value(),
            MetricValue::Rate(r) => r.total(),
            MetricValue::Trend(t) => t.len() as u64,
        }
    }

    pub fn as_trend(&self) -> Option<&Trend> {
        match self {
            MetricValue::Trend(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_rate(&self) -> Option<&Rate> {
        match self {
            MetricValue::Rate(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_counter(&self) -> Option<&Counter> {
        match self {
            MetricValue::Counter(c) => Some(c),
            _ => None,
        }
    }

    /// Fold one sample in. The sample must match the series kind.
    pub fn consume(&mut self, name: &str, sample: Sample) -> Result<(), SinkError> {
        match (self, sample) {
            (MetricValue::Counter(c), Sample::Counter(n)) => c.consume(&n),
            (MetricValue::Rate(r), Sample::Rate(b)) => r.consume(&b),
            (MetricValue::Trend(t), Sample::Trend(v)) => t.consume(&v),
            (this, sample) => {
                return Err(SinkError::KindMismatch {
                    name: name.to_string(),
                    existing: this.kind(),
                    attempted: sample.kind(),
                });
            }
        }
        Ok(())
    }

    pub fn merge(&mut self, name: &str, other: MetricValue) -> Result<(), SinkError> {
        match (self, other) {
            (MetricValue::Counter(a), MetricValue::Counter(b)) => a.merge(b),
            (MetricValue::Rate(a), MetricValue::Rate(b)) => a.merge(b),
            (MetricValue::Trend(a), MetricValue::Trend(b)) => a.merge(b),
            (this, other) => {
                return Err(SinkError::KindMismatch {
                    name: name.to_string(),
                    existing: this.kind(),
                    attempted: other.kind(),
                });
            }
        }
        Ok(())
    }
}
