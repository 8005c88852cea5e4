//! Pass/fail predicates over aggregated metrics.
//!
//! A threshold pairs a metric selector with a condition, using the same notation as
//! k6:
//!
//! ```text
//! http_req_duration                 p(95)<500
//! http_req_duration{type:create}    p(95)<600
//! errors                            rate<0.1
//! ```
//!
//! A selector without tags aggregates every series of the metric; with tags it
//! aggregates the series carrying at least those tags.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    aggregate::MetricValue,
    error::{ConfigError, SinkError},
    metric::MetricKind,
    sink::{Snapshot, Tags},
};

/// How a metric is reduced to the single number a threshold compares.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    Avg,
    Min,
    Max,
    Med,
    /// Nearest-rank percentile, `0..=100`.
    Percentile(f64),
    /// Fraction of `true` observations.
    Rate,
    /// Number of observations, or the counter total.
    Count,
}

impl Aggregation {
    pub fn applies_to(&self, kind: MetricKind) -> bool {
        match self {
            Aggregation::Count => true,
            Aggregation::Rate => kind == MetricKind::Rate,
            _ => kind == MetricKind::Trend,
        }
    }

    /// Reduce `value`, `None` when the aggregate is undefined (no observations) or
    /// does not apply to the metric kind.
    pub fn reduce(&self, value: &MetricValue) -> Option<f64> {
        match (self, value) {
            (Aggregation::Count, v) => Some(v.count() as f64),
            (Aggregation::Rate, MetricValue::Rate(r)) => r.value(),
            (Aggregation::Avg, MetricValue::Trend(t)) => t.stats().map(|s| s.avg),
            (Aggregation::Min, MetricValue::Trend(t)) => t.stats().map(|s| s.min),
            (Aggregation::Max, MetricValue::Trend(t)) => t.stats().map(|s| s.max),
            (Aggregation::Med, MetricValue::Trend(t)) => t.percentile(50.0),
            (Aggregation::Percentile(p), MetricValue::Trend(t)) => t.percentile(*p),
            _ => None,
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Avg => f.write_str("avg"),
            Aggregation::Min => f.write_str("min"),
            Aggregation::Max => f.write_str("max"),
            Aggregation::Med => f.write_str("med"),
            Aggregation::Percentile(p) => write!(f, "p({p})"),
            Aggregation::Rate => f.write_str("rate"),
            Aggregation::Count => f.write_str("count"),
        }
    }
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "avg" => Ok(Aggregation::Avg),
            "min" => Ok(Aggregation::Min),
            "max" => Ok(Aggregation::Max),
            "med" => Ok(Aggregation::Med),
            "rate" => Ok(Aggregation::Rate),
            "count" => Ok(Aggregation::Count),
            other => {
                let inner = other
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| format!("unknown aggregation {other:?}"))?;
                let p: f64 = inner
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid percentile {inner:?}"))?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(format!("percentile {p} is outside 0..=100"));
                }
                Ok(Aggregation::Percentile(p))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    pub fn holds(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparison::Lt => lhs < rhs,
            Comparison::Le => lhs <= rhs,
            Comparison::Gt => lhs > rhs,
            Comparison::Ge => lhs >= rhs,
            Comparison::Eq => lhs == rhs,
            Comparison::Ne => lhs != rhs,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
        }
    }
}

/// `aggregation comparison value`, e.g. `p(95)<500`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Condition {
    pub aggregation: Aggregation,
    pub comparison: Comparison,
    pub value: f64,
}

impl Condition {
    pub fn holds(&self, observed: f64) -> bool {
        self.comparison.holds(observed, self.value)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.aggregation, self.comparison.as_str(), self.value)
    }
}

impl FromStr for Condition {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ConfigError::InvalidThreshold {
            expression: s.to_string(),
            reason,
        };

        let at = s
            .find(['<', '>', '=', '!'])
            .ok_or_else(|| invalid("missing comparison operator".into()))?;
        let (left, rest) = s.split_at(at);
        let (comparison, right) = [
            ("<=", Comparison::Le),
            (">=", Comparison::Ge),
            ("==", Comparison::Eq),
            ("!=", Comparison::Ne),
            ("<", Comparison::Lt),
            (">", Comparison::Gt),
        ]
        .into_iter()
        .find_map(|(op, cmp)| rest.strip_prefix(op).map(|right| (cmp, right)))
        .ok_or_else(|| invalid(format!("unknown operator in {rest:?}")))?;

        let aggregation = left.parse::<Aggregation>().map_err(invalid)?;
        let value = right
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| invalid(format!("invalid value {:?}", right.trim())))?;

        Ok(Condition {
            aggregation,
            comparison,
            value,
        })
    }
}

impl TryFrom<String> for Condition {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Condition> for String {
    fn from(value: Condition) -> Self {
        value.to_string()
    }
}

/// Split `name{key:value,...}` into the name and its tag filter.
pub fn parse_selector(selector: &str) -> Result<(String, Tags), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidThreshold {
        expression: selector.to_string(),
        reason: reason.to_string(),
    };

    let selector = selector.trim();
    let (name, filter) = match selector.split_once('{') {
        None => (selector, None),
        Some((name, rest)) => {
            let inner = rest
                .strip_suffix('}')
                .ok_or_else(|| invalid("unterminated tag filter"))?;
            (name.trim(), Some(inner))
        }
    };
    if name.is_empty() {
        return Err(invalid("empty metric name"));
    }

    let mut tags = Tags::new();
    for pair in filter.into_iter().flat_map(|f| f.split(',')) {
        let (key, value) = pair
            .split_once(':')
            .ok_or_else(|| invalid("tag filters are written key:value"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(invalid("empty tag key"));
        }
        tags.insert(key.to_string(), value.trim().to_string());
    }
    Ok((name.to_string(), tags))
}

/// Configuration form of a threshold: the selector may carry tags in braces, in
/// `tags`, or both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdEntry {
    metric: String,
    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    tags: Tags,
    condition: Condition,
}

/// A condition that must hold on a metric at the end of the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ThresholdEntry", into = "ThresholdEntry")]
pub struct ThresholdSpec {
    pub metric: String,
    pub tags: Tags,
    pub condition: Condition,
}

impl ThresholdSpec {
    /// Build from a selector such as `http_req_duration{type:create}` and a
    /// condition such as `p(95)<600`.
    pub fn parse(selector: &str, condition: &str) -> Result<Self, ConfigError> {
        let (metric, tags) = parse_selector(selector)?;
        Ok(Self {
            metric,
            tags,
            condition: condition.parse()?,
        })
    }

    /// The selector in `name{key:value}` notation.
    pub fn selector(&self) -> String {
        if self.tags.is_empty() {
            return self.metric.clone();
        }
        let tags: Vec<String> = self.tags.iter().map(|(k, v)| format!("{k}:{v}")).collect();
        format!("{}{{{}}}", self.metric, tags.join(","))
    }

    /// Check the condition against a sealed snapshot.
    ///
    /// An undefined aggregate (nothing recorded) has no `observed` value and counts
    /// as passed.
    pub fn evaluate(&self, snapshot: &Snapshot) -> Result<ThresholdResult, SinkError> {
        let selected = snapshot.select(&self.metric, &self.tags)?;
        let observed = match (&selected, self.condition.aggregation) {
            (Some(value), aggregation) => aggregation.reduce(value),
            (None, Aggregation::Count) => Some(0.0),
            (None, _) => None,
        };
        let passed = observed.is_none_or(|v| self.condition.holds(v));
        Ok(ThresholdResult {
            metric: self.selector(),
            condition: self.condition.to_string(),
            observed,
            passed,
        })
    }
}

impl fmt::Display for ThresholdSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.selector(), self.condition)
    }
}

impl TryFrom<ThresholdEntry> for ThresholdSpec {
    type Error = ConfigError;

    fn try_from(raw: ThresholdEntry) -> Result<Self, Self::Error> {
        let (metric, mut tags) = parse_selector(&raw.metric)?;
        tags.extend(raw.tags);
        Ok(Self {
            metric,
            tags,
            condition: raw.condition,
        })
    }
}

impl From<ThresholdSpec> for ThresholdEntry {
    fn from(spec: ThresholdSpec) -> Self {
        Self {
            metric: spec.metric,
            tags: spec.tags,
            condition: spec.condition,
        }
    }
}

/// Verdict of one threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub condition: String,
    pub observed: Option<f64>,
    pub passed: bool,
}
