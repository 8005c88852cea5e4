//! Process-wide collection of named metrics.
//!
//! Every virtual user writes into the same [`MetricSink`]. A metric is identified
//! by its name, and each distinct tag set of that name is kept as its own series so
//! thresholds can later select `http_req_duration{type:create}` or the metric as a
//! whole.
//!
//! Writers take the registry lock shared and then the lock of a single series, so
//! concurrent writers only contend when they hit the same series. The exclusive lock
//! is only taken to register a new series and by [`MetricSink::seal`]: every write
//! either lands before the snapshot or is rejected with [`SinkError::Sealed`], never
//! torn or lost in between.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::{
    aggregate::MetricValue,
    error::SinkError,
    metric::{MetricKind, Sample},
};

/// Tags attached to a series, ordered so equal sets hash and compare equal.
pub type Tags = BTreeMap<String, String>;

/// Build a [`Tags`] map from string pairs.
pub fn tags<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Tags {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Identity of one series: metric name plus tag set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SeriesKey {
    pub name: String,
    pub tags: Tags,
}

impl SeriesKey {
    pub fn new(name: impl Into<String>, tags: Tags) -> Self {
        Self {
            name: name.into(),
            tags,
        }
    }

    /// Whether every tag of `filter` is present with the same value.
    pub fn matches(&self, name: &str, filter: &Tags) -> bool {
        self.name == name
            && filter
                .iter()
                .all(|(k, v)| self.tags.get(k).is_some_and(|own| own == v))
    }
}

#[derive(Default)]
struct Registry {
    sealed: bool,
    kinds: HashMap<String, MetricKind>,
    series: HashMap<SeriesKey, Arc<Mutex<MetricValue>>>,
}

impl Registry {
    /// Create the series `key` if needed, fixing the kind of its name on first use.
    fn ensure(&mut self, name: &str, kind: MetricKind, key: &SeriesKey) -> Result<(), SinkError> {
        let existing = *self.kinds.entry(name.to_string()).or_insert(kind);
        if existing != kind {
            return Err(SinkError::KindMismatch {
                name: name.to_string(),
                existing,
                attempted: kind,
            });
        }
        self.series
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(MetricValue::empty(kind))));
        Ok(())
    }
}

/// Concurrent, append-only metric store for a single run.
///
/// Unknown names are created on first write; the first write also fixes the kind of
/// the name. Counters and rates can only grow and nothing is ever removed.
#[derive(Default)]
pub struct MetricSink {
    registry: RwLock<Registry>,
}

impl MetricSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample to the series `name{tags}`.
    pub fn record(&self, name: &str, sample: Sample, tags: &Tags) -> Result<(), SinkError> {
        self.record_batch(&[(name, sample, tags)])
    }

    /// Append several samples as one unit: either all of them land before the sink is
    /// sealed or none does.
    pub fn record_batch(&self, batch: &[(&str, Sample, &Tags)]) -> Result<(), SinkError> {
        let keys: Vec<SeriesKey> = batch
            .iter()
            .map(|(name, _, tags)| SeriesKey::new(*name, (*tags).clone()))
            .collect();

        let missing = {
            let registry = self.registry.read();
            keys.iter().any(|key| !registry.series.contains_key(key))
        };
        if missing {
            let mut registry = self.registry.write();
            if registry.sealed {
                return Err(SinkError::Sealed);
            }
            for ((name, sample, _), key) in batch.iter().zip(&keys) {
                registry.ensure(name, sample.kind(), key)?;
            }
        }

        let registry = self.registry.read();
        if registry.sealed {
            return Err(SinkError::Sealed);
        }
        for ((name, sample, _), key) in batch.iter().zip(&keys) {
            // series are never removed, so every key registered above is still there
            if let Some(series) = registry.series.get(key) {
                series.lock().consume(name, *sample)?;
            }
        }
        Ok(())
    }

    /// Increment the counter `name{tags}` by `n`.
    pub fn add(&self, name: &str, n: u64, tags: &Tags) -> Result<(), SinkError> {
        self.record(name, Sample::Counter(n), tags)
    }

    /// Observe one boolean of the rate `name{tags}`.
    pub fn rate(&self, name: &str, value: bool, tags: &Tags) -> Result<(), SinkError> {
        self.record(name, Sample::Rate(value), tags)
    }

    /// Observe one value of the trend `name{tags}`.
    pub fn trend(&self, name: &str, value: f64, tags: &Tags) -> Result<(), SinkError> {
        self.record(name, Sample::Trend(value), tags)
    }

    pub fn is_sealed(&self) -> bool {
        self.registry.read().sealed
    }

    /// Stop accepting samples and return a consistent copy of every series.
    ///
    /// Sealing twice returns the same data again.
    pub fn seal(&self) -> Snapshot {
        let mut registry = self.registry.write();
        registry.sealed = true;
        let series = registry
            .series
            .iter()
            .map(|(key, value)| (key.clone(), value.lock().clone()))
            .collect();
        tracing::debug!("Sealed metric sink with {} series", registry.series.len());
        Snapshot {
            kinds: registry.kinds.clone().into_iter().collect(),
            series,
        }
    }
}

/// Immutable view of a sealed [`MetricSink`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    kinds: BTreeMap<String, MetricKind>,
    series: BTreeMap<SeriesKey, MetricValue>,
}

impl Snapshot {
    /// Kind of a metric name, if it was ever recorded.
    pub fn kind(&self, name: &str) -> Option<MetricKind> {
        self.kinds.get(name).copied()
    }

    /// Names of all recorded metrics.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }

    pub fn series(&self) -> impl Iterator<Item = (&SeriesKey, &MetricValue)> {
        self.series.iter()
    }

    /// Exactly the series `name{tags}`.
    pub fn get(&self, name: &str, tags: &Tags) -> Option<&MetricValue> {
        self.series.get(&SeriesKey::new(name, tags.clone()))
    }

    /// Merge of every series of `name` whose tags contain `filter`.
    ///
    /// Returns `None` when no series matches.
    pub fn select(&self, name: &str, filter: &Tags) -> Result<Option<MetricValue>, SinkError> {
        let mut merged: Option<MetricValue> = None;
        let matching = self
            .series
            .iter()
            .filter(|(key, _)| key.matches(name, filter));
        for (_, value) in matching {
            match merged.as_mut() {
                Some(acc) => acc.merge(name, value.clone())?,
                None => merged = Some(value.clone()),
            }
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_creates_and_fixes_kind() {
        let sink = MetricSink::new();
        sink.trend("create", 12.0, &Tags::new()).unwrap();

        let err = sink.add("create", 1, &Tags::new()).unwrap_err();
        assert_eq!(
            err,
            SinkError::KindMismatch {
                name: "create".into(),
                existing: MetricKind::Trend,
                attempted: MetricKind::Counter,
            }
        );
    }

    #[test]
    fn kind_is_per_name_across_tags() {
        let sink = MetricSink::new();
        sink.rate("errors", true, &tags([("type", "create")])).unwrap();
        assert!(sink.trend("errors", 1.0, &tags([("type", "get")])).is_err());
    }

    #[test]
    fn sealed_sink_rejects_writes() {
        let sink = MetricSink::new();
        sink.add("iterations", 1, &Tags::new()).unwrap();
        let snapshot = sink.seal();

        assert!(sink.is_sealed());
        assert_eq!(
            sink.add("iterations", 1, &Tags::new()),
            Err(SinkError::Sealed)
        );
        assert_eq!(snapshot.get("iterations", &Tags::new()).unwrap().count(), 1);
    }

    #[test]
    fn select_merges_matching_series() {
        let sink = MetricSink::new();
        let create = tags([("type", "create")]);
        let get = tags([("type", "get")]);
        sink.trend("http_req_duration", 10.0, &create).unwrap();
        sink.trend("http_req_duration", 20.0, &create).unwrap();
        sink.trend("http_req_duration", 30.0, &get).unwrap();
        let snapshot = sink.seal();

        let all = snapshot
            .select("http_req_duration", &Tags::new())
            .unwrap()
            .unwrap();
        assert_eq!(all.count(), 3);

        let only_create = snapshot
            .select("http_req_duration", &create)
            .unwrap()
            .unwrap();
        assert_eq!(only_create.as_trend().unwrap().sorted(), vec![10.0, 20.0]);

        let none = snapshot
            .select("http_req_duration", &tags([("type", "list")]))
            .unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn batch_is_all_or_nothing_after_seal() {
        let sink = MetricSink::new();
        let create = tags([("type", "create")]);
        sink.record_batch(&[
            ("http_reqs", Sample::Counter(1), &create),
            ("errors", Sample::Rate(false), &create),
        ])
        .unwrap();
        sink.seal();

        let again = sink.record_batch(&[
            ("http_reqs", Sample::Counter(1), &create),
            ("brand_new", Sample::Trend(1.0), &create),
        ]);
        assert_eq!(again, Err(SinkError::Sealed));
    }

    #[test]
    fn concurrent_writers_lose_nothing() {
        let sink = Arc::new(MetricSink::new());
        let writers = 16;
        let per_writer = 1_000;

        let handles: Vec<_> = (0..writers)
            .map(|w| {
                let sink = Arc::clone(&sink);
                std::thread::spawn(move || {
                    let tags = tags([("writer", if w % 2 == 0 { "even" } else { "odd" })]);
                    for i in 0..per_writer {
                        sink.trend("latency", i as f64, &tags).unwrap();
                        sink.add("requests", 1, &Tags::new()).unwrap();
                        sink.rate("errors", i % 10 == 0, &Tags::new()).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = sink.seal();
        let total = (writers * per_writer) as u64;
        let latency = snapshot.select("latency", &Tags::new()).unwrap().unwrap();
        assert_eq!(latency.count(), total);
        let requests = snapshot.get("requests", &Tags::new()).unwrap();
        assert_eq!(requests.as_counter().unwrap().value(), total);
        let errors = snapshot.get("errors", &Tags::new()).unwrap();
        assert_eq!(errors.as_rate().unwrap().trues(), total / 10);
    }
}
