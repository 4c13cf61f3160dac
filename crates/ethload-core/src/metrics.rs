//! In-process metrics registry keyed by `(metric name, tag set)`.
//!
//! Counters sum, trends retain every sample, gauges accept absolute sets and
//! deltas. Series live in a sharded map so concurrent writers never lose an
//! update and never contend on a single global lock.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Trend,
    Gauge,
}

/// A metric descriptor. Descriptors are constants so a name is always used
/// with the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Metric {
    pub name: &'static str,
    pub kind: MetricKind,
}

impl Metric {
    pub const fn counter(name: &'static str) -> Self {
        Self {
            name,
            kind: MetricKind::Counter,
        }
    }

    pub const fn trend(name: &'static str) -> Self {
        Self {
            name,
            kind: MetricKind::Trend,
        }
    }

    pub const fn gauge(name: &'static str) -> Self {
        Self {
            name,
            kind: MetricKind::Gauge,
        }
    }
}

pub mod names {
    use super::Metric;

    pub const RPC_REQUESTS: Metric = Metric::counter("rpc_requests");
    pub const RPC_SUCCESS: Metric = Metric::counter("rpc_success");
    pub const RPC_ERRORS: Metric = Metric::counter("rpc_errors");
    pub const RPC_TIMEOUTS: Metric = Metric::counter("rpc_timeouts");
    pub const RPC_RETRIES: Metric = Metric::counter("rpc_retries");
    pub const RPC_LATENCY_MS: Metric = Metric::trend("rpc_latency_ms");

    pub const WS_ACTIVE_CONNECTIONS: Metric = Metric::gauge("ws_active_connections");
    pub const BLOCK_HEIGHT: Metric = Metric::gauge("block_height");
    pub const GAS_PRICE_WEI: Metric = Metric::gauge("gas_price_wei");

    pub const VUS_ACTIVE: Metric = Metric::gauge("vus_active");
    pub const ITERATIONS: Metric = Metric::counter("iterations");
    pub const DROPPED_ITERATIONS: Metric = Metric::counter("dropped_iterations");
    pub const ITERATION_DURATION_MS: Metric = Metric::trend("iteration_duration_ms");

    pub const SETUP_TRANSACTIONS: Metric = Metric::counter("setup_transactions");
}

/// Tag dimension names.
pub mod tags {
    pub const RUN_ID: &str = "run_id";
    pub const SCENARIO: &str = "scenario";
    pub const ENDPOINT: &str = "endpoint";
    pub const METHOD: &str = "method";
    pub const TRANSPORT: &str = "transport";
    pub const RETRY_ATTEMPT: &str = "retry_attempt";
    pub const STAGE: &str = "stage";
    pub const REASON: &str = "reason";
    pub const PHASE: &str = "phase";
    pub const OUTCOME: &str = "outcome";
}

/// Ordered tag set. Two samples with equal tag sets land in the same series.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// True when every `(key, value)` pair in `filter` is present.
    pub fn contains_all(&self, filter: &[(&str, &str)]) -> bool {
        filter.iter().all(|(k, v)| self.get(k) == Some(*v))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{{{}}}", parts.join(","))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeriesKey {
    name: &'static str,
    tags: TagSet,
}

#[derive(Debug, Clone)]
enum Series {
    Counter(f64),
    Trend(Vec<f64>),
    Gauge(f64),
}

impl Series {
    fn empty(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Series::Counter(0.0),
            MetricKind::Trend => Series::Trend(Vec::new()),
            MetricKind::Gauge => Series::Gauge(0.0),
        }
    }

    fn kind(&self) -> MetricKind {
        match self {
            Series::Counter(_) => MetricKind::Counter,
            Series::Trend(_) => MetricKind::Trend,
            Series::Gauge(_) => MetricKind::Gauge,
        }
    }
}

#[derive(Debug, Default)]
pub struct MetricsAggregator {
    series: DashMap<SeriesKey, Series>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulates `value`: counters sum, trends append, gauges add a delta.
    pub fn add(&self, metric: &Metric, value: f64, tags: &TagSet) {
        let key = SeriesKey {
            name: metric.name,
            tags: tags.clone(),
        };
        let mut entry = self
            .series
            .entry(key)
            .or_insert_with(|| Series::empty(metric.kind));

        match entry.value_mut() {
            Series::Counter(total) => *total += value,
            Series::Trend(samples) => samples.push(value),
            Series::Gauge(current) => *current += value,
        }
    }

    /// Sets a gauge to an absolute value.
    pub fn set(&self, metric: &Metric, value: f64, tags: &TagSet) {
        if metric.kind != MetricKind::Gauge {
            warn!(metric = metric.name, "set() called on a non-gauge metric");
            return;
        }
        self.series.insert(
            SeriesKey {
                name: metric.name,
                tags: tags.clone(),
            },
            Series::Gauge(value),
        );
    }

    pub fn counter(&self, metric: &Metric, tags: &TagSet) -> f64 {
        match self.lookup(metric, tags) {
            Some(Series::Counter(total)) => total,
            _ => 0.0,
        }
    }

    pub fn gauge(&self, metric: &Metric, tags: &TagSet) -> Option<f64> {
        match self.lookup(metric, tags) {
            Some(Series::Gauge(value)) => Some(value),
            _ => None,
        }
    }

    pub fn trend(&self, metric: &Metric, tags: &TagSet) -> Option<TrendSummary> {
        match self.lookup(metric, tags) {
            Some(Series::Trend(samples)) => Some(TrendSummary::from_samples(&samples)),
            _ => None,
        }
    }

    /// Sums a counter or gauge across every series whose tags contain all of
    /// `filter`. Trends contribute their sample count.
    pub fn sum_matching(&self, metric: &Metric, filter: &[(&str, &str)]) -> f64 {
        self.series
            .iter()
            .filter(|e| e.key().name == metric.name && e.key().tags.contains_all(filter))
            .map(|e| match e.value() {
                Series::Counter(v) | Series::Gauge(v) => *v,
                Series::Trend(samples) => samples.len() as f64,
            })
            .sum()
    }

    /// Merges every trend series of `metric` whose tags contain `filter`.
    pub fn trend_matching(&self, metric: &Metric, filter: &[(&str, &str)]) -> TrendSummary {
        let mut merged = Vec::new();
        for e in self.series.iter() {
            if e.key().name != metric.name || !e.key().tags.contains_all(filter) {
                continue;
            }
            if let Series::Trend(samples) = e.value() {
                merged.extend_from_slice(samples);
            }
        }
        TrendSummary::from_samples(&merged)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut series: Vec<SeriesSnapshot> = self
            .series
            .iter()
            .map(|e| {
                let value = match e.value() {
                    Series::Counter(v) => SeriesValue::Counter { value: *v },
                    Series::Gauge(v) => SeriesValue::Gauge { value: *v },
                    Series::Trend(samples) => {
                        SeriesValue::Trend(TrendSummary::from_samples(samples))
                    }
                };
                SeriesSnapshot {
                    name: e.key().name.to_string(),
                    tags: e.key().tags.clone(),
                    value,
                }
            })
            .collect();
        series.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.tags.cmp(&b.tags)));
        MetricsSnapshot { series }
    }

    fn lookup(&self, metric: &Metric, tags: &TagSet) -> Option<Series> {
        let key = SeriesKey {
            name: metric.name,
            tags: tags.clone(),
        };
        let series = self.series.get(&key)?;
        if series.kind() != metric.kind {
            return None;
        }
        Some(series.value().clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub series: Vec<SeriesSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesSnapshot {
    pub name: String,
    pub tags: TagSet,
    pub value: SeriesValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SeriesValue {
    Counter { value: f64 },
    Gauge { value: f64 },
    Trend(TrendSummary),
}

/// Summary of a trend's samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl TrendSummary {
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);

        let sum: f64 = sorted.iter().sum();
        Self {
            count: sorted.len() as u64,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            avg: sum / sorted.len() as f64,
            p50: percentile(&sorted, 50),
            p90: percentile(&sorted, 90),
            p95: percentile(&sorted, 95),
            p99: percentile(&sorted, 99),
        }
    }
}

/// Nearest-rank percentile over sorted samples.
fn percentile(sorted: &[f64], p: u64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let total = sorted.len() as u64;
    let rank = (total * p).div_ceil(100).max(1);
    sorted[(rank - 1).min(total - 1) as usize]
}
