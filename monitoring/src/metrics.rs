//! Metrics registry for counters, gauges and histograms
//!
//! Series are keyed by name plus label set. The registry mutates aggregated
//! state only; recorded samples themselves are immutable.

use std::collections::HashMap;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::events::{EventBus, MonitorEvent};
use crate::Result;

/// Default histogram bucket upper bounds in seconds
pub const DEFAULT_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Default cap on distinct label sets per metric name
pub const DEFAULT_MAX_LABEL_CARDINALITY: usize = 100;

/// Metric kinds supported by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Monotonically increasing counter
    Counter,

    /// Gauge that can go up or down
    Gauge,

    /// Distribution observed into buckets
    Histogram,

    /// Summary; observed into the same bucket machinery as a histogram
    Summary,
}

impl MetricKind {
    /// Get the kind as a string for expositions
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
            MetricKind::Summary => "summary",
        }
    }
}

/// A single recorded sample. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    /// Metric name
    pub name: String,

    /// Sample value
    pub value: f64,

    /// Labels; part of the series identity
    pub labels: HashMap<String, String>,

    /// Metric kind
    pub kind: MetricKind,

    /// When the sample was taken
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl MetricSample {
    /// Create a counter sample
    pub fn counter<S: Into<String>>(name: S, value: f64) -> Self {
        Self::new(name, value, MetricKind::Counter)
    }

    /// Create a gauge sample
    pub fn gauge<S: Into<String>>(name: S, value: f64) -> Self {
        Self::new(name, value, MetricKind::Gauge)
    }

    /// Create a histogram observation
    pub fn histogram<S: Into<String>>(name: S, value: f64) -> Self {
        Self::new(name, value, MetricKind::Histogram)
    }

    fn new<S: Into<String>>(name: S, value: f64, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            value,
            labels: HashMap::new(),
            kind,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Add a label
    pub fn with_label<S: Into<String>>(mut self, key: S, value: S) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Series identity: metric name plus sorted label pairs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeriesKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl SeriesKey {
    fn new(name: &str, labels: &HashMap<String, String>) -> Self {
        let mut labels: Vec<(String, String)> =
            labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }
}

/// Aggregated state for one series
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Aggregate {
    Counter {
        value: f64,
    },
    Gauge {
        value: f64,
    },
    Histogram {
        /// Bucket upper bounds
        bounds: Vec<f64>,
        /// Per-bucket counts (not cumulative); rendered cumulative on export
        counts: Vec<u64>,
        sum: f64,
        count: u64,
    },
}

impl Aggregate {
    fn kind(&self) -> MetricKind {
        match self {
            Aggregate::Counter { .. } => MetricKind::Counter,
            Aggregate::Gauge { .. } => MetricKind::Gauge,
            Aggregate::Histogram { .. } => MetricKind::Histogram,
        }
    }

    fn observe(&mut self, value: f64) {
        if let Aggregate::Histogram {
            bounds,
            counts,
            sum,
            count,
        } = self
        {
            *sum += value;
            *count += 1;
            for (i, bound) in bounds.iter().enumerate() {
                if value <= *bound {
                    counts[i] += 1;
                    return;
                }
            }
            // Above all bounds; only the implicit +Inf bucket counts it
        }
    }

    /// Extract a single numeric value for alert evaluation
    pub fn as_value(&self) -> f64 {
        match self {
            Aggregate::Counter { value } => *value,
            Aggregate::Gauge { value } => *value,
            Aggregate::Histogram { sum, count, .. } => {
                if *count == 0 {
                    0.0
                } else {
                    sum / *count as f64
                }
            }
        }
    }
}

/// One series in a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesSnapshot {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub aggregate: Aggregate,
}

/// Immutable, serializable view of the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub series: Vec<SeriesSnapshot>,
    pub help: HashMap<String, String>,
}

/// Registered histogram layout
#[derive(Debug, Clone)]
struct HistogramSpec {
    bounds: Vec<f64>,
}

/// Registry storing aggregated metric series.
///
/// Constructed once per process and passed explicitly to dependents; tests
/// create isolated registries.
pub struct MetricsRegistry {
    series: Arc<RwLock<HashMap<SeriesKey, Aggregate>>>,

    /// Gauge names that accept samples
    gauges: Arc<RwLock<HashMap<String, ()>>>,

    /// Histogram names with their bucket layouts
    histograms: Arc<RwLock<HashMap<String, HistogramSpec>>>,

    /// Help text per metric name
    help: Arc<RwLock<HashMap<String, String>>>,

    /// Name prefix applied on exposition
    prefix: String,

    /// Cap on distinct label sets per metric name
    max_label_cardinality: usize,

    events: EventBus,
}

impl MetricsRegistry {
    /// Create a new registry with the given exposition prefix
    pub fn new(prefix: impl Into<String>, events: EventBus) -> Self {
        Self {
            series: Arc::new(RwLock::new(HashMap::new())),
            gauges: Arc::new(RwLock::new(HashMap::new())),
            histograms: Arc::new(RwLock::new(HashMap::new())),
            help: Arc::new(RwLock::new(HashMap::new())),
            prefix: prefix.into(),
            max_label_cardinality: DEFAULT_MAX_LABEL_CARDINALITY,
            events,
        }
    }

    /// Override the per-metric label cardinality cap
    pub fn with_label_cardinality(mut self, max: usize) -> Self {
        self.max_label_cardinality = max;
        self
    }

    /// Register a counter's help text. Counters auto-create on first record,
    /// so this is optional.
    pub async fn register_counter(&self, name: &str, help: &str) {
        self.help
            .write()
            .await
            .insert(name.to_string(), help.to_string());
    }

    /// Register a gauge. Samples for unregistered gauge names are ignored.
    pub async fn register_gauge(&self, name: &str, help: &str) {
        self.gauges.write().await.insert(name.to_string(), ());
        self.help
            .write()
            .await
            .insert(name.to_string(), help.to_string());
    }

    /// Register a histogram with explicit bucket bounds.
    /// Samples for unregistered histogram names are ignored.
    pub async fn register_histogram(&self, name: &str, help: &str, bounds: &[f64]) {
        let mut sorted = bounds.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        self.histograms
            .write()
            .await
            .insert(name.to_string(), HistogramSpec { bounds: sorted });
        self.help
            .write()
            .await
            .insert(name.to_string(), help.to_string());
    }

    /// Record a sample into the matching aggregate.
    ///
    /// Counters are created on first record. A sample against an unregistered
    /// gauge or histogram name is a silent no-op, mirroring permissive
    /// instrumentation call sites, as is a sample whose label set would push
    /// a metric past the cardinality cap. Emits a `MetricRecorded` event on
    /// success.
    pub async fn record_sample(&self, sample: &MetricSample) {
        let key = SeriesKey::new(&sample.name, &sample.labels);
        let recorded = match sample.kind {
            MetricKind::Counter => {
                let mut series = self.series.write().await;
                if self.over_cardinality(&series, &key) {
                    false
                } else {
                    match series.entry(key).or_insert(Aggregate::Counter { value: 0.0 }) {
                        Aggregate::Counter { value } => {
                            *value += sample.value;
                            true
                        }
                        other => {
                            debug!(
                                name = %sample.name,
                                expected = other.kind().as_str(),
                                "Kind mismatch for series, sample dropped"
                            );
                            false
                        }
                    }
                }
            }
            MetricKind::Gauge => {
                if !self.gauges.read().await.contains_key(&sample.name) {
                    debug!(name = %sample.name, "Unknown gauge, sample dropped");
                    false
                } else {
                    let mut series = self.series.write().await;
                    if self.over_cardinality(&series, &key) {
                        false
                    } else {
                        match series.entry(key).or_insert(Aggregate::Gauge { value: 0.0 }) {
                            Aggregate::Gauge { value } => {
                                *value = sample.value;
                                true
                            }
                            _ => false,
                        }
                    }
                }
            }
            MetricKind::Histogram | MetricKind::Summary => {
                let spec = self.histograms.read().await.get(&sample.name).cloned();
                match spec {
                    None => {
                        debug!(name = %sample.name, "Unknown histogram, sample dropped");
                        false
                    }
                    Some(spec) => {
                        let mut series = self.series.write().await;
                        if self.over_cardinality(&series, &key) {
                            false
                        } else {
                            let agg =
                                series.entry(key).or_insert_with(|| Aggregate::Histogram {
                                    counts: vec![0; spec.bounds.len()],
                                    bounds: spec.bounds,
                                    sum: 0.0,
                                    count: 0,
                                });
                            agg.observe(sample.value);
                            true
                        }
                    }
                }
            }
        };

        if recorded {
            self.events.publish(MonitorEvent::MetricRecorded {
                name: sample.name.clone(),
                kind: sample.kind,
                value: sample.value,
                labels: sample.labels.clone(),
            });
        }
    }

    /// True when recording `key` would create a new series past the
    /// per-metric cardinality cap. Samples for existing series always pass.
    fn over_cardinality(&self, series: &HashMap<SeriesKey, Aggregate>, key: &SeriesKey) -> bool {
        if series.contains_key(key) {
            return false;
        }
        let existing = series.keys().filter(|k| k.name == key.name).count();
        if existing >= self.max_label_cardinality {
            debug!(
                name = %key.name,
                cap = self.max_label_cardinality,
                "Label cardinality cap reached, sample dropped"
            );
            true
        } else {
            false
        }
    }

    /// Take an immutable snapshot of all series
    pub async fn snapshot(&self) -> MetricsSnapshot {
        let series = self.series.read().await;
        let help = self.help.read().await.clone();

        let mut entries: Vec<SeriesSnapshot> = series
            .iter()
            .map(|(key, agg)| SeriesSnapshot {
                name: key.name.clone(),
                labels: key.labels.iter().cloned().collect(),
                aggregate: agg.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        MetricsSnapshot {
            timestamp: chrono::Utc::now(),
            series: entries,
            help,
        }
    }

    /// Replace the registry state with the contents of a snapshot.
    ///
    /// Gauge and histogram registrations are inferred from the snapshot so
    /// subsequent samples keep aggregating.
    pub async fn restore(&self, snapshot: &MetricsSnapshot) {
        let mut series = self.series.write().await;
        let mut gauges = self.gauges.write().await;
        let mut histograms = self.histograms.write().await;
        let mut help = self.help.write().await;

        series.clear();
        *help = snapshot.help.clone();

        for entry in &snapshot.series {
            match &entry.aggregate {
                Aggregate::Gauge { .. } => {
                    gauges.insert(entry.name.clone(), ());
                }
                Aggregate::Histogram { bounds, .. } => {
                    histograms.insert(
                        entry.name.clone(),
                        HistogramSpec {
                            bounds: bounds.clone(),
                        },
                    );
                }
                Aggregate::Counter { .. } => {}
            }
            let key = SeriesKey::new(&entry.name, &entry.labels);
            series.insert(key, entry.aggregate.clone());
        }
    }

    /// Clear all aggregates, keeping registrations
    pub async fn reset(&self) {
        self.series.write().await.clear();
    }

    /// Export the full registry as a Prometheus-style text exposition
    pub async fn export_text(&self) -> String {
        let snapshot = self.snapshot().await;
        let mut output = String::new();
        let mut seen_headers: Vec<String> = Vec::new();

        for entry in &snapshot.series {
            let full_name = format!("{}{}", self.prefix, entry.name);

            if !seen_headers.contains(&full_name) {
                let help = snapshot
                    .help
                    .get(&entry.name)
                    .cloned()
                    .unwrap_or_else(|| entry.name.replace('_', " "));
                output.push_str(&format!("# HELP {} {}\n", full_name, help));
                output.push_str(&format!(
                    "# TYPE {} {}\n",
                    full_name,
                    entry.aggregate.kind().as_str()
                ));
                seen_headers.push(full_name.clone());
            }

            match &entry.aggregate {
                Aggregate::Counter { value } | Aggregate::Gauge { value } => {
                    output.push_str(&format!(
                        "{}{} {}\n",
                        full_name,
                        format_labels(&entry.labels, None),
                        value
                    ));
                }
                Aggregate::Histogram {
                    bounds,
                    counts,
                    sum,
                    count,
                } => {
                    let mut cumulative = 0u64;
                    for (bound, bucket_count) in bounds.iter().zip(counts.iter()) {
                        cumulative += bucket_count;
                        output.push_str(&format!(
                            "{}_bucket{} {}\n",
                            full_name,
                            format_labels(&entry.labels, Some(("le", bound.to_string()))),
                            cumulative
                        ));
                    }
                    output.push_str(&format!(
                        "{}_bucket{} {}\n",
                        full_name,
                        format_labels(&entry.labels, Some(("le", "+Inf".to_string()))),
                        count
                    ));
                    output.push_str(&format!(
                        "{}_sum{} {}\n",
                        full_name,
                        format_labels(&entry.labels, None),
                        sum
                    ));
                    output.push_str(&format!(
                        "{}_count{} {}\n",
                        full_name,
                        format_labels(&entry.labels, None),
                        count
                    ));
                }
            }
        }

        output
    }

    /// Export the snapshot as pretty JSON
    pub async fn export_json(&self) -> Result<String> {
        let snapshot = self.snapshot().await;
        Ok(serde_json::to_string_pretty(&snapshot)?)
    }
}

impl Clone for MetricsRegistry {
    fn clone(&self) -> Self {
        Self {
            series: Arc::clone(&self.series),
            gauges: Arc::clone(&self.gauges),
            histograms: Arc::clone(&self.histograms),
            help: Arc::clone(&self.help),
            prefix: self.prefix.clone(),
            max_label_cardinality: self.max_label_cardinality,
            events: self.events.clone(),
        }
    }
}

/// Render a label set, optionally with an extra pair (used for `le`)
fn format_labels(labels: &HashMap<String, String>, extra: Option<(&str, String)>) -> String {
    let mut pairs: Vec<(String, String)> =
        labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    pairs.sort();
    if let Some((k, v)) = extra {
        pairs.push((k.to_string(), v));
    }
    if pairs.is_empty() {
        return String::new();
    }
    let rendered: Vec<String> = pairs
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('"', "\\\"")))
        .collect();
    format!("{{{}}}", rendered.join(","))
}
