//! Dashboard aggregation and the top-level monitoring service
//!
//! The aggregator subscribes to the event bus and maintains four bounded
//! time series (system, workflow, performance, business). Percentile
//! figures use exponential smoothing, an approximation rather than a true
//! quantile sketch.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::alerts::AlertEngine;
use crate::config::MonitoringConfig;
use crate::events::{EventBus, MonitorEvent};
use crate::health::{register_builtin_probes, HealthRunner};
use crate::metrics::{MetricKind, MetricsRegistry};
use crate::workflow::WorkflowTracker;
use crate::Result;

/// Smoothing factor for the approximate p95 estimate
const SMOOTHING_ALPHA: f64 = 0.1;

/// Default capacity per series: 24h at 30s resolution
const DEFAULT_MAX_DATA_POINTS: usize = 2880;

/// Default retention window
const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// The four independent dashboard series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesCategory {
    System,
    Workflow,
    Performance,
    Business,
}

impl SeriesCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeriesCategory::System => "system",
            SeriesCategory::Workflow => "workflow",
            SeriesCategory::Performance => "performance",
            SeriesCategory::Business => "business",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(SeriesCategory::System),
            "workflow" => Some(SeriesCategory::Workflow),
            "performance" => Some(SeriesCategory::Performance),
            "business" => Some(SeriesCategory::Business),
            _ => None,
        }
    }

    const ALL: [SeriesCategory; 4] = [
        SeriesCategory::System,
        SeriesCategory::Workflow,
        SeriesCategory::Performance,
        SeriesCategory::Business,
    ];
}

/// One timestamped sample in a dashboard series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimePoint {
    pub timestamp: DateTime<Utc>,

    /// Numeric fields; the field set may vary between points
    pub data: HashMap<String, f64>,
}

/// Coarse direction of a series over a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Up,
    Down,
    Stable,
}

/// Min/max/avg for one field over a window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

/// Statistics over a time-bounded slice of one series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesStatistics {
    pub category: SeriesCategory,

    pub sample_count: usize,

    pub fields: HashMap<String, FieldStats>,

    /// Majority vote across fields, comparing first vs last sample only
    pub trend: Trend,
}

/// Collects events into bounded per-category time series
pub struct DashboardAggregator {
    series: Arc<RwLock<HashMap<SeriesCategory, VecDeque<TimePoint>>>>,

    /// Smoothed p95 per duration metric name
    p95: Arc<RwLock<HashMap<String, f64>>>,

    max_data_points: usize,

    retention: Duration,

    events: EventBus,

    tasks: Arc<RwLock<Vec<JoinHandle<()>>>>,
}

impl DashboardAggregator {
    pub fn new(events: EventBus) -> Self {
        Self::with_limits(events, DEFAULT_MAX_DATA_POINTS, DEFAULT_RETENTION)
    }

    pub fn with_limits(events: EventBus, max_data_points: usize, retention: Duration) -> Self {
        let mut series = HashMap::new();
        for category in SeriesCategory::ALL {
            series.insert(category, VecDeque::new());
        }
        Self {
            series: Arc::new(RwLock::new(series)),
            p95: Arc::new(RwLock::new(HashMap::new())),
            max_data_points,
            retention,
            events,
            tasks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Append a point to a series, evicting the oldest beyond capacity
    pub async fn record_point(&self, category: SeriesCategory, data: HashMap<String, f64>) {
        let point = TimePoint {
            timestamp: Utc::now(),
            data,
        };
        let mut series = self.series.write().await;
        let buffer = series.entry(category).or_default();
        buffer.push_back(point);
        while buffer.len() > self.max_data_points {
            buffer.pop_front();
        }
    }

    /// Update the smoothed p95 estimate for a duration metric.
    ///
    /// `p95_new = alpha * max(value, p95_old) + (1 - alpha) * p95_old`;
    /// an approximation, not a true quantile.
    async fn observe_duration(&self, name: &str, value: f64) -> f64 {
        let mut p95 = self.p95.write().await;
        let entry = p95.entry(name.to_string()).or_insert(value);
        *entry = SMOOTHING_ALPHA * value.max(*entry) + (1.0 - SMOOTHING_ALPHA) * *entry;
        *entry
    }

    /// Start the event consumer and the retention cleanup tick
    pub async fn start(&self) {
        let mut tasks = self.tasks.write().await;
        if !tasks.is_empty() {
            return;
        }
        info!(
            max_data_points = self.max_data_points,
            retention_secs = self.retention.as_secs(),
            "Starting dashboard aggregator"
        );

        let aggregator = self.clone();
        let mut rx = self.events.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => aggregator.consume(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "Dashboard consumer lagged, dropping events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let aggregator = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                aggregator.prune_expired().await;
            }
        }));
    }

    /// Cancel the consumer and cleanup tasks
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.write().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        info!("Dashboard aggregator stopped");
    }

    async fn consume(&self, event: MonitorEvent) {
        match event {
            MonitorEvent::MetricRecorded { name, kind, value, .. } => match kind {
                MetricKind::Counter => {
                    self.record_point(
                        SeriesCategory::Business,
                        HashMap::from([(name, value)]),
                    )
                    .await;
                }
                MetricKind::Gauge => {
                    self.record_point(
                        SeriesCategory::System,
                        HashMap::from([(name, value)]),
                    )
                    .await;
                }
                MetricKind::Histogram | MetricKind::Summary => {
                    let p95 = self.observe_duration(&name, value).await;
                    self.record_point(
                        SeriesCategory::Performance,
                        HashMap::from([(name.clone(), value), (format!("{}_p95", name), p95)]),
                    )
                    .await;
                }
            },
            MonitorEvent::HealthChecked(report) => {
                let passing = report
                    .checks
                    .iter()
                    .filter(|c| c.status == crate::health::CheckStatus::Pass)
                    .count();
                self.record_point(
                    SeriesCategory::System,
                    HashMap::from([
                        ("checks_total".to_string(), report.checks.len() as f64),
                        ("checks_passing".to_string(), passing as f64),
                        ("uptime_seconds".to_string(), report.uptime_seconds as f64),
                    ]),
                )
                .await;
            }
            MonitorEvent::WorkflowFinished(execution) => {
                let duration_ms = execution
                    .end_time
                    .map(|end| (end - execution.start_time).num_milliseconds().max(0) as f64)
                    .unwrap_or(0.0);
                let completed = matches!(
                    execution.status,
                    crate::workflow::ExecutionStatus::Completed
                );
                self.record_point(
                    SeriesCategory::Workflow,
                    HashMap::from([
                        ("duration_ms".to_string(), duration_ms),
                        ("total_steps".to_string(), execution.metrics.total_steps as f64),
                        ("failed_steps".to_string(), execution.metrics.failed_steps as f64),
                        ("completed".to_string(), if completed { 1.0 } else { 0.0 }),
                    ]),
                )
                .await;
            }
            // Error events feed logs, not the dashboard series
            _ => {}
        }
    }

    /// Drop points older than the retention window
    pub async fn prune_expired(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::hours(24));
        let mut series = self.series.write().await;
        for buffer in series.values_mut() {
            while buffer.front().map(|p| p.timestamp < cutoff).unwrap_or(false) {
                buffer.pop_front();
            }
        }
    }

    /// Points of one series within the last `window`, oldest first
    pub async fn get_series(&self, category: SeriesCategory, window: Duration) -> Vec<TimePoint> {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::hours(24));
        let series = self.series.read().await;
        series
            .get(&category)
            .map(|buffer| {
                buffer
                    .iter()
                    .filter(|p| p.timestamp >= cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Min/max/avg per field plus a coarse trend over a window.
    ///
    /// Trend compares only the first and last sample, field by field, and
    /// takes the majority direction.
    pub async fn get_statistics(
        &self,
        category: SeriesCategory,
        window: Duration,
    ) -> SeriesStatistics {
        let points = self.get_series(category, window).await;

        let mut fields: HashMap<String, FieldStats> = HashMap::new();
        let mut sums: HashMap<String, (f64, usize)> = HashMap::new();
        for point in &points {
            for (key, value) in &point.data {
                let entry = fields.entry(key.clone()).or_insert(FieldStats {
                    min: *value,
                    max: *value,
                    avg: 0.0,
                });
                entry.min = entry.min.min(*value);
                entry.max = entry.max.max(*value);
                let (sum, count) = sums.entry(key.clone()).or_insert((0.0, 0));
                *sum += value;
                *count += 1;
            }
        }
        for (key, stats) in fields.iter_mut() {
            if let Some((sum, count)) = sums.get(key) {
                stats.avg = sum / *count as f64;
            }
        }

        let trend = Self::derive_trend(&points);
        SeriesStatistics {
            category,
            sample_count: points.len(),
            fields,
            trend,
        }
    }

    fn derive_trend(points: &[TimePoint]) -> Trend {
        let (first, last) = match (points.first(), points.last()) {
            (Some(first), Some(last)) if points.len() >= 2 => (first, last),
            _ => return Trend::Stable,
        };

        let mut up = 0usize;
        let mut down = 0usize;
        for (key, first_value) in &first.data {
            if let Some(last_value) = last.data.get(key) {
                if last_value > first_value {
                    up += 1;
                } else if last_value < first_value {
                    down += 1;
                }
            }
        }
        if up > down {
            Trend::Up
        } else if down > up {
            Trend::Down
        } else {
            Trend::Stable
        }
    }

    /// Export one series as a JSON array of points
    pub async fn export_json(&self, category: SeriesCategory, window: Duration) -> Result<String> {
        let points = self.get_series(category, window).await;
        Ok(serde_json::to_string_pretty(&points)?)
    }

    /// Export one series as CSV: a header row of the union of field names,
    /// then one row per point with empty cells for absent fields.
    pub async fn export_csv(&self, category: SeriesCategory, window: Duration) -> String {
        let points = self.get_series(category, window).await;

        let mut columns: Vec<String> = points
            .iter()
            .flat_map(|p| p.data.keys().cloned())
            .collect();
        columns.sort();
        columns.dedup();

        let mut out = String::from("timestamp");
        for column in &columns {
            out.push(',');
            out.push_str(column);
        }
        out.push('\n');

        for point in &points {
            out.push_str(&point.timestamp.to_rfc3339());
            for column in &columns {
                out.push(',');
                if let Some(value) = point.data.get(column) {
                    out.push_str(&value.to_string());
                }
            }
            out.push('\n');
        }
        out
    }
}

impl Clone for DashboardAggregator {
    fn clone(&self) -> Self {
        Self {
            series: Arc::clone(&self.series),
            p95: Arc::clone(&self.p95),
            max_data_points: self.max_data_points,
            retention: self.retention,
            events: self.events.clone(),
            tasks: Arc::clone(&self.tasks),
        }
    }
}

/// Owns and wires every monitoring component to one event bus
pub struct MonitoringService {
    pub config: MonitoringConfig,

    pub events: EventBus,

    pub registry: MetricsRegistry,

    pub health: HealthRunner,

    pub alerts: AlertEngine,

    pub workflows: WorkflowTracker,

    pub dashboard: DashboardAggregator,

    tasks: Arc<RwLock<Vec<JoinHandle<()>>>>,
}

impl MonitoringService {
    pub fn new(config: MonitoringConfig) -> Self {
        let events = EventBus::default();
        let registry = MetricsRegistry::new(&config.prometheus.prefix, events.clone())
            .with_label_cardinality(config.prometheus.max_label_cardinality);
        let health = HealthRunner::new(config.health.timeout, events.clone());
        let alerts = AlertEngine::new(Duration::from_secs(10), events.clone());
        let workflows = WorkflowTracker::new(registry.clone(), events.clone());
        let dashboard = DashboardAggregator::new(events.clone());

        Self {
            config,
            events,
            registry,
            health,
            alerts,
            workflows,
            dashboard,
            tasks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Start background work: the dashboard consumer, the alert feed and
    /// sweep tick, and periodic health checks.
    pub async fn start(&self) -> Result<()> {
        info!("Starting monitoring service");

        self.dashboard.start().await;

        if self.config.health.enabled {
            register_builtin_probes(&self.health).await;
            self.health.start_periodic(self.config.health.interval).await;
        }

        if self.config.alerts.enabled {
            let mut tasks = self.tasks.write().await;

            // Feed gauge and histogram samples into the alert engine
            let alerts = self.alerts.clone();
            let mut rx = self.events.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(MonitorEvent::MetricRecorded { name, kind, value, .. })
                            if matches!(kind, MetricKind::Gauge | MetricKind::Histogram) =>
                        {
                            alerts.evaluate_sample(&name, value).await;
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));

            // Sweep confirms sustained breaches between samples
            let alerts = self.alerts.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(10));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    alerts.sweep().await;
                }
            }));
        }

        Ok(())
    }

    /// Stop all background tasks; safe to call more than once
    pub async fn shutdown(&self) {
        info!("Stopping monitoring service");
        self.dashboard.shutdown().await;
        self.health.shutdown().await;
        let mut tasks = self.tasks.write().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Clone for MonitoringService {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            events: self.events.clone(),
            registry: self.registry.clone(),
            health: self.health.clone(),
            alerts: self.alerts.clone(),
            workflows: self.workflows.clone(),
            dashboard: self.dashboard.clone(),
            tasks: Arc::clone(&self.tasks),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_and_query_series() {
        let aggregator = DashboardAggregator::new(EventBus::default());
        for i in 0..3 {
            aggregator
                .record_point(
                    SeriesCategory::Business,
                    HashMap::from([("active_students".to_string(), 100.0 + i as f64)]),
                )
                .await;
        }

        let points = aggregator
            .get_series(SeriesCategory::Business, Duration::from_secs(3600))
            .await;
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].data["active_students"], 100.0);
    }

    #[tokio::test]
    async fn test_capacity_eviction() {
        let aggregator = DashboardAggregator::with_limits(
            EventBus::default(),
            5,
            Duration::from_secs(3600),
        );
        for i in 0..10 {
            aggregator
                .record_point(
                    SeriesCategory::System,
                    HashMap::from([("load".to_string(), i as f64)]),
                )
                .await;
        }

        let points = aggregator
            .get_series(SeriesCategory::System, Duration::from_secs(3600))
            .await;
        assert_eq!(points.len(), 5);
        // Oldest evicted first
        assert_eq!(points[0].data["load"], 5.0);
    }

    #[tokio::test]
    async fn test_statistics_and_trend() {
        let aggregator = DashboardAggregator::new(EventBus::default());
        for value in [10.0, 20.0, 30.0] {
            aggregator
                .record_point(
                    SeriesCategory::Performance,
                    HashMap::from([("latency_ms".to_string(), value)]),
                )
                .await;
        }

        let stats = aggregator
            .get_statistics(SeriesCategory::Performance, Duration::from_secs(3600))
            .await;
        assert_eq!(stats.sample_count, 3);
        let latency = &stats.fields["latency_ms"];
        assert_eq!(latency.min, 10.0);
        assert_eq!(latency.max, 30.0);
        assert!((latency.avg - 20.0).abs() < f64::EPSILON);
        assert_eq!(stats.trend, Trend::Up);
    }

    #[tokio::test]
    async fn test_empty_series_is_stable() {
        let aggregator = DashboardAggregator::new(EventBus::default());
        let stats = aggregator
            .get_statistics(SeriesCategory::Workflow, Duration::from_secs(3600))
            .await;
        assert_eq!(stats.sample_count, 0);
        assert_eq!(stats.trend, Trend::Stable);
    }

    #[tokio::test]
    async fn test_csv_export_shape() {
        let aggregator = DashboardAggregator::new(EventBus::default());
        for value in [1.0, 2.0, 3.0] {
            aggregator
                .record_point(
                    SeriesCategory::Business,
                    HashMap::from([
                        ("signups".to_string(), value),
                        ("logins".to_string(), value * 10.0),
                    ]),
                )
                .await;
        }

        let csv = aggregator
            .export_csv(SeriesCategory::Business, Duration::from_secs(3600))
            .await;
        let lines: Vec<&str> = csv.trim_end().lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "timestamp,logins,signups");
        for line in &lines[1..] {
            assert_eq!(line.matches(',').count(), 2);
        }
    }

    #[tokio::test]
    async fn test_p95_smoothing_formula() {
        let aggregator = DashboardAggregator::new(EventBus::default());
        let first = aggregator.observe_duration("request_duration", 100.0).await;
        assert!((first - 100.0).abs() < f64::EPSILON);

        // 0.1 * max(200, 100) + 0.9 * 100 = 110
        let second = aggregator.observe_duration("request_duration", 200.0).await;
        assert!((second - 110.0).abs() < 1e-9);

        // Lower observation still decays toward max: 0.1 * max(50, 110) + 0.9 * 110 = 110
        let third = aggregator.observe_duration("request_duration", 50.0).await;
        assert!((third - 110.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_event_consumer_routes_categories() {
        let events = EventBus::default();
        let aggregator = DashboardAggregator::new(events.clone());
        aggregator.start().await;

        events.publish(MonitorEvent::MetricRecorded {
            name: "quiz_submissions_total".to_string(),
            kind: MetricKind::Counter,
            value: 1.0,
            labels: HashMap::new(),
        });
        events.publish(MonitorEvent::MetricRecorded {
            name: "active_sessions".to_string(),
            kind: MetricKind::Gauge,
            value: 42.0,
            labels: HashMap::new(),
        });

        // Let the consumer task drain the bus
        tokio::time::sleep(Duration::from_millis(50)).await;

        let business = aggregator
            .get_series(SeriesCategory::Business, Duration::from_secs(60))
            .await;
        let system = aggregator
            .get_series(SeriesCategory::System, Duration::from_secs(60))
            .await;
        assert_eq!(business.len(), 1);
        assert_eq!(system.len(), 1);
        assert_eq!(system[0].data["active_sessions"], 42.0);

        aggregator.shutdown().await;
    }
}
