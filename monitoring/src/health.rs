//! Health check runner with pluggable async probes
//!
//! Probes run concurrently with a hard per-probe timeout; a probe that
//! times out or errors is reported as a failed check, never as a crash.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{EventBus, MonitorEvent};
use crate::Result;

/// Maximum retained health reports for trend queries
const MAX_REPORT_HISTORY: usize = 100;

/// Outcome of a single check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

/// Aggregated status across all checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// All checks passing
    Healthy,

    /// Some checks failing or warning, still functional
    Degraded,

    /// Every check failing
    Unhealthy,
}

impl HealthStatus {
    /// Check if the status is operational (Healthy or Degraded)
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

/// Result of one probe execution. Recomputed each run, not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Check name
    pub name: String,

    /// Outcome
    pub status: CheckStatus,

    /// Human-readable message
    pub message: String,

    /// Probe duration in milliseconds
    pub duration_ms: f64,

    /// Structured probe output, if any
    pub output: Option<serde_json::Value>,

    /// Tags for grouping (e.g. "critical")
    pub tags: Vec<String>,
}

impl HealthCheckResult {
    /// Create a passing result
    pub fn pass<S: Into<String>>(name: S, message: S) -> Self {
        Self::new(name, CheckStatus::Pass, message)
    }

    /// Create a warning result
    pub fn warn<S: Into<String>>(name: S, message: S) -> Self {
        Self::new(name, CheckStatus::Warn, message)
    }

    /// Create a failing result
    pub fn fail<S: Into<String>>(name: S, message: S) -> Self {
        Self::new(name, CheckStatus::Fail, message)
    }

    fn new<S: Into<String>>(name: S, status: CheckStatus, message: S) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
            duration_ms: 0.0,
            output: None,
            tags: Vec::new(),
        }
    }

    /// Attach structured output
    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    /// Attach a tag
    pub fn with_tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Aggregated health report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall status
    pub status: HealthStatus,

    /// Report timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Individual check results
    pub checks: Vec<HealthCheckResult>,

    /// Process uptime in seconds
    pub uptime_seconds: u64,
}

impl HealthReport {
    /// Derive the overall status from the individual checks.
    ///
    /// Unhealthy only when every check fails; any failure or warning among
    /// passing checks degrades; otherwise healthy.
    pub fn derive_status(checks: &[HealthCheckResult]) -> HealthStatus {
        if checks.is_empty() {
            return HealthStatus::Healthy;
        }
        let failed = checks
            .iter()
            .filter(|c| c.status == CheckStatus::Fail)
            .count();
        let warned = checks
            .iter()
            .filter(|c| c.status == CheckStatus::Warn)
            .count();

        if failed == checks.len() {
            HealthStatus::Unhealthy
        } else if failed > 0 || warned > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// An async probe reporting the health of one subsystem
#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync {
    /// Execute the probe. Errors are converted to failed checks by the runner.
    async fn probe(&self) -> Result<HealthCheckResult>;
}

/// Adapter so plain async closures can be registered as probes
struct FnProbe<F> {
    f: F,
}

#[async_trait::async_trait]
impl<F, Fut> HealthProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<HealthCheckResult>> + Send,
{
    async fn probe(&self) -> Result<HealthCheckResult> {
        (self.f)().await
    }
}

struct RegisteredProbe {
    probe: Arc<dyn HealthProbe>,
    critical: bool,
}

/// Runs registered probes on a timer and on demand
pub struct HealthRunner {
    probes: Arc<RwLock<HashMap<String, RegisteredProbe>>>,

    /// Hard per-probe timeout
    timeout: Duration,

    /// Last report
    report: Arc<RwLock<Option<HealthReport>>>,

    /// Rolling report history for trend queries
    history: Arc<RwLock<VecDeque<HealthReport>>>,

    start_time: Instant,

    events: EventBus,

    /// Periodic task handle
    task: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl HealthRunner {
    /// Create a new runner with the given per-probe timeout
    pub fn new(timeout: Duration, events: EventBus) -> Self {
        Self {
            probes: Arc::new(RwLock::new(HashMap::new())),
            timeout,
            report: Arc::new(RwLock::new(None)),
            history: Arc::new(RwLock::new(VecDeque::new())),
            start_time: Instant::now(),
            events,
            task: Arc::new(RwLock::new(None)),
        }
    }

    /// Register a probe under a unique name
    pub async fn register(&self, name: &str, critical: bool, probe: Arc<dyn HealthProbe>) {
        let mut probes = self.probes.write().await;
        debug!(check = name, critical, "Registering health probe");
        probes.insert(name.to_string(), RegisteredProbe { probe, critical });
    }

    /// Register an async closure as a probe
    pub async fn register_fn<F, Fut>(&self, name: &str, critical: bool, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<HealthCheckResult>> + Send + 'static,
    {
        self.register(name, critical, Arc::new(FnProbe { f })).await;
    }

    /// Remove a probe; returns false if it was not registered
    pub async fn unregister(&self, name: &str) -> bool {
        self.probes.write().await.remove(name).is_some()
    }

    /// Run one probe by name with the configured timeout.
    ///
    /// Returns `None` for an unknown name. A probe that errors or times out
    /// yields a `Fail` result carrying the error text; the error never
    /// propagates to the caller.
    pub async fn run_check(&self, name: &str) -> Option<HealthCheckResult> {
        let entry = {
            let probes = self.probes.read().await;
            probes.get(name).map(|r| Arc::clone(&r.probe))
        }?;
        Some(Self::execute(name, entry, self.timeout).await)
    }

    async fn execute(name: &str, probe: Arc<dyn HealthProbe>, timeout: Duration) -> HealthCheckResult {
        let start = Instant::now();
        let mut result = match tokio::time::timeout(timeout, probe.probe()).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => HealthCheckResult::fail(name.to_string(), format!("Check failed: {}", e)),
            Err(_) => HealthCheckResult::fail(
                name.to_string(),
                format!("Check timed out after {}ms", timeout.as_millis()),
            ),
        };
        result.duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        result
    }

    /// Run every registered probe concurrently and aggregate.
    ///
    /// Waits for the slowest probe but bounds each one individually; the
    /// aggregate call itself never fails.
    pub async fn run_all_checks(&self) -> HealthReport {
        self.run_selected(|_| true).await
    }

    /// Run only the probes marked critical (readiness subset)
    pub async fn run_critical_checks(&self) -> HealthReport {
        self.run_selected(|registered| registered.critical).await
    }

    async fn run_selected<F>(&self, filter: F) -> HealthReport
    where
        F: Fn(&RegisteredProbe) -> bool,
    {
        let selected: Vec<(String, Arc<dyn HealthProbe>)> = {
            let probes = self.probes.read().await;
            probes
                .iter()
                .filter(|(_, r)| filter(r))
                .map(|(name, r)| (name.clone(), Arc::clone(&r.probe)))
                .collect()
        };

        let timeout = self.timeout;
        let futures = selected
            .into_iter()
            .map(|(name, probe)| async move { Self::execute(&name, probe, timeout).await });
        let mut checks = futures::future::join_all(futures).await;
        checks.sort_by(|a, b| a.name.cmp(&b.name));

        let report = HealthReport {
            status: HealthReport::derive_status(&checks),
            timestamp: chrono::Utc::now(),
            checks,
            uptime_seconds: self.start_time.elapsed().as_secs(),
        };

        {
            let mut last = self.report.write().await;
            *last = Some(report.clone());
        }
        {
            let mut history = self.history.write().await;
            history.push_back(report.clone());
            while history.len() > MAX_REPORT_HISTORY {
                history.pop_front();
            }
        }

        self.events.publish(MonitorEvent::HealthChecked(report.clone()));
        report
    }

    /// Get the most recent report, if any run has completed
    pub async fn last_report(&self) -> Option<HealthReport> {
        self.report.read().await.clone()
    }

    /// Get up to `limit` recent reports, newest first
    pub async fn report_history(&self, limit: usize) -> Vec<HealthReport> {
        let history = self.history.read().await;
        history.iter().rev().take(limit).cloned().collect()
    }

    /// Start re-running all checks on a fixed interval.
    ///
    /// Tick failures are reported as events and never stop the loop.
    pub async fn start_periodic(&self, interval: Duration) {
        let mut task = self.task.write().await;
        if task.is_some() {
            warn!("Periodic health checks already running");
            return;
        }

        info!(interval_secs = interval.as_secs(), "Starting periodic health checks");
        let runner = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let report = runner.run_all_checks().await;
                if report.status == HealthStatus::Unhealthy {
                    runner.events.publish(MonitorEvent::HealthCheckError {
                        check: "all".to_string(),
                        message: "All health checks failing".to_string(),
                    });
                }
            }
        });
        *task = Some(handle);
    }

    /// Cancel the periodic task; no timers are left behind
    pub async fn shutdown(&self) {
        let mut task = self.task.write().await;
        if let Some(handle) = task.take() {
            handle.abort();
            info!("Periodic health checks stopped");
        }
    }
}

impl Clone for HealthRunner {
    fn clone(&self) -> Self {
        Self {
            probes: Arc::clone(&self.probes),
            timeout: self.timeout,
            report: Arc::clone(&self.report),
            history: Arc::clone(&self.history),
            start_time: self.start_time,
            events: self.events.clone(),
            task: Arc::clone(&self.task),
        }
    }
}

/// Register the built-in illustrative probes: process memory, uptime and
/// timer responsiveness. Real deployments register their own probes too.
pub async fn register_builtin_probes(runner: &HealthRunner) {
    let start = Instant::now();
    runner
        .register_fn("uptime", false, move || {
            let uptime = start.elapsed().as_secs();
            async move {
                Ok(HealthCheckResult::pass(
                    "uptime".to_string(),
                    format!("Up for {}s", uptime),
                )
                .with_output(serde_json::json!({ "uptime_seconds": uptime })))
            }
        })
        .await;

    runner
        .register_fn("memory", false, || async {
            match resident_memory_kb() {
                Some(kb) => {
                    let mb = kb / 1024;
                    let result = if mb > 1024 {
                        HealthCheckResult::warn(
                            "memory".to_string(),
                            format!("Resident memory high: {}MB", mb),
                        )
                    } else {
                        HealthCheckResult::pass(
                            "memory".to_string(),
                            format!("Resident memory {}MB", mb),
                        )
                    };
                    Ok(result.with_output(serde_json::json!({ "resident_kb": kb })))
                }
                None => Ok(HealthCheckResult::pass(
                    "memory",
                    "Memory usage unavailable on this platform",
                )),
            }
        })
        .await;

    runner
        .register_fn("event_loop", true, || async {
            let start = Instant::now();
            tokio::time::sleep(Duration::from_millis(10)).await;
            let lag_ms = start.elapsed().as_secs_f64() * 1000.0 - 10.0;
            let result = if lag_ms > 100.0 {
                HealthCheckResult::warn(
                    "event_loop".to_string(),
                    format!("Timer lag {:.1}ms", lag_ms),
                )
            } else {
                HealthCheckResult::pass(
                    "event_loop".to_string(),
                    format!("Timer lag {:.1}ms", lag_ms.max(0.0)),
                )
            };
            Ok(result
                .with_tag("critical")
                .with_output(serde_json::json!({ "lag_ms": lag_ms.max(0.0) })))
        })
        .await;
}

/// Resident set size from /proc on Linux, None elsewhere
fn resident_memory_kb() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                return rest.trim().trim_end_matches(" kB").trim().parse().ok();
            }
        }
        None
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_all_pass_is_healthy() {
        let runner = HealthRunner::new(Duration::from_secs(5), EventBus::default());
        runner
            .register_fn("a", false, || async {
                Ok(HealthCheckResult::pass("a", "ok"))
            })
            .await;
        runner
            .register_fn("b", false, || async {
                Ok(HealthCheckResult::pass("b", "ok"))
            })
            .await;

        let report = runner.run_all_checks().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.checks.len(), 2);
    }

    #[tokio::test]
    async fn test_partial_failure_is_degraded() {
        let runner = HealthRunner::new(Duration::from_secs(5), EventBus::default());
        for name in ["a", "b", "c"] {
            runner
                .register_fn(name, false, move || async move {
                    Ok(HealthCheckResult::pass(name, "ok"))
                })
                .await;
        }
        for name in ["d", "e"] {
            runner
                .register_fn(name, false, move || async move {
                    Ok(HealthCheckResult::fail(name, "down"))
                })
                .await;
        }

        let report = runner.run_all_checks().await;
        assert_eq!(report.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_total_failure_is_unhealthy() {
        let runner = HealthRunner::new(Duration::from_secs(5), EventBus::default());
        for name in ["a", "b", "c", "d", "e"] {
            runner
                .register_fn(name, false, move || async move {
                    Ok(HealthCheckResult::fail(name, "down"))
                })
                .await;
        }

        let report = runner.run_all_checks().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_warning_degrades() {
        let runner = HealthRunner::new(Duration::from_secs(5), EventBus::default());
        runner
            .register_fn("a", false, || async {
                Ok(HealthCheckResult::pass("a", "ok"))
            })
            .await;
        runner
            .register_fn("b", false, || async {
                Ok(HealthCheckResult::warn("b", "slow"))
            })
            .await;

        let report = runner.run_all_checks().await;
        assert_eq!(report.status, HealthStatus::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_probe_fails_at_timeout() {
        let runner = HealthRunner::new(Duration::from_millis(200), EventBus::default());
        runner
            .register_fn("hung", false, || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(HealthCheckResult::pass("hung", "never"))
            })
            .await;

        let result = runner.run_check("hung").await.unwrap();
        assert_eq!(result.status, CheckStatus::Fail);
        assert!(result.message.contains("timed out after 200ms"));
    }

    #[tokio::test]
    async fn test_probe_error_becomes_fail() {
        let runner = HealthRunner::new(Duration::from_secs(5), EventBus::default());
        runner
            .register_fn("broken", false, || async {
                Err(crate::MonitoringError::probe("broken", "database unreachable"))
            })
            .await;

        let result = runner.run_check("broken").await.unwrap();
        assert_eq!(result.status, CheckStatus::Fail);
        assert!(result.message.contains("database unreachable"));
    }

    #[tokio::test]
    async fn test_unknown_check_is_none() {
        let runner = HealthRunner::new(Duration::from_secs(5), EventBus::default());
        assert!(runner.run_check("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_critical_subset() {
        let runner = HealthRunner::new(Duration::from_secs(5), EventBus::default());
        runner
            .register_fn("db", true, || async {
                Ok(HealthCheckResult::pass("db", "ok"))
            })
            .await;
        runner
            .register_fn("optional", false, || async {
                Ok(HealthCheckResult::fail("optional", "down"))
            })
            .await;

        let report = runner.run_critical_checks().await;
        assert_eq!(report.checks.len(), 1);
        assert_eq!(report.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_empty_runner_is_healthy() {
        let runner = HealthRunner::new(Duration::from_secs(5), EventBus::default());
        let report = runner.run_all_checks().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.checks.is_empty());
    }
}
