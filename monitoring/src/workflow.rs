//! Workflow execution tracking
//!
//! Tracks multi-step background jobs (content generation, grading batches,
//! report builds) through their lifecycle and records terminal outcomes
//! into the metrics registry.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{EventBus, MonitorEvent};
use crate::metrics::{MetricSample, MetricsRegistry};

/// Maximum retained completed executions
const MAX_COMPLETED_HISTORY: usize = 1000;

/// Step lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Terminal steps no longer change status
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped)
    }
}

/// Execution lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        }
    }
}

/// One step of a workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: Uuid,

    pub name: String,

    pub status: StepStatus,

    /// Retries consumed so far
    pub retries: u32,

    /// Retry budget; a failure beyond this is permanent
    pub max_retries: u32,

    pub input: Option<serde_json::Value>,

    pub output: Option<serde_json::Value>,

    pub error: Option<String>,

    pub started_at: Option<DateTime<Utc>>,

    pub finished_at: Option<DateTime<Utc>>,
}

/// Aggregate counters over an execution's steps.
///
/// Invariant: completed + failed + skipped never exceeds total, and equals
/// total once the execution is terminal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub total_steps: usize,

    pub completed_steps: usize,

    pub failed_steps: usize,

    pub skipped_steps: usize,

    /// Arithmetic mean over completed steps, recomputed on every completion
    pub average_step_duration_ms: f64,

    /// Free-form resource annotations (tokens consumed, bytes written)
    pub resource_usage: HashMap<String, f64>,
}

/// A tracked workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,

    pub name: String,

    /// Workflow kind, e.g. "course_generation" or "grading_batch"
    pub kind: String,

    pub start_time: DateTime<Utc>,

    pub end_time: Option<DateTime<Utc>>,

    pub status: ExecutionStatus,

    pub steps: Vec<WorkflowStep>,

    pub metrics: ExecutionMetrics,
}

impl WorkflowExecution {
    fn refresh_metrics(&mut self) {
        self.metrics.total_steps = self.steps.len();
        self.metrics.completed_steps = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        self.metrics.failed_steps = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .count();
        self.metrics.skipped_steps = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Skipped)
            .count();

        let durations: Vec<f64> = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .filter_map(|s| match (s.started_at, s.finished_at) {
                (Some(start), Some(end)) => {
                    Some((end - start).num_milliseconds().max(0) as f64)
                }
                _ => None,
            })
            .collect();
        self.metrics.average_step_duration_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<f64>() / durations.len() as f64
        };
    }

    /// True when every step is terminal
    fn all_steps_terminal(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    fn has_failed_step(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }
}

/// Tracks active executions and archives terminal ones
pub struct WorkflowTracker {
    active: Arc<RwLock<HashMap<Uuid, WorkflowExecution>>>,

    completed: Arc<RwLock<VecDeque<WorkflowExecution>>>,

    registry: MetricsRegistry,

    events: EventBus,
}

impl WorkflowTracker {
    pub fn new(registry: MetricsRegistry, events: EventBus) -> Self {
        Self {
            active: Arc::new(RwLock::new(HashMap::new())),
            completed: Arc::new(RwLock::new(VecDeque::new())),
            registry,
            events,
        }
    }

    /// Start tracking a new execution; it begins in `Running`
    pub async fn start_workflow(&self, name: &str, kind: &str) -> Uuid {
        let execution = WorkflowExecution {
            id: Uuid::new_v4(),
            name: name.to_string(),
            kind: kind.to_string(),
            start_time: Utc::now(),
            end_time: None,
            status: ExecutionStatus::Running,
            steps: Vec::new(),
            metrics: ExecutionMetrics::default(),
        };
        let id = execution.id;
        info!(execution = %id, workflow = name, kind, "Workflow started");
        self.active.write().await.insert(id, execution);
        id
    }

    /// Append a pending step; returns its id, or None for an unknown
    /// execution
    pub async fn add_step(&self, execution_id: Uuid, name: &str, max_retries: u32) -> Option<Uuid> {
        let mut active = self.active.write().await;
        let execution = active.get_mut(&execution_id)?;
        let step = WorkflowStep {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: StepStatus::Pending,
            retries: 0,
            max_retries,
            input: None,
            output: None,
            error: None,
            started_at: None,
            finished_at: None,
        };
        let id = step.id;
        execution.steps.push(step);
        execution.refresh_metrics();
        Some(id)
    }

    /// Mark a pending step running
    pub async fn start_step(&self, execution_id: Uuid, step_id: Uuid) -> bool {
        let mut active = self.active.write().await;
        let Some(execution) = active.get_mut(&execution_id) else {
            return false;
        };
        let Some(step) = execution.steps.iter_mut().find(|s| s.id == step_id) else {
            return false;
        };
        if step.status != StepStatus::Pending {
            return false;
        }
        step.status = StepStatus::Running;
        step.started_at = Some(Utc::now());
        debug!(execution = %execution_id, step = %step.name, "Step started");
        true
    }

    /// Complete a running step and finalize the execution if all steps are
    /// terminal
    pub async fn complete_step(
        &self,
        execution_id: Uuid,
        step_id: Uuid,
        output: Option<serde_json::Value>,
    ) -> bool {
        let finished = {
            let mut active = self.active.write().await;
            let Some(execution) = active.get_mut(&execution_id) else {
                return false;
            };
            let Some(step) = execution.steps.iter_mut().find(|s| s.id == step_id) else {
                return false;
            };
            step.status = StepStatus::Completed;
            step.output = output;
            step.finished_at = Some(Utc::now());
            execution.refresh_metrics();
            execution.all_steps_terminal()
        };
        if finished {
            self.finalize(execution_id).await;
        }
        true
    }

    /// Fail a step. Within the retry budget the step resets to pending with
    /// the same id; beyond it the failure is permanent and may finalize the
    /// execution.
    pub async fn fail_step(&self, execution_id: Uuid, step_id: Uuid, error: &str) -> bool {
        let finished = {
            let mut active = self.active.write().await;
            let Some(execution) = active.get_mut(&execution_id) else {
                return false;
            };
            let Some(step) = execution.steps.iter_mut().find(|s| s.id == step_id) else {
                return false;
            };

            if step.retries < step.max_retries {
                step.retries += 1;
                step.status = StepStatus::Pending;
                step.started_at = None;
                step.error = Some(error.to_string());
                debug!(
                    execution = %execution_id,
                    step = %step.name,
                    retry = step.retries,
                    max_retries = step.max_retries,
                    "Step failed, retrying"
                );
                execution.refresh_metrics();
                false
            } else {
                step.status = StepStatus::Failed;
                step.error = Some(error.to_string());
                step.finished_at = Some(Utc::now());
                warn!(execution = %execution_id, step = %step.name, error, "Step failed permanently");
                execution.refresh_metrics();
                execution.all_steps_terminal()
            }
        };
        if finished {
            self.finalize(execution_id).await;
        }
        true
    }

    /// Skip a non-terminal step
    pub async fn skip_step(&self, execution_id: Uuid, step_id: Uuid) -> bool {
        let finished = {
            let mut active = self.active.write().await;
            let Some(execution) = active.get_mut(&execution_id) else {
                return false;
            };
            let Some(step) = execution.steps.iter_mut().find(|s| s.id == step_id) else {
                return false;
            };
            if step.status.is_terminal() {
                return false;
            }
            step.status = StepStatus::Skipped;
            step.finished_at = Some(Utc::now());
            execution.refresh_metrics();
            execution.all_steps_terminal()
        };
        if finished {
            self.finalize(execution_id).await;
        }
        true
    }

    /// Force-terminate an execution. Running steps are failed with a
    /// synthetic timeout error and steps that never started are skipped,
    /// so the archived execution has only terminal steps.
    pub async fn timeout_workflow(&self, execution_id: Uuid) -> bool {
        let found = {
            let mut active = self.active.write().await;
            match active.get_mut(&execution_id) {
                Some(execution) => {
                    for step in &mut execution.steps {
                        match step.status {
                            StepStatus::Running => {
                                step.status = StepStatus::Failed;
                                step.error = Some("step aborted: workflow timed out".to_string());
                                step.finished_at = Some(Utc::now());
                            }
                            StepStatus::Pending => {
                                step.status = StepStatus::Skipped;
                                step.finished_at = Some(Utc::now());
                            }
                            _ => {}
                        }
                    }
                    execution.refresh_metrics();
                    true
                }
                None => false,
            }
        };
        if found {
            self.finalize_as(execution_id, Some(ExecutionStatus::Timeout)).await;
        }
        found
    }

    /// Record a resource usage figure against an active execution
    pub async fn record_resource_usage(&self, execution_id: Uuid, key: &str, value: f64) -> bool {
        let mut active = self.active.write().await;
        match active.get_mut(&execution_id) {
            Some(execution) => {
                *execution
                    .metrics
                    .resource_usage
                    .entry(key.to_string())
                    .or_insert(0.0) += value;
                true
            }
            None => false,
        }
    }

    async fn finalize(&self, execution_id: Uuid) {
        self.finalize_as(execution_id, None).await;
    }

    /// Move an execution to its terminal status, emit its terminal metric
    /// and events, and archive it.
    async fn finalize_as(&self, execution_id: Uuid, forced: Option<ExecutionStatus>) {
        let execution = {
            let mut active = self.active.write().await;
            match active.remove(&execution_id) {
                Some(mut execution) => {
                    execution.status = forced.unwrap_or(if execution.has_failed_step() {
                        ExecutionStatus::Failed
                    } else {
                        ExecutionStatus::Completed
                    });
                    execution.end_time = Some(Utc::now());
                    execution.refresh_metrics();
                    execution
                }
                None => return,
            }
        };

        info!(
            execution = %execution.id,
            workflow = %execution.name,
            status = execution.status.as_str(),
            steps = execution.metrics.total_steps,
            "Workflow finished"
        );

        let sample = MetricSample::counter("workflow_executions_total", 1.0)
            .with_label("type", &execution.kind)
            .with_label("status", execution.status.as_str());
        self.registry.record_sample(&sample).await;

        if execution.status != ExecutionStatus::Completed {
            self.events.publish(MonitorEvent::WorkflowError {
                execution_id: execution.id,
                name: execution.name.clone(),
                message: format!("workflow ended with status {}", execution.status.as_str()),
            });
        }
        self.events
            .publish(MonitorEvent::WorkflowFinished(execution.clone()));

        let mut completed = self.completed.write().await;
        completed.push_back(execution);
        while completed.len() > MAX_COMPLETED_HISTORY {
            completed.pop_front();
        }
    }

    /// Snapshot of one execution, active or archived
    pub async fn get_execution(&self, execution_id: Uuid) -> Option<WorkflowExecution> {
        if let Some(execution) = self.active.read().await.get(&execution_id) {
            return Some(execution.clone());
        }
        self.completed
            .read()
            .await
            .iter()
            .find(|e| e.id == execution_id)
            .cloned()
    }

    /// All currently active executions
    pub async fn active_executions(&self) -> Vec<WorkflowExecution> {
        self.active.read().await.values().cloned().collect()
    }

    /// Up to `limit` most recently archived executions, newest first
    pub async fn completed_executions(&self, limit: usize) -> Vec<WorkflowExecution> {
        let completed = self.completed.read().await;
        completed.iter().rev().take(limit).cloned().collect()
    }
}

impl Clone for WorkflowTracker {
    fn clone(&self) -> Self {
        Self {
            active: Arc::clone(&self.active),
            completed: Arc::clone(&self.completed),
            registry: self.registry.clone(),
            events: self.events.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> WorkflowTracker {
        let events = EventBus::default();
        let registry = MetricsRegistry::new("app_", events.clone());
        WorkflowTracker::new(registry, events)
    }

    #[tokio::test]
    async fn test_successful_three_step_workflow() {
        let tracker = tracker();
        let id = tracker.start_workflow("course_generation", "content").await;

        let mut step_ids = Vec::new();
        for name in ["outline", "lessons", "quizzes"] {
            step_ids.push(tracker.add_step(id, name, 0).await.unwrap());
        }
        for step_id in &step_ids {
            assert!(tracker.start_step(id, *step_id).await);
            assert!(tracker.complete_step(id, *step_id, None).await);
        }

        let execution = tracker.get_execution(id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.metrics.completed_steps, 3);
        assert_eq!(execution.metrics.failed_steps, 0);
        assert!(execution.end_time.is_some());
        assert!(tracker.active_executions().await.is_empty());
    }

    #[tokio::test]
    async fn test_retry_then_success_completes() {
        let tracker = tracker();
        let id = tracker.start_workflow("grading_batch", "grading").await;
        let s1 = tracker.add_step(id, "collect", 0).await.unwrap();
        let s2 = tracker.add_step(id, "grade", 1).await.unwrap();
        let s3 = tracker.add_step(id, "publish", 0).await.unwrap();

        tracker.start_step(id, s1).await;
        tracker.complete_step(id, s1, None).await;

        tracker.start_step(id, s2).await;
        tracker.fail_step(id, s2, "model timeout").await;
        // Retry-in-place: same step id, back to pending
        let execution = tracker.get_execution(id).await.unwrap();
        let step = execution.steps.iter().find(|s| s.id == s2).unwrap();
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(step.retries, 1);

        tracker.start_step(id, s2).await;
        tracker.complete_step(id, s2, None).await;
        tracker.start_step(id, s3).await;
        tracker.complete_step(id, s3, None).await;

        let execution = tracker.get_execution(id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.metrics.failed_steps, 0);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails_execution() {
        let tracker = tracker();
        let id = tracker.start_workflow("grading_batch", "grading").await;
        let s1 = tracker.add_step(id, "collect", 0).await.unwrap();
        let s2 = tracker.add_step(id, "grade", 1).await.unwrap();
        let s3 = tracker.add_step(id, "publish", 0).await.unwrap();

        tracker.start_step(id, s1).await;
        tracker.complete_step(id, s1, None).await;

        tracker.start_step(id, s2).await;
        tracker.fail_step(id, s2, "model timeout").await;
        tracker.start_step(id, s2).await;
        tracker.fail_step(id, s2, "model timeout").await;

        tracker.skip_step(id, s3).await;

        let execution = tracker.get_execution(id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.metrics.failed_steps, 1);
        assert_eq!(execution.metrics.skipped_steps, 1);
    }

    #[tokio::test]
    async fn test_step_count_invariant() {
        let tracker = tracker();
        let id = tracker.start_workflow("report_build", "reporting").await;
        let s1 = tracker.add_step(id, "fetch", 0).await.unwrap();
        let s2 = tracker.add_step(id, "render", 0).await.unwrap();

        let check = |m: &ExecutionMetrics| {
            assert!(m.completed_steps + m.failed_steps + m.skipped_steps <= m.total_steps);
        };

        check(&tracker.get_execution(id).await.unwrap().metrics);
        tracker.start_step(id, s1).await;
        tracker.complete_step(id, s1, None).await;
        check(&tracker.get_execution(id).await.unwrap().metrics);
        tracker.start_step(id, s2).await;
        tracker.complete_step(id, s2, None).await;

        let metrics = tracker.get_execution(id).await.unwrap().metrics;
        assert_eq!(
            metrics.completed_steps + metrics.failed_steps + metrics.skipped_steps,
            metrics.total_steps
        );
    }

    #[tokio::test]
    async fn test_timeout_fails_running_steps() {
        let tracker = tracker();
        let id = tracker.start_workflow("course_generation", "content").await;
        let s1 = tracker.add_step(id, "outline", 0).await.unwrap();
        let s2 = tracker.add_step(id, "lessons", 0).await.unwrap();
        tracker.start_step(id, s1).await;

        assert!(tracker.timeout_workflow(id).await);

        let execution = tracker.get_execution(id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Timeout);
        let running = execution.steps.iter().find(|s| s.id == s1).unwrap();
        assert_eq!(running.status, StepStatus::Failed);
        assert!(running.error.as_deref().unwrap().contains("timed out"));

        // The step that never started is skipped, leaving every step
        // terminal in the archived execution
        let pending = execution.steps.iter().find(|s| s.id == s2).unwrap();
        assert_eq!(pending.status, StepStatus::Skipped);
        let metrics = &execution.metrics;
        assert_eq!(
            metrics.completed_steps + metrics.failed_steps + metrics.skipped_steps,
            metrics.total_steps
        );
    }

    #[tokio::test]
    async fn test_terminal_metric_recorded() {
        let events = EventBus::default();
        let registry = MetricsRegistry::new("app_", events.clone());
        let tracker = WorkflowTracker::new(registry.clone(), events);

        let id = tracker.start_workflow("course_generation", "content").await;
        let s1 = tracker.add_step(id, "outline", 0).await.unwrap();
        tracker.start_step(id, s1).await;
        tracker.complete_step(id, s1, None).await;

        let text = registry.export_text().await;
        assert!(text.contains("app_workflow_executions_total"));
        assert!(text.contains("status=\"completed\""));
        assert!(text.contains("type=\"content\""));
    }

    #[tokio::test]
    async fn test_unknown_execution_returns_false() {
        let tracker = tracker();
        let bogus = Uuid::new_v4();
        assert!(tracker.add_step(bogus, "x", 0).await.is_none());
        assert!(!tracker.timeout_workflow(bogus).await);
    }
}
