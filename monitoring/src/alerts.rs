//! Threshold alerting engine
//!
//! One state machine per rule (normal → firing → resolved). Evaluation is
//! sample-driven; a periodic sweep confirms sustained breaches for rules
//! with a minimum duration. Suppression mutes firing and dispatch while
//! still tracking the current value.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::{AlertNotification, NotificationChannel};
use crate::events::{EventBus, MonitorEvent};

/// Maximum retained alerts in the history ring
const MAX_ALERT_HISTORY: usize = 1000;

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }
}

/// Threshold comparison operator.
///
/// Unknown operator strings parse to `Unknown`, which evaluates to false so
/// a misconfigured rule can never fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
    Unknown,
}

impl Comparator {
    /// Evaluate `value <op> threshold`
    pub fn evaluate(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Gt => value > threshold,
            Comparator::Lt => value < threshold,
            Comparator::Ge => value >= threshold,
            Comparator::Le => value <= threshold,
            Comparator::Eq => (value - threshold).abs() < f64::EPSILON,
            Comparator::Ne => (value - threshold).abs() >= f64::EPSILON,
            Comparator::Unknown => false,
        }
    }

    /// Parse from the textual operator form
    pub fn parse(s: &str) -> Self {
        match s {
            ">" => Comparator::Gt,
            "<" => Comparator::Lt,
            ">=" => Comparator::Ge,
            "<=" => Comparator::Le,
            "==" => Comparator::Eq,
            "!=" => Comparator::Ne,
            _ => Comparator::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Comparator::Gt => ">",
            Comparator::Lt => "<",
            Comparator::Ge => ">=",
            Comparator::Le => "<=",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
            Comparator::Unknown => "unknown",
        }
    }
}

impl Serialize for Comparator {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Comparator {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Comparator::parse(&raw))
    }
}

/// Rule status within its state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Normal,
    Firing,
    /// Transient bookkeeping only; behaves as Normal on the next evaluation
    Resolved,
}

/// Status of an alert instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Firing,
    Resolved,
    Suppressed,
}

/// A threshold rule. Immutable after creation; replaced wholesale via
/// `add_rule` with the same name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    /// Unique rule name
    pub name: String,

    /// Metric name this rule watches
    pub metric_query: String,

    /// Comparison operator
    pub comparator: Comparator,

    /// Threshold value
    pub threshold: f64,

    /// How long the condition must hold before firing; zero fires on the
    /// first breaching sample
    #[serde(default)]
    pub min_duration: Duration,

    /// Severity
    pub severity: AlertSeverity,

    /// Labels copied onto every alert from this rule
    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// Annotations copied onto every alert from this rule
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

impl AlertRule {
    pub fn new(name: &str, metric_query: &str, comparator: Comparator, threshold: f64) -> Self {
        Self {
            name: name.to_string(),
            metric_query: metric_query.to_string(),
            comparator,
            threshold,
            min_duration: Duration::ZERO,
            severity: AlertSeverity::Medium,
            labels: HashMap::new(),
            annotations: HashMap::new(),
        }
    }

    pub fn with_severity(mut self, severity: AlertSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_min_duration(mut self, min_duration: Duration) -> Self {
        self.min_duration = min_duration;
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }
}

/// Per-rule evaluation state
#[derive(Debug, Clone)]
pub struct RuleState {
    pub rule: AlertRule,

    /// Most recent observed value, updated even while suppressed
    pub current_value: Option<f64>,

    pub status: RuleStatus,

    pub last_fired: Option<DateTime<Utc>>,

    pub last_resolved: Option<DateTime<Utc>>,

    pub fire_count: u64,

    /// Mute window; no firing or dispatch while now < suppressed_until
    pub suppressed_until: Option<Instant>,

    /// When the current uninterrupted breach started
    breach_since: Option<Instant>,
}

impl RuleState {
    fn new(rule: AlertRule) -> Self {
        Self {
            rule,
            current_value: None,
            status: RuleStatus::Normal,
            last_fired: None,
            last_resolved: None,
            fire_count: 0,
            suppressed_until: None,
            breach_since: None,
        }
    }

    fn is_suppressed(&self, now: Instant) -> bool {
        self.suppressed_until.map(|until| now < until).unwrap_or(false)
    }
}

/// An alert instance created by a firing rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,

    pub rule_name: String,

    pub severity: AlertSeverity,

    pub status: AlertStatus,

    pub message: String,

    pub labels: HashMap<String, String>,

    pub annotations: HashMap<String, String>,

    pub starts_at: DateTime<Utc>,

    pub ends_at: Option<DateTime<Utc>>,
}

/// Evaluates rules against incoming samples and dispatches notifications
pub struct AlertEngine {
    states: Arc<RwLock<HashMap<String, RuleState>>>,

    /// Active alerts keyed by rule name; at most one per rule
    active: Arc<RwLock<HashMap<String, Alert>>>,

    /// Bounded alert history ring
    history: Arc<RwLock<VecDeque<Alert>>>,

    channels: Arc<RwLock<Vec<Arc<dyn NotificationChannel>>>>,

    /// Per-channel delivery timeout
    dispatch_timeout: Duration,

    events: EventBus,
}

impl AlertEngine {
    pub fn new(dispatch_timeout: Duration, events: EventBus) -> Self {
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
            active: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(VecDeque::new())),
            channels: Arc::new(RwLock::new(Vec::new())),
            dispatch_timeout,
            events,
        }
    }

    /// Add or replace a rule. Replacing resets the rule's state to normal
    /// and resolves any alert the old rule left firing, so a rule is firing
    /// iff it has an entry in the active set.
    pub async fn add_rule(&self, rule: AlertRule) {
        info!(rule = %rule.name, metric = %rule.metric_query, "Adding alert rule");
        let name = rule.name.clone();
        let replaced = {
            let mut states = self.states.write().await;
            states.insert(name.clone(), RuleState::new(rule)).is_some()
        };
        if replaced {
            self.retire_active(&name).await;
        }
    }

    /// Remove a rule and its state; returns false for an unknown name
    pub async fn remove_rule(&self, name: &str) -> bool {
        let removed = self.states.write().await.remove(name).is_some();
        if removed {
            self.active.write().await.remove(name);
            info!(rule = name, "Removed alert rule");
        }
        removed
    }

    /// Register a notification channel
    pub async fn add_channel(&self, channel: Arc<dyn NotificationChannel>) {
        info!(channel = channel.name(), kind = channel.kind().as_str(), "Adding notification channel");
        self.channels.write().await.push(channel);
    }

    /// Mute a rule for the given duration.
    ///
    /// While muted, evaluation keeps tracking the current value but never
    /// fires or dispatches. Returns false for an unknown rule.
    pub async fn suppress_alert(&self, name: &str, duration: Duration) -> bool {
        let mut states = self.states.write().await;
        match states.get_mut(name) {
            Some(state) => {
                state.suppressed_until = Some(Instant::now() + duration);
                info!(rule = name, duration_ms = duration.as_millis() as u64, "Alert suppressed");
                true
            }
            None => false,
        }
    }

    /// Evaluate every rule watching `metric_name` against a new sample value
    pub async fn evaluate_sample(&self, metric_name: &str, value: f64) {
        let matching: Vec<String> = {
            let states = self.states.read().await;
            states
                .values()
                .filter(|s| s.rule.metric_query == metric_name)
                .map(|s| s.rule.name.clone())
                .collect()
        };

        for name in matching {
            self.evaluate_rule(&name, Some(value)).await;
        }
    }

    /// Re-evaluate all rules against their last observed values.
    ///
    /// Confirms sustained breaches for rules with a minimum duration even
    /// when no new sample has arrived.
    pub async fn sweep(&self) {
        let names: Vec<String> = {
            let states = self.states.read().await;
            states.keys().cloned().collect()
        };
        for name in names {
            self.evaluate_rule(&name, None).await;
        }
    }

    async fn evaluate_rule(&self, name: &str, new_value: Option<f64>) {
        let now = Instant::now();
        let outcome = {
            let mut states = self.states.write().await;
            let state = match states.get_mut(name) {
                Some(state) => state,
                None => return,
            };

            if let Some(value) = new_value {
                state.current_value = Some(value);
            }
            let value = match state.current_value {
                Some(value) => value,
                None => return,
            };

            let breached = state.rule.comparator.evaluate(value, state.rule.threshold);

            // Mute gate sits before the firing decision so fire_count and
            // last_fired never move during a suppression window.
            if state.is_suppressed(now) {
                debug!(rule = name, value, "Rule suppressed, skipping evaluation");
                return;
            }

            if breached {
                let since = *state.breach_since.get_or_insert(now);
                let sustained = now.duration_since(since) >= state.rule.min_duration;
                if sustained && state.status != RuleStatus::Firing {
                    state.status = RuleStatus::Firing;
                    state.fire_count += 1;
                    state.last_fired = Some(Utc::now());
                    Some((true, value, state.rule.clone()))
                } else {
                    None
                }
            } else {
                state.breach_since = None;
                if state.status == RuleStatus::Firing {
                    state.status = RuleStatus::Resolved;
                    state.last_resolved = Some(Utc::now());
                    Some((false, value, state.rule.clone()))
                } else {
                    None
                }
            }
        };

        match outcome {
            Some((true, value, rule)) => self.fire_alert(rule, value).await,
            Some((false, value, rule)) => self.resolve_alert(rule, value).await,
            None => {}
        }
    }

    async fn fire_alert(&self, rule: AlertRule, value: f64) {
        let alert = Alert {
            id: Uuid::new_v4(),
            rule_name: rule.name.clone(),
            severity: rule.severity,
            status: AlertStatus::Firing,
            message: format!(
                "{} is {} (threshold {})",
                rule.metric_query, value, rule.threshold
            ),
            labels: rule.labels.clone(),
            annotations: rule.annotations.clone(),
            starts_at: Utc::now(),
            ends_at: None,
        };

        warn!(
            rule = %rule.name,
            severity = rule.severity.as_str(),
            value,
            threshold = rule.threshold,
            "Alert firing"
        );

        {
            let mut active = self.active.write().await;
            active.insert(rule.name.clone(), alert.clone());
        }
        {
            let mut history = self.history.write().await;
            history.push_back(alert.clone());
            while history.len() > MAX_ALERT_HISTORY {
                history.pop_front();
            }
        }

        self.events.publish(MonitorEvent::AlertFired(alert.clone()));
        self.dispatch(alert).await;
    }

    async fn resolve_alert(&self, rule: AlertRule, value: f64) {
        if self.retire_active(&rule.name).await {
            info!(rule = %rule.name, value, "Alert resolved");
        }
    }

    /// Resolve, record and dispatch the active alert for a rule, if any.
    /// Returns false when the rule had nothing firing.
    async fn retire_active(&self, name: &str) -> bool {
        let alert = {
            let mut active = self.active.write().await;
            match active.remove(name) {
                Some(mut alert) => {
                    alert.status = AlertStatus::Resolved;
                    alert.ends_at = Some(Utc::now());
                    alert
                }
                // Already resolved; nothing to dispatch.
                None => return false,
            }
        };

        {
            let mut history = self.history.write().await;
            if let Some(entry) = history.iter_mut().find(|a| a.id == alert.id) {
                entry.status = AlertStatus::Resolved;
                entry.ends_at = alert.ends_at;
            }
        }

        self.events.publish(MonitorEvent::AlertResolved(alert.clone()));
        self.dispatch(alert).await;
        true
    }

    /// Deliver to every enabled channel. Per-channel failures and timeouts
    /// are reported as events and never block the other channels.
    async fn dispatch(&self, alert: Alert) {
        let channels: Vec<Arc<dyn NotificationChannel>> = {
            let channels = self.channels.read().await;
            channels.iter().filter(|c| c.is_enabled()).cloned().collect()
        };
        if channels.is_empty() {
            return;
        }

        let notification = AlertNotification::from_alert(alert.clone());
        let timeout = self.dispatch_timeout;

        let deliveries = channels.into_iter().map(|channel| {
            let notification = notification.clone();
            let rule = alert.rule_name.clone();
            let events = self.events.clone();
            async move {
                let result = tokio::time::timeout(timeout, channel.notify(&notification)).await;
                let failure = match result {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => Some(format!("delivery timed out after {}ms", timeout.as_millis())),
                };
                if let Some(message) = failure {
                    warn!(channel = channel.name(), rule = %rule, error = %message, "Alert delivery failed");
                    events.publish(MonitorEvent::AlertDeliveryFailed {
                        channel: channel.name().to_string(),
                        rule,
                        message,
                    });
                }
            }
        });
        futures::future::join_all(deliveries).await;
    }

    /// Currently firing alerts
    pub async fn active_alerts(&self) -> Vec<Alert> {
        self.active.read().await.values().cloned().collect()
    }

    /// Up to `limit` most recent history entries, newest first
    pub async fn alert_history(&self, limit: usize) -> Vec<Alert> {
        let history = self.history.read().await;
        history.iter().rev().take(limit).cloned().collect()
    }

    /// State of one rule
    pub async fn rule_state(&self, name: &str) -> Option<RuleState> {
        self.states.read().await.get(name).cloned()
    }

    /// All registered rules
    pub async fn rules(&self) -> Vec<AlertRule> {
        self.states
            .read()
            .await
            .values()
            .map(|s| s.rule.clone())
            .collect()
    }
}

impl Clone for AlertEngine {
    fn clone(&self) -> Self {
        Self {
            states: Arc::clone(&self.states),
            active: Arc::clone(&self.active),
            history: Arc::clone(&self.history),
            channels: Arc::clone(&self.channels),
            dispatch_timeout: self.dispatch_timeout,
            events: self.events.clone(),
        }
    }
}
