//! # Mentora Monitoring
//!
//! Monitoring and alerting core for the Mentora learning platform.
//! Aggregates platform metrics, runs health probes, evaluates alert rules
//! and tracks background workflow executions, exposed over HTTP for
//! scrapers and dashboards.

pub mod alerts;
pub mod channels;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod events;
pub mod health;
pub mod metrics;
pub mod server;
pub mod workflow;

pub use config::MonitoringConfig;
pub use dashboard::{DashboardAggregator, MonitoringService};
pub use error::{MonitoringError, Result};
pub use events::{EventBus, MonitorEvent};
pub use health::{HealthRunner, HealthStatus};
pub use metrics::{MetricSample, MetricsRegistry};
pub use workflow::WorkflowTracker;

/// Current version of the monitoring service
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service identifier
pub const SYSTEM_NAME: &str = "mentora-monitoring";
