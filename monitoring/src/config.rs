//! Configuration management for the monitoring service
//!
//! All settings come from environment variables with documented defaults.
//! Validation runs eagerly at startup and reports every problem at once as
//! human-readable messages rather than failing on the first.

use std::time::Duration;
use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::channels::{EmailConfig, SlackConfig};
use crate::Result;

/// Main configuration for the monitoring service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Metrics exposition settings
    pub prometheus: PrometheusConfig,

    /// Distributed tracing settings
    pub tracing: TracingConfig,

    /// Logging settings
    pub logging: LoggingConfig,

    /// Health check settings
    pub health: HealthConfig,

    /// Alerting settings
    pub alerts: AlertsConfig,
}

/// Metrics exposition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    pub enabled: bool,

    /// HTTP port for the exposition endpoint
    pub port: u16,

    /// Exposition endpoint path
    pub path: String,

    /// Name prefix applied to every exported metric
    pub prefix: String,

    /// Cap on distinct label sets per metric name
    pub max_label_cardinality: usize,
}

/// Distributed tracing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    pub enabled: bool,

    pub service_name: String,

    pub jaeger_endpoint: Option<String>,

    /// Fraction of traces sampled, in [0, 1]
    pub sampling_rate: f64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    pub level: String,

    /// text | json
    pub format: String,

    /// stdout | stderr | file
    pub output: String,

    /// Required when output is "file"
    pub file_path: Option<String>,
}

/// Health check settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub enabled: bool,

    /// Endpoint path for the aggregate health report
    pub endpoint: String,

    /// Interval between periodic check runs
    pub interval: Duration,

    /// Per-probe timeout
    pub timeout: Duration,
}

/// Alerting settings. Channel configs arrive as JSON strings in the
/// environment and are parsed on demand; validation reports parse errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    pub enabled: bool,

    pub webhook_url: Option<String>,

    /// JSON-encoded `EmailConfig`
    pub email_config: Option<String>,

    /// JSON-encoded `SlackConfig`
    pub slack_config: Option<String>,
}

impl AlertsConfig {
    /// Parse the email channel config, if configured
    pub fn email(&self) -> Result<Option<EmailConfig>> {
        match &self.email_config {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    /// Parse the Slack channel config, if configured
    pub fn slack(&self) -> Result<Option<SlackConfig>> {
        match &self.slack_config {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    fn has_channel(&self) -> bool {
        self.webhook_url.is_some() || self.email_config.is_some() || self.slack_config.is_some()
    }
}

/// Flat view of the recognized environment variables
#[derive(Debug, Deserialize)]
struct EnvConfig {
    #[serde(default = "default_true")]
    prometheus_enabled: bool,

    #[serde(default = "default_prometheus_port")]
    prometheus_port: u16,

    #[serde(default = "default_prometheus_path")]
    prometheus_path: String,

    #[serde(default = "default_prometheus_prefix")]
    prometheus_prefix: String,

    #[serde(default = "default_label_cardinality")]
    prometheus_max_label_cardinality: usize,

    #[serde(default)]
    tracing_enabled: bool,

    #[serde(default = "default_service_name")]
    tracing_service_name: String,

    #[serde(default)]
    tracing_jaeger_endpoint: Option<String>,

    #[serde(default = "default_sampling_rate")]
    trace_sampling_rate: f64,

    #[serde(default = "default_log_level")]
    log_level: String,

    #[serde(default = "default_log_format")]
    log_format: String,

    #[serde(default = "default_log_output")]
    log_output: String,

    #[serde(default)]
    log_file_path: Option<String>,

    #[serde(default = "default_true")]
    health_checks_enabled: bool,

    #[serde(default = "default_health_endpoint")]
    health_endpoint: String,

    #[serde(default = "default_health_interval_ms")]
    health_check_interval: u64,

    #[serde(default = "default_health_timeout_ms")]
    health_check_timeout: u64,

    #[serde(default)]
    alerts_enabled: bool,

    #[serde(default)]
    alert_webhook_url: Option<String>,

    #[serde(default)]
    alert_email_config: Option<String>,

    #[serde(default)]
    alert_slack_config: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_prometheus_port() -> u16 {
    9090
}

fn default_prometheus_path() -> String {
    "/metrics".to_string()
}

fn default_prometheus_prefix() -> String {
    "app_".to_string()
}

fn default_label_cardinality() -> usize {
    crate::metrics::DEFAULT_MAX_LABEL_CARDINALITY
}

fn default_service_name() -> String {
    "mentora-monitoring".to_string()
}

fn default_sampling_rate() -> f64 {
    0.1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_log_output() -> String {
    "stdout".to_string()
}

fn default_health_endpoint() -> String {
    "/health".to_string()
}

fn default_health_interval_ms() -> u64 {
    30_000
}

fn default_health_timeout_ms() -> u64 {
    5_000
}

impl MonitoringConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            .add_source(Environment::default().try_parsing(true))
            .build()?;
        let env: EnvConfig = config.try_deserialize()?;
        Ok(Self::from_env(env))
    }

    fn from_env(env: EnvConfig) -> Self {
        Self {
            prometheus: PrometheusConfig {
                enabled: env.prometheus_enabled,
                port: env.prometheus_port,
                path: env.prometheus_path,
                prefix: env.prometheus_prefix,
                max_label_cardinality: env.prometheus_max_label_cardinality,
            },
            tracing: TracingConfig {
                enabled: env.tracing_enabled,
                service_name: env.tracing_service_name,
                jaeger_endpoint: env.tracing_jaeger_endpoint,
                sampling_rate: env.trace_sampling_rate,
            },
            logging: LoggingConfig {
                level: env.log_level,
                format: env.log_format,
                output: env.log_output,
                file_path: env.log_file_path,
            },
            health: HealthConfig {
                enabled: env.health_checks_enabled,
                endpoint: env.health_endpoint,
                interval: Duration::from_millis(env.health_check_interval),
                timeout: Duration::from_millis(env.health_check_timeout),
            },
            alerts: AlertsConfig {
                enabled: env.alerts_enabled,
                webhook_url: env.alert_webhook_url,
                email_config: env.alert_email_config,
                slack_config: env.alert_slack_config,
            },
        }
    }

    /// Validate the configuration, collecting every problem.
    ///
    /// An empty result means the configuration is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.prometheus.enabled && self.prometheus.port == 0 {
            problems.push("PROMETHEUS_PORT must be in [1, 65535]".to_string());
        }
        if !self.prometheus.path.starts_with('/') {
            problems.push(format!(
                "PROMETHEUS_PATH must start with '/': {}",
                self.prometheus.path
            ));
        }
        if self.prometheus.max_label_cardinality == 0 {
            problems.push("PROMETHEUS_MAX_LABEL_CARDINALITY must be greater than 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.tracing.sampling_rate) {
            problems.push(format!(
                "TRACE_SAMPLING_RATE must be in [0, 1]: {}",
                self.tracing.sampling_rate
            ));
        }
        if self.tracing.enabled {
            match &self.tracing.jaeger_endpoint {
                Some(endpoint) => {
                    if Url::parse(endpoint).is_err() {
                        problems.push(format!("TRACING_JAEGER_ENDPOINT is not a valid URL: {}", endpoint));
                    }
                }
                None => problems.push(
                    "TRACING_JAEGER_ENDPOINT is required when TRACING_ENABLED is true".to_string(),
                ),
            }
        }

        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            problems.push(format!(
                "LOG_LEVEL must be one of trace|debug|info|warn|error: {}",
                self.logging.level
            ));
        }
        if !["text", "json"].contains(&self.logging.format.as_str()) {
            problems.push(format!("LOG_FORMAT must be text|json: {}", self.logging.format));
        }
        match self.logging.output.as_str() {
            "stdout" | "stderr" => {}
            "file" => {
                if self.logging.file_path.is_none() {
                    problems.push(
                        "LOG_FILE_PATH is required when LOG_OUTPUT is file".to_string(),
                    );
                }
            }
            other => problems.push(format!("LOG_OUTPUT must be stdout|stderr|file: {}", other)),
        }

        if self.health.enabled {
            if self.health.interval.is_zero() {
                problems.push("HEALTH_CHECK_INTERVAL must be greater than 0".to_string());
            }
            if self.health.timeout.is_zero() {
                problems.push("HEALTH_CHECK_TIMEOUT must be greater than 0".to_string());
            }
        }

        if self.alerts.enabled {
            if !self.alerts.has_channel() {
                problems.push(
                    "at least one of ALERT_WEBHOOK_URL, ALERT_EMAIL_CONFIG or ALERT_SLACK_CONFIG is required when ALERTS_ENABLED is true".to_string(),
                );
            }
            if let Some(url) = &self.alerts.webhook_url {
                if Url::parse(url).is_err() {
                    problems.push(format!("ALERT_WEBHOOK_URL is not a valid URL: {}", url));
                }
            }
            if let Err(e) = self.alerts.email() {
                problems.push(format!("ALERT_EMAIL_CONFIG is not valid JSON: {}", e));
            }
            if let Err(e) = self.alerts.slack() {
                problems.push(format!("ALERT_SLACK_CONFIG is not valid JSON: {}", e));
            }
        }

        problems
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            prometheus: PrometheusConfig {
                enabled: true,
                port: 9090,
                path: default_prometheus_path(),
                prefix: default_prometheus_prefix(),
                max_label_cardinality: default_label_cardinality(),
            },
            tracing: TracingConfig {
                enabled: false,
                service_name: default_service_name(),
                jaeger_endpoint: None,
                sampling_rate: default_sampling_rate(),
            },
            logging: LoggingConfig {
                level: default_log_level(),
                format: default_log_format(),
                output: default_log_output(),
                file_path: None,
            },
            health: HealthConfig {
                enabled: true,
                endpoint: default_health_endpoint(),
                interval: Duration::from_millis(default_health_interval_ms()),
                timeout: Duration::from_millis(default_health_timeout_ms()),
            },
            alerts: AlertsConfig {
                enabled: false,
                webhook_url: None,
                email_config: None,
                slack_config: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MonitoringConfig::default();
        assert!(config.validate().is_empty());
        assert_eq!(config.prometheus.prefix, "app_");
        assert_eq!(config.health.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_zero_cardinality_cap_is_rejected() {
        let mut config = MonitoringConfig::default();
        config.prometheus.max_label_cardinality = 0;
        let problems = config.validate();
        assert!(problems
            .iter()
            .any(|p| p.contains("PROMETHEUS_MAX_LABEL_CARDINALITY")));
    }

    #[test]
    fn test_sampling_rate_out_of_range() {
        let mut config = MonitoringConfig::default();
        config.tracing.sampling_rate = 1.5;
        let problems = config.validate();
        assert!(problems.iter().any(|p| p.contains("TRACE_SAMPLING_RATE")));
    }

    #[test]
    fn test_alerts_require_a_channel() {
        let mut config = MonitoringConfig::default();
        config.alerts.enabled = true;
        let problems = config.validate();
        assert!(problems.iter().any(|p| p.contains("ALERT_WEBHOOK_URL")));

        config.alerts.webhook_url = Some("https://hooks.example.com/alerts".to_string());
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_collects_multiple_problems() {
        let mut config = MonitoringConfig::default();
        config.logging.level = "loud".to_string();
        config.logging.format = "yaml".to_string();
        config.logging.output = "file".to_string();
        let problems = config.validate();
        assert_eq!(problems.len(), 3);
    }

    #[test]
    fn test_email_config_json_round_trip() {
        let mut config = MonitoringConfig::default();
        config.alerts.enabled = true;
        config.alerts.email_config = Some(
            r#"{"smtp_host":"smtp.example.com","from":"alerts@mentora.example","to":["oncall@mentora.example"]}"#
                .to_string(),
        );
        assert!(config.validate().is_empty());
        let email = config.alerts.email().unwrap().unwrap();
        assert_eq!(email.smtp_port, 587);
        assert_eq!(email.to.len(), 1);
    }

    #[test]
    fn test_bad_channel_json_is_reported() {
        let mut config = MonitoringConfig::default();
        config.alerts.enabled = true;
        config.alerts.slack_config = Some("{not json".to_string());
        let problems = config.validate();
        assert!(problems.iter().any(|p| p.contains("ALERT_SLACK_CONFIG")));
    }
}
