//! Notification channels for alert delivery
//!
//! Each channel receives the same normalized payload. Delivery failures are
//! the caller's concern; channels report them but never panic.

use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::alerts::{Alert, AlertStatus};
use crate::{MonitoringError, Result};

/// Channel implementation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Console,
    Webhook,
    Email,
    Slack,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Console => "console",
            ChannelKind::Webhook => "webhook",
            ChannelKind::Email => "email",
            ChannelKind::Slack => "slack",
        }
    }
}

/// Normalized payload sent to every channel for one alert transition.
///
/// Serializes with camelCase keys (`groupLabels`, `commonLabels`,
/// `commonAnnotations`) so webhook receivers see the Alertmanager-style
/// shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertNotification {
    /// "firing" or "resolved"
    pub status: String,

    /// Labels shared by the grouped alerts
    pub group_labels: HashMap<String, String>,

    /// Labels common to every alert in the payload
    pub common_labels: HashMap<String, String>,

    /// Annotations common to every alert in the payload
    pub common_annotations: HashMap<String, String>,

    /// The alerts themselves
    pub alerts: Vec<Alert>,
}

impl AlertNotification {
    /// Build a single-alert notification
    pub fn from_alert(alert: Alert) -> Self {
        let status = match alert.status {
            AlertStatus::Resolved => "resolved".to_string(),
            _ => "firing".to_string(),
        };
        let mut group_labels = HashMap::new();
        group_labels.insert("alertname".to_string(), alert.rule_name.clone());
        Self {
            status,
            group_labels,
            common_labels: alert.labels.clone(),
            common_annotations: alert.annotations.clone(),
            alerts: vec![alert],
        }
    }

    /// One-line summary for console and log output
    pub fn summary(&self) -> String {
        let name = self
            .group_labels
            .get("alertname")
            .map(String::as_str)
            .unwrap_or("unknown");
        let detail = self
            .alerts
            .first()
            .map(|a| a.message.as_str())
            .unwrap_or("");
        format!("[{}] {}: {}", self.status.to_uppercase(), name, detail)
    }
}

/// A delivery target for alert notifications
#[async_trait::async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Channel name, unique among registered channels
    fn name(&self) -> &str;

    /// Implementation kind
    fn kind(&self) -> ChannelKind;

    /// Disabled channels are skipped without error
    fn is_enabled(&self) -> bool {
        true
    }

    /// Deliver one notification
    async fn notify(&self, notification: &AlertNotification) -> Result<()>;
}

/// Writes notifications to stdout. Always available; used as the fallback
/// when no external channel is configured.
pub struct ConsoleChannel;

#[async_trait::async_trait]
impl NotificationChannel for ConsoleChannel {
    fn name(&self) -> &str {
        "console"
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Console
    }

    async fn notify(&self, notification: &AlertNotification) -> Result<()> {
        println!("{}", notification.summary());
        Ok(())
    }
}

/// POSTs the notification as JSON to a configured URL
pub struct WebhookChannel {
    name: String,
    url: url::Url,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(name: &str, url: &str) -> Result<Self> {
        let url = url::Url::parse(url)
            .map_err(|e| MonitoringError::validation(format!("Invalid webhook URL: {}", e)))?;
        Ok(Self {
            name: name.to_string(),
            url,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait::async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    async fn notify(&self, notification: &AlertNotification) -> Result<()> {
        let response = self
            .client
            .post(self.url.clone())
            .json(notification)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(MonitoringError::channel(
                self.name.clone(),
                format!("Webhook returned status {}", response.status()),
            ));
        }
        debug!(channel = %self.name, "Webhook notification delivered");
        Ok(())
    }
}

/// Slack channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    pub webhook_url: String,

    /// Override channel, e.g. "#platform-alerts"
    #[serde(default)]
    pub channel: Option<String>,
}

/// Posts a formatted message to a Slack incoming webhook
pub struct SlackChannel {
    config: SlackConfig,
    client: reqwest::Client,
}

impl SlackChannel {
    pub fn new(config: SlackConfig) -> Result<Self> {
        url::Url::parse(&config.webhook_url)
            .map_err(|e| MonitoringError::validation(format!("Invalid Slack webhook URL: {}", e)))?;
        Ok(Self {
            config,
            client: reqwest::Client::new(),
        })
    }

    fn build_payload(&self, notification: &AlertNotification) -> serde_json::Value {
        let emoji = if notification.status == "resolved" {
            ":white_check_mark:"
        } else {
            ":rotating_light:"
        };
        let mut payload = serde_json::json!({
            "text": format!("{} {}", emoji, notification.summary()),
        });
        if let Some(channel) = &self.config.channel {
            payload["channel"] = serde_json::Value::String(channel.clone());
        }
        payload
    }
}

#[async_trait::async_trait]
impl NotificationChannel for SlackChannel {
    fn name(&self) -> &str {
        "slack"
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Slack
    }

    async fn notify(&self, notification: &AlertNotification) -> Result<()> {
        let payload = self.build_payload(notification);
        let response = self
            .client
            .post(&self.config.webhook_url)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(MonitoringError::channel(
                "slack".to_string(),
                format!("Slack returned status {}", response.status()),
            ));
        }
        Ok(())
    }
}

/// Email channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub smtp_host: String,

    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    pub from: String,

    pub to: Vec<String>,
}

fn default_smtp_port() -> u16 {
    587
}

/// Transport seam for email delivery, so tests and deployments without an
/// SMTP relay can still exercise the channel.
#[async_trait::async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, from: &str, to: &[String], subject: &str, body: &str) -> Result<()>;
}

/// Transport that logs the message instead of sending it
pub struct LogMailTransport;

#[async_trait::async_trait]
impl MailTransport for LogMailTransport {
    async fn send(&self, from: &str, to: &[String], subject: &str, _body: &str) -> Result<()> {
        info!(from, recipients = to.len(), subject, "Email notification (log transport)");
        Ok(())
    }
}

/// Sends alert emails through a pluggable transport
pub struct EmailChannel {
    config: EmailConfig,
    transport: Box<dyn MailTransport>,
}

impl EmailChannel {
    pub fn new(config: EmailConfig, transport: Box<dyn MailTransport>) -> Result<Self> {
        if config.to.is_empty() {
            return Err(MonitoringError::validation(
                "Email channel requires at least one recipient",
            ));
        }
        Ok(Self { config, transport })
    }

    fn render_body(&self, notification: &AlertNotification) -> String {
        let mut body = String::new();
        for alert in &notification.alerts {
            body.push_str(&format!(
                "Alert: {}\nSeverity: {}\nStatus: {}\nMessage: {}\nStarted: {}\n",
                alert.rule_name,
                alert.severity.as_str(),
                notification.status,
                alert.message,
                alert.starts_at.to_rfc3339(),
            ));
            if let Some(ends_at) = alert.ends_at {
                body.push_str(&format!("Ended: {}\n", ends_at.to_rfc3339()));
            }
            body.push('\n');
        }
        body
    }
}

#[async_trait::async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &str {
        "email"
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn notify(&self, notification: &AlertNotification) -> Result<()> {
        let subject = notification.summary();
        let body = self.render_body(notification);
        self.transport
            .send(&self.config.from, &self.config.to, &subject, &body)
            .await
            .map_err(|e| {
                MonitoringError::channel("email".to_string(), format!("SMTP delivery failed: {}", e))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertSeverity;
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_alert(status: AlertStatus) -> Alert {
        Alert {
            id: Uuid::new_v4(),
            rule_name: "high_error_rate".to_string(),
            severity: AlertSeverity::Critical,
            status,
            message: "error_rate is 0.12 (threshold 0.05)".to_string(),
            labels: HashMap::from([("service".to_string(), "api".to_string())]),
            annotations: HashMap::new(),
            starts_at: Utc::now(),
            ends_at: None,
        }
    }

    #[test]
    fn test_notification_from_firing_alert() {
        let notification = AlertNotification::from_alert(sample_alert(AlertStatus::Firing));
        assert_eq!(notification.status, "firing");
        assert_eq!(
            notification.group_labels.get("alertname").unwrap(),
            "high_error_rate"
        );
        assert_eq!(notification.alerts.len(), 1);
        assert!(notification.summary().contains("FIRING"));
    }

    #[test]
    fn test_notification_from_resolved_alert() {
        let notification = AlertNotification::from_alert(sample_alert(AlertStatus::Resolved));
        assert_eq!(notification.status, "resolved");
    }

    #[tokio::test]
    async fn test_console_channel_delivers() {
        let channel = ConsoleChannel;
        let notification = AlertNotification::from_alert(sample_alert(AlertStatus::Firing));
        assert!(channel.notify(&notification).await.is_ok());
    }

    #[test]
    fn test_notification_wire_format_is_camel_case() {
        let notification = AlertNotification::from_alert(sample_alert(AlertStatus::Firing));
        let payload = serde_json::to_value(&notification).unwrap();
        assert!(payload.get("groupLabels").is_some());
        assert!(payload.get("commonLabels").is_some());
        assert!(payload.get("commonAnnotations").is_some());
        assert!(payload.get("group_labels").is_none());
        assert_eq!(payload["status"], "firing");
    }

    #[test]
    fn test_webhook_rejects_bad_url() {
        assert!(WebhookChannel::new("ops", "not a url").is_err());
        assert!(WebhookChannel::new("ops", "https://hooks.example.com/alerts").is_ok());
    }

    #[tokio::test]
    async fn test_email_channel_with_log_transport() {
        let config = EmailConfig {
            smtp_host: "smtp.example.com".to_string(),
            smtp_port: 587,
            from: "alerts@mentora.example".to_string(),
            to: vec!["oncall@mentora.example".to_string()],
        };
        let channel = EmailChannel::new(config, Box::new(LogMailTransport)).unwrap();
        let notification = AlertNotification::from_alert(sample_alert(AlertStatus::Firing));
        assert!(channel.notify(&notification).await.is_ok());
    }

    #[test]
    fn test_email_requires_recipients() {
        let config = EmailConfig {
            smtp_host: "smtp.example.com".to_string(),
            smtp_port: 587,
            from: "alerts@mentora.example".to_string(),
            to: vec![],
        };
        assert!(EmailChannel::new(config, Box::new(LogMailTransport)).is_err());
    }

    #[test]
    fn test_slack_payload_includes_channel_override() {
        let slack = SlackChannel::new(SlackConfig {
            webhook_url: "https://hooks.slack.com/services/T0/B0/x".to_string(),
            channel: Some("#platform-alerts".to_string()),
        })
        .unwrap();
        let notification = AlertNotification::from_alert(sample_alert(AlertStatus::Firing));
        let payload = slack.build_payload(&notification);
        assert_eq!(payload["channel"], "#platform-alerts");
        assert!(payload["text"].as_str().unwrap().contains("high_error_rate"));
    }
}
