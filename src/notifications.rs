//! Notification delivery for triggered alerts
//!
//! Supported channels:
//! - Email (SMTP)
//! - Webhooks (HTTP POST, optionally HMAC-signed)
//! - Slack (via webhook)
//!
//! Dispatch is best-effort: each channel is attempted independently and a
//! failure is logged without blocking the others.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, error, info};

use crate::alerting::{ErrorAlert, ErrorAlertConfig};

/// Notification channel types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Email,
    Webhook,
    Slack,
}

impl ChannelType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "email" => Some(Self::Email),
            "webhook" => Some(Self::Webhook),
            "slack" => Some(Self::Slack),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Webhook => "webhook",
            Self::Slack => "slack",
        }
    }
}

/// Configuration for a named notification channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannelConfig {
    pub name: String,
    #[serde(default = "default_channel_enabled")]
    pub enabled: bool,
    pub settings: ChannelSettings,
}

fn default_channel_enabled() -> bool {
    true
}

/// Channel-specific settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelSettings {
    Email(EmailSettings),
    Slack(SlackSettings),
    Webhook(WebhookSettings),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSettings {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    #[serde(default)]
    pub smtp_tls: bool,
    pub from_address: String,
    pub to_addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    pub url: String,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    /// When set, the request carries an HMAC-SHA256 signature header
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackSettings {
    pub webhook_url: String,
    pub channel: Option<String>,
    pub username: Option<String>,
}

/// Payload delivered to every channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertPayload {
    pub alert_id: String,
    pub alert_name: String,
    pub rule_id: Option<String>,
    pub status: String,
    pub message: String,
    pub error_rate: f64,
    pub threshold: f64,
    pub error_count: u64,
    pub request_count: u64,
    pub started_at: String,
    pub resolved_at: Option<String>,
    pub timestamp: String,
}

impl AlertPayload {
    pub fn from_alert(alert: &ErrorAlert, config: &ErrorAlertConfig) -> Self {
        Self {
            alert_id: alert.id.clone(),
            alert_name: config.name.clone(),
            rule_id: config.rule_id.clone(),
            status: alert.status.as_str().to_string(),
            message: alert.message.clone(),
            error_rate: alert.error_rate,
            threshold: config.threshold,
            error_count: alert.error_count,
            request_count: alert.request_count,
            started_at: alert.started_at.to_rfc3339(),
            resolved_at: alert.resolved_at.map(|t| t.to_rfc3339()),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Outcome of dispatching one payload across channels
#[derive(Debug, Default, PartialEq)]
pub struct DispatchResult {
    pub sent: usize,
    pub failed: usize,
}

/// Delivers alert payloads to configured channels
pub struct Notifier {
    channels: HashMap<String, NotificationChannelConfig>,
    http_client: reqwest::Client,
}

impl Notifier {
    pub fn new(configs: Vec<NotificationChannelConfig>) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        let channels = configs.into_iter().map(|c| (c.name.clone(), c)).collect();

        Self {
            channels,
            http_client,
        }
    }

    /// Deliver a payload to each named channel, best-effort
    ///
    /// Unknown names that look like URLs are treated as ad hoc webhooks.
    pub async fn dispatch(&self, payload: &AlertPayload, channel_names: &[String]) -> DispatchResult {
        let mut result = DispatchResult::default();

        for name in channel_names {
            match self.send_to_channel(payload, name).await {
                Ok(()) => {
                    result.sent += 1;
                    info!(channel = name, alert = payload.alert_id, "Notification sent");
                }
                Err(e) => {
                    result.failed += 1;
                    error!(
                        channel = name,
                        alert = payload.alert_id,
                        error = %e,
                        "Failed to send notification"
                    );
                }
            }
        }

        result
    }

    async fn send_to_channel(&self, payload: &AlertPayload, name: &str) -> Result<()> {
        match self.channels.get(name) {
            Some(config) if !config.enabled => {
                debug!(channel = name, "Channel disabled, skipping");
                Ok(())
            }
            Some(config) => match &config.settings {
                ChannelSettings::Email(email) => self.send_email(payload, email).await,
                ChannelSettings::Webhook(webhook) => self.send_webhook(payload, webhook).await,
                ChannelSettings::Slack(slack) => self.send_slack(payload, slack).await,
            },
            None if name.starts_with("http://") || name.starts_with("https://") => {
                let settings = WebhookSettings {
                    url: name.to_string(),
                    headers: None,
                    secret: None,
                };
                self.send_webhook(payload, &settings).await
            }
            None => Err(anyhow!("Unknown notification channel: {}", name)),
        }
    }

    /// POST the payload as JSON, signing the body when a secret is set
    async fn send_webhook(&self, payload: &AlertPayload, settings: &WebhookSettings) -> Result<()> {
        let body = serde_json::to_string(payload)?;

        let mut request = self
            .http_client
            .post(&settings.url)
            .header("Content-Type", "application/json");

        if let Some(headers) = &settings.headers {
            for (key, value) in headers {
                request = request.header(key, value);
            }
        }

        if let Some(secret) = &settings.secret {
            let signature = compute_hmac_signature(secret, &body);
            request = request.header("X-Signature-256", format!("sha256={}", signature));
        }

        let response = request.body(body).send().await?;

        if !response.status().is_success() {
            return Err(anyhow!("Webhook returned status {}", response.status()));
        }

        debug!(url = settings.url, "Webhook delivered");
        Ok(())
    }

    async fn send_slack(&self, payload: &AlertPayload, settings: &SlackSettings) -> Result<()> {
        let color = match payload.status.as_str() {
            "active" => "#d32f2f",
            "resolved" => "#388e3c",
            _ => "#f9a825",
        };

        let rule_line = payload
            .rule_id
            .as_ref()
            .map(|r| format!("\nRule: {}", r))
            .unwrap_or_default();

        let mut body = serde_json::json!({
            "attachments": [{
                "color": color,
                "title": format!("[{}] {}", payload.status.to_uppercase(), payload.alert_name),
                "text": format!(
                    "{}{}\nError rate: {:.2}% (threshold {:.2}%) over {} requests",
                    payload.message,
                    rule_line,
                    payload.error_rate * 100.0,
                    payload.threshold * 100.0,
                    payload.request_count
                ),
            }]
        });

        if let Some(channel) = &settings.channel {
            body["channel"] = serde_json::json!(channel);
        }
        if let Some(username) = &settings.username {
            body["username"] = serde_json::json!(username);
        }

        let response = self
            .http_client
            .post(&settings.webhook_url)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!("Slack webhook returned status {}", response.status()));
        }

        Ok(())
    }

    async fn send_email(&self, payload: &AlertPayload, settings: &EmailSettings) -> Result<()> {
        use lettre::{
            message::{header::ContentType, Mailbox},
            transport::smtp::authentication::Credentials,
            AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
        };

        let subject = format!(
            "[{}] {}",
            payload.status.to_uppercase(),
            payload.alert_name
        );
        let body = format_email_body(payload);

        let from: Mailbox = settings
            .from_address
            .parse()
            .map_err(|e| anyhow!("Invalid from address: {}", e))?;

        for to_addr in &settings.to_addresses {
            let to: Mailbox = to_addr
                .parse()
                .map_err(|e| anyhow!("Invalid to address {}: {}", to_addr, e))?;

            let email = Message::builder()
                .from(from.clone())
                .to(to)
                .subject(&subject)
                .header(ContentType::TEXT_PLAIN)
                .body(body.clone())
                .map_err(|e| anyhow!("Failed to build email: {}", e))?;

            let mut transport_builder = if settings.smtp_tls {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.smtp_host)
                    .map_err(|e| anyhow!("Failed to create SMTP transport: {}", e))?
            } else {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.smtp_host)
            };

            transport_builder = transport_builder.port(settings.smtp_port);

            if let (Some(username), Some(password)) =
                (&settings.smtp_username, &settings.smtp_password)
            {
                transport_builder = transport_builder
                    .credentials(Credentials::new(username.clone(), password.clone()));
            }

            let transport = transport_builder.build();
            transport
                .send(email)
                .await
                .map_err(|e| anyhow!("Failed to send email to {}: {}", to_addr, e))?;

            debug!(to = to_addr, "Email sent");
        }

        Ok(())
    }
}

fn format_email_body(payload: &AlertPayload) -> String {
    let rule_info = payload
        .rule_id
        .as_ref()
        .map(|r| format!("Rule: {}\n", r))
        .unwrap_or_default();

    format!(
        r#"Alert: {}
Status: {}
{}
Error rate: {:.2}% (threshold {:.2}%)
Errors: {} of {} requests

Message: {}

Started: {}
{}
Timestamp: {}

---
Rulegate proxy alerting
"#,
        payload.alert_name,
        payload.status,
        rule_info,
        payload.error_rate * 100.0,
        payload.threshold * 100.0,
        payload.error_count,
        payload.request_count,
        payload.message,
        payload.started_at,
        payload
            .resolved_at
            .as_ref()
            .map(|r| format!("Resolved: {}\n", r))
            .unwrap_or_default(),
        payload.timestamp
    )
}

fn compute_hmac_signature(secret: &str, body: &str) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> AlertPayload {
        AlertPayload {
            alert_id: "a1".to_string(),
            alert_name: "api errors".to_string(),
            rule_id: Some("r1".to_string()),
            status: "active".to_string(),
            message: "error rate above threshold".to_string(),
            error_rate: 0.12,
            threshold: 0.05,
            error_count: 12,
            request_count: 100,
            started_at: "2026-08-07T10:00:00Z".to_string(),
            resolved_at: None,
            timestamp: "2026-08-07T10:00:05Z".to_string(),
        }
    }

    #[test]
    fn test_channel_type_from_str() {
        assert_eq!(ChannelType::from_str("email"), Some(ChannelType::Email));
        assert_eq!(ChannelType::from_str("SLACK"), Some(ChannelType::Slack));
        assert_eq!(ChannelType::from_str("pager"), None);
    }

    #[test]
    fn test_hmac_signature_is_stable() {
        let sig1 = compute_hmac_signature("secret", "body");
        let sig2 = compute_hmac_signature("secret", "body");
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64);

        let sig3 = compute_hmac_signature("other", "body");
        assert_ne!(sig1, sig3);
    }

    #[test]
    fn test_email_body_includes_rate_and_rule() {
        let body = format_email_body(&payload());
        assert!(body.contains("12.00%"));
        assert!(body.contains("Rule: r1"));
        assert!(body.contains("12 of 100 requests"));
    }

    #[tokio::test]
    async fn test_unknown_channel_counted_as_failed() {
        let notifier = Notifier::new(vec![]);
        let result = notifier
            .dispatch(&payload(), &["nonexistent".to_string()])
            .await;
        assert_eq!(result, DispatchResult { sent: 0, failed: 1 });
    }

    #[tokio::test]
    async fn test_disabled_channel_skipped_without_error() {
        let notifier = Notifier::new(vec![NotificationChannelConfig {
            name: "ops".to_string(),
            enabled: false,
            settings: ChannelSettings::Webhook(WebhookSettings {
                url: "http://127.0.0.1:1/unreachable".to_string(),
                headers: None,
                secret: None,
            }),
        }]);

        let result = notifier.dispatch(&payload(), &["ops".to_string()]).await;
        assert_eq!(result, DispatchResult { sent: 1, failed: 0 });
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_others() {
        let notifier = Notifier::new(vec![NotificationChannelConfig {
            name: "dead-webhook".to_string(),
            enabled: true,
            settings: ChannelSettings::Webhook(WebhookSettings {
                url: "http://127.0.0.1:1/unreachable".to_string(),
                headers: None,
                secret: None,
            }),
        }]);

        let result = notifier
            .dispatch(
                &payload(),
                &["dead-webhook".to_string(), "unknown-channel".to_string()],
            )
            .await;
        assert_eq!(result.sent, 0);
        assert_eq!(result.failed, 2);
    }
}
