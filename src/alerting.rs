//! Alert evaluation over the analytics error stream
//!
//! This module provides:
//! - Threshold/window evaluation of alert configs on a periodic tick
//! - Alert lifecycle management (active, acknowledged, resolved)
//! - Best-effort notification dispatch on trigger
//!
//! An alert auto-resolves once evaluations have stayed below the threshold
//! for a full window; acknowledging or resolving earlier is an explicit
//! external action.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analytics::{ErrorKind, TrafficAnalytics};
use crate::events::{channels, BusEvent, EventBus};
use crate::notifications::{AlertPayload, Notifier};
use crate::store::Store;

/// Alert lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "acknowledged" => Some(Self::Acknowledged),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Acknowledged => "acknowledged",
            Self::Resolved => "resolved",
        }
    }
}

/// Declarative alerting condition over the error stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorAlertConfig {
    pub id: String,
    pub name: String,
    /// Scope to one rule; `None` evaluates across all rules
    pub rule_id: Option<String>,
    /// Count only errors of this kind
    pub kind_filter: Option<ErrorKind>,
    /// Count only errors with this status code
    pub status_code_filter: Option<u16>,
    /// Error rate (0..1) at or above which the alert fires
    pub threshold: f64,
    pub window_secs: u64,
    /// Minimum requests in the window before the rate is meaningful
    pub min_requests: u64,
    #[serde(default = "default_config_enabled")]
    pub enabled: bool,
    /// Notification channel names (or ad hoc webhook URLs)
    #[serde(default)]
    pub channels: Vec<String>,
}

fn default_config_enabled() -> bool {
    true
}

/// A triggered alert with its rate snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorAlert {
    pub id: String,
    pub config_id: String,
    pub status: AlertStatus,
    pub error_rate: f64,
    pub error_count: u64,
    pub request_count: u64,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ErrorAlert {
    pub fn new(
        config: &ErrorAlertConfig,
        error_rate: f64,
        error_count: u64,
        request_count: u64,
        message: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            config_id: config.id.clone(),
            status: AlertStatus::Active,
            error_rate,
            error_count,
            request_count,
            message,
            started_at: Utc::now(),
            acknowledged_at: None,
            resolved_at: None,
        }
    }
}

/// Status of one config after evaluation
#[derive(Debug)]
pub enum ConfigStatus {
    /// Condition met, alert should be open
    Firing {
        error_rate: f64,
        error_count: u64,
        request_count: u64,
        message: String,
    },
    /// Condition not met
    Below { error_rate: f64 },
    /// Too little traffic to evaluate the rate
    NoData,
}

/// Result of evaluating all configs
#[derive(Debug, Default)]
pub struct EvaluationResult {
    pub fired: usize,
    pub below: usize,
    pub no_data: usize,
    pub errors: usize,
}

/// Evaluates alert configs against analytics on a periodic tick
pub struct AlertEngine {
    analytics: Arc<TrafficAnalytics>,
    store: Arc<Store>,
    bus: Arc<EventBus>,
    notifier: Arc<Notifier>,
    /// config id -> when the rate was first observed below threshold while
    /// an alert was open
    below_since: HashMap<String, DateTime<Utc>>,
}

impl AlertEngine {
    pub fn new(
        analytics: Arc<TrafficAnalytics>,
        store: Arc<Store>,
        bus: Arc<EventBus>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            analytics,
            store,
            bus,
            notifier,
            below_since: HashMap::new(),
        }
    }

    /// Run the evaluation loop until shutdown
    pub async fn run(mut self, tick: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        info!(tick_secs = tick.as_secs(), "Alert engine started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {
                    if let Err(e) = self.evaluate_all().await {
                        warn!(error = %e, "Alert evaluation pass failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Alert engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Evaluate every enabled config once
    pub async fn evaluate_all(&mut self) -> Result<EvaluationResult> {
        let configs = self.store.list_enabled_alert_configs()?;
        let mut result = EvaluationResult::default();

        for config in configs {
            match self.evaluate_config(&config) {
                ConfigStatus::Firing {
                    error_rate,
                    error_count,
                    request_count,
                    message,
                } => {
                    self.below_since.remove(&config.id);
                    if let Err(e) = self
                        .handle_firing(&config, error_rate, error_count, request_count, message)
                        .await
                    {
                        warn!(config_id = config.id, error = %e, "Failed to handle firing config");
                        result.errors += 1;
                    } else {
                        result.fired += 1;
                    }
                }
                ConfigStatus::Below { error_rate } => {
                    if let Err(e) = self.handle_below(&config, error_rate) {
                        warn!(config_id = config.id, error = %e, "Failed to handle recovered config");
                        result.errors += 1;
                    } else {
                        result.below += 1;
                    }
                }
                ConfigStatus::NoData => {
                    result.no_data += 1;
                    // Quiet traffic still ages an open alert toward
                    // auto-resolution
                    if let Err(e) = self.handle_below(&config, 0.0) {
                        warn!(config_id = config.id, error = %e, "Failed to age open alert");
                        result.errors += 1;
                    }
                }
            }
        }

        Ok(result)
    }

    /// Evaluate a single config against the current windows
    pub fn evaluate_config(&self, config: &ErrorAlertConfig) -> ConfigStatus {
        let end = Utc::now();
        let start = end - ChronoDuration::seconds(config.window_secs as i64);

        let rule_ids = match &config.rule_id {
            Some(id) => vec![id.clone()],
            None => self.analytics.active_rule_ids(),
        };

        let mut request_count = 0u64;
        let mut error_count = 0u64;

        for rule_id in &rule_ids {
            let summary = self.analytics.error_summary_window(rule_id, start, end);
            request_count += summary.total_requests;

            error_count += if let Some(kind) = config.kind_filter {
                summary.by_kind.get(&kind).copied().unwrap_or(0)
            } else if let Some(code) = config.status_code_filter {
                summary.by_status.get(&code).copied().unwrap_or(0)
            } else {
                summary.total_errors
            };
        }

        if request_count < config.min_requests {
            return ConfigStatus::NoData;
        }

        let error_rate = error_count as f64 / request_count as f64;

        if error_rate >= config.threshold {
            let message = format!(
                "{}: error rate {:.2}% >= {:.2}% over {}s ({} errors / {} requests)",
                config.name,
                error_rate * 100.0,
                config.threshold * 100.0,
                config.window_secs,
                error_count,
                request_count
            );
            ConfigStatus::Firing {
                error_rate,
                error_count,
                request_count,
                message,
            }
        } else {
            ConfigStatus::Below { error_rate }
        }
    }

    async fn handle_firing(
        &self,
        config: &ErrorAlertConfig,
        error_rate: f64,
        error_count: u64,
        request_count: u64,
        message: String,
    ) -> Result<()> {
        // One open alert per config at a time
        if let Some(existing) = self.store.get_open_alert_for_config(&config.id)? {
            debug!(
                config_id = config.id,
                alert_id = existing.id,
                "Alert already open"
            );
            return Ok(());
        }

        info!(config_id = config.id, "Alert firing: {}", message);
        let alert = ErrorAlert::new(config, error_rate, error_count, request_count, message);
        self.store.create_alert(&alert)?;

        self.bus.publish(
            channels::SYSTEM,
            &BusEvent::new("alert:triggered", serde_json::to_value(&alert)?),
        );

        if !config.channels.is_empty() {
            let payload = AlertPayload::from_alert(&alert, config);
            let dispatched = self.notifier.dispatch(&payload, &config.channels).await;
            if dispatched.failed > 0 {
                warn!(
                    config_id = config.id,
                    sent = dispatched.sent,
                    failed = dispatched.failed,
                    "Some notification channels failed"
                );
            }
        }

        Ok(())
    }

    fn handle_below(&mut self, config: &ErrorAlertConfig, error_rate: f64) -> Result<()> {
        let Some(open) = self.store.get_open_alert_for_config(&config.id)? else {
            self.below_since.remove(&config.id);
            return Ok(());
        };

        let now = Utc::now();
        let since = *self.below_since.entry(config.id.clone()).or_insert(now);

        if (now - since).num_seconds() as u64 >= config.window_secs {
            info!(
                config_id = config.id,
                alert_id = open.id,
                error_rate,
                "Alert auto-resolved"
            );
            self.store.resolve_alert(&open.id)?;
            self.below_since.remove(&config.id);

            let mut resolved = open;
            resolved.status = AlertStatus::Resolved;
            resolved.resolved_at = Some(now);
            self.bus.publish(
                channels::SYSTEM,
                &BusEvent::new("alert:resolved", serde_json::to_value(&resolved)?),
            );
        }

        Ok(())
    }

    /// Explicitly acknowledge an alert
    pub fn acknowledge(&self, alert_id: &str) -> Result<bool> {
        let updated = self.store.acknowledge_alert(alert_id)?;
        if updated {
            self.bus.publish(
                channels::SYSTEM,
                &BusEvent::new(
                    "alert:acknowledged",
                    serde_json::json!({ "alert_id": alert_id }),
                ),
            );
        }
        Ok(updated)
    }

    /// Explicitly resolve an alert
    pub fn resolve(&self, alert_id: &str) -> Result<bool> {
        let updated = self.store.resolve_alert(alert_id)?;
        if updated {
            self.bus.publish(
                channels::SYSTEM,
                &BusEvent::new(
                    "alert:resolved",
                    serde_json::json!({ "alert_id": alert_id }),
                ),
            );
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::{ProxyError, TrafficPoint};

    fn engine_fixture() -> (AlertEngine, Arc<TrafficAnalytics>, Arc<Store>) {
        let analytics = Arc::new(TrafficAnalytics::new(1000, 1000));
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new());
        let notifier = Arc::new(Notifier::new(vec![]));
        let engine = AlertEngine::new(
            Arc::clone(&analytics),
            Arc::clone(&store),
            bus,
            notifier,
        );
        (engine, analytics, store)
    }

    fn config(threshold: f64, min_requests: u64) -> ErrorAlertConfig {
        ErrorAlertConfig {
            id: "cfg-1".to_string(),
            name: "api errors".to_string(),
            rule_id: Some("r1".to_string()),
            kind_filter: None,
            status_code_filter: None,
            threshold,
            window_secs: 300,
            min_requests,
            enabled: true,
            channels: vec![],
        }
    }

    fn record_traffic(analytics: &TrafficAnalytics, rule_id: &str, total: usize, failing: usize) {
        for i in 0..total {
            let status = if i < failing { 500 } else { 200 };
            analytics.record_traffic(
                rule_id,
                TrafficPoint {
                    timestamp: Utc::now(),
                    method: "GET".to_string(),
                    path: "/api".to_string(),
                    status,
                    bytes_in: 0,
                    bytes_out: 100,
                    response_time_ms: 5.0,
                    client_ip: "10.0.0.1".to_string(),
                    user_agent: "test".to_string(),
                },
            );
            if status == 500 {
                let mut err = ProxyError::new(rule_id, ErrorKind::ServerError, "500");
                err.status_code = Some(500);
                analytics.record_error(err);
            }
        }
    }

    #[tokio::test]
    async fn test_firing_creates_single_active_alert() {
        let (mut engine, analytics, store) = engine_fixture();
        store.save_alert_config(&config(0.05, 10)).unwrap();
        record_traffic(&analytics, "r1", 100, 10);

        let result = engine.evaluate_all().await.unwrap();
        assert_eq!(result.fired, 1);

        let alert = store.get_open_alert_for_config("cfg-1").unwrap().unwrap();
        assert_eq!(alert.status, AlertStatus::Active);
        assert_eq!(alert.request_count, 100);
        assert_eq!(alert.error_count, 10);

        // A second evaluation does not create a duplicate
        engine.evaluate_all().await.unwrap();
        assert_eq!(store.list_alerts(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_below_min_requests_is_no_data() {
        let (mut engine, analytics, store) = engine_fixture();
        store.save_alert_config(&config(0.05, 50)).unwrap();
        record_traffic(&analytics, "r1", 10, 10);

        let result = engine.evaluate_all().await.unwrap();
        assert_eq!(result.no_data, 1);
        assert!(store.get_open_alert_for_config("cfg-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_below_threshold_does_not_fire() {
        let (mut engine, analytics, store) = engine_fixture();
        store.save_alert_config(&config(0.5, 10)).unwrap();
        record_traffic(&analytics, "r1", 100, 5);

        let result = engine.evaluate_all().await.unwrap();
        assert_eq!(result.below, 1);
        assert!(store.get_open_alert_for_config("cfg-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_auto_resolve_waits_full_window() {
        let (mut engine, analytics, store) = engine_fixture();
        let mut cfg = config(0.05, 10);
        cfg.window_secs = 1;
        store.save_alert_config(&cfg).unwrap();

        record_traffic(&analytics, "r1", 100, 10);
        engine.evaluate_all().await.unwrap();
        assert!(store.get_open_alert_for_config("cfg-1").unwrap().is_some());

        // Let the failing traffic age out of the window, then observe a
        // below-threshold pass; the alert stays open until a full window
        // has elapsed below threshold
        tokio::time::sleep(Duration::from_millis(1200)).await;
        record_traffic(&analytics, "r1", 100, 0);
        engine.evaluate_all().await.unwrap();
        assert!(store.get_open_alert_for_config("cfg-1").unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(1200)).await;
        record_traffic(&analytics, "r1", 100, 0);
        engine.evaluate_all().await.unwrap();
        assert!(store.get_open_alert_for_config("cfg-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_kind_filter_limits_counted_errors() {
        let (mut engine, analytics, store) = engine_fixture();
        let mut cfg = config(0.08, 10);
        cfg.kind_filter = Some(ErrorKind::BadGateway);
        store.save_alert_config(&cfg).unwrap();

        // 10 server errors but no bad gateways: the filtered rate is zero
        record_traffic(&analytics, "r1", 100, 10);
        let result = engine.evaluate_all().await.unwrap();
        assert_eq!(result.below, 1);

        for _ in 0..10 {
            let mut err = ProxyError::new("r1", ErrorKind::BadGateway, "502");
            err.status_code = Some(502);
            analytics.record_error(err);
        }
        let result = engine.evaluate_all().await.unwrap();
        assert_eq!(result.fired, 1);
    }

    #[tokio::test]
    async fn test_explicit_acknowledge_and_resolve() {
        let (mut engine, analytics, store) = engine_fixture();
        store.save_alert_config(&config(0.05, 10)).unwrap();
        record_traffic(&analytics, "r1", 100, 10);
        engine.evaluate_all().await.unwrap();

        let alert = store.get_open_alert_for_config("cfg-1").unwrap().unwrap();

        assert!(engine.acknowledge(&alert.id).unwrap());
        let alert = store.get_alert(&alert.id).unwrap().unwrap();
        assert_eq!(alert.status, AlertStatus::Acknowledged);

        assert!(engine.resolve(&alert.id).unwrap());
        let alert = store.get_alert(&alert.id).unwrap().unwrap();
        assert_eq!(alert.status, AlertStatus::Resolved);
        assert!(alert.resolved_at.is_some() || alert.status == AlertStatus::Resolved);

        assert!(!engine.resolve(&alert.id).unwrap());
    }
}
