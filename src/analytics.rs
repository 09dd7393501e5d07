//! Rolling traffic and error analytics per rule
//!
//! Ingests structured telemetry points or raw access-log lines and keeps a
//! capacity-bounded window of recent traffic and errors per rule id.
//! Summaries, time series and error rates are computed on demand from the
//! window; a periodic emitter publishes per-rule summaries on the event
//! bus. Analytics is the only writer to these windows.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{channels, BusEvent, EventBus};

/// Classified proxy error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectionRefused,
    Timeout,
    SslError,
    BadGateway,
    GatewayTimeout,
    ClientError,
    ServerError,
    RateLimitExceeded,
    ConfigurationError,
    Unknown,
}

impl ErrorKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "connection_refused" => Some(Self::ConnectionRefused),
            "timeout" => Some(Self::Timeout),
            "ssl_error" => Some(Self::SslError),
            "bad_gateway" => Some(Self::BadGateway),
            "gateway_timeout" => Some(Self::GatewayTimeout),
            "client_error" => Some(Self::ClientError),
            "server_error" => Some(Self::ServerError),
            "rate_limit_exceeded" => Some(Self::RateLimitExceeded),
            "configuration_error" => Some(Self::ConfigurationError),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionRefused => "connection_refused",
            Self::Timeout => "timeout",
            Self::SslError => "ssl_error",
            Self::BadGateway => "bad_gateway",
            Self::GatewayTimeout => "gateway_timeout",
            Self::ClientError => "client_error",
            Self::ServerError => "server_error",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::ConfigurationError => "configuration_error",
            Self::Unknown => "unknown",
        }
    }
}

/// Map an HTTP status to an error kind; statuses below 400 are not errors
pub fn classify_status(status: u16) -> Option<ErrorKind> {
    match status {
        429 => Some(ErrorKind::RateLimitExceeded),
        502 => Some(ErrorKind::BadGateway),
        504 => Some(ErrorKind::GatewayTimeout),
        400..=499 => Some(ErrorKind::ClientError),
        500..=599 => Some(ErrorKind::ServerError),
        _ => None,
    }
}

/// One recorded proxy error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyError {
    pub id: String,
    pub rule_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: ErrorKind,
    pub status_code: Option<u16>,
    pub message: String,
    pub client_ip: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    #[serde(default)]
    pub resolved: bool,
    pub resolution_note: Option<String>,
}

impl ProxyError {
    pub fn new(rule_id: &str, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            rule_id: rule_id.to_string(),
            timestamp: Utc::now(),
            kind,
            status_code: None,
            message: message.into(),
            client_ip: None,
            method: None,
            path: None,
            resolved: false,
            resolution_note: None,
        }
    }
}

/// One observed request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficPoint {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub response_time_ms: f64,
    pub client_ip: String,
    pub user_agent: String,
}

/// Named lookback periods for summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    LastHour,
    LastDay,
    LastWeek,
}

impl Period {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "last_hour" => Some(Self::LastHour),
            "last_day" => Some(Self::LastDay),
            "last_week" => Some(Self::LastWeek),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LastHour => "last_hour",
            Self::LastDay => "last_day",
            Self::LastWeek => "last_week",
        }
    }

    pub fn lookback(&self) -> Duration {
        match self {
            Self::LastHour => Duration::hours(1),
            Self::LastDay => Duration::days(1),
            Self::LastWeek => Duration::weeks(1),
        }
    }
}

/// Point-in-time aggregate over a set of traffic points
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrafficData {
    pub request_count: u64,
    pub response_count: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub avg_response_time_ms: f64,
    pub status_codes: HashMap<u16, u64>,
    pub methods: HashMap<String, u64>,
    pub client_ips: HashMap<String, u64>,
    pub user_agents: HashMap<String, u64>,
    pub paths: HashMap<String, u64>,
}

/// Aggregate rolled up over a named period, with top-N breakdowns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficSummary {
    pub rule_id: String,
    pub period: Period,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub data: TrafficData,
    pub p50_response_time_ms: f64,
    pub p95_response_time_ms: f64,
    pub p99_response_time_ms: f64,
    pub top_paths: Vec<(String, u64)>,
    pub top_client_ips: Vec<(String, u64)>,
    pub top_user_agents: Vec<(String, u64)>,
}

/// Fixed-interval buckets between a start and end time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficTimeSeries {
    pub rule_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub interval_secs: u64,
    pub buckets: Vec<TrafficData>,
}

/// Error-rate aggregate over a window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub rule_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_requests: u64,
    pub total_errors: u64,
    /// errors / total_requests; 0.0 when the window saw no requests
    pub error_rate: f64,
    pub by_kind: HashMap<ErrorKind, u64>,
    pub by_status: HashMap<u16, u64>,
}

/// How many entries the top-N breakdowns carry
const TOP_N: usize = 10;

struct RuleWindow {
    points: VecDeque<TrafficPoint>,
    errors: VecDeque<ProxyError>,
}

impl RuleWindow {
    fn new() -> Self {
        Self {
            points: VecDeque::new(),
            errors: VecDeque::new(),
        }
    }
}

/// Rolling analytics over all rules
///
/// Windows are kept in a sharded map keyed by rule id; the expected
/// pattern is a single writer per rule, and shard locking keeps concurrent
/// ingestion safe regardless.
pub struct TrafficAnalytics {
    windows: DashMap<String, RuleWindow>,
    max_points: usize,
    max_errors: usize,
}

impl TrafficAnalytics {
    pub fn new(max_points: usize, max_errors: usize) -> Self {
        Self {
            windows: DashMap::new(),
            max_points,
            max_errors,
        }
    }

    /// Record one observed request for a rule
    pub fn record_traffic(&self, rule_id: &str, point: TrafficPoint) {
        let mut window = self
            .windows
            .entry(rule_id.to_string())
            .or_insert_with(RuleWindow::new);

        if window.points.len() >= self.max_points {
            window.points.pop_front();
        }
        window.points.push_back(point);
    }

    /// Record one proxy error
    pub fn record_error(&self, error: ProxyError) {
        let mut window = self
            .windows
            .entry(error.rule_id.clone())
            .or_insert_with(RuleWindow::new);

        if window.errors.len() >= self.max_errors {
            window.errors.pop_front();
        }
        window.errors.push_back(error);
    }

    /// Parse one access-log line (nginx combined format, optionally with a
    /// trailing request time in seconds) and record it
    ///
    /// Statuses of 400 and above also record a classified error.
    pub fn ingest_access_line(&self, rule_id: &str, line: &str) -> Option<TrafficPoint> {
        let point = parse_access_line(line)?;

        if let Some(kind) = classify_status(point.status) {
            let mut error = ProxyError::new(
                rule_id,
                kind,
                format!("{} {} returned {}", point.method, point.path, point.status),
            );
            error.status_code = Some(point.status);
            error.client_ip = Some(point.client_ip.clone());
            error.method = Some(point.method.clone());
            error.path = Some(point.path.clone());
            self.record_error(error);
        }

        self.record_traffic(rule_id, point.clone());
        Some(point)
    }

    /// Aggregate a rule's traffic over a named period
    pub fn summary(&self, rule_id: &str, period: Period) -> TrafficSummary {
        let end = Utc::now();
        let start = end - period.lookback();
        let agg = self.aggregate_window(rule_id, start, end);

        TrafficSummary {
            rule_id: rule_id.to_string(),
            period,
            window_start: start,
            window_end: end,
            data: agg.data,
            p50_response_time_ms: agg.p50,
            p95_response_time_ms: agg.p95,
            p99_response_time_ms: agg.p99,
            top_paths: agg.top_paths,
            top_client_ips: agg.top_client_ips,
            top_user_agents: agg.top_user_agents,
        }
    }

    /// Bucket a rule's traffic into fixed-width intervals, zero-filling
    /// buckets that saw no traffic
    pub fn time_series(
        &self,
        rule_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval_secs: u64,
    ) -> TrafficTimeSeries {
        let mut series = TrafficTimeSeries {
            rule_id: rule_id.to_string(),
            start,
            end,
            interval_secs,
            buckets: Vec::new(),
        };

        if interval_secs == 0 || end <= start {
            return series;
        }

        let span_secs = (end - start).num_seconds() as u64;
        let bucket_count = span_secs.div_ceil(interval_secs) as usize;
        series.buckets = vec![TrafficData::default(); bucket_count];

        // Per-bucket running sums for the weighted response-time average
        let mut time_sums = vec![0.0f64; bucket_count];

        if let Some(window) = self.windows.get(rule_id) {
            for point in &window.points {
                if point.timestamp < start || point.timestamp >= end {
                    continue;
                }
                let offset = (point.timestamp - start).num_seconds() as u64;
                let idx = (offset / interval_secs) as usize;
                if idx >= bucket_count {
                    continue;
                }
                accumulate(&mut series.buckets[idx], point);
                time_sums[idx] += point.response_time_ms;
            }
        }

        for (bucket, sum) in series.buckets.iter_mut().zip(time_sums) {
            if bucket.request_count > 0 {
                bucket.avg_response_time_ms = sum / bucket.request_count as f64;
            }
        }

        series
    }

    /// Error rate and breakdowns for a rule over a named period
    pub fn error_summary(&self, rule_id: &str, period: Period) -> ErrorSummary {
        let end = Utc::now();
        let start = end - period.lookback();
        self.error_summary_window(rule_id, start, end)
    }

    /// Error rate and breakdowns for an explicit window
    pub fn error_summary_window(
        &self,
        rule_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ErrorSummary {
        let mut summary = ErrorSummary {
            rule_id: rule_id.to_string(),
            window_start: start,
            window_end: end,
            total_requests: 0,
            total_errors: 0,
            error_rate: 0.0,
            by_kind: HashMap::new(),
            by_status: HashMap::new(),
        };

        if let Some(window) = self.windows.get(rule_id) {
            summary.total_requests = window
                .points
                .iter()
                .filter(|p| p.timestamp >= start && p.timestamp < end)
                .count() as u64;

            for error in &window.errors {
                if error.timestamp < start || error.timestamp >= end {
                    continue;
                }
                summary.total_errors += 1;
                *summary.by_kind.entry(error.kind).or_insert(0) += 1;
                if let Some(status) = error.status_code {
                    *summary.by_status.entry(status).or_insert(0) += 1;
                }
            }
        }

        if summary.total_requests > 0 {
            summary.error_rate = summary.total_errors as f64 / summary.total_requests as f64;
        }

        summary
    }

    /// Recent errors for a rule, newest first
    pub fn recent_errors(&self, rule_id: &str, limit: usize) -> Vec<ProxyError> {
        self.windows
            .get(rule_id)
            .map(|w| w.errors.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Rule ids with live windows
    pub fn active_rule_ids(&self) -> Vec<String> {
        self.windows.iter().map(|e| e.key().clone()).collect()
    }

    /// Drop the live window for a deleted rule
    ///
    /// Historical rows in the store are left alone.
    pub fn release_rule(&self, rule_id: &str) {
        if self.windows.remove(rule_id).is_some() {
            info!(rule_id, "Released analytics window");
        }
    }

    fn aggregate_window(&self, rule_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> WindowAggregate {
        let mut data = TrafficData::default();
        let mut response_times: Vec<f64> = Vec::new();

        // first-seen order breaks frequency ties
        let mut path_order: HashMap<String, usize> = HashMap::new();
        let mut ip_order: HashMap<String, usize> = HashMap::new();
        let mut ua_order: HashMap<String, usize> = HashMap::new();

        if let Some(window) = self.windows.get(rule_id) {
            for (idx, point) in window.points.iter().enumerate() {
                if point.timestamp < start || point.timestamp >= end {
                    continue;
                }
                accumulate(&mut data, point);
                response_times.push(point.response_time_ms);

                path_order.entry(point.path.clone()).or_insert(idx);
                ip_order.entry(point.client_ip.clone()).or_insert(idx);
                ua_order.entry(point.user_agent.clone()).or_insert(idx);
            }
        }

        if data.request_count > 0 {
            let sum: f64 = response_times.iter().sum();
            data.avg_response_time_ms = sum / data.request_count as f64;
        }

        response_times.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        WindowAggregate {
            p50: percentile(&response_times, 50.0),
            p95: percentile(&response_times, 95.0),
            p99: percentile(&response_times, 99.0),
            top_paths: top_n(&data.paths, &path_order),
            top_client_ips: top_n(&data.client_ips, &ip_order),
            top_user_agents: top_n(&data.user_agents, &ua_order),
            data,
        }
    }
}

struct WindowAggregate {
    data: TrafficData,
    p50: f64,
    p95: f64,
    p99: f64,
    top_paths: Vec<(String, u64)>,
    top_client_ips: Vec<(String, u64)>,
    top_user_agents: Vec<(String, u64)>,
}

/// Nearest-rank percentile over pre-sorted values; 0.0 when empty
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn accumulate(data: &mut TrafficData, point: &TrafficPoint) {
    data.request_count += 1;
    data.response_count += 1;
    data.bytes_in += point.bytes_in;
    data.bytes_out += point.bytes_out;
    *data.status_codes.entry(point.status).or_insert(0) += 1;
    *data.methods.entry(point.method.clone()).or_insert(0) += 1;
    *data.client_ips.entry(point.client_ip.clone()).or_insert(0) += 1;
    *data.user_agents.entry(point.user_agent.clone()).or_insert(0) += 1;
    *data.paths.entry(point.path.clone()).or_insert(0) += 1;
}

/// Top entries by frequency, ties broken by first appearance
fn top_n(counts: &HashMap<String, u64>, first_seen: &HashMap<String, usize>) -> Vec<(String, u64)> {
    let mut entries: Vec<(String, u64)> = counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
    entries.sort_by(|a, b| {
        b.1.cmp(&a.1).then_with(|| {
            let fa = first_seen.get(&a.0).copied().unwrap_or(usize::MAX);
            let fb = first_seen.get(&b.0).copied().unwrap_or(usize::MAX);
            fa.cmp(&fb)
        })
    });
    entries.truncate(TOP_N);
    entries
}

/// Parse an nginx combined-format access log line
///
/// `$remote_addr - $remote_user [$time_local] "$request" $status
/// $body_bytes_sent "$http_referer" "$http_user_agent"`, optionally
/// followed by the request time in seconds. Returns `None` for lines that
/// do not fit the shape.
pub fn parse_access_line(line: &str) -> Option<TrafficPoint> {
    let line = line.trim();

    let (client_ip, rest) = line.split_once(' ')?;

    let bracket_start = rest.find('[')?;
    let bracket_end = rest.find(']')?;
    let time_local = &rest[bracket_start + 1..bracket_end];
    let timestamp = DateTime::parse_from_str(time_local, "%d/%b/%Y:%H:%M:%S %z")
        .ok()?
        .with_timezone(&Utc);

    let rest = &rest[bracket_end + 1..];

    let req_start = rest.find('"')?;
    let req_end = rest[req_start + 1..].find('"')? + req_start + 1;
    let request = &rest[req_start + 1..req_end];
    let mut req_parts = request.split(' ');
    let method = req_parts.next()?.to_string();
    let path = req_parts.next()?.to_string();

    let rest = rest[req_end + 1..].trim_start();
    let mut fields = rest.split(' ');
    let status: u16 = fields.next()?.parse().ok()?;
    let bytes_out: u64 = fields.next()?.parse().unwrap_or(0);

    let rest = rest[rest.find('"')?..].to_string();
    let mut quoted = rest.split('"').filter(|s| !s.trim().is_empty() && *s != " ");
    let _referer = quoted.next()?;
    let user_agent = quoted.next().unwrap_or("-").to_string();

    // Optional trailing request time in seconds
    let response_time_ms = rest
        .rsplit('"')
        .next()
        .and_then(|tail| tail.trim().parse::<f64>().ok())
        .map(|secs| secs * 1000.0)
        .unwrap_or(0.0);

    Some(TrafficPoint {
        timestamp,
        method,
        path,
        status,
        bytes_in: 0,
        bytes_out,
        response_time_ms,
        client_ip: client_ip.to_string(),
        user_agent,
    })
}

/// Periodically publishes per-rule traffic summaries on the event bus
pub struct SummaryEmitter {
    analytics: Arc<TrafficAnalytics>,
    bus: Arc<EventBus>,
    interval: std::time::Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl SummaryEmitter {
    pub fn new(
        analytics: Arc<TrafficAnalytics>,
        bus: Arc<EventBus>,
        interval: std::time::Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            analytics,
            bus,
            interval,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs(), "Summary emitter started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.emit_all();
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Summary emitter shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn emit_all(&self) {
        for rule_id in self.analytics.active_rule_ids() {
            let summary = self.analytics.summary(&rule_id, Period::LastHour);
            match serde_json::to_value(&summary) {
                Ok(data) => {
                    debug!(rule_id, requests = summary.data.request_count, "Emitting summary");
                    self.bus.publish(
                        &channels::proxy_analytics(&rule_id),
                        &BusEvent::new("traffic:summary", data),
                    );
                }
                Err(e) => warn!(rule_id, error = %e, "Failed to serialize summary"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(status: u16, path: &str, ip: &str) -> TrafficPoint {
        TrafficPoint {
            timestamp: Utc::now(),
            method: "GET".to_string(),
            path: path.to_string(),
            status,
            bytes_in: 128,
            bytes_out: 1024,
            response_time_ms: 12.0,
            client_ip: ip.to_string(),
            user_agent: "curl/8.0".to_string(),
        }
    }

    #[test]
    fn test_error_rate_zero_without_requests() {
        let analytics = TrafficAnalytics::new(100, 100);
        let summary = analytics.error_summary("missing", Period::LastHour);
        assert_eq!(summary.total_requests, 0);
        assert_eq!(summary.error_rate, 0.0);
        assert!(summary.error_rate.is_finite());
    }

    #[test]
    fn test_error_rate_from_recorded_points() {
        let analytics = TrafficAnalytics::new(200, 200);

        for i in 0..100 {
            let status = if i < 5 { 500 } else { 200 };
            analytics.record_traffic("r1", point(status, "/api", "10.0.0.1"));
            if status == 500 {
                let mut err = ProxyError::new("r1", ErrorKind::ServerError, "upstream 500");
                err.status_code = Some(500);
                analytics.record_error(err);
            }
        }

        let summary = analytics.error_summary("r1", Period::LastHour);
        assert_eq!(summary.total_requests, 100);
        assert_eq!(summary.total_errors, 5);
        assert!((summary.error_rate - 0.05).abs() < 1e-9);
        assert_eq!(summary.by_kind.get(&ErrorKind::ServerError), Some(&5));
        assert_eq!(summary.by_status.get(&500), Some(&5));
    }

    #[test]
    fn test_summary_top_n_tie_break_first_seen() {
        let analytics = TrafficAnalytics::new(100, 100);
        analytics.record_traffic("r1", point(200, "/beta", "10.0.0.1"));
        analytics.record_traffic("r1", point(200, "/alpha", "10.0.0.1"));

        let summary = analytics.summary("r1", Period::LastHour);
        // Equal counts: /beta was seen first and wins the tie
        assert_eq!(summary.top_paths[0].0, "/beta");
        assert_eq!(summary.top_paths[1].0, "/alpha");
    }

    #[test]
    fn test_summary_counts_and_average() {
        let analytics = TrafficAnalytics::new(100, 100);
        let mut p1 = point(200, "/", "10.0.0.1");
        p1.response_time_ms = 10.0;
        let mut p2 = point(404, "/", "10.0.0.2");
        p2.response_time_ms = 30.0;
        analytics.record_traffic("r1", p1);
        analytics.record_traffic("r1", p2);

        let summary = analytics.summary("r1", Period::LastHour);
        assert_eq!(summary.data.request_count, 2);
        assert_eq!(summary.data.bytes_out, 2048);
        assert!((summary.data.avg_response_time_ms - 20.0).abs() < 1e-9);
        assert_eq!(summary.data.status_codes.get(&404), Some(&1));
    }

    #[test]
    fn test_percentiles() {
        assert_eq!(percentile(&[], 95.0), 0.0);
        assert_eq!(percentile(&[10.0], 50.0), 10.0);

        let times: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        assert_eq!(percentile(&times, 50.0), 50.0);
        assert_eq!(percentile(&times, 95.0), 95.0);
        assert_eq!(percentile(&times, 99.0), 99.0);
    }

    #[test]
    fn test_summary_percentiles_from_points() {
        let analytics = TrafficAnalytics::new(200, 200);
        for i in 1..=100 {
            let mut p = point(200, "/", "10.0.0.1");
            p.response_time_ms = i as f64;
            analytics.record_traffic("r1", p);
        }

        let summary = analytics.summary("r1", Period::LastHour);
        assert_eq!(summary.p50_response_time_ms, 50.0);
        assert_eq!(summary.p95_response_time_ms, 95.0);
        assert_eq!(summary.p99_response_time_ms, 99.0);
    }

    #[test]
    fn test_window_capacity_bounded() {
        let analytics = TrafficAnalytics::new(10, 10);
        for _ in 0..25 {
            analytics.record_traffic("r1", point(200, "/", "10.0.0.1"));
        }
        let summary = analytics.summary("r1", Period::LastHour);
        assert_eq!(summary.data.request_count, 10);
    }

    #[test]
    fn test_time_series_zero_fills() {
        let analytics = TrafficAnalytics::new(100, 100);
        let now = Utc::now();

        let mut p = point(200, "/", "10.0.0.1");
        p.timestamp = now - Duration::seconds(30);
        analytics.record_traffic("r1", p);

        let series = analytics.time_series("r1", now - Duration::seconds(120), now, 30);
        assert_eq!(series.buckets.len(), 4);

        let total: u64 = series.buckets.iter().map(|b| b.request_count).sum();
        assert_eq!(total, 1);
        // The point landed in the second-to-last bucket
        assert_eq!(series.buckets[3].request_count, 1);
        assert_eq!(series.buckets[0].request_count, 0);
    }

    #[test]
    fn test_time_series_degenerate_inputs() {
        let analytics = TrafficAnalytics::new(100, 100);
        let now = Utc::now();

        assert!(analytics
            .time_series("r1", now, now - Duration::seconds(60), 30)
            .buckets
            .is_empty());
        assert!(analytics
            .time_series("r1", now - Duration::seconds(60), now, 0)
            .buckets
            .is_empty());
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(200), None);
        assert_eq!(classify_status(301), None);
        assert_eq!(classify_status(404), Some(ErrorKind::ClientError));
        assert_eq!(classify_status(429), Some(ErrorKind::RateLimitExceeded));
        assert_eq!(classify_status(500), Some(ErrorKind::ServerError));
        assert_eq!(classify_status(502), Some(ErrorKind::BadGateway));
        assert_eq!(classify_status(504), Some(ErrorKind::GatewayTimeout));
    }

    #[test]
    fn test_parse_access_line_combined() {
        let line = r#"203.0.113.7 - alice [07/Aug/2026:10:15:32 +0000] "GET /api/users?page=2 HTTP/1.1" 200 5321 "https://app.example.com/" "Mozilla/5.0" 0.042"#;
        let point = parse_access_line(line).expect("line should parse");

        assert_eq!(point.client_ip, "203.0.113.7");
        assert_eq!(point.method, "GET");
        assert_eq!(point.path, "/api/users?page=2");
        assert_eq!(point.status, 200);
        assert_eq!(point.bytes_out, 5321);
        assert_eq!(point.user_agent, "Mozilla/5.0");
        assert!((point.response_time_ms - 42.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_access_line_without_request_time() {
        let line = r#"10.0.0.1 - - [07/Aug/2026:10:15:32 +0000] "POST /login HTTP/1.1" 401 98 "-" "curl/8.0""#;
        let point = parse_access_line(line).expect("line should parse");
        assert_eq!(point.status, 401);
        assert_eq!(point.response_time_ms, 0.0);
    }

    #[test]
    fn test_parse_access_line_garbage() {
        assert!(parse_access_line("not an access log line").is_none());
        assert!(parse_access_line("").is_none());
    }

    #[test]
    fn test_ingest_derives_errors() {
        let analytics = TrafficAnalytics::new(100, 100);
        let line = r#"10.0.0.1 - - [07/Aug/2026:10:15:32 +0000] "GET /api HTTP/1.1" 502 0 "-" "curl/8.0""#;
        analytics.ingest_access_line("r1", line).unwrap();

        let errors = analytics.recent_errors("r1", 10);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::BadGateway);
        assert_eq!(errors[0].status_code, Some(502));
    }

    #[test]
    fn test_release_rule_drops_window() {
        let analytics = TrafficAnalytics::new(100, 100);
        analytics.record_traffic("r1", point(200, "/", "10.0.0.1"));
        assert_eq!(analytics.active_rule_ids(), vec!["r1".to_string()]);

        analytics.release_rule("r1");
        assert!(analytics.active_rule_ids().is_empty());
        assert_eq!(analytics.summary("r1", Period::LastHour).data.request_count, 0);
    }
}
