//! Tests for the telemetry path: access-log ingestion through summaries,
//! error rates and alert evaluation.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rulegate::alerting::{AlertEngine, AlertStatus, ErrorAlertConfig};
use rulegate::analytics::{Period, TrafficAnalytics};
use rulegate::events::{BusEvent, EventBus};
use rulegate::notifications::Notifier;
use rulegate::store::Store;

/// A combined-format access line stamped with the current time
fn access_line(status: u16, path: &str, ip: &str) -> String {
    format!(
        "{} - - [{}] \"GET {} HTTP/1.1\" {} 512 \"-\" \"integration-test\" 0.010",
        ip,
        Utc::now().format("%d/%b/%Y:%H:%M:%S %z"),
        path,
        status
    )
}

#[tokio::test]
async fn test_ingested_lines_produce_expected_error_rate() {
    let analytics = TrafficAnalytics::new(1000, 1000);

    for i in 0..100 {
        let status = if i < 5 { 500 } else { 200 };
        let line = access_line(status, "/api/users", "203.0.113.7");
        analytics.ingest_access_line("r1", &line).unwrap();
    }

    let summary = analytics.error_summary("r1", Period::LastHour);
    assert_eq!(summary.total_requests, 100);
    assert_eq!(summary.total_errors, 5);
    assert!((summary.error_rate - 0.05).abs() < 1e-9);

    let traffic = analytics.summary("r1", Period::LastHour);
    assert_eq!(traffic.data.request_count, 100);
    assert_eq!(traffic.top_paths[0], ("/api/users".to_string(), 100));
    assert_eq!(traffic.data.status_codes.get(&500), Some(&5));
}

#[tokio::test]
async fn test_time_series_buckets_cover_requested_range() {
    let analytics = TrafficAnalytics::new(1000, 1000);

    for _ in 0..10 {
        let line = access_line(200, "/", "10.0.0.1");
        analytics.ingest_access_line("r1", &line).unwrap();
    }

    let end = Utc::now() + chrono::Duration::seconds(1);
    let start = end - chrono::Duration::seconds(60);
    let series = analytics.time_series("r1", start, end, 10);

    assert_eq!(series.buckets.len(), 6); // 60s span at 10s intervals
    let total: u64 = series.buckets.iter().map(|b| b.request_count).sum();
    assert_eq!(total, 10);
}

#[tokio::test]
async fn test_error_stream_drives_alert_lifecycle() {
    let analytics = Arc::new(TrafficAnalytics::new(1000, 1000));
    let store = Arc::new(Store::open_in_memory().unwrap());
    let bus = Arc::new(EventBus::new());
    let notifier = Arc::new(Notifier::new(vec![]));

    let triggered: Arc<Mutex<Vec<BusEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&triggered);
    bus.subscribe(
        "test-observer",
        "system",
        Arc::new(move |_, event: &BusEvent| {
            if event.event == "alert:triggered" {
                seen.lock().push(event.clone());
            }
            Ok(())
        }),
    );

    store
        .save_alert_config(&ErrorAlertConfig {
            id: "cfg-1".to_string(),
            name: "api 5xx rate".to_string(),
            rule_id: Some("r1".to_string()),
            kind_filter: None,
            status_code_filter: None,
            threshold: 0.03,
            window_secs: 300,
            min_requests: 50,
            enabled: true,
            channels: vec![],
        })
        .unwrap();

    let mut engine = AlertEngine::new(
        Arc::clone(&analytics),
        Arc::clone(&store),
        Arc::clone(&bus),
        notifier,
    );

    // Clean traffic first: nothing fires
    for _ in 0..60 {
        analytics
            .ingest_access_line("r1", &access_line(200, "/api", "10.0.0.1"))
            .unwrap();
    }
    engine.evaluate_all().await.unwrap();
    assert!(triggered.lock().is_empty());

    // A burst of 500s pushes the rate over the threshold
    for _ in 0..10 {
        analytics
            .ingest_access_line("r1", &access_line(500, "/api", "10.0.0.1"))
            .unwrap();
    }
    engine.evaluate_all().await.unwrap();

    assert_eq!(triggered.lock().len(), 1);
    let alert = store.get_open_alert_for_config("cfg-1").unwrap().unwrap();
    assert_eq!(alert.status, AlertStatus::Active);
    assert!(alert.error_rate >= 0.03);

    // Still only one open alert after another hot evaluation
    engine.evaluate_all().await.unwrap();
    assert_eq!(store.list_alerts(10).unwrap().len(), 1);

    // Explicit acknowledgement sticks
    assert!(engine.acknowledge(&alert.id).unwrap());
    let alert = store.get_alert(&alert.id).unwrap().unwrap();
    assert_eq!(alert.status, AlertStatus::Acknowledged);
}

#[tokio::test]
async fn test_scoped_config_ignores_other_rules() {
    let analytics = Arc::new(TrafficAnalytics::new(1000, 1000));
    let store = Arc::new(Store::open_in_memory().unwrap());
    let bus = Arc::new(EventBus::new());
    let notifier = Arc::new(Notifier::new(vec![]));

    store
        .save_alert_config(&ErrorAlertConfig {
            id: "cfg-r2".to_string(),
            name: "r2 errors".to_string(),
            rule_id: Some("r2".to_string()),
            kind_filter: None,
            status_code_filter: None,
            threshold: 0.01,
            window_secs: 300,
            min_requests: 1,
            enabled: true,
            channels: vec![],
        })
        .unwrap();

    // All failures land on r1; the config watches r2
    for _ in 0..50 {
        analytics
            .ingest_access_line("r1", &access_line(500, "/api", "10.0.0.1"))
            .unwrap();
    }
    for _ in 0..50 {
        analytics
            .ingest_access_line("r2", &access_line(200, "/", "10.0.0.2"))
            .unwrap();
    }

    let mut engine = AlertEngine::new(analytics, Arc::clone(&store), bus, notifier);
    engine.evaluate_all().await.unwrap();

    assert!(store.get_open_alert_for_config("cfg-r2").unwrap().is_none());
}
