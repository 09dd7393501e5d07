//! End-to-end tests for the rule engine pipeline:
//! registry mutation -> debounced compile -> validate -> swap -> reload,
//! with stub shell commands standing in for the nginx binary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rulegate::applier::{ApplyStatus, ApplyWorker, ConfigApplier, ProxyCommands};
use rulegate::events::{BusEvent, EventBus};
use rulegate::registry::RuleRegistry;
use rulegate::rule::{Protocol, RuleDraft, RulePatch};
use rulegate::store::Store;
use tokio::sync::{mpsc, watch};

struct Harness {
    registry: Arc<RuleRegistry>,
    applier: Arc<ConfigApplier>,
    bus: Arc<EventBus>,
    store: Arc<Store>,
    active_path: PathBuf,
    shutdown_tx: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

/// Wire registry, applier and worker together the way the binary does,
/// with a config test that rejects any candidate containing
/// "forbidden_directive"
fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let active_path = dir.path().join("active.conf");

    let store = Arc::new(Store::open_in_memory().unwrap());
    let bus = Arc::new(EventBus::new());
    let (stale_tx, stale_rx) = mpsc::unbounded_channel();

    let registry = Arc::new(RuleRegistry::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        stale_tx,
    ));

    let applier = Arc::new(ConfigApplier::new(
        active_path.clone(),
        dir.path().join("staging"),
        ProxyCommands {
            test_command: "sh -c \"! grep -q forbidden_directive {config}\"".to_string(),
            reload_command: "sh -c \"exit 0\"".to_string(),
        },
        Duration::from_secs(5),
        Arc::clone(&bus),
        Arc::clone(&store),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = ApplyWorker::new(
        Arc::clone(&registry),
        Arc::clone(&applier),
        stale_rx,
        Duration::from_millis(150),
        shutdown_rx,
    );
    tokio::spawn(worker.run());

    Harness {
        registry,
        applier,
        bus,
        store,
        active_path,
        shutdown_tx,
        _dir: dir,
    }
}

fn draft(host: &str, path: &str, port: u16) -> RuleDraft {
    RuleDraft {
        name: format!("{}{}", host, path),
        source_host: host.to_string(),
        source_path: path.to_string(),
        target_container: "app-1".to_string(),
        target_port: port,
        protocol: Protocol::Http,
        ssl_enabled: false,
        ssl_cert_path: None,
        ssl_key_path: None,
        request_headers: HashMap::new(),
        response_headers: HashMap::new(),
        health_check: None,
        load_balancing: None,
        advanced: None,
        custom_config: None,
        enabled: true,
    }
}

/// Wait until the active config satisfies a predicate or time runs out
async fn wait_for_active<F>(path: &Path, timeout: Duration, predicate: F) -> bool
where
    F: Fn(&str) -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if let Ok(content) = std::fs::read_to_string(path) {
            if predicate(&content) {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn test_rule_mutation_lands_in_active_config() {
    let h = harness();

    h.registry
        .create(draft("app.example.com", "/api", 8080))
        .await
        .unwrap();

    let landed = wait_for_active(&h.active_path, Duration::from_secs(3), |c| {
        c.contains("server_name app.example.com;")
            && c.contains("location /api {")
            && c.contains("proxy_pass http://app-1:8080;")
    })
    .await;
    assert!(landed, "routing block never reached the active config");

    let outcome = h.applier.last_outcome().await.unwrap();
    assert_eq!(outcome.status, ApplyStatus::Applied);

    let _ = h.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_rapid_edits_coalesce_into_one_apply() {
    let h = harness();

    let applied_count = Arc::new(Mutex::new(0usize));
    let count = Arc::clone(&applied_count);
    h.bus.subscribe(
        "test-observer",
        "system",
        Arc::new(move |_, event: &BusEvent| {
            if event.event == "proxy:applied" {
                *count.lock() += 1;
            }
            Ok(())
        }),
    );

    for i in 0..5 {
        h.registry
            .create(draft(&format!("app-{}.example.com", i), "/", 8080))
            .await
            .unwrap();
    }

    let landed = wait_for_active(&h.active_path, Duration::from_secs(3), |c| {
        (0..5).all(|i| c.contains(&format!("app-{}.example.com", i)))
    })
    .await;
    assert!(landed, "not all rules reached the active config");

    // Let any stray debounce window close before counting
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(*applied_count.lock(), 1, "edits were not coalesced");

    let _ = h.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_bad_custom_config_rolls_back_and_reports_suspect() {
    let h = harness();

    let rule = h
        .registry
        .create(draft("app.example.com", "/", 8080))
        .await
        .unwrap();

    assert!(
        wait_for_active(&h.active_path, Duration::from_secs(3), |c| {
            c.contains("app.example.com")
        })
        .await
    );
    let known_good = std::fs::read(&h.active_path).unwrap();

    let failures: Arc<Mutex<Vec<BusEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&failures);
    h.bus.subscribe(
        "test-observer",
        &format!("proxy:{}", rule.id),
        Arc::new(move |_, event: &BusEvent| {
            if event.event == "proxy:apply-failed" {
                seen.lock().push(event.clone());
            }
            Ok(())
        }),
    );

    // The escape hatch is only validated by the proxy's own config test
    let patch = RulePatch {
        custom_config: Some(Some("forbidden_directive on;".to_string())),
        ..Default::default()
    };
    h.registry.update(&rule.id, patch).await.unwrap();

    let start = std::time::Instant::now();
    while failures.lock().is_empty() && start.elapsed() < Duration::from_secs(3) {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let failures = failures.lock();
    assert_eq!(failures.len(), 1, "expected exactly one apply failure event");
    let suspects = failures[0].data["suspect_rules"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect::<Vec<_>>();
    assert!(suspects.contains(&rule.id));

    // Previous config still active, byte for byte
    assert_eq!(std::fs::read(&h.active_path).unwrap(), known_good);

    let outcome = h.applier.last_outcome().await.unwrap();
    assert_eq!(outcome.status, ApplyStatus::RolledBack);

    let _ = h.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_toggle_removes_and_restores_directives() {
    let h = harness();

    h.registry
        .create(draft("keep.example.com", "/", 8080))
        .await
        .unwrap();
    let toggled = h
        .registry
        .create(draft("toggle.example.com", "/", 9090))
        .await
        .unwrap();

    assert!(
        wait_for_active(&h.active_path, Duration::from_secs(3), |c| {
            c.contains("keep.example.com") && c.contains("toggle.example.com")
        })
        .await
    );
    let with_both = std::fs::read_to_string(&h.active_path).unwrap();

    h.registry.toggle(&toggled.id).await.unwrap();
    assert!(
        wait_for_active(&h.active_path, Duration::from_secs(3), |c| {
            c.contains("keep.example.com") && !c.contains("toggle.example.com")
        })
        .await,
        "disabled rule still present in active config"
    );

    h.registry.toggle(&toggled.id).await.unwrap();
    assert!(
        wait_for_active(&h.active_path, Duration::from_secs(3), |c| {
            c == with_both
        })
        .await,
        "re-enabling did not restore identical directives"
    );

    let _ = h.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_successful_applies_are_backed_up() {
    let h = harness();

    h.registry
        .create(draft("app.example.com", "/", 8080))
        .await
        .unwrap();

    assert!(
        wait_for_active(&h.active_path, Duration::from_secs(3), |c| {
            c.contains("app.example.com")
        })
        .await
    );

    let backup = h.store.latest_config_backup().unwrap().unwrap();
    let active = std::fs::read_to_string(&h.active_path).unwrap();
    assert_eq!(backup, active);

    let _ = h.shutdown_tx.send(true);
}
