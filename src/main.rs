use rulegate::alerting::AlertEngine;
use rulegate::analytics::{SummaryEmitter, TrafficAnalytics};
use rulegate::applier::{ApplyWorker, ConfigApplier, ProxyCommands};
use rulegate::compiler;
use rulegate::config::Settings;
use rulegate::containers::{DockerRuntime, StatsWatcher};
use rulegate::events::EventBus;
use rulegate::notifications::Notifier;
use rulegate::registry::RuleRegistry;
use rulegate::store::Store;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rulegate=info".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("rulegate.toml"));

    let settings = if config_path.exists() {
        let settings = Settings::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        settings
    } else {
        info!(path = %config_path.display(), "No config file, using defaults");
        Settings::default()
    };

    // Open the store
    let store_path = settings
        .store_path
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs_next::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("rulegate")
                .join("rulegate.db")
        });
    let store = Arc::new(Store::open(&store_path)?);

    // Shared infrastructure
    let bus = Arc::new(EventBus::new());
    let analytics = Arc::new(TrafficAnalytics::new(
        settings.analytics.max_points,
        settings.analytics.max_errors,
    ));
    let notifier = Arc::new(Notifier::new(settings.notification_channels.clone()));

    // A deleted rule releases its live analytics window
    {
        let analytics = Arc::clone(&analytics);
        bus.subscribe(
            "core:analytics",
            "proxy:*",
            Arc::new(move |_, event| {
                if event.event == "rule:deleted" {
                    if let Some(rule_id) = event.data.get("id").and_then(|v| v.as_str()) {
                        analytics.release_rule(rule_id);
                    }
                }
                Ok(())
            }),
        );
    }

    // Registry and applier
    let (stale_tx, stale_rx) = mpsc::unbounded_channel();
    let registry = Arc::new(RuleRegistry::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        stale_tx,
    ));
    let loaded = registry.load_persisted().await?;

    let applier = Arc::new(ConfigApplier::new(
        PathBuf::from(&settings.proxy.active_config_path),
        PathBuf::from(&settings.proxy.staging_dir),
        ProxyCommands {
            test_command: settings.proxy.test_command.clone(),
            reload_command: settings.proxy.reload_command.clone(),
        },
        settings.proxy.command_timeout(),
        Arc::clone(&bus),
        Arc::clone(&store),
    ));

    // Shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Bring the proxy up on the persisted rules before serving mutations
    if loaded > 0 {
        let rules = registry.list().await;
        match compiler::compile(&rules) {
            Ok(config_text) => match applier.apply(&config_text, vec![]).await {
                Ok(outcome) => {
                    info!(status = outcome.status.as_str(), "Startup apply finished")
                }
                Err(e) => warn!(error = %e, "Startup apply could not run"),
            },
            Err(e) => error!(error = %e, "Persisted rules failed to compile"),
        }
    }

    // Apply worker: debounced compile+apply cycles
    let worker = ApplyWorker::new(
        Arc::clone(&registry),
        Arc::clone(&applier),
        stale_rx,
        settings.proxy.debounce(),
        shutdown_rx.clone(),
    );
    let worker_handle = tokio::spawn(worker.run());

    // Alert engine
    let engine = AlertEngine::new(
        Arc::clone(&analytics),
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&notifier),
    );
    let alert_handle = tokio::spawn(engine.run(settings.alerting.tick(), shutdown_rx.clone()));

    // Analytics summary emitter
    let emitter = SummaryEmitter::new(
        Arc::clone(&analytics),
        Arc::clone(&bus),
        settings.analytics.emit_interval(),
        shutdown_rx.clone(),
    );
    let emitter_handle = tokio::spawn(emitter.run());

    // Container stats watcher; the engine runs fine without a runtime
    let watcher_handle = if settings.containers.enabled {
        match DockerRuntime::new(settings.containers.docker_host.as_deref()).await {
            Ok(runtime) => {
                let watcher = StatsWatcher::new(
                    Arc::new(runtime),
                    Arc::clone(&bus),
                    settings.containers.stats_interval(),
                    shutdown_rx.clone(),
                );
                Some(tokio::spawn(watcher.run()))
            }
            Err(e) => {
                warn!(error = %e, "Container runtime unavailable, stats disabled");
                None
            }
        }
    } else {
        None
    };

    info!(rules = loaded, "Rulegate started");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = worker_handle.await;
    let _ = alert_handle.await;
    let _ = emitter_handle.await;
    if let Some(handle) = watcher_handle {
        let _ = handle.await;
    }

    info!("Rulegate stopped");
    Ok(())
}
