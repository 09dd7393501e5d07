//! Config validation, swap and reload with rollback
//!
//! Applying a configuration is the one global side effect in the system:
//! the proxy process reload is not idempotent when overlapped, so every
//! attempt serializes through a single lock and rapid rule edits are
//! debounced into one compile+apply cycle.
//!
//! Per attempt: PENDING -> VALIDATING -> APPLIED | ROLLED_BACK. The
//! active config file is only replaced after the proxy's own config test
//! passed against a staging copy; a reload failure after the swap restores
//! the prior bytes and re-signals reload. The live proxy is never left
//! without a valid configuration.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::compiler;
use crate::error::ApplyError;
use crate::events::{channels, BusEvent, EventBus};
use crate::registry::RuleRegistry;
use crate::store::Store;

/// How many applied configurations the store keeps for recovery
const BACKUP_KEEP: usize = 20;

/// Terminal and intermediate states of one apply attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    Pending,
    Validating,
    Applied,
    RolledBack,
}

impl ApplyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::Applied => "applied",
            Self::RolledBack => "rolled_back",
        }
    }
}

/// Result of one apply attempt
#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    pub status: ApplyStatus,
    /// Config test or reload output when the attempt rolled back
    pub diagnostics: Option<String>,
    /// Rules changed since the last successful apply
    pub suspect_rules: Vec<String>,
    pub finished_at: DateTime<Utc>,
}

/// External proxy commands, split with shell quoting rules
///
/// `{config}` in the test command is substituted with the staging file
/// path before splitting.
#[derive(Debug, Clone)]
pub struct ProxyCommands {
    pub test_command: String,
    pub reload_command: String,
}

struct CommandResult {
    success: bool,
    output: String,
}

/// Owns the active configuration file and the reload side effect
///
/// Nothing else in the system touches the active path; all swaps go
/// through `apply`, which serializes attempts behind one lock.
pub struct ConfigApplier {
    active_path: PathBuf,
    staging_dir: PathBuf,
    commands: ProxyCommands,
    command_timeout: Duration,
    bus: Arc<EventBus>,
    store: Arc<Store>,
    apply_lock: Mutex<()>,
    last_outcome: RwLock<Option<ApplyOutcome>>,
}

impl ConfigApplier {
    pub fn new(
        active_path: PathBuf,
        staging_dir: PathBuf,
        commands: ProxyCommands,
        command_timeout: Duration,
        bus: Arc<EventBus>,
        store: Arc<Store>,
    ) -> Self {
        Self {
            active_path,
            staging_dir,
            commands,
            command_timeout,
            bus,
            store,
            apply_lock: Mutex::new(()),
            last_outcome: RwLock::new(None),
        }
    }

    /// Validate, swap and reload one candidate configuration
    ///
    /// `suspects` are the rule ids changed since the last successful
    /// apply; they ride along on the failure event when the attempt rolls
    /// back.
    pub async fn apply(
        &self,
        config_text: &str,
        suspects: Vec<String>,
    ) -> Result<ApplyOutcome, ApplyError> {
        let _guard = self.apply_lock.lock().await;

        debug!(bytes = config_text.len(), "Apply attempt starting");

        std::fs::create_dir_all(&self.staging_dir).map_err(ApplyError::Staging)?;
        let staging = tempfile::Builder::new()
            .prefix("candidate-")
            .suffix(".conf")
            .tempfile_in(&self.staging_dir)
            .map_err(ApplyError::Staging)?;
        std::fs::write(staging.path(), config_text).map_err(ApplyError::Staging)?;

        // VALIDATING
        let test = self
            .run_command(&self.commands.test_command, Some(staging.path()))
            .await?;

        if !test.success {
            warn!(diagnostics = %test.output, "Config test failed, keeping active config");
            let outcome = self.rolled_back(test.output, suspects).await;
            return Ok(outcome);
        }

        // Swap: remember the prior bytes, then replace atomically
        let previous = match std::fs::read(&self.active_path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(ApplyError::Swap(e)),
        };
        self.write_active(config_text.as_bytes())?;

        let reload = self
            .run_command(&self.commands.reload_command, None)
            .await?;

        if !reload.success {
            error!(diagnostics = %reload.output, "Reload failed, restoring previous config");

            if let Some(bytes) = previous {
                self.write_active(&bytes)?;
                // Best effort: bring the proxy back up on the prior config
                if let Err(e) = self.run_command(&self.commands.reload_command, None).await {
                    error!(error = %e, "Re-reload after rollback failed");
                }
            }

            let outcome = self.rolled_back(reload.output, suspects).await;
            return Ok(outcome);
        }

        if let Err(e) = self.store.save_config_backup(config_text) {
            warn!(error = %e, "Failed to record config backup");
        } else if let Err(e) = self.store.prune_config_backups(BACKUP_KEEP) {
            warn!(error = %e, "Failed to prune config backups");
        }

        let outcome = ApplyOutcome {
            status: ApplyStatus::Applied,
            diagnostics: None,
            suspect_rules: Vec::new(),
            finished_at: Utc::now(),
        };
        *self.last_outcome.write().await = Some(outcome.clone());

        info!(path = %self.active_path.display(), "Configuration applied and reloaded");
        self.bus.publish(
            channels::SYSTEM,
            &BusEvent::new("proxy:applied", serde_json::json!({ "bytes": config_text.len() })),
        );

        Ok(outcome)
    }

    /// The most recent apply outcome, if any attempt ran
    pub async fn last_outcome(&self) -> Option<ApplyOutcome> {
        self.last_outcome.read().await.clone()
    }

    async fn rolled_back(&self, diagnostics: String, suspects: Vec<String>) -> ApplyOutcome {
        let outcome = ApplyOutcome {
            status: ApplyStatus::RolledBack,
            diagnostics: Some(diagnostics.clone()),
            suspect_rules: suspects.clone(),
            finished_at: Utc::now(),
        };
        *self.last_outcome.write().await = Some(outcome.clone());

        let data = serde_json::json!({
            "diagnostics": diagnostics,
            "suspect_rules": suspects,
        });
        self.bus
            .publish(channels::SYSTEM, &BusEvent::new("proxy:apply-failed", data.clone()));
        for rule_id in &suspects {
            self.bus.publish(
                &channels::proxy(rule_id),
                &BusEvent::new("proxy:apply-failed", data.clone()),
            );
        }

        outcome
    }

    /// Replace the active file atomically (same-directory temp + rename)
    fn write_active(&self, bytes: &[u8]) -> Result<(), ApplyError> {
        let dir = self.active_path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir).map_err(ApplyError::Swap)?;

        let tmp = tempfile::Builder::new()
            .prefix(".active-")
            .tempfile_in(dir)
            .map_err(ApplyError::Swap)?;
        std::fs::write(tmp.path(), bytes).map_err(ApplyError::Swap)?;
        tmp.persist(&self.active_path)
            .map_err(|e| ApplyError::Swap(e.error))?;
        Ok(())
    }

    /// Run one proxy command bounded by the configured timeout
    ///
    /// A timeout or non-zero exit is a failed result (rolled back by the
    /// caller); failing to spawn at all is an infrastructure error.
    async fn run_command(
        &self,
        template: &str,
        config_path: Option<&Path>,
    ) -> Result<CommandResult, ApplyError> {
        let rendered = match config_path {
            Some(path) => template.replace("{config}", &path.to_string_lossy()),
            None => template.to_string(),
        };

        let tokens = shell_words::split(&rendered)
            .map_err(|e| ApplyError::BadCommand(format!("{}: {}", rendered, e)))?;
        let Some((program, args)) = tokens.split_first() else {
            return Err(ApplyError::BadCommand(rendered));
        };

        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true);

        let output = match tokio::time::timeout(self.command_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ApplyError::Spawn {
                    command: rendered,
                    source: e,
                })
            }
            Err(_) => {
                return Ok(CommandResult {
                    success: false,
                    output: format!(
                        "command '{}' timed out after {}s",
                        rendered,
                        self.command_timeout.as_secs()
                    ),
                });
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CommandResult {
            success: output.status.success(),
            output: combined.trim().to_string(),
        })
    }
}

/// Debounced worker turning "configuration stale" signals into apply
/// cycles
///
/// The registry never calls the applier synchronously; it sends the
/// changed rule id here. Signals arriving inside the debounce window are
/// coalesced into one cycle, and the changed-rule set accumulates across
/// failed applies until one succeeds.
pub struct ApplyWorker {
    registry: Arc<RuleRegistry>,
    applier: Arc<ConfigApplier>,
    stale_rx: mpsc::UnboundedReceiver<String>,
    debounce: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApplyWorker {
    pub fn new(
        registry: Arc<RuleRegistry>,
        applier: Arc<ConfigApplier>,
        stale_rx: mpsc::UnboundedReceiver<String>,
        debounce: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            applier,
            stale_rx,
            debounce,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!(
            debounce_ms = self.debounce.as_millis() as u64,
            "Apply worker started"
        );

        let mut suspects: HashSet<String> = HashSet::new();

        loop {
            tokio::select! {
                signal = self.stale_rx.recv() => {
                    let Some(rule_id) = signal else { break };
                    suspects.insert(rule_id);
                    self.debounce_window(&mut suspects).await;

                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                    self.apply_once(&mut suspects).await;
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Apply worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Absorb further signals until the debounce window closes
    async fn debounce_window(&mut self, suspects: &mut HashSet<String>) {
        let deadline = tokio::time::sleep(self.debounce);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                signal = self.stale_rx.recv() => {
                    match signal {
                        Some(rule_id) => { suspects.insert(rule_id); }
                        None => break,
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn apply_once(&self, suspects: &mut HashSet<String>) {
        let rules = self.registry.list().await;

        let config_text = match compiler::compile(&rules) {
            Ok(text) => text,
            Err(e) => {
                // Internal defect: validated rules should always compile
                error!(error = %e, "Compilation failed, apply aborted");
                return;
            }
        };

        let mut suspect_list: Vec<String> = suspects.iter().cloned().collect();
        suspect_list.sort();

        match self.applier.apply(&config_text, suspect_list).await {
            Ok(outcome) if outcome.status == ApplyStatus::Applied => {
                suspects.clear();
            }
            Ok(outcome) => {
                debug!(status = outcome.status.as_str(), "Apply did not land");
            }
            Err(e) => {
                error!(error = %e, "Apply attempt could not run");
            }
        }
    }
}
