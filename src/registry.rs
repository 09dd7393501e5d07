//! Rule registry: owns rule lifecycle and its invariants
//!
//! All mutations run under one registry-wide write lock so the
//! routing-key uniqueness check and the commit are atomic with respect to
//! each other. A successful mutation persists the record, emits a
//! `rule:created|updated|deleted` event and signals the apply worker that
//! the configuration is stale; the applier is never called synchronously
//! from the mutation path.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::RegistryError;
use crate::events::{channels, BusEvent, EventBus};
use crate::rule::{validate_rule, ProxyRule, RuleDraft, RulePatch};
use crate::store::Store;

pub struct RuleRegistry {
    rules: RwLock<HashMap<String, ProxyRule>>,
    store: Arc<Store>,
    bus: Arc<EventBus>,
    stale_tx: mpsc::UnboundedSender<String>,
}

impl RuleRegistry {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        stale_tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            store,
            bus,
            stale_tx,
        }
    }

    /// Load persisted rules into memory at startup
    pub async fn load_persisted(&self) -> Result<usize> {
        let persisted = self.store.list_rules()?;
        let count = persisted.len();

        let mut rules = self.rules.write().await;
        for rule in persisted {
            rules.insert(rule.id.clone(), rule);
        }

        info!(count, "Rules loaded from store");
        Ok(count)
    }

    /// Create a rule from a draft
    pub async fn create(&self, draft: RuleDraft) -> Result<ProxyRule, RegistryError> {
        let rule = draft.into_rule(Uuid::new_v4().to_string());
        validate_rule(&rule).map_err(RegistryError::Validation)?;

        {
            let mut rules = self.rules.write().await;
            check_conflict(&rules, &rule)?;
            self.store.save_rule(&rule)?;
            rules.insert(rule.id.clone(), rule.clone());
        }

        info!(rule_id = rule.id, host = rule.source_host, "Rule created");
        self.emit(&rule, "rule:created");
        Ok(rule)
    }

    /// Apply a partial update to a rule
    ///
    /// Identity is immutable; the patch cannot change id or creation
    /// time. The uniqueness invariant is re-checked whenever the patched
    /// rule is enabled.
    pub async fn update(&self, id: &str, patch: RulePatch) -> Result<ProxyRule, RegistryError> {
        let updated = {
            let mut rules = self.rules.write().await;
            let current = rules
                .get(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

            let updated = patch.apply_to(current);
            validate_rule(&updated).map_err(RegistryError::Validation)?;
            check_conflict(&rules, &updated)?;

            self.store.save_rule(&updated)?;
            rules.insert(id.to_string(), updated.clone());
            updated
        };

        info!(rule_id = id, "Rule updated");
        self.emit(&updated, "rule:updated");
        Ok(updated)
    }

    /// Remove a rule
    pub async fn delete(&self, id: &str) -> Result<ProxyRule, RegistryError> {
        let removed = {
            let mut rules = self.rules.write().await;
            let removed = rules
                .remove(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            self.store.delete_rule(id)?;
            removed
        };

        info!(rule_id = id, "Rule deleted");
        self.emit(&removed, "rule:deleted");
        Ok(removed)
    }

    /// Flip a rule's enabled flag
    ///
    /// Enabling re-checks the routing key against the other enabled
    /// rules; a disabled rule never occupies its key.
    pub async fn toggle(&self, id: &str) -> Result<ProxyRule, RegistryError> {
        let toggled = {
            let mut rules = self.rules.write().await;
            let current = rules
                .get(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

            let mut toggled = current.clone();
            toggled.enabled = !toggled.enabled;
            check_conflict(&rules, &toggled)?;

            self.store.save_rule(&toggled)?;
            rules.insert(id.to_string(), toggled.clone());
            toggled
        };

        info!(rule_id = id, enabled = toggled.enabled, "Rule toggled");
        self.emit(&toggled, "rule:updated");
        Ok(toggled)
    }

    /// Get a rule by id
    pub async fn get(&self, id: &str) -> Option<ProxyRule> {
        self.rules.read().await.get(id).cloned()
    }

    /// Snapshot of all rules
    pub async fn list(&self) -> Vec<ProxyRule> {
        self.rules.read().await.values().cloned().collect()
    }

    /// Emit the mutation event, then mark the configuration stale
    fn emit(&self, rule: &ProxyRule, event: &str) {
        let data = serde_json::to_value(rule).unwrap_or_default();
        self.bus
            .publish(&channels::proxy(&rule.id), &BusEvent::new(event, data));

        // The worker may already be gone during shutdown
        if self.stale_tx.send(rule.id.clone()).is_err() {
            debug!(rule_id = rule.id, "Stale signal dropped, no apply worker");
        }
    }
}

/// Reject a candidate whose routing key is held by another enabled rule
///
/// Disabled candidates never conflict.
fn check_conflict(
    rules: &HashMap<String, ProxyRule>,
    candidate: &ProxyRule,
) -> Result<(), RegistryError> {
    if !candidate.enabled {
        return Ok(());
    }

    for other in rules.values() {
        if other.id != candidate.id
            && other.enabled
            && other.routing_key() == candidate.routing_key()
        {
            return Err(RegistryError::Conflict {
                host: candidate.source_host.clone(),
                path: candidate.source_path.clone(),
                existing_id: other.id.clone(),
            });
        }
    }

    Ok(())
}
