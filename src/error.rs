//! Typed errors for the rule engine
//!
//! Registry and compiler errors are returned synchronously to the caller
//! of the mutating operation. Apply failures are reported asynchronously
//! through the event bus, so the applier mostly reports outcomes rather
//! than errors; `ApplyError` covers the infrastructure failures that
//! prevent an attempt from running at all.

use thiserror::Error;

/// Errors returned by rule registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Rule shape rejected before any mutation was committed
    #[error("invalid rule: {0}")]
    Validation(String),

    /// Another enabled rule already claims the routing key
    #[error("routing key {host}{path} is already claimed by enabled rule {existing_id}")]
    Conflict {
        host: String,
        path: String,
        existing_id: String,
    },

    /// Unknown rule id
    #[error("rule not found: {0}")]
    NotFound(String),

    /// Persistence failure while committing a mutation
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Failure to render a rule set into proxy configuration
///
/// Should not occur for rules that passed registry validation; treated as
/// an internal defect and logged, and the apply cycle is aborted.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("rule {rule_id} declares load balancing with no targets")]
    EmptyUpstream { rule_id: String },

    #[error("rule {rule_id} enables SSL without certificate paths")]
    MissingCertificate { rule_id: String },
}

/// Infrastructure failure inside the config applier
///
/// Distinct from a ROLLED_BACK outcome: a rolled-back attempt ran the
/// config test and acted on its result, while these errors mean the
/// attempt could not be carried out.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("failed to write staging config: {0}")]
    Staging(#[source] std::io::Error),

    #[error("failed to swap active config: {0}")]
    Swap(#[source] std::io::Error),

    #[error("proxy command is empty or unparseable: {0}")]
    BadCommand(String),

    #[error("failed to spawn proxy command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}
