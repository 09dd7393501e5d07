//! Rulegate - a rule-driven reverse proxy manager
//!
//! This library manages a live nginx configuration derived from
//! declarative routing rules:
//! - Owns the rule registry and its routing-key uniqueness invariant
//! - Compiles rules into nginx configuration deterministically
//! - Applies configuration safely: validate, swap, reload, roll back
//! - Ingests traffic/error telemetry into rolling per-rule analytics
//! - Evaluates threshold alerts and dispatches notifications
//! - Fans out rule/traffic/error/container events to live subscribers

pub mod alerting;
pub mod analytics;
pub mod applier;
pub mod compiler;
pub mod config;
pub mod containers;
pub mod error;
pub mod events;
pub mod notifications;
pub mod registry;
pub mod rule;
pub mod store;
