//! SQLite persistence for rules, alerts, proxy errors and config backups
//!
//! Records are stored as JSON blobs addressed by opaque id, with a few
//! indexed columns for the queries the engine actually runs. WAL mode and
//! versioned migrations; an in-memory constructor backs the tests.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::alerting::{AlertStatus, ErrorAlert, ErrorAlertConfig};
use crate::analytics::ProxyError;
use crate::rule::ProxyRule;

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

/// Database wrapper with thread-safe access
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;

        info!("Store opened at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!(
                "Running migrations from v{} to v{}",
                current_version, SCHEMA_VERSION
            );

            if current_version < 1 {
                self.migrate_v1(&conn)?;
            }
            if current_version < 2 {
                self.migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: rules and config backups
    fn migrate_v1(&self, conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: rules and config backups");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS rules (
                id TEXT PRIMARY KEY,
                record TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- Applied configurations, newest last
            CREATE TABLE IF NOT EXISTS config_backups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                config TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    /// Migration v2: alerting and error history
    fn migrate_v2(&self, conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: alerting and error history");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS alert_configs (
                id TEXT PRIMARY KEY,
                record TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                config_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                error_rate REAL NOT NULL,
                error_count INTEGER NOT NULL,
                request_count INTEGER NOT NULL,
                message TEXT NOT NULL,
                started_at TEXT NOT NULL,
                acknowledged_at TEXT,
                resolved_at TEXT,
                FOREIGN KEY (config_id) REFERENCES alert_configs(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS proxy_errors (
                id TEXT PRIMARY KEY,
                rule_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0,
                record TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_alerts_config_status ON alerts(config_id, status);
            CREATE INDEX IF NOT EXISTS idx_proxy_errors_rule_time ON proxy_errors(rule_id, timestamp DESC);

            INSERT INTO schema_migrations (version) VALUES (2);
        "#,
        )?;

        Ok(())
    }

    // ==================== Rule Operations ====================

    /// Insert or replace a rule record
    pub fn save_rule(&self, rule: &ProxyRule) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let record = serde_json::to_string(rule).context("Failed to serialize rule")?;
        conn.execute(
            "INSERT INTO rules (id, record, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET record = excluded.record",
            params![rule.id, record, rule.created_at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Get a rule by id
    pub fn get_rule(&self, id: &str) -> Result<Option<ProxyRule>> {
        let conn = self.conn.lock().unwrap();
        let record: Option<String> = conn
            .query_row("SELECT record FROM rules WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()
            .context("Failed to get rule")?;

        record
            .map(|r| serde_json::from_str(&r).context("Failed to deserialize rule"))
            .transpose()
    }

    /// List all persisted rules
    pub fn list_rules(&self) -> Result<Vec<ProxyRule>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT record FROM rules ORDER BY created_at")?;

        let records = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        records
            .iter()
            .map(|r| serde_json::from_str(r).context("Failed to deserialize rule"))
            .collect()
    }

    /// Delete a rule record
    pub fn delete_rule(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute("DELETE FROM rules WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // ==================== Config Backups ====================

    /// Record a successfully applied configuration
    pub fn save_config_backup(&self, config: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO config_backups (config) VALUES (?1)",
            params![config],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The most recently applied configuration, if any
    pub fn latest_config_backup(&self) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT config FROM config_backups ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to get latest config backup")
    }

    /// Drop all but the newest `keep` backups; returns rows removed
    pub fn prune_config_backups(&self, keep: usize) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "DELETE FROM config_backups WHERE id NOT IN (
                SELECT id FROM config_backups ORDER BY id DESC LIMIT ?1
            )",
            params![keep as i64],
        )?;
        Ok(rows)
    }

    // ==================== Alert Configs ====================

    /// Insert or replace an alert config
    pub fn save_alert_config(&self, config: &ErrorAlertConfig) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let record = serde_json::to_string(config).context("Failed to serialize alert config")?;
        conn.execute(
            "INSERT INTO alert_configs (id, record, enabled) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET record = excluded.record, enabled = excluded.enabled",
            params![config.id, record, config.enabled],
        )?;
        Ok(())
    }

    /// Get an alert config by id
    pub fn get_alert_config(&self, id: &str) -> Result<Option<ErrorAlertConfig>> {
        let conn = self.conn.lock().unwrap();
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM alert_configs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to get alert config")?;

        record
            .map(|r| serde_json::from_str(&r).context("Failed to deserialize alert config"))
            .transpose()
    }

    /// List alert configs that are enabled
    pub fn list_enabled_alert_configs(&self) -> Result<Vec<ErrorAlertConfig>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT record FROM alert_configs WHERE enabled = 1")?;

        let records = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        records
            .iter()
            .map(|r| serde_json::from_str(r).context("Failed to deserialize alert config"))
            .collect()
    }

    /// Delete an alert config (cascades to its alerts)
    pub fn delete_alert_config(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute("DELETE FROM alert_configs WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // ==================== Alerts ====================

    /// Persist a newly triggered alert
    pub fn create_alert(&self, alert: &ErrorAlert) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alerts (id, config_id, status, error_rate, error_count,
                                 request_count, message, started_at, acknowledged_at, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                alert.id,
                alert.config_id,
                alert.status.as_str(),
                alert.error_rate,
                alert.error_count as i64,
                alert.request_count as i64,
                alert.message,
                alert.started_at.to_rfc3339(),
                alert.acknowledged_at.map(|t| t.to_rfc3339()),
                alert.resolved_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Get an alert by id
    pub fn get_alert(&self, id: &str) -> Result<Option<ErrorAlert>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, config_id, status, error_rate, error_count, request_count,
                    message, started_at, acknowledged_at, resolved_at
             FROM alerts WHERE id = ?1",
            params![id],
            row_to_alert,
        )
        .optional()
        .context("Failed to get alert")
    }

    /// The ACTIVE or ACKNOWLEDGED alert for a config, if one exists
    ///
    /// An acknowledged alert still counts as open for deduplication; a new
    /// alert is only created once the previous one resolved.
    pub fn get_open_alert_for_config(&self, config_id: &str) -> Result<Option<ErrorAlert>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, config_id, status, error_rate, error_count, request_count,
                    message, started_at, acknowledged_at, resolved_at
             FROM alerts WHERE config_id = ?1 AND status != 'resolved'
             ORDER BY started_at DESC LIMIT 1",
            params![config_id],
            row_to_alert,
        )
        .optional()
        .context("Failed to get open alert")
    }

    /// Mark an alert acknowledged; returns false if missing or resolved
    pub fn acknowledge_alert(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE alerts SET status = 'acknowledged', acknowledged_at = ?1
             WHERE id = ?2 AND status = 'active'",
            params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(rows > 0)
    }

    /// Mark an alert resolved; returns false if missing or already resolved
    pub fn resolve_alert(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE alerts SET status = 'resolved', resolved_at = ?1
             WHERE id = ?2 AND status != 'resolved'",
            params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(rows > 0)
    }

    /// Recent alerts, newest first
    pub fn list_alerts(&self, limit: usize) -> Result<Vec<ErrorAlert>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, config_id, status, error_rate, error_count, request_count,
                    message, started_at, acknowledged_at, resolved_at
             FROM alerts ORDER BY started_at DESC LIMIT ?1",
        )?;

        let alerts = stmt
            .query_map(params![limit as i64], row_to_alert)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(alerts)
    }

    // ==================== Proxy Errors ====================

    /// Persist a proxy error for history queries
    pub fn record_proxy_error(&self, error: &ProxyError) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let record = serde_json::to_string(error).context("Failed to serialize proxy error")?;
        conn.execute(
            "INSERT INTO proxy_errors (id, rule_id, timestamp, resolved, record)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET resolved = excluded.resolved, record = excluded.record",
            params![
                error.id,
                error.rule_id,
                error.timestamp.to_rfc3339(),
                error.resolved,
                record
            ],
        )?;
        Ok(())
    }

    /// Recent errors for a rule, newest first
    pub fn rule_errors(&self, rule_id: &str, limit: usize) -> Result<Vec<ProxyError>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT record FROM proxy_errors WHERE rule_id = ?1
             ORDER BY timestamp DESC LIMIT ?2",
        )?;

        let records = stmt
            .query_map(params![rule_id, limit as i64], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;

        records
            .iter()
            .map(|r| serde_json::from_str(r).context("Failed to deserialize proxy error"))
            .collect()
    }

    /// Mark a stored error resolved with a note
    pub fn resolve_proxy_error(&self, id: &str, note: &str) -> Result<bool> {
        let record: Option<String> = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT record FROM proxy_errors WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
        };

        let Some(record) = record else {
            return Ok(false);
        };

        let mut error: ProxyError =
            serde_json::from_str(&record).context("Failed to deserialize proxy error")?;
        error.resolved = true;
        error.resolution_note = Some(note.to_string());

        self.record_proxy_error(&error)?;
        Ok(true)
    }
}

fn row_to_alert(row: &rusqlite::Row<'_>) -> rusqlite::Result<ErrorAlert> {
    let status: String = row.get(2)?;
    let started_at: String = row.get(7)?;
    let acknowledged_at: Option<String> = row.get(8)?;
    let resolved_at: Option<String> = row.get(9)?;

    Ok(ErrorAlert {
        id: row.get(0)?,
        config_id: row.get(1)?,
        status: AlertStatus::from_str(&status).unwrap_or(AlertStatus::Active),
        error_rate: row.get(3)?,
        error_count: row.get::<_, i64>(4)? as u64,
        request_count: row.get::<_, i64>(5)? as u64,
        message: row.get(6)?,
        started_at: parse_rfc3339(&started_at),
        acknowledged_at: acknowledged_at.as_deref().map(parse_rfc3339),
        resolved_at: resolved_at.as_deref().map(parse_rfc3339),
    })
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
