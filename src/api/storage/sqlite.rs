//! `SQLite`-backed implementation of [`StorageBackend`].
//!
//! Uses a single `Mutex<Connection>`; every multi-row write runs in one
//! `rusqlite` transaction while the lock is held.

use super::traits::{ConnectionDependents, Deletion, StorageBackend};
use super::{StorageError, codec};
use crate::models::{
    Blueprint, BlueprintRef, Connection, PersistedPlan, Pipeline, Project, Scope, ScopeKey,
    TransformationRule,
};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

/// Idempotent DDL for control-plane tables.
const CREATE_TABLES: &str = r"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS connections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    plugin TEXT NOT NULL,
    name TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    token TEXT NOT NULL,
    proxy TEXT,
    rate_limit_per_hour INTEGER,
    extra_json TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (plugin, name)
);

CREATE TABLE IF NOT EXISTS transformation_rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    plugin TEXT NOT NULL,
    connection_id INTEGER NOT NULL REFERENCES connections(id),
    name TEXT NOT NULL,
    payload_json TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (plugin, connection_id, name)
);

CREATE TABLE IF NOT EXISTS scopes (
    plugin TEXT NOT NULL,
    connection_id INTEGER NOT NULL REFERENCES connections(id),
    scope_id TEXT NOT NULL,
    name TEXT NOT NULL,
    transformation_rule_id INTEGER REFERENCES transformation_rules(id),
    data_json TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (plugin, connection_id, scope_id)
);

CREATE TABLE IF NOT EXISTS projects (
    name TEXT PRIMARY KEY,
    description TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS blueprints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    project_name TEXT REFERENCES projects(name),
    mode TEXT NOT NULL,
    enable INTEGER NOT NULL,
    cron_config TEXT NOT NULL DEFAULT '',
    is_manual INTEGER NOT NULL,
    skip_on_fail INTEGER NOT NULL,
    settings_json TEXT,
    plan_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_blueprints_project
    ON blueprints (project_name) WHERE project_name IS NOT NULL;

CREATE TABLE IF NOT EXISTS blueprint_scopes (
    blueprint_id INTEGER NOT NULL REFERENCES blueprints(id) ON DELETE CASCADE,
    plugin TEXT NOT NULL,
    connection_id INTEGER NOT NULL,
    scope_id TEXT NOT NULL,
    PRIMARY KEY (blueprint_id, plugin, connection_id, scope_id)
);

CREATE INDEX IF NOT EXISTS idx_blueprint_scopes_scope
    ON blueprint_scopes (plugin, connection_id, scope_id);

CREATE TABLE IF NOT EXISTS pipelines (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    blueprint_id INTEGER,
    plan_json TEXT NOT NULL,
    status TEXT NOT NULL,
    total_tasks INTEGER NOT NULL,
    finished_tasks INTEGER NOT NULL,
    failed_tasks INTEGER NOT NULL,
    error_name TEXT NOT NULL DEFAULT '',
    skip_on_fail INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    began_at TEXT,
    finished_at TEXT
);
";

const TERMINAL_STATUSES: &str = "('TASK_COMPLETED', 'TASK_FAILED', 'TASK_CANCELLED')";

/// `SQLite`-backed control-plane storage.
///
/// Create with [`SqliteStorageBackend::open`] for file-backed persistence
/// or [`SqliteStorageBackend::in_memory`] for tests.
pub struct SqliteStorageBackend {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteStorageBackend {
    /// Open or create a database at `path`.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::ConnectionError(e.to_string()))?;
        }
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(CREATE_TABLES)?;
        info!("SQLite storage opened at {:?}", path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, rusqlite::Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }
}

struct ConnectionRow {
    id: i64,
    plugin: String,
    name: String,
    endpoint: String,
    token: String,
    proxy: Option<String>,
    rate_limit_per_hour: Option<i64>,
    extra_json: String,
    created_at: String,
    updated_at: String,
}

const CONNECTION_COLUMNS: &str = "id, plugin, name, endpoint, token, proxy, rate_limit_per_hour, extra_json, created_at, updated_at";

impl ConnectionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            plugin: row.get(1)?,
            name: row.get(2)?,
            endpoint: row.get(3)?,
            token: row.get(4)?,
            proxy: row.get(5)?,
            rate_limit_per_hour: row.get(6)?,
            extra_json: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_model(self) -> Result<Connection, StorageError> {
        Ok(Connection {
            id: self.id,
            plugin: self.plugin,
            name: self.name,
            endpoint: self.endpoint,
            token: self.token,
            proxy: self.proxy,
            rate_limit_per_hour: self.rate_limit_per_hour.map(|v| v.clamp(0, u32::MAX as i64) as u32),
            extra: codec::parse_json(&self.extra_json, "connection extra")?,
            created_at: codec::parse_ts(&self.created_at)?,
            updated_at: codec::parse_ts(&self.updated_at)?,
        })
    }
}

struct RuleRow {
    id: i64,
    plugin: String,
    connection_id: i64,
    name: String,
    payload_json: String,
    created_at: String,
    updated_at: String,
}

const RULE_COLUMNS: &str = "id, plugin, connection_id, name, payload_json, created_at, updated_at";

impl RuleRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            plugin: row.get(1)?,
            connection_id: row.get(2)?,
            name: row.get(3)?,
            payload_json: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_model(self) -> Result<TransformationRule, StorageError> {
        Ok(TransformationRule {
            id: self.id,
            plugin: self.plugin,
            connection_id: self.connection_id,
            name: self.name,
            payload: codec::parse_json(&self.payload_json, "rule payload")?,
            created_at: codec::parse_ts(&self.created_at)?,
            updated_at: codec::parse_ts(&self.updated_at)?,
        })
    }
}

struct ScopeRow {
    plugin: String,
    connection_id: i64,
    scope_id: String,
    name: String,
    transformation_rule_id: Option<i64>,
    data_json: String,
    created_at: String,
    updated_at: String,
}

const SCOPE_COLUMNS: &str = "plugin, connection_id, scope_id, name, transformation_rule_id, data_json, created_at, updated_at";

impl ScopeRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            plugin: row.get(0)?,
            connection_id: row.get(1)?,
            scope_id: row.get(2)?,
            name: row.get(3)?,
            transformation_rule_id: row.get(4)?,
            data_json: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_model(self) -> Result<Scope, StorageError> {
        Ok(Scope {
            plugin: self.plugin,
            connection_id: self.connection_id,
            id: self.scope_id,
            name: self.name,
            transformation_rule_id: self.transformation_rule_id,
            data: codec::parse_json(&self.data_json, "scope data")?,
            created_at: codec::parse_ts(&self.created_at)?,
            updated_at: codec::parse_ts(&self.updated_at)?,
        })
    }
}

struct BlueprintRow {
    id: i64,
    name: String,
    project_name: Option<String>,
    mode: String,
    enable: bool,
    cron_config: String,
    is_manual: bool,
    skip_on_fail: bool,
    settings_json: Option<String>,
    plan_json: String,
    created_at: String,
    updated_at: String,
}

const BLUEPRINT_COLUMNS: &str = "id, name, project_name, mode, enable, cron_config, is_manual, skip_on_fail, settings_json, plan_json, created_at, updated_at";

impl BlueprintRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            project_name: row.get(2)?,
            mode: row.get(3)?,
            enable: row.get(4)?,
            cron_config: row.get(5)?,
            is_manual: row.get(6)?,
            skip_on_fail: row.get(7)?,
            settings_json: row.get(8)?,
            plan_json: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_model(self) -> Result<Blueprint, StorageError> {
        let settings = match self.settings_json {
            Some(raw) => Some(codec::parse_json(&raw, "blueprint settings")?),
            None => None,
        };
        let plan: PersistedPlan = codec::parse_json(&self.plan_json, "blueprint plan")?;
        Ok(Blueprint {
            id: self.id,
            name: self.name,
            project_name: self.project_name,
            mode: self.mode.parse().map_err(StorageError::Serialization)?,
            enable: self.enable,
            cron_config: self.cron_config,
            is_manual: self.is_manual,
            skip_on_fail: self.skip_on_fail,
            settings,
            plan,
            created_at: codec::parse_ts(&self.created_at)?,
            updated_at: codec::parse_ts(&self.updated_at)?,
        })
    }
}

struct PipelineRow {
    id: i64,
    name: String,
    blueprint_id: Option<i64>,
    plan_json: String,
    status: String,
    total_tasks: i64,
    finished_tasks: i64,
    failed_tasks: i64,
    error_name: String,
    skip_on_fail: bool,
    created_at: String,
    began_at: Option<String>,
    finished_at: Option<String>,
}

const PIPELINE_COLUMNS: &str = "id, name, blueprint_id, plan_json, status, total_tasks, finished_tasks, failed_tasks, error_name, skip_on_fail, created_at, began_at, finished_at";

impl PipelineRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            blueprint_id: row.get(2)?,
            plan_json: row.get(3)?,
            status: row.get(4)?,
            total_tasks: row.get(5)?,
            finished_tasks: row.get(6)?,
            failed_tasks: row.get(7)?,
            error_name: row.get(8)?,
            skip_on_fail: row.get(9)?,
            created_at: row.get(10)?,
            began_at: row.get(11)?,
            finished_at: row.get(12)?,
        })
    }

    fn into_model(self) -> Result<Pipeline, StorageError> {
        Ok(Pipeline {
            id: self.id,
            name: self.name,
            blueprint_id: self.blueprint_id,
            plan: codec::parse_json(&self.plan_json, "pipeline plan")?,
            status: self.status.parse().map_err(StorageError::Serialization)?,
            total_tasks: codec::to_count(self.total_tasks),
            finished_tasks: codec::to_count(self.finished_tasks),
            failed_tasks: codec::to_count(self.failed_tasks),
            error_name: self.error_name,
            skip_on_fail: self.skip_on_fail,
            created_at: codec::parse_ts(&self.created_at)?,
            began_at: codec::parse_opt_ts(self.began_at.as_deref())?,
            finished_at: codec::parse_opt_ts(self.finished_at.as_deref())?,
        })
    }
}

fn load_blueprint(
    conn: &rusqlite::Connection,
    blueprint_id: i64,
) -> Result<Option<Blueprint>, StorageError> {
    let sql = format!("SELECT {} FROM blueprints WHERE id = ?1", BLUEPRINT_COLUMNS);
    conn.query_row(&sql, [blueprint_id], BlueprintRow::from_row)
        .optional()?
        .map(BlueprintRow::into_model)
        .transpose()
}

fn write_blueprint_index(
    conn: &rusqlite::Connection,
    blueprint: &Blueprint,
) -> Result<(), StorageError> {
    conn.execute(
        "DELETE FROM blueprint_scopes WHERE blueprint_id = ?1",
        [blueprint.id],
    )?;
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO blueprint_scopes (blueprint_id, plugin, connection_id, scope_id)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for key in blueprint.referenced_scopes() {
        stmt.execute(params![blueprint.id, key.plugin, key.connection_id, key.scope_id])?;
    }
    Ok(())
}

fn write_blueprint(conn: &rusqlite::Connection, blueprint: &Blueprint) -> Result<(), StorageError> {
    let settings = blueprint
        .settings
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let plan = serde_json::to_string(&blueprint.plan)?;
    let changed = conn.execute(
        "UPDATE blueprints
         SET name = ?2, project_name = ?3, mode = ?4, enable = ?5, cron_config = ?6,
             is_manual = ?7, skip_on_fail = ?8, settings_json = ?9, plan_json = ?10, updated_at = ?11
         WHERE id = ?1",
        params![
            blueprint.id,
            blueprint.name,
            blueprint.project_name,
            blueprint.mode.as_str(),
            blueprint.enable,
            blueprint.cron_config,
            blueprint.is_manual,
            blueprint.skip_on_fail,
            settings,
            plan,
            codec::fmt_ts(&blueprint.updated_at),
        ],
    )?;
    if changed == 0 {
        return Err(StorageError::not_found("blueprint", blueprint.id));
    }
    write_blueprint_index(conn, blueprint)
}

#[async_trait]
impl StorageBackend for SqliteStorageBackend {
    async fn create_connection(&self, connection: Connection) -> Result<Connection, StorageError> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO connections (plugin, name, endpoint, token, proxy, rate_limit_per_hour, extra_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                connection.plugin,
                connection.name,
                connection.endpoint,
                connection.token,
                connection.proxy,
                connection.rate_limit_per_hour.map(i64::from),
                serde_json::to_string(&connection.extra)?,
                codec::fmt_ts(&connection.created_at),
                codec::fmt_ts(&connection.updated_at),
            ],
        )?;
        Ok(Connection {
            id: conn.last_insert_rowid(),
            ..connection
        })
    }

    async fn get_connection(
        &self,
        plugin: &str,
        connection_id: i64,
    ) -> Result<Option<Connection>, StorageError> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {} FROM connections WHERE plugin = ?1 AND id = ?2",
            CONNECTION_COLUMNS
        );
        conn.query_row(&sql, params![plugin, connection_id], ConnectionRow::from_row)
            .optional()?
            .map(ConnectionRow::into_model)
            .transpose()
    }

    async fn list_connections(&self, plugin: &str) -> Result<Vec<Connection>, StorageError> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {} FROM connections WHERE plugin = ?1 ORDER BY id",
            CONNECTION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([plugin], ConnectionRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(ConnectionRow::into_model).collect()
    }

    async fn update_connection(&self, connection: &Connection) -> Result<(), StorageError> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE connections
             SET name = ?3, endpoint = ?4, token = ?5, proxy = ?6, rate_limit_per_hour = ?7,
                 extra_json = ?8, updated_at = ?9
             WHERE plugin = ?1 AND id = ?2",
            params![
                connection.plugin,
                connection.id,
                connection.name,
                connection.endpoint,
                connection.token,
                connection.proxy,
                connection.rate_limit_per_hour.map(i64::from),
                serde_json::to_string(&connection.extra)?,
                codec::fmt_ts(&connection.updated_at),
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::not_found("connection", connection.id));
        }
        Ok(())
    }

    async fn delete_connection(
        &self,
        plugin: &str,
        connection_id: i64,
    ) -> Result<Deletion<ConnectionDependents>, StorageError> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let scopes: i64 = tx.query_row(
            "SELECT COUNT(*) FROM scopes WHERE plugin = ?1 AND connection_id = ?2",
            params![plugin, connection_id],
            |row| row.get(0),
        )?;
        let rules: i64 = tx.query_row(
            "SELECT COUNT(*) FROM transformation_rules WHERE plugin = ?1 AND connection_id = ?2",
            params![plugin, connection_id],
            |row| row.get(0),
        )?;
        if scopes > 0 || rules > 0 {
            return Ok(Deletion::InUse(ConnectionDependents {
                scopes: scopes as u64,
                rules: rules as u64,
            }));
        }
        let deleted = tx.execute(
            "DELETE FROM connections WHERE plugin = ?1 AND id = ?2",
            params![plugin, connection_id],
        )?;
        tx.commit()?;
        Ok(if deleted == 0 {
            Deletion::NotFound
        } else {
            Deletion::Deleted
        })
    }

    async fn create_rule(
        &self,
        rule: TransformationRule,
    ) -> Result<TransformationRule, StorageError> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO transformation_rules (plugin, connection_id, name, payload_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                rule.plugin,
                rule.connection_id,
                rule.name,
                serde_json::to_string(&rule.payload)?,
                codec::fmt_ts(&rule.created_at),
                codec::fmt_ts(&rule.updated_at),
            ],
        )?;
        Ok(TransformationRule {
            id: conn.last_insert_rowid(),
            ..rule
        })
    }

    async fn get_rule(
        &self,
        plugin: &str,
        connection_id: i64,
        rule_id: i64,
    ) -> Result<Option<TransformationRule>, StorageError> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {} FROM transformation_rules WHERE plugin = ?1 AND connection_id = ?2 AND id = ?3",
            RULE_COLUMNS
        );
        conn.query_row(&sql, params![plugin, connection_id, rule_id], RuleRow::from_row)
            .optional()?
            .map(RuleRow::into_model)
            .transpose()
    }

    async fn list_rules(
        &self,
        plugin: &str,
        connection_id: i64,
    ) -> Result<Vec<TransformationRule>, StorageError> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {} FROM transformation_rules WHERE plugin = ?1 AND connection_id = ?2 ORDER BY id",
            RULE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![plugin, connection_id], RuleRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RuleRow::into_model).collect()
    }

    async fn update_rule(&self, rule: &TransformationRule) -> Result<(), StorageError> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE transformation_rules SET name = ?4, payload_json = ?5, updated_at = ?6
             WHERE plugin = ?1 AND connection_id = ?2 AND id = ?3",
            params![
                rule.plugin,
                rule.connection_id,
                rule.id,
                rule.name,
                serde_json::to_string(&rule.payload)?,
                codec::fmt_ts(&rule.updated_at),
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::not_found("transformation_rule", rule.id));
        }
        Ok(())
    }

    async fn delete_rule(
        &self,
        plugin: &str,
        connection_id: i64,
        rule_id: i64,
    ) -> Result<Deletion<Vec<String>>, StorageError> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let users = {
            let mut stmt = tx.prepare(
                "SELECT scope_id FROM scopes
                 WHERE plugin = ?1 AND connection_id = ?2 AND transformation_rule_id = ?3
                 ORDER BY rowid",
            )?;
            stmt.query_map(params![plugin, connection_id, rule_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?
        };
        if !users.is_empty() {
            return Ok(Deletion::InUse(users));
        }
        let deleted = tx.execute(
            "DELETE FROM transformation_rules WHERE plugin = ?1 AND connection_id = ?2 AND id = ?3",
            params![plugin, connection_id, rule_id],
        )?;
        tx.commit()?;
        Ok(if deleted == 0 {
            Deletion::NotFound
        } else {
            Deletion::Deleted
        })
    }

    async fn get_scope(&self, key: &ScopeKey) -> Result<Option<Scope>, StorageError> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {} FROM scopes WHERE plugin = ?1 AND connection_id = ?2 AND scope_id = ?3",
            SCOPE_COLUMNS
        );
        conn.query_row(
            &sql,
            params![key.plugin, key.connection_id, key.scope_id],
            ScopeRow::from_row,
        )
        .optional()?
        .map(ScopeRow::into_model)
        .transpose()
    }

    async fn list_scopes(
        &self,
        plugin: &str,
        connection_id: i64,
    ) -> Result<Vec<Scope>, StorageError> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {} FROM scopes WHERE plugin = ?1 AND connection_id = ?2 ORDER BY rowid",
            SCOPE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![plugin, connection_id], ScopeRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(ScopeRow::into_model).collect()
    }

    async fn upsert_scopes(&self, scopes: &[Scope]) -> Result<(), StorageError> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO scopes (plugin, connection_id, scope_id, name, transformation_rule_id, data_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (plugin, connection_id, scope_id) DO UPDATE SET
                     name = excluded.name,
                     transformation_rule_id = excluded.transformation_rule_id,
                     data_json = excluded.data_json,
                     updated_at = excluded.updated_at",
            )?;
            for scope in scopes {
                stmt.execute(params![
                    scope.plugin,
                    scope.connection_id,
                    scope.id,
                    scope.name,
                    scope.transformation_rule_id,
                    serde_json::to_string(&scope.data)?,
                    codec::fmt_ts(&scope.created_at),
                    codec::fmt_ts(&scope.updated_at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn scope_blueprint_refs(
        &self,
        plugin: &str,
        connection_id: i64,
    ) -> Result<HashMap<String, Vec<BlueprintRef>>, StorageError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT bs.scope_id, b.id, b.name
             FROM blueprint_scopes bs JOIN blueprints b ON b.id = bs.blueprint_id
             WHERE bs.plugin = ?1 AND bs.connection_id = ?2
             ORDER BY b.id",
        )?;
        let rows = stmt
            .query_map(params![plugin, connection_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut refs: HashMap<String, Vec<BlueprintRef>> = HashMap::new();
        for (scope_id, id, name) in rows {
            refs.entry(scope_id).or_default().push(BlueprintRef { id, name });
        }
        Ok(refs)
    }

    async fn blueprints_referencing(
        &self,
        key: &ScopeKey,
    ) -> Result<Vec<BlueprintRef>, StorageError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT b.id, b.name
             FROM blueprint_scopes bs JOIN blueprints b ON b.id = bs.blueprint_id
             WHERE bs.plugin = ?1 AND bs.connection_id = ?2 AND bs.scope_id = ?3
             ORDER BY b.id",
        )?;
        let refs = stmt
            .query_map(params![key.plugin, key.connection_id, key.scope_id], |row| {
                Ok(BlueprintRef {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(refs)
    }

    async fn delete_scope_cascade(
        &self,
        key: &ScopeKey,
        delete_data_only: bool,
    ) -> Result<Vec<i64>, StorageError> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let exists: bool = tx.query_row(
            "SELECT EXISTS (SELECT 1 FROM scopes WHERE plugin = ?1 AND connection_id = ?2 AND scope_id = ?3)",
            params![key.plugin, key.connection_id, key.scope_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(StorageError::not_found("scope", key));
        }
        let blueprint_ids = {
            let mut stmt = tx.prepare(
                "SELECT DISTINCT blueprint_id FROM blueprint_scopes
                 WHERE plugin = ?1 AND connection_id = ?2 AND scope_id = ?3
                 ORDER BY blueprint_id",
            )?;
            stmt.query_map(params![key.plugin, key.connection_id, key.scope_id], |row| {
                row.get(0)
            })?
            .collect::<rusqlite::Result<Vec<i64>>>()?
        };
        if delete_data_only {
            return Ok(blueprint_ids);
        }
        let now = Utc::now();
        for blueprint_id in &blueprint_ids {
            if let Some(mut blueprint) = load_blueprint(&tx, *blueprint_id)? {
                blueprint.detach_scope(key, now);
                write_blueprint(&tx, &blueprint)?;
            }
        }
        tx.execute(
            "DELETE FROM blueprint_scopes WHERE plugin = ?1 AND connection_id = ?2 AND scope_id = ?3",
            params![key.plugin, key.connection_id, key.scope_id],
        )?;
        tx.execute(
            "DELETE FROM scopes WHERE plugin = ?1 AND connection_id = ?2 AND scope_id = ?3",
            params![key.plugin, key.connection_id, key.scope_id],
        )?;
        tx.commit()?;
        Ok(blueprint_ids)
    }

    async fn create_project(&self, project: Project) -> Result<Project, StorageError> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO projects (name, description, created_at) VALUES (?1, ?2, ?3)",
            params![
                project.name,
                project.description,
                codec::fmt_ts(&project.created_at)
            ],
        )
        .map_err(|e| match StorageError::from(e) {
            StorageError::Conflict { .. } => {
                StorageError::conflict("project", format!("{} already exists", project.name))
            }
            other => other,
        })?;
        Ok(project)
    }

    async fn get_project(&self, name: &str) -> Result<Option<Project>, StorageError> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT name, description, created_at FROM projects WHERE name = ?1",
                [name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(name, description, created_at)| {
            Ok(Project {
                name,
                description,
                created_at: codec::parse_ts(&created_at)?,
            })
        })
        .transpose()
    }

    async fn list_projects(&self) -> Result<Vec<Project>, StorageError> {
        let conn = self.lock_conn()?;
        let mut stmt =
            conn.prepare("SELECT name, description, created_at FROM projects ORDER BY rowid")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(name, description, created_at)| {
                Ok(Project {
                    name,
                    description,
                    created_at: codec::parse_ts(&created_at)?,
                })
            })
            .collect()
    }

    async fn create_blueprint(&self, blueprint: Blueprint) -> Result<Blueprint, StorageError> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let settings = blueprint
            .settings
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        tx.execute(
            "INSERT INTO blueprints (name, project_name, mode, enable, cron_config, is_manual, skip_on_fail, settings_json, plan_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                blueprint.name,
                blueprint.project_name,
                blueprint.mode.as_str(),
                blueprint.enable,
                blueprint.cron_config,
                blueprint.is_manual,
                blueprint.skip_on_fail,
                settings,
                serde_json::to_string(&blueprint.plan)?,
                codec::fmt_ts(&blueprint.created_at),
                codec::fmt_ts(&blueprint.updated_at),
            ],
        )?;
        let created = Blueprint {
            id: tx.last_insert_rowid(),
            ..blueprint
        };
        write_blueprint_index(&tx, &created)?;
        tx.commit()?;
        Ok(created)
    }

    async fn get_blueprint(&self, blueprint_id: i64) -> Result<Option<Blueprint>, StorageError> {
        let conn = self.lock_conn()?;
        load_blueprint(&conn, blueprint_id)
    }

    async fn get_blueprint_by_project(
        &self,
        project_name: &str,
    ) -> Result<Option<Blueprint>, StorageError> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {} FROM blueprints WHERE project_name = ?1",
            BLUEPRINT_COLUMNS
        );
        conn.query_row(&sql, [project_name], BlueprintRow::from_row)
            .optional()?
            .map(BlueprintRow::into_model)
            .transpose()
    }

    async fn list_blueprints(&self) -> Result<Vec<Blueprint>, StorageError> {
        let conn = self.lock_conn()?;
        let sql = format!("SELECT {} FROM blueprints ORDER BY id", BLUEPRINT_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], BlueprintRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(BlueprintRow::into_model).collect()
    }

    async fn update_blueprint(&self, blueprint: &Blueprint) -> Result<(), StorageError> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        write_blueprint(&tx, blueprint)?;
        tx.commit()?;
        Ok(())
    }

    async fn delete_blueprint(&self, blueprint_id: i64) -> Result<bool, StorageError> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM blueprint_scopes WHERE blueprint_id = ?1",
            [blueprint_id],
        )?;
        let deleted = tx.execute("DELETE FROM blueprints WHERE id = ?1", [blueprint_id])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    async fn create_pipeline(&self, pipeline: Pipeline) -> Result<Pipeline, StorageError> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO pipelines (name, blueprint_id, plan_json, status, total_tasks, finished_tasks, failed_tasks, error_name, skip_on_fail, created_at, began_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                pipeline.name,
                pipeline.blueprint_id,
                serde_json::to_string(&pipeline.plan)?,
                pipeline.status.as_str(),
                pipeline.total_tasks as i64,
                pipeline.finished_tasks as i64,
                pipeline.failed_tasks as i64,
                pipeline.error_name,
                pipeline.skip_on_fail,
                codec::fmt_ts(&pipeline.created_at),
                pipeline.began_at.as_ref().map(codec::fmt_ts),
                pipeline.finished_at.as_ref().map(codec::fmt_ts),
            ],
        )?;
        Ok(Pipeline {
            id: conn.last_insert_rowid(),
            ..pipeline
        })
    }

    async fn get_pipeline(&self, pipeline_id: i64) -> Result<Option<Pipeline>, StorageError> {
        let conn = self.lock_conn()?;
        let sql = format!("SELECT {} FROM pipelines WHERE id = ?1", PIPELINE_COLUMNS);
        conn.query_row(&sql, [pipeline_id], PipelineRow::from_row)
            .optional()?
            .map(PipelineRow::into_model)
            .transpose()
    }

    async fn list_pipelines(
        &self,
        blueprint_id: Option<i64>,
    ) -> Result<Vec<Pipeline>, StorageError> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {} FROM pipelines WHERE (?1 IS NULL OR blueprint_id = ?1) ORDER BY id",
            PIPELINE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([blueprint_id], PipelineRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(PipelineRow::into_model).collect()
    }

    async fn update_pipeline(&self, pipeline: &Pipeline) -> Result<(), StorageError> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "UPDATE pipelines
             SET status = ?2, finished_tasks = ?3, failed_tasks = ?4, error_name = ?5,
                 began_at = ?6, finished_at = ?7
             WHERE id = ?1 AND status NOT IN {}",
            TERMINAL_STATUSES
        );
        let changed = conn.execute(
            &sql,
            params![
                pipeline.id,
                pipeline.status.as_str(),
                pipeline.finished_tasks as i64,
                pipeline.failed_tasks as i64,
                pipeline.error_name,
                pipeline.began_at.as_ref().map(codec::fmt_ts),
                pipeline.finished_at.as_ref().map(codec::fmt_ts),
            ],
        )?;
        if changed > 0 {
            return Ok(());
        }
        let exists: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM pipelines WHERE id = ?1)",
            [pipeline.id],
            |row| row.get(0),
        )?;
        if exists {
            Err(StorageError::conflict(
                "pipeline",
                format!("pipeline {} already finished", pipeline.id),
            ))
        } else {
            Err(StorageError::not_found("pipeline", pipeline.id))
        }
    }
}
