//! PostgreSQL storage backend implementation.
//!
//! Uses sqlx for database operations and implements the StorageBackend trait.
//! Queries are checked at runtime so the crate builds without a live database.

use super::traits::{ConnectionDependents, Deletion, StorageBackend};
use super::{StorageError, codec};
use crate::models::{
    Blueprint, BlueprintRef, BlueprintSettings, Connection, PersistedPlan, Pipeline,
    PipelinePlan, Project, Scope, ScopeKey, TransformationRule,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use std::collections::HashMap;
use tracing::info;

/// PostgreSQL storage backend implementation.
pub struct PostgresStorageBackend {
    pool: PgPool,
}

impl PostgresStorageBackend {
    /// Create a new PostgreSQL storage backend.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and apply pending migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::ConnectionError(format!("migration failed: {}", e)))?;
        info!("PostgreSQL storage ready, migrations applied");
        Ok(Self::new(pool))
    }
}

fn connection_from_row(row: &PgRow) -> Result<Connection, StorageError> {
    let rate_limit: Option<i64> = row.try_get("rate_limit_per_hour")?;
    let Json(extra): Json<Map<String, Value>> = row.try_get("extra")?;
    Ok(Connection {
        id: row.try_get("id")?,
        plugin: row.try_get("plugin")?,
        name: row.try_get("name")?,
        endpoint: row.try_get("endpoint")?,
        token: row.try_get("token")?,
        proxy: row.try_get("proxy")?,
        rate_limit_per_hour: rate_limit.and_then(|v| u32::try_from(v).ok()),
        extra,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn rule_from_row(row: &PgRow) -> Result<TransformationRule, StorageError> {
    let Json(payload): Json<Map<String, Value>> = row.try_get("payload")?;
    Ok(TransformationRule {
        id: row.try_get("id")?,
        plugin: row.try_get("plugin")?,
        connection_id: row.try_get("connection_id")?,
        name: row.try_get("name")?,
        payload,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn scope_from_row(row: &PgRow) -> Result<Scope, StorageError> {
    let Json(data): Json<Map<String, Value>> = row.try_get("data")?;
    Ok(Scope {
        plugin: row.try_get("plugin")?,
        connection_id: row.try_get("connection_id")?,
        id: row.try_get("scope_id")?,
        name: row.try_get("name")?,
        transformation_rule_id: row.try_get("transformation_rule_id")?,
        data,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn project_from_row(row: &PgRow) -> Result<Project, StorageError> {
    Ok(Project {
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
    })
}

fn blueprint_from_row(row: &PgRow) -> Result<Blueprint, StorageError> {
    let settings: Option<Json<BlueprintSettings>> = row.try_get("settings")?;
    let Json(plan): Json<PersistedPlan> = row.try_get("plan")?;
    let mode: String = row.try_get("mode")?;
    Ok(Blueprint {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        project_name: row.try_get("project_name")?,
        mode: mode.parse().map_err(StorageError::Serialization)?,
        enable: row.try_get("enable")?,
        cron_config: row.try_get("cron_config")?,
        is_manual: row.try_get("is_manual")?,
        skip_on_fail: row.try_get("skip_on_fail")?,
        settings: settings.map(|Json(s)| s),
        plan,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn pipeline_from_row(row: &PgRow) -> Result<Pipeline, StorageError> {
    let Json(plan): Json<PipelinePlan> = row.try_get("plan")?;
    let status: String = row.try_get("status")?;
    Ok(Pipeline {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        blueprint_id: row.try_get("blueprint_id")?,
        plan,
        status: status.parse().map_err(StorageError::Serialization)?,
        total_tasks: codec::to_count(row.try_get("total_tasks")?),
        finished_tasks: codec::to_count(row.try_get("finished_tasks")?),
        failed_tasks: codec::to_count(row.try_get("failed_tasks")?),
        error_name: row.try_get("error_name")?,
        skip_on_fail: row.try_get("skip_on_fail")?,
        created_at: row.try_get("created_at")?,
        began_at: row.try_get("began_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

async fn write_blueprint_index(
    conn: &mut PgConnection,
    blueprint: &Blueprint,
) -> Result<(), StorageError> {
    sqlx::query("DELETE FROM blueprint_scopes WHERE blueprint_id = $1")
        .bind(blueprint.id)
        .execute(&mut *conn)
        .await?;
    for key in blueprint.referenced_scopes() {
        sqlx::query(
            r#"
            INSERT INTO blueprint_scopes (blueprint_id, plugin, connection_id, scope_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(blueprint.id)
        .bind(&key.plugin)
        .bind(key.connection_id)
        .bind(&key.scope_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn write_blueprint(
    conn: &mut PgConnection,
    blueprint: &Blueprint,
) -> Result<(), StorageError> {
    let result = sqlx::query(
        r#"
        UPDATE blueprints
        SET name = $2, project_name = $3, mode = $4, enable = $5, cron_config = $6,
            is_manual = $7, skip_on_fail = $8, settings = $9, plan = $10, updated_at = $11
        WHERE id = $1
        "#,
    )
    .bind(blueprint.id)
    .bind(&blueprint.name)
    .bind(&blueprint.project_name)
    .bind(blueprint.mode.as_str())
    .bind(blueprint.enable)
    .bind(&blueprint.cron_config)
    .bind(blueprint.is_manual)
    .bind(blueprint.skip_on_fail)
    .bind(blueprint.settings.as_ref().map(Json))
    .bind(Json(&blueprint.plan))
    .bind(blueprint.updated_at)
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StorageError::not_found("blueprint", blueprint.id));
    }
    write_blueprint_index(conn, blueprint).await
}

#[async_trait]
impl StorageBackend for PostgresStorageBackend {
    async fn create_connection(&self, connection: Connection) -> Result<Connection, StorageError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO connections (plugin, name, endpoint, token, proxy, rate_limit_per_hour, extra, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(&connection.plugin)
        .bind(&connection.name)
        .bind(&connection.endpoint)
        .bind(&connection.token)
        .bind(&connection.proxy)
        .bind(connection.rate_limit_per_hour.map(i64::from))
        .bind(Json(&connection.extra))
        .bind(connection.created_at)
        .bind(connection.updated_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(Connection { id, ..connection })
    }

    async fn get_connection(
        &self,
        plugin: &str,
        connection_id: i64,
    ) -> Result<Option<Connection>, StorageError> {
        sqlx::query("SELECT * FROM connections WHERE plugin = $1 AND id = $2")
            .bind(plugin)
            .bind(connection_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(connection_from_row)
            .transpose()
    }

    async fn list_connections(&self, plugin: &str) -> Result<Vec<Connection>, StorageError> {
        let rows = sqlx::query("SELECT * FROM connections WHERE plugin = $1 ORDER BY id")
            .bind(plugin)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(connection_from_row).collect()
    }

    async fn update_connection(&self, connection: &Connection) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE connections
            SET name = $3, endpoint = $4, token = $5, proxy = $6, rate_limit_per_hour = $7,
                extra = $8, updated_at = $9
            WHERE plugin = $1 AND id = $2
            "#,
        )
        .bind(&connection.plugin)
        .bind(connection.id)
        .bind(&connection.name)
        .bind(&connection.endpoint)
        .bind(&connection.token)
        .bind(&connection.proxy)
        .bind(connection.rate_limit_per_hour.map(i64::from))
        .bind(Json(&connection.extra))
        .bind(connection.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("connection", connection.id));
        }
        Ok(())
    }

    async fn delete_connection(
        &self,
        plugin: &str,
        connection_id: i64,
    ) -> Result<Deletion<ConnectionDependents>, StorageError> {
        let mut tx = self.pool.begin().await?;
        let locked: Option<i64> =
            sqlx::query_scalar("SELECT id FROM connections WHERE plugin = $1 AND id = $2 FOR UPDATE")
                .bind(plugin)
                .bind(connection_id)
                .fetch_optional(&mut *tx)
                .await?;
        if locked.is_none() {
            return Ok(Deletion::NotFound);
        }
        let scopes: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM scopes WHERE plugin = $1 AND connection_id = $2",
        )
        .bind(plugin)
        .bind(connection_id)
        .fetch_one(&mut *tx)
        .await?;
        let rules: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM transformation_rules WHERE plugin = $1 AND connection_id = $2",
        )
        .bind(plugin)
        .bind(connection_id)
        .fetch_one(&mut *tx)
        .await?;
        if scopes > 0 || rules > 0 {
            return Ok(Deletion::InUse(ConnectionDependents {
                scopes: scopes as u64,
                rules: rules as u64,
            }));
        }
        sqlx::query("DELETE FROM connections WHERE plugin = $1 AND id = $2")
            .bind(plugin)
            .bind(connection_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Deletion::Deleted)
    }

    async fn create_rule(
        &self,
        rule: TransformationRule,
    ) -> Result<TransformationRule, StorageError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO transformation_rules (plugin, connection_id, name, payload, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(&rule.plugin)
        .bind(rule.connection_id)
        .bind(&rule.name)
        .bind(Json(&rule.payload))
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(TransformationRule { id, ..rule })
    }

    async fn get_rule(
        &self,
        plugin: &str,
        connection_id: i64,
        rule_id: i64,
    ) -> Result<Option<TransformationRule>, StorageError> {
        sqlx::query(
            "SELECT * FROM transformation_rules WHERE plugin = $1 AND connection_id = $2 AND id = $3",
        )
        .bind(plugin)
        .bind(connection_id)
        .bind(rule_id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(rule_from_row)
        .transpose()
    }

    async fn list_rules(
        &self,
        plugin: &str,
        connection_id: i64,
    ) -> Result<Vec<TransformationRule>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM transformation_rules WHERE plugin = $1 AND connection_id = $2 ORDER BY id",
        )
        .bind(plugin)
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(rule_from_row).collect()
    }

    async fn update_rule(&self, rule: &TransformationRule) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE transformation_rules SET name = $4, payload = $5, updated_at = $6
            WHERE plugin = $1 AND connection_id = $2 AND id = $3
            "#,
        )
        .bind(&rule.plugin)
        .bind(rule.connection_id)
        .bind(rule.id)
        .bind(&rule.name)
        .bind(Json(&rule.payload))
        .bind(rule.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
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
        let mut tx = self.pool.begin().await?;
        let users: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT scope_id FROM scopes
            WHERE plugin = $1 AND connection_id = $2 AND transformation_rule_id = $3
            ORDER BY seq
            "#,
        )
        .bind(plugin)
        .bind(connection_id)
        .bind(rule_id)
        .fetch_all(&mut *tx)
        .await?;
        if !users.is_empty() {
            return Ok(Deletion::InUse(users));
        }
        let result = sqlx::query(
            "DELETE FROM transformation_rules WHERE plugin = $1 AND connection_id = $2 AND id = $3",
        )
        .bind(plugin)
        .bind(connection_id)
        .bind(rule_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(if result.rows_affected() == 0 {
            Deletion::NotFound
        } else {
            Deletion::Deleted
        })
    }

    async fn get_scope(&self, key: &ScopeKey) -> Result<Option<Scope>, StorageError> {
        sqlx::query(
            "SELECT * FROM scopes WHERE plugin = $1 AND connection_id = $2 AND scope_id = $3",
        )
        .bind(&key.plugin)
        .bind(key.connection_id)
        .bind(&key.scope_id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(scope_from_row)
        .transpose()
    }

    async fn list_scopes(
        &self,
        plugin: &str,
        connection_id: i64,
    ) -> Result<Vec<Scope>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM scopes WHERE plugin = $1 AND connection_id = $2 ORDER BY seq",
        )
        .bind(plugin)
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(scope_from_row).collect()
    }

    async fn upsert_scopes(&self, scopes: &[Scope]) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        for scope in scopes {
            sqlx::query(
                r#"
                INSERT INTO scopes (plugin, connection_id, scope_id, name, transformation_rule_id, data, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (plugin, connection_id, scope_id) DO UPDATE SET
                    name = EXCLUDED.name,
                    transformation_rule_id = EXCLUDED.transformation_rule_id,
                    data = EXCLUDED.data,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(&scope.plugin)
            .bind(scope.connection_id)
            .bind(&scope.id)
            .bind(&scope.name)
            .bind(scope.transformation_rule_id)
            .bind(Json(&scope.data))
            .bind(scope.created_at)
            .bind(scope.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn scope_blueprint_refs(
        &self,
        plugin: &str,
        connection_id: i64,
    ) -> Result<HashMap<String, Vec<BlueprintRef>>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT bs.scope_id, b.id, b.name
            FROM blueprint_scopes bs JOIN blueprints b ON b.id = bs.blueprint_id
            WHERE bs.plugin = $1 AND bs.connection_id = $2
            ORDER BY b.id
            "#,
        )
        .bind(plugin)
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await?;
        let mut refs: HashMap<String, Vec<BlueprintRef>> = HashMap::new();
        for row in rows {
            refs.entry(row.try_get("scope_id")?)
                .or_default()
                .push(BlueprintRef {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                });
        }
        Ok(refs)
    }

    async fn blueprints_referencing(
        &self,
        key: &ScopeKey,
    ) -> Result<Vec<BlueprintRef>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT b.id, b.name
            FROM blueprint_scopes bs JOIN blueprints b ON b.id = bs.blueprint_id
            WHERE bs.plugin = $1 AND bs.connection_id = $2 AND bs.scope_id = $3
            ORDER BY b.id
            "#,
        )
        .bind(&key.plugin)
        .bind(key.connection_id)
        .bind(&key.scope_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(BlueprintRef {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                })
            })
            .collect()
    }

    async fn delete_scope_cascade(
        &self,
        key: &ScopeKey,
        delete_data_only: bool,
    ) -> Result<Vec<i64>, StorageError> {
        let mut tx = self.pool.begin().await?;
        let exists: Option<String> = sqlx::query_scalar(
            r#"
            SELECT scope_id FROM scopes
            WHERE plugin = $1 AND connection_id = $2 AND scope_id = $3
            FOR UPDATE
            "#,
        )
        .bind(&key.plugin)
        .bind(key.connection_id)
        .bind(&key.scope_id)
        .fetch_optional(&mut *tx)
        .await?;
        if exists.is_none() {
            return Err(StorageError::not_found("scope", key));
        }
        let rows = sqlx::query(
            r#"
            SELECT b.* FROM blueprints b
            WHERE b.id IN (
                SELECT blueprint_id FROM blueprint_scopes
                WHERE plugin = $1 AND connection_id = $2 AND scope_id = $3
            )
            ORDER BY b.id
            FOR UPDATE
            "#,
        )
        .bind(&key.plugin)
        .bind(key.connection_id)
        .bind(&key.scope_id)
        .fetch_all(&mut *tx)
        .await?;
        let mut blueprints = rows
            .iter()
            .map(blueprint_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let ids = blueprints.iter().map(|b| b.id).collect();
        if delete_data_only {
            tx.commit().await?;
            return Ok(ids);
        }
        let now = Utc::now();
        for blueprint in &mut blueprints {
            blueprint.detach_scope(key, now);
            write_blueprint(&mut tx, blueprint).await?;
        }
        sqlx::query(
            "DELETE FROM blueprint_scopes WHERE plugin = $1 AND connection_id = $2 AND scope_id = $3",
        )
        .bind(&key.plugin)
        .bind(key.connection_id)
        .bind(&key.scope_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM scopes WHERE plugin = $1 AND connection_id = $2 AND scope_id = $3")
            .bind(&key.plugin)
            .bind(key.connection_id)
            .bind(&key.scope_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(ids)
    }

    async fn create_project(&self, project: Project) -> Result<Project, StorageError> {
        sqlx::query("INSERT INTO projects (name, description, created_at) VALUES ($1, $2, $3)")
            .bind(&project.name)
            .bind(&project.description)
            .bind(project.created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| match StorageError::from(e) {
                StorageError::Conflict { .. } => {
                    StorageError::conflict("project", format!("{} already exists", project.name))
                }
                other => other,
            })?;
        Ok(project)
    }

    async fn get_project(&self, name: &str) -> Result<Option<Project>, StorageError> {
        sqlx::query("SELECT name, description, created_at FROM projects WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(project_from_row)
            .transpose()
    }

    async fn list_projects(&self) -> Result<Vec<Project>, StorageError> {
        let rows = sqlx::query("SELECT name, description, created_at FROM projects ORDER BY seq")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(project_from_row).collect()
    }

    async fn create_blueprint(&self, blueprint: Blueprint) -> Result<Blueprint, StorageError> {
        let mut tx = self.pool.begin().await?;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO blueprints (name, project_name, mode, enable, cron_config, is_manual, skip_on_fail, settings, plan, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            "#,
        )
        .bind(&blueprint.name)
        .bind(&blueprint.project_name)
        .bind(blueprint.mode.as_str())
        .bind(blueprint.enable)
        .bind(&blueprint.cron_config)
        .bind(blueprint.is_manual)
        .bind(blueprint.skip_on_fail)
        .bind(blueprint.settings.as_ref().map(Json))
        .bind(Json(&blueprint.plan))
        .bind(blueprint.created_at)
        .bind(blueprint.updated_at)
        .fetch_one(&mut *tx)
        .await?;
        let created = Blueprint { id, ..blueprint };
        write_blueprint_index(&mut tx, &created).await?;
        tx.commit().await?;
        Ok(created)
    }

    async fn get_blueprint(&self, blueprint_id: i64) -> Result<Option<Blueprint>, StorageError> {
        sqlx::query("SELECT * FROM blueprints WHERE id = $1")
            .bind(blueprint_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(blueprint_from_row)
            .transpose()
    }

    async fn get_blueprint_by_project(
        &self,
        project_name: &str,
    ) -> Result<Option<Blueprint>, StorageError> {
        sqlx::query("SELECT * FROM blueprints WHERE project_name = $1")
            .bind(project_name)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(blueprint_from_row)
            .transpose()
    }

    async fn list_blueprints(&self) -> Result<Vec<Blueprint>, StorageError> {
        let rows = sqlx::query("SELECT * FROM blueprints ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(blueprint_from_row).collect()
    }

    async fn update_blueprint(&self, blueprint: &Blueprint) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        write_blueprint(&mut tx, blueprint).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_blueprint(&self, blueprint_id: i64) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM blueprints WHERE id = $1")
            .bind(blueprint_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_pipeline(&self, pipeline: Pipeline) -> Result<Pipeline, StorageError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO pipelines (name, blueprint_id, plan, status, total_tasks, finished_tasks, failed_tasks, error_name, skip_on_fail, created_at, began_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id
            "#,
        )
        .bind(&pipeline.name)
        .bind(pipeline.blueprint_id)
        .bind(Json(&pipeline.plan))
        .bind(pipeline.status.as_str())
        .bind(pipeline.total_tasks as i64)
        .bind(pipeline.finished_tasks as i64)
        .bind(pipeline.failed_tasks as i64)
        .bind(&pipeline.error_name)
        .bind(pipeline.skip_on_fail)
        .bind(pipeline.created_at)
        .bind(pipeline.began_at)
        .bind(pipeline.finished_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(Pipeline { id, ..pipeline })
    }

    async fn get_pipeline(&self, pipeline_id: i64) -> Result<Option<Pipeline>, StorageError> {
        sqlx::query("SELECT * FROM pipelines WHERE id = $1")
            .bind(pipeline_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(pipeline_from_row)
            .transpose()
    }

    async fn list_pipelines(
        &self,
        blueprint_id: Option<i64>,
    ) -> Result<Vec<Pipeline>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM pipelines WHERE ($1::BIGINT IS NULL OR blueprint_id = $1) ORDER BY id",
        )
        .bind(blueprint_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(pipeline_from_row).collect()
    }

    async fn update_pipeline(&self, pipeline: &Pipeline) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE pipelines
            SET status = $2, finished_tasks = $3, failed_tasks = $4, error_name = $5,
                began_at = $6, finished_at = $7
            WHERE id = $1 AND status NOT IN ('TASK_COMPLETED', 'TASK_FAILED', 'TASK_CANCELLED')
            "#,
        )
        .bind(pipeline.id)
        .bind(pipeline.status.as_str())
        .bind(pipeline.finished_tasks as i64)
        .bind(pipeline.failed_tasks as i64)
        .bind(&pipeline.error_name)
        .bind(pipeline.began_at)
        .bind(pipeline.finished_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(());
        }
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM pipelines WHERE id = $1")
            .bind(pipeline.id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Err(StorageError::conflict(
                "pipeline",
                format!("pipeline {} already finished", pipeline.id),
            )),
            None => Err(StorageError::not_found("pipeline", pipeline.id)),
        }
    }
}
