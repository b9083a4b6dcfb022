// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL registry operations.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres};

use super::{Counter, Registry, Sourced, StatusChange};
use crate::error::{Error, Result};
use crate::model::{FunctionRecord, FunctionStatus, FunctionVersion, Trigger};

/// Registry backed by the `functions` and `function_versions` tables.
#[derive(Clone)]
pub struct DurableRegistry {
    pool: PgPool,
}

impl DurableRegistry {
    /// Create a new durable registry
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Function Operations
// ============================================================================

const INSERT_FUNCTION: &str = r#"
    INSERT INTO functions (
        tenant_id, name, id, runtime, handler, memory_mb, timeout_seconds,
        environment, description, version, status, code_ref, endpoint, error,
        aliases, triggers, invocation_count, error_count, created_at, updated_at
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
"#;

/// True when the incoming row may replace the stored status, endpoint and error.
const ACCEPTS_STATUS: &str = r#"
    functions.version < EXCLUDED.version
    OR (functions.status, EXCLUDED.status) IN (
        ('deploying', 'building'), ('building', 'deployed'), ('building', 'failed')
    )
"#;

fn bind_function<'q>(
    query: Query<'q, Postgres, PgArguments>,
    record: &'q FunctionRecord,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(&record.tenant_id)
        .bind(&record.name)
        .bind(&record.id)
        .bind(record.runtime.as_str())
        .bind(&record.handler)
        .bind(record.memory_mb as i32)
        .bind(record.timeout_seconds as i32)
        .bind(Json(&record.environment))
        .bind(&record.description)
        .bind(record.version as i32)
        .bind(record.status.as_str())
        .bind(record.code_ref.to_string())
        .bind(&record.endpoint)
        .bind(&record.error)
        .bind(Json(&record.aliases))
        .bind(Json(&record.triggers))
        .bind(record.invocation_count as i64)
        .bind(record.error_count as i64)
        .bind(record.created_at)
        .bind(record.updated_at)
}

/// Upsert a function record. Returns false when the stored row has a newer
/// version and the write was ignored.
///
/// Counters take the larger value, aliases and triggers are merged, and at the
/// stored version the status only moves to a legal successor.
pub async fn upsert_function(pool: &PgPool, record: &FunctionRecord) -> Result<bool> {
    let sql = format!(
        r#"
        {insert}
        ON CONFLICT (tenant_id, name) DO UPDATE SET
            id = EXCLUDED.id,
            runtime = EXCLUDED.runtime,
            handler = EXCLUDED.handler,
            memory_mb = EXCLUDED.memory_mb,
            timeout_seconds = EXCLUDED.timeout_seconds,
            environment = EXCLUDED.environment,
            description = EXCLUDED.description,
            version = EXCLUDED.version,
            status = CASE WHEN {accepts} THEN EXCLUDED.status ELSE functions.status END,
            code_ref = EXCLUDED.code_ref,
            endpoint = CASE WHEN {accepts} THEN EXCLUDED.endpoint ELSE functions.endpoint END,
            error = CASE WHEN {accepts} THEN EXCLUDED.error ELSE functions.error END,
            aliases = functions.aliases || EXCLUDED.aliases,
            triggers = EXCLUDED.triggers || COALESCE((
                SELECT jsonb_agg(stored.t)
                FROM jsonb_array_elements(functions.triggers) AS stored(t)
                WHERE NOT EXISTS (
                    SELECT 1 FROM jsonb_array_elements(EXCLUDED.triggers) AS incoming(t)
                    WHERE incoming.t->>'trigger_id' = stored.t->>'trigger_id'
                )
            ), '[]'::jsonb),
            invocation_count = GREATEST(functions.invocation_count, EXCLUDED.invocation_count),
            error_count = GREATEST(functions.error_count, EXCLUDED.error_count),
            created_at = EXCLUDED.created_at,
            updated_at = EXCLUDED.updated_at
        WHERE functions.version <= EXCLUDED.version
        "#,
        insert = INSERT_FUNCTION,
        accepts = ACCEPTS_STATUS,
    );
    let result = bind_function(sqlx::query(&sql), record)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Insert a function record unless the name is taken for the tenant.
pub async fn insert_function(pool: &PgPool, record: &FunctionRecord) -> Result<bool> {
    let sql = format!("{} ON CONFLICT (tenant_id, name) DO NOTHING", INSERT_FUNCTION);
    let result = bind_function(sqlx::query(&sql), record)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Apply a status change if the row still has the expected version and status.
pub async fn update_status(pool: &PgPool, change: &StatusChange) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE functions
        SET status = $5, endpoint = $6, error = $7, updated_at = $8
        WHERE tenant_id = $1 AND name = $2 AND version = $3 AND status = $4
        "#,
    )
    .bind(&change.tenant_id)
    .bind(&change.name)
    .bind(change.version as i32)
    .bind(change.from.as_str())
    .bind(change.to.as_str())
    .bind(&change.endpoint)
    .bind(&change.error)
    .bind(change.updated_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Point an alias at a version, leaving other aliases untouched.
pub async fn set_alias(
    pool: &PgPool,
    tenant_id: &str,
    name: &str,
    alias: &str,
    version: u32,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE functions
        SET aliases = aliases || jsonb_build_object($3::text, $4::integer), updated_at = $5
        WHERE tenant_id = $1 AND name = $2
        "#,
    )
    .bind(tenant_id)
    .bind(name)
    .bind(alias)
    .bind(version as i32)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Append a trigger to a function.
pub async fn add_trigger(
    pool: &PgPool,
    tenant_id: &str,
    name: &str,
    trigger: &Trigger,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE functions
        SET triggers = triggers || jsonb_build_array($3::jsonb), updated_at = $4
        WHERE tenant_id = $1 AND name = $2
        "#,
    )
    .bind(tenant_id)
    .bind(name)
    .bind(Json(trigger))
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Get a function by tenant and name.
pub async fn get_function(
    pool: &PgPool,
    tenant_id: &str,
    name: &str,
) -> Result<Option<FunctionRecord>> {
    let row: Option<FunctionRow> = sqlx::query_as(
        r#"
        SELECT tenant_id, name, id, runtime, handler, memory_mb, timeout_seconds,
               environment, description, version, status, code_ref, endpoint, error,
               aliases, triggers, invocation_count, error_count, created_at, updated_at
        FROM functions
        WHERE tenant_id = $1 AND name = $2
        "#,
    )
    .bind(tenant_id)
    .bind(name)
    .fetch_optional(pool)
    .await?;

    row.map(FunctionRecord::try_from).transpose()
}

/// List functions for a tenant.
pub async fn list_functions(pool: &PgPool, tenant_id: &str) -> Result<Vec<FunctionRecord>> {
    let rows: Vec<FunctionRow> = sqlx::query_as(
        r#"
        SELECT tenant_id, name, id, runtime, handler, memory_mb, timeout_seconds,
               environment, description, version, status, code_ref, endpoint, error,
               aliases, triggers, invocation_count, error_count, created_at, updated_at
        FROM functions
        WHERE tenant_id = $1
        ORDER BY name
        "#,
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(FunctionRecord::try_from).collect()
}

/// List functions of every tenant in one of the given statuses.
pub async fn list_functions_by_status(
    pool: &PgPool,
    statuses: &[FunctionStatus],
) -> Result<Vec<FunctionRecord>> {
    let statuses: Vec<String> = statuses.iter().map(|s| s.to_string()).collect();
    let rows: Vec<FunctionRow> = sqlx::query_as(
        r#"
        SELECT tenant_id, name, id, runtime, handler, memory_mb, timeout_seconds,
               environment, description, version, status, code_ref, endpoint, error,
               aliases, triggers, invocation_count, error_count, created_at, updated_at
        FROM functions
        WHERE status = ANY($1)
        ORDER BY updated_at
        "#,
    )
    .bind(&statuses)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(FunctionRecord::try_from).collect()
}

/// Delete a function and its version history.
pub async fn delete_function(pool: &PgPool, tenant_id: &str, name: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM function_versions WHERE tenant_id = $1 AND name = $2")
        .bind(tenant_id)
        .bind(name)
        .execute(&mut *tx)
        .await?;

    let result = sqlx::query("DELETE FROM functions WHERE tenant_id = $1 AND name = $2")
        .bind(tenant_id)
        .bind(name)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}

/// Atomically add one to a counter column.
pub async fn increment_counter(
    pool: &PgPool,
    tenant_id: &str,
    name: &str,
    counter: Counter,
) -> Result<bool> {
    let query = format!(
        "UPDATE functions SET {column} = {column} + 1 WHERE tenant_id = $1 AND name = $2",
        column = counter.column()
    );
    let result = sqlx::query(&query)
        .bind(tenant_id)
        .bind(name)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

// ============================================================================
// Version History
// ============================================================================

/// Insert a version history entry if absent.
pub async fn insert_version(pool: &PgPool, version: &FunctionVersion) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO function_versions (
            tenant_id, name, version, description, runtime, handler, code_ref, status, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (tenant_id, name, version) DO NOTHING
        "#,
    )
    .bind(&version.tenant_id)
    .bind(&version.name)
    .bind(version.version as i32)
    .bind(&version.description)
    .bind(version.runtime.as_str())
    .bind(&version.handler)
    .bind(version.code_ref.to_string())
    .bind(version.status.as_str())
    .bind(version.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Version history of a function, oldest first.
pub async fn list_versions(
    pool: &PgPool,
    tenant_id: &str,
    name: &str,
) -> Result<Vec<FunctionVersion>> {
    let rows: Vec<VersionRow> = sqlx::query_as(
        r#"
        SELECT tenant_id, name, version, description, runtime, handler, code_ref, status, created_at
        FROM function_versions
        WHERE tenant_id = $1 AND name = $2
        ORDER BY version
        "#,
    )
    .bind(tenant_id)
    .bind(name)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(FunctionVersion::try_from).collect()
}

#[async_trait]
impl Registry for DurableRegistry {
    async fn put(&self, record: &FunctionRecord) -> Result<Sourced<()>> {
        if !upsert_function(&self.pool, record).await? {
            tracing::debug!(
                tenant_id = %record.tenant_id,
                function = %record.name,
                version = record.version,
                "Ignored write for superseded version"
            );
        }
        Ok(Sourced::durable(()))
    }

    async fn insert(&self, record: &FunctionRecord) -> Result<Sourced<bool>> {
        insert_function(&self.pool, record)
            .await
            .map(Sourced::durable)
    }

    async fn update_status(&self, change: &StatusChange) -> Result<Sourced<bool>> {
        update_status(&self.pool, change)
            .await
            .map(Sourced::durable)
    }

    async fn set_alias(
        &self,
        tenant_id: &str,
        name: &str,
        alias: &str,
        version: u32,
    ) -> Result<Sourced<bool>> {
        set_alias(&self.pool, tenant_id, name, alias, version)
            .await
            .map(Sourced::durable)
    }

    async fn add_trigger(
        &self,
        tenant_id: &str,
        name: &str,
        trigger: &Trigger,
    ) -> Result<Sourced<bool>> {
        add_trigger(&self.pool, tenant_id, name, trigger)
            .await
            .map(Sourced::durable)
    }

    async fn get(&self, tenant_id: &str, name: &str) -> Result<Sourced<Option<FunctionRecord>>> {
        get_function(&self.pool, tenant_id, name)
            .await
            .map(Sourced::durable)
    }

    async fn list(&self, tenant_id: &str) -> Result<Sourced<Vec<FunctionRecord>>> {
        list_functions(&self.pool, tenant_id)
            .await
            .map(Sourced::durable)
    }

    async fn delete(&self, tenant_id: &str, name: &str) -> Result<Sourced<bool>> {
        delete_function(&self.pool, tenant_id, name)
            .await
            .map(Sourced::durable)
    }

    async fn increment_counter(
        &self,
        tenant_id: &str,
        name: &str,
        counter: Counter,
    ) -> Result<Sourced<bool>> {
        increment_counter(&self.pool, tenant_id, name, counter)
            .await
            .map(Sourced::durable)
    }

    async fn put_version(&self, version: &FunctionVersion) -> Result<Sourced<()>> {
        insert_version(&self.pool, version)
            .await
            .map(Sourced::durable)
    }

    async fn list_versions(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> Result<Sourced<Vec<FunctionVersion>>> {
        list_versions(&self.pool, tenant_id, name)
            .await
            .map(Sourced::durable)
    }

    async fn list_by_status(
        &self,
        statuses: &[FunctionStatus],
    ) -> Result<Sourced<Vec<FunctionRecord>>> {
        list_functions_by_status(&self.pool, statuses)
            .await
            .map(Sourced::durable)
    }
}

// ============================================================================
// Row Types
// ============================================================================

/// Internal row type for `functions`
#[derive(sqlx::FromRow)]
struct FunctionRow {
    tenant_id: String,
    name: String,
    id: String,
    runtime: String,
    handler: String,
    memory_mb: i32,
    timeout_seconds: i32,
    environment: Json<HashMap<String, String>>,
    description: String,
    version: i32,
    status: String,
    code_ref: String,
    endpoint: Option<String>,
    error: Option<String>,
    aliases: Json<BTreeMap<String, u32>>,
    triggers: Json<Vec<Trigger>>,
    invocation_count: i64,
    error_count: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn decode_error(message: String) -> Error {
    Error::Database(sqlx::Error::Decode(message.into()))
}

impl TryFrom<FunctionRow> for FunctionRecord {
    type Error = Error;

    fn try_from(row: FunctionRow) -> Result<Self> {
        Ok(FunctionRecord {
            runtime: row.runtime.parse()?,
            status: row.status.parse().map_err(decode_error)?,
            code_ref: row.code_ref.parse().map_err(decode_error)?,
            id: row.id,
            tenant_id: row.tenant_id,
            name: row.name,
            handler: row.handler,
            memory_mb: row.memory_mb.max(0) as u32,
            timeout_seconds: row.timeout_seconds.max(0) as u32,
            environment: row.environment.0,
            description: row.description,
            version: row.version.max(1) as u32,
            endpoint: row.endpoint,
            error: row.error,
            aliases: row.aliases.0,
            triggers: row.triggers.0,
            invocation_count: row.invocation_count.max(0) as u64,
            error_count: row.error_count.max(0) as u64,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Internal row type for `function_versions`
#[derive(sqlx::FromRow)]
struct VersionRow {
    tenant_id: String,
    name: String,
    version: i32,
    description: String,
    runtime: String,
    handler: String,
    code_ref: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<VersionRow> for FunctionVersion {
    type Error = Error;

    fn try_from(row: VersionRow) -> Result<Self> {
        Ok(FunctionVersion {
            runtime: row.runtime.parse()?,
            status: row.status.parse().map_err(decode_error)?,
            code_ref: row.code_ref.parse().map_err(decode_error)?,
            tenant_id: row.tenant_id,
            name: row.name,
            version: row.version.max(1) as u32,
            description: row.description,
            handler: row.handler,
            created_at: row.created_at,
        })
    }
}
