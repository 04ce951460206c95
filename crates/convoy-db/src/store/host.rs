//! Worker host registry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_core::host::Host;
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, sqlx::FromRow)]
struct HostRow {
    id: uuid::Uuid,
    name: String,
    display_name: String,
    nb_workers: i32,
    running_max: i32,
    assigned_only: bool,
    active: bool,
    degraded: bool,
    fetch_failure_count: i32,
    last_loop_start: Option<DateTime<Utc>>,
    last_loop_end: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
}

impl From<HostRow> for Host {
    fn from(row: HostRow) -> Self {
        Host {
            id: row.id.into(),
            name: row.name,
            display_name: row.display_name,
            nb_workers: row.nb_workers,
            running_max: row.running_max,
            assigned_only: row.assigned_only,
            active: row.active,
            degraded: row.degraded,
            fetch_failure_count: row.fetch_failure_count,
            last_loop_start: row.last_loop_start,
            last_loop_end: row.last_loop_end,
            last_success: row.last_success,
        }
    }
}

#[async_trait]
pub trait HostStore: Send + Sync {
    /// Fetch a host by name, registering it with the given defaults on
    /// first sight.
    async fn get_or_create_host(
        &self,
        name: &str,
        nb_workers: i32,
        running_max: i32,
    ) -> DbResult<Host>;
    async fn host(&self, name: &str) -> DbResult<Host>;
    async fn update_host(&self, host: &Host) -> DbResult<()>;
    async fn list_hosts(&self) -> DbResult<Vec<Host>>;
}

/// PostgreSQL implementation of HostStore.
pub struct PgHostStore {
    pool: PgPool,
}

impl PgHostStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HostStore for PgHostStore {
    async fn get_or_create_host(
        &self,
        name: &str,
        nb_workers: i32,
        running_max: i32,
    ) -> DbResult<Host> {
        let row = sqlx::query_as::<_, HostRow>(
            r#"
            INSERT INTO hosts
                (id, name, display_name, nb_workers, running_max, assigned_only, active,
                 degraded, fetch_failure_count)
            VALUES ($1, $2, $2, $3, $4, FALSE, TRUE, FALSE, 0)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(name)
        .bind(nb_workers)
        .bind(running_max)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn host(&self, name: &str) -> DbResult<Host> {
        let row = sqlx::query_as::<_, HostRow>("SELECT * FROM hosts WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("host {name}")))?;
        Ok(row.into())
    }

    async fn update_host(&self, host: &Host) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE hosts SET
                display_name = $2,
                nb_workers = $3,
                running_max = $4,
                assigned_only = $5,
                active = $6,
                degraded = $7,
                fetch_failure_count = $8,
                last_loop_start = $9,
                last_loop_end = $10,
                last_success = $11
            WHERE id = $1
            "#,
        )
        .bind(host.id.as_uuid())
        .bind(&host.display_name)
        .bind(host.nb_workers)
        .bind(host.running_max)
        .bind(host.assigned_only)
        .bind(host.active)
        .bind(host.degraded)
        .bind(host.fetch_failure_count)
        .bind(host.last_loop_start)
        .bind(host.last_loop_end)
        .bind(host.last_success)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_hosts(&self) -> DbResult<Vec<Host>> {
        let rows = sqlx::query_as::<_, HostRow>("SELECT * FROM hosts ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
