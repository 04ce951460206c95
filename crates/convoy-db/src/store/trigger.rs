//! Trigger rules.

use async_trait::async_trait;
use convoy_core::ResourceId;
use convoy_core::trigger::Trigger;
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, sqlx::FromRow)]
struct TriggerRow {
    id: uuid::Uuid,
    project_id: uuid::Uuid,
    name: String,
    primary_repo_ids: Vec<uuid::Uuid>,
    dependency_repo_ids: Vec<uuid::Uuid>,
    config_id: uuid::Uuid,
    priority: i32,
}

impl From<TriggerRow> for Trigger {
    fn from(row: TriggerRow) -> Self {
        Trigger {
            id: row.id.into(),
            project_id: row.project_id.into(),
            name: row.name,
            primary_repo_ids: row.primary_repo_ids.into_iter().map(Into::into).collect(),
            dependency_repo_ids: row.dependency_repo_ids.into_iter().map(Into::into).collect(),
            config_id: row.config_id.into(),
            priority: row.priority,
        }
    }
}

#[async_trait]
pub trait TriggerStore: Send + Sync {
    async fn create_trigger(&self, trigger: Trigger) -> DbResult<Trigger>;
    async fn trigger(&self, id: ResourceId) -> DbResult<Trigger>;
    async fn triggers_for_project(&self, project_id: ResourceId) -> DbResult<Vec<Trigger>>;
}

/// PostgreSQL implementation of TriggerStore.
pub struct PgTriggerStore {
    pool: PgPool,
}

impl PgTriggerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TriggerStore for PgTriggerStore {
    async fn create_trigger(&self, trigger: Trigger) -> DbResult<Trigger> {
        let row = sqlx::query_as::<_, TriggerRow>(
            r#"
            INSERT INTO triggers
                (id, project_id, name, primary_repo_ids, dependency_repo_ids, config_id, priority)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(trigger.id.as_uuid())
        .bind(trigger.project_id.as_uuid())
        .bind(&trigger.name)
        .bind(trigger.primary_repo_ids.iter().map(|id| *id.as_uuid()).collect::<Vec<_>>())
        .bind(trigger.dependency_repo_ids.iter().map(|id| *id.as_uuid()).collect::<Vec<_>>())
        .bind(trigger.config_id.as_uuid())
        .bind(trigger.priority)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn trigger(&self, id: ResourceId) -> DbResult<Trigger> {
        let row = sqlx::query_as::<_, TriggerRow>("SELECT * FROM triggers WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("trigger {id}")))?;
        Ok(row.into())
    }

    async fn triggers_for_project(&self, project_id: ResourceId) -> DbResult<Vec<Trigger>> {
        let rows = sqlx::query_as::<_, TriggerRow>(
            "SELECT * FROM triggers WHERE project_id = $1 ORDER BY priority DESC, name",
        )
        .bind(project_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
