//! Bundles, batches, commit links and job slots.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_core::ResourceId;
use convoy_core::batch::{Batch, BatchState, CommitLink, MatchKind};
use convoy_core::bundle::Bundle;
use convoy_core::job::{JobSlot, LinkKind};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, sqlx::FromRow)]
struct BundleRow {
    id: uuid::Uuid,
    project_id: uuid::Uuid,
    name: String,
    is_base: bool,
    sticky: bool,
    priority: i32,
    defined_base_id: Option<uuid::Uuid>,
    no_build: bool,
    modules: Vec<String>,
    version_name: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<BundleRow> for Bundle {
    fn from(row: BundleRow) -> Self {
        Bundle {
            id: row.id.into(),
            project_id: row.project_id.into(),
            name: row.name,
            is_base: row.is_base,
            sticky: row.sticky,
            priority: row.priority,
            defined_base_id: row.defined_base_id.map(Into::into),
            no_build: row.no_build,
            modules: row.modules,
            version_name: row.version_name,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct BatchRow {
    id: uuid::Uuid,
    bundle_id: uuid::Uuid,
    state: String,
    last_update: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl TryFrom<BatchRow> for Batch {
    type Error = DbError;

    fn try_from(row: BatchRow) -> DbResult<Self> {
        Ok(Batch {
            id: row.id.into(),
            bundle_id: row.bundle_id.into(),
            state: BatchState::from_str(&row.state).map_err(DbError::Corrupt)?,
            last_update: row.last_update,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct CommitLinkRow {
    id: uuid::Uuid,
    batch_id: uuid::Uuid,
    repo_id: uuid::Uuid,
    commit_id: uuid::Uuid,
    sha: String,
    match_kind: String,
}

impl TryFrom<CommitLinkRow> for CommitLink {
    type Error = DbError;

    fn try_from(row: CommitLinkRow) -> DbResult<Self> {
        Ok(CommitLink {
            id: row.id.into(),
            batch_id: row.batch_id.into(),
            repo_id: row.repo_id.into(),
            commit_id: row.commit_id.into(),
            sha: row.sha,
            match_kind: MatchKind::from_str(&row.match_kind).map_err(DbError::Corrupt)?,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct JobSlotRow {
    id: uuid::Uuid,
    batch_id: uuid::Uuid,
    trigger_id: uuid::Uuid,
    job_id: Option<uuid::Uuid>,
    link: Option<String>,
    active: bool,
    skip_reason: Option<String>,
}

impl TryFrom<JobSlotRow> for JobSlot {
    type Error = DbError;

    fn try_from(row: JobSlotRow) -> DbResult<Self> {
        let link = row
            .link
            .map(|raw| LinkKind::from_str(&raw).map_err(DbError::Corrupt))
            .transpose()?;
        Ok(JobSlot {
            id: row.id.into(),
            batch_id: row.batch_id.into(),
            trigger_id: row.trigger_id.into(),
            job_id: row.job_id.map(Into::into),
            link,
            active: row.active,
            skip_reason: row.skip_reason,
        })
    }
}

#[async_trait]
pub trait BundleStore: Send + Sync {
    async fn create_bundle(&self, bundle: Bundle) -> DbResult<Bundle>;
    async fn bundle(&self, id: ResourceId) -> DbResult<Bundle>;
    async fn bundle_by_name(&self, project_id: ResourceId, name: &str) -> DbResult<Option<Bundle>>;
    /// All base bundles of a project, input to base resolution.
    async fn base_bundles(&self, project_id: ResourceId) -> DbResult<Vec<Bundle>>;

    async fn create_batch(&self, batch: Batch) -> DbResult<Batch>;
    async fn batch(&self, id: ResourceId) -> DbResult<Batch>;
    /// The bundle's single accumulating batch, if any.
    async fn accumulating_batch(&self, bundle_id: ResourceId) -> DbResult<Option<Batch>>;
    /// Accumulating batches whose last update is at or before the cutoff.
    async fn batches_due(&self, cutoff: DateTime<Utc>) -> DbResult<Vec<Batch>>;
    /// Open (accumulating or ready) batches of a bundle, oldest first.
    async fn open_batches(&self, bundle_id: ResourceId) -> DbResult<Vec<Batch>>;
    /// Recent ready/done batches of a bundle, newest first. Candidate pool
    /// for base-batch matching.
    async fn recent_closed_batches(&self, bundle_id: ResourceId, limit: i64) -> DbResult<Vec<Batch>>;
    async fn ready_batches(&self) -> DbResult<Vec<Batch>>;
    async fn set_batch_state(&self, batch_id: ResourceId, state: BatchState) -> DbResult<()>;
    async fn touch_batch(&self, batch_id: ResourceId, now: DateTime<Utc>) -> DbResult<()>;

    /// Insert a commit link, replacing an existing link for the same
    /// repository within the batch. Returns the replaced link, if any.
    async fn put_commit_link(&self, link: CommitLink) -> DbResult<Option<CommitLink>>;
    async fn commit_links(&self, batch_id: ResourceId) -> DbResult<Vec<CommitLink>>;

    async fn create_slot(&self, slot: JobSlot) -> DbResult<JobSlot>;
    async fn slot(&self, id: ResourceId) -> DbResult<JobSlot>;
    async fn slots_of_batch(&self, batch_id: ResourceId) -> DbResult<Vec<JobSlot>>;
    async fn slots_referencing_job(&self, job_id: ResourceId) -> DbResult<Vec<JobSlot>>;
}

/// PostgreSQL implementation of BundleStore.
pub struct PgBundleStore {
    pool: PgPool,
}

impl PgBundleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BundleStore for PgBundleStore {
    async fn create_bundle(&self, bundle: Bundle) -> DbResult<Bundle> {
        let row = sqlx::query_as::<_, BundleRow>(
            r#"
            INSERT INTO bundles
                (id, project_id, name, is_base, sticky, priority, defined_base_id,
                 no_build, modules, version_name, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(bundle.id.as_uuid())
        .bind(bundle.project_id.as_uuid())
        .bind(&bundle.name)
        .bind(bundle.is_base)
        .bind(bundle.sticky)
        .bind(bundle.priority)
        .bind(bundle.defined_base_id.map(|id| *id.as_uuid()))
        .bind(bundle.no_build)
        .bind(&bundle.modules)
        .bind(&bundle.version_name)
        .bind(bundle.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn bundle(&self, id: ResourceId) -> DbResult<Bundle> {
        let row = sqlx::query_as::<_, BundleRow>("SELECT * FROM bundles WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("bundle {id}")))?;
        Ok(row.into())
    }

    async fn bundle_by_name(&self, project_id: ResourceId, name: &str) -> DbResult<Option<Bundle>> {
        let row = sqlx::query_as::<_, BundleRow>(
            "SELECT * FROM bundles WHERE project_id = $1 AND name = $2",
        )
        .bind(project_id.as_uuid())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn base_bundles(&self, project_id: ResourceId) -> DbResult<Vec<Bundle>> {
        let rows = sqlx::query_as::<_, BundleRow>(
            "SELECT * FROM bundles WHERE project_id = $1 AND is_base ORDER BY name",
        )
        .bind(project_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn create_batch(&self, batch: Batch) -> DbResult<Batch> {
        let row = sqlx::query_as::<_, BatchRow>(
            r#"
            INSERT INTO batches (id, bundle_id, state, last_update, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(batch.id.as_uuid())
        .bind(batch.bundle_id.as_uuid())
        .bind(batch.state.as_str())
        .bind(batch.last_update)
        .bind(batch.created_at)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn batch(&self, id: ResourceId) -> DbResult<Batch> {
        let row = sqlx::query_as::<_, BatchRow>("SELECT * FROM batches WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("batch {id}")))?;
        row.try_into()
    }

    async fn accumulating_batch(&self, bundle_id: ResourceId) -> DbResult<Option<Batch>> {
        let row = sqlx::query_as::<_, BatchRow>(
            r#"
            SELECT * FROM batches
            WHERE bundle_id = $1 AND state = 'accumulating'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(bundle_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn batches_due(&self, cutoff: DateTime<Utc>) -> DbResult<Vec<Batch>> {
        let rows = sqlx::query_as::<_, BatchRow>(
            r#"
            SELECT * FROM batches
            WHERE state = 'accumulating' AND last_update <= $1
            ORDER BY last_update
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn open_batches(&self, bundle_id: ResourceId) -> DbResult<Vec<Batch>> {
        let rows = sqlx::query_as::<_, BatchRow>(
            r#"
            SELECT * FROM batches
            WHERE bundle_id = $1 AND state IN ('accumulating', 'ready')
            ORDER BY created_at
            "#,
        )
        .bind(bundle_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn recent_closed_batches(&self, bundle_id: ResourceId, limit: i64) -> DbResult<Vec<Batch>> {
        let rows = sqlx::query_as::<_, BatchRow>(
            r#"
            SELECT * FROM batches
            WHERE bundle_id = $1 AND state IN ('ready', 'done')
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(bundle_id.as_uuid())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn ready_batches(&self) -> DbResult<Vec<Batch>> {
        let rows = sqlx::query_as::<_, BatchRow>(
            "SELECT * FROM batches WHERE state = 'ready' ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn set_batch_state(&self, batch_id: ResourceId, state: BatchState) -> DbResult<()> {
        sqlx::query("UPDATE batches SET state = $2 WHERE id = $1")
            .bind(batch_id.as_uuid())
            .bind(state.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_batch(&self, batch_id: ResourceId, now: DateTime<Utc>) -> DbResult<()> {
        sqlx::query("UPDATE batches SET last_update = $2 WHERE id = $1")
            .bind(batch_id.as_uuid())
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn put_commit_link(&self, link: CommitLink) -> DbResult<Option<CommitLink>> {
        let replaced = sqlx::query_as::<_, CommitLinkRow>(
            "SELECT * FROM commit_links WHERE batch_id = $1 AND repo_id = $2",
        )
        .bind(link.batch_id.as_uuid())
        .bind(link.repo_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO commit_links (id, batch_id, repo_id, commit_id, sha, match_kind)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (batch_id, repo_id) DO UPDATE SET
                commit_id = EXCLUDED.commit_id,
                sha = EXCLUDED.sha,
                match_kind = EXCLUDED.match_kind
            "#,
        )
        .bind(link.id.as_uuid())
        .bind(link.batch_id.as_uuid())
        .bind(link.repo_id.as_uuid())
        .bind(link.commit_id.as_uuid())
        .bind(&link.sha)
        .bind(link.match_kind.as_str())
        .execute(&self.pool)
        .await?;

        replaced.map(TryInto::try_into).transpose()
    }

    async fn commit_links(&self, batch_id: ResourceId) -> DbResult<Vec<CommitLink>> {
        let rows = sqlx::query_as::<_, CommitLinkRow>(
            "SELECT * FROM commit_links WHERE batch_id = $1",
        )
        .bind(batch_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn create_slot(&self, slot: JobSlot) -> DbResult<JobSlot> {
        let row = sqlx::query_as::<_, JobSlotRow>(
            r#"
            INSERT INTO job_slots (id, batch_id, trigger_id, job_id, link, active, skip_reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(slot.id.as_uuid())
        .bind(slot.batch_id.as_uuid())
        .bind(slot.trigger_id.as_uuid())
        .bind(slot.job_id.map(|id| *id.as_uuid()))
        .bind(slot.link.map(|l| l.as_str()))
        .bind(slot.active)
        .bind(&slot.skip_reason)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn slot(&self, id: ResourceId) -> DbResult<JobSlot> {
        let row = sqlx::query_as::<_, JobSlotRow>("SELECT * FROM job_slots WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job slot {id}")))?;
        row.try_into()
    }

    async fn slots_of_batch(&self, batch_id: ResourceId) -> DbResult<Vec<JobSlot>> {
        let rows = sqlx::query_as::<_, JobSlotRow>(
            "SELECT * FROM job_slots WHERE batch_id = $1",
        )
        .bind(batch_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn slots_referencing_job(&self, job_id: ResourceId) -> DbResult<Vec<JobSlot>> {
        let rows = sqlx::query_as::<_, JobSlotRow>(
            "SELECT * FROM job_slots WHERE job_id = $1",
        )
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}
