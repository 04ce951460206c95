//! Job parameters, jobs and the claim operation.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_core::ResourceId;
use convoy_core::job::{Job, JobKind, JobParams, JobResult, JobState, RequestedAction};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, sqlx::FromRow)]
struct JobParamsRow {
    id: uuid::Uuid,
    project_id: uuid::Uuid,
    version_name: String,
    config_id: uuid::Uuid,
    commits: serde_json::Value,
    extra_modules: Vec<String>,
}

impl TryFrom<JobParamsRow> for JobParams {
    type Error = DbError;

    fn try_from(row: JobParamsRow) -> DbResult<Self> {
        let commits = serde_json::from_value(row.commits)
            .map_err(|e| DbError::Corrupt(format!("job params commits: {e}")))?;
        Ok(JobParams {
            id: row.id.into(),
            project_id: row.project_id.into(),
            version_name: row.version_name,
            config_id: row.config_id.into(),
            commits,
            extra_modules: row.extra_modules,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct JobRow {
    id: uuid::Uuid,
    params_id: uuid::Uuid,
    fingerprint: String,
    bundle_id: uuid::Uuid,
    config_id: uuid::Uuid,
    kind: String,
    state: String,
    result: Option<String>,
    host: Option<String>,
    requested_action: Option<String>,
    keep_running: bool,
    parent_id: Option<uuid::Uuid>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = DbError;

    fn try_from(row: JobRow) -> DbResult<Self> {
        Ok(Job {
            id: row.id.into(),
            params_id: row.params_id.into(),
            fingerprint: row.fingerprint,
            bundle_id: row.bundle_id.into(),
            config_id: row.config_id.into(),
            kind: JobKind::from_str(&row.kind).map_err(DbError::Corrupt)?,
            state: JobState::from_str(&row.state).map_err(DbError::Corrupt)?,
            result: row
                .result
                .map(|raw| JobResult::from_str(&raw).map_err(DbError::Corrupt))
                .transpose()?,
            host: row.host,
            requested_action: row
                .requested_action
                .map(|raw| RequestedAction::from_str(&raw).map_err(DbError::Corrupt))
                .transpose()?,
            keep_running: row.keep_running,
            parent_id: row.parent_id.map(Into::into),
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_params(&self, params: JobParams) -> DbResult<JobParams>;
    async fn params(&self, id: ResourceId) -> DbResult<JobParams>;

    async fn create_job(&self, job: Job) -> DbResult<Job>;
    async fn job(&self, id: ResourceId) -> DbResult<Job>;
    /// The most recent job sharing a fingerprint and having no parent.
    /// Deduplication target.
    async fn latest_job_with_fingerprint(&self, fingerprint: &str) -> DbResult<Option<Job>>;

    /// Atomically claim up to `limit` pending, unassigned jobs for a host.
    ///
    /// Contract: concurrent callers never receive the same job; a job
    /// already locked by a concurrent claim is skipped, not waited on.
    /// Candidates are ordered by job kind, bundle stickiness, bundle
    /// priority, then submission order.
    async fn claim_pending(
        &self,
        host: &str,
        limit: i64,
        exclude_scheduled: bool,
    ) -> DbResult<Vec<Job>>;

    /// Write a job's mutable fields (state, result, host, action, flags,
    /// timestamps). The params reference and fingerprint never change.
    async fn update_job(&self, job: &Job) -> DbResult<()>;
    /// Idempotently flag an action for the owning host's next loop turn.
    async fn request_action(&self, job_id: ResourceId, action: RequestedAction) -> DbResult<()>;
    async fn set_keep_running(&self, job_id: ResourceId, keep: bool) -> DbResult<()>;

    async fn jobs_on_host(&self, host: &str, states: &[JobState]) -> DbResult<Vec<Job>>;
    async fn count_on_host(&self, host: &str, states: &[JobState]) -> DbResult<i64>;
    async fn pending_unassigned_count(&self) -> DbResult<i64>;
    async fn jobs_in_state(&self, state: JobState) -> DbResult<Vec<Job>>;
    /// Is there a strictly newer pending job for the same bundle and config
    /// (normal kind, no parent)? Testing-phase GC predicate.
    async fn has_newer_pending_sibling(&self, job: &Job) -> DbResult<bool>;
}

const CLAIM_ORDER: &str = r#"
    ORDER BY
        array_position(array['normal','rebuild','indirect','scheduled']::text[], jobs.kind) ASC,
        bundles.sticky DESC,
        bundles.priority DESC,
        jobs.created_at ASC,
        jobs.id ASC
"#;

fn claim_query(exclude_scheduled: bool) -> String {
    let kind_filter = if exclude_scheduled {
        "AND jobs.kind <> 'scheduled'"
    } else {
        ""
    };
    format!(
        r#"
        UPDATE jobs
        SET host = $1
        WHERE jobs.id IN (
            SELECT jobs.id
            FROM jobs
            JOIN bundles ON bundles.id = jobs.bundle_id
            WHERE jobs.state = 'pending'
              AND jobs.host IS NULL
              AND jobs.parent_id IS NULL
              {kind_filter}
            {CLAIM_ORDER}
            FOR UPDATE OF jobs SKIP LOCKED
            LIMIT $2
        )
        RETURNING *
        "#
    )
}

/// PostgreSQL implementation of JobStore.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_params(&self, params: JobParams) -> DbResult<JobParams> {
        let commits = serde_json::to_value(&params.commits)
            .map_err(|e| DbError::Corrupt(format!("job params commits: {e}")))?;
        let row = sqlx::query_as::<_, JobParamsRow>(
            r#"
            INSERT INTO job_params
                (id, project_id, version_name, config_id, commits, extra_modules, fingerprint)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, project_id, version_name, config_id, commits, extra_modules
            "#,
        )
        .bind(params.id.as_uuid())
        .bind(params.project_id.as_uuid())
        .bind(&params.version_name)
        .bind(params.config_id.as_uuid())
        .bind(commits)
        .bind(&params.extra_modules)
        .bind(params.fingerprint())
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn params(&self, id: ResourceId) -> DbResult<JobParams> {
        let row = sqlx::query_as::<_, JobParamsRow>(
            "SELECT id, project_id, version_name, config_id, commits, extra_modules FROM job_params WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("job params {id}")))?;
        row.try_into()
    }

    async fn create_job(&self, job: Job) -> DbResult<Job> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO jobs
                (id, params_id, fingerprint, bundle_id, config_id, kind, state, result, host,
                 requested_action, keep_running, parent_id, created_at, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING *
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.params_id.as_uuid())
        .bind(&job.fingerprint)
        .bind(job.bundle_id.as_uuid())
        .bind(job.config_id.as_uuid())
        .bind(job.kind.as_str())
        .bind(job.state.as_str())
        .bind(job.result.map(|r| r.as_str()))
        .bind(&job.host)
        .bind(job.requested_action.map(|a| a.as_str()))
        .bind(job.keep_running)
        .bind(job.parent_id.map(|id| *id.as_uuid()))
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn job(&self, id: ResourceId) -> DbResult<Job> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {id}")))?;
        row.try_into()
    }

    async fn latest_job_with_fingerprint(&self, fingerprint: &str) -> DbResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM jobs
            WHERE fingerprint = $1 AND parent_id IS NULL
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn claim_pending(
        &self,
        host: &str,
        limit: i64,
        exclude_scheduled: bool,
    ) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&claim_query(exclude_scheduled))
            .bind(host)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn update_job(&self, job: &Job) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                state = $2,
                result = $3,
                host = $4,
                requested_action = $5,
                keep_running = $6,
                started_at = $7,
                finished_at = $8
            WHERE id = $1
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.state.as_str())
        .bind(job.result.map(|r| r.as_str()))
        .bind(&job.host)
        .bind(job.requested_action.map(|a| a.as_str()))
        .bind(job.keep_running)
        .bind(job.started_at)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn request_action(&self, job_id: ResourceId, action: RequestedAction) -> DbResult<()> {
        sqlx::query("UPDATE jobs SET requested_action = $2 WHERE id = $1")
            .bind(job_id.as_uuid())
            .bind(action.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_keep_running(&self, job_id: ResourceId, keep: bool) -> DbResult<()> {
        sqlx::query("UPDATE jobs SET keep_running = $2 WHERE id = $1")
            .bind(job_id.as_uuid())
            .bind(keep)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn jobs_on_host(&self, host: &str, states: &[JobState]) -> DbResult<Vec<Job>> {
        let states: Vec<String> = states.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE host = $1 AND state = ANY($2) ORDER BY created_at, id",
        )
        .bind(host)
        .bind(&states)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn count_on_host(&self, host: &str, states: &[JobState]) -> DbResult<i64> {
        let states: Vec<String> = states.iter().map(|s| s.as_str().to_string()).collect();
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM jobs WHERE host = $1 AND state = ANY($2)",
        )
        .bind(host)
        .bind(&states)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn pending_unassigned_count(&self) -> DbResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM jobs WHERE state = 'pending' AND host IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn jobs_in_state(&self, state: JobState) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE state = $1 ORDER BY created_at, id",
        )
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn has_newer_pending_sibling(&self, job: &Job) -> DbResult<bool> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE bundle_id = $1
              AND config_id = $2
              AND state = 'pending'
              AND kind = 'normal'
              AND parent_id IS NULL
              AND created_at > $3
              AND id <> $4
            "#,
        )
        .bind(job.bundle_id.as_uuid())
        .bind(job.config_id.as_uuid())
        .bind(job.created_at)
        .bind(job.id.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }
}
