//! Projects, repositories, branches and the commit ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_core::ResourceId;
use convoy_core::source::{Branch, Commit, Project, Repository};
use sqlx::PgPool;
use url::Url;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, sqlx::FromRow)]
struct RepositoryRow {
    id: uuid::Uuid,
    project_id: uuid::Uuid,
    name: String,
    clone_url: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<RepositoryRow> for Repository {
    type Error = DbError;

    fn try_from(row: RepositoryRow) -> DbResult<Self> {
        let clone_url = row
            .clone_url
            .map(|raw| Url::parse(&raw).map_err(|e| DbError::Corrupt(format!("clone_url: {e}"))))
            .transpose()?;
        Ok(Repository {
            id: row.id.into(),
            project_id: row.project_id.into(),
            name: row.name,
            clone_url,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct BranchRow {
    id: uuid::Uuid,
    repo_id: uuid::Uuid,
    name: String,
    is_change_request: bool,
    target_branch_name: Option<String>,
    head_label: Option<String>,
    head_commit_id: Option<uuid::Uuid>,
    bundle_id: Option<uuid::Uuid>,
}

impl From<BranchRow> for Branch {
    fn from(row: BranchRow) -> Self {
        Branch {
            id: row.id.into(),
            repo_id: row.repo_id.into(),
            name: row.name,
            is_change_request: row.is_change_request,
            target_branch_name: row.target_branch_name,
            head_label: row.head_label,
            head: row.head_commit_id.map(Into::into),
            bundle_id: row.bundle_id.map(Into::into),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct CommitRow {
    id: uuid::Uuid,
    repo_id: uuid::Uuid,
    sha: String,
    author: String,
    subject: String,
    committed_at: DateTime<Utc>,
}

impl From<CommitRow> for Commit {
    fn from(row: CommitRow) -> Self {
        Commit {
            id: row.id.into(),
            repo_id: row.repo_id.into(),
            sha: row.sha,
            author: row.author,
            subject: row.subject,
            committed_at: row.committed_at,
        }
    }
}

#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn create_project(&self, name: &str) -> DbResult<Project>;
    async fn project(&self, id: ResourceId) -> DbResult<Project>;

    async fn create_repository(
        &self,
        project_id: ResourceId,
        name: &str,
        clone_url: Option<Url>,
    ) -> DbResult<Repository>;
    async fn repository(&self, id: ResourceId) -> DbResult<Repository>;

    /// Record a commit, returning the existing row when (repository, sha)
    /// was already known. Commits are immutable.
    async fn record_commit(
        &self,
        repo_id: ResourceId,
        sha: &str,
        author: &str,
        subject: &str,
        committed_at: DateTime<Utc>,
    ) -> DbResult<Commit>;
    async fn commit(&self, id: ResourceId) -> DbResult<Commit>;

    /// Get or create a branch by (repository, name), refreshing the
    /// change-request metadata.
    async fn upsert_branch(
        &self,
        repo_id: ResourceId,
        name: &str,
        is_change_request: bool,
        target_branch_name: Option<&str>,
        head_label: Option<&str>,
    ) -> DbResult<Branch>;
    async fn branch(&self, id: ResourceId) -> DbResult<Branch>;
    async fn set_branch_head(&self, branch_id: ResourceId, commit_id: ResourceId) -> DbResult<()>;
    async fn set_branch_bundle(
        &self,
        branch_id: ResourceId,
        bundle_id: Option<ResourceId>,
    ) -> DbResult<()>;
    async fn set_branch_target(&self, branch_id: ResourceId, target: &str) -> DbResult<()>;
    async fn branches_in_bundle(&self, bundle_id: ResourceId) -> DbResult<Vec<Branch>>;
}

/// PostgreSQL implementation of SourceStore.
pub struct PgSourceStore {
    pool: PgPool,
}

impl PgSourceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SourceStore for PgSourceStore {
    async fn create_project(&self, name: &str) -> DbResult<Project> {
        let row: (uuid::Uuid, String) = sqlx::query_as(
            "INSERT INTO projects (id, name) VALUES ($1, $2) RETURNING id, name",
        )
        .bind(uuid::Uuid::now_v7())
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(Project { id: row.0.into(), name: row.1 })
    }

    async fn project(&self, id: ResourceId) -> DbResult<Project> {
        let row: (uuid::Uuid, String) =
            sqlx::query_as("SELECT id, name FROM projects WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("project {id}")))?;
        Ok(Project { id: row.0.into(), name: row.1 })
    }

    async fn create_repository(
        &self,
        project_id: ResourceId,
        name: &str,
        clone_url: Option<Url>,
    ) -> DbResult<Repository> {
        let row = sqlx::query_as::<_, RepositoryRow>(
            r#"
            INSERT INTO repositories (id, project_id, name, clone_url, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(project_id.as_uuid())
        .bind(name)
        .bind(clone_url.map(|u| u.to_string()))
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn repository(&self, id: ResourceId) -> DbResult<Repository> {
        let row = sqlx::query_as::<_, RepositoryRow>("SELECT * FROM repositories WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("repository {id}")))?;
        row.try_into()
    }

    async fn record_commit(
        &self,
        repo_id: ResourceId,
        sha: &str,
        author: &str,
        subject: &str,
        committed_at: DateTime<Utc>,
    ) -> DbResult<Commit> {
        let row = sqlx::query_as::<_, CommitRow>(
            r#"
            INSERT INTO commits (id, repo_id, sha, author, subject, committed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (repo_id, sha) DO UPDATE SET sha = EXCLUDED.sha
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(repo_id.as_uuid())
        .bind(sha)
        .bind(author)
        .bind(subject)
        .bind(committed_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn commit(&self, id: ResourceId) -> DbResult<Commit> {
        let row = sqlx::query_as::<_, CommitRow>("SELECT * FROM commits WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("commit {id}")))?;
        Ok(row.into())
    }

    async fn upsert_branch(
        &self,
        repo_id: ResourceId,
        name: &str,
        is_change_request: bool,
        target_branch_name: Option<&str>,
        head_label: Option<&str>,
    ) -> DbResult<Branch> {
        let row = sqlx::query_as::<_, BranchRow>(
            r#"
            INSERT INTO branches (id, repo_id, name, is_change_request, target_branch_name, head_label)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (repo_id, name) DO UPDATE SET
                is_change_request = EXCLUDED.is_change_request,
                target_branch_name = EXCLUDED.target_branch_name,
                head_label = EXCLUDED.head_label
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(repo_id.as_uuid())
        .bind(name)
        .bind(is_change_request)
        .bind(target_branch_name)
        .bind(head_label)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn branch(&self, id: ResourceId) -> DbResult<Branch> {
        let row = sqlx::query_as::<_, BranchRow>("SELECT * FROM branches WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("branch {id}")))?;
        Ok(row.into())
    }

    async fn set_branch_head(&self, branch_id: ResourceId, commit_id: ResourceId) -> DbResult<()> {
        sqlx::query("UPDATE branches SET head_commit_id = $2 WHERE id = $1")
            .bind(branch_id.as_uuid())
            .bind(commit_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_branch_bundle(
        &self,
        branch_id: ResourceId,
        bundle_id: Option<ResourceId>,
    ) -> DbResult<()> {
        sqlx::query("UPDATE branches SET bundle_id = $2 WHERE id = $1")
            .bind(branch_id.as_uuid())
            .bind(bundle_id.map(|id| *id.as_uuid()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_branch_target(&self, branch_id: ResourceId, target: &str) -> DbResult<()> {
        sqlx::query("UPDATE branches SET target_branch_name = $2 WHERE id = $1")
            .bind(branch_id.as_uuid())
            .bind(target)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn branches_in_bundle(&self, bundle_id: ResourceId) -> DbResult<Vec<Branch>> {
        let rows = sqlx::query_as::<_, BranchRow>(
            "SELECT * FROM branches WHERE bundle_id = $1 ORDER BY name",
        )
        .bind(bundle_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
