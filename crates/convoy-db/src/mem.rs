//! In-memory store implementation.
//!
//! Every operation runs under a single lock, so the claim operation is one
//! compare-and-swap critical section and can never hand the same job to two
//! callers. Suitable for single-process deployments and as the test
//! harness.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_core::ResourceId;
use convoy_core::batch::{Batch, BatchState, CommitLink};
use convoy_core::bundle::Bundle;
use convoy_core::host::Host;
use convoy_core::job::{Job, JobKind, JobParams, JobSlot, JobState, RequestedAction};
use convoy_core::source::{Branch, Commit, Project, Repository};
use convoy_core::trigger::Trigger;
use url::Url;

use crate::store::{BundleStore, HostStore, JobStore, SourceStore, TriggerStore};
use crate::{DbError, DbResult};

#[derive(Default)]
struct Inner {
    projects: HashMap<ResourceId, Project>,
    repositories: HashMap<ResourceId, Repository>,
    branches: HashMap<ResourceId, Branch>,
    commits: HashMap<ResourceId, Commit>,
    bundles: HashMap<ResourceId, Bundle>,
    batches: HashMap<ResourceId, Batch>,
    links: HashMap<ResourceId, CommitLink>,
    slots: HashMap<ResourceId, JobSlot>,
    triggers: HashMap<ResourceId, Trigger>,
    params: HashMap<ResourceId, JobParams>,
    jobs: HashMap<ResourceId, Job>,
    hosts: HashMap<String, Host>,
}

/// Shared in-memory store implementing every store trait.
#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> DbResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| DbError::Corrupt("store lock poisoned".to_string()))
    }
}

fn claim_sort_key(job: &Job, bundles: &HashMap<ResourceId, Bundle>) -> (i32, bool, i32, DateTime<Utc>, ResourceId) {
    let (sticky, priority) = bundles
        .get(&job.bundle_id)
        .map(|b| (b.sticky, b.priority))
        .unwrap_or((false, 0));
    // bool sorts false first, so negate to put sticky bundles in front
    (job.kind.claim_rank(), !sticky, -priority, job.created_at, job.id)
}

#[async_trait]
impl SourceStore for MemStore {
    async fn create_project(&self, name: &str) -> DbResult<Project> {
        let mut inner = self.lock()?;
        let project = Project { id: ResourceId::new(), name: name.to_string() };
        inner.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn project(&self, id: ResourceId) -> DbResult<Project> {
        self.lock()?
            .projects
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("project {id}")))
    }

    async fn create_repository(
        &self,
        project_id: ResourceId,
        name: &str,
        clone_url: Option<Url>,
    ) -> DbResult<Repository> {
        let mut inner = self.lock()?;
        let repo = Repository {
            id: ResourceId::new(),
            project_id,
            name: name.to_string(),
            clone_url,
            created_at: Utc::now(),
        };
        inner.repositories.insert(repo.id, repo.clone());
        Ok(repo)
    }

    async fn repository(&self, id: ResourceId) -> DbResult<Repository> {
        self.lock()?
            .repositories
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("repository {id}")))
    }

    async fn record_commit(
        &self,
        repo_id: ResourceId,
        sha: &str,
        author: &str,
        subject: &str,
        committed_at: DateTime<Utc>,
    ) -> DbResult<Commit> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner
            .commits
            .values()
            .find(|c| c.repo_id == repo_id && c.sha == sha)
        {
            return Ok(existing.clone());
        }
        let commit = Commit {
            id: ResourceId::new(),
            repo_id,
            sha: sha.to_string(),
            author: author.to_string(),
            subject: subject.to_string(),
            committed_at,
        };
        inner.commits.insert(commit.id, commit.clone());
        Ok(commit)
    }

    async fn commit(&self, id: ResourceId) -> DbResult<Commit> {
        self.lock()?
            .commits
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("commit {id}")))
    }

    async fn upsert_branch(
        &self,
        repo_id: ResourceId,
        name: &str,
        is_change_request: bool,
        target_branch_name: Option<&str>,
        head_label: Option<&str>,
    ) -> DbResult<Branch> {
        let mut inner = self.lock()?;
        if let Some(branch) = inner
            .branches
            .values_mut()
            .find(|b| b.repo_id == repo_id && b.name == name)
        {
            branch.is_change_request = is_change_request;
            branch.target_branch_name = target_branch_name.map(String::from);
            branch.head_label = head_label.map(String::from);
            return Ok(branch.clone());
        }
        let branch = Branch {
            id: ResourceId::new(),
            repo_id,
            name: name.to_string(),
            is_change_request,
            target_branch_name: target_branch_name.map(String::from),
            head_label: head_label.map(String::from),
            head: None,
            bundle_id: None,
        };
        inner.branches.insert(branch.id, branch.clone());
        Ok(branch)
    }

    async fn branch(&self, id: ResourceId) -> DbResult<Branch> {
        self.lock()?
            .branches
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("branch {id}")))
    }

    async fn set_branch_head(&self, branch_id: ResourceId, commit_id: ResourceId) -> DbResult<()> {
        let mut inner = self.lock()?;
        let branch = inner
            .branches
            .get_mut(&branch_id)
            .ok_or_else(|| DbError::NotFound(format!("branch {branch_id}")))?;
        branch.head = Some(commit_id);
        Ok(())
    }

    async fn set_branch_bundle(
        &self,
        branch_id: ResourceId,
        bundle_id: Option<ResourceId>,
    ) -> DbResult<()> {
        let mut inner = self.lock()?;
        let branch = inner
            .branches
            .get_mut(&branch_id)
            .ok_or_else(|| DbError::NotFound(format!("branch {branch_id}")))?;
        branch.bundle_id = bundle_id;
        Ok(())
    }

    async fn set_branch_target(&self, branch_id: ResourceId, target: &str) -> DbResult<()> {
        let mut inner = self.lock()?;
        let branch = inner
            .branches
            .get_mut(&branch_id)
            .ok_or_else(|| DbError::NotFound(format!("branch {branch_id}")))?;
        branch.target_branch_name = Some(target.to_string());
        Ok(())
    }

    async fn branches_in_bundle(&self, bundle_id: ResourceId) -> DbResult<Vec<Branch>> {
        let inner = self.lock()?;
        let mut branches: Vec<Branch> = inner
            .branches
            .values()
            .filter(|b| b.bundle_id == Some(bundle_id))
            .cloned()
            .collect();
        branches.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(branches)
    }
}

#[async_trait]
impl BundleStore for MemStore {
    async fn create_bundle(&self, bundle: Bundle) -> DbResult<Bundle> {
        let mut inner = self.lock()?;
        if inner
            .bundles
            .values()
            .any(|b| b.project_id == bundle.project_id && b.name == bundle.name)
        {
            return Err(DbError::Duplicate(format!("bundle {}", bundle.name)));
        }
        inner.bundles.insert(bundle.id, bundle.clone());
        Ok(bundle)
    }

    async fn bundle(&self, id: ResourceId) -> DbResult<Bundle> {
        self.lock()?
            .bundles
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("bundle {id}")))
    }

    async fn bundle_by_name(&self, project_id: ResourceId, name: &str) -> DbResult<Option<Bundle>> {
        Ok(self
            .lock()?
            .bundles
            .values()
            .find(|b| b.project_id == project_id && b.name == name)
            .cloned())
    }

    async fn base_bundles(&self, project_id: ResourceId) -> DbResult<Vec<Bundle>> {
        let inner = self.lock()?;
        let mut bundles: Vec<Bundle> = inner
            .bundles
            .values()
            .filter(|b| b.project_id == project_id && b.is_base)
            .cloned()
            .collect();
        bundles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(bundles)
    }

    async fn create_batch(&self, batch: Batch) -> DbResult<Batch> {
        let mut inner = self.lock()?;
        inner.batches.insert(batch.id, batch.clone());
        Ok(batch)
    }

    async fn batch(&self, id: ResourceId) -> DbResult<Batch> {
        self.lock()?
            .batches
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("batch {id}")))
    }

    async fn accumulating_batch(&self, bundle_id: ResourceId) -> DbResult<Option<Batch>> {
        let inner = self.lock()?;
        let mut batches: Vec<&Batch> = inner
            .batches
            .values()
            .filter(|b| b.bundle_id == bundle_id && b.state == BatchState::Accumulating)
            .collect();
        batches.sort_by_key(|b| std::cmp::Reverse((b.created_at, b.id)));
        Ok(batches.first().map(|b| (*b).clone()))
    }

    async fn batches_due(&self, cutoff: DateTime<Utc>) -> DbResult<Vec<Batch>> {
        let inner = self.lock()?;
        let mut batches: Vec<Batch> = inner
            .batches
            .values()
            .filter(|b| b.state == BatchState::Accumulating && b.last_update <= cutoff)
            .cloned()
            .collect();
        batches.sort_by_key(|b| (b.last_update, b.id));
        Ok(batches)
    }

    async fn open_batches(&self, bundle_id: ResourceId) -> DbResult<Vec<Batch>> {
        let inner = self.lock()?;
        let mut batches: Vec<Batch> = inner
            .batches
            .values()
            .filter(|b| b.bundle_id == bundle_id && b.state.is_open())
            .cloned()
            .collect();
        batches.sort_by_key(|b| (b.created_at, b.id));
        Ok(batches)
    }

    async fn recent_closed_batches(&self, bundle_id: ResourceId, limit: i64) -> DbResult<Vec<Batch>> {
        let inner = self.lock()?;
        let mut batches: Vec<Batch> = inner
            .batches
            .values()
            .filter(|b| {
                b.bundle_id == bundle_id
                    && matches!(b.state, BatchState::Ready | BatchState::Done)
            })
            .cloned()
            .collect();
        batches.sort_by_key(|b| std::cmp::Reverse((b.created_at, b.id)));
        batches.truncate(limit as usize);
        Ok(batches)
    }

    async fn ready_batches(&self) -> DbResult<Vec<Batch>> {
        let inner = self.lock()?;
        let mut batches: Vec<Batch> = inner
            .batches
            .values()
            .filter(|b| b.state == BatchState::Ready)
            .cloned()
            .collect();
        batches.sort_by_key(|b| (b.created_at, b.id));
        Ok(batches)
    }

    async fn set_batch_state(&self, batch_id: ResourceId, state: BatchState) -> DbResult<()> {
        let mut inner = self.lock()?;
        let batch = inner
            .batches
            .get_mut(&batch_id)
            .ok_or_else(|| DbError::NotFound(format!("batch {batch_id}")))?;
        batch.state = state;
        Ok(())
    }

    async fn touch_batch(&self, batch_id: ResourceId, now: DateTime<Utc>) -> DbResult<()> {
        let mut inner = self.lock()?;
        let batch = inner
            .batches
            .get_mut(&batch_id)
            .ok_or_else(|| DbError::NotFound(format!("batch {batch_id}")))?;
        batch.last_update = now;
        Ok(())
    }

    async fn put_commit_link(&self, link: CommitLink) -> DbResult<Option<CommitLink>> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner
            .links
            .values_mut()
            .find(|l| l.batch_id == link.batch_id && l.repo_id == link.repo_id)
        {
            let replaced = existing.clone();
            existing.commit_id = link.commit_id;
            existing.sha = link.sha;
            existing.match_kind = link.match_kind;
            return Ok(Some(replaced));
        }
        inner.links.insert(link.id, link);
        Ok(None)
    }

    async fn commit_links(&self, batch_id: ResourceId) -> DbResult<Vec<CommitLink>> {
        let inner = self.lock()?;
        let mut links: Vec<CommitLink> = inner
            .links
            .values()
            .filter(|l| l.batch_id == batch_id)
            .cloned()
            .collect();
        links.sort_by_key(|l| l.id);
        Ok(links)
    }

    async fn create_slot(&self, slot: JobSlot) -> DbResult<JobSlot> {
        let mut inner = self.lock()?;
        inner.slots.insert(slot.id, slot.clone());
        Ok(slot)
    }

    async fn slot(&self, id: ResourceId) -> DbResult<JobSlot> {
        self.lock()?
            .slots
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job slot {id}")))
    }

    async fn slots_of_batch(&self, batch_id: ResourceId) -> DbResult<Vec<JobSlot>> {
        let inner = self.lock()?;
        let mut slots: Vec<JobSlot> = inner
            .slots
            .values()
            .filter(|s| s.batch_id == batch_id)
            .cloned()
            .collect();
        slots.sort_by_key(|s| s.id);
        Ok(slots)
    }

    async fn slots_referencing_job(&self, job_id: ResourceId) -> DbResult<Vec<JobSlot>> {
        let inner = self.lock()?;
        let mut slots: Vec<JobSlot> = inner
            .slots
            .values()
            .filter(|s| s.job_id == Some(job_id))
            .cloned()
            .collect();
        slots.sort_by_key(|s| s.id);
        Ok(slots)
    }
}

#[async_trait]
impl TriggerStore for MemStore {
    async fn create_trigger(&self, trigger: Trigger) -> DbResult<Trigger> {
        let mut inner = self.lock()?;
        inner.triggers.insert(trigger.id, trigger.clone());
        Ok(trigger)
    }

    async fn trigger(&self, id: ResourceId) -> DbResult<Trigger> {
        self.lock()?
            .triggers
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("trigger {id}")))
    }

    async fn triggers_for_project(&self, project_id: ResourceId) -> DbResult<Vec<Trigger>> {
        let inner = self.lock()?;
        let mut triggers: Vec<Trigger> = inner
            .triggers
            .values()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect();
        triggers.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.name.cmp(&b.name)));
        Ok(triggers)
    }
}

#[async_trait]
impl JobStore for MemStore {
    async fn create_params(&self, params: JobParams) -> DbResult<JobParams> {
        let mut inner = self.lock()?;
        let params = params.normalized();
        inner.params.insert(params.id, params.clone());
        Ok(params)
    }

    async fn params(&self, id: ResourceId) -> DbResult<JobParams> {
        self.lock()?
            .params
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job params {id}")))
    }

    async fn create_job(&self, job: Job) -> DbResult<Job> {
        let mut inner = self.lock()?;
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn job(&self, id: ResourceId) -> DbResult<Job> {
        self.lock()?
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {id}")))
    }

    async fn latest_job_with_fingerprint(&self, fingerprint: &str) -> DbResult<Option<Job>> {
        let inner = self.lock()?;
        let mut jobs: Vec<&Job> = inner
            .jobs
            .values()
            .filter(|j| j.fingerprint == fingerprint && j.parent_id.is_none())
            .collect();
        jobs.sort_by_key(|j| std::cmp::Reverse((j.created_at, j.id)));
        Ok(jobs.first().map(|j| (*j).clone()))
    }

    async fn claim_pending(
        &self,
        host: &str,
        limit: i64,
        exclude_scheduled: bool,
    ) -> DbResult<Vec<Job>> {
        let mut inner = self.lock()?;
        let mut candidates: Vec<ResourceId> = inner
            .jobs
            .values()
            .filter(|j| {
                j.state == JobState::Pending
                    && j.host.is_none()
                    && j.parent_id.is_none()
                    && !(exclude_scheduled && j.kind == JobKind::Scheduled)
            })
            .map(|j| j.id)
            .collect();
        let bundles = inner.bundles.clone();
        candidates.sort_by_key(|id| claim_sort_key(&inner.jobs[id], &bundles));
        candidates.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            let job = inner
                .jobs
                .get_mut(&id)
                .ok_or_else(|| DbError::NotFound(format!("job {id}")))?;
            job.host = Some(host.to_string());
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn update_job(&self, job: &Job) -> DbResult<()> {
        let mut inner = self.lock()?;
        let stored = inner
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", job.id)))?;
        stored.state = job.state;
        stored.result = job.result;
        stored.host = job.host.clone();
        stored.requested_action = job.requested_action;
        stored.keep_running = job.keep_running;
        stored.started_at = job.started_at;
        stored.finished_at = job.finished_at;
        Ok(())
    }

    async fn request_action(&self, job_id: ResourceId, action: RequestedAction) -> DbResult<()> {
        let mut inner = self.lock()?;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| DbError::NotFound(format!("job {job_id}")))?;
        job.requested_action = Some(action);
        Ok(())
    }

    async fn set_keep_running(&self, job_id: ResourceId, keep: bool) -> DbResult<()> {
        let mut inner = self.lock()?;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| DbError::NotFound(format!("job {job_id}")))?;
        job.keep_running = keep;
        Ok(())
    }

    async fn jobs_on_host(&self, host: &str, states: &[JobState]) -> DbResult<Vec<Job>> {
        let inner = self.lock()?;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.host.as_deref() == Some(host) && states.contains(&j.state))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    async fn count_on_host(&self, host: &str, states: &[JobState]) -> DbResult<i64> {
        let inner = self.lock()?;
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.host.as_deref() == Some(host) && states.contains(&j.state))
            .count() as i64)
    }

    async fn pending_unassigned_count(&self) -> DbResult<i64> {
        let inner = self.lock()?;
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.state == JobState::Pending && j.host.is_none())
            .count() as i64)
    }

    async fn jobs_in_state(&self, state: JobState) -> DbResult<Vec<Job>> {
        let inner = self.lock()?;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.state == state)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    async fn has_newer_pending_sibling(&self, job: &Job) -> DbResult<bool> {
        let inner = self.lock()?;
        Ok(inner.jobs.values().any(|j| {
            j.id != job.id
                && j.bundle_id == job.bundle_id
                && j.config_id == job.config_id
                && j.state == JobState::Pending
                && j.kind == JobKind::Normal
                && j.parent_id.is_none()
                && j.created_at > job.created_at
        }))
    }
}

#[async_trait]
impl HostStore for MemStore {
    async fn get_or_create_host(
        &self,
        name: &str,
        nb_workers: i32,
        running_max: i32,
    ) -> DbResult<Host> {
        let mut inner = self.lock()?;
        if let Some(host) = inner.hosts.get(name) {
            return Ok(host.clone());
        }
        let host = Host::new(name, nb_workers, running_max);
        inner.hosts.insert(name.to_string(), host.clone());
        Ok(host)
    }

    async fn host(&self, name: &str) -> DbResult<Host> {
        self.lock()?
            .hosts
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("host {name}")))
    }

    async fn update_host(&self, host: &Host) -> DbResult<()> {
        let mut inner = self.lock()?;
        match inner.hosts.get_mut(&host.name) {
            Some(stored) => {
                *stored = host.clone();
                Ok(())
            }
            None => Err(DbError::NotFound(format!("host {}", host.name))),
        }
    }

    async fn list_hosts(&self) -> DbResult<Vec<Host>> {
        let inner = self.lock()?;
        let mut hosts: Vec<Host> = inner.hosts.values().cloned().collect();
        hosts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(hosts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::job::CommitRef;

    async fn make_job(store: &MemStore, bundle_id: ResourceId) -> Job {
        let params = JobParams {
            id: ResourceId::new(),
            project_id: ResourceId::new(),
            version_name: "17.0".to_string(),
            config_id: ResourceId::new(),
            commits: vec![CommitRef { repo_id: ResourceId::new(), sha: "abc".to_string() }],
            extra_modules: vec![],
        };
        let params = store.create_params(params).await.unwrap();
        let job = Job::new(&params, bundle_id, JobKind::Normal, Utc::now());
        store.create_job(job.clone()).await.unwrap();
        job
    }

    #[tokio::test]
    async fn claim_never_hands_out_a_job_twice() {
        let store = MemStore::new();
        let bundle = Bundle::new(ResourceId::new(), "feature-x");
        store.create_bundle(bundle.clone()).await.unwrap();
        for _ in 0..5 {
            make_job(&store, bundle.id).await;
        }

        let first = store.claim_pending("host-a", 2, false).await.unwrap();
        let second = store.claim_pending("host-b", 2, false).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        for a in &first {
            assert!(second.iter().all(|b| b.id != a.id));
        }
        assert_eq!(store.pending_unassigned_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn claim_prefers_sticky_bundles() {
        let store = MemStore::new();
        let project_id = ResourceId::new();
        let plain = Bundle::new(project_id, "feature-x");
        let mut sticky = Bundle::new(project_id, "17.0");
        sticky.is_base = true;
        sticky.sticky = true;
        store.create_bundle(plain.clone()).await.unwrap();
        store.create_bundle(sticky.clone()).await.unwrap();

        make_job(&store, plain.id).await;
        make_job(&store, sticky.id).await;

        let claimed = store.claim_pending("host-a", 1, false).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].bundle_id, sticky.id);
    }
}
