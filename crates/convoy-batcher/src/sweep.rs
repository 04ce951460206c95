//! The quiet-window sweep: batch promotion, slot creation and batch
//! completion.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use convoy_config::BatchConfig;
use convoy_core::ResourceId;
use convoy_core::batch::{Batch, BatchState, MatchKind};
use convoy_core::bundle::{Bundle, resolve_base};
use convoy_core::event::OutboundEvent;
use convoy_core::job::{CommitRef, Job, JobKind, JobParams, JobResult, JobSlot, JobState, LinkKind, RequestedAction};
use convoy_core::trigger::Trigger;
use convoy_db::{BundleStore, JobStore, TriggerStore};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::resolver::CommitResolver;
use crate::{BatcherResult, Deduplicator};

/// Periodic sweep promoting quiet batches to ready and turning triggers
/// into job slots. Promotion is polling-based: a batch becomes ready up to
/// one quiet window after its last push even if nothing else happens.
pub struct BatchSweeper {
    bundles: Arc<dyn BundleStore>,
    triggers: Arc<dyn TriggerStore>,
    jobs: Arc<dyn JobStore>,
    resolver: CommitResolver,
    dedup: Deduplicator,
    config: BatchConfig,
    events: mpsc::Sender<OutboundEvent>,
}

impl BatchSweeper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bundles: Arc<dyn BundleStore>,
        triggers: Arc<dyn TriggerStore>,
        jobs: Arc<dyn JobStore>,
        resolver: CommitResolver,
        dedup: Deduplicator,
        config: BatchConfig,
        events: mpsc::Sender<OutboundEvent>,
    ) -> Self {
        Self { bundles, triggers, jobs, resolver, dedup, config, events }
    }

    /// Run the sweep loop.
    pub async fn run(&self) {
        info!(interval = self.config.sweep_interval_secs, "starting batch sweeper");
        loop {
            if let Err(e) = self.sweep(Utc::now()).await {
                warn!(error = %e, "sweep failed");
            }
            sleep(Duration::from_secs(self.config.sweep_interval_secs)).await;
        }
    }

    /// One sweep pass: promote every accumulating batch whose last update
    /// is older than the quiet window. Returns the number promoted.
    pub async fn sweep(&self, now: DateTime<Utc>) -> BatcherResult<usize> {
        let cutoff = now - chrono::Duration::seconds(self.config.quiet_window_secs as i64);
        let due = self.bundles.batches_due(cutoff).await?;
        let mut promoted = 0;
        for batch in due {
            self.promote(&batch, now).await?;
            promoted += 1;
        }
        Ok(promoted)
    }

    /// Promote one batch: mark ready, skip superseded siblings, resolve
    /// commits and create a slot per firing trigger.
    async fn promote(&self, batch: &Batch, now: DateTime<Utc>) -> BatcherResult<()> {
        let bundle = self.bundles.bundle(batch.bundle_id).await?;
        self.bundles.set_batch_state(batch.id, BatchState::Ready).await?;
        info!(bundle = %bundle.name, batch = %batch.id, "batch ready");

        if !bundle.is_base {
            self.skip_superseded(batch, now).await?;
        }

        let links = self.bundles.commit_links(batch.id).await?;
        let pushed: BTreeSet<ResourceId> = links
            .iter()
            .filter(|l| l.match_kind == MatchKind::Pushed)
            .map(|l| l.repo_id)
            .collect();

        let all_triggers = self.triggers.triggers_for_project(bundle.project_id).await?;
        // A forced batch has no pushed commits; every trigger applies.
        let firing: Vec<Trigger> = all_triggers
            .into_iter()
            .filter(|t| pushed.is_empty() || t.fires_on(&pushed))
            .collect();

        let required: BTreeSet<ResourceId> =
            firing.iter().flat_map(|t| t.required_repos()).collect();
        let resolution = self.resolver.resolve(batch, &bundle, &required).await?;

        let version_name = self.version_for(&bundle).await?;
        for trigger in firing {
            let needed = trigger.required_repos();
            let unresolved: Vec<String> = needed
                .iter()
                .filter(|repo| !resolution.links.contains_key(*repo))
                .map(|repo| repo.to_string())
                .collect();
            if !unresolved.is_empty() {
                let reason = format!("unresolved repositories: {}", unresolved.join(", "));
                warn!(trigger = %trigger.name, reason = %reason, "trigger skipped");
                self.bundles
                    .create_slot(JobSlot::skipped(batch.id, trigger.id, reason))
                    .await?;
                continue;
            }

            let params = JobParams {
                id: ResourceId::new(),
                project_id: bundle.project_id,
                version_name: version_name.clone(),
                config_id: trigger.config_id,
                commits: needed
                    .iter()
                    .map(|repo| {
                        let link = &resolution.links[repo];
                        CommitRef { repo_id: *repo, sha: link.sha.clone() }
                    })
                    .collect(),
                extra_modules: bundle.modules.clone(),
            };
            let outcome = self
                .dedup
                .resolve_job(params, bundle.id, JobKind::Normal, now)
                .await?;
            self.bundles
                .create_slot(JobSlot::bound(batch.id, trigger.id, outcome.job.id, outcome.link))
                .await?;
            let params = self.jobs.params(outcome.job.params_id).await?;
            let _ = self
                .events
                .send(OutboundEvent::JobReady { job_id: outcome.job.id, params })
                .await;
        }
        Ok(())
    }

    /// Skip still-open older batches of the same bundle. Bookkeeping only:
    /// a testing job is left to finish; a pending job referenced solely by
    /// the skipped batch is closed as skipped.
    async fn skip_superseded(&self, batch: &Batch, now: DateTime<Utc>) -> BatcherResult<()> {
        for other in self.bundles.open_batches(batch.bundle_id).await? {
            if other.id == batch.id || other.created_at >= batch.created_at {
                continue;
            }
            self.bundles.set_batch_state(other.id, BatchState::Skipped).await?;
            info!(batch = %other.id, "older batch skipped");
            for slot in self.bundles.slots_of_batch(other.id).await? {
                let Some(job_id) = slot.job_id else { continue };
                let mut job = self.jobs.job(job_id).await?;
                if job.state != JobState::Pending || job.host.is_some() {
                    continue;
                }
                let elsewhere = self
                    .bundles
                    .slots_referencing_job(job_id)
                    .await?
                    .iter()
                    .any(|s| s.batch_id != other.id);
                if !elsewhere {
                    job.state = JobState::Done;
                    job.result = Some(JobResult::Skipped);
                    job.finished_at = Some(now);
                    self.jobs.update_job(&job).await?;
                }
            }
        }
        Ok(())
    }

    /// Apply a job's reported result and re-evaluate the batches
    /// referencing it. A successful job enters the running phase and stays
    /// up until evicted; a failed one is done immediately. Unknown jobs are
    /// ignored: results may be replayed.
    pub async fn job_finished(
        &self,
        job_id: ResourceId,
        result: JobResult,
        now: DateTime<Utc>,
    ) -> BatcherResult<()> {
        let mut job = match self.jobs.job(job_id).await {
            Ok(job) => job,
            Err(convoy_db::DbError::NotFound(_)) => {
                warn!(job = %job_id, "result for unknown job ignored");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if job.state == JobState::Done {
            return Ok(());
        }
        job.result = Some(result);
        match result {
            JobResult::Ok | JobResult::Warn => {
                job.state = JobState::Running;
            }
            JobResult::Ko | JobResult::Killed | JobResult::Skipped => {
                job.state = JobState::Done;
                job.finished_at = Some(now);
            }
        }
        self.jobs.update_job(&job).await?;
        info!(job = %job.id, result = result.as_str(), "job finished");

        for slot in self.bundles.slots_referencing_job(job_id).await? {
            self.maybe_complete_batch(slot.batch_id).await?;
        }
        Ok(())
    }

    /// A ready batch is done once every slot's job has left pending and
    /// testing. Jobs then lose their keep-running shield unless another
    /// open batch still references them.
    async fn maybe_complete_batch(&self, batch_id: ResourceId) -> BatcherResult<()> {
        let batch = self.bundles.batch(batch_id).await?;
        if batch.state != BatchState::Ready {
            return Ok(());
        }
        let slots = self.bundles.slots_of_batch(batch_id).await?;
        for slot in &slots {
            if let Some(job_id) = slot.job_id {
                let job = self.jobs.job(job_id).await?;
                if matches!(job.state, JobState::Pending | JobState::Testing) {
                    return Ok(());
                }
            }
        }
        self.bundles.set_batch_state(batch_id, BatchState::Done).await?;
        info!(batch = %batch_id, "batch done");

        for slot in &slots {
            let Some(job_id) = slot.job_id else { continue };
            let mut still_referenced = false;
            for other in self.bundles.slots_referencing_job(job_id).await? {
                if other.batch_id != batch_id
                    && self.bundles.batch(other.batch_id).await?.state.is_open()
                {
                    still_referenced = true;
                    break;
                }
            }
            if !still_referenced {
                self.jobs.set_keep_running(job_id, false).await?;
            }
        }
        Ok(())
    }

    /// Manual rebuild: a fresh job from the same inputs, bypassing
    /// deduplication, recorded as a rebuild slot on the same batch. Returns
    /// the new job id, or None for a skipped slot.
    pub async fn rebuild(
        &self,
        slot_id: ResourceId,
        now: DateTime<Utc>,
    ) -> BatcherResult<Option<ResourceId>> {
        let slot = self.bundles.slot(slot_id).await?;
        let Some(job_id) = slot.job_id else {
            warn!(slot = %slot_id, "cannot rebuild a skipped slot");
            return Ok(None);
        };
        let old = self.jobs.job(job_id).await?;
        let old_params = self.jobs.params(old.params_id).await?;
        // params are immutable: the rebuild gets its own copy
        let params = self
            .jobs
            .create_params(JobParams { id: ResourceId::new(), ..old_params })
            .await?;
        let job = self
            .jobs
            .create_job(Job::new(&params, old.bundle_id, JobKind::Rebuild, now))
            .await?;
        self.bundles
            .create_slot(JobSlot::bound(slot.batch_id, slot.trigger_id, job.id, LinkKind::Rebuild))
            .await?;
        info!(slot = %slot_id, old_job = %job_id, new_job = %job.id, "rebuild requested");
        let _ = self
            .events
            .send(OutboundEvent::JobReady { job_id: job.id, params })
            .await;
        Ok(Some(job.id))
    }

    /// Flag a job for its owning host to kill on the next loop turn.
    /// Idempotent.
    pub async fn kill(&self, job_id: ResourceId) -> BatcherResult<()> {
        self.jobs.request_action(job_id, RequestedAction::Kill).await?;
        Ok(())
    }

    /// Flag a stopped job to be brought back up.
    pub async fn wake_up(&self, job_id: ResourceId) -> BatcherResult<()> {
        self.jobs.request_action(job_id, RequestedAction::WakeUp).await?;
        Ok(())
    }

    /// Version carried into job params: the bundle's own, else its base's
    /// name, else the bundle name.
    async fn version_for(&self, bundle: &Bundle) -> BatcherResult<String> {
        if let Some(version) = &bundle.version_name {
            return Ok(version.clone());
        }
        let bases = self.bundles.base_bundles(bundle.project_id).await?;
        if let Some(base_id) = resolve_base(bundle, &bases) {
            if base_id != bundle.id {
                return Ok(self.bundles.bundle(base_id).await?.name);
            }
        }
        Ok(bundle.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use convoy_core::event::CommitObserved;
    use convoy_core::job::LinkKind;
    use convoy_core::source::Repository;
    use convoy_db::{MemStore, SourceStore};
    use crate::resolver::Vcs;
    use crate::Ingestor;

    struct NullVcs;

    #[async_trait]
    impl Vcs for NullVcs {
        async fn merge_base(
            &self,
            _repo_id: ResourceId,
            _left: &str,
            _right: &str,
        ) -> convoy_core::Result<Option<String>> {
            Ok(None)
        }
    }

    struct Fixture {
        store: MemStore,
        sweeper: BatchSweeper,
        ingestor: Ingestor,
        events: mpsc::Receiver<OutboundEvent>,
        project_id: ResourceId,
        repo_a: Repository,
        repo_b: Repository,
        trigger: Trigger,
        t0: DateTime<Utc>,
    }

    async fn fixture() -> Fixture {
        let store = MemStore::new();
        let project = store.create_project("main").await.unwrap();
        let repo_a = store.create_repository(project.id, "server", None).await.unwrap();
        let repo_b = store.create_repository(project.id, "addons", None).await.unwrap();

        let mut base = Bundle::new(project.id, "17.0");
        base.is_base = true;
        base.sticky = true;
        base.version_name = Some("17.0".to_string());
        let base = store.create_bundle(base).await.unwrap();
        for repo in [&repo_a, &repo_b] {
            let branch = store.upsert_branch(repo.id, "17.0", false, None, None).await.unwrap();
            let commit = store
                .record_commit(repo.id, &format!("base-{}", repo.name), "bot", "head", Utc::now())
                .await
                .unwrap();
            store.set_branch_head(branch.id, commit.id).await.unwrap();
            store.set_branch_bundle(branch.id, Some(base.id)).await.unwrap();
        }

        let trigger = store
            .create_trigger(Trigger {
                id: ResourceId::new(),
                project_id: project.id,
                name: "server".to_string(),
                primary_repo_ids: vec![repo_a.id],
                dependency_repo_ids: vec![repo_b.id],
                config_id: ResourceId::new(),
                priority: 0,
            })
            .await
            .unwrap();

        let (tx, events) = mpsc::channel(64);
        let shared = Arc::new(store.clone());
        let resolver = CommitResolver::new(shared.clone(), shared.clone(), Arc::new(NullVcs));
        let dedup = Deduplicator::new(shared.clone());
        let sweeper = BatchSweeper::new(
            shared.clone(),
            shared.clone(),
            shared.clone(),
            resolver,
            dedup,
            BatchConfig { quiet_window_secs: 60, sweep_interval_secs: 10 },
            tx,
        );
        let ingestor = Ingestor::new(shared.clone(), shared);

        Fixture {
            store,
            sweeper,
            ingestor,
            events,
            project_id: project.id,
            repo_a,
            repo_b,
            trigger,
            t0: Utc::now(),
        }
    }

    fn push(repo: &Repository, branch: &str, sha: &str, ts: DateTime<Utc>) -> CommitObserved {
        CommitObserved {
            repo_id: repo.id,
            branch_name: branch.to_string(),
            is_change_request: false,
            target_branch_name: None,
            head_label: None,
            sha: sha.to_string(),
            author: "dev".to_string(),
            subject: "change".to_string(),
            timestamp: ts,
        }
    }

    fn secs(base: DateTime<Utc>, s: i64) -> DateTime<Utc> {
        base + chrono::Duration::seconds(s)
    }

    #[tokio::test]
    async fn two_pushes_inside_the_quiet_window_make_one_batch() {
        let mut fx = fixture().await;
        let branch = "17.0-feature";
        fx.ingestor
            .observe_commit(&push(&fx.repo_a, branch, "aaa", fx.t0), fx.t0)
            .await
            .unwrap();
        fx.ingestor
            .observe_commit(&push(&fx.repo_a, branch, "bbb", secs(fx.t0, 10)), secs(fx.t0, 10))
            .await
            .unwrap();

        // too early: the second push reset the watermark
        assert_eq!(fx.sweeper.sweep(secs(fx.t0, 30)).await.unwrap(), 0);
        assert_eq!(fx.sweeper.sweep(secs(fx.t0, 75)).await.unwrap(), 1);

        let bundle = fx
            .store
            .bundle_by_name(fx.project_id, branch)
            .await
            .unwrap()
            .unwrap();
        let batches = fx.store.open_batches(bundle.id).await.unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].state, BatchState::Ready);

        // replaced link points at the newer head
        let links = fx.store.commit_links(batches[0].id).await.unwrap();
        let link = links.iter().find(|l| l.repo_id == fx.repo_a.id).unwrap();
        assert_eq!(link.sha, "bbb");
        assert_eq!(link.match_kind, MatchKind::Pushed);

        // exactly one job came out of it
        match fx.events.try_recv().unwrap() {
            OutboundEvent::JobReady { params, .. } => {
                assert_eq!(params.commits.len(), 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(fx.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_repository_falls_back_to_base_head() {
        let mut fx = fixture().await;
        fx.ingestor
            .observe_commit(&push(&fx.repo_a, "17.0-feature", "feat-a", fx.t0), fx.t0)
            .await
            .unwrap();
        assert_eq!(fx.sweeper.sweep(secs(fx.t0, 90)).await.unwrap(), 1);

        let bundle = fx
            .store
            .bundle_by_name(fx.project_id, "17.0-feature")
            .await
            .unwrap()
            .unwrap();
        let batch = &fx.store.open_batches(bundle.id).await.unwrap()[0];
        let links = fx.store.commit_links(batch.id).await.unwrap();
        let by_repo = |repo: ResourceId| links.iter().find(|l| l.repo_id == repo).unwrap().clone();
        assert_eq!(by_repo(fx.repo_a.id).match_kind, MatchKind::Pushed);
        assert_eq!(by_repo(fx.repo_b.id).match_kind, MatchKind::BaseHead);
        assert_eq!(by_repo(fx.repo_b.id).sha, "base-addons");

        let slots = fx.store.slots_of_batch(batch.id).await.unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].link, Some(LinkKind::Created));
        assert_eq!(slots[0].trigger_id, fx.trigger.id);

        match fx.events.try_recv().unwrap() {
            OutboundEvent::JobReady { params, .. } => {
                assert_eq!(params.version_name, "17.0");
                let shas: Vec<&str> = params.commits.iter().map(|c| c.sha.as_str()).collect();
                assert!(shas.contains(&"feat-a"));
                assert!(shas.contains(&"base-addons"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unresolvable_trigger_is_skipped_with_a_reason() {
        let mut fx = fixture().await;
        let orphan = fx
            .store
            .create_repository(fx.project_id, "orphan", None)
            .await
            .unwrap();
        fx.store
            .create_trigger(Trigger {
                id: ResourceId::new(),
                project_id: fx.project_id,
                name: "orphan-suite".to_string(),
                primary_repo_ids: vec![fx.repo_a.id],
                dependency_repo_ids: vec![orphan.id],
                config_id: ResourceId::new(),
                priority: 0,
            })
            .await
            .unwrap();

        fx.ingestor
            .observe_commit(&push(&fx.repo_a, "17.0-feature", "feat-a", fx.t0), fx.t0)
            .await
            .unwrap();
        fx.sweeper.sweep(secs(fx.t0, 90)).await.unwrap();

        let bundle = fx
            .store
            .bundle_by_name(fx.project_id, "17.0-feature")
            .await
            .unwrap()
            .unwrap();
        let batch = &fx.store.open_batches(bundle.id).await.unwrap()[0];
        let slots = fx.store.slots_of_batch(batch.id).await.unwrap();
        assert_eq!(slots.len(), 2);
        let skipped = slots.iter().find(|s| s.job_id.is_none()).unwrap();
        assert!(skipped.skip_reason.as_deref().unwrap().contains("unresolved"));
        let bound = slots.iter().find(|s| s.job_id.is_some()).unwrap();
        assert_eq!(bound.link, Some(LinkKind::Created));
    }

    #[tokio::test]
    async fn identical_commit_set_reuses_the_job() {
        let mut fx = fixture().await;
        fx.ingestor
            .observe_commit(&push(&fx.repo_a, "17.0-feature", "feat-a", fx.t0), fx.t0)
            .await
            .unwrap();
        fx.sweeper.sweep(secs(fx.t0, 90)).await.unwrap();
        let first_job = match fx.events.try_recv().unwrap() {
            OutboundEvent::JobReady { job_id, .. } => job_id,
            other => panic!("unexpected event: {other:?}"),
        };

        // re-push of the same head opens a second batch with the same inputs
        let later = secs(fx.t0, 200);
        fx.ingestor
            .observe_commit(&push(&fx.repo_a, "17.0-feature", "feat-a", later), later)
            .await
            .unwrap();
        fx.sweeper.sweep(secs(later, 90)).await.unwrap();

        let second_job = match fx.events.try_recv().unwrap() {
            OutboundEvent::JobReady { job_id, .. } => job_id,
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(first_job, second_job);

        let job = fx.store.job(first_job).await.unwrap();
        assert!(job.keep_running);

        let bundle = fx
            .store
            .bundle_by_name(fx.project_id, "17.0-feature")
            .await
            .unwrap()
            .unwrap();
        let batches = fx.store.open_batches(bundle.id).await.unwrap();
        let newest = batches.last().unwrap();
        let slots = fx.store.slots_of_batch(newest.id).await.unwrap();
        assert_eq!(slots[0].link, Some(LinkKind::Matched));
    }

    #[tokio::test]
    async fn finished_jobs_complete_the_batch() {
        let mut fx = fixture().await;
        fx.ingestor
            .observe_commit(&push(&fx.repo_a, "17.0-feature", "feat-a", fx.t0), fx.t0)
            .await
            .unwrap();
        fx.sweeper.sweep(secs(fx.t0, 90)).await.unwrap();
        let job_id = match fx.events.try_recv().unwrap() {
            OutboundEvent::JobReady { job_id, .. } => job_id,
            other => panic!("unexpected event: {other:?}"),
        };

        let bundle = fx
            .store
            .bundle_by_name(fx.project_id, "17.0-feature")
            .await
            .unwrap()
            .unwrap();
        let batch_id = fx.store.open_batches(bundle.id).await.unwrap()[0].id;

        fx.sweeper.job_finished(job_id, JobResult::Ok, secs(fx.t0, 120)).await.unwrap();
        let job = fx.store.job(job_id).await.unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(fx.store.batch(batch_id).await.unwrap().state, BatchState::Done);

        // a later failure takes the running job down for good
        fx.sweeper.job_finished(job_id, JobResult::Ko, secs(fx.t0, 130)).await.unwrap();
        assert_eq!(fx.store.job(job_id).await.unwrap().state, JobState::Done);

        // a result for an unknown job is ignored
        fx.sweeper
            .job_finished(ResourceId::new(), JobResult::Ok, secs(fx.t0, 140))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rebuild_creates_a_fresh_job_with_the_same_inputs() {
        let mut fx = fixture().await;
        fx.ingestor
            .observe_commit(&push(&fx.repo_a, "17.0-feature", "feat-a", fx.t0), fx.t0)
            .await
            .unwrap();
        fx.sweeper.sweep(secs(fx.t0, 90)).await.unwrap();
        let original = match fx.events.try_recv().unwrap() {
            OutboundEvent::JobReady { job_id, .. } => job_id,
            other => panic!("unexpected event: {other:?}"),
        };

        let bundle = fx
            .store
            .bundle_by_name(fx.project_id, "17.0-feature")
            .await
            .unwrap()
            .unwrap();
        let batch_id = fx.store.open_batches(bundle.id).await.unwrap()[0].id;
        let slot_id = fx.store.slots_of_batch(batch_id).await.unwrap()[0].id;

        let rebuilt = fx
            .sweeper
            .rebuild(slot_id, secs(fx.t0, 100))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(rebuilt, original);

        let old = fx.store.job(original).await.unwrap();
        let new = fx.store.job(rebuilt).await.unwrap();
        assert_eq!(old.fingerprint, new.fingerprint);
        assert_ne!(old.params_id, new.params_id);
        assert_eq!(new.kind, JobKind::Rebuild);

        let slots = fx.store.slots_of_batch(batch_id).await.unwrap();
        assert_eq!(slots.len(), 2);
        assert!(slots.iter().any(|s| s.link == Some(LinkKind::Rebuild)));
    }

    #[tokio::test]
    async fn newer_batch_skips_the_older_one() {
        let mut fx = fixture().await;
        fx.ingestor
            .observe_commit(&push(&fx.repo_a, "17.0-feature", "aaa", fx.t0), fx.t0)
            .await
            .unwrap();
        fx.sweeper.sweep(secs(fx.t0, 90)).await.unwrap();
        let first_job = match fx.events.try_recv().unwrap() {
            OutboundEvent::JobReady { job_id, .. } => job_id,
            other => panic!("unexpected event: {other:?}"),
        };

        let later = secs(fx.t0, 200);
        fx.ingestor
            .observe_commit(&push(&fx.repo_a, "17.0-feature", "bbb", later), later)
            .await
            .unwrap();
        fx.sweeper.sweep(secs(later, 90)).await.unwrap();

        let bundle = fx
            .store
            .bundle_by_name(fx.project_id, "17.0-feature")
            .await
            .unwrap()
            .unwrap();
        let open = fx.store.open_batches(bundle.id).await.unwrap();
        assert_eq!(open.len(), 1, "only the newer batch stays open");

        // the superseded pending job was closed as skipped, not left behind
        let job = fx.store.job(first_job).await.unwrap();
        assert_eq!(job.state, JobState::Done);
        assert_eq!(job.result, Some(JobResult::Skipped));
    }
}
