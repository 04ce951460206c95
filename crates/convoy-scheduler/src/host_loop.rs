//! The per-host scheduling loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use convoy_config::{HostConfig, SchedulerConfig};
use convoy_core::event::OutboundEvent;
use convoy_core::host::Host;
use convoy_core::job::{Job, JobResult, JobState, RequestedAction};
use convoy_db::{BundleStore, HostStore, JobStore};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::gc;
use crate::SchedulerResult;

/// One host's scheduling loop. Runs concurrently with every other host's
/// loop against the shared store; the claim contract is the only
/// synchronization.
pub struct HostRunner {
    name: String,
    jobs: Arc<dyn JobStore>,
    bundles: Arc<dyn BundleStore>,
    hosts: Arc<dyn HostStore>,
    host_config: HostConfig,
    scheduler_config: SchedulerConfig,
    events: mpsc::Sender<OutboundEvent>,
}

impl HostRunner {
    pub fn new(
        name: impl Into<String>,
        jobs: Arc<dyn JobStore>,
        bundles: Arc<dyn BundleStore>,
        hosts: Arc<dyn HostStore>,
        host_config: HostConfig,
        scheduler_config: SchedulerConfig,
        events: mpsc::Sender<OutboundEvent>,
    ) -> Self {
        Self {
            name: name.into(),
            jobs,
            bundles,
            hosts,
            host_config,
            scheduler_config,
            events,
        }
    }

    /// Run the scheduling loop.
    pub async fn run(&self) {
        info!(host = %self.name, "starting host loop");
        loop {
            if let Err(e) = self.turn(Utc::now()).await {
                warn!(host = %self.name, error = %e, "scheduler turn failed");
            }
            sleep(Duration::from_secs(self.host_config.loop_interval_secs)).await;
        }
    }

    /// One scheduling turn: actions, testing GC, claim, init, running GC.
    pub async fn turn(&self, now: DateTime<Utc>) -> SchedulerResult<()> {
        let mut host = self
            .hosts
            .get_or_create_host(&self.name, self.host_config.workers, self.host_config.running_max)
            .await?;
        host.last_loop_start = Some(now);
        self.hosts.update_host(&host).await?;

        self.process_requested_actions(&host, now).await?;

        for job in gc::testing_eviction_candidates(&*self.jobs, &*self.bundles, &host).await? {
            info!(host = %self.name, job = %job.id, "newer candidate found, flagging for kill");
            self.jobs.request_action(job.id, RequestedAction::Kill).await?;
        }

        self.claim(&host).await?;
        self.init_pending(&host, now).await?;

        for job in gc::running_eviction_candidates(
            &*self.jobs,
            &*self.bundles,
            &host,
            self.scheduler_config.sticky_retain,
        )
        .await?
        {
            info!(host = %self.name, job = %job.id, "over running cap, flagging for kill");
            self.jobs.request_action(job.id, RequestedAction::Kill).await?;
        }

        let mut host = self.hosts.host(&self.name).await?;
        host.last_loop_end = Some(now);
        host.last_success = Some(now);
        self.hosts.update_host(&host).await?;
        Ok(())
    }

    /// Consume kill/wake-up flags left for jobs this host owns. Idempotent:
    /// a flag on an already-settled job is simply cleared.
    async fn process_requested_actions(&self, host: &Host, now: DateTime<Utc>) -> SchedulerResult<()> {
        let owned = self
            .jobs
            .jobs_on_host(
                &host.name,
                &[JobState::Pending, JobState::Testing, JobState::Running, JobState::Done],
            )
            .await?;
        for mut job in owned {
            match job.requested_action {
                Some(RequestedAction::Kill) => {
                    job.requested_action = None;
                    if job.state != JobState::Done {
                        job.state = JobState::Done;
                        job.result = Some(JobResult::Killed);
                        job.finished_at = Some(now);
                        info!(host = %host.name, job = %job.id, "job killed");
                    }
                    self.jobs.update_job(&job).await?;
                }
                Some(RequestedAction::WakeUp) => {
                    job.requested_action = None;
                    if job.state == JobState::Done {
                        job.state = JobState::Running;
                        job.finished_at = None;
                        info!(host = %host.name, job = %job.id, "job woken up");
                    }
                    self.jobs.update_job(&job).await?;
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Claim pending jobs up to free capacity. Two passes, like keeping one
    /// worker clear of scheduled (nightly-style) work: the first pass takes
    /// everything but scheduled jobs at full capacity, the second fills up
    /// to capacity minus one with anything.
    async fn claim(&self, host: &Host) -> SchedulerResult<Vec<Job>> {
        let capacity = host.claim_capacity() as i64;
        if capacity <= 0 {
            return Ok(Vec::new());
        }
        let reserved = self
            .jobs
            .count_on_host(&host.name, &[JobState::Pending, JobState::Testing])
            .await?;

        let mut claimed = Vec::new();
        let assignable = capacity - reserved;
        if assignable > 0 {
            claimed.extend(self.jobs.claim_pending(&host.name, assignable, true).await?);
        }
        let reduced = if capacity > 1 { capacity - 1 } else { capacity };
        let assignable = reduced - reserved - claimed.len() as i64;
        if assignable > 0 {
            claimed.extend(self.jobs.claim_pending(&host.name, assignable, false).await?);
        }

        for job in &claimed {
            debug!(host = %host.name, job = %job.id, "job claimed");
            let _ = self
                .events
                .send(OutboundEvent::HostAssignment { job_id: job.id, host: host.name.clone() })
                .await;
        }
        Ok(claimed)
    }

    /// Move claimed pending jobs into testing while slots are actually
    /// free.
    async fn init_pending(&self, host: &Host, now: DateTime<Utc>) -> SchedulerResult<()> {
        let testing = self.jobs.count_on_host(&host.name, &[JobState::Testing]).await?;
        let available = host.nb_workers as i64 - testing;
        if available <= 0 {
            return Ok(());
        }
        let pending = self.jobs.jobs_on_host(&host.name, &[JobState::Pending]).await?;
        for mut job in pending.into_iter().take(available as usize) {
            job.state = JobState::Testing;
            job.started_at = Some(now);
            self.jobs.update_job(&job).await?;
            info!(host = %host.name, job = %job.id, "job started");
        }
        Ok(())
    }

    /// Count a failed source fetch against this host; past the threshold
    /// the host stops claiming until a fetch succeeds again.
    pub async fn record_fetch_failure(&self) -> SchedulerResult<bool> {
        let mut host = self
            .hosts
            .get_or_create_host(&self.name, self.host_config.workers, self.host_config.running_max)
            .await?;
        let degraded = host.record_fetch_failure(self.host_config.fetch_failure_threshold);
        if degraded {
            warn!(host = %host.name, failures = host.fetch_failure_count, "host degraded");
        }
        self.hosts.update_host(&host).await?;
        Ok(degraded)
    }

    pub async fn record_fetch_success(&self) -> SchedulerResult<()> {
        let mut host = self
            .hosts
            .get_or_create_host(&self.name, self.host_config.workers, self.host_config.running_max)
            .await?;
        host.record_fetch_success();
        self.hosts.update_host(&host).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::ResourceId;
    use convoy_core::bundle::Bundle;
    use convoy_core::job::{CommitRef, JobKind, JobParams};
    use convoy_db::MemStore;

    fn runner(store: &MemStore, name: &str, workers: i32, running_max: i32) -> HostRunner {
        let shared = Arc::new(store.clone());
        let (tx, _rx) = mpsc::channel(64);
        HostRunner::new(
            name,
            shared.clone(),
            shared.clone(),
            shared,
            HostConfig {
                workers,
                running_max,
                loop_interval_secs: 1,
                fetch_failure_threshold: 3,
            },
            SchedulerConfig { sticky_retain: 4 },
            tx,
        )
    }

    async fn make_job(store: &MemStore, bundle_id: ResourceId, config_id: ResourceId, sha: &str) -> Job {
        let params = JobParams {
            id: ResourceId::new(),
            project_id: ResourceId::new(),
            version_name: "17.0".to_string(),
            config_id,
            commits: vec![CommitRef { repo_id: ResourceId::new(), sha: sha.to_string() }],
            extra_modules: vec![],
        };
        let params = store.create_params(params).await.unwrap();
        let job = Job::new(&params, bundle_id, JobKind::Normal, Utc::now());
        store.create_job(job.clone()).await.unwrap();
        job
    }

    #[tokio::test]
    async fn hosts_never_exceed_their_capacity() {
        let store = MemStore::new();
        let bundle = store.create_bundle(Bundle::new(ResourceId::new(), "feature")).await.unwrap();
        let config_id = ResourceId::new();
        for i in 0..5 {
            make_job(&store, bundle.id, config_id, &format!("sha-{i}")).await;
        }

        let a = runner(&store, "host-a", 2, 5);
        let b = runner(&store, "host-b", 2, 5);
        let now = Utc::now();
        a.turn(now).await.unwrap();
        b.turn(now).await.unwrap();

        let on_a = store
            .jobs_on_host("host-a", &[JobState::Pending, JobState::Testing])
            .await
            .unwrap();
        let on_b = store
            .jobs_on_host("host-b", &[JobState::Pending, JobState::Testing])
            .await
            .unwrap();
        assert_eq!(on_a.len(), 2);
        assert_eq!(on_b.len(), 2);
        assert_eq!(store.pending_unassigned_count().await.unwrap(), 1);

        // repeated turns do not over-claim
        a.turn(now).await.unwrap();
        let on_a = store
            .jobs_on_host("host-a", &[JobState::Pending, JobState::Testing])
            .await
            .unwrap();
        assert_eq!(on_a.len(), 2);
        assert!(on_a.iter().all(|j| j.state == JobState::Testing));
    }

    #[tokio::test]
    async fn degraded_hosts_claim_nothing() {
        let store = MemStore::new();
        let bundle = store.create_bundle(Bundle::new(ResourceId::new(), "feature")).await.unwrap();
        make_job(&store, bundle.id, ResourceId::new(), "sha").await;

        let runner = runner(&store, "host-a", 2, 5);
        for _ in 0..3 {
            runner.record_fetch_failure().await.unwrap();
        }
        assert!(store.host("host-a").await.unwrap().degraded);

        runner.turn(Utc::now()).await.unwrap();
        assert_eq!(store.pending_unassigned_count().await.unwrap(), 1);

        // recovery restores the claim capacity
        runner.record_fetch_success().await.unwrap();
        runner.turn(Utc::now()).await.unwrap();
        assert_eq!(store.pending_unassigned_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn full_host_flags_superseded_testing_job() {
        let store = MemStore::new();
        let bundle = store.create_bundle(Bundle::new(ResourceId::new(), "feature")).await.unwrap();
        let config_id = ResourceId::new();
        let old = make_job(&store, bundle.id, config_id, "old").await;

        let runner = runner(&store, "host-a", 1, 5);
        let now = Utc::now();
        runner.turn(now).await.unwrap();
        assert_eq!(store.job(old.id).await.unwrap().state, JobState::Testing);

        // a newer pending sibling arrives while the host is full
        let newer = make_job(&store, bundle.id, config_id, "new").await;
        runner.turn(now).await.unwrap();
        assert_eq!(
            store.job(old.id).await.unwrap().requested_action,
            Some(RequestedAction::Kill)
        );

        // next turn consumes the flag and frees the slot for the newer job
        runner.turn(now).await.unwrap();
        let old = store.job(old.id).await.unwrap();
        assert_eq!(old.state, JobState::Done);
        assert_eq!(old.result, Some(JobResult::Killed));
        assert_eq!(store.job(newer.id).await.unwrap().host.as_deref(), Some("host-a"));
    }

    #[tokio::test]
    async fn sticky_recent_running_jobs_survive_gc() {
        let store = MemStore::new();
        let mut sticky = Bundle::new(ResourceId::new(), "17.0");
        sticky.is_base = true;
        sticky.sticky = true;
        let sticky = store.create_bundle(sticky).await.unwrap();

        let base = Utc::now();
        let mut ids = Vec::new();
        for i in 0..6 {
            let mut job = make_job(&store, sticky.id, ResourceId::new(), &format!("sha-{i}")).await;
            job.state = JobState::Running;
            job.host = Some("host-a".to_string());
            job.started_at = Some(base + chrono::Duration::seconds(i));
            store.update_job(&job).await.unwrap();
            ids.push(job.id);
        }

        let runner = runner(&store, "host-a", 2, 1);
        runner.turn(Utc::now()).await.unwrap();

        // the four most recent are shielded; the two oldest are flagged
        for id in &ids[2..] {
            assert_eq!(store.job(*id).await.unwrap().requested_action, None);
        }
        for id in &ids[..2] {
            assert_eq!(
                store.job(*id).await.unwrap().requested_action,
                Some(RequestedAction::Kill)
            );
        }
    }

    #[tokio::test]
    async fn wake_up_restarts_a_stopped_job() {
        let store = MemStore::new();
        let bundle = store.create_bundle(Bundle::new(ResourceId::new(), "feature")).await.unwrap();
        let mut job = make_job(&store, bundle.id, ResourceId::new(), "sha").await;
        job.state = JobState::Done;
        job.result = Some(JobResult::Ok);
        job.host = Some("host-a".to_string());
        store.update_job(&job).await.unwrap();
        store.request_action(job.id, RequestedAction::WakeUp).await.unwrap();

        let runner = runner(&store, "host-a", 2, 5);
        runner.turn(Utc::now()).await.unwrap();

        let job = store.job(job.id).await.unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.requested_action, None);
    }
}
