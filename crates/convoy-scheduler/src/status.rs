//! Read-only administrative queries. No side effects.

use std::sync::Arc;

use convoy_core::ResourceId;
use convoy_core::batch::Batch;
use convoy_core::host::Host;
use convoy_core::job::{Job, JobState};
use convoy_db::{BundleStore, HostStore, JobStore};

use crate::SchedulerResult;
use crate::gc;

/// Recently closed batches included alongside the open ones.
const RECENT_BATCHES: i64 = 5;

/// Answers the administrative query surface: batch state per bundle, job
/// state per host, current eviction candidates.
pub struct StatusReporter {
    bundles: Arc<dyn BundleStore>,
    jobs: Arc<dyn JobStore>,
    hosts: Arc<dyn HostStore>,
    sticky_retain: usize,
}

impl StatusReporter {
    pub fn new(
        bundles: Arc<dyn BundleStore>,
        jobs: Arc<dyn JobStore>,
        hosts: Arc<dyn HostStore>,
        sticky_retain: usize,
    ) -> Self {
        Self { bundles, jobs, hosts, sticky_retain }
    }

    /// Open batches of a bundle plus its most recent closed ones.
    pub async fn bundle_batches(&self, bundle_id: ResourceId) -> SchedulerResult<Vec<Batch>> {
        let mut batches = self.bundles.open_batches(bundle_id).await?;
        batches.extend(self.bundles.recent_closed_batches(bundle_id, RECENT_BATCHES).await?);
        Ok(batches)
    }

    /// Jobs a host currently owns, in every non-terminal state.
    pub async fn host_jobs(&self, host: &str) -> SchedulerResult<Vec<Job>> {
        Ok(self
            .jobs
            .jobs_on_host(host, &[JobState::Pending, JobState::Testing, JobState::Running])
            .await?)
    }

    /// What both GC phases would evict on a host right now.
    pub async fn eviction_candidates(&self, host_name: &str) -> SchedulerResult<Vec<Job>> {
        let host = self.hosts.host(host_name).await?;
        let mut candidates =
            gc::testing_eviction_candidates(&*self.jobs, &*self.bundles, &host).await?;
        candidates.extend(
            gc::running_eviction_candidates(
                &*self.jobs,
                &*self.bundles,
                &host,
                self.sticky_retain,
            )
            .await?,
        );
        Ok(candidates)
    }

    pub async fn hosts(&self) -> SchedulerResult<Vec<Host>> {
        Ok(self.hosts.list_hosts().await?)
    }
}
