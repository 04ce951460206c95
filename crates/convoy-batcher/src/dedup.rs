//! Build deduplication by params fingerprint.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use convoy_core::ResourceId;
use convoy_core::job::{Job, JobKind, JobParams, LinkKind};
use convoy_db::JobStore;
use tracing::debug;

use crate::BatcherResult;

/// Result of resolving params to a job: the job itself and how it was
/// obtained.
#[derive(Debug)]
pub struct DedupOutcome {
    pub job: Job,
    pub link: LinkKind,
}

/// Finds an existing job for a set of params instead of creating a new one.
///
/// Params are immutable: any change produces new params and a new
/// fingerprint, which is what keeps a fingerprint valid for a job's
/// lifetime. Duplicate jobs are prevented here, structurally, not cleaned
/// up after the fact.
pub struct Deduplicator {
    jobs: Arc<dyn JobStore>,
}

impl Deduplicator {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        Self { jobs }
    }

    /// Reuse the most recent parent-less job with the same fingerprint, or
    /// create a new pending job. A matched job is shielded from eviction
    /// while the referencing batch is still open.
    pub async fn resolve_job(
        &self,
        params: JobParams,
        bundle_id: ResourceId,
        kind: JobKind,
        now: DateTime<Utc>,
    ) -> BatcherResult<DedupOutcome> {
        let params = params.normalized();
        let fingerprint = params.fingerprint();
        if let Some(job) = self.jobs.latest_job_with_fingerprint(&fingerprint).await? {
            debug!(job = %job.id, fingerprint = %fingerprint, "matched existing job");
            self.jobs.set_keep_running(job.id, true).await?;
            let mut job = job;
            job.keep_running = true;
            return Ok(DedupOutcome { job, link: LinkKind::Matched });
        }
        let params = self.jobs.create_params(params).await?;
        let job = self.jobs.create_job(Job::new(&params, bundle_id, kind, now)).await?;
        debug!(job = %job.id, fingerprint = %fingerprint, "job created");
        Ok(DedupOutcome { job, link: LinkKind::Created })
    }
}
