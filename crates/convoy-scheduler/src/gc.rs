//! Eviction policies for the testing and running phases.
//!
//! Both functions only *select* victims; the caller flags them for kill and
//! the owning host's loop performs the actual transition on its next turn.

use std::collections::{BTreeMap, HashSet};

use convoy_core::ResourceId;
use convoy_core::host::Host;
use convoy_core::job::{Job, JobState, RequestedAction};
use convoy_db::{BundleStore, JobStore};

use crate::SchedulerResult;

/// Testing-phase eviction: when the host is full and unassigned pending
/// work exists host-wide, a testing job on a non-sticky bundle with a
/// strictly newer pending sibling (same bundle, same config) is expendable.
pub async fn testing_eviction_candidates(
    jobs: &dyn JobStore,
    bundles: &dyn BundleStore,
    host: &Host,
) -> SchedulerResult<Vec<Job>> {
    let occupied = jobs
        .count_on_host(&host.name, &[JobState::Pending, JobState::Testing])
        .await?;
    if occupied < host.nb_workers as i64 || jobs.pending_unassigned_count().await? == 0 {
        return Ok(Vec::new());
    }

    let mut candidates = Vec::new();
    for job in jobs
        .jobs_on_host(&host.name, &[JobState::Pending, JobState::Testing])
        .await?
    {
        if job.requested_action == Some(RequestedAction::Kill) {
            continue;
        }
        if bundles.bundle(job.bundle_id).await?.sticky {
            continue;
        }
        if jobs.has_newer_pending_sibling(&job).await? {
            candidates.push(job);
        }
    }
    Ok(candidates)
}

/// Running-phase eviction: running jobs on the host beyond its running
/// max, oldest first. The most recent `sticky_retain` running jobs per
/// sticky bundle are protected regardless of host, as are jobs flagged
/// keep-running.
pub async fn running_eviction_candidates(
    jobs: &dyn JobStore,
    bundles: &dyn BundleStore,
    host: &Host,
    sticky_retain: usize,
) -> SchedulerResult<Vec<Job>> {
    let running = jobs.jobs_in_state(JobState::Running).await?;

    let mut by_bundle: BTreeMap<ResourceId, Vec<&Job>> = BTreeMap::new();
    for job in &running {
        by_bundle.entry(job.bundle_id).or_default().push(job);
    }
    let mut protected: HashSet<ResourceId> = HashSet::new();
    for (bundle_id, mut bundle_jobs) in by_bundle {
        if !bundles.bundle(bundle_id).await?.sticky {
            continue;
        }
        bundle_jobs.sort_by_key(|j| std::cmp::Reverse((j.started_at, j.id)));
        for job in bundle_jobs.into_iter().take(sticky_retain) {
            protected.insert(job.id);
        }
    }

    let mut host_running: Vec<&Job> = running
        .iter()
        .filter(|j| j.host.as_deref() == Some(host.name.as_str()))
        .collect();
    host_running.sort_by_key(|j| std::cmp::Reverse((j.started_at, j.id)));

    let mut kept = 0usize;
    let mut victims = Vec::new();
    for job in host_running {
        if protected.contains(&job.id) || job.keep_running {
            kept += 1;
            continue;
        }
        if kept < host.running_max as usize {
            kept += 1;
        } else {
            victims.push(job.clone());
        }
    }
    victims.reverse();
    Ok(victims)
}
