//! Batch resolution and build deduplication.
//!
//! Turns per-repository commit events into per-bundle batches, resolves a
//! consistent commit set per batch via the fallback chain, deduplicates
//! identical job inputs by fingerprint and records the outcome as job
//! slots.

pub mod dedup;
pub mod error;
pub mod ingest;
pub mod resolver;
pub mod sweep;
pub mod vcs;

pub use dedup::{DedupOutcome, Deduplicator};
pub use error::{BatcherError, BatcherResult};
pub use ingest::Ingestor;
pub use resolver::{CommitResolver, Resolution, Vcs};
pub use sweep::BatchSweeper;
pub use vcs::GitVcs;

use chrono::{DateTime, Utc};
use convoy_core::event::InboundEvent;

/// Route an inbound event to the owning service. The producers (webhook
/// intake, workers, operators) live outside this crate.
pub async fn dispatch(
    ingestor: &Ingestor,
    sweeper: &BatchSweeper,
    event: InboundEvent,
    now: DateTime<Utc>,
) -> BatcherResult<()> {
    match event {
        InboundEvent::CommitObserved(observed) => ingestor.observe_commit(&observed, now).await,
        InboundEvent::BranchRetargeted { branch_id, new_target } => {
            ingestor.retarget_branch(branch_id, &new_target).await
        }
        InboundEvent::JobFinished { job_id, result } => {
            sweeper.job_finished(job_id, result, now).await
        }
        InboundEvent::ForceBuild { bundle_id } => ingestor.force_build(bundle_id, now).await,
        InboundEvent::Kill { job_id } => sweeper.kill(job_id).await,
        InboundEvent::WakeUp { job_id } => sweeper.wake_up(job_id).await,
    }
}
