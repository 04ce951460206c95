//! Inbound commands and outbound notifications crossing the core boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;
use crate::job::{JobParams, JobResult};

/// A commit observed on a branch, produced by the (external) webhook or
/// fetch plumbing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitObserved {
    pub repo_id: ResourceId,
    pub branch_name: String,
    pub is_change_request: bool,
    pub target_branch_name: Option<String>,
    pub head_label: Option<String>,
    pub sha: String,
    pub author: String,
    pub subject: String,
    pub timestamp: DateTime<Utc>,
}

/// Commands applied as explicit, idempotent state transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InboundEvent {
    CommitObserved(CommitObserved),
    BranchRetargeted { branch_id: ResourceId, new_target: String },
    JobFinished { job_id: ResourceId, result: JobResult },
    ForceBuild { bundle_id: ResourceId },
    Kill { job_id: ResourceId },
    WakeUp { job_id: ResourceId },
}

/// Notifications consumed by external collaborators (worker provisioning,
/// dashboards).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OutboundEvent {
    /// A slot resolved to a created or matched job.
    JobReady { job_id: ResourceId, params: JobParams },
    /// A host claimed a job.
    HostAssignment { job_id: ResourceId, host: String },
}
