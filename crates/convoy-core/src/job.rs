//! Jobs, their immutable parameters and the slots binding them to batches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ResourceId;

/// One resolved commit inside a job's parameters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitRef {
    pub repo_id: ResourceId,
    pub sha: String,
}

/// The canonical, immutable input of a job. Any requested change produces
/// new params (and a new fingerprint), never an in-place mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParams {
    pub id: ResourceId,
    pub project_id: ResourceId,
    pub version_name: String,
    pub config_id: ResourceId,
    pub commits: Vec<CommitRef>,
    pub extra_modules: Vec<String>,
}

impl JobParams {
    /// Sort the content so logically-equal params hash identically.
    pub fn normalized(mut self) -> Self {
        self.commits.sort();
        self.commits.dedup();
        self.extra_modules.sort();
        self.extra_modules.dedup();
        self
    }

    /// Stable hash over the fully normalized content. Two params with the
    /// same normalized content always collapse to the same fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut commits = self.commits.clone();
        commits.sort();
        commits.dedup();
        let mut modules = self.extra_modules.clone();
        modules.sort();
        modules.dedup();

        let mut hasher = Sha256::new();
        hasher.update(b"project=");
        hasher.update(self.project_id.to_string().as_bytes());
        hasher.update(b"\nversion=");
        hasher.update(self.version_name.as_bytes());
        hasher.update(b"\nconfig=");
        hasher.update(self.config_id.to_string().as_bytes());
        for commit in &commits {
            hasher.update(b"\ncommit=");
            hasher.update(commit.repo_id.to_string().as_bytes());
            hasher.update(b":");
            hasher.update(commit.sha.as_bytes());
        }
        for module in &modules {
            hasher.update(b"\nmodule=");
            hasher.update(module.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Job kind, in claim-priority order: normal work first, scheduled
/// (nightly-style) work last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Normal,
    Rebuild,
    Indirect,
    Scheduled,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Normal => "normal",
            JobKind::Rebuild => "rebuild",
            JobKind::Indirect => "indirect",
            JobKind::Scheduled => "scheduled",
        }
    }

    /// Position in the claim ordering, lower claims first.
    pub fn claim_rank(&self) -> i32 {
        match self {
            JobKind::Normal => 0,
            JobKind::Rebuild => 1,
            JobKind::Indirect => 2,
            JobKind::Scheduled => 3,
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(JobKind::Normal),
            "rebuild" => Ok(JobKind::Rebuild),
            "indirect" => Ok(JobKind::Indirect),
            "scheduled" => Ok(JobKind::Scheduled),
            _ => Err(format!("unknown job kind: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Testing,
    Running,
    Done,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Testing => "testing",
            JobState::Running => "running",
            JobState::Done => "done",
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "testing" => Ok(JobState::Testing),
            "running" => Ok(JobState::Running),
            "done" => Ok(JobState::Done),
            _ => Err(format!("unknown job state: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobResult {
    Ok,
    Warn,
    Ko,
    Killed,
    Skipped,
}

impl JobResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobResult::Ok => "ok",
            JobResult::Warn => "warn",
            JobResult::Ko => "ko",
            JobResult::Killed => "killed",
            JobResult::Skipped => "skipped",
        }
    }
}

impl std::str::FromStr for JobResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(JobResult::Ok),
            "warn" => Ok(JobResult::Warn),
            "ko" => Ok(JobResult::Ko),
            "killed" => Ok(JobResult::Killed),
            "skipped" => Ok(JobResult::Skipped),
            _ => Err(format!("unknown job result: {s}")),
        }
    }
}

/// Asynchronous flag consumed by the owning host's loop on its next turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestedAction {
    Kill,
    WakeUp,
}

impl RequestedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestedAction::Kill => "kill",
            RequestedAction::WakeUp => "wake_up",
        }
    }
}

impl std::str::FromStr for RequestedAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kill" => Ok(RequestedAction::Kill),
            "wake_up" => Ok(RequestedAction::WakeUp),
            _ => Err(format!("unknown requested action: {s}")),
        }
    }
}

/// A test job. Mutable state; the parameters it was created from are not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: ResourceId,
    pub params_id: ResourceId,
    /// Denormalized from the params; indexed for deduplication lookups.
    pub fingerprint: String,
    /// Bundle the originating batch belonged to; drives GC sibling checks.
    pub bundle_id: ResourceId,
    pub config_id: ResourceId,
    pub kind: JobKind,
    pub state: JobState,
    pub result: Option<JobResult>,
    /// Owning host once claimed.
    pub host: Option<String>,
    pub requested_action: Option<RequestedAction>,
    /// Shields the job from running-phase GC while a still-open batch
    /// references it.
    pub keep_running: bool,
    pub parent_id: Option<ResourceId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(params: &JobParams, bundle_id: ResourceId, kind: JobKind, now: DateTime<Utc>) -> Self {
        Self {
            id: ResourceId::new(),
            params_id: params.id,
            fingerprint: params.fingerprint(),
            bundle_id,
            config_id: params.config_id,
            kind,
            state: JobState::Pending,
            result: None,
            host: None,
            requested_action: None,
            keep_running: false,
            parent_id: None,
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }
}

/// How a slot obtained its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    Created,
    Matched,
    Rebuild,
}

impl LinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkKind::Created => "created",
            LinkKind::Matched => "matched",
            LinkKind::Rebuild => "rebuild",
        }
    }
}

impl std::str::FromStr for LinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(LinkKind::Created),
            "matched" => Ok(LinkKind::Matched),
            "rebuild" => Ok(LinkKind::Rebuild),
            _ => Err(format!("unknown link kind: {s}")),
        }
    }
}

/// Binds a trigger to the job used to satisfy it within a batch, or records
/// why the trigger was skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSlot {
    pub id: ResourceId,
    pub batch_id: ResourceId,
    pub trigger_id: ResourceId,
    pub job_id: Option<ResourceId>,
    pub link: Option<LinkKind>,
    pub active: bool,
    pub skip_reason: Option<String>,
}

impl JobSlot {
    pub fn bound(batch_id: ResourceId, trigger_id: ResourceId, job_id: ResourceId, link: LinkKind) -> Self {
        Self {
            id: ResourceId::new(),
            batch_id,
            trigger_id,
            job_id: Some(job_id),
            link: Some(link),
            active: true,
            skip_reason: None,
        }
    }

    pub fn skipped(batch_id: ResourceId, trigger_id: ResourceId, reason: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(),
            batch_id,
            trigger_id,
            job_id: None,
            link: None,
            active: false,
            skip_reason: Some(reason.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(commits: Vec<CommitRef>, modules: Vec<&str>) -> JobParams {
        JobParams {
            id: ResourceId::new(),
            project_id: ResourceId::from_uuid(uuid::Uuid::from_u128(1)),
            version_name: "17.0".to_string(),
            config_id: ResourceId::from_uuid(uuid::Uuid::from_u128(2)),
            commits,
            extra_modules: modules.into_iter().map(String::from).collect(),
        }
    }

    #[test]
    fn fingerprint_ignores_ordering() {
        let repo_a = ResourceId::from_uuid(uuid::Uuid::from_u128(10));
        let repo_b = ResourceId::from_uuid(uuid::Uuid::from_u128(11));
        let left = params(
            vec![
                CommitRef { repo_id: repo_a, sha: "aaa".to_string() },
                CommitRef { repo_id: repo_b, sha: "bbb".to_string() },
            ],
            vec!["web", "base"],
        );
        let right = params(
            vec![
                CommitRef { repo_id: repo_b, sha: "bbb".to_string() },
                CommitRef { repo_id: repo_a, sha: "aaa".to_string() },
            ],
            vec!["base", "web"],
        );
        assert_eq!(left.fingerprint(), right.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let repo = ResourceId::from_uuid(uuid::Uuid::from_u128(10));
        let left = params(vec![CommitRef { repo_id: repo, sha: "aaa".to_string() }], vec![]);
        let mut right = left.clone();
        right.commits[0].sha = "bbb".to_string();
        assert_ne!(left.fingerprint(), right.fingerprint());
    }

    #[test]
    fn normalized_is_identity_for_fingerprint() {
        let repo = ResourceId::from_uuid(uuid::Uuid::from_u128(10));
        let raw = params(
            vec![
                CommitRef { repo_id: repo, sha: "aaa".to_string() },
                CommitRef { repo_id: repo, sha: "aaa".to_string() },
            ],
            vec!["web", "web"],
        );
        assert_eq!(raw.fingerprint(), raw.clone().normalized().fingerprint());
    }
}
