//! Batches: one point-in-time resolution attempt for a bundle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// Lifecycle state of a batch. A bundle has at most one accumulating batch
/// at a time; promotion to ready happens via the quiet-window sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Accumulating,
    Ready,
    Done,
    Skipped,
}

impl BatchState {
    pub fn is_open(&self) -> bool {
        matches!(self, BatchState::Accumulating | BatchState::Ready)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Accumulating => "accumulating",
            BatchState::Ready => "ready",
            BatchState::Done => "done",
            BatchState::Skipped => "skipped",
        }
    }
}

impl std::str::FromStr for BatchState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accumulating" => Ok(BatchState::Accumulating),
            "ready" => Ok(BatchState::Ready),
            "done" => Ok(BatchState::Done),
            "skipped" => Ok(BatchState::Skipped),
            _ => Err(format!("unknown batch state: {s}")),
        }
    }
}

/// One resolution attempt for a bundle: the commits accumulated from pushes,
/// extended by the resolver, and the job slots created from them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: ResourceId,
    pub bundle_id: ResourceId,
    pub state: BatchState,
    /// Watermark of the last ref update; drives quiet-window promotion.
    pub last_update: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(bundle_id: ResourceId, now: DateTime<Utc>) -> Self {
        Self {
            id: ResourceId::new(),
            bundle_id,
            state: BatchState::Accumulating,
            last_update: now,
            created_at: now,
        }
    }
}

/// How a batch's commit for one repository was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// Pushed directly into this batch.
    Pushed,
    /// Head of one of the bundle's own branches.
    BundleHead,
    /// Matched against another batch of the base bundle.
    BaseMatch,
    /// Head of a base-bundle branch.
    BaseHead,
    /// Head of the equivalent bundle in the repository's own project.
    ForeignHead,
    /// Head of the base bundle in the repository's own project.
    ForeignBaseHead,
}

impl MatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKind::Pushed => "pushed",
            MatchKind::BundleHead => "bundle_head",
            MatchKind::BaseMatch => "base_match",
            MatchKind::BaseHead => "base_head",
            MatchKind::ForeignHead => "foreign_head",
            MatchKind::ForeignBaseHead => "foreign_base_head",
        }
    }
}

impl std::str::FromStr for MatchKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pushed" => Ok(MatchKind::Pushed),
            "bundle_head" => Ok(MatchKind::BundleHead),
            "base_match" => Ok(MatchKind::BaseMatch),
            "base_head" => Ok(MatchKind::BaseHead),
            "foreign_head" => Ok(MatchKind::ForeignHead),
            "foreign_base_head" => Ok(MatchKind::ForeignBaseHead),
            _ => Err(format!("unknown match kind: {s}")),
        }
    }
}

/// A batch's resolved commit for one repository, tagged with how it was
/// found.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitLink {
    pub id: ResourceId,
    pub batch_id: ResourceId,
    pub repo_id: ResourceId,
    pub commit_id: ResourceId,
    pub sha: String,
    pub match_kind: MatchKind,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn state_round_trips_through_strings() {
        for state in [BatchState::Accumulating, BatchState::Ready, BatchState::Done, BatchState::Skipped] {
            assert_eq!(BatchState::from_str(state.as_str()), Ok(state));
        }
        assert!(BatchState::from_str("preparing").is_err());
    }

    #[test]
    fn open_states() {
        assert!(BatchState::Accumulating.is_open());
        assert!(BatchState::Ready.is_open());
        assert!(!BatchState::Done.is_open());
        assert!(!BatchState::Skipped.is_open());
    }
}
