//! Projects, repositories, branches and the commit ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::ResourceId;

/// A project groups repositories, bundles and triggers that are tested
/// together (e.g. a product line and its addon repositories).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ResourceId,
    pub name: String,
}

/// A watched source repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: ResourceId,
    /// Default project this repository belongs to.
    pub project_id: ResourceId,
    pub name: String,
    pub clone_url: Option<Url>,
    pub created_at: DateTime<Utc>,
}

/// A branch or change request in a repository.
///
/// The owning bundle is derived from [`Branch::reference_name`] on creation
/// and only re-derived on an explicit retarget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: ResourceId,
    pub repo_id: ResourceId,
    /// Ref name for plain branches, change-request number for change requests.
    pub name: String,
    pub is_change_request: bool,
    /// Branch the change request wants to land in. None for plain branches.
    pub target_branch_name: Option<String>,
    /// Head label of a change request, `owner:branch` form.
    pub head_label: Option<String>,
    /// Latest known commit, updated by the ledger on every observed push.
    pub head: Option<ResourceId>,
    pub bundle_id: Option<ResourceId>,
}

impl Branch {
    /// Unique reference for this branch inside a bundle: the branch name for
    /// plain branches, the branch part of the head label for change requests
    /// (the full label when the owner side is all we know).
    pub fn reference_name(&self) -> String {
        if self.is_change_request {
            match &self.head_label {
                Some(label) => match label.split_once(':') {
                    Some((_, name)) if !name.is_empty() => name.to_string(),
                    _ => label.clone(),
                },
                None => self.name.clone(),
            }
        } else {
            self.name.clone()
        }
    }
}

/// An immutable commit. Identity is (repository, sha); the row is never
/// mutated once recorded, only linked to by branches and batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: ResourceId,
    pub repo_id: ResourceId,
    pub sha: String,
    pub author: String,
    pub subject: String,
    pub committed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch(is_cr: bool, name: &str, label: Option<&str>) -> Branch {
        Branch {
            id: ResourceId::new(),
            repo_id: ResourceId::new(),
            name: name.to_string(),
            is_change_request: is_cr,
            target_branch_name: is_cr.then(|| "17.0".to_string()),
            head_label: label.map(String::from),
            head: None,
            bundle_id: None,
        }
    }

    #[test]
    fn plain_branch_reference_is_its_name() {
        assert_eq!(branch(false, "17.0-feature-x", None).reference_name(), "17.0-feature-x");
    }

    #[test]
    fn change_request_reference_uses_head_label() {
        let b = branch(true, "1234", Some("dev:17.0-feature-x"));
        assert_eq!(b.reference_name(), "17.0-feature-x");
    }

    #[test]
    fn external_change_request_keeps_full_label() {
        let b = branch(true, "1234", Some("broken-label:"));
        assert_eq!(b.reference_name(), "broken-label:");
    }
}
