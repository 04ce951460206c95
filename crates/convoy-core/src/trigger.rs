//! Triggers: admin-configured rules mapping repositories to jobs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::ResourceId;

/// A rule producing one job per batch: pushing to any *primary* repository
/// justifies a job; *dependency* repositories are needed as inputs but do
/// not by themselves create work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: ResourceId,
    pub project_id: ResourceId,
    pub name: String,
    pub primary_repo_ids: Vec<ResourceId>,
    pub dependency_repo_ids: Vec<ResourceId>,
    /// Job configuration identifier carried into the job params.
    pub config_id: ResourceId,
    pub priority: i32,
}

impl Trigger {
    /// Every repository this trigger needs resolved before a job can be
    /// created.
    pub fn required_repos(&self) -> BTreeSet<ResourceId> {
        self.primary_repo_ids
            .iter()
            .chain(self.dependency_repo_ids.iter())
            .copied()
            .collect()
    }

    /// Does a push set intersect this trigger's primary repositories?
    pub fn fires_on(&self, pushed: &BTreeSet<ResourceId>) -> bool {
        self.primary_repo_ids.iter().any(|repo| pushed.contains(repo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_repos_unions_primaries_and_dependencies() {
        let a = ResourceId::new();
        let b = ResourceId::new();
        let trigger = Trigger {
            id: ResourceId::new(),
            project_id: ResourceId::new(),
            name: "server".to_string(),
            primary_repo_ids: vec![a],
            dependency_repo_ids: vec![b, a],
            config_id: ResourceId::new(),
            priority: 0,
        };
        assert_eq!(trigger.required_repos(), BTreeSet::from([a, b]));
        assert!(trigger.fires_on(&BTreeSet::from([a])));
        assert!(!trigger.fires_on(&BTreeSet::from([b])));
    }
}
