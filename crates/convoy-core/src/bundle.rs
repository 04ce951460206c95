//! Bundles: logical groupings of same-change branches across repositories.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// A bundle groups the branches (one per repository) believed to carry the
/// same logical change, e.g. a feature branch plus its counterpart change
/// requests in dependent repositories. Base bundles are the stable/release
/// lines everything else forks from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub id: ResourceId,
    pub project_id: ResourceId,
    pub name: String,
    /// Marks a stable/release line.
    pub is_base: bool,
    /// Recent running jobs on sticky bundles are shielded from eviction.
    pub sticky: bool,
    /// Claim-ordering boost, higher first.
    pub priority: i32,
    /// Explicit base override; wins over prefix matching.
    pub defined_base_id: Option<ResourceId>,
    /// Suppress automatic job creation for this bundle.
    pub no_build: bool,
    /// Extra modules to install on top of the trigger config.
    pub modules: Vec<String>,
    pub version_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Bundle {
    pub fn new(project_id: ResourceId, name: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(),
            project_id,
            name: name.into(),
            is_base: false,
            sticky: false,
            priority: 0,
            defined_base_id: None,
            no_build: false,
            modules: Vec::new(),
            version_name: None,
            created_at: Utc::now(),
        }
    }
}

/// Resolve the base bundle a bundle forks from.
///
/// The explicit override wins. Otherwise the longest base-bundle name that
/// prefixes this bundle's name wins; a name matching no base falls back to
/// the project's `master` base when one exists. Prefix matching is
/// best-effort by design ("13.0" vs "13.0-extra" stays ambiguous); the
/// override field is the escape hatch.
pub fn resolve_base(bundle: &Bundle, bases: &[Bundle]) -> Option<ResourceId> {
    if bundle.is_base {
        return Some(bundle.id);
    }
    if let Some(defined) = bundle.defined_base_id {
        return Some(defined);
    }
    let mut candidates: Vec<&Bundle> = bases
        .iter()
        .filter(|base| base.is_base && base.project_id == bundle.project_id)
        .collect();
    candidates.sort_by(|a, b| b.name.len().cmp(&a.name.len()).then(a.name.cmp(&b.name)));
    candidates
        .iter()
        .find(|base| bundle.name.starts_with(&base.name))
        .or_else(|| candidates.iter().find(|base| base.name == "master"))
        .map(|base| base.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(project_id: ResourceId, name: &str) -> Bundle {
        let mut bundle = Bundle::new(project_id, name);
        bundle.is_base = true;
        bundle.sticky = true;
        bundle
    }

    #[test]
    fn longest_prefix_wins() {
        let project_id = ResourceId::new();
        let bases = vec![base(project_id, "13.0"), base(project_id, "13.0-extra")];
        let bundle = Bundle::new(project_id, "13.0-extra-feature");
        assert_eq!(resolve_base(&bundle, &bases), Some(bases[1].id));
        let bundle = Bundle::new(project_id, "13.0-feature");
        assert_eq!(resolve_base(&bundle, &bases), Some(bases[0].id));
    }

    #[test]
    fn falls_back_to_master() {
        let project_id = ResourceId::new();
        let bases = vec![base(project_id, "13.0"), base(project_id, "master")];
        let bundle = Bundle::new(project_id, "some-feature");
        assert_eq!(resolve_base(&bundle, &bases), Some(bases[1].id));
    }

    #[test]
    fn defined_base_overrides_prefix() {
        let project_id = ResourceId::new();
        let bases = vec![base(project_id, "13.0"), base(project_id, "14.0")];
        let mut bundle = Bundle::new(project_id, "13.0-feature");
        bundle.defined_base_id = Some(bases[1].id);
        assert_eq!(resolve_base(&bundle, &bases), Some(bases[1].id));
    }

    #[test]
    fn foreign_project_bases_are_ignored() {
        let project_id = ResourceId::new();
        let bases = vec![base(ResourceId::new(), "13.0")];
        let bundle = Bundle::new(project_id, "13.0-feature");
        assert_eq!(resolve_base(&bundle, &bases), None);
    }
}
