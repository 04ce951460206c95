//! Commit resolution: the fallback chain filling in every repository a
//! batch needs but did not receive a direct push for.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use convoy_core::ResourceId;
use convoy_core::batch::{Batch, CommitLink, MatchKind};
use convoy_core::bundle::{Bundle, resolve_base};
use convoy_db::{BundleStore, SourceStore};
use tracing::{debug, warn};

use crate::BatcherResult;

/// Candidate batches of the base bundle examined for a commit-set match.
const BASE_MATCH_CANDIDATES: i64 = 10;

/// Seam to the underlying version-control tooling. Long-running git
/// computations run outside any store lock; a failure here degrades to "no
/// data", it never aborts resolution.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// SHA of the merge base of two commits in a repository, or None when
    /// the commits are unrelated.
    async fn merge_base(
        &self,
        repo_id: ResourceId,
        left: &str,
        right: &str,
    ) -> convoy_core::Result<Option<String>>;
}

/// Outcome of a resolution run: the batch's full link set and the
/// repositories that could not be covered.
#[derive(Debug)]
pub struct Resolution {
    pub links: BTreeMap<ResourceId, CommitLink>,
    pub missing: BTreeSet<ResourceId>,
}

impl Resolution {
    pub fn covers(&self, repos: &BTreeSet<ResourceId>) -> bool {
        repos.iter().all(|repo| self.links.contains_key(repo))
    }
}

/// Resolves exactly one commit per required repository for a batch.
///
/// Resolution order, first match per repository: commits pushed into the
/// batch, heads of the bundle's own branches, the best-matching recent
/// batch of the base bundle, heads of the base bundle's branches, and for
/// cross-project dependencies the equivalent bundle in the repository's own
/// project followed by that project's base.
pub struct CommitResolver {
    source: Arc<dyn SourceStore>,
    bundles: Arc<dyn BundleStore>,
    vcs: Arc<dyn Vcs>,
}

impl CommitResolver {
    pub fn new(
        source: Arc<dyn SourceStore>,
        bundles: Arc<dyn BundleStore>,
        vcs: Arc<dyn Vcs>,
    ) -> Self {
        Self { source, bundles, vcs }
    }

    pub async fn resolve(
        &self,
        batch: &Batch,
        bundle: &Bundle,
        required: &BTreeSet<ResourceId>,
    ) -> BatcherResult<Resolution> {
        // Step 1: whatever was pushed directly into this batch.
        let mut links: BTreeMap<ResourceId, CommitLink> = self
            .bundles
            .commit_links(batch.id)
            .await?
            .into_iter()
            .map(|link| (link.repo_id, link))
            .collect();

        let unresolved = |links: &BTreeMap<ResourceId, CommitLink>| -> Vec<ResourceId> {
            required.iter().filter(|repo| !links.contains_key(*repo)).copied().collect()
        };

        // Step 2: heads of the bundle's own branches.
        if !unresolved(&links).is_empty() {
            let heads = self.bundle_heads(bundle.id).await?;
            for repo in unresolved(&links) {
                if let Some(commit_id) = heads.get(&repo) {
                    let link = self.head_link(batch.id, repo, *commit_id, MatchKind::BundleHead).await?;
                    links.insert(repo, link);
                }
            }
        }

        let base_id = resolve_base(bundle, &self.bundles.base_bundles(bundle.project_id).await?)
            .filter(|base| *base != bundle.id);

        // Step 3: the best-matching recent batch of the base bundle.
        if let Some(base_id) = base_id {
            if !unresolved(&links).is_empty() {
                if let Some(candidate) = self.best_base_batch(base_id, &links).await? {
                    for repo in unresolved(&links) {
                        if let Some(link) = candidate.get(&repo) {
                            let link = self
                                .head_link(batch.id, repo, link.commit_id, MatchKind::BaseMatch)
                                .await?;
                            links.insert(repo, link);
                        }
                    }
                }
            }

            // Step 4: heads of the base bundle's branches.
            if !unresolved(&links).is_empty() {
                let heads = self.bundle_heads(base_id).await?;
                for repo in unresolved(&links) {
                    if let Some(commit_id) = heads.get(&repo) {
                        let link =
                            self.head_link(batch.id, repo, *commit_id, MatchKind::BaseHead).await?;
                        links.insert(repo, link);
                    }
                }
            }
        }

        // Step 5: cross-project dependencies fall back to the equivalent
        // bundle in the repository's own project, then that project's base.
        // Direct head lookups only, no recursion.
        for repo_id in unresolved(&links) {
            let repo = self.source.repository(repo_id).await?;
            if repo.project_id == bundle.project_id {
                continue;
            }
            if let Some(foreign) =
                self.bundles.bundle_by_name(repo.project_id, &bundle.name).await?
            {
                let heads = self.bundle_heads(foreign.id).await?;
                if let Some(commit_id) = heads.get(&repo_id) {
                    let link =
                        self.head_link(batch.id, repo_id, *commit_id, MatchKind::ForeignHead).await?;
                    links.insert(repo_id, link);
                    continue;
                }
            }
            if let Some(foreign_base) = self.foreign_base(repo.project_id, base_id).await? {
                let heads = self.bundle_heads(foreign_base).await?;
                if let Some(commit_id) = heads.get(&repo_id) {
                    let link = self
                        .head_link(batch.id, repo_id, *commit_id, MatchKind::ForeignBaseHead)
                        .await?;
                    links.insert(repo_id, link);
                }
            }
        }

        let missing: BTreeSet<ResourceId> = unresolved(&links).into_iter().collect();
        for repo_id in &missing {
            let name = self
                .source
                .repository(*repo_id)
                .await
                .map(|r| r.name)
                .unwrap_or_else(|_| repo_id.to_string());
            warn!(repo = %name, bundle = %bundle.name, "no commit found for repository");
        }

        Ok(Resolution { links, missing })
    }

    /// Head commit per repository over a bundle's branches. Plain branches
    /// win over change requests when both exist for the same repository.
    async fn bundle_heads(
        &self,
        bundle_id: ResourceId,
    ) -> BatcherResult<BTreeMap<ResourceId, ResourceId>> {
        let mut branches = self.source.branches_in_bundle(bundle_id).await?;
        branches.sort_by(|a, b| {
            a.is_change_request
                .cmp(&b.is_change_request)
                .then_with(|| a.name.cmp(&b.name))
        });
        let mut heads = BTreeMap::new();
        for branch in branches {
            if let Some(head) = branch.head {
                heads.entry(branch.repo_id).or_insert(head);
            }
        }
        Ok(heads)
    }

    /// Pick the base-bundle batch whose commit set best matches what this
    /// batch already resolved: one point per repository whose candidate
    /// commit is a merge-base ancestor of ours. Largest score wins, newer
    /// batches break ties. A merge-base failure drops that repository from
    /// the score instead of failing resolution.
    async fn best_base_batch(
        &self,
        base_id: ResourceId,
        resolved: &BTreeMap<ResourceId, CommitLink>,
    ) -> BatcherResult<Option<BTreeMap<ResourceId, CommitLink>>> {
        let candidates = self
            .bundles
            .recent_closed_batches(base_id, BASE_MATCH_CANDIDATES)
            .await?;
        let mut best: Option<(usize, BTreeMap<ResourceId, CommitLink>)> = None;
        for candidate in candidates {
            let candidate_links: BTreeMap<ResourceId, CommitLink> = self
                .bundles
                .commit_links(candidate.id)
                .await?
                .into_iter()
                .map(|link| (link.repo_id, link))
                .collect();
            let mut score = 0usize;
            for (repo_id, ours) in resolved {
                let Some(theirs) = candidate_links.get(repo_id) else {
                    continue;
                };
                match self.vcs.merge_base(*repo_id, &ours.sha, &theirs.sha).await {
                    Ok(Some(base_sha)) if base_sha == theirs.sha => score += 1,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(repo = %repo_id, error = %e, "merge-base failed, skipping repository");
                    }
                }
            }
            if score > 0 && best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                best = Some((score, candidate_links));
            }
        }
        if let Some((score, _)) = &best {
            debug!(score, "matched base batch");
        }
        Ok(best.map(|(_, links)| links))
    }

    /// The base bundle to use inside a foreign project: same name as our
    /// base when it exists there, else the foreign project's `master` base.
    async fn foreign_base(
        &self,
        project_id: ResourceId,
        base_id: Option<ResourceId>,
    ) -> BatcherResult<Option<ResourceId>> {
        if let Some(base_id) = base_id {
            let base = self.bundles.bundle(base_id).await?;
            if let Some(foreign) = self.bundles.bundle_by_name(project_id, &base.name).await? {
                if foreign.is_base {
                    return Ok(Some(foreign.id));
                }
            }
        }
        let bases = self.bundles.base_bundles(project_id).await?;
        Ok(bases.into_iter().find(|b| b.name == "master").map(|b| b.id))
    }

    /// Materialize a head-derived link and store it on the batch.
    async fn head_link(
        &self,
        batch_id: ResourceId,
        repo_id: ResourceId,
        commit_id: ResourceId,
        match_kind: MatchKind,
    ) -> BatcherResult<CommitLink> {
        let commit = self.source.commit(commit_id).await?;
        let link = CommitLink {
            id: ResourceId::new(),
            batch_id,
            repo_id,
            commit_id,
            sha: commit.sha,
            match_kind,
        };
        self.bundles.put_commit_link(link.clone()).await?;
        Ok(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use convoy_core::batch::BatchState;
    use convoy_core::source::Repository;
    use convoy_db::{MemStore, SourceStore};
    use std::collections::HashSet;

    /// Ancestor pairs (ours, theirs) for which theirs is the merge base.
    struct StubVcs {
        ancestors: HashSet<(String, String)>,
        failing: HashSet<ResourceId>,
    }

    impl StubVcs {
        fn new() -> Self {
            Self { ancestors: HashSet::new(), failing: HashSet::new() }
        }

        fn with_ancestor(mut self, ours: &str, theirs: &str) -> Self {
            self.ancestors.insert((ours.to_string(), theirs.to_string()));
            self
        }
    }

    #[async_trait]
    impl Vcs for StubVcs {
        async fn merge_base(
            &self,
            repo_id: ResourceId,
            left: &str,
            right: &str,
        ) -> convoy_core::Result<Option<String>> {
            if self.failing.contains(&repo_id) {
                return Err(convoy_core::Error::Vcs("git merge-base failed".to_string()));
            }
            if self.ancestors.contains(&(left.to_string(), right.to_string())) {
                Ok(Some(right.to_string()))
            } else {
                Ok(None)
            }
        }
    }

    struct Fixture {
        store: MemStore,
        project_id: ResourceId,
        repo_a: Repository,
        repo_b: Repository,
        base: Bundle,
    }

    async fn fixture() -> Fixture {
        let store = MemStore::new();
        let project = store.create_project("main").await.unwrap();
        let repo_a = store.create_repository(project.id, "server", None).await.unwrap();
        let repo_b = store.create_repository(project.id, "addons", None).await.unwrap();
        let mut base = Bundle::new(project.id, "17.0");
        base.is_base = true;
        base.sticky = true;
        let base = store.create_bundle(base).await.unwrap();
        for repo in [&repo_a, &repo_b] {
            let branch = store.upsert_branch(repo.id, "17.0", false, None, None).await.unwrap();
            let commit = store
                .record_commit(repo.id, &format!("base-{}", repo.name), "bot", "head", Utc::now())
                .await
                .unwrap();
            store.set_branch_head(branch.id, commit.id).await.unwrap();
            store.set_branch_bundle(branch.id, Some(base.id)).await.unwrap();
        }
        Fixture { store, project_id: project.id, repo_a, repo_b, base }
    }

    fn resolver(fx: &Fixture, vcs: StubVcs) -> CommitResolver {
        let store = Arc::new(fx.store.clone());
        CommitResolver::new(store.clone(), store, Arc::new(vcs))
    }

    async fn pushed_batch(fx: &Fixture, bundle: &Bundle, repo: &Repository, sha: &str) -> Batch {
        let batch = fx.store.create_batch(Batch::new(bundle.id, Utc::now())).await.unwrap();
        let commit = fx
            .store
            .record_commit(repo.id, sha, "dev", "change", Utc::now())
            .await
            .unwrap();
        fx.store
            .put_commit_link(CommitLink {
                id: ResourceId::new(),
                batch_id: batch.id,
                repo_id: repo.id,
                commit_id: commit.id,
                sha: sha.to_string(),
                match_kind: MatchKind::Pushed,
            })
            .await
            .unwrap();
        batch
    }

    #[tokio::test]
    async fn falls_back_to_base_heads() {
        let fx = fixture().await;
        let feature = fx
            .store
            .create_bundle(Bundle::new(fx.project_id, "17.0-feature"))
            .await
            .unwrap();
        let batch = pushed_batch(&fx, &feature, &fx.repo_a, "feat-a").await;

        let required = BTreeSet::from([fx.repo_a.id, fx.repo_b.id]);
        let resolver = resolver(&fx, StubVcs::new());
        let resolution = resolver.resolve(&batch, &feature, &required).await.unwrap();

        assert!(resolution.missing.is_empty());
        assert_eq!(resolution.links[&fx.repo_a.id].match_kind, MatchKind::Pushed);
        assert_eq!(resolution.links[&fx.repo_b.id].match_kind, MatchKind::BaseHead);
        assert_eq!(resolution.links[&fx.repo_b.id].sha, "base-addons");
    }

    #[tokio::test]
    async fn prefers_matching_base_batch_over_base_head() {
        let fx = fixture().await;
        let feature = fx
            .store
            .create_bundle(Bundle::new(fx.project_id, "17.0-feature"))
            .await
            .unwrap();

        // a closed base batch whose server commit is an ancestor of ours
        let base_batch = pushed_batch(&fx, &fx.base, &fx.repo_a, "old-a").await;
        let commit_b = fx
            .store
            .record_commit(fx.repo_b.id, "old-b", "bot", "companion", Utc::now())
            .await
            .unwrap();
        fx.store
            .put_commit_link(CommitLink {
                id: ResourceId::new(),
                batch_id: base_batch.id,
                repo_id: fx.repo_b.id,
                commit_id: commit_b.id,
                sha: "old-b".to_string(),
                match_kind: MatchKind::Pushed,
            })
            .await
            .unwrap();
        fx.store.set_batch_state(base_batch.id, BatchState::Done).await.unwrap();

        let batch = pushed_batch(&fx, &feature, &fx.repo_a, "feat-a").await;
        let required = BTreeSet::from([fx.repo_a.id, fx.repo_b.id]);
        let resolver = resolver(&fx, StubVcs::new().with_ancestor("feat-a", "old-a"));
        let resolution = resolver.resolve(&batch, &feature, &required).await.unwrap();

        assert_eq!(resolution.links[&fx.repo_b.id].match_kind, MatchKind::BaseMatch);
        assert_eq!(resolution.links[&fx.repo_b.id].sha, "old-b");
    }

    #[tokio::test]
    async fn merge_base_failure_degrades_to_base_head() {
        let fx = fixture().await;
        let feature = fx
            .store
            .create_bundle(Bundle::new(fx.project_id, "17.0-feature"))
            .await
            .unwrap();
        let base_batch = pushed_batch(&fx, &fx.base, &fx.repo_a, "old-a").await;
        fx.store.set_batch_state(base_batch.id, BatchState::Done).await.unwrap();

        let batch = pushed_batch(&fx, &feature, &fx.repo_a, "feat-a").await;
        let required = BTreeSet::from([fx.repo_a.id, fx.repo_b.id]);
        let mut vcs = StubVcs::new().with_ancestor("feat-a", "old-a");
        vcs.failing.insert(fx.repo_a.id);
        let resolver = resolver(&fx, vcs);
        let resolution = resolver.resolve(&batch, &feature, &required).await.unwrap();

        // the only scoring repository failed, so no base batch matched
        assert_eq!(resolution.links[&fx.repo_b.id].match_kind, MatchKind::BaseHead);
    }

    #[tokio::test]
    async fn cross_project_dependency_uses_foreign_base() {
        let fx = fixture().await;
        let other_project = fx.store.create_project("tooling").await.unwrap();
        let repo_c = fx
            .store
            .create_repository(other_project.id, "runtime", None)
            .await
            .unwrap();
        let mut foreign_base = Bundle::new(other_project.id, "master");
        foreign_base.is_base = true;
        let foreign_base = fx.store.create_bundle(foreign_base).await.unwrap();
        let branch = fx.store.upsert_branch(repo_c.id, "master", false, None, None).await.unwrap();
        let commit = fx
            .store
            .record_commit(repo_c.id, "run-c", "bot", "head", Utc::now())
            .await
            .unwrap();
        fx.store.set_branch_head(branch.id, commit.id).await.unwrap();
        fx.store.set_branch_bundle(branch.id, Some(foreign_base.id)).await.unwrap();

        let feature = fx
            .store
            .create_bundle(Bundle::new(fx.project_id, "17.0-feature"))
            .await
            .unwrap();
        let batch = pushed_batch(&fx, &feature, &fx.repo_a, "feat-a").await;
        let required = BTreeSet::from([fx.repo_a.id, repo_c.id]);
        let resolver = resolver(&fx, StubVcs::new());
        let resolution = resolver.resolve(&batch, &feature, &required).await.unwrap();

        assert_eq!(resolution.links[&repo_c.id].match_kind, MatchKind::ForeignBaseHead);
        assert_eq!(resolution.links[&repo_c.id].sha, "run-c");
    }

    #[tokio::test]
    async fn resolution_is_deterministic() {
        let fx = fixture().await;
        let feature = fx
            .store
            .create_bundle(Bundle::new(fx.project_id, "17.0-feature"))
            .await
            .unwrap();
        let batch = pushed_batch(&fx, &feature, &fx.repo_a, "feat-a").await;
        let required = BTreeSet::from([fx.repo_a.id, fx.repo_b.id]);
        let resolver = resolver(&fx, StubVcs::new());

        let first = resolver.resolve(&batch, &feature, &required).await.unwrap();
        let second = resolver.resolve(&batch, &feature, &required).await.unwrap();
        for repo in &required {
            assert_eq!(first.links[repo].sha, second.links[repo].sha);
            assert_eq!(first.links[repo].match_kind, second.links[repo].match_kind);
        }
    }

    #[tokio::test]
    async fn unresolvable_repository_is_reported() {
        let fx = fixture().await;
        let orphan_repo = fx
            .store
            .create_repository(fx.project_id, "orphan", None)
            .await
            .unwrap();
        let feature = fx
            .store
            .create_bundle(Bundle::new(fx.project_id, "17.0-feature"))
            .await
            .unwrap();
        let batch = pushed_batch(&fx, &feature, &fx.repo_a, "feat-a").await;
        let required = BTreeSet::from([fx.repo_a.id, orphan_repo.id]);
        let resolver = resolver(&fx, StubVcs::new());
        let resolution = resolver.resolve(&batch, &feature, &required).await.unwrap();

        assert_eq!(resolution.missing, BTreeSet::from([orphan_repo.id]));
        assert!(!resolution.covers(&required));
    }
}
