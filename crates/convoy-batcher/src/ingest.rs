//! Commit ingestion: ledger update, bundle derivation and batch
//! accumulation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use convoy_core::ResourceId;
use convoy_core::batch::{Batch, CommitLink, MatchKind};
use convoy_core::bundle::Bundle;
use convoy_core::event::CommitObserved;
use convoy_core::source::Branch;
use convoy_db::{BundleStore, SourceStore};
use tracing::{debug, info, warn};

use crate::{BatcherError, BatcherResult};

/// Applies commit events to the ledger and accumulates them into the owning
/// bundle's open batch.
pub struct Ingestor {
    source: Arc<dyn SourceStore>,
    bundles: Arc<dyn BundleStore>,
}

impl Ingestor {
    pub fn new(source: Arc<dyn SourceStore>, bundles: Arc<dyn BundleStore>) -> Self {
        Self { source, bundles }
    }

    /// Handle an observed commit: record it, move the branch head, derive
    /// the bundle and append to its accumulating batch.
    pub async fn observe_commit(
        &self,
        event: &CommitObserved,
        now: DateTime<Utc>,
    ) -> BatcherResult<()> {
        let repo = self.source.repository(event.repo_id).await?;
        let commit = self
            .source
            .record_commit(repo.id, &event.sha, &event.author, &event.subject, event.timestamp)
            .await?;
        let mut branch = self
            .source
            .upsert_branch(
                repo.id,
                &event.branch_name,
                event.is_change_request,
                event.target_branch_name.as_deref(),
                event.head_label.as_deref(),
            )
            .await?;
        self.source.set_branch_head(branch.id, commit.id).await?;
        branch.head = Some(commit.id);

        let Some(bundle) = self.bundle_for(&branch, repo.project_id).await? else {
            return Ok(());
        };

        if bundle.no_build {
            debug!(bundle = %bundle.name, "bundle has builds disabled, not accumulating");
            return Ok(());
        }

        let batch = match self.bundles.accumulating_batch(bundle.id).await? {
            Some(batch) => batch,
            None => self.bundles.create_batch(Batch::new(bundle.id, now)).await?,
        };

        let link = CommitLink {
            id: ResourceId::new(),
            batch_id: batch.id,
            repo_id: repo.id,
            commit_id: commit.id,
            sha: commit.sha.clone(),
            match_kind: MatchKind::Pushed,
        };
        if let Some(replaced) = self.bundles.put_commit_link(link).await? {
            if replaced.commit_id != commit.id {
                info!(
                    repo = %repo.name,
                    old = %replaced.sha,
                    new = %commit.sha,
                    "branch moved, replacing batch commit"
                );
            }
        }
        self.bundles.touch_batch(batch.id, now).await?;
        Ok(())
    }

    /// Re-derive the owning bundle after a change request was retargeted.
    pub async fn retarget_branch(&self, branch_id: ResourceId, new_target: &str) -> BatcherResult<()> {
        self.source.set_branch_target(branch_id, new_target).await?;
        let mut branch = self.source.branch(branch_id).await?;
        branch.target_branch_name = Some(new_target.to_string());
        if !branch.is_change_request {
            return Ok(());
        }
        let repo = self.source.repository(branch.repo_id).await?;
        let previous = branch.bundle_id;
        let bundle = self.bundle_for(&branch, repo.project_id).await?;
        if bundle.as_ref().map(|b| b.id) != previous {
            info!(
                branch = %branch.name,
                target = new_target,
                "change request retargeted, bundle re-derived"
            );
        }
        Ok(())
    }

    /// Open a batch for a bundle regardless of its `no_build` flag.
    pub async fn force_build(&self, bundle_id: ResourceId, now: DateTime<Utc>) -> BatcherResult<()> {
        let bundle = self.bundles.bundle(bundle_id).await?;
        if self.bundles.accumulating_batch(bundle.id).await?.is_none() {
            self.bundles.create_batch(Batch::new(bundle.id, now)).await?;
            info!(bundle = %bundle.name, "build forced, batch opened");
        }
        Ok(())
    }

    /// Find or lazily create the bundle a branch belongs to, and point the
    /// branch at it. Change requests targeting a base bundle are refused:
    /// they would pollute the release line.
    async fn bundle_for(
        &self,
        branch: &Branch,
        project_id: ResourceId,
    ) -> BatcherResult<Option<Bundle>> {
        let name = branch.reference_name();
        let bundle = match self.bundles.bundle_by_name(project_id, &name).await? {
            Some(existing) => {
                if existing.is_base && branch.is_change_request {
                    warn!(
                        branch = %branch.name,
                        bundle = %existing.name,
                        "change request targets a base bundle, not attaching"
                    );
                    return Ok(None);
                }
                existing
            }
            None => {
                let mut bundle = Bundle::new(project_id, &name);
                // An external change request names its base line via the
                // target branch; pin the base explicitly.
                if branch.is_change_request {
                    if let Some(target) = &branch.target_branch_name {
                        if let Some(base) = self.bundles.bundle_by_name(project_id, target).await? {
                            if base.is_base {
                                bundle.defined_base_id = Some(base.id);
                                bundle.version_name = Some(base.name.clone());
                            }
                        }
                    }
                }
                self.create_bundle_logged(bundle).await?
            }
        };
        if branch.bundle_id != Some(bundle.id) {
            self.source.set_branch_bundle(branch.id, Some(bundle.id)).await?;
        }
        Ok(Some(bundle))
    }

    async fn create_bundle_logged(&self, bundle: Bundle) -> Result<Bundle, BatcherError> {
        let bundle = self.bundles.create_bundle(bundle).await?;
        debug!(bundle = %bundle.name, "bundle created");
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::source::Repository;
    use convoy_db::MemStore;

    struct Fixture {
        store: MemStore,
        ingestor: Ingestor,
        project_id: ResourceId,
        repo: Repository,
        base: Bundle,
    }

    async fn fixture() -> Fixture {
        let store = MemStore::new();
        let project = store.create_project("main").await.unwrap();
        let repo = store.create_repository(project.id, "server", None).await.unwrap();
        let mut base = Bundle::new(project.id, "17.0");
        base.is_base = true;
        base.sticky = true;
        let base = store.create_bundle(base).await.unwrap();
        let shared = Arc::new(store.clone());
        let ingestor = Ingestor::new(shared.clone(), shared);
        Fixture { store, ingestor, project_id: project.id, repo, base }
    }

    fn observed(repo: &Repository, branch: &str, sha: &str) -> CommitObserved {
        CommitObserved {
            repo_id: repo.id,
            branch_name: branch.to_string(),
            is_change_request: false,
            target_branch_name: None,
            head_label: None,
            sha: sha.to_string(),
            author: "dev".to_string(),
            subject: "change".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn change_request_targeting_a_base_bundle_is_refused() {
        let fx = fixture().await;
        let mut event = observed(&fx.repo, "1234", "abc");
        event.is_change_request = true;
        event.target_branch_name = Some("17.0".to_string());
        event.head_label = Some("dev:17.0".to_string());

        fx.ingestor.observe_commit(&event, Utc::now()).await.unwrap();

        assert!(fx.store.accumulating_batch(fx.base.id).await.unwrap().is_none());
        let branch = fx
            .store
            .upsert_branch(fx.repo.id, "1234", true, Some("17.0"), Some("dev:17.0"))
            .await
            .unwrap();
        assert_eq!(branch.bundle_id, None);
    }

    #[tokio::test]
    async fn change_request_pins_its_base_explicitly() {
        let fx = fixture().await;
        let mut event = observed(&fx.repo, "1234", "abc");
        event.is_change_request = true;
        event.target_branch_name = Some("17.0".to_string());
        event.head_label = Some("dev:my-feature".to_string());

        fx.ingestor.observe_commit(&event, Utc::now()).await.unwrap();

        let bundle = fx
            .store
            .bundle_by_name(fx.project_id, "my-feature")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bundle.defined_base_id, Some(fx.base.id));
        assert_eq!(bundle.version_name.as_deref(), Some("17.0"));
        assert!(fx.store.accumulating_batch(bundle.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn no_build_bundles_only_batch_when_forced() {
        let fx = fixture().await;
        let mut quiet = Bundle::new(fx.project_id, "quiet-feature");
        quiet.no_build = true;
        let quiet = fx.store.create_bundle(quiet).await.unwrap();

        fx.ingestor
            .observe_commit(&observed(&fx.repo, "quiet-feature", "abc"), Utc::now())
            .await
            .unwrap();
        assert!(fx.store.accumulating_batch(quiet.id).await.unwrap().is_none());

        fx.ingestor.force_build(quiet.id, Utc::now()).await.unwrap();
        assert!(fx.store.accumulating_batch(quiet.id).await.unwrap().is_some());
    }
}
