//! Git-backed implementation of the version-control seam.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use convoy_core::{Error, ResourceId};
use convoy_db::SourceStore;
use tokio::process::Command;
use tracing::debug;

use crate::resolver::Vcs;

/// Runs `git merge-base` against per-repository checkouts under a common
/// root directory, one directory per repository name. Fetch and clone are
/// someone else's job; this only reads history that is already there.
pub struct GitVcs {
    root: PathBuf,
    source: Arc<dyn SourceStore>,
}

impl GitVcs {
    pub fn new(root: impl Into<PathBuf>, source: Arc<dyn SourceStore>) -> Self {
        Self { root: root.into(), source }
    }
}

#[async_trait]
impl Vcs for GitVcs {
    async fn merge_base(
        &self,
        repo_id: ResourceId,
        left: &str,
        right: &str,
    ) -> convoy_core::Result<Option<String>> {
        let repo = self
            .source
            .repository(repo_id)
            .await
            .map_err(|e| Error::Vcs(format!("repository lookup: {e}")))?;
        let path = self.root.join(&repo.name);
        debug!(repo = %repo.name, left, right, "computing merge base");
        let output = Command::new("git")
            .arg("-C")
            .arg(&path)
            .args(["merge-base", left, right])
            .output()
            .await
            .map_err(|e| Error::Vcs(format!("git merge-base: {e}")))?;
        if output.status.success() {
            let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
            Ok(if sha.is_empty() { None } else { Some(sha) })
        } else if output.status.code() == Some(1) {
            // unrelated histories
            Ok(None)
        } else {
            Err(Error::Vcs(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}
