//! Collaborator seams: source-control/build driver per repository and the
//! artifact repositories receiving produced packages.
//!
//! Inject real implementations backed by Git and the build tools, or the
//! in-memory ones from [`crate::fakes`] in tests.

use artifact_db::{ArtifactInstance, Version};
use async_trait::async_trait;

use crate::context::PackageUpgrade;
use crate::error::WorldBuildResult;

/// Working copy, commit and build operations on one repository.
#[async_trait]
pub trait RepositoryDriver: Send + Sync {
    /// SHA of the current HEAD commit.
    async fn head_commit_sha(&self) -> WorldBuildResult<String>;

    /// Commit pending changes. Nothing to commit is not an error: HEAD
    /// simply does not move.
    async fn commit(&self, message: &str) -> WorldBuildResult<()>;

    /// Whether the last commit may be amended in place.
    async fn can_amend_commit(&self) -> WorldBuildResult<bool>;

    async fn amend_commit(&self, message: &str) -> WorldBuildResult<()>;

    /// Hard-reset the branch and working copy to `commit_sha`.
    async fn reset_branch_state(&self, commit_sha: &str) -> WorldBuildResult<()>;

    /// Version computed for `commit_sha`, `None` when none can be derived.
    async fn read_version_info(&self, commit_sha: &str) -> WorldBuildResult<Option<Version>>;

    /// Rewrite package references of regular projects.
    async fn update_package_dependencies(&self, upgrades: &[PackageUpgrade])
        -> WorldBuildResult<()>;

    /// Rewrite package references of build projects.
    async fn update_build_project_dependencies(
        &self,
        upgrades: &[PackageUpgrade],
    ) -> WorldBuildResult<()>;

    /// Run the build for `version`; `Ok(false)` is a failed build.
    async fn build(&self, version: &Version) -> WorldBuildResult<bool>;
}

/// A destination for produced packages (a feed, a registry, a mirror).
#[async_trait]
pub trait ArtifactRepository: Send + Sync {
    /// Name identifying this repository among all targets.
    fn unique_repository_name(&self) -> &str;

    fn accepts(&self, instance: &ArtifactInstance) -> bool;

    /// Push `instances`, all of which this repository accepts.
    async fn push(&self, instances: &[ArtifactInstance]) -> WorldBuildResult<()>;
}
