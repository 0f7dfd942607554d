//! Build strategies: what kind of run the orchestrator performs and how
//! each solution's version is decided.

use std::collections::BTreeMap;

use artifact_db::Version;
use async_trait::async_trait;

use crate::build_result::BuildResultType;
use crate::context::DependentSolution;
use crate::driver::RepositoryDriver;
use crate::error::{WorldBuildError, WorldBuildResult};

/// State of a solution right after its Prepare phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedState {
    /// Version computed for HEAD before this run touched the repository.
    pub previous_version: Option<Version>,
    pub version: Option<Version>,
    /// Whether Prepare created a new commit.
    pub committed: bool,
    /// Build-project upgrades waiting for the Build phase.
    pub pending_build_upgrades: bool,
}

#[async_trait]
pub trait BuildStrategy: Send + Sync {
    fn build_type(&self) -> BuildResultType;

    /// Version of the whole world, for release runs.
    fn world_release_version(&self) -> Option<&Version> {
        None
    }

    fn commit_message(&self, solution: &DependentSolution) -> String;

    /// Version `solution` gets when built at `commit_sha`.
    async fn resolve_version(
        &self,
        solution: &DependentSolution,
        driver: &dyn RepositoryDriver,
        commit_sha: &str,
    ) -> WorldBuildResult<Option<Version>>;

    fn must_build(&self, prepared: &PreparedState) -> bool;
}

/// Continuous-integration builds: versions come from the repository for
/// each commit; solutions that did not change are not rebuilt.
#[derive(Debug, Clone, Default)]
pub struct CiBuildStrategy;

#[async_trait]
impl BuildStrategy for CiBuildStrategy {
    fn build_type(&self) -> BuildResultType {
        BuildResultType::Ci
    }

    fn commit_message(&self, solution: &DependentSolution) -> String {
        format!("CI build of {}: upgrading local dependencies.", solution.name)
    }

    async fn resolve_version(
        &self,
        _solution: &DependentSolution,
        driver: &dyn RepositoryDriver,
        commit_sha: &str,
    ) -> WorldBuildResult<Option<Version>> {
        driver.read_version_info(commit_sha).await
    }

    fn must_build(&self, prepared: &PreparedState) -> bool {
        prepared.committed
            || prepared.pending_build_upgrades
            || prepared.version != prepared.previous_version
    }
}

/// Release builds: every solution is built with the version the roadmap
/// assigns to it.
#[derive(Debug, Clone, Default)]
pub struct ReleaseBuildStrategy {
    roadmap: BTreeMap<String, Version>,
    world_release_version: Option<Version>,
}

impl ReleaseBuildStrategy {
    pub fn new(roadmap: BTreeMap<String, Version>) -> Self {
        Self {
            roadmap,
            world_release_version: None,
        }
    }

    pub fn with_world_release_version(mut self, version: Version) -> Self {
        self.world_release_version = Some(version);
        self
    }

    pub fn roadmap(&self) -> &BTreeMap<String, Version> {
        &self.roadmap
    }
}

#[async_trait]
impl BuildStrategy for ReleaseBuildStrategy {
    fn build_type(&self) -> BuildResultType {
        BuildResultType::Release
    }

    fn world_release_version(&self) -> Option<&Version> {
        self.world_release_version.as_ref()
    }

    fn commit_message(&self, solution: &DependentSolution) -> String {
        match self.roadmap.get(&solution.name) {
            Some(v) => format!("Release {} v{}.", solution.name, v),
            None => format!("Release {}.", solution.name),
        }
    }

    async fn resolve_version(
        &self,
        solution: &DependentSolution,
        _driver: &dyn RepositoryDriver,
        _commit_sha: &str,
    ) -> WorldBuildResult<Option<Version>> {
        self.roadmap
            .get(&solution.name)
            .cloned()
            .map(Some)
            .ok_or_else(|| WorldBuildError::MissingVersion {
                solution: solution.name.clone(),
            })
    }

    fn must_build(&self, _prepared: &PreparedState) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryRepositoryDriver;

    fn solution(name: &str) -> DependentSolution {
        DependentSolution {
            index: 0,
            name: name.to_string(),
            repository: format!("org/{name}"),
            projects: Vec::new(),
        }
    }

    fn state(
        committed: bool,
        previous: Option<Version>,
        version: Option<Version>,
    ) -> PreparedState {
        PreparedState {
            previous_version: previous,
            version,
            committed,
            pending_build_upgrades: false,
        }
    }

    #[test]
    fn test_ci_skips_unchanged_solution() {
        let v = Some(Version::new(1, 0, 0));
        assert!(!CiBuildStrategy.must_build(&state(false, v.clone(), v.clone())));
        assert!(CiBuildStrategy.must_build(&state(true, v.clone(), v.clone())));
        assert!(CiBuildStrategy.must_build(&state(false, v, Some(Version::new(1, 0, 1)))));
        assert!(!CiBuildStrategy.must_build(&state(false, None, None)));
        let mut pending = state(false, None, None);
        pending.pending_build_upgrades = true;
        assert!(CiBuildStrategy.must_build(&pending));
    }

    #[tokio::test]
    async fn test_ci_reads_version_from_driver() {
        let driver = MemoryRepositoryDriver::new("org/a").with_version("a0", Version::new(0, 3, 0));
        let v = CiBuildStrategy
            .resolve_version(&solution("A"), &driver, "a0")
            .await
            .unwrap();
        assert_eq!(v, Some(Version::new(0, 3, 0)));
    }

    #[tokio::test]
    async fn test_release_uses_roadmap_and_rejects_unplanned_solution() {
        let mut roadmap = BTreeMap::new();
        roadmap.insert("A".to_string(), Version::new(2, 0, 0));
        let strategy = ReleaseBuildStrategy::new(roadmap)
            .with_world_release_version(Version::new(2024, 1, 0));
        let driver = MemoryRepositoryDriver::new("org/a");

        let v = strategy
            .resolve_version(&solution("A"), &driver, "a0")
            .await
            .unwrap();
        assert_eq!(v, Some(Version::new(2, 0, 0)));
        assert!(strategy.commit_message(&solution("A")).contains("v2.0.0"));
        assert_eq!(strategy.world_release_version(), Some(&Version::new(2024, 1, 0)));

        let err = strategy
            .resolve_version(&solution("B"), &driver, "b0")
            .await
            .unwrap_err();
        assert!(matches!(err, WorldBuildError::MissingVersion { .. }));
    }
}
