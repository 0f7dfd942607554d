//! In-memory fakes for the collaborator traits (testing only)
//!
//! Provides `MemoryRepositoryDriver` and `MemoryArtifactRepository` that
//! satisfy the trait contracts without Git, build tools or feeds.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use artifact_db::{ArtifactInstance, Version};
use async_trait::async_trait;

use crate::context::PackageUpgrade;
use crate::driver::{ArtifactRepository, RepositoryDriver};
use crate::error::{WorldBuildError, WorldBuildResult};

// ---------------------------------------------------------------------------
// MemoryRepositoryDriver
// ---------------------------------------------------------------------------

/// A call received by [`MemoryRepositoryDriver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    HeadCommitSha,
    Commit { message: String },
    CanAmendCommit,
    AmendCommit { message: String },
    ResetBranchState { commit_sha: String },
    ReadVersionInfo { commit_sha: String },
    UpdatePackageDependencies { upgrades: Vec<PackageUpgrade> },
    UpdateBuildProjectDependencies { upgrades: Vec<PackageUpgrade> },
    Build { version: Version },
}

#[derive(Debug)]
struct DriverState {
    head: String,
    next_commit: u64,
    dirty: bool,
    /// (project, typed artifact name) -> referenced version
    references: BTreeMap<(String, String), Version>,
    versions: HashMap<String, Version>,
    version_base: Option<Version>,
    can_amend: bool,
    build_succeeds: bool,
    commit_fails: bool,
    calls: Vec<DriverCall>,
}

/// Scripted repository: commits are numbered `"{repository}@{n}"`, HEAD
/// starts at `@0`, and a commit only moves HEAD when references changed.
#[derive(Debug)]
pub struct MemoryRepositoryDriver {
    repository: String,
    state: Mutex<DriverState>,
}

impl MemoryRepositoryDriver {
    pub fn new(repository: impl Into<String>) -> Self {
        let repository = repository.into();
        Self {
            state: Mutex::new(DriverState {
                head: format!("{repository}@0"),
                next_commit: 1,
                dirty: false,
                references: BTreeMap::new(),
                versions: HashMap::new(),
                version_base: None,
                can_amend: false,
                build_succeeds: true,
                commit_fails: false,
                calls: Vec::new(),
            }),
            repository,
        }
    }

    /// Version reported for `commit_sha`.
    pub fn with_version(self, commit_sha: impl Into<String>, version: Version) -> Self {
        self.lock().versions.insert(commit_sha.into(), version);
        self
    }

    /// Every commit `@n` (including the initial one) reports `base` with
    /// `n` added to its patch number.
    pub fn with_version_scheme(self, base: Version) -> Self {
        {
            let mut st = self.lock();
            let head = st.head.clone();
            st.versions.insert(head, base.clone());
            st.version_base = Some(base);
        }
        self
    }

    pub fn with_amend(self, can_amend: bool) -> Self {
        self.lock().can_amend = can_amend;
        self
    }

    pub fn with_failing_build(self) -> Self {
        self.lock().build_succeeds = false;
        self
    }

    pub fn with_failing_commit(self) -> Self {
        self.lock().commit_fails = true;
        self
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn head(&self) -> String {
        self.lock().head.clone()
    }

    /// Move HEAD as if someone else committed; returns the new SHA.
    pub fn simulate_external_commit(&self) -> String {
        let mut st = self.lock();
        self.new_commit(&mut st)
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.lock().calls.clone()
    }

    pub fn resets(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                DriverCall::ResetBranchState { commit_sha } => Some(commit_sha.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn builds(&self) -> Vec<Version> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                DriverCall::Build { version } => Some(version.clone()),
                _ => None,
            })
            .collect()
    }

    /// Version currently referenced by `project` for `typed_name`.
    pub fn reference(&self, project: &str, typed_name: &str) -> Option<Version> {
        self.lock()
            .references
            .get(&(project.to_string(), typed_name.to_string()))
            .cloned()
    }

    fn lock(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_commit(&self, st: &mut DriverState) -> String {
        let n = st.next_commit;
        st.next_commit += 1;
        let sha = format!("{}@{n}", self.repository);
        if let Some(base) = &st.version_base {
            let v = Version::new(base.major, base.minor, base.patch + n);
            st.versions.insert(sha.clone(), v);
        }
        st.head = sha.clone();
        st.dirty = false;
        sha
    }

    fn apply(st: &mut DriverState, upgrades: &[PackageUpgrade]) {
        for u in upgrades {
            let Some(version) = u.package.version() else {
                continue;
            };
            let key = (u.project.clone(), u.package.artifact().typed_name());
            if st.references.get(&key) != Some(version) {
                st.references.insert(key, version.clone());
                st.dirty = true;
            }
        }
    }
}

#[async_trait]
impl RepositoryDriver for MemoryRepositoryDriver {
    async fn head_commit_sha(&self) -> WorldBuildResult<String> {
        let mut st = self.lock();
        st.calls.push(DriverCall::HeadCommitSha);
        Ok(st.head.clone())
    }

    async fn commit(&self, message: &str) -> WorldBuildResult<()> {
        let mut st = self.lock();
        st.calls.push(DriverCall::Commit {
            message: message.to_string(),
        });
        if st.commit_fails {
            return Err(WorldBuildError::Driver {
                solution: self.repository.clone(),
                detail: "commit rejected".to_string(),
            });
        }
        if st.dirty {
            self.new_commit(&mut st);
        }
        Ok(())
    }

    async fn can_amend_commit(&self) -> WorldBuildResult<bool> {
        let mut st = self.lock();
        st.calls.push(DriverCall::CanAmendCommit);
        Ok(st.can_amend)
    }

    async fn amend_commit(&self, message: &str) -> WorldBuildResult<()> {
        let mut st = self.lock();
        st.calls.push(DriverCall::AmendCommit {
            message: message.to_string(),
        });
        if st.dirty {
            self.new_commit(&mut st);
        }
        Ok(())
    }

    async fn reset_branch_state(&self, commit_sha: &str) -> WorldBuildResult<()> {
        let mut st = self.lock();
        st.calls.push(DriverCall::ResetBranchState {
            commit_sha: commit_sha.to_string(),
        });
        st.head = commit_sha.to_string();
        st.dirty = false;
        Ok(())
    }

    async fn read_version_info(&self, commit_sha: &str) -> WorldBuildResult<Option<Version>> {
        let mut st = self.lock();
        st.calls.push(DriverCall::ReadVersionInfo {
            commit_sha: commit_sha.to_string(),
        });
        Ok(st.versions.get(commit_sha).cloned())
    }

    async fn update_package_dependencies(
        &self,
        upgrades: &[PackageUpgrade],
    ) -> WorldBuildResult<()> {
        let mut st = self.lock();
        st.calls.push(DriverCall::UpdatePackageDependencies {
            upgrades: upgrades.to_vec(),
        });
        Self::apply(&mut st, upgrades);
        Ok(())
    }

    async fn update_build_project_dependencies(
        &self,
        upgrades: &[PackageUpgrade],
    ) -> WorldBuildResult<()> {
        let mut st = self.lock();
        st.calls.push(DriverCall::UpdateBuildProjectDependencies {
            upgrades: upgrades.to_vec(),
        });
        Self::apply(&mut st, upgrades);
        Ok(())
    }

    async fn build(&self, version: &Version) -> WorldBuildResult<bool> {
        let mut st = self.lock();
        st.calls.push(DriverCall::Build {
            version: version.clone(),
        });
        Ok(st.build_succeeds)
    }
}

// ---------------------------------------------------------------------------
// MemoryArtifactRepository
// ---------------------------------------------------------------------------

/// Accepts instances by artifact type name and records what was pushed.
#[derive(Debug)]
pub struct MemoryArtifactRepository {
    name: String,
    types: BTreeSet<String>,
    fails: bool,
    pushed: Mutex<Vec<ArtifactInstance>>,
}

impl MemoryArtifactRepository {
    pub fn new<I, S>(name: impl Into<String>, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            types: types.into_iter().map(Into::into).collect(),
            fails: false,
            pushed: Mutex::new(Vec::new()),
        }
    }

    /// Every push fails.
    pub fn failing(mut self) -> Self {
        self.fails = true;
        self
    }

    pub fn pushed(&self) -> Vec<ArtifactInstance> {
        self.pushed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ArtifactRepository for MemoryArtifactRepository {
    fn unique_repository_name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, instance: &ArtifactInstance) -> bool {
        instance
            .artifact()
            .artifact_type()
            .is_some_and(|t| self.types.contains(t.name()))
    }

    async fn push(&self, instances: &[ArtifactInstance]) -> WorldBuildResult<()> {
        if self.fails {
            return Err(WorldBuildError::ArtifactRepository {
                repository: self.name.clone(),
                detail: "push rejected".to_string(),
            });
        }
        self.pushed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(instances);
        Ok(())
    }
}
