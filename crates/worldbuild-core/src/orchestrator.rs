//! Dependency-ordered build orchestration.
//!
//! [`BuildOrchestrator`] walks a [`DependentSolutionContext`] strictly in rank
//! order, one solution at a time:
//!
//! 1. **Prepare** every solution: apply upgrades to the versions produced
//!    upstream, commit, and read back the version of the new commit.
//! 2. **Build** every solution that must be built: re-apply upgrades when an
//!    upstream solution was built at another version than Prepare saw, check
//!    HEAD did not move, apply build-project upgrades, amend or commit, and
//!    run the build.
//!    A commit that moved HEAD asks for a retry on the new commit, bounded by
//!    [`OrchestratorConfig::max_retries`].
//!
//! When solution `i` fails, every prepared solution ranked after `i` is reset
//! to the commit it had before the run; solutions ranked up to `i` keep their
//! commits.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use artifact_db::Version;
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::build_result::BuildResultType;
use crate::context::{DependentSolution, DependentSolutionContext, PackageUpgrade};
use crate::driver::RepositoryDriver;
use crate::error::{RollbackEntry, WorldBuildError, WorldBuildResult};
use crate::obs;
use crate::strategy::{BuildStrategy, PreparedState};

/// Environment variable overriding [`OrchestratorConfig::max_retries`].
pub const MAX_RETRIES_ENV: &str = "WORLDBUILD_MAX_RETRIES";
/// Environment variable enabling [`OrchestratorConfig::dry_run`].
pub const DRY_RUN_ENV: &str = "WORLDBUILD_DRY_RUN";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Retries allowed per solution after the first build attempt.
    pub max_retries: u32,
    /// Run every step except the build tool itself.
    pub dry_run: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            dry_run: false,
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overridden by `WORLDBUILD_MAX_RETRIES` / `WORLDBUILD_DRY_RUN`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(MAX_RETRIES_ENV) {
            match raw.trim().parse() {
                Ok(n) => config.max_retries = n,
                Err(_) => warn!(
                    variable = MAX_RETRIES_ENV,
                    value = %raw,
                    "ignoring invalid retry budget"
                ),
            }
        }
        if let Ok(raw) = std::env::var(DRY_RUN_ENV) {
            config.dry_run = matches!(raw.trim(), "1" | "true" | "yes");
        }
        config
    }
}

/// Result of one Build step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Succeed,
    Failed { reason: String },
    /// Build again on `commit_sha` without re-running Prepare.
    MustRetry { commit_sha: String },
}

/// A solution after Prepare, carried into Build.
#[derive(Debug, Clone)]
pub struct PreparedSolution {
    pub index: usize,
    pub name: String,
    pub repository: String,
    /// HEAD before this run touched the repository.
    pub pre_run_sha: String,
    /// HEAD the Build step expects.
    pub commit_sha: String,
    pub state: PreparedState,
    pub must_build: bool,
    build_upgrades: Vec<PackageUpgrade>,
}

impl PreparedSolution {
    /// Upgrades applied to build projects during Build.
    pub fn build_upgrades(&self) -> &[PackageUpgrade] {
        &self.build_upgrades
    }
}

/// Every solution prepared, ready for the Build phase.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    run_id: String,
    started: Instant,
    solutions: Vec<PreparedSolution>,
}

impl PreparedRun {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn solutions(&self) -> &[PreparedSolution] {
        &self.solutions
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SolutionBuildInfo {
    pub name: String,
    pub index: usize,
    pub version: Option<Version>,
    pub commit_sha: String,
    /// False when the strategy decided the solution did not need a build.
    pub built: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildRunOutcome {
    pub run_id: String,
    pub build_type: BuildResultType,
    pub world_release_version: Option<Version>,
    /// Every solution, in rank order.
    pub solutions: Vec<SolutionBuildInfo>,
}

impl BuildRunOutcome {
    pub fn built(&self) -> impl Iterator<Item = &SolutionBuildInfo> {
        self.solutions.iter().filter(|s| s.built)
    }
}

/// Drives Prepare and Build over a ranked world of solutions.
pub struct BuildOrchestrator {
    context: Arc<DependentSolutionContext>,
    strategy: Arc<dyn BuildStrategy>,
    drivers: BTreeMap<String, Arc<dyn RepositoryDriver>>,
    config: OrchestratorConfig,
}

impl BuildOrchestrator {
    pub fn new(context: Arc<DependentSolutionContext>, strategy: Arc<dyn BuildStrategy>) -> Self {
        Self {
            context,
            strategy,
            drivers: BTreeMap::new(),
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Register the driver of solution `solution`.
    pub fn with_driver(
        mut self,
        solution: impl Into<String>,
        driver: Arc<dyn RepositoryDriver>,
    ) -> Self {
        self.drivers.insert(solution.into(), driver);
        self
    }

    pub fn context(&self) -> &DependentSolutionContext {
        &self.context
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Prepare then build the whole world.
    pub async fn run(&self) -> WorldBuildResult<BuildRunOutcome> {
        let prepared = self.prepare().await?;
        self.build(prepared).await
    }

    /// Prepare every solution in rank order.
    pub async fn prepare(&self) -> WorldBuildResult<PreparedRun> {
        let run_id = format!("run-{}", Uuid::new_v4());
        let span = obs::run_span(&run_id, self.strategy.build_type());
        self.prepare_all(run_id).instrument(span).await
    }

    /// Build every prepared solution that must be built, in rank order.
    pub async fn build(&self, run: PreparedRun) -> WorldBuildResult<BuildRunOutcome> {
        let span = obs::run_span(&run.run_id, self.strategy.build_type());
        self.build_all(run).instrument(span).await
    }

    fn driver(&self, solution: &str) -> WorldBuildResult<&Arc<dyn RepositoryDriver>> {
        self.drivers
            .get(solution)
            .ok_or_else(|| WorldBuildError::MissingDriver {
                solution: solution.to_string(),
            })
    }

    async fn prepare_all(&self, run_id: String) -> WorldBuildResult<PreparedRun> {
        obs::emit_run_started(&run_id, self.strategy.build_type(), self.context.len());
        let started = Instant::now();
        let mut solutions: Vec<PreparedSolution> = Vec::with_capacity(self.context.len());
        let mut produced: BTreeMap<String, Version> = BTreeMap::new();

        for solution in self.context.solutions() {
            let span = obs::solution_span(&solution.name, solution.index);
            match self.prepare_build(solution, &produced).instrument(span).await {
                Ok(p) => {
                    if let Some(v) = &p.state.version {
                        produced.insert(p.name.clone(), v.clone());
                    }
                    solutions.push(p);
                }
                Err(e) => {
                    let err = self.on_solution_build_failed(solution, e, &solutions).await;
                    obs::emit_run_finished(&run_id, elapsed_ms(started), 0, false);
                    return Err(err);
                }
            }
        }

        Ok(PreparedRun {
            run_id,
            started,
            solutions,
        })
    }

    /// Upgrade, commit and read back the version of one solution.
    async fn prepare_build(
        &self,
        solution: &DependentSolution,
        produced: &BTreeMap<String, Version>,
    ) -> WorldBuildResult<PreparedSolution> {
        let driver = self.driver(&solution.name)?.as_ref();
        let pre_run_sha = driver.head_commit_sha().await?;
        let previous_version = self
            .strategy
            .resolve_version(solution, driver, &pre_run_sha)
            .await?;

        let (build_upgrades, upgrades): (Vec<_>, Vec<_>) = self
            .context
            .upgrades_for(solution.index, produced)
            .into_iter()
            .partition(|u| u.build_project);
        driver.update_package_dependencies(&upgrades).await?;
        driver
            .commit(&self.strategy.commit_message(solution))
            .await
            .map_err(|e| WorldBuildError::CommitFailed {
                solution: solution.name.clone(),
                reason: e.to_string(),
            })?;

        let commit_sha = driver.head_commit_sha().await?;
        let committed = commit_sha != pre_run_sha;
        let version = if committed {
            self.strategy
                .resolve_version(solution, driver, &commit_sha)
                .await?
        } else {
            previous_version.clone()
        };
        let state = PreparedState {
            previous_version,
            version,
            committed,
            pending_build_upgrades: !build_upgrades.is_empty(),
        };
        let must_build = self.strategy.must_build(&state);
        obs::emit_solution_prepared(
            &solution.name,
            &commit_sha,
            state.version.as_ref(),
            must_build,
        );

        Ok(PreparedSolution {
            index: solution.index,
            name: solution.name.clone(),
            repository: solution.repository.clone(),
            pre_run_sha,
            commit_sha,
            state,
            must_build,
            build_upgrades,
        })
    }

    async fn build_all(&self, run: PreparedRun) -> WorldBuildResult<BuildRunOutcome> {
        let prepared_versions: BTreeMap<String, Version> = run
            .solutions
            .iter()
            .filter_map(|p| Some((p.name.clone(), p.state.version.clone()?)))
            .collect();
        let mut final_versions = prepared_versions.clone();
        let mut infos = Vec::with_capacity(run.solutions.len());
        for prepared in &run.solutions {
            let solution = self
                .context
                .get(prepared.index)
                .ok_or_else(|| WorldBuildError::SolutionNotFound {
                    name: prepared.name.clone(),
                })?;

            let span = obs::solution_span(&solution.name, solution.index);
            let attempt = async {
                let current = self
                    .realign_upgrades(
                        solution,
                        prepared.clone(),
                        &prepared_versions,
                        &final_versions,
                    )
                    .await?;
                if !current.must_build {
                    obs::emit_solution_skipped(&current.name, "unchanged since last build");
                    return Ok((current, false));
                }
                let done = self.build_with_retries(solution, current).await?;
                Ok::<_, WorldBuildError>((done, true))
            };
            let result = attempt.instrument(span).await;
            match result {
                Ok((done, built)) => {
                    match &done.state.version {
                        Some(v) => final_versions.insert(done.name.clone(), v.clone()),
                        None => final_versions.remove(&done.name),
                    };
                    infos.push(SolutionBuildInfo {
                        name: done.name,
                        index: done.index,
                        version: done.state.version,
                        commit_sha: done.commit_sha,
                        built,
                    });
                }
                Err(e) => {
                    let err = self
                        .on_solution_build_failed(solution, e, &run.solutions)
                        .await;
                    let built = infos.iter().filter(|i| i.built).count();
                    obs::emit_run_finished(&run.run_id, elapsed_ms(run.started), built, false);
                    return Err(err);
                }
            }
        }

        let built = infos.iter().filter(|i| i.built).count();
        obs::emit_run_finished(&run.run_id, elapsed_ms(run.started), built, true);
        Ok(BuildRunOutcome {
            run_id: run.run_id,
            build_type: self.strategy.build_type(),
            world_release_version: self.strategy.world_release_version().cloned(),
            solutions: infos,
        })
    }

    /// Re-apply upgrades when an upstream solution was built at a version
    /// other than the one Prepare upgraded to.
    ///
    /// Regular references are updated and committed here; build-project
    /// references are left to the Build step. A realigned solution is always
    /// built.
    async fn realign_upgrades(
        &self,
        solution: &DependentSolution,
        mut current: PreparedSolution,
        prepared_versions: &BTreeMap<String, Version>,
        final_versions: &BTreeMap<String, Version>,
    ) -> WorldBuildResult<PreparedSolution> {
        let planned = self.context.upgrades_for(solution.index, prepared_versions);
        let actual = self.context.upgrades_for(solution.index, final_versions);
        if planned == actual {
            return Ok(current);
        }
        obs::emit_upgrades_realigned(&solution.name, actual.len());
        let (build_upgrades, upgrades): (Vec<_>, Vec<_>) =
            actual.into_iter().partition(|u| u.build_project);
        current.state.pending_build_upgrades = !build_upgrades.is_empty();
        current.build_upgrades = build_upgrades;
        current.must_build = true;
        if upgrades.is_empty() {
            return Ok(current);
        }

        let driver = self.driver(&solution.name)?.as_ref();
        let head = driver.head_commit_sha().await?;
        if head != current.commit_sha {
            return Err(WorldBuildError::HeadMoved {
                solution: solution.name.clone(),
                expected: current.commit_sha.clone(),
                found: head,
            });
        }
        driver.update_package_dependencies(&upgrades).await?;
        driver
            .commit(&self.strategy.commit_message(solution))
            .await
            .map_err(|e| WorldBuildError::CommitFailed {
                solution: solution.name.clone(),
                reason: e.to_string(),
            })?;
        let sha = driver.head_commit_sha().await?;
        if sha != current.commit_sha {
            current.state.version = self
                .strategy
                .resolve_version(solution, driver, &sha)
                .await?;
            current.state.committed = true;
            current.commit_sha = sha;
        }
        Ok(current)
    }

    async fn build_with_retries(
        &self,
        solution: &DependentSolution,
        mut current: PreparedSolution,
    ) -> WorldBuildResult<PreparedSolution> {
        let driver = self.driver(&solution.name)?.as_ref();
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match self.build_step(solution, driver, &mut current).await? {
                StepOutcome::Succeed => {
                    if let Some(v) = &current.state.version {
                        obs::emit_solution_built(&solution.name, v, attempts);
                    }
                    return Ok(current);
                }
                StepOutcome::Failed { reason } => {
                    return Err(WorldBuildError::StepFailed {
                        solution: solution.name.clone(),
                        reason,
                    });
                }
                StepOutcome::MustRetry { commit_sha } => {
                    if attempts > self.config.max_retries {
                        return Err(WorldBuildError::RetriesExhausted {
                            solution: solution.name.clone(),
                            attempts,
                        });
                    }
                    obs::emit_retry_scheduled(&solution.name, attempts, &commit_sha);
                    current.state.version = self
                        .strategy
                        .resolve_version(solution, driver, &commit_sha)
                        .await?;
                    current.commit_sha = commit_sha;
                }
            }
        }
    }

    /// One Build attempt on the commit `current` expects.
    async fn build_step(
        &self,
        solution: &DependentSolution,
        driver: &dyn RepositoryDriver,
        current: &mut PreparedSolution,
    ) -> WorldBuildResult<StepOutcome> {
        let head = driver.head_commit_sha().await?;
        if head != current.commit_sha {
            return Err(WorldBuildError::HeadMoved {
                solution: solution.name.clone(),
                expected: current.commit_sha.clone(),
                found: head,
            });
        }

        driver
            .update_build_project_dependencies(&current.build_upgrades)
            .await?;
        let message = self.strategy.commit_message(solution);
        if driver.can_amend_commit().await? {
            driver.amend_commit(&message).await?;
            let amended = driver.head_commit_sha().await?;
            if amended != current.commit_sha {
                current.state.version = self
                    .strategy
                    .resolve_version(solution, driver, &amended)
                    .await?;
                current.commit_sha = amended;
            }
        } else {
            driver
                .commit(&message)
                .await
                .map_err(|e| WorldBuildError::CommitFailed {
                    solution: solution.name.clone(),
                    reason: e.to_string(),
                })?;
            let sha = driver.head_commit_sha().await?;
            if sha != current.commit_sha {
                return Ok(StepOutcome::MustRetry { commit_sha: sha });
            }
        }

        let Some(version) = current.state.version.clone() else {
            return Ok(StepOutcome::MustRetry {
                commit_sha: current.commit_sha.clone(),
            });
        };
        if self.config.dry_run {
            info!(event = "solution.dry_run", solution = %solution.name, version = %version);
            return Ok(StepOutcome::Succeed);
        }
        if driver.build(&version).await? {
            Ok(StepOutcome::Succeed)
        } else {
            Ok(StepOutcome::Failed {
                reason: format!("build tool failed for version {version}"),
            })
        }
    }

    /// Reset every prepared solution ranked after `failed` to its pre-run
    /// commit and wrap `cause` with the list of resets.
    async fn on_solution_build_failed(
        &self,
        failed: &DependentSolution,
        cause: WorldBuildError,
        prepared: &[PreparedSolution],
    ) -> WorldBuildError {
        obs::emit_solution_failed(&failed.name, &cause);
        let mut rolled_back = Vec::new();
        for p in prepared.iter().filter(|p| p.index > failed.index) {
            let Ok(driver) = self.driver(&p.name) else {
                continue;
            };
            match driver.reset_branch_state(&p.pre_run_sha).await {
                Ok(()) => {
                    obs::emit_rollback_performed(&p.name, &p.repository, &p.pre_run_sha);
                    rolled_back.push(RollbackEntry {
                        solution: p.name.clone(),
                        repository: p.repository.clone(),
                        commit_sha: p.pre_run_sha.clone(),
                    });
                }
                Err(e) => obs::emit_rollback_failed(&p.name, &p.repository, &e),
            }
        }
        WorldBuildError::BuildFailed {
            solution: failed.name.clone(),
            cause: Box::new(cause),
            rolled_back,
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
