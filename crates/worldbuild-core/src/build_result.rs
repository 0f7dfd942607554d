//! Build result: what a run produced, where it goes, and at which commits.
//!
//! A [`BuildResult`] is assembled once per run from the orchestrator's
//! outcome. It feeds produced packages back into the package database
//! ([`BuildResult::to_package_infos`]), pushes them to their artifact
//! repositories ([`BuildResult::push_all`]) and persists as a versioned JSON
//! record ([`BuildResultRecord`]).
//!
//! Record format revisions:
//! - `0`: legacy. Solutions are not listed; each artifact names the solution
//!   that produced it and solutions are rebuilt from that, without commit SHA.
//! - `1`: current. Solutions are listed with their commit SHA.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use artifact_db::{
    ArtifactInstance, ArtifactTypeRegistry, DependencyKind, PackageInstanceInfo, Version,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::DependentSolutionContext;
use crate::driver::ArtifactRepository;
use crate::error::BuildResultError;
use crate::obs;
use crate::orchestrator::BuildRunOutcome;

/// Record revision written by [`BuildResult::to_record`].
pub const CURRENT_RECORD_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildResultType {
    Local,
    #[serde(rename = "CI")]
    Ci,
    Release,
}

impl fmt::Display for BuildResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BuildResultType::Local => "Local",
            BuildResultType::Ci => "CI",
            BuildResultType::Release => "Release",
        })
    }
}

/// One produced artifact instance bound to one accepting repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedArtifact {
    pub instance: ArtifactInstance,
    pub target: String,
    pub solution: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltSolution {
    pub name: String,
    pub version: Version,
    /// Absent only for results loaded from legacy records.
    pub commit_sha: Option<String>,
}

/// Outcome of pushing a result to its artifact repositories.
///
/// Pushes are not atomic across repositories: targets listed in `pushed`
/// keep what they received even when others failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    /// (target, number of instances pushed)
    pub pushed: Vec<(String, usize)>,
    /// (target, error message)
    pub failed: Vec<(String, String)>,
}

impl PushReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    build_type: BuildResultType,
    world_release_version: Option<Version>,
    artifacts: Vec<ProducedArtifact>,
    solutions: Vec<BuiltSolution>,
    release_notes: Option<String>,
    creation_date: DateTime<Utc>,
}

impl BuildResult {
    /// Collect every artifact published by the solutions built in `outcome`
    /// and bind it to every target accepting it.
    ///
    /// An artifact that no target accepts fails the whole construction.
    pub fn create(
        outcome: &BuildRunOutcome,
        context: &DependentSolutionContext,
        targets: &[Arc<dyn ArtifactRepository>],
    ) -> Result<Self, BuildResultError> {
        let mut artifacts = Vec::new();
        let mut solutions = Vec::new();
        for info in outcome.solutions.iter().filter(|s| s.built) {
            let Some(version) = &info.version else {
                continue;
            };
            let solution = context.find(&info.name).ok_or_else(|| {
                BuildResultError::Invalid(format!("unknown solution {}", info.name))
            })?;
            for (_, artifact) in solution.published_artifacts() {
                let instance = artifact.with_version(version.clone());
                let before = artifacts.len();
                for t in targets.iter().filter(|t| t.accepts(&instance)) {
                    artifacts.push(ProducedArtifact {
                        instance: instance.clone(),
                        target: t.unique_repository_name().to_string(),
                        solution: solution.name.clone(),
                    });
                }
                if artifacts.len() == before {
                    let artifact = instance.to_string();
                    obs::emit_artifact_target_missing(&artifact);
                    return Err(BuildResultError::MissingTarget { artifact });
                }
            }
            solutions.push(BuiltSolution {
                name: info.name.clone(),
                version: version.clone(),
                commit_sha: Some(info.commit_sha.clone()),
            });
        }
        Ok(Self {
            build_type: outcome.build_type,
            world_release_version: outcome.world_release_version.clone(),
            artifacts,
            solutions,
            release_notes: None,
            creation_date: Utc::now(),
        })
    }

    pub fn with_release_notes(mut self, notes: impl Into<String>) -> Self {
        self.release_notes = Some(notes.into());
        self
    }

    pub fn build_type(&self) -> BuildResultType {
        self.build_type
    }

    pub fn world_release_version(&self) -> Option<&Version> {
        self.world_release_version.as_ref()
    }

    pub fn artifacts(&self) -> &[ProducedArtifact] {
        &self.artifacts
    }

    pub fn solutions(&self) -> &[BuiltSolution] {
        &self.solutions
    }

    pub fn release_notes(&self) -> Option<&str> {
        self.release_notes.as_deref()
    }

    pub fn creation_date(&self) -> DateTime<Utc> {
        self.creation_date
    }

    /// Distinct produced instances, in production order.
    pub fn instances(&self) -> Vec<&ArtifactInstance> {
        let mut seen = BTreeSet::new();
        self.artifacts
            .iter()
            .filter(|a| seen.insert(&a.instance))
            .map(|a| &a.instance)
            .collect()
    }

    /// Descriptors registering the produced packages into a package database.
    ///
    /// Dependencies are the producing project's references, moved to the
    /// version built in this result when their producer was built too. Feed
    /// names are `Type:target`. The batch is ordered so that dependencies
    /// precede their dependents.
    pub fn to_package_infos(
        &self,
        context: &DependentSolutionContext,
    ) -> Vec<PackageInstanceInfo> {
        let produced: BTreeMap<&str, &Version> = self
            .solutions
            .iter()
            .map(|s| (s.name.as_str(), &s.version))
            .collect();

        let mut infos: BTreeMap<ArtifactInstance, PackageInstanceInfo> = BTreeMap::new();
        for a in &self.artifacts {
            let info = infos.entry(a.instance.clone()).or_insert_with(|| {
                let mut info = PackageInstanceInfo::new(a.instance.clone());
                if let Some((_, project)) = context.producer_of(a.instance.artifact()) {
                    for r in &project.references {
                        let target = context
                            .producer_of(r.artifact())
                            .and_then(|(s, _)| produced.get(s.name.as_str()))
                            .map(|v| r.with_version((*v).clone()))
                            .unwrap_or_else(|| r.clone());
                        info = info.with_dependency(target, DependencyKind::Transitive);
                    }
                }
                info
            });
            let type_name = a
                .instance
                .artifact()
                .artifact_type()
                .map(|t| t.name())
                .unwrap_or_default();
            info.feed_names.push(format!("{type_name}:{}", a.target));
        }

        dependencies_first(&infos)
            .into_iter()
            .filter_map(|k| infos.remove(&k))
            .collect()
    }

    /// Push every target's share of the produced instances.
    ///
    /// A failing target is reported and the remaining targets are still
    /// pushed; nothing is undone.
    pub async fn push_all(&self, targets: &[Arc<dyn ArtifactRepository>]) -> PushReport {
        let mut report = PushReport::default();
        for t in targets {
            let name = t.unique_repository_name();
            let mut seen = BTreeSet::new();
            let batch: Vec<ArtifactInstance> = self
                .artifacts
                .iter()
                .filter(|a| a.target == name && seen.insert(&a.instance))
                .map(|a| a.instance.clone())
                .collect();
            if batch.is_empty() {
                continue;
            }
            match t.push(&batch).await {
                Ok(()) => {
                    obs::emit_pushed(name, batch.len());
                    report.pushed.push((name.to_string(), batch.len()));
                }
                Err(e) => {
                    obs::emit_push_failed(name, batch.len(), &e);
                    report.failed.push((name.to_string(), e.to_string()));
                }
            }
        }
        report
    }

    /// The current-revision record.
    ///
    /// Fails when a solution has no commit SHA (a result loaded from a
    /// legacy record cannot be re-saved).
    pub fn to_record(&self) -> Result<BuildResultRecord, BuildResultError> {
        let solutions = self
            .solutions
            .iter()
            .map(|s| {
                let commit_sha =
                    s.commit_sha
                        .clone()
                        .ok_or_else(|| BuildResultError::MissingCommitSha {
                            solution: s.name.clone(),
                        })?;
                Ok(SolutionRecord {
                    name: s.name.clone(),
                    version: s.version.to_string(),
                    commit_sha,
                })
            })
            .collect::<Result<Vec<_>, BuildResultError>>()?;
        let artifacts = self
            .artifacts
            .iter()
            .map(|a| ArtifactRecord {
                artifact_type: a
                    .instance
                    .artifact()
                    .artifact_type()
                    .map(|t| t.name().to_string())
                    .unwrap_or_default(),
                name: a.instance.artifact().name().to_string(),
                version: a
                    .instance
                    .version()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
                target: a.target.clone(),
                solution: Some(a.solution.clone()),
            })
            .collect();
        Ok(BuildResultRecord {
            version: CURRENT_RECORD_VERSION,
            build_type: self.build_type,
            creation_date: self.creation_date,
            world_release_version: self.world_release_version.as_ref().map(ToString::to_string),
            artifacts,
            solutions,
            release_notes: self.release_notes.clone(),
        })
    }

    /// Rebuild a result from a record of any supported revision.
    pub fn from_record(
        record: BuildResultRecord,
        registry: &ArtifactTypeRegistry,
    ) -> Result<Self, BuildResultError> {
        if record.version > CURRENT_RECORD_VERSION {
            return Err(BuildResultError::UnsupportedVersion(record.version));
        }
        let world_release_version = record
            .world_release_version
            .as_deref()
            .map(|v| parse_version(v, "world release version"))
            .transpose()?;

        let mut artifacts = Vec::with_capacity(record.artifacts.len());
        for a in &record.artifacts {
            let text = format!("{}:{}/{}", a.artifact_type, a.name, a.version);
            let instance = ArtifactInstance::try_parse(registry, &text);
            if !instance.is_valid() {
                return Err(BuildResultError::Invalid(format!("invalid artifact '{text}'")));
            }
            artifacts.push(ProducedArtifact {
                instance,
                target: a.target.clone(),
                solution: a.solution.clone().unwrap_or_default(),
            });
        }

        let solutions = if record.version == 0 {
            legacy_solutions(&record.artifacts, &artifacts)?
        } else {
            record
                .solutions
                .iter()
                .map(|s| {
                    Ok(BuiltSolution {
                        name: s.name.clone(),
                        version: parse_version(&s.version, &s.name)?,
                        commit_sha: Some(s.commit_sha.clone()),
                    })
                })
                .collect::<Result<Vec<_>, BuildResultError>>()?
        };

        Ok(Self {
            build_type: record.build_type,
            world_release_version,
            artifacts,
            solutions,
            release_notes: record.release_notes,
            creation_date: record.creation_date,
        })
    }
}

/// Keys of `infos`, each after the in-batch targets of its dependencies.
fn dependencies_first(
    infos: &BTreeMap<ArtifactInstance, PackageInstanceInfo>,
) -> Vec<ArtifactInstance> {
    let mut ordered = Vec::with_capacity(infos.len());
    let mut visited: BTreeSet<&ArtifactInstance> = BTreeSet::new();
    for root in infos.keys() {
        if !visited.insert(root) {
            continue;
        }
        // (key, index of the next dependency to look at)
        let mut stack = vec![(root, 0usize)];
        while let Some(top) = stack.last_mut() {
            let (key, next) = *top;
            top.1 += 1;
            let dependencies = infos
                .get(key)
                .map(|info| info.dependencies.as_slice())
                .unwrap_or_default();
            match dependencies.get(next) {
                Some(d) => {
                    if let Some((target, _)) = infos.get_key_value(&d.target) {
                        if visited.insert(target) {
                            stack.push((target, 0));
                        }
                    }
                }
                None => {
                    ordered.push(key.clone());
                    stack.pop();
                }
            }
        }
    }
    ordered
}

fn parse_version(text: &str, what: &str) -> Result<Version, BuildResultError> {
    Version::parse(text)
        .map_err(|e| BuildResultError::Invalid(format!("bad version '{text}' for {what}: {e}")))
}

/// Solutions of a revision-0 record, one per distinct producing solution in
/// order of first appearance.
fn legacy_solutions(
    records: &[ArtifactRecord],
    artifacts: &[ProducedArtifact],
) -> Result<Vec<BuiltSolution>, BuildResultError> {
    let mut solutions: Vec<BuiltSolution> = Vec::new();
    for (r, a) in records.iter().zip(artifacts) {
        let Some(name) = &r.solution else {
            return Err(BuildResultError::Invalid(format!(
                "legacy artifact {} does not name its solution",
                a.instance
            )));
        };
        if solutions.iter().any(|s| &s.name == name) {
            continue;
        }
        let version = a
            .instance
            .version()
            .cloned()
            .ok_or_else(|| {
                BuildResultError::Invalid(format!("artifact {} has no version", a.instance))
            })?;
        solutions.push(BuiltSolution {
            name: name.clone(),
            version,
            commit_sha: None,
        });
    }
    Ok(solutions)
}

/// On-disk JSON shape of a [`BuildResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResultRecord {
    /// Format revision, `0` or `1`.
    #[serde(default)]
    pub version: u32,
    #[serde(rename = "type")]
    pub build_type: BuildResultType,
    pub creation_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_release_version: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub solutions: Vec<SolutionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub name: String,
    pub version: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolutionRecord {
    pub name: String,
    pub version: String,
    pub commit_sha: String,
}

/// A build result stored as pretty-printed JSON.
#[derive(Debug, Clone)]
pub struct BuildResultFile {
    path: PathBuf,
}

impl BuildResultFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the current-revision record (temp file + rename).
    pub async fn save(&self, result: &BuildResult) -> Result<(), BuildResultError> {
        let record = result.to_record()?;
        let bytes = serde_json::to_vec_pretty(&record)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut temp = self.path.as_os_str().to_owned();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        tokio::fs::write(&temp, &bytes).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        tracing::info!(
            event = "result.saved",
            path = %self.path.display(),
            solutions = record.solutions.len(),
            artifacts = record.artifacts.len(),
        );
        Ok(())
    }

    pub async fn load_record(&self) -> Result<BuildResultRecord, BuildResultError> {
        let bytes = tokio::fs::read(&self.path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn load(
        &self,
        registry: &ArtifactTypeRegistry,
    ) -> Result<BuildResult, BuildResultError> {
        BuildResult::from_record(self.load_record().await?, registry)
    }
}
