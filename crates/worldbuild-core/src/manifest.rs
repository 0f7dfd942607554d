//! World manifest: the JSON document declaring artifact types, solutions and
//! artifact targets.
//!
//! ```json
//! {
//!   "name": "CK",
//!   "artifactTypes": [
//!     { "name": "NuGet",
//!       "savors": { "name": "frameworks", "separator": ";", "values": ["net8.0"] } },
//!     { "name": "NPM" }
//!   ],
//!   "solutions": [
//!     { "name": "CK-Core", "repository": "org/ck-core",
//!       "projects": [ { "name": "CK.Core", "generates": ["NuGet:CK.Core"] } ] }
//!   ],
//!   "targets": [ { "name": "nuget-public", "accepts": ["NuGet"] } ]
//! }
//! ```

use std::path::Path;

use artifact_db::{Artifact, ArtifactInstance, ArtifactTypeRegistry, SavorContext};
use serde::{Deserialize, Serialize};

use crate::context::{DependentSolutionContext, ProjectSpec, SolutionSpec};
use crate::error::{WorldBuildError, WorldBuildResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldManifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub artifact_types: Vec<ArtifactTypeDecl>,
    #[serde(default)]
    pub solutions: Vec<SolutionManifest>,
    #[serde(default)]
    pub targets: Vec<TargetManifest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactTypeDecl {
    pub name: String,
    #[serde(default = "default_installable")]
    pub installable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub savors: Option<SavorContextDecl>,
}

fn default_installable() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavorContextDecl {
    pub name: String,
    pub separator: char,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolutionManifest {
    pub name: String,
    pub repository: String,
    #[serde(default)]
    pub projects: Vec<ProjectManifest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectManifest {
    pub name: String,
    /// `Type:Name` of every produced artifact.
    #[serde(default)]
    pub generates: Vec<String>,
    /// `Type:Name/Version` of every pinned package reference.
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default)]
    pub build_project: bool,
}

/// An artifact repository and the artifact types it accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetManifest {
    pub name: String,
    #[serde(default)]
    pub accepts: Vec<String>,
}

impl TargetManifest {
    pub fn accepts(&self, artifact: &Artifact) -> bool {
        artifact
            .artifact_type()
            .is_some_and(|t| self.accepts.iter().any(|a| a == t.name()))
    }
}

impl WorldManifest {
    /// Targets accepting `artifact`, in declaration order.
    pub fn targets_for(&self, artifact: &Artifact) -> Vec<&TargetManifest> {
        self.targets.iter().filter(|t| t.accepts(artifact)).collect()
    }

    pub fn load(path: impl AsRef<Path>) -> WorldBuildResult<Self> {
        let path = path.as_ref();
        let manifest_error = |detail: String| WorldBuildError::Manifest {
            path: path.display().to_string(),
            detail,
        };
        let text = std::fs::read_to_string(path).map_err(|e| manifest_error(e.to_string()))?;
        Self::from_json(&text).map_err(|e| match e {
            WorldBuildError::Manifest { detail, .. } => manifest_error(detail),
            other => other,
        })
    }

    pub fn from_json(text: &str) -> WorldBuildResult<Self> {
        serde_json::from_str(text).map_err(|e| WorldBuildError::Manifest {
            path: "<inline>".to_string(),
            detail: e.to_string(),
        })
    }

    /// Register every declared artifact type.
    pub fn register_types(&self, registry: &ArtifactTypeRegistry) -> WorldBuildResult<()> {
        for t in &self.artifact_types {
            let savors = t
                .savors
                .as_ref()
                .map(|s| SavorContext::new(s.name.clone(), s.separator, s.values.iter().cloned()));
            registry.register(&t.name, t.installable, savors)?;
        }
        Ok(())
    }

    /// Typed solution specs; artifact types must already be registered.
    pub fn solution_specs(
        &self,
        registry: &ArtifactTypeRegistry,
    ) -> WorldBuildResult<Vec<SolutionSpec>> {
        self.solutions
            .iter()
            .map(|s| {
                let projects = s
                    .projects
                    .iter()
                    .map(|p| project_spec(registry, s, p))
                    .collect::<WorldBuildResult<Vec<_>>>()?;
                Ok(SolutionSpec {
                    name: s.name.clone(),
                    repository: s.repository.clone(),
                    projects,
                })
            })
            .collect()
    }

    /// Register the types and rank the solutions.
    pub fn build_context(
        &self,
        registry: &ArtifactTypeRegistry,
    ) -> WorldBuildResult<DependentSolutionContext> {
        self.register_types(registry)?;
        DependentSolutionContext::build(self.solution_specs(registry)?)
    }
}

fn project_spec(
    registry: &ArtifactTypeRegistry,
    solution: &SolutionManifest,
    project: &ProjectManifest,
) -> WorldBuildResult<ProjectSpec> {
    let invalid = |value: &str| WorldBuildError::InvalidArtifact {
        solution: solution.name.clone(),
        project: project.name.clone(),
        value: value.to_string(),
    };
    let generated = project
        .generates
        .iter()
        .map(|g| {
            let a = Artifact::try_parse(registry, g);
            if a.is_valid() {
                Ok(a)
            } else {
                Err(invalid(g))
            }
        })
        .collect::<WorldBuildResult<Vec<_>>>()?;
    let references = project
        .references
        .iter()
        .map(|r| {
            let i = ArtifactInstance::try_parse(registry, r);
            if i.is_valid() {
                Ok(i)
            } else {
                Err(invalid(r))
            }
        })
        .collect::<WorldBuildResult<Vec<_>>>()?;
    Ok(ProjectSpec {
        name: project.name.clone(),
        generated,
        references,
        is_build_project: project.build_project,
    })
}
