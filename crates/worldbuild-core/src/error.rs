//! Error types for solution planning, build orchestration and build results.

use artifact_db::{PackageDbError, RegistryError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A repository whose branch was reset while unwinding a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackEntry {
    pub solution: String,
    pub repository: String,
    pub commit_sha: String,
}

/// Errors produced by the orchestration layer.
#[derive(Debug, Error)]
pub enum WorldBuildError {
    /// Two or more solutions depend on each other.
    #[error("dependency cycle detected between solutions: {solutions:?}")]
    DependencyCycle { solutions: Vec<String> },

    /// The same artifact is generated by two projects.
    #[error("artifact {artifact} is generated by both {first} and {second}")]
    AmbiguousProducer {
        artifact: String,
        first: String,
        second: String,
    },

    #[error("solution declared twice: {name}")]
    DuplicateSolution { name: String },

    #[error("solution not found: {name}")]
    SolutionNotFound { name: String },

    #[error("no repository driver registered for solution {solution}")]
    MissingDriver { solution: String },

    /// An artifact string in a manifest could not be parsed.
    #[error("invalid artifact '{value}' in {solution}/{project}")]
    InvalidArtifact {
        solution: String,
        project: String,
        value: String,
    },

    #[error("no version available for solution {solution}")]
    MissingVersion { solution: String },

    /// The repository HEAD changed between Prepare and Build.
    #[error("HEAD of {solution} moved from {expected} to {found} since it was prepared")]
    HeadMoved {
        solution: String,
        expected: String,
        found: String,
    },

    #[error("commit failed in {solution}: {reason}")]
    CommitFailed { solution: String, reason: String },

    #[error("build of {solution} failed: {reason}")]
    StepFailed { solution: String, reason: String },

    #[error("build of {solution} still required a retry after {attempts} attempts")]
    RetriesExhausted { solution: String, attempts: u32 },

    /// A run aborted on `solution`; later-ranked repositories listed in
    /// `rolled_back` were reset to their pre-run commit.
    #[error("run failed on {solution}: {cause} (rolled back {} repositories)", .rolled_back.len())]
    BuildFailed {
        solution: String,
        #[source]
        cause: Box<WorldBuildError>,
        rolled_back: Vec<RollbackEntry>,
    },

    /// Failure reported by a repository driver implementation.
    #[error("repository driver error for {solution}: {detail}")]
    Driver { solution: String, detail: String },

    /// Failure reported by an artifact repository implementation.
    #[error("artifact repository {repository} failed: {detail}")]
    ArtifactRepository { repository: String, detail: String },

    #[error("manifest {path}: {detail}")]
    Manifest { path: String, detail: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    PackageDb(#[from] PackageDbError),

    #[error(transparent)]
    BuildResult(#[from] BuildResultError),
}

impl WorldBuildError {
    /// The error at the root of a [`WorldBuildError::BuildFailed`] chain.
    pub fn root_cause(&self) -> &WorldBuildError {
        match self {
            WorldBuildError::BuildFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// Repositories reset while unwinding, empty for any other error.
    pub fn rolled_back(&self) -> &[RollbackEntry] {
        match self {
            WorldBuildError::BuildFailed { rolled_back, .. } => rolled_back,
            _ => &[],
        }
    }
}

/// Convenience result alias.
pub type WorldBuildResult<T> = std::result::Result<T, WorldBuildError>;

/// Errors produced while assembling, saving or loading a build result.
#[derive(Debug, Error)]
pub enum BuildResultError {
    /// A produced artifact has no artifact repository accepting it.
    #[error("no artifact repository accepts {artifact}")]
    MissingTarget { artifact: String },

    #[error("solution {solution} has no commit SHA and cannot be written")]
    MissingCommitSha { solution: String },

    #[error("unsupported build result record version {0}")]
    UnsupportedVersion(u32),

    #[error("invalid build result record: {0}")]
    Invalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_cycle_error_displays_solution_names() {
        let err = WorldBuildError::DependencyCycle {
            solutions: vec!["CK-Core".to_string(), "CK-Text".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("CK-Core"));
        assert!(msg.contains("CK-Text"));
    }

    #[test]
    fn test_build_failed_exposes_root_cause_and_rollbacks() {
        let err = WorldBuildError::BuildFailed {
            solution: "B".to_string(),
            cause: Box::new(WorldBuildError::HeadMoved {
                solution: "B".to_string(),
                expected: "b1".to_string(),
                found: "b2".to_string(),
            }),
            rolled_back: vec![RollbackEntry {
                solution: "C".to_string(),
                repository: "org/c".to_string(),
                commit_sha: "c0".to_string(),
            }],
        };
        assert!(matches!(err.root_cause(), WorldBuildError::HeadMoved { .. }));
        assert_eq!(err.rolled_back().len(), 1);
        let msg = err.to_string();
        assert!(msg.contains("b2"));
        assert!(msg.contains("rolled back 1"));
    }

    #[test]
    fn test_missing_target_displays_artifact() {
        let err = BuildResultError::MissingTarget {
            artifact: "NuGet:CK.Core/1.0.0".to_string(),
        };
        assert!(err.to_string().contains("NuGet:CK.Core/1.0.0"));
    }
}
