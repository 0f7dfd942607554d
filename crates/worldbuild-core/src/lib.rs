//! WorldBuild Core Library
//!
//! Dependency-ordered builds over a world of repositories:
//! - [`context::DependentSolutionContext`] - solutions ranked by cross-repository
//!   package references
//! - [`orchestrator::BuildOrchestrator`] - Prepare/Build state machine with retry and rollback
//! - [`strategy::CiBuildStrategy`] / [`strategy::ReleaseBuildStrategy`] - how versions are decided
//! - [`build_result::BuildResult`] - what a run produced, pushed and persisted
//! - [`manifest::WorldManifest`] - JSON world description
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use worldbuild_core::{BuildOrchestrator, CiBuildStrategy, WorldManifest};
//!
//! let registry = artifact_db::ArtifactTypeRegistry::new();
//! let context = WorldManifest::load("world.json")?.build_context(&registry)?;
//! let outcome = BuildOrchestrator::new(Arc::new(context), Arc::new(CiBuildStrategy))
//!     .with_driver("CK-Core", core_driver)
//!     .run()
//!     .await?;
//! ```

pub mod build_result;
pub mod context;
pub mod driver;
pub mod error;
pub mod fakes;
pub mod manifest;
pub mod obs;
pub mod orchestrator;
pub mod strategy;
pub mod telemetry;

pub use build_result::{
    ArtifactRecord, BuildResult, BuildResultFile, BuildResultRecord, BuildResultType,
    BuiltSolution, ProducedArtifact, PushReport, SolutionRecord, CURRENT_RECORD_VERSION,
};
pub use context::{
    DependentSolution, DependentSolutionContext, LocalPackageDependency, PackageUpgrade,
    ProjectSpec, SolutionSpec,
};
pub use driver::{ArtifactRepository, RepositoryDriver};
pub use error::{BuildResultError, RollbackEntry, WorldBuildError, WorldBuildResult};
pub use manifest::{
    ArtifactTypeDecl, ProjectManifest, SavorContextDecl, SolutionManifest, TargetManifest,
    WorldManifest,
};
pub use orchestrator::{
    BuildOrchestrator, BuildRunOutcome, OrchestratorConfig, PreparedRun, PreparedSolution,
    SolutionBuildInfo, StepOutcome,
};
pub use strategy::{BuildStrategy, CiBuildStrategy, PreparedState, ReleaseBuildStrategy};
