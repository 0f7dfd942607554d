//! End-to-end world builds over in-memory repositories.
//!
//! Every scenario drives `BuildOrchestrator` with `MemoryRepositoryDriver`
//! fakes and checks what ended up committed, built, reset and pushed.

use std::collections::BTreeMap;
use std::sync::Arc;

use artifact_db::{Artifact, ArtifactInstance, ArtifactTypeRegistry, PackageDb, Version};
use worldbuild_core::fakes::{DriverCall, MemoryArtifactRepository, MemoryRepositoryDriver};
use worldbuild_core::{
    ArtifactRepository, BuildOrchestrator, BuildResult, BuildResultFile, BuildResultType,
    CiBuildStrategy, DependentSolutionContext, OrchestratorConfig, ProjectSpec,
    ReleaseBuildStrategy, SolutionSpec, WorldBuildError,
};

fn registry() -> ArtifactTypeRegistry {
    let r = ArtifactTypeRegistry::new();
    r.register("NuGet", true, None).unwrap();
    r
}

fn library(r: &ArtifactTypeRegistry, name: &str, references: &[&str]) -> SolutionSpec {
    let artifact = Artifact::try_parse(r, &format!("NuGet:{name}"));
    let mut project = ProjectSpec::new(name).generates(artifact);
    for reference in references {
        project = project.references(ArtifactInstance::try_parse(r, reference));
    }
    SolutionSpec::new(name, format!("org/{}", name.to_lowercase())).with_project(project)
}

/// A <- B <- C, each referencing an outdated version of the previous one.
fn chain(r: &ArtifactTypeRegistry) -> DependentSolutionContext {
    DependentSolutionContext::build(vec![
        library(r, "C", &["NuGet:B/0.9.0"]),
        library(r, "A", &[]),
        library(r, "B", &["NuGet:A/0.9.0"]),
    ])
    .unwrap()
}

/// Base <- A <- B <- C: unlike [`chain`], A has an upstream and commits too.
fn rooted_chain(r: &ArtifactTypeRegistry) -> DependentSolutionContext {
    DependentSolutionContext::build(vec![
        library(r, "C", &["NuGet:B/0.9.0"]),
        library(r, "B", &["NuGet:A/0.9.0"]),
        library(r, "A", &["NuGet:Base/0.9.0"]),
        library(r, "Base", &[]),
    ])
    .unwrap()
}

/// Core, and App whose only project is a build project referencing Core.
fn build_project_world(r: &ArtifactTypeRegistry) -> DependentSolutionContext {
    DependentSolutionContext::build(vec![
        library(r, "Core", &[]),
        SolutionSpec::new("App", "org/app").with_project(
            ProjectSpec::new("CodeCakeBuilder")
                .build_project()
                .references(ArtifactInstance::try_parse(r, "NuGet:Core/0.1.0")),
        ),
    ])
    .unwrap()
}

fn driver(repository: &str, base: Version) -> Arc<MemoryRepositoryDriver> {
    Arc::new(MemoryRepositoryDriver::new(repository).with_version_scheme(base))
}

#[tokio::test]
async fn test_failure_resets_only_solutions_ranked_after_it() {
    let r = registry();
    let base = driver("org/base", Version::new(1, 0, 0));
    let a = driver("org/a", Version::new(1, 0, 0));
    let b = Arc::new(
        MemoryRepositoryDriver::new("org/b")
            .with_version_scheme(Version::new(1, 0, 0))
            .with_failing_build(),
    );
    let c = driver("org/c", Version::new(1, 0, 0));

    let err = BuildOrchestrator::new(Arc::new(rooted_chain(&r)), Arc::new(CiBuildStrategy))
        .with_driver("Base", base.clone())
        .with_driver("A", a.clone())
        .with_driver("B", b.clone())
        .with_driver("C", c.clone())
        .run()
        .await
        .unwrap_err();

    match &err {
        WorldBuildError::BuildFailed {
            solution,
            rolled_back,
            ..
        } => {
            assert_eq!(solution, "B");
            assert_eq!(rolled_back.len(), 1);
            assert_eq!(rolled_back[0].solution, "C");
            assert_eq!(rolled_back[0].commit_sha, "org/c@0");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(err.root_cause(), WorldBuildError::StepFailed { .. }));

    // A committed and built before B failed: its commit survives.
    assert_eq!(a.head(), "org/a@1");
    assert_eq!(a.reference("A", "NuGet:Base"), Some(Version::new(1, 0, 0)));
    assert_eq!(a.builds(), vec![Version::new(1, 0, 1)]);
    assert!(a.resets().is_empty());
    // B keeps its upgrade commit; C is back where it started.
    assert_eq!(b.head(), "org/b@1");
    assert!(b.resets().is_empty());
    assert_eq!(c.head(), "org/c@0");
    assert_eq!(c.resets(), vec!["org/c@0".to_string()]);
    assert!(c.builds().is_empty());
    assert!(base.resets().is_empty());
}

#[tokio::test]
async fn test_chain_upgrades_propagate_versions_downstream() {
    let r = registry();
    let a = driver("org/a", Version::new(1, 0, 0));
    let b = driver("org/b", Version::new(2, 0, 0));
    let c = driver("org/c", Version::new(3, 0, 0));

    let outcome = BuildOrchestrator::new(Arc::new(chain(&r)), Arc::new(CiBuildStrategy))
        .with_driver("A", a.clone())
        .with_driver("B", b.clone())
        .with_driver("C", c.clone())
        .run()
        .await
        .unwrap();

    let names: Vec<&str> = outcome.solutions.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["A", "B", "C"]);
    // A has nothing to upgrade and is skipped; B and C commit and build.
    assert!(!outcome.solutions[0].built);
    assert_eq!(b.reference("B", "NuGet:A"), Some(Version::new(1, 0, 0)));
    assert_eq!(c.reference("C", "NuGet:B"), Some(Version::new(2, 0, 1)));
    assert_eq!(b.builds(), vec![Version::new(2, 0, 1)]);
    assert_eq!(c.builds(), vec![Version::new(3, 0, 1)]);
    assert_eq!(outcome.built().count(), 2);
}

#[tokio::test]
async fn test_build_project_commit_forces_a_retry_on_the_new_commit() {
    let r = registry();
    let core = driver("org/core", Version::new(1, 0, 0));
    let app = driver("org/app", Version::new(2, 0, 0));

    let world = Arc::new(build_project_world(&r));
    let outcome = BuildOrchestrator::new(world, Arc::new(CiBuildStrategy))
        .with_driver("Core", core.clone())
        .with_driver("App", app.clone())
        .run()
        .await
        .unwrap();

    let info = &outcome.solutions[1];
    assert!(info.built);
    assert_eq!(info.commit_sha, "org/app@1");
    assert_eq!(info.version, Some(Version::new(2, 0, 1)));
    assert_eq!(app.builds(), vec![Version::new(2, 0, 1)]);
    let build_upgrades = app
        .calls()
        .iter()
        .filter(|c| matches!(c, DriverCall::UpdateBuildProjectDependencies { .. }))
        .count();
    assert_eq!(build_upgrades, 2);
    assert_eq!(
        app.reference("CodeCakeBuilder", "NuGet:Core"),
        Some(Version::new(1, 0, 0))
    );
}

/// Tool <- Core (build project on Tool) <- App.
fn build_project_upstream_world(
    r: &ArtifactTypeRegistry,
    app_pin: &str,
) -> DependentSolutionContext {
    DependentSolutionContext::build(vec![
        library(r, "Tool", &[]),
        SolutionSpec::new("Core", "org/core")
            .with_project(ProjectSpec::new("Core").generates(Artifact::try_parse(r, "NuGet:Core")))
            .with_project(
                ProjectSpec::new("CodeCakeBuilder")
                    .build_project()
                    .references(ArtifactInstance::try_parse(r, "NuGet:Tool/0.1.0")),
            ),
        library(r, "App", &[app_pin]),
    ])
    .unwrap()
}

#[tokio::test]
async fn test_downstream_references_the_version_upstream_was_built_at() {
    let r = registry();
    let tool = driver("org/tool", Version::new(1, 0, 0));
    let core = driver("org/core", Version::new(2, 0, 0));
    let app = driver("org/app", Version::new(3, 0, 0));
    let world = Arc::new(build_project_upstream_world(&r, "NuGet:Core/0.1.0"));
    let orchestrator = BuildOrchestrator::new(world, Arc::new(CiBuildStrategy))
        .with_driver("Tool", tool)
        .with_driver("Core", core.clone())
        .with_driver("App", app.clone());

    let prepared = orchestrator.prepare().await.unwrap();
    // Prepare upgraded App to the Core version read before its build-project commit.
    assert_eq!(prepared.solutions()[1].state.version, Some(Version::new(2, 0, 0)));
    assert_eq!(app.reference("App", "NuGet:Core"), Some(Version::new(2, 0, 0)));

    let outcome = orchestrator.build(prepared).await.unwrap();

    assert_eq!(core.builds(), vec![Version::new(2, 0, 1)]);
    assert_eq!(outcome.solutions[1].version, Some(Version::new(2, 0, 1)));
    assert_eq!(app.reference("App", "NuGet:Core"), Some(Version::new(2, 0, 1)));
    let app_info = &outcome.solutions[2];
    assert!(app_info.built);
    assert_eq!(app_info.commit_sha, "org/app@2");
    assert_eq!(app.head(), "org/app@2");
    assert_eq!(app_info.version, Some(Version::new(3, 0, 2)));
    assert_eq!(app.builds(), vec![Version::new(3, 0, 2)]);
}

#[tokio::test]
async fn test_solution_skipped_in_prepare_is_built_when_upstream_version_moves() {
    let r = registry();
    let tool = driver("org/tool", Version::new(1, 0, 0));
    let core = driver("org/core", Version::new(2, 0, 0));
    let app = driver("org/app", Version::new(3, 0, 0));
    let world = Arc::new(build_project_upstream_world(&r, "NuGet:Core/2.0.0"));
    let orchestrator = BuildOrchestrator::new(world, Arc::new(CiBuildStrategy))
        .with_driver("Tool", tool)
        .with_driver("Core", core)
        .with_driver("App", app.clone());

    let prepared = orchestrator.prepare().await.unwrap();
    assert!(!prepared.solutions()[2].must_build);

    let outcome = orchestrator.build(prepared).await.unwrap();

    let app_info = &outcome.solutions[2];
    assert!(app_info.built);
    assert_eq!(app_info.commit_sha, "org/app@1");
    assert_eq!(app.reference("App", "NuGet:Core"), Some(Version::new(2, 0, 1)));
    assert_eq!(app.builds(), vec![Version::new(3, 0, 1)]);
}

#[tokio::test]
async fn test_retry_budget_is_bounded() {
    let r = registry();
    let core = driver("org/core", Version::new(1, 0, 0));
    let app = driver("org/app", Version::new(2, 0, 0));

    let err = BuildOrchestrator::new(Arc::new(build_project_world(&r)), Arc::new(CiBuildStrategy))
        .with_config(OrchestratorConfig {
            max_retries: 0,
            dry_run: false,
        })
        .with_driver("Core", core)
        .with_driver("App", app.clone())
        .run()
        .await
        .unwrap_err();

    match err.root_cause() {
        WorldBuildError::RetriesExhausted { solution, attempts } => {
            assert_eq!(solution, "App");
            assert_eq!(*attempts, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.rolled_back().is_empty());
    assert!(app.builds().is_empty());
}

#[tokio::test]
async fn test_head_moved_between_prepare_and_build_is_rejected() {
    let r = registry();
    let core = driver("org/core", Version::new(1, 0, 0));
    let app = driver("org/app", Version::new(2, 0, 0));
    let orchestrator =
        BuildOrchestrator::new(Arc::new(build_project_world(&r)), Arc::new(CiBuildStrategy))
            .with_driver("Core", core)
            .with_driver("App", app.clone());

    let prepared = orchestrator.prepare().await.unwrap();
    assert!(prepared.solutions()[1].must_build);
    assert_eq!(prepared.solutions()[1].build_upgrades().len(), 1);
    let moved = app.simulate_external_commit();

    let err = orchestrator.build(prepared).await.unwrap_err();

    match err.root_cause() {
        WorldBuildError::HeadMoved {
            solution,
            expected,
            found,
        } => {
            assert_eq!(solution, "App");
            assert_eq!(expected, "org/app@0");
            assert_eq!(found, &moved);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(app.builds().is_empty());
}

#[tokio::test]
async fn test_ci_skips_solutions_already_up_to_date() {
    let r = registry();
    let ctx = DependentSolutionContext::build(vec![
        library(&r, "A", &[]),
        library(&r, "B", &["NuGet:A/1.0.0"]),
    ])
    .unwrap();
    let a = driver("org/a", Version::new(1, 0, 0));
    let b = driver("org/b", Version::new(5, 0, 0));

    let outcome = BuildOrchestrator::new(Arc::new(ctx), Arc::new(CiBuildStrategy))
        .with_driver("A", a.clone())
        .with_driver("B", b.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.built().count(), 0);
    assert_eq!(outcome.solutions[0].version, Some(Version::new(1, 0, 0)));
    assert_eq!(outcome.solutions[1].commit_sha, "org/b@0");
    assert_eq!(a.head(), "org/a@0");
    assert_eq!(b.head(), "org/b@0");
    assert!(a.builds().is_empty() && b.builds().is_empty());
}

#[tokio::test]
async fn test_dry_run_commits_but_never_builds() {
    let r = registry();
    let a = driver("org/a", Version::new(1, 0, 0));
    let b = driver("org/b", Version::new(1, 0, 0));
    let c = driver("org/c", Version::new(1, 0, 0));

    let outcome = BuildOrchestrator::new(Arc::new(chain(&r)), Arc::new(CiBuildStrategy))
        .with_config(OrchestratorConfig {
            max_retries: 3,
            dry_run: true,
        })
        .with_driver("A", a)
        .with_driver("B", b.clone())
        .with_driver("C", c.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.built().count(), 2);
    assert_eq!(b.head(), "org/b@1");
    assert!(b.builds().is_empty() && c.builds().is_empty());
}

#[tokio::test]
async fn test_prepare_commit_failure_stops_before_later_solutions() {
    let r = registry();
    let a = driver("org/a", Version::new(1, 0, 0));
    let b = Arc::new(
        MemoryRepositoryDriver::new("org/b")
            .with_version_scheme(Version::new(1, 0, 0))
            .with_failing_commit(),
    );
    let c = driver("org/c", Version::new(1, 0, 0));

    let err = BuildOrchestrator::new(Arc::new(chain(&r)), Arc::new(CiBuildStrategy))
        .with_driver("A", a)
        .with_driver("B", b)
        .with_driver("C", c.clone())
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err.root_cause(), WorldBuildError::CommitFailed { .. }));
    assert!(err.rolled_back().is_empty());
    assert!(c.calls().is_empty());
}

#[tokio::test]
async fn test_release_run_registers_and_pushes_what_it_built() {
    let r = registry();
    let ctx = Arc::new(
        DependentSolutionContext::build(vec![
            library(&r, "App", &["NuGet:Core/0.9.0"]),
            library(&r, "Core", &[]),
        ])
        .unwrap(),
    );
    let roadmap = BTreeMap::from([
        ("Core".to_string(), Version::new(1, 0, 0)),
        ("App".to_string(), Version::new(2, 0, 0)),
    ]);
    let strategy =
        ReleaseBuildStrategy::new(roadmap).with_world_release_version(Version::new(10, 0, 0));
    let core = Arc::new(MemoryRepositoryDriver::new("org/core"));
    let app = Arc::new(MemoryRepositoryDriver::new("org/app"));

    let outcome = BuildOrchestrator::new(ctx.clone(), Arc::new(strategy))
        .with_driver("Core", core.clone())
        .with_driver("App", app.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.build_type, BuildResultType::Release);
    assert_eq!(outcome.world_release_version, Some(Version::new(10, 0, 0)));
    assert_eq!(core.builds(), vec![Version::new(1, 0, 0)]);
    assert_eq!(app.builds(), vec![Version::new(2, 0, 0)]);
    assert!(app.calls().iter().any(|c| matches!(
        c,
        DriverCall::Commit { message } if message == "Release App v2.0.0."
    )));

    let feed = Arc::new(MemoryArtifactRepository::new("nuget-public", ["NuGet"]));
    let targets: Vec<Arc<dyn ArtifactRepository>> = vec![feed.clone()];
    let result = BuildResult::create(&outcome, &ctx, &targets)
        .unwrap()
        .with_release_notes("World 10.0.0");
    assert_eq!(result.solutions().len(), 2);
    assert_eq!(result.solutions()[1].commit_sha.as_deref(), Some("org/app@1"));

    let db = PackageDb::empty()
        .add(&r, &result.to_package_infos(&ctx), false)
        .unwrap();
    let app_key = ArtifactInstance::try_parse(&r, "NuGet:App/2.0.0");
    let app_pkg = db.find(&app_key).unwrap();
    assert_eq!(
        app_pkg.dependencies()[0].target().key().to_string(),
        "NuGet:Core/1.0.0"
    );
    assert!(db.find_feed(&r, "NuGet:nuget-public").is_some());

    let report = result.push_all(&targets).await;
    assert!(report.is_complete());
    assert_eq!(feed.pushed().len(), 2);

    let dir = tempfile::tempdir().unwrap();
    let file = BuildResultFile::new(dir.path().join("release.json"));
    file.save(&result).await.unwrap();
    assert_eq!(file.load(&r).await.unwrap(), result);
}

#[test]
fn test_reference_cycle_is_rejected() {
    let r = registry();
    let err = DependentSolutionContext::build(vec![
        library(&r, "A", &["NuGet:B/1.0.0"]),
        library(&r, "B", &["NuGet:A/1.0.0"]),
    ])
    .unwrap_err();

    match err {
        WorldBuildError::DependencyCycle { solutions } => {
            assert_eq!(solutions, vec!["A".to_string(), "B".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
}
