//! WorldBuild CLI
//!
//! The `worldbuild` command inspects and feeds the package database and
//! explains how a world of repositories will be built.
//!
//! ## Commands
//!
//! - `db init|add|show|feeds`: package database maintenance
//! - `plan`: solutions by rank with their cross-solution dependencies and
//!   the targets each published artifact goes to
//! - `result show`: summary of a stored build result

use anyhow::{bail, Context, Result};
use artifact_db::{
    Artifact, ArtifactTypeRegistry, PackageDb, PackageDbFile, PackageDescriptor,
    PackageInstanceInfo,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};

use worldbuild_core::{BuildResult, BuildResultFile, DependentSolutionContext, WorldManifest};

/// Directory holding local WorldBuild state.
const HOME_ENV: &str = "WORLDBUILD_HOME";
const DEFAULT_HOME: &str = ".worldbuild";

#[derive(Parser)]
#[command(name = "worldbuild")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Dependency-ordered builds over a world of repositories", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Package database file (default: $WORLDBUILD_HOME/packages.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Package database operations
    Db {
        #[command(subcommand)]
        action: DbAction,
    },

    /// Print solutions by rank with their cross-solution dependencies
    Plan {
        /// World manifest (JSON)
        #[arg(short, long)]
        manifest: PathBuf,
    },

    /// Build result operations
    Result {
        #[command(subcommand)]
        action: ResultAction,
    },
}

#[derive(Subcommand)]
enum DbAction {
    /// Create an empty package database
    Init {
        /// Overwrite an existing database
        #[arg(long)]
        force: bool,
    },

    /// Register a batch of package descriptors (JSON array)
    Add {
        /// Descriptor file
        infos: PathBuf,

        /// World manifest declaring the artifact types
        #[arg(short, long)]
        manifest: PathBuf,

        /// Ignore packages that are already registered
        #[arg(long)]
        skip_existing: bool,
    },

    /// List package instances
    Show {
        /// Only instances of this artifact type
        #[arg(long = "type")]
        artifact_type: Option<String>,

        /// Only instances of this artifact (Type:Name), latest first
        #[arg(long)]
        artifact: Option<String>,

        /// Print JSON instead of text
        #[arg(long)]
        json_output: bool,
    },

    /// List feeds with their member counts
    Feeds,
}

#[derive(Subcommand)]
enum ResultAction {
    /// Print a build result summary
    Show {
        /// Build result file (JSON)
        file: PathBuf,

        /// World manifest; when given, artifacts are checked against its types
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    worldbuild_core::telemetry::init_tracing(cli.json, level);

    let db_path = cli.db.clone().unwrap_or_else(default_db_path);

    match cli.command {
        Commands::Db { action } => match action {
            DbAction::Init { force } => cmd_db_init(&db_path, force),
            DbAction::Add {
                infos,
                manifest,
                skip_existing,
            } => cmd_db_add(&db_path, &infos, &manifest, skip_existing),
            DbAction::Show {
                artifact_type,
                artifact,
                json_output,
            } => cmd_db_show(
                &db_path,
                artifact_type.as_deref(),
                artifact.as_deref(),
                json_output,
            ),
            DbAction::Feeds => cmd_db_feeds(&db_path),
        },
        Commands::Plan { manifest } => cmd_plan(&manifest),
        Commands::Result { action } => match action {
            ResultAction::Show { file, manifest } => {
                cmd_result_show(&file, manifest.as_deref()).await
            }
        },
    }
}

fn default_db_path() -> PathBuf {
    let home = std::env::var_os(HOME_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_HOME));
    home.join("packages.db")
}

fn load_manifest(path: &Path, registry: &ArtifactTypeRegistry) -> Result<WorldManifest> {
    let manifest = WorldManifest::load(path)
        .with_context(|| format!("Failed to load world manifest {}", path.display()))?;
    manifest
        .register_types(registry)
        .context("World manifest declares conflicting artifact types")?;
    Ok(manifest)
}

fn load_db(path: &Path, registry: &ArtifactTypeRegistry) -> Result<Arc<PackageDb>> {
    let file = PackageDbFile::new(path);
    if !file.exists() {
        bail!(
            "No package database at {}. Run 'worldbuild db init' first.",
            path.display()
        );
    }
    file.load(registry)
        .with_context(|| format!("Failed to read package database {}", path.display()))
}

fn cmd_db_init(path: &Path, force: bool) -> Result<()> {
    let file = PackageDbFile::new(path);
    if file.exists() && !force {
        bail!(
            "Package database already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    file.save(&PackageDb::empty())
        .with_context(|| format!("Failed to write package database {}", path.display()))?;
    println!("Initialized empty package database at {}", path.display());
    Ok(())
}

fn read_descriptors(path: &Path) -> Result<Vec<PackageDescriptor>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse package descriptors in {}", path.display()))
}

fn cmd_db_add(db_path: &Path, infos: &Path, manifest: &Path, skip_existing: bool) -> Result<()> {
    let registry = ArtifactTypeRegistry::new();
    load_manifest(manifest, &registry)?;
    let file = PackageDbFile::new(db_path);
    let db = file
        .load_or_empty(&registry)
        .with_context(|| format!("Failed to read package database {}", db_path.display()))?;

    let batch = read_descriptors(infos)?
        .iter()
        .map(|d| d.to_info(&registry))
        .collect::<Result<Vec<PackageInstanceInfo>, _>>()
        .context("Invalid package descriptor")?;

    let updated = db
        .add(&registry, &batch, skip_existing)
        .context("Package batch rejected")?;
    if Arc::ptr_eq(&db, &updated) {
        println!("Nothing to register; database stays at version {}", db.version());
        return Ok(());
    }
    file.save(&updated)
        .with_context(|| format!("Failed to write package database {}", db_path.display()))?;
    info!(
        event = "cli.db_add",
        added = updated.instances().len() - db.instances().len(),
        version = updated.version(),
    );
    println!(
        "Registered {} package(s); database version {}",
        updated.instances().len() - db.instances().len(),
        updated.version()
    );
    Ok(())
}

#[derive(Debug, Serialize)]
struct InstanceView {
    key: String,
    savors: Option<String>,
    registered_at: String,
    dependencies: Vec<String>,
}

fn cmd_db_show(
    path: &Path,
    artifact_type: Option<&str>,
    artifact: Option<&str>,
    json_output: bool,
) -> Result<()> {
    let registry = ArtifactTypeRegistry::new();
    let db = load_db(path, &registry)?;

    let selected = if let Some(text) = artifact {
        let a = Artifact::try_parse(&registry, text);
        if !a.is_valid() {
            bail!("'{text}' is not a known artifact (expected Type:Name)");
        }
        db.instances_of(&a)
    } else if let Some(name) = artifact_type {
        let Some(t) = registry.get(name) else {
            bail!("Unknown artifact type '{name}'");
        };
        db.instances_of_type(&t)
    } else {
        db.instances().as_slice()
    };

    let views: Vec<InstanceView> = selected
        .iter()
        .map(|p| InstanceView {
            key: p.key().to_string(),
            savors: p.savors().map(ToString::to_string),
            registered_at: p.registered_at().to_rfc3339(),
            dependencies: p
                .dependencies()
                .iter()
                .map(|d| format!("{} ({:?})", d.target().key(), d.kind()))
                .collect(),
        })
        .collect();

    if json_output {
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }

    println!(
        "Package database v{} (updated {}), {} instance(s)",
        db.version(),
        db.last_update().format("%Y-%m-%d %H:%M:%S"),
        db.instances().len()
    );
    for v in &views {
        match &v.savors {
            Some(s) => println!("  {} [{}]", v.key, s),
            None => println!("  {}", v.key),
        }
        for d in &v.dependencies {
            println!("      -> {}", d);
        }
    }
    Ok(())
}

fn cmd_db_feeds(path: &Path) -> Result<()> {
    let registry = ArtifactTypeRegistry::new();
    let db = load_db(path, &registry)?;
    if db.feed_count() == 0 {
        println!("No feeds.");
        return Ok(());
    }
    for f in db.feeds() {
        println!("{:<40} {:>5} package(s)", f.typed_name(), f.len());
    }
    Ok(())
}

fn cmd_plan(manifest_path: &Path) -> Result<()> {
    let registry = ArtifactTypeRegistry::new();
    let manifest = load_manifest(manifest_path, &registry)?;
    let specs = manifest
        .solution_specs(&registry)
        .context("Invalid solution declaration")?;
    let context = DependentSolutionContext::build(specs)
        .context("Cannot order the world's solutions")?;

    if let Some(name) = &manifest.name {
        println!("World {name}: {} solution(s)", context.len());
    }
    for s in context.solutions() {
        println!("{:>3}. {} ({})", s.index, s.name, s.repository);
        for d in context
            .dependencies()
            .iter()
            .filter(|d| d.origin_solution == s.name)
        {
            let marker = if d.origin_is_build_project { " [build]" } else { "" };
            println!(
                "       {} -> {} ({}){}",
                d.origin_project, d.package, d.target_solution, marker
            );
        }
        for (project, artifact) in s.published_artifacts() {
            let targets: Vec<&str> = manifest
                .targets_for(artifact)
                .into_iter()
                .map(|t| t.name.as_str())
                .collect();
            let targets = if targets.is_empty() {
                "no target".to_string()
            } else {
                targets.join(", ")
            };
            println!("       {} publishes {artifact} => {targets}", project.name);
        }
    }

    let unrouted = unrouted_artifacts(&manifest, &context);
    if !unrouted.is_empty() {
        warn!(
            event = "plan.unrouted_artifacts",
            count = unrouted.len(),
            "published artifacts accepted by no target"
        );
        println!(
            "{} published artifact(s) have no target: {}",
            unrouted.len(),
            unrouted.join(", ")
        );
    }
    Ok(())
}

/// Published artifacts no declared target accepts; a release run would fail
/// to create its build result for them.
fn unrouted_artifacts(manifest: &WorldManifest, context: &DependentSolutionContext) -> Vec<String> {
    context
        .solutions()
        .iter()
        .flat_map(|s| s.published_artifacts())
        .filter(|(_, artifact)| manifest.targets_for(artifact).is_empty())
        .map(|(_, artifact)| artifact.to_string())
        .collect()
}

async fn cmd_result_show(path: &Path, manifest: Option<&Path>) -> Result<()> {
    let file = BuildResultFile::new(path);
    let record = file
        .load_record()
        .await
        .with_context(|| format!("Failed to read build result {}", path.display()))?;

    if let Some(manifest) = manifest {
        let registry = ArtifactTypeRegistry::new();
        load_manifest(manifest, &registry)?;
        BuildResult::from_record(record.clone(), &registry)
            .with_context(|| format!("Build result {} is not valid", path.display()))?;
    }

    println!(
        "{} build, record v{}, created {}",
        record.build_type,
        record.version,
        record.creation_date.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(v) = &record.world_release_version {
        println!("World release: {v}");
    }
    if record.solutions.is_empty() {
        println!("Solutions: (legacy record, derived from artifacts)");
    }
    for s in &record.solutions {
        println!("  {} {} @ {}", s.name, s.version, s.commit_sha);
    }
    println!("Artifacts:");
    for a in &record.artifacts {
        println!("  {}:{}/{} -> {}", a.artifact_type, a.name, a.version, a.target);
    }
    if let Some(notes) = &record.release_notes {
        println!();
        println!("{notes}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORLD: &str = r#"{
        "name": "CK",
        "artifactTypes": [ { "name": "NuGet" } ],
        "solutions": [
            { "name": "CK-Core", "repository": "org/ck-core",
              "projects": [ { "name": "CK.Core", "generates": ["NuGet:CK.Core"] } ] }
        ]
    }"#;

    #[test]
    fn test_cli_parses_global_db_flag_after_subcommand() {
        let cli = Cli::try_parse_from([
            "worldbuild", "db", "show", "--type", "NuGet", "--db", "x.db",
        ])
        .unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("x.db")));
        match cli.command {
            Commands::Db {
                action: DbAction::Show { artifact_type, .. },
            } => assert_eq!(artifact_type.as_deref(), Some("NuGet")),
            _ => panic!("expected db show"),
        }
    }

    #[test]
    fn test_db_add_requires_manifest() {
        assert!(Cli::try_parse_from(["worldbuild", "db", "add", "infos.json"]).is_err());
    }

    #[test]
    fn test_init_then_add_then_add_again() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("state").join("packages.db");
        let manifest = dir.path().join("world.json");
        let infos = dir.path().join("infos.json");
        std::fs::write(&manifest, WORLD).unwrap();
        std::fs::write(
            &infos,
            r#"[
                { "key": "NuGet:CK.Core/1.0.0", "feeds": ["NuGet:public"] },
                { "key": "NuGet:CK.Text/1.0.0",
                  "dependencies": [ { "target": "NuGet:CK.Core/1.0.0" } ] }
            ]"#,
        )
        .unwrap();

        cmd_db_init(&db, false).unwrap();
        assert!(cmd_db_init(&db, false).is_err());
        cmd_db_add(&db, &infos, &manifest, false).unwrap();

        let registry = ArtifactTypeRegistry::new();
        let loaded = PackageDbFile::new(&db).load(&registry).unwrap();
        assert_eq!(loaded.instances().len(), 2);
        assert_eq!(loaded.feed_count(), 1);

        assert!(cmd_db_add(&db, &infos, &manifest, false).is_err());
        cmd_db_add(&db, &infos, &manifest, true).unwrap();
        let again = PackageDbFile::new(&db).load(&registry).unwrap();
        assert_eq!(again.version(), loaded.version());
    }

    #[test]
    fn test_plan_reports_artifacts_no_target_accepts() {
        let routed = r#"{
            "artifactTypes": [ { "name": "NuGet" }, { "name": "NPM" } ],
            "solutions": [
                { "name": "CK-Core", "repository": "org/ck-core",
                  "projects": [
                    { "name": "CK.Core", "generates": ["NuGet:CK.Core"] },
                    { "name": "ck-ui", "generates": ["NPM:ck-ui"] },
                    { "name": "CodeCakeBuilder", "buildProject": true,
                      "generates": ["NuGet:CK.Builder"] }
                  ] }
            ],
            "targets": [ { "name": "nuget-public", "accepts": ["NuGet"] } ]
        }"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.json");
        std::fs::write(&path, routed).unwrap();

        let registry = ArtifactTypeRegistry::new();
        let manifest = load_manifest(&path, &registry).unwrap();
        let context =
            DependentSolutionContext::build(manifest.solution_specs(&registry).unwrap()).unwrap();
        assert_eq!(unrouted_artifacts(&manifest, &context), vec!["NPM:ck-ui"]);
        cmd_plan(&path).unwrap();

        let core = Artifact::try_parse(&registry, "NuGet:CK.Core");
        assert_eq!(manifest.targets_for(&core)[0].name, "nuget-public");
    }

    #[test]
    fn test_plan_rejects_missing_manifest() {
        let err = cmd_plan(Path::new("/nonexistent/world.json")).unwrap_err();
        assert!(format!("{err:#}").contains("world.json"));
    }
}
