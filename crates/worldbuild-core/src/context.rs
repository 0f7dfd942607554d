//! Dependent solution context: solutions ranked by cross-repository package
//! references.
//!
//! Solution X depends on solution Y when a project of X references a package
//! generated by a project of Y. Ranks are computed with Kahn's algorithm; the
//! ready set is ordered by name so the same world always yields the same
//! ranks.

use std::collections::{BTreeMap, BTreeSet};

use artifact_db::{Artifact, ArtifactInstance, Version};
use serde::Serialize;

use crate::error::{WorldBuildError, WorldBuildResult};

/// A project inside a solution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectSpec {
    pub name: String,
    /// Artifacts this project produces.
    pub generated: Vec<Artifact>,
    /// Pinned package references.
    pub references: Vec<ArtifactInstance>,
    /// Tooling project built to bootstrap the real build.
    pub is_build_project: bool,
}

impl ProjectSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            generated: Vec::new(),
            references: Vec::new(),
            is_build_project: false,
        }
    }

    pub fn generates(mut self, artifact: Artifact) -> Self {
        self.generated.push(artifact);
        self
    }

    pub fn references(mut self, package: ArtifactInstance) -> Self {
        self.references.push(package);
        self
    }

    pub fn build_project(mut self) -> Self {
        self.is_build_project = true;
        self
    }
}

/// One repository-level solution as declared by the world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolutionSpec {
    pub name: String,
    pub repository: String,
    pub projects: Vec<ProjectSpec>,
}

impl SolutionSpec {
    pub fn new(name: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            repository: repository.into(),
            projects: Vec::new(),
        }
    }

    pub fn with_project(mut self, project: ProjectSpec) -> Self {
        self.projects.push(project);
        self
    }
}

/// A solution with its rank in the context.
#[derive(Debug, Clone)]
pub struct DependentSolution {
    /// Zero-based topological rank.
    pub index: usize,
    pub name: String,
    pub repository: String,
    pub projects: Vec<ProjectSpec>,
}

impl DependentSolution {
    pub fn project(&self, name: &str) -> Option<&ProjectSpec> {
        self.projects.iter().find(|p| p.name == name)
    }

    /// Artifacts published by this solution (build projects excluded).
    pub fn published_artifacts(&self) -> impl Iterator<Item = (&ProjectSpec, &Artifact)> {
        self.projects
            .iter()
            .filter(|p| !p.is_build_project)
            .flat_map(|p| p.generated.iter().map(move |a| (p, a)))
    }
}

/// A project of one solution referencing a package generated in another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalPackageDependency {
    pub origin_solution: String,
    pub origin_project: String,
    pub origin_is_build_project: bool,
    pub target_solution: String,
    pub target_project: String,
    /// The reference as declared, with its pinned version.
    #[serde(serialize_with = "serialize_display")]
    pub package: ArtifactInstance,
}

fn serialize_display<S: serde::Serializer>(
    value: &ArtifactInstance,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// A package reference to move to the version produced in the current run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageUpgrade {
    pub project: String,
    pub build_project: bool,
    pub package: ArtifactInstance,
}

/// Solutions ranked in dependency order plus the cross-solution edges.
#[derive(Debug, Clone, Default)]
pub struct DependentSolutionContext {
    solutions: Vec<DependentSolution>,
    dependencies: Vec<LocalPackageDependency>,
    /// artifact -> (solution index, project position)
    producers: BTreeMap<Artifact, (usize, usize)>,
}

impl DependentSolutionContext {
    /// Rank `specs`.
    ///
    /// Fails on duplicate solution names, on an artifact generated twice and
    /// on a cycle between solutions.
    pub fn build(specs: Vec<SolutionSpec>) -> WorldBuildResult<Self> {
        let mut by_name: BTreeMap<String, usize> = BTreeMap::new();
        for (i, s) in specs.iter().enumerate() {
            if by_name.insert(s.name.clone(), i).is_some() {
                return Err(WorldBuildError::DuplicateSolution {
                    name: s.name.clone(),
                });
            }
        }

        // artifact -> (input position, project position)
        let mut producers: BTreeMap<Artifact, (usize, usize)> = BTreeMap::new();
        for (si, s) in specs.iter().enumerate() {
            for (pi, p) in s.projects.iter().enumerate() {
                for a in &p.generated {
                    if let Some(&(osi, opi)) = producers.get(a) {
                        return Err(WorldBuildError::AmbiguousProducer {
                            artifact: a.to_string(),
                            first: format!("{}/{}", specs[osi].name, specs[osi].projects[opi].name),
                            second: format!("{}/{}", s.name, p.name),
                        });
                    }
                    producers.insert(a.clone(), (si, pi));
                }
            }
        }

        // Edges over input positions: upstream -> downstream.
        let mut downstream: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); specs.len()];
        let mut in_degree: Vec<usize> = vec![0; specs.len()];
        let mut raw_deps: Vec<(usize, usize, LocalPackageDependency)> = Vec::new();
        for (si, s) in specs.iter().enumerate() {
            for p in &s.projects {
                for r in &p.references {
                    let Some(&(ti, tpi)) = producers.get(r.artifact()) else {
                        continue;
                    };
                    if ti == si {
                        continue;
                    }
                    if downstream[ti].insert(si) {
                        in_degree[si] += 1;
                    }
                    raw_deps.push((
                        si,
                        ti,
                        LocalPackageDependency {
                            origin_solution: s.name.clone(),
                            origin_project: p.name.clone(),
                            origin_is_build_project: p.is_build_project,
                            target_solution: specs[ti].name.clone(),
                            target_project: specs[ti].projects[tpi].name.clone(),
                            package: r.clone(),
                        },
                    ));
                }
            }
        }

        let mut ready: BTreeSet<(&str, usize)> = specs
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] == 0)
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();
        let mut order: Vec<usize> = Vec::with_capacity(specs.len());
        while let Some(next) = ready.pop_first() {
            let (_, i) = next;
            order.push(i);
            for &d in &downstream[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    ready.insert((specs[d].name.as_str(), d));
                }
            }
        }

        if order.len() != specs.len() {
            let mut solutions: Vec<String> = specs
                .iter()
                .enumerate()
                .filter(|(i, _)| in_degree[*i] > 0)
                .map(|(_, s)| s.name.clone())
                .collect();
            solutions.sort();
            tracing::error!(event = "context.cycle", solutions = ?solutions);
            return Err(WorldBuildError::DependencyCycle { solutions });
        }

        let mut rank = vec![0usize; specs.len()];
        for (r, &i) in order.iter().enumerate() {
            rank[i] = r;
        }

        raw_deps.sort_by(|a, b| {
            (rank[a.0], rank[a.1], &a.2.origin_project, &a.2.package).cmp(&(
                rank[b.0],
                rank[b.1],
                &b.2.origin_project,
                &b.2.package,
            ))
        });
        let dependencies = raw_deps.into_iter().map(|(_, _, d)| d).collect();

        let producers = producers
            .into_iter()
            .map(|(a, (si, pi))| (a, (rank[si], pi)))
            .collect();

        let mut slots: Vec<Option<SolutionSpec>> = specs.into_iter().map(Some).collect();
        let solutions = order
            .iter()
            .enumerate()
            .filter_map(|(index, &i)| {
                slots[i].take().map(|s| DependentSolution {
                    index,
                    name: s.name,
                    repository: s.repository,
                    projects: s.projects,
                })
            })
            .collect();

        Ok(Self {
            solutions,
            dependencies,
            producers,
        })
    }

    /// Solutions in rank order; `solutions()[i].index == i`.
    pub fn solutions(&self) -> &[DependentSolution] {
        &self.solutions
    }

    pub fn dependencies(&self) -> &[LocalPackageDependency] {
        &self.dependencies
    }

    pub fn len(&self) -> usize {
        self.solutions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.solutions.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&DependentSolution> {
        self.solutions.get(index)
    }

    pub fn find(&self, name: &str) -> Option<&DependentSolution> {
        self.solutions.iter().find(|s| s.name == name)
    }

    /// Solution and project generating `artifact`.
    pub fn producer_of(&self, artifact: &Artifact) -> Option<(&DependentSolution, &ProjectSpec)> {
        let &(si, pi) = self.producers.get(artifact)?;
        let s = self.solutions.get(si)?;
        Some((s, s.projects.get(pi)?))
    }

    /// Solutions `index` depends on, in rank order.
    pub fn direct_requirements(&self, index: usize) -> Vec<&DependentSolution> {
        let Some(s) = self.solutions.get(index) else {
            return Vec::new();
        };
        let names: BTreeSet<&str> = self
            .dependencies
            .iter()
            .filter(|d| d.origin_solution == s.name)
            .map(|d| d.target_solution.as_str())
            .collect();
        self.solutions
            .iter()
            .filter(|o| names.contains(o.name.as_str()))
            .collect()
    }

    /// Solutions depending on `index`, in rank order.
    pub fn direct_dependents(&self, index: usize) -> Vec<&DependentSolution> {
        let Some(s) = self.solutions.get(index) else {
            return Vec::new();
        };
        let names: BTreeSet<&str> = self
            .dependencies
            .iter()
            .filter(|d| d.target_solution == s.name)
            .map(|d| d.origin_solution.as_str())
            .collect();
        self.solutions
            .iter()
            .filter(|o| names.contains(o.name.as_str()))
            .collect()
    }

    /// Upgrades solution `index` needs so that its references point to the
    /// versions in `produced` (solution name -> version of this run).
    ///
    /// References already at the produced version are left out.
    pub fn upgrades_for(
        &self,
        index: usize,
        produced: &BTreeMap<String, Version>,
    ) -> Vec<PackageUpgrade> {
        let Some(s) = self.solutions.get(index) else {
            return Vec::new();
        };
        self.dependencies
            .iter()
            .filter(|d| d.origin_solution == s.name)
            .filter_map(|d| {
                let version = produced.get(&d.target_solution)?;
                if d.package.version() == Some(version) {
                    return None;
                }
                Some(PackageUpgrade {
                    project: d.origin_project.clone(),
                    build_project: d.origin_is_build_project,
                    package: d.package.with_version(version.clone()),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use artifact_db::ArtifactTypeRegistry;

    fn registry() -> ArtifactTypeRegistry {
        let r = ArtifactTypeRegistry::new();
        r.register("NuGet", true, None).unwrap();
        r
    }

    fn solution(
        r: &ArtifactTypeRegistry,
        name: &str,
        generates: &str,
        references: &[&str],
    ) -> SolutionSpec {
        let mut p = ProjectSpec::new(format!("{name}.Lib"))
            .generates(Artifact::try_parse(r, &format!("NuGet:{generates}")));
        for reference in references {
            p = p.references(ArtifactInstance::try_parse(r, reference));
        }
        SolutionSpec::new(name, format!("org/{name}")).with_project(p)
    }

    /// Core <- Text <- App, plus an unrelated Zeta.
    fn world(r: &ArtifactTypeRegistry) -> Vec<SolutionSpec> {
        vec![
            solution(r, "App", "App", &["NuGet:Text/1.0.0", "NuGet:Core/1.0.0"]),
            solution(r, "Zeta", "Zeta", &[]),
            solution(r, "Text", "Text", &["NuGet:Core/1.0.0"]),
            solution(r, "Core", "Core", &[]),
        ]
    }

    #[test]
    fn test_ranks_follow_dependencies_then_names() {
        let r = registry();
        let ctx = DependentSolutionContext::build(world(&r)).unwrap();
        let names: Vec<&str> = ctx.solutions().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Core", "Text", "App", "Zeta"]);
        for (i, s) in ctx.solutions().iter().enumerate() {
            assert_eq!(s.index, i);
        }
        assert_eq!(ctx.dependencies().len(), 3);
    }

    #[test]
    fn test_direct_requirements_and_dependents() {
        let r = registry();
        let ctx = DependentSolutionContext::build(world(&r)).unwrap();
        let app = ctx.find("App").unwrap().index;
        let req: Vec<&str> = ctx
            .direct_requirements(app)
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(req, vec!["Core", "Text"]);
        let core = ctx.find("Core").unwrap().index;
        let dep: Vec<&str> = ctx
            .direct_dependents(core)
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(dep, vec!["Text", "App"]);
    }

    #[test]
    fn test_cycle_is_reported_with_participants() {
        let r = registry();
        let specs = vec![
            solution(&r, "A", "A", &["NuGet:B/1.0.0"]),
            solution(&r, "B", "B", &["NuGet:A/1.0.0"]),
            solution(&r, "C", "C", &[]),
        ];
        let err = DependentSolutionContext::build(specs).unwrap_err();
        match err {
            WorldBuildError::DependencyCycle { solutions } => {
                assert_eq!(solutions, vec!["A".to_string(), "B".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_artifact_generated_twice_is_rejected() {
        let r = registry();
        let specs = vec![
            solution(&r, "A", "Shared", &[]),
            solution(&r, "B", "Shared", &[]),
        ];
        let err = DependentSolutionContext::build(specs).unwrap_err();
        assert!(matches!(err, WorldBuildError::AmbiguousProducer { .. }));
    }

    #[test]
    fn test_duplicate_solution_name_is_rejected() {
        let r = registry();
        let specs = vec![solution(&r, "A", "A1", &[]), solution(&r, "A", "A2", &[])];
        assert!(matches!(
            DependentSolutionContext::build(specs),
            Err(WorldBuildError::DuplicateSolution { .. })
        ));
    }

    #[test]
    fn test_upgrades_for_uses_produced_versions() {
        let r = registry();
        let ctx = DependentSolutionContext::build(world(&r)).unwrap();
        let mut produced = BTreeMap::new();
        produced.insert("Core".to_string(), Version::new(1, 0, 0));
        produced.insert("Text".to_string(), Version::new(1, 1, 0));

        let app = ctx.find("App").unwrap().index;
        let upgrades = ctx.upgrades_for(app, &produced);
        // Core is already pinned to 1.0.0.
        assert_eq!(upgrades.len(), 1);
        assert_eq!(upgrades[0].project, "App.Lib");
        assert_eq!(upgrades[0].package.to_string(), "NuGet:Text/1.1.0");
    }

    #[test]
    fn test_references_to_external_packages_are_ignored() {
        let r = registry();
        let specs = vec![solution(&r, "A", "A", &["NuGet:Newtonsoft.Json/13.0.1"])];
        let ctx = DependentSolutionContext::build(specs).unwrap();
        assert!(ctx.dependencies().is_empty());
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn test_producer_lookup_uses_rank_positions() {
        let r = registry();
        let ctx = DependentSolutionContext::build(world(&r)).unwrap();
        let text = Artifact::try_parse(&r, "NuGet:Text");
        let (s, p) = ctx.producer_of(&text).unwrap();
        assert_eq!(s.name, "Text");
        assert_eq!(p.name, "Text.Lib");
    }
}
