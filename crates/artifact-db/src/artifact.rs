//! Artifact identity: the kind of a package, its name, and a versioned instance.
//!
//! - [`ArtifactType`]: a registered package ecosystem (`NuGet`, `NPM`...).
//! - [`Artifact`]: `(type, name)`; names compare case-insensitively.
//! - [`ArtifactInstance`]: `(artifact, version)`; sorts artifact ascending
//!   then version **descending**, so the latest version of an artifact comes first.
//!
//! Parsing is total: malformed text yields an invalid value (see `is_valid`)
//! because artifact strings routinely come from untrusted files.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock};

use semver::Version;

use crate::error::RegistryError;
use crate::savor::SavorContext;

#[derive(Debug)]
struct ArtifactTypeInner {
    name: String,
    installable: bool,
    savor_context: Option<Arc<SavorContext>>,
}

/// A package ecosystem registered in an [`ArtifactTypeRegistry`].
///
/// Cheap to clone. Identity is the name (ordinal comparison).
#[derive(Clone)]
pub struct ArtifactType(Arc<ArtifactTypeInner>);

impl ArtifactType {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Whether instances of this type can be installed as dependencies.
    pub fn is_installable(&self) -> bool {
        self.0.installable
    }

    pub fn savor_context(&self) -> Option<&Arc<SavorContext>> {
        self.0.savor_context.as_ref()
    }
}

impl PartialEq for ArtifactType {
    fn eq(&self, other: &Self) -> bool {
        self.0.name == other.0.name
    }
}

impl Eq for ArtifactType {}

impl PartialOrd for ArtifactType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ArtifactType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.name.cmp(&other.0.name)
    }
}

impl Hash for ArtifactType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.name.hash(state);
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name)
    }
}

impl fmt::Debug for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArtifactType({})", self.0.name)
    }
}

/// Explicit registry of artifact types, shared by every component that parses
/// or registers types. Its lifetime is the process run.
#[derive(Debug, Default)]
pub struct ArtifactTypeRegistry {
    types: RwLock<BTreeMap<String, ArtifactType>>,
}

impl ArtifactTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type, or return the existing one when settings match.
    ///
    /// Registering an existing name with a different `installable` flag or
    /// savor context is a configuration error.
    pub fn register(
        &self,
        name: &str,
        installable: bool,
        savor_context: Option<SavorContext>,
    ) -> Result<ArtifactType, RegistryError> {
        if name.is_empty()
            || name
                .chars()
                .any(|c| c == ':' || c == '/' || c.is_whitespace())
        {
            return Err(RegistryError::InvalidName {
                name: name.to_string(),
            });
        }
        let mut types = self.types.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = types.get(name) {
            if existing.is_installable() != installable {
                return Err(RegistryError::IncompatibleRegistration {
                    name: name.to_string(),
                    detail: format!(
                        "installable is {}, requested {}",
                        existing.is_installable(),
                        installable
                    ),
                });
            }
            if existing.savor_context().map(|c| c.as_ref()) != savor_context.as_ref() {
                return Err(RegistryError::IncompatibleRegistration {
                    name: name.to_string(),
                    detail: "savor context differs".to_string(),
                });
            }
            return Ok(existing.clone());
        }
        let t = ArtifactType(Arc::new(ArtifactTypeInner {
            name: name.to_string(),
            installable,
            savor_context: savor_context.map(Arc::new),
        }));
        types.insert(name.to_string(), t.clone());
        tracing::debug!(artifact_type = %name, installable, "artifact type registered");
        Ok(t)
    }

    pub fn get(&self, name: &str) -> Option<ArtifactType> {
        self.types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// All registered types, ordered by name.
    pub fn all(&self) -> Vec<ArtifactType> {
        self.types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

fn folded(name: &str) -> impl Iterator<Item = char> + '_ {
    name.chars().flat_map(char::to_lowercase)
}

/// `(type, name)` identity of a package, independent of its version.
///
/// The default value is invalid (no type).
#[derive(Clone, Default)]
pub struct Artifact {
    artifact_type: Option<ArtifactType>,
    name: String,
}

impl Artifact {
    pub fn new(artifact_type: ArtifactType, name: impl Into<String>) -> Self {
        Self {
            artifact_type: Some(artifact_type),
            name: name.into(),
        }
    }

    /// Parse `"Type:Name"`. Unknown types and malformed text give an invalid artifact.
    pub fn try_parse(registry: &ArtifactTypeRegistry, text: &str) -> Self {
        let Some((type_name, name)) = text.trim().split_once(':') else {
            return Self::default();
        };
        let name = name.trim();
        if name.is_empty() || name.contains('/') || name.contains(':') {
            return Self::default();
        }
        match registry.get(type_name.trim()) {
            Some(t) => Self::new(t, name),
            None => Self::default(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.artifact_type.is_some() && !self.name.is_empty()
    }

    pub fn artifact_type(&self) -> Option<&ArtifactType> {
        self.artifact_type.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical `"Type:Name"` identity string.
    pub fn typed_name(&self) -> String {
        self.to_string()
    }

    pub fn with_version(&self, version: Version) -> ArtifactInstance {
        ArtifactInstance::new(self.clone(), version)
    }
}

impl PartialEq for Artifact {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Artifact {}

impl PartialOrd for Artifact {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Artifact {
    fn cmp(&self, other: &Self) -> Ordering {
        self.artifact_type
            .cmp(&other.artifact_type)
            .then_with(|| folded(&self.name).cmp(folded(&other.name)))
    }
}

impl Hash for Artifact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.artifact_type.hash(state);
        for c in folded(&self.name) {
            c.hash(state);
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.artifact_type {
            Some(t) => write!(f, "{}:{}", t, self.name),
            None => f.write_str("(invalid artifact)"),
        }
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Artifact({})", self)
    }
}

/// A versioned artifact. The default value is invalid.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct ArtifactInstance {
    artifact: Artifact,
    version: Option<Version>,
}

impl ArtifactInstance {
    pub fn new(artifact: Artifact, version: Version) -> Self {
        Self {
            artifact,
            version: Some(version),
        }
    }

    /// Parse `"Type:Name/Version"`. Never fails: malformed text gives an invalid instance.
    pub fn try_parse(registry: &ArtifactTypeRegistry, text: &str) -> Self {
        let Some((artifact, version)) = text.trim().split_once('/') else {
            return Self::default();
        };
        let artifact = Artifact::try_parse(registry, artifact);
        if !artifact.is_valid() {
            return Self::default();
        }
        match Version::parse(version.trim()) {
            Ok(v) => Self::new(artifact, v),
            Err(_) => Self::default(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.artifact.is_valid() && self.version.is_some()
    }

    pub fn artifact(&self) -> &Artifact {
        &self.artifact
    }

    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    pub fn with_version(&self, version: Version) -> Self {
        Self::new(self.artifact.clone(), version)
    }
}

impl PartialOrd for ArtifactInstance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ArtifactInstance {
    fn cmp(&self, other: &Self) -> Ordering {
        self.artifact
            .cmp(&other.artifact)
            .then_with(|| other.version.cmp(&self.version))
    }
}

impl fmt::Display for ArtifactInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) if self.artifact.is_valid() => write!(f, "{}/{}", self.artifact, v),
            _ => f.write_str("(invalid artifact instance)"),
        }
    }
}

impl fmt::Debug for ArtifactInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArtifactInstance({})", self)
    }
}
