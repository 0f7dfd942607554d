//! Registered package instances and the descriptors used to register them.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactInstance, ArtifactTypeRegistry};
use crate::error::{PackageDbError, PackageDbResult};
use crate::savor::Savors;

/// Nature of a dependency edge between two packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Flows to consumers of the dependent package.
    #[default]
    Transitive,
    /// Used by the package itself, hidden from its consumers.
    Private,
    /// Only needed to build or test the package.
    Development,
}

impl DependencyKind {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            DependencyKind::Transitive => 0,
            DependencyKind::Private => 1,
            DependencyKind::Development => 2,
        }
    }

    pub(crate) fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(DependencyKind::Transitive),
            1 => Some(DependencyKind::Private),
            2 => Some(DependencyKind::Development),
            _ => None,
        }
    }
}

/// A resolved dependency edge. The target always lives in the same store.
#[derive(Clone)]
pub struct PackageReference {
    target: Arc<PackageInstance>,
    kind: DependencyKind,
    savors: Option<Savors>,
}

impl PackageReference {
    pub fn new(target: Arc<PackageInstance>, kind: DependencyKind, savors: Option<Savors>) -> Self {
        Self {
            target,
            kind,
            savors,
        }
    }

    pub fn target(&self) -> &Arc<PackageInstance> {
        &self.target
    }

    pub fn kind(&self) -> DependencyKind {
        self.kind
    }

    pub fn savors(&self) -> Option<&Savors> {
        self.savors.as_ref()
    }
}

impl fmt::Debug for PackageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackageReference")
            .field("target", self.target.key())
            .field("kind", &self.kind)
            .field("savors", &self.savors)
            .finish()
    }
}

/// A concrete registered package. Immutable once built.
pub struct PackageInstance {
    key: ArtifactInstance,
    savors: Option<Savors>,
    registered_at: DateTime<Utc>,
    dependencies: Vec<PackageReference>,
}

impl PackageInstance {
    pub fn new(
        key: ArtifactInstance,
        savors: Option<Savors>,
        registered_at: DateTime<Utc>,
        dependencies: Vec<PackageReference>,
    ) -> Self {
        debug_assert!(key.is_valid());
        Self {
            key,
            savors,
            registered_at,
            dependencies,
        }
    }

    pub fn key(&self) -> &ArtifactInstance {
        &self.key
    }

    pub fn savors(&self) -> Option<&Savors> {
        self.savors.as_ref()
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    pub fn dependencies(&self) -> &[PackageReference] {
        &self.dependencies
    }
}

impl fmt::Debug for PackageInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackageInstance")
            .field("key", &self.key)
            .field("savors", &self.savors)
            .field("registered_at", &self.registered_at)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

/// A dependency declared by a [`PackageInstanceInfo`].
#[derive(Debug, Clone)]
pub struct DependencyInfo {
    pub target: ArtifactInstance,
    pub kind: DependencyKind,
    pub savors: Option<Savors>,
}

/// Registration request for one package.
#[derive(Debug, Clone)]
pub struct PackageInstanceInfo {
    pub key: ArtifactInstance,
    pub savors: Option<Savors>,
    pub dependencies: Vec<DependencyInfo>,
    /// `"Type:Name"` feed identities. May be empty.
    pub feed_names: Vec<String>,
}

impl PackageInstanceInfo {
    pub fn new(key: ArtifactInstance) -> Self {
        Self {
            key,
            savors: None,
            dependencies: Vec::new(),
            feed_names: Vec::new(),
        }
    }

    pub fn with_dependency(mut self, target: ArtifactInstance, kind: DependencyKind) -> Self {
        self.dependencies.push(DependencyInfo {
            target,
            kind,
            savors: None,
        });
        self
    }

    pub fn with_feed(mut self, feed_name: impl Into<String>) -> Self {
        self.feed_names.push(feed_name.into());
        self
    }

    pub fn with_savors(mut self, savors: Savors) -> Self {
        self.savors = Some(savors);
        self
    }
}

/// Textual form of a dependency, as found in descriptor files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyDescriptor {
    pub target: String,
    #[serde(default)]
    pub kind: DependencyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub savors: Option<String>,
}

/// Textual form of a [`PackageInstanceInfo`], as found in descriptor files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDescriptor {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub savors: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<DependencyDescriptor>,
    #[serde(default)]
    pub feeds: Vec<String>,
}

fn parse_savors(key: &ArtifactInstance, text: Option<&str>) -> PackageDbResult<Option<Savors>> {
    let Some(text) = text else {
        return Ok(None);
    };
    let Some(context) = key.artifact().artifact_type().and_then(|t| t.savor_context()) else {
        return Err(PackageDbError::InvalidSavors {
            value: text.to_string(),
            reason: format!("{} has no savor context", key.artifact()),
        });
    };
    context.parse(text).map(Some)
}

impl PackageDescriptor {
    /// Resolve the textual descriptor against `registry`.
    ///
    /// Keys are parsed totally: an unknown type or bad version gives an invalid
    /// key that [`crate::PackageDb::add`] later rejects. Only savors are checked here.
    pub fn to_info(&self, registry: &ArtifactTypeRegistry) -> PackageDbResult<PackageInstanceInfo> {
        let key = ArtifactInstance::try_parse(registry, &self.key);
        let savors = parse_savors(&key, self.savors.as_deref())?;
        let dependencies = self
            .dependencies
            .iter()
            .map(|d| {
                let target = ArtifactInstance::try_parse(registry, &d.target);
                let savors = parse_savors(&target, d.savors.as_deref())?;
                Ok(DependencyInfo {
                    target,
                    kind: d.kind,
                    savors,
                })
            })
            .collect::<PackageDbResult<Vec<_>>>()?;
        Ok(PackageInstanceInfo {
            key,
            savors,
            dependencies,
            feed_names: self.feeds.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::savor::SavorContext;

    fn registry() -> ArtifactTypeRegistry {
        let r = ArtifactTypeRegistry::new();
        r.register(
            "NuGet",
            true,
            Some(SavorContext::new("frameworks", ';', ["net8.0", "net472"])),
        )
        .unwrap();
        r
    }

    #[test]
    fn descriptor_deserializes_with_defaults() {
        let json = r#"{
            "key": "NuGet:CK.Core/1.0.0",
            "dependencies": [ { "target": "NuGet:CK.Text/2.0.0" } ]
        }"#;
        let d: PackageDescriptor = serde_json::from_str(json).unwrap();
        assert!(d.feeds.is_empty());
        assert_eq!(d.dependencies[0].kind, DependencyKind::Transitive);
    }

    #[test]
    fn descriptor_resolves_savors_through_the_type_context() {
        let r = registry();
        let d = PackageDescriptor {
            key: "NuGet:CK.Core/1.0.0".to_string(),
            savors: Some("net8.0;net472".to_string()),
            dependencies: vec![DependencyDescriptor {
                target: "NuGet:CK.Text/2.0.0".to_string(),
                kind: DependencyKind::Private,
                savors: Some("net8.0".to_string()),
            }],
            feeds: vec!["NuGet:Public".to_string()],
        };
        let info = d.to_info(&r).unwrap();
        assert!(info.key.is_valid());
        assert_eq!(info.savors.unwrap().len(), 2);
        assert_eq!(info.dependencies[0].kind, DependencyKind::Private);
        assert_eq!(info.feed_names, vec!["NuGet:Public".to_string()]);
    }

    #[test]
    fn descriptor_keeps_invalid_keys_for_later_rejection() {
        let r = registry();
        let d = PackageDescriptor {
            key: "Unknown:CK.Core/1.0.0".to_string(),
            savors: None,
            dependencies: Vec::new(),
            feeds: Vec::new(),
        };
        assert!(!d.to_info(&r).unwrap().key.is_valid());
    }

    #[test]
    fn dependency_kind_byte_mapping_is_stable() {
        for kind in [
            DependencyKind::Transitive,
            DependencyKind::Private,
            DependencyKind::Development,
        ] {
            assert_eq!(DependencyKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(DependencyKind::from_u8(9), None);
    }
}
