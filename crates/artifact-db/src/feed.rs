//! Package feeds: named channels exposing a subset of the known instances.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::artifact::{Artifact, ArtifactInstance, ArtifactType};
use crate::instance::PackageInstance;

/// A feed is identified like an artifact (`"Type:Name"`) and only exposes
/// instances of its own type. Adding members returns a new feed.
#[derive(Debug, Clone)]
pub struct PackageFeed {
    id: Artifact,
    instances: BTreeMap<ArtifactInstance, Arc<PackageInstance>>,
}

impl PackageFeed {
    pub fn new(id: Artifact) -> Self {
        debug_assert!(id.is_valid());
        Self {
            id,
            instances: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &Artifact {
        &self.id
    }

    pub fn typed_name(&self) -> String {
        self.id.typed_name()
    }

    pub fn name(&self) -> &str {
        self.id.name()
    }

    pub fn artifact_type(&self) -> Option<&ArtifactType> {
        self.id.artifact_type()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn contains(&self, key: &ArtifactInstance) -> bool {
        self.instances.contains_key(key)
    }

    pub fn get(&self, key: &ArtifactInstance) -> Option<&Arc<PackageInstance>> {
        self.instances.get(key)
    }

    /// Members in [`ArtifactInstance`] order.
    pub fn instances(&self) -> impl Iterator<Item = &Arc<PackageInstance>> {
        self.instances.values()
    }

    /// Versions of `artifact` exposed by this feed, latest first.
    pub fn instances_of<'a>(
        &'a self,
        artifact: &'a Artifact,
    ) -> impl Iterator<Item = &'a Arc<PackageInstance>> + 'a {
        self.instances
            .values()
            .filter(move |p| p.key().artifact() == artifact)
    }

    /// New feed with `added` merged in. `self` is left untouched.
    pub fn with_instances(&self, added: impl IntoIterator<Item = Arc<PackageInstance>>) -> Self {
        let mut instances = self.instances.clone();
        for p in added {
            debug_assert_eq!(p.key().artifact().artifact_type(), self.id.artifact_type());
            instances.insert(p.key().clone(), p);
        }
        Self {
            id: self.id.clone(),
            instances,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactTypeRegistry;
    use chrono::Utc;

    #[test]
    fn with_instances_is_copy_on_write() {
        let r = ArtifactTypeRegistry::new();
        r.register("NuGet", true, None).unwrap();
        let feed = PackageFeed::new(Artifact::try_parse(&r, "NuGet:Public"));
        let key = ArtifactInstance::try_parse(&r, "NuGet:A/1.0.0");
        let p = Arc::new(PackageInstance::new(key.clone(), None, Utc::now(), Vec::new()));

        let extended = feed.with_instances([p]);
        assert!(feed.is_empty());
        assert!(extended.contains(&key));
        assert_eq!(extended.typed_name(), "NuGet:Public");

        let a = Artifact::try_parse(&r, "NuGet:a");
        assert_eq!(extended.instances_of(&a).count(), 1);
    }
}
