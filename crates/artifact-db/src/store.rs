//! Sorted, append-only store of [`PackageInstance`]s.
//!
//! Entries are kept in [`ArtifactInstance`] order, so lookups are binary
//! searches and every type or artifact occupies a contiguous slice. `add`
//! never touches the receiver: it returns a new store that shares the
//! existing instances.

use std::sync::Arc;

use crate::artifact::{Artifact, ArtifactInstance, ArtifactType};
use crate::instance::PackageInstance;

#[derive(Debug, Clone, Default)]
pub struct InstanceStore {
    instances: Arc<[Arc<PackageInstance>]>,
}

impl InstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an already sorted, duplicate-free sequence.
    pub(crate) fn from_sorted(instances: Vec<Arc<PackageInstance>>) -> Self {
        debug_assert!(instances.windows(2).all(|w| w[0].key() < w[1].key()));
        Self {
            instances: instances.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<PackageInstance>> {
        self.instances.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<PackageInstance>> {
        self.instances.iter()
    }

    pub fn as_slice(&self) -> &[Arc<PackageInstance>] {
        &self.instances
    }

    /// `Ok(index)` when `key` is stored, `Err(insertion_point)` otherwise.
    pub fn index_of(&self, key: &ArtifactInstance) -> Result<usize, usize> {
        self.instances.binary_search_by(|p| p.key().cmp(key))
    }

    pub fn find(&self, key: &ArtifactInstance) -> Option<&Arc<PackageInstance>> {
        self.index_of(key).ok().map(|i| &self.instances[i])
    }

    /// Every instance of `artifact_type`, grouped by artifact, latest version first.
    pub fn get_instances_of_type(&self, artifact_type: &ArtifactType) -> &[Arc<PackageInstance>] {
        let t = Some(artifact_type);
        let start = self
            .instances
            .partition_point(|p| p.key().artifact().artifact_type() < t);
        let end = self
            .instances
            .partition_point(|p| p.key().artifact().artifact_type() <= t);
        &self.instances[start..end]
    }

    /// Every version of `artifact`, latest first.
    pub fn get_instances(&self, artifact: &Artifact) -> &[Arc<PackageInstance>] {
        let start = self
            .instances
            .partition_point(|p| p.key().artifact() < artifact);
        let end = self
            .instances
            .partition_point(|p| p.key().artifact() <= artifact);
        &self.instances[start..end]
    }

    /// Merge new instances at their insertion points and return the new store.
    ///
    /// Each index must be the `Err` value returned by [`Self::index_of`] for
    /// that instance's key on `self`. Anything else is a caller bug and panics.
    pub fn add(&self, pairs: Vec<(usize, Arc<PackageInstance>)>) -> InstanceStore {
        let mut pairs = pairs;
        pairs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.key().cmp(b.1.key())));
        for (index, instance) in &pairs {
            assert_eq!(
                self.index_of(instance.key()),
                Err(*index),
                "{} is not a valid insertion point for {}",
                index,
                instance.key()
            );
        }
        assert!(
            pairs.windows(2).all(|w| w[0].1.key() != w[1].1.key()),
            "duplicate keys in instance store batch"
        );

        let mut merged = Vec::with_capacity(self.instances.len() + pairs.len());
        let mut next = 0;
        for (index, instance) in pairs {
            merged.extend_from_slice(&self.instances[next..index]);
            merged.push(instance);
            next = index;
        }
        merged.extend_from_slice(&self.instances[next..]);
        InstanceStore {
            instances: merged.into(),
        }
    }

    /// Insert instances whose keys are not yet stored, computing insertion points.
    pub fn add_sorted(&self, instances: Vec<Arc<PackageInstance>>) -> InstanceStore {
        let pairs = instances
            .into_iter()
            .map(|p| match self.index_of(p.key()) {
                Err(index) => (index, p),
                Ok(_) => panic!("{} is already in the instance store", p.key()),
            })
            .collect();
        self.add(pairs)
    }
}
