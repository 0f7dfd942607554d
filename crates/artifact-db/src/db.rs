//! The package database: an immutable snapshot of every known package
//! instance and the feeds that expose them.
//!
//! Every state change returns a brand-new [`PackageDb`] behind an `Arc`; the
//! receiver is never modified, so any number of readers can keep querying
//! older snapshots without locking. Unchanged feeds and instances are shared
//! between consecutive snapshots.
//!
//! Invariant: every dependency target of a stored instance is itself stored.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::artifact::{Artifact, ArtifactInstance, ArtifactType, ArtifactTypeRegistry};
use crate::error::{PackageDbError, PackageDbResult, UnresolvedDependency};
use crate::feed::PackageFeed;
use crate::instance::{PackageInstance, PackageInstanceInfo, PackageReference};
use crate::store::InstanceStore;

#[derive(Debug, Clone)]
pub struct PackageDb {
    instances: InstanceStore,
    feeds: Arc<BTreeMap<Artifact, Arc<PackageFeed>>>,
    last_update: DateTime<Utc>,
    version: u64,
}

impl PackageDb {
    /// An empty database at version 0.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            instances: InstanceStore::new(),
            feeds: Arc::new(BTreeMap::new()),
            last_update: DateTime::<Utc>::UNIX_EPOCH,
            version: 0,
        })
    }

    pub(crate) fn from_parts(
        instances: InstanceStore,
        feeds: BTreeMap<Artifact, Arc<PackageFeed>>,
        last_update: DateTime<Utc>,
        version: u64,
    ) -> Self {
        Self {
            instances,
            feeds: Arc::new(feeds),
            last_update,
            version,
        }
    }

    /// Monotonic snapshot number, incremented by every state change.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        self.last_update
    }

    pub fn instances(&self) -> &InstanceStore {
        &self.instances
    }

    pub fn find(&self, key: &ArtifactInstance) -> Option<&Arc<PackageInstance>> {
        self.instances.find(key)
    }

    pub fn instances_of_type(&self, artifact_type: &ArtifactType) -> &[Arc<PackageInstance>] {
        self.instances.get_instances_of_type(artifact_type)
    }

    /// Every registered version of `artifact`, latest first.
    pub fn instances_of(&self, artifact: &Artifact) -> &[Arc<PackageInstance>] {
        self.instances.get_instances(artifact)
    }

    pub fn latest(&self, artifact: &Artifact) -> Option<&Arc<PackageInstance>> {
        self.instances_of(artifact).first()
    }

    pub fn feeds(&self) -> impl Iterator<Item = &Arc<PackageFeed>> {
        self.feeds.values()
    }

    pub fn feed_count(&self) -> usize {
        self.feeds.len()
    }

    pub fn feed(&self, id: &Artifact) -> Option<&Arc<PackageFeed>> {
        self.feeds.get(id)
    }

    /// Look a feed up by its `"Type:Name"` identity, parsed against `registry`.
    ///
    /// Names compare like [`Artifact`] names (Unicode case folding).
    pub fn find_feed(
        &self,
        registry: &ArtifactTypeRegistry,
        typed_name: &str,
    ) -> Option<&Arc<PackageFeed>> {
        let id = Artifact::try_parse(registry, typed_name);
        if !id.is_valid() {
            return None;
        }
        self.feeds.get(&id)
    }

    pub fn feeds_of_type<'a>(
        &'a self,
        artifact_type: &'a ArtifactType,
    ) -> impl Iterator<Item = &'a Arc<PackageFeed>> + 'a {
        self.feeds
            .values()
            .filter(move |f| f.artifact_type() == Some(artifact_type))
    }

    /// Instances that directly reference `key`.
    pub fn dependents_of(&self, key: &ArtifactInstance) -> Vec<Arc<PackageInstance>> {
        self.instances
            .iter()
            .filter(|p| p.dependencies().iter().any(|d| d.target().key() == key))
            .cloned()
            .collect()
    }

    /// Same content with a different `last_update`.
    ///
    /// Returns `self` when the timestamp is unchanged.
    pub fn with_last_update(self: &Arc<Self>, last_update: DateTime<Utc>) -> Arc<Self> {
        if last_update == self.last_update {
            return Arc::clone(self);
        }
        Arc::new(Self {
            instances: self.instances.clone(),
            feeds: Arc::clone(&self.feeds),
            last_update,
            version: self.version + 1,
        })
    }

    /// Register a batch of packages, all or nothing.
    ///
    /// Dependencies are looked up in this database first, then among the
    /// packages that precede them in `infos`. Already registered keys are an
    /// error unless `skip_existing` is set. When nothing new is registered
    /// the very same snapshot is returned and its version is unchanged.
    pub fn add(
        self: &Arc<Self>,
        registry: &ArtifactTypeRegistry,
        infos: &[PackageInstanceInfo],
        skip_existing: bool,
    ) -> PackageDbResult<Arc<Self>> {
        let feeds_per_info = self.validate_batch(registry, infos).inspect_err(|e| {
            error!(event = "package_db.add_rejected", error = %e, "invalid package batch");
        })?;

        let registered_at = Utc::now();
        let mut seen: BTreeSet<&ArtifactInstance> = BTreeSet::new();
        let mut batch_built: BTreeMap<ArtifactInstance, Arc<PackageInstance>> = BTreeMap::new();
        let mut batch_keys: BTreeSet<&ArtifactInstance> = BTreeSet::new();
        let mut unresolved = Vec::new();
        let mut new_feed_members: BTreeMap<Artifact, Vec<Arc<PackageInstance>>> = BTreeMap::new();

        for (info, feeds) in infos.iter().zip(feeds_per_info) {
            let already_known = self.instances.find(&info.key).is_some() || !seen.insert(&info.key);
            if already_known {
                if skip_existing {
                    continue;
                }
                let err = PackageDbError::AlreadyRegistered {
                    key: info.key.to_string(),
                };
                error!(event = "package_db.add_rejected", error = %err, "duplicate package");
                return Err(err);
            }

            let mut dependencies = Vec::with_capacity(info.dependencies.len());
            let mut blocked = false;
            for dep in &info.dependencies {
                let target = self
                    .instances
                    .find(&dep.target)
                    .or_else(|| batch_built.get(&dep.target));
                match target {
                    Some(t) => dependencies.push(PackageReference::new(
                        Arc::clone(t),
                        dep.kind,
                        dep.savors.clone(),
                    )),
                    // Listed earlier in the batch but itself unresolved: already reported.
                    None if batch_keys.contains(&dep.target) => blocked = true,
                    None => {
                        blocked = true;
                        unresolved.push(UnresolvedDependency {
                            package: info.key.to_string(),
                            target: dep.target.to_string(),
                        });
                    }
                }
            }
            batch_keys.insert(&info.key);
            if blocked {
                continue;
            }

            let instance = Arc::new(PackageInstance::new(
                info.key.clone(),
                info.savors.clone(),
                registered_at,
                dependencies,
            ));
            for feed in feeds {
                new_feed_members
                    .entry(feed)
                    .or_default()
                    .push(Arc::clone(&instance));
            }
            batch_built.insert(info.key.clone(), instance);
        }

        if !unresolved.is_empty() {
            let err = PackageDbError::UnresolvedDependencies { unresolved };
            error!(event = "package_db.add_rejected", error = %err, "unresolved dependencies");
            return Err(err);
        }
        if batch_built.is_empty() {
            return Ok(Arc::clone(self));
        }

        let pairs = batch_built
            .into_values()
            .map(|p| match self.instances.index_of(p.key()) {
                Err(index) => (index, p),
                Ok(_) => unreachable!("new package {} already stored", p.key()),
            })
            .collect::<Vec<_>>();
        let added = pairs.len();
        let instances = self.instances.add(pairs);

        let mut feeds = (*self.feeds).clone();
        for (id, members) in new_feed_members {
            let feed = match feeds.get(&id) {
                Some(existing) => existing.with_instances(members),
                None => PackageFeed::new(id.clone()).with_instances(members),
            };
            feeds.insert(id, Arc::new(feed));
        }

        let db = Arc::new(Self {
            instances,
            feeds: Arc::new(feeds),
            last_update: registered_at,
            version: self.version + 1,
        });
        info!(
            event = "package_db.added",
            added,
            total = db.instances.len(),
            version = db.version,
        );
        Ok(db)
    }

    /// Parse keys and feed names of the whole batch before touching anything.
    fn validate_batch(
        &self,
        registry: &ArtifactTypeRegistry,
        infos: &[PackageInstanceInfo],
    ) -> PackageDbResult<Vec<Vec<Artifact>>> {
        infos
            .iter()
            .map(|info| {
                if !info.key.is_valid() {
                    return Err(PackageDbError::InvalidKey {
                        key: info.key.to_string(),
                    });
                }
                if let Some(dep) = info.dependencies.iter().find(|d| !d.target.is_valid()) {
                    return Err(PackageDbError::InvalidDependency {
                        package: info.key.to_string(),
                        target: dep.target.to_string(),
                    });
                }
                info.feed_names
                    .iter()
                    .map(|name| {
                        let feed = Artifact::try_parse(registry, name);
                        if !feed.is_valid() {
                            return Err(PackageDbError::InvalidFeedName {
                                package: info.key.to_string(),
                                feed: name.clone(),
                            });
                        }
                        if feed.artifact_type() != info.key.artifact().artifact_type() {
                            return Err(PackageDbError::FeedTypeMismatch {
                                package: info.key.to_string(),
                                feed: name.clone(),
                            });
                        }
                        Ok(feed)
                    })
                    .collect::<PackageDbResult<Vec<_>>>()
            })
            .collect()
    }
}
