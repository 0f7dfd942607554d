//! Shared "current snapshot" slot.
//!
//! Readers grab the current [`PackageDb`] without locking and keep using it
//! for as long as they like. Publishing is a single reference swap; two
//! writers extending the same base snapshot are detected and the late one
//! is refused, so callers must serialize their writers.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{info, warn};

use crate::db::PackageDb;
use crate::error::{PackageDbError, PackageDbResult};

pub struct SharedPackageDb {
    current: ArcSwap<PackageDb>,
}

impl SharedPackageDb {
    pub fn new(db: Arc<PackageDb>) -> Self {
        Self {
            current: ArcSwap::new(db),
        }
    }

    /// The snapshot currently published.
    pub fn load(&self) -> Arc<PackageDb> {
        self.current.load_full()
    }

    /// Unconditionally publish `db`.
    pub fn publish(&self, db: Arc<PackageDb>) {
        info!(event = "package_db.published", version = db.version());
        self.current.store(db);
    }

    /// Derive a new snapshot from the current one and publish it.
    ///
    /// Fails with [`PackageDbError::ConcurrentUpdate`] when another writer
    /// published in the meantime; nothing is published in that case.
    pub fn update<F>(&self, f: F) -> PackageDbResult<Arc<PackageDb>>
    where
        F: FnOnce(&Arc<PackageDb>) -> PackageDbResult<Arc<PackageDb>>,
    {
        let base = self.current.load_full();
        let next = f(&base)?;
        if Arc::ptr_eq(&base, &next) {
            return Ok(next);
        }
        let prev = self.current.compare_and_swap(&base, Arc::clone(&next));
        if !Arc::ptr_eq(&prev, &base) {
            warn!(
                event = "package_db.concurrent_update",
                expected = base.version(),
                found = prev.version(),
            );
            return Err(PackageDbError::ConcurrentUpdate {
                expected: base.version(),
                found: prev.version(),
            });
        }
        info!(event = "package_db.published", version = next.version());
        Ok(next)
    }
}

impl Default for SharedPackageDb {
    fn default() -> Self {
        Self::new(PackageDb::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactInstance, ArtifactTypeRegistry};
    use crate::instance::PackageInstanceInfo;

    fn setup() -> (ArtifactTypeRegistry, SharedPackageDb) {
        let r = ArtifactTypeRegistry::new();
        r.register("NuGet", true, None).unwrap();
        (r, SharedPackageDb::default())
    }

    #[test]
    fn update_publishes_new_snapshot_and_keeps_old_readable() {
        let (r, shared) = setup();
        let before = shared.load();
        let key = ArtifactInstance::try_parse(&r, "NuGet:A/1.0.0");
        let after = shared
            .update(|db| db.add(&r, &[PackageInstanceInfo::new(key.clone())], false))
            .unwrap();
        assert_eq!(shared.load().version(), 1);
        assert!(Arc::ptr_eq(&shared.load(), &after));
        assert!(before.find(&key).is_none());
    }

    #[test]
    fn update_detects_a_racing_writer() {
        let (r, shared) = setup();
        let key = ArtifactInstance::try_parse(&r, "NuGet:A/1.0.0");
        let err = shared
            .update(|db| {
                // Another writer publishes while this one is working.
                shared.publish(db.with_last_update(chrono::Utc::now()));
                db.add(&r, &[PackageInstanceInfo::new(key.clone())], false)
            })
            .unwrap_err();
        assert!(matches!(err, PackageDbError::ConcurrentUpdate { .. }));
        assert!(shared.load().find(&key).is_none());
    }
}
