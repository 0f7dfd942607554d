//! On-disk persistence of package database snapshots.

use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::artifact::ArtifactTypeRegistry;
use crate::codec;
use crate::db::PackageDb;
use crate::error::PackageDbResult;

/// A snapshot file written atomically (temp file + rename).
#[derive(Debug, Clone)]
pub struct PackageDbFile {
    path: PathBuf,
}

impl PackageDbFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    pub fn save(&self, db: &PackageDb) -> PackageDbResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp = self.temp_path();
        {
            let mut out = BufWriter::new(fs::File::create(&temp)?);
            codec::write_db(db, &mut out)?;
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&temp, &self.path)?;
        info!(
            event = "package_db.saved",
            path = %self.path.display(),
            version = db.version(),
            instances = db.instances().len(),
        );
        Ok(())
    }

    pub fn load(&self, registry: &ArtifactTypeRegistry) -> PackageDbResult<Arc<PackageDb>> {
        let input = BufReader::new(fs::File::open(&self.path)?);
        let db = codec::read_db(registry, input)?;
        debug!(path = %self.path.display(), version = db.version(), "package database loaded");
        Ok(Arc::new(db))
    }

    /// Load the snapshot, or an empty database when the file does not exist yet.
    pub fn load_or_empty(
        &self,
        registry: &ArtifactTypeRegistry,
    ) -> PackageDbResult<Arc<PackageDb>> {
        if self.exists() {
            self.load(registry)
        } else {
            Ok(PackageDb::empty())
        }
    }
}
