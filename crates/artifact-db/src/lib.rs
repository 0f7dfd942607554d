//! Artifact-DB: immutable package database for WorldBuild
//!
//! Records every known artifact instance, its resolved dependencies and the
//! feeds that expose it. Every mutation yields a new snapshot; old snapshots
//! stay valid and can be read concurrently without locks.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: dependency-closure integrity, copy-on-write snapshots, binary format.
//!
//! ## Key Components
//!
//! - `ArtifactTypeRegistry`, `Artifact`, `ArtifactInstance`: identity
//! - `InstanceStore`: sorted instance sequence with binary-search lookup
//! - `PackageFeed`: named subsets of instances
//! - `PackageDb`: the snapshot aggregate and its batch registration
//! - `codec`: pooled binary serialization
//! - `SharedPackageDb`, `PackageDbFile`: publishing and persistence

mod artifact;
pub mod codec;
mod db;
mod error;
mod feed;
mod file;
mod instance;
mod savor;
mod shared;
mod store;

pub use artifact::{Artifact, ArtifactInstance, ArtifactType, ArtifactTypeRegistry};
pub use db::PackageDb;
pub use error::{CodecError, PackageDbError, PackageDbResult, RegistryError, UnresolvedDependency};
pub use feed::PackageFeed;
pub use file::PackageDbFile;
pub use instance::{
    DependencyDescriptor, DependencyInfo, DependencyKind, PackageDescriptor, PackageInstance,
    PackageInstanceInfo, PackageReference,
};
pub use savor::{SavorContext, Savors};
pub use shared::SharedPackageDb;
pub use store::InstanceStore;

/// Re-exported so callers build versions with the same crate.
pub use semver::Version;
