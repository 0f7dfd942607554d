//! Error types for artifact-db

use thiserror::Error;

/// Errors raised by the [`crate::ArtifactTypeRegistry`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The type name is empty or contains a reserved character.
    #[error("invalid artifact type name: '{name}'")]
    InvalidName { name: String },

    /// The same type name was registered twice with different settings.
    #[error("artifact type '{name}' is already registered with different settings: {detail}")]
    IncompatibleRegistration { name: String, detail: String },
}

/// A dependency that could be found neither in the database nor earlier in the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedDependency {
    pub package: String,
    pub target: String,
}

impl std::fmt::Display for UnresolvedDependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.package, self.target)
    }
}

fn join_unresolved(unresolved: &[UnresolvedDependency]) -> String {
    unresolved
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors produced by package database operations.
///
/// Any of these returned from [`crate::PackageDb::add`] means the whole batch
/// was rejected and no new snapshot exists.
#[derive(Error, Debug)]
pub enum PackageDbError {
    #[error("invalid package key: '{key}'")]
    InvalidKey { key: String },

    #[error("package {package}: invalid feed name '{feed}'")]
    InvalidFeedName { package: String, feed: String },

    #[error("package {package} cannot be exposed by feed {feed}: artifact types differ")]
    FeedTypeMismatch { package: String, feed: String },

    #[error("package {package}: invalid dependency '{target}'")]
    InvalidDependency { package: String, target: String },

    #[error("invalid savors '{value}': {reason}")]
    InvalidSavors { value: String, reason: String },

    #[error("package {key} is already registered")]
    AlreadyRegistered { key: String },

    #[error("unresolved dependencies: {}", join_unresolved(.unresolved))]
    UnresolvedDependencies { unresolved: Vec<UnresolvedDependency> },

    #[error(
        "package database was updated concurrently (expected version {expected}, found {found})"
    )]
    ConcurrentUpdate { expected: u64, found: u64 },

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while encoding or decoding the binary snapshot format.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unsupported package database format version {0}")]
    UnsupportedVersion(u8),

    #[error("corrupted package database stream: {0}")]
    Corrupted(String),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for package database operations
pub type PackageDbResult<T> = std::result::Result<T, PackageDbError>;
