// src/error.rs

use std::fmt;
use thiserror::Error;

/// Core error types for bundlereg
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),

    /// A bundle source could not be turned into a bundle record
    #[error("Failed to parse bundle at {path}: {reason}")]
    Parse { path: String, reason: String },

    /// A manifest list document is incomplete or inconsistent
    #[error("Manifest list error: {0}")]
    ManifestList(String),

    /// Structural violation of an update graph
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// An overwrite request failed one of its equality checks
    #[error("Overwrite rejected: {0}")]
    Overwrite(String),

    /// The image is already referenced by a stored or batched bundle
    #[error("Bundle {0} already exists")]
    BundleImageAlreadyAdded(String),

    /// A bundle with the same package and name is already stored
    #[error("Bundle {bundle} already added to package {package}")]
    PackageVersionAlreadyAdded { package: String, bundle: String },

    /// A fixed-point pass inserted nothing for a package
    #[error("No bundle of package {package} can be added: {}", list(.reasons))]
    Unsatisfiable { package: String, reasons: Vec<Error> },

    /// The package has never been loaded
    #[error("Package {0} not found in database")]
    PackageNotInDatabase(String),

    /// The package exists but has no such channel
    #[error("no entry found for {package} {channel}")]
    ChannelNotFound { package: String, channel: String },

    /// Unknown update mode string
    #[error("Unsupported update mode: {0}")]
    UnsupportedMode(String),

    /// Several independent failures
    #[error("{}", list(.0))]
    Aggregate(Vec<Error>),
}

/// Structural errors raised while building or validating an update graph
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("missing package property")]
    MissingPackageProperty,

    #[error("too many package properties, must specify exactly one")]
    TooManyPackageProperties,

    #[error("package property version does not match bundle version: ({property} != {bundle})")]
    VersionMismatch { property: String, bundle: String },

    #[error("invalid property {kind}: {reason}")]
    InvalidProperty { kind: String, reason: String },

    #[error("bundle {bundle} has invalid version {version:?}: {reason}")]
    InvalidVersion {
        bundle: String,
        version: String,
        reason: String,
    },

    #[error("bundle {bundle} has invalid skip range {range:?}: {reason}")]
    InvalidSkipRange {
        bundle: String,
        range: String,
        reason: String,
    },

    #[error("bundle {bundle} declares no channels")]
    NoChannels { bundle: String },

    #[error("bundle {bundle} replaces {replaces}, which would create a cycle in channel {channel}")]
    Cycle {
        bundle: String,
        replaces: String,
        channel: String,
    },

    #[error("bundle {bundle} is already present in channel {channel}")]
    DuplicateBundle { bundle: String, channel: String },

    #[error("bundle version {version} already exists in channel {channel} of package {package}")]
    DuplicateVersion {
        package: String,
        channel: String,
        version: String,
    },

    #[error("bundle {bundle} version {version} must be greater than {replaces} version {replaces_version}")]
    VersionNotIncreasing {
        bundle: String,
        version: String,
        replaces: String,
        replaces_version: String,
    },

    #[error("bundle {replaces} in channel {channel} is already replaced by {replaced_by}, {bundle} cannot replace it")]
    AlreadyReplaced {
        bundle: String,
        replaces: String,
        replaced_by: String,
        channel: String,
    },

    #[error("bundle {bundle} specifies a non-existent replacement {replaces}")]
    MissingReplacement { bundle: String, replaces: String },

    #[error("bundle {bundle} has no predecessor in channel {channel}, which already has head {head}")]
    MissingPredecessor {
        bundle: String,
        channel: String,
        head: String,
    },

    #[error("unknown bundle {bundle} in channel {channel}")]
    UnknownBundle { bundle: String, channel: String },

    #[error("channel {channel} has {heads} heads, expected exactly one")]
    HeadCount { channel: String, heads: usize },

    #[error("channel {channel} replace chain from {head} does not visit every bundle exactly once")]
    BrokenChain { channel: String, head: String },

    #[error("channel {channel} head is {found}, expected {expected}")]
    HeadMismatch {
        channel: String,
        expected: String,
        found: String,
    },

    #[error("default channel {channel:?} of package {package} is not one of its channels")]
    DefaultChannelMissing { package: String, channel: String },
}

fn list(errors: &[Error]) -> String {
    let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    match messages.len() {
        1 => messages.into_iter().collect(),
        _ => format!("[{}]", messages.join(", ")),
    }
}

impl Error {
    /// Fold independent failures: none is success, one is returned as-is
    pub fn from_errors(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(errors)),
        }
    }

    /// Whether this is a recoverable "not found" condition
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::PackageNotInDatabase(_) | Error::ChannelNotFound { .. }
        )
    }

    /// Number of leaf causes carried by this error
    pub fn cause_count(&self) -> usize {
        match self {
            Error::Aggregate(errors) => errors.iter().map(Error::cause_count).sum(),
            Error::Unsatisfiable { reasons, .. } => reasons.len().max(1),
            _ => 1,
        }
    }

    pub(crate) fn parse(path: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Error::Parse {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias using bundlereg's Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_errors_folds_by_count() {
        assert!(Error::from_errors(Vec::new()).is_ok());

        let single = Error::from_errors(vec![Error::Overwrite("replaces differ".to_string())]);
        assert!(matches!(single, Err(Error::Overwrite(_))));

        let many = Error::from_errors(vec![
            Error::Overwrite("replaces differ".to_string()),
            Error::Overwrite("skips differ".to_string()),
        ])
        .unwrap_err();
        assert_eq!(many.cause_count(), 2);
        assert_eq!(
            many.to_string(),
            "[Overwrite rejected: replaces differ, Overwrite rejected: skips differ]"
        );
    }

    #[test]
    fn test_not_found_is_distinguishable() {
        assert!(Error::PackageNotInDatabase("etcd".to_string()).is_not_found());
        assert!(!Error::InitError("boom".to_string()).is_not_found());
    }

    #[test]
    fn test_graph_error_converts() {
        let err: Error = GraphError::MissingPackageProperty.into();
        assert_eq!(err.to_string(), "missing package property");
    }
}
