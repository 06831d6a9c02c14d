//! Error types for voxelvault operations

use thiserror::Error;

/// Main error type for block engine operations
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no version matches UUID prefix '{0}'")]
    UnknownUuid(String),

    #[error("UUID prefix '{0}' matches more than one version")]
    AmbiguousUuid(String),

    #[error("version {0} is locked against writes")]
    VersionLocked(String),

    #[error("unsupported view shape: {0}")]
    UnsupportedShape(String),

    #[error("request of {requested} voxels exceeds the engine cap of {cap}")]
    OversizeRequest { requested: u64, cap: u64 },

    #[error("malformed key: {0}")]
    MalformedKey(String),

    #[error("corrupt block record: {0}")]
    Corrupt(String),

    #[error("unsupported serialization format: {0}")]
    UnsupportedFormat(String),

    #[error("backend failure: {0}")]
    Backend(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Specialized Result type for block engine operations
pub type Result<T> = std::result::Result<T, VaultError>;

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        VaultError::Serialization(err.to_string())
    }
}

impl From<snap::Error> for VaultError {
    fn from(err: snap::Error) -> Self {
        VaultError::Corrupt(err.to_string())
    }
}
