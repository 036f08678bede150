use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("snapshot not found: {0}")]
    NotFound(String),

    #[error("snapshot already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("snapshot has dependents and cannot be removed: {0}")]
    HasDependents(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
