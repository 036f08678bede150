use strata_metadata::MetadataError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnapshotterError {
    #[error("snapshot not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("shared path conflicts with snapshotter layout: {0}")]
    SharedPathConflict(String),

    #[error("filesystem does not support d_type at {0}; reformat with ftype=1 if this is xfs")]
    FilesystemUnsupported(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
