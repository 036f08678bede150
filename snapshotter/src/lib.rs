mod error;
mod hash;
mod idmap;
mod layout;
mod mapping;
mod mounts;
mod overlay;
mod paths;
mod types;

pub use error::SnapshotterError;
pub use mapping::{MAPPING_FILE, PathMapping, PathMappingIndex};
pub use mounts::MountComposer;
pub use overlay::OverlaySnapshotter;
pub use paths::PathResolver;
pub use strata_metadata::{Info, Kind, Snapshot, Usage};
pub use types::{
    GID_MAPPING_LABEL, K8S_CONTAINER_NAME_LABEL, K8S_NAMESPACE_LABEL, K8S_POD_NAME_LABEL, Mount,
    SHARED_DISK_PATH_LABEL, SnapshotterConfig, UID_MAPPING_LABEL, UPPERDIR_LABEL,
    USE_SHARED_STORAGE_LABEL,
};
