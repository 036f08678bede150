use crate::error::SnapshotterError;
use crate::hash;
use crate::types::{
    K8S_CONTAINER_NAME_LABEL, K8S_NAMESPACE_LABEL, K8S_POD_NAME_LABEL, SHARED_DISK_PATH_LABEL,
    USE_SHARED_STORAGE_LABEL,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const SNAPSHOTS_DIR: &str = "snapshots";
const SHORT_DIR: &str = "l";

/// Decides where a snapshot's directories live: the canonical
/// `<root>/snapshots/<id>` tree, the short `<shared_storage_base>/l/<id>`
/// tree, or a per-identity directory on shared storage.
#[derive(Debug, Clone)]
pub struct PathResolver {
    canonical_root: PathBuf,
    short_root: Option<PathBuf>,
    layout_base: Option<PathBuf>,
}

impl PathResolver {
    pub fn new(root: &Path, short_paths: bool) -> Result<Self, SnapshotterError> {
        let layout_base = root.parent().and_then(|p| p.parent()).map(Path::to_path_buf);

        let short_root = if short_paths {
            let base = layout_base.clone().ok_or_else(|| {
                SnapshotterError::InvalidArgument(format!(
                    "root {} is too shallow for short snapshot paths",
                    root.display()
                ))
            })?;
            Some(base.join(SHORT_DIR))
        } else {
            None
        };

        Ok(Self {
            canonical_root: root.join(SNAPSHOTS_DIR),
            short_root,
            layout_base,
        })
    }

    /// The legacy long snapshots root, `<root>/snapshots`.
    pub fn canonical_root(&self) -> &Path {
        &self.canonical_root
    }

    /// The short snapshots root, when short paths are enabled.
    pub fn short_root(&self) -> Option<&Path> {
        self.short_root.as_deref()
    }

    /// Where newly created local snapshot homes go.
    pub fn operating_root(&self) -> &Path {
        self.short_root.as_deref().unwrap_or(&self.canonical_root)
    }

    /// The home directory of snapshot `id`: whichever root currently holds
    /// it, else the operating root. Never fails; a home that exists nowhere
    /// yet resolves to where it would be created.
    pub fn home_dir(&self, id: &str) -> PathBuf {
        if let Some(short) = &self.short_root {
            let short_home = short.join(id);
            if short_home.is_dir() {
                return short_home;
            }
            let canonical_home = self.canonical_root.join(id);
            if canonical_home.is_dir() {
                return canonical_home;
            }
            short_home
        } else {
            self.canonical_root.join(id)
        }
    }

    /// Locate an existing `fs` directory for snapshot `id`, trying the short
    /// root first and falling back to the canonical root. Used for parent
    /// stat and lowerdir construction, where the directory must exist.
    pub fn locate_fs(&self, id: &str) -> Result<PathBuf, SnapshotterError> {
        if let Some(short) = &self.short_root {
            let candidate = short.join(id).join("fs");
            if candidate.is_dir() {
                return Ok(candidate);
            }
        }
        let candidate = self.canonical_root.join(id).join("fs");
        if candidate.is_dir() {
            return Ok(candidate);
        }
        Err(SnapshotterError::NotFound(format!(
            "fs directory for snapshot id {id}"
        )))
    }

    /// The shared-storage base directory for a snapshot, or `None` when its
    /// labels do not opt in. Opting in with incomplete identity labels is an
    /// error, as is pointing the shared base at the snapshotter's own layout.
    pub fn shared_base(
        &self,
        id: &str,
        labels: &HashMap<String, String>,
    ) -> Result<Option<PathBuf>, SnapshotterError> {
        if labels.get(USE_SHARED_STORAGE_LABEL).map(String::as_str) != Some("true") {
            return Ok(None);
        }

        let disk = labels.get(SHARED_DISK_PATH_LABEL);
        let namespace = labels.get(K8S_NAMESPACE_LABEL);
        let pod_name = labels.get(K8S_POD_NAME_LABEL);
        let container_name = labels.get(K8S_CONTAINER_NAME_LABEL);

        let (Some(disk), Some(namespace), Some(pod_name), Some(container_name)) =
            (disk, namespace, pod_name, container_name)
        else {
            return Err(SnapshotterError::InvalidArgument(
                "missing one or more required labels for shared storage path".to_string(),
            ));
        };
        if disk.is_empty()
            || namespace.is_empty()
            || pod_name.is_empty()
            || container_name.is_empty()
            || id.is_empty()
        {
            return Err(SnapshotterError::InvalidArgument(
                "missing one or more required labels for shared storage path".to_string(),
            ));
        }

        let disk_path = Path::new(disk);
        if !disk_path.is_absolute() {
            return Err(SnapshotterError::InvalidArgument(format!(
                "shared disk path must be absolute: {disk}"
            )));
        }
        if let Some(base) = &self.layout_base
            && disk_path == base.as_path()
        {
            return Err(SnapshotterError::SharedPathConflict(disk.clone()));
        }

        let pod_hash = hash::pod_hash(namespace, pod_name, container_name);
        let snapshot_hash = hash::snapshot_hash(id);
        Ok(Some(disk_path.join(pod_hash).join(snapshot_hash)))
    }

    /// The writable (or frozen) layer directory of a snapshot.
    pub fn upper_path(
        &self,
        id: &str,
        labels: &HashMap<String, String>,
    ) -> Result<PathBuf, SnapshotterError> {
        match self.shared_base(id, labels)? {
            Some(base) => Ok(base.join("fs")),
            None => Ok(self.home_dir(id).join("fs")),
        }
    }

    /// The overlay scratch directory of a snapshot.
    pub fn work_path(
        &self,
        id: &str,
        labels: &HashMap<String, String>,
    ) -> Result<PathBuf, SnapshotterError> {
        match self.shared_base(id, labels)? {
            Some(base) => Ok(base.join("work")),
            None => Ok(self.home_dir(id).join("work")),
        }
    }
}
