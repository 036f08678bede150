/// Labels recognized on snapshots. The `containerd.io/snapshot/` namespace is
/// passed through verbatim by the runtime above.
pub const USE_SHARED_STORAGE_LABEL: &str = "containerd.io/snapshot/use_shared_storage";
pub const SHARED_DISK_PATH_LABEL: &str = "containerd.io/snapshot/shared_disk_path";
pub const K8S_NAMESPACE_LABEL: &str = "containerd.io/snapshot/k8s_namespace";
pub const K8S_POD_NAME_LABEL: &str = "containerd.io/snapshot/k8s_pod_name";
pub const K8S_CONTAINER_NAME_LABEL: &str = "containerd.io/snapshot/k8s_container_name";
pub const UID_MAPPING_LABEL: &str = "containerd.io/snapshot/uidmapping";
pub const GID_MAPPING_LABEL: &str = "containerd.io/snapshot/gidmapping";
pub const UPPERDIR_LABEL: &str = "containerd.io/snapshot/overlay.upperdir";

#[derive(Debug, Clone)]
pub struct Mount {
    pub mount_type: String,
    pub source: String,
    pub target: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotterConfig {
    /// Relocate snapshot homes to `<shared_storage_base>/l` so that deep
    /// lowerdir chains stay inside the kernel's mount-options page.
    pub short_paths: bool,
    /// Delete orphaned local directories during `remove` instead of leaving
    /// them for the next `cleanup` pass.
    pub sync_remove: bool,
    /// Inject the resolved upperdir as a label on `stat`/`update`/`walk`.
    pub upperdir_label: bool,
    /// Emit `uidmap=`/`gidmap=` mount options from the ID-mapping labels.
    pub remap_ids: bool,
    /// Extra overlay mount options, placed before everything the composer
    /// derives.
    pub mount_options: Vec<String>,
}
