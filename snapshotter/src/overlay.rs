use crate::error::SnapshotterError;
use crate::hash;
use crate::idmap;
use crate::layout;
use crate::mapping::PathMappingIndex;
use crate::mounts::MountComposer;
use crate::paths::PathResolver;
use crate::types::{
    GID_MAPPING_LABEL, K8S_CONTAINER_NAME_LABEL, K8S_NAMESPACE_LABEL, K8S_POD_NAME_LABEL, Mount,
    SnapshotterConfig, UID_MAPPING_LABEL, UPPERDIR_LABEL,
};
use std::collections::{HashMap, HashSet};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use strata_metadata::{Info, Kind, MetaStore, Snapshot, Usage};
use tokio::fs;

const METADATA_FILE: &str = "metadata.db";

/// Overlayfs snapshotter with dual-rooted snapshot homes and optional
/// shared-storage placement of writable layers.
pub struct OverlaySnapshotter {
    root: PathBuf,
    store: MetaStore,
    resolver: PathResolver,
    mappings: PathMappingIndex,
    config: SnapshotterConfig,
    default_options: Vec<String>,
}

impl OverlaySnapshotter {
    pub async fn new(
        root: impl AsRef<Path>,
        config: SnapshotterConfig,
    ) -> Result<Self, SnapshotterError> {
        let root = root.as_ref().to_path_buf();
        layout::create_dir_mode(&root, 0o700).await?;
        layout::verify_dtype(&root).await?;

        let store = MetaStore::open(root.join(METADATA_FILE)).await?;

        let mut default_options = config.mount_options.clone();
        if strata_mount::needs_userxattr() && !default_options.iter().any(|o| o == "userxattr") {
            tracing::debug!("running inside a user namespace, enabling userxattr");
            default_options.push("userxattr".to_string());
        }
        if strata_mount::supports_index() && !default_options.iter().any(|o| o.starts_with("index="))
        {
            default_options.push("index=off".to_string());
        }

        let resolver = PathResolver::new(&root, config.short_paths)?;
        if let Some(short) = resolver.short_root() {
            layout::create_dir_mode(short, 0o700).await?;
        }
        layout::create_dir_mode(resolver.canonical_root(), 0o700).await?;

        if let Some(short) = resolver.short_root() {
            layout::migrate_snapshots(resolver.canonical_root(), short).await?;
        }

        Ok(Self {
            root,
            store,
            resolver,
            mappings: PathMappingIndex::new(),
            config,
            default_options,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub async fn stat(&self, key: &str) -> Result<Info, SnapshotterError> {
        let tx = self.store.read().await;
        let (snapshot, mut info, _) = tx.get(key)?;
        drop(tx);

        if self.config.upperdir_label {
            self.inject_upperdir(&snapshot.id, &mut info);
        }
        Ok(info)
    }

    pub async fn update(
        &self,
        info: &Info,
        fieldpaths: &[String],
    ) -> Result<Info, SnapshotterError> {
        let mut tx = self.store.write().await;
        let mut updated = tx.update(info, fieldpaths)?;
        let (snapshot, _, _) = tx.get(&updated.name)?;
        tx.commit().await?;

        if self.config.upperdir_label {
            self.inject_upperdir(&snapshot.id, &mut updated);
        }
        Ok(updated)
    }

    pub async fn usage(&self, key: &str) -> Result<Usage, SnapshotterError> {
        let tx = self.store.read().await;
        let (snapshot, info, usage) = tx.get(key)?;
        drop(tx);

        if snapshot.kind == Kind::Committed {
            return Ok(usage);
        }
        // no dual-location guessing here; counting the wrong tree would be
        // worse than failing
        let upper = self.resolver.upper_path(&snapshot.id, &info.labels)?;
        directory_usage(&upper).await
    }

    pub async fn prepare(
        &self,
        key: &str,
        parent: Option<&str>,
        labels: HashMap<String, String>,
    ) -> Result<Vec<Mount>, SnapshotterError> {
        self.create_snapshot(Kind::Active, key, parent, labels).await
    }

    pub async fn view(
        &self,
        key: &str,
        parent: Option<&str>,
        labels: HashMap<String, String>,
    ) -> Result<Vec<Mount>, SnapshotterError> {
        self.create_snapshot(Kind::View, key, parent, labels).await
    }

    pub async fn mounts(&self, key: &str) -> Result<Vec<Mount>, SnapshotterError> {
        let tx = self.store.read().await;
        let (snapshot, info, _) = tx.get(key)?;
        drop(tx);
        self.composer().compose(&snapshot, &info)
    }

    pub async fn commit(
        &self,
        name: &str,
        key: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), SnapshotterError> {
        let mut tx = self.store.write().await;
        let (snapshot, info, _) = tx.get(key)?;
        let upper = self.resolver.upper_path(&snapshot.id, &info.labels)?;
        let usage = directory_usage(&upper).await?;
        tx.commit_active(key, name, usage, labels)?;
        tx.commit().await?;
        Ok(())
    }

    /// Remove a snapshot. Local directories are deleted synchronously or
    /// left for `cleanup` depending on configuration; a shared-storage base
    /// is always retained so a later incarnation can recover its state.
    pub async fn remove(&self, key: &str) -> Result<(), SnapshotterError> {
        let pre = {
            let tx = self.store.read().await;
            tx.get(key).ok()
        };
        let shared_base = pre.as_ref().and_then(|(snapshot, info, _)| {
            match self.resolver.shared_base(&snapshot.id, &info.labels) {
                Ok(base) => base,
                Err(e) => {
                    tracing::debug!("could not resolve shared base for {}: {}", key, e);
                    None
                }
            }
        });

        let mut staged = Vec::new();
        {
            let mut tx = self.store.write().await;
            let (id, _) = tx.remove(key)?;
            if self.config.sync_remove {
                let ids = tx.ids();
                staged = self.cleanup_candidates(&ids).await?;
            }
            tx.commit().await?;

            if let Some(base) = &shared_base {
                tracing::info!(
                    "retaining shared storage for removed snapshot {} at {:?}",
                    id,
                    base
                );
            }
        }

        for dir in staged {
            if let Err(e) = fs::remove_dir_all(&dir).await {
                tracing::warn!("failed to remove snapshot directory {:?}: {}", dir, e);
            }
        }
        Ok(())
    }

    pub async fn walk<F>(&self, mut f: F) -> Result<(), SnapshotterError>
    where
        F: FnMut(&Info) -> Result<(), SnapshotterError>,
    {
        let tx = self.store.read().await;
        tx.walk(|info| {
            if self.config.upperdir_label {
                let mut info = info.clone();
                if let Ok((snapshot, _, _)) = tx.get(&info.name) {
                    self.inject_upperdir(&snapshot.id, &mut info);
                }
                f(&info)
            } else {
                f(info)
            }
        })
    }

    /// Reconcile on-disk snapshot directories with the metadata id set. The
    /// candidate set is frozen under a write transaction so a concurrent
    /// create cannot both hold an id and be swept.
    pub async fn cleanup(&self) -> Result<(), SnapshotterError> {
        let candidates = {
            let tx = self.store.write().await;
            let ids = tx.ids();
            self.cleanup_candidates(&ids).await?
        };

        for dir in candidates {
            match fs::remove_dir_all(&dir).await {
                Ok(()) => tracing::debug!("removed orphaned snapshot directory {:?}", dir),
                Err(e) => tracing::warn!("failed to remove snapshot directory {:?}: {}", dir, e),
            }
        }
        Ok(())
    }

    async fn create_snapshot(
        &self,
        kind: Kind,
        key: &str,
        parent: Option<&str>,
        labels: HashMap<String, String>,
    ) -> Result<Vec<Mount>, SnapshotterError> {
        let mut tx = self.store.write().await;
        let snapshot = tx.create(kind, key, parent, labels)?;
        let (_, info, _) = tx.get(key)?;

        let owner = self.resolve_owner(&snapshot, &info).await?;
        let created = self.create_directories(&snapshot, &info, owner).await?;

        if let Err(e) = tx.commit().await {
            for dir in &created {
                let _ = fs::remove_dir_all(dir).await;
            }
            return Err(e.into());
        }

        self.composer().compose(&snapshot, &info)
    }

    /// Work out the uid/gid for fresh upper directories: an explicit mapping
    /// from labels wins, else the nearest parent's ownership is inherited.
    async fn resolve_owner(
        &self,
        snapshot: &Snapshot,
        info: &Info,
    ) -> Result<Option<(u32, u32)>, SnapshotterError> {
        if let (Some(uid_mapping), Some(gid_mapping)) = (
            info.labels.get(UID_MAPPING_LABEL),
            info.labels.get(GID_MAPPING_LABEL),
        ) {
            return Ok(Some(idmap::root_pair(uid_mapping, gid_mapping)?));
        }

        if let Some(parent_id) = snapshot.parent_ids.first() {
            let parent_fs = self.resolver.locate_fs(parent_id)?;
            let metadata = fs::metadata(&parent_fs).await?;
            if !metadata.is_dir() {
                return Err(SnapshotterError::Internal(format!(
                    "parent fs at {:?} is not a directory",
                    parent_fs
                )));
            }
            return Ok(Some((metadata.uid(), metadata.gid())));
        }

        Ok(None)
    }

    /// Create the snapshot's directories. Returns the paths a failed
    /// transaction commit must sweep away.
    async fn create_directories(
        &self,
        snapshot: &Snapshot,
        info: &Info,
        owner: Option<(u32, u32)>,
    ) -> Result<Vec<PathBuf>, SnapshotterError> {
        match self.resolver.shared_base(&snapshot.id, &info.labels)? {
            Some(base) if snapshot.kind == Kind::Active => {
                self.create_shared_directories(&base, owner).await?;
                self.register_mapping(&base, snapshot, info).await;
                let marker = self.ensure_home_marker(&snapshot.id).await;
                Ok(vec![base, marker])
            }
            Some(_) => {
                // a shared view reads the retained upper of a prior
                // incarnation; nothing to create beyond the marker
                let marker = self.ensure_home_marker(&snapshot.id).await;
                Ok(vec![marker])
            }
            None => {
                let home = self.create_local_home(snapshot, owner).await?;
                Ok(vec![home])
            }
        }
    }

    async fn create_shared_directories(
        &self,
        base: &Path,
        owner: Option<(u32, u32)>,
    ) -> Result<(), SnapshotterError> {
        // the pod-hash directory may be shared with other snapshots of the
        // same pod; remember whether this create materialized it
        let pod_dir = base.parent().map(Path::to_path_buf);
        let pod_dir_created = pod_dir.as_deref().is_some_and(|p| !p.exists());

        let result: Result<(), SnapshotterError> = async {
            layout::create_dir_mode(&base.join("fs"), 0o755).await?;
            layout::create_dir_mode(&base.join("work"), 0o711).await?;
            if let Some((uid, gid)) = owner {
                std::os::unix::fs::lchown(base.join("fs"), Some(uid), Some(gid))?;
            }
            Ok(())
        }
        .await;

        if result.is_err() {
            // sweep everything this attempt created, up to but not past the
            // shared disk path
            let _ = fs::remove_dir_all(base).await;
            if pod_dir_created
                && let Some(pod_dir) = &pod_dir
            {
                // non-recursive: a concurrent snapshot of the same pod may
                // have claimed the directory in the meantime
                let _ = fs::remove_dir(pod_dir).await;
            }
        }
        result
    }

    async fn register_mapping(&self, base: &Path, snapshot: &Snapshot, info: &Info) {
        let Some(disk) = base.parent().and_then(|p| p.parent()) else {
            return;
        };
        let (Some(namespace), Some(pod_name), Some(container_name)) = (
            info.labels.get(K8S_NAMESPACE_LABEL),
            info.labels.get(K8S_POD_NAME_LABEL),
            info.labels.get(K8S_CONTAINER_NAME_LABEL),
        ) else {
            return;
        };

        if let Err(e) = self.mappings.load(disk).await {
            tracing::debug!("could not load path mappings from {:?}: {}", disk, e);
        }

        let pod_hash = hash::pod_hash(namespace, pod_name, container_name);
        let snapshot_hash = hash::snapshot_hash(&snapshot.id);
        if let Err(e) = self
            .mappings
            .register(
                disk,
                &pod_hash,
                &snapshot_hash,
                namespace,
                pod_name,
                container_name,
                &snapshot.id,
            )
            .await
        {
            // the index is advisory
            tracing::warn!(
                "failed to persist path mapping for snapshot {}: {}",
                snapshot.id,
                e
            );
        }
    }

    async fn ensure_home_marker(&self, id: &str) -> PathBuf {
        let home = self.resolver.operating_root().join(id);
        if let Err(e) = layout::create_dir_mode(&home, 0o700).await {
            tracing::warn!("failed to create snapshot home marker {:?}: {}", home, e);
        }
        home
    }

    async fn create_local_home(
        &self,
        snapshot: &Snapshot,
        owner: Option<(u32, u32)>,
    ) -> Result<PathBuf, SnapshotterError> {
        let snapshots_root = self.resolver.operating_root().to_path_buf();
        let temp = tempfile::Builder::new()
            .prefix("new-")
            .tempdir_in(&snapshots_root)?;

        let upper = temp.path().join("fs");
        layout::create_dir_mode(&upper, 0o755).await?;
        if snapshot.kind == Kind::Active {
            layout::create_dir_mode(&temp.path().join("work"), 0o711).await?;
        }
        if let Some((uid, gid)) = owner {
            std::os::unix::fs::lchown(&upper, Some(uid), Some(gid))?;
        }

        let home = snapshots_root.join(&snapshot.id);
        fs::rename(temp.path(), &home).await?;
        let _ = temp.keep();
        Ok(home)
    }

    async fn cleanup_candidates(
        &self,
        ids: &HashSet<String>,
    ) -> Result<Vec<PathBuf>, SnapshotterError> {
        let mut roots = vec![self.resolver.canonical_root().to_path_buf()];
        if let Some(short) = self.resolver.short_root() {
            roots.push(short.to_path_buf());
        }

        let mut candidates = Vec::new();
        for root in roots {
            let mut entries = match fs::read_dir(&root).await {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if !ids.contains(&name) {
                    candidates.push(entry.path());
                }
            }
        }
        Ok(candidates)
    }

    fn composer(&self) -> MountComposer<'_> {
        MountComposer::new(&self.resolver, &self.default_options, self.config.remap_ids)
    }

    fn inject_upperdir(&self, id: &str, info: &mut Info) {
        let upper = match self.resolver.upper_path(id, &info.labels) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(
                    "failed to resolve upperdir for snapshot {}: {}, using canonical fallback",
                    info.name,
                    e
                );
                self.resolver.canonical_root().join(id).join("fs")
            }
        };
        info.labels.insert(
            UPPERDIR_LABEL.to_string(),
            upper.to_string_lossy().into_owned(),
        );
    }
}

async fn directory_usage(dir: &Path) -> Result<Usage, SnapshotterError> {
    if !dir.exists() {
        return Ok(Usage::default());
    }

    let mut size = 0i64;
    let mut inodes = 0i64;
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        let mut entries = fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            inodes += 1;
            let metadata = entry.metadata().await?;
            if metadata.is_dir() {
                stack.push(entry.path());
            } else {
                size += metadata.len() as i64;
            }
        }
    }

    Ok(Usage { size, inodes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SHARED_DISK_PATH_LABEL, USE_SHARED_STORAGE_LABEL};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    async fn new_snapshotter(config: SnapshotterConfig) -> (OverlaySnapshotter, TempDir) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("containerd").join("overlayfs");
        let snapshotter = OverlaySnapshotter::new(&root, config).await.unwrap();
        (snapshotter, dir)
    }

    fn shared_labels(disk: &Path) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert(USE_SHARED_STORAGE_LABEL.to_string(), "true".to_string());
        labels.insert(
            SHARED_DISK_PATH_LABEL.to_string(),
            disk.to_string_lossy().into_owned(),
        );
        labels.insert(K8S_NAMESPACE_LABEL.to_string(), "default".to_string());
        labels.insert(K8S_POD_NAME_LABEL.to_string(), "nb-test-0".to_string());
        labels.insert(K8S_CONTAINER_NAME_LABEL.to_string(), "pytorch".to_string());
        labels
    }

    async fn commit_chain(snapshotter: &OverlaySnapshotter, names: &[&str]) {
        let mut parent: Option<String> = None;
        for name in names {
            let key = format!("{name}-active");
            snapshotter
                .prepare(&key, parent.as_deref(), HashMap::new())
                .await
                .unwrap();
            snapshotter
                .commit(name, &key, HashMap::new())
                .await
                .unwrap();
            parent = Some(name.to_string());
        }
    }

    fn mode_of(path: &Path) -> u32 {
        std::fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[tokio::test]
    async fn test_prepare_local_base_is_rw_bind() {
        let (snapshotter, _dir) = new_snapshotter(SnapshotterConfig::default()).await;

        let mounts = snapshotter.prepare("k1", None, HashMap::new()).await.unwrap();

        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].mount_type, "bind");
        let expected = snapshotter.resolver.canonical_root().join("1").join("fs");
        assert_eq!(mounts[0].source, expected.to_string_lossy());
        assert_eq!(mounts[0].options, vec!["rw".to_string(), "rbind".to_string()]);
        assert!(expected.is_dir());
        assert!(expected.parent().unwrap().join("work").is_dir());

        snapshotter.commit("img1", "k1", HashMap::new()).await.unwrap();
        let info = snapshotter.stat("img1").await.unwrap();
        assert_eq!(info.kind, Kind::Committed);
        assert!(snapshotter.stat("k1").await.is_err());
    }

    #[tokio::test]
    async fn test_prepare_with_parents_uses_short_lowerdirs() {
        let config = SnapshotterConfig {
            short_paths: true,
            ..Default::default()
        };
        let (snapshotter, dir) = new_snapshotter(config).await;
        commit_chain(&snapshotter, &["a", "b", "c"]).await;

        let mounts = snapshotter
            .prepare("k2", Some("c"), HashMap::new())
            .await
            .unwrap();

        assert_eq!(mounts[0].mount_type, "overlay");
        assert_eq!(mounts[0].source, "overlay");
        let short = dir.path().join("l");
        let lowerdir = mounts[0]
            .options
            .iter()
            .find(|o| o.starts_with("lowerdir="))
            .unwrap();
        assert_eq!(
            *lowerdir,
            format!(
                "lowerdir={}:{}:{}",
                short.join("3/fs").display(),
                short.join("2/fs").display(),
                short.join("1/fs").display()
            )
        );
        assert!(
            mounts[0]
                .options
                .iter()
                .any(|o| *o == format!("upperdir={}", short.join("4/fs").display()))
        );
        assert!(
            mounts[0]
                .options
                .iter()
                .any(|o| *o == format!("workdir={}", short.join("4/work").display()))
        );
    }

    #[tokio::test]
    async fn test_mounts_is_pure_and_matches_prepare() {
        let (snapshotter, _dir) = new_snapshotter(SnapshotterConfig::default()).await;
        commit_chain(&snapshotter, &["base"]).await;

        let prepared = snapshotter
            .prepare("k", Some("base"), HashMap::new())
            .await
            .unwrap();
        let mounted = snapshotter.mounts("k").await.unwrap();
        let again = snapshotter.mounts("k").await.unwrap();

        assert_eq!(prepared[0].options, mounted[0].options);
        assert_eq!(mounted[0].options, again[0].options);
        assert_eq!(prepared[0].mount_type, mounted[0].mount_type);
    }

    #[tokio::test]
    async fn test_view_of_committed_parent_is_ro_bind() {
        let (snapshotter, _dir) = new_snapshotter(SnapshotterConfig::default()).await;
        commit_chain(&snapshotter, &["base"]).await;

        let mounts = snapshotter
            .view("v", Some("base"), HashMap::new())
            .await
            .unwrap();

        assert_eq!(mounts[0].mount_type, "bind");
        assert_eq!(mounts[0].options, vec!["ro".to_string(), "rbind".to_string()]);
        let info = snapshotter.stat("v").await.unwrap();
        assert_eq!(info.kind, Kind::View);
    }

    #[tokio::test]
    async fn test_shared_active_creates_shared_layout() {
        let (snapshotter, _dir) = new_snapshotter(SnapshotterConfig::default()).await;
        let disk = TempDir::new().unwrap();
        commit_chain(&snapshotter, &["base"]).await;

        let mounts = snapshotter
            .prepare("k3", Some("base"), shared_labels(disk.path()))
            .await
            .unwrap();

        // id 2: "base" took 1
        let base = disk.path().join("6fb76255").join("d4735e3a");
        assert!(base.join("fs").is_dir());
        assert!(base.join("work").is_dir());
        assert_eq!(mode_of(&base.join("fs")), 0o755);
        assert_eq!(mode_of(&base.join("work")), 0o711);

        let upperdir = mounts[0]
            .options
            .iter()
            .find(|o| o.starts_with("upperdir="))
            .unwrap();
        assert_eq!(*upperdir, format!("upperdir={}", base.join("fs").display()));

        // local home marker for external tooling
        let marker = snapshotter.resolver.canonical_root().join("2");
        assert!(marker.is_dir());
        assert_eq!(mode_of(&marker), 0o700);

        // reverse index records the identity
        let content =
            std::fs::read_to_string(disk.path().join(crate::mapping::MAPPING_FILE)).unwrap();
        assert!(content.contains("6fb76255/d4735e3a"));
        assert!(content.contains("\"pod_name\": \"nb-test-0\""));
    }

    #[tokio::test]
    async fn test_shared_remove_retains_base() {
        let (snapshotter, _dir) = new_snapshotter(SnapshotterConfig::default()).await;
        let disk = TempDir::new().unwrap();

        snapshotter
            .prepare("k3", None, shared_labels(disk.path()))
            .await
            .unwrap();
        let base = disk.path().join("6fb76255").join("6b86b273");
        std::fs::write(base.join("fs").join("state"), b"checkpoint").unwrap();

        snapshotter.remove("k3").await.unwrap();

        assert!(snapshotter.stat("k3").await.is_err());
        assert!(base.join("fs").join("state").exists());
    }

    #[tokio::test]
    async fn test_failed_shared_create_sweeps_base() {
        let (snapshotter, _dir) = new_snapshotter(SnapshotterConfig::default()).await;
        let disk = TempDir::new().unwrap();

        // plant a file where the work directory must go so creation fails
        // after fs already exists
        let base = disk.path().join("6fb76255").join("6b86b273");
        std::fs::create_dir_all(&base).unwrap();
        std::fs::write(base.join("work"), b"").unwrap();

        let err = snapshotter
            .prepare("k", None, shared_labels(disk.path()))
            .await;
        assert!(err.is_err());

        // the snapshot base was swept whole; the pre-existing pod directory
        // stays, and the metadata rolled back
        assert!(!base.exists());
        assert!(disk.path().join("6fb76255").is_dir());
        assert!(snapshotter.stat("k").await.is_err());
    }

    #[tokio::test]
    async fn test_shared_conflict_is_fatal_and_clean() {
        let config = SnapshotterConfig {
            short_paths: true,
            ..Default::default()
        };
        let (snapshotter, dir) = new_snapshotter(config).await;

        // shared_disk_path pointed at the snapshotter's own storage base
        let err = snapshotter
            .prepare("k4", None, shared_labels(dir.path()))
            .await;
        assert!(matches!(err, Err(SnapshotterError::SharedPathConflict(_))));

        // metadata rolled back, nothing created on disk
        assert!(snapshotter.stat("k4").await.is_err());
        assert!(!dir.path().join("6fb76255").exists());

        // and the key is reusable afterwards
        snapshotter.prepare("k4", None, HashMap::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_dual_location_fallback_for_unmigrated_parent() {
        let config = SnapshotterConfig {
            short_paths: true,
            ..Default::default()
        };
        let (snapshotter, dir) = new_snapshotter(config).await;
        commit_chain(&snapshotter, &["base"]).await;

        // simulate a parent the migration never reached
        let short_home = dir.path().join("l").join("1");
        let canonical_home = snapshotter.resolver.canonical_root().join("1");
        std::fs::rename(&short_home, &canonical_home).unwrap();

        let mounts = snapshotter
            .prepare("k5", Some("base"), HashMap::new())
            .await
            .unwrap();
        let lowerdir = mounts[0]
            .options
            .iter()
            .find(|o| o.starts_with("lowerdir="))
            .unwrap();
        assert_eq!(
            *lowerdir,
            format!("lowerdir={}", canonical_home.join("fs").display())
        );

        // once the parent is migrated, later mount queries follow it
        std::fs::rename(&canonical_home, &short_home).unwrap();
        let mounts = snapshotter.mounts("k5").await.unwrap();
        let lowerdir = mounts[0]
            .options
            .iter()
            .find(|o| o.starts_with("lowerdir="))
            .unwrap();
        assert_eq!(
            *lowerdir,
            format!("lowerdir={}", short_home.join("fs").display())
        );
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_orphans() {
        let (snapshotter, _dir) = new_snapshotter(SnapshotterConfig::default()).await;
        snapshotter.prepare("live", None, HashMap::new()).await.unwrap();

        let stray = snapshotter.resolver.canonical_root().join("999");
        std::fs::create_dir_all(stray.join("fs")).unwrap();

        snapshotter.cleanup().await.unwrap();

        assert!(!stray.exists());
        assert!(snapshotter.resolver.canonical_root().join("1").is_dir());
    }

    #[tokio::test]
    async fn test_remove_then_reprepare_same_key() {
        let (snapshotter, _dir) = new_snapshotter(SnapshotterConfig::default()).await;

        snapshotter.prepare("k", None, HashMap::new()).await.unwrap();
        snapshotter.remove("k").await.unwrap();

        // asynchronous removal leaves the old home for cleanup
        let old_home = snapshotter.resolver.canonical_root().join("1");
        assert!(old_home.is_dir());

        let mounts = snapshotter.prepare("k", None, HashMap::new()).await.unwrap();
        assert!(mounts[0].source.contains("/2/"));

        snapshotter.cleanup().await.unwrap();
        assert!(!old_home.exists());
        assert!(snapshotter.resolver.canonical_root().join("2").is_dir());
    }

    #[tokio::test]
    async fn test_sync_remove_deletes_local_home() {
        let config = SnapshotterConfig {
            sync_remove: true,
            ..Default::default()
        };
        let (snapshotter, _dir) = new_snapshotter(config).await;

        snapshotter.prepare("k", None, HashMap::new()).await.unwrap();
        let home = snapshotter.resolver.canonical_root().join("1");
        assert!(home.is_dir());

        snapshotter.remove("k").await.unwrap();
        assert!(!home.exists());
    }

    #[tokio::test]
    async fn test_usage_of_active_counts_upper_writes() {
        let (snapshotter, _dir) = new_snapshotter(SnapshotterConfig::default()).await;

        snapshotter.prepare("k", None, HashMap::new()).await.unwrap();
        let usage = snapshotter.usage("k").await.unwrap();
        assert_eq!(usage, Usage::default());

        let upper = snapshotter.resolver.canonical_root().join("1").join("fs");
        std::fs::write(upper.join("data"), vec![0u8; 1024]).unwrap();

        let usage = snapshotter.usage("k").await.unwrap();
        assert_eq!(usage.size, 1024);
        assert_eq!(usage.inodes, 1);

        // committed usage is the frozen measurement
        snapshotter.commit("img", "k", HashMap::new()).await.unwrap();
        let usage = snapshotter.usage("img").await.unwrap();
        assert_eq!(usage.size, 1024);
        assert_eq!(usage.inodes, 1);
    }

    #[tokio::test]
    async fn test_stat_and_walk_inject_upperdir_label() {
        let config = SnapshotterConfig {
            upperdir_label: true,
            ..Default::default()
        };
        let (snapshotter, _dir) = new_snapshotter(config).await;

        snapshotter.prepare("k", None, HashMap::new()).await.unwrap();

        let expected = snapshotter
            .resolver
            .canonical_root()
            .join("1")
            .join("fs")
            .to_string_lossy()
            .into_owned();

        let info = snapshotter.stat("k").await.unwrap();
        assert_eq!(info.labels.get(UPPERDIR_LABEL), Some(&expected));

        let mut seen = Vec::new();
        snapshotter
            .walk(|info| {
                seen.push(info.labels.get(UPPERDIR_LABEL).cloned());
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(seen, vec![Some(expected)]);
    }

    #[tokio::test]
    async fn test_migration_on_reconstruction() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("containerd").join("overlayfs");

        {
            let snapshotter = OverlaySnapshotter::new(&root, SnapshotterConfig::default())
                .await
                .unwrap();
            commit_chain(&snapshotter, &["base"]).await;
            assert!(root.join("snapshots").join("1").is_dir());
        }

        let config = SnapshotterConfig {
            short_paths: true,
            ..Default::default()
        };
        let snapshotter = OverlaySnapshotter::new(&root, config).await.unwrap();

        assert!(dir.path().join("l").join("1").join("fs").is_dir());
        assert!(!root.join("snapshots").join("1").exists());

        // mounts keep working against the migrated home
        let mounts = snapshotter
            .prepare("k", Some("base"), HashMap::new())
            .await
            .unwrap();
        let lowerdir = mounts[0]
            .options
            .iter()
            .find(|o| o.starts_with("lowerdir="))
            .unwrap();
        assert!(lowerdir.contains(&dir.path().join("l").join("1").to_string_lossy().into_owned()));
    }

    #[tokio::test]
    async fn test_deep_chain_stays_within_page_budget() {
        let config = SnapshotterConfig {
            short_paths: true,
            ..Default::default()
        };
        let (snapshotter, _dir) = new_snapshotter(config).await;

        let names: Vec<String> = (0..40).map(|i| format!("layer{i}")).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        commit_chain(&snapshotter, &name_refs).await;

        let mounts = snapshotter
            .prepare("leaf", Some("layer39"), HashMap::new())
            .await
            .unwrap();
        let lowerdir = mounts[0]
            .options
            .iter()
            .find(|o| o.starts_with("lowerdir="))
            .unwrap();
        assert_eq!(lowerdir.matches(':').count(), 39);
        assert!(lowerdir.len() < strata_mount::OPTIONS_PAGE_SIZE);
    }
}
