use crate::error::SnapshotterError;
use crate::idmap;
use crate::paths::PathResolver;
use crate::types::{GID_MAPPING_LABEL, Mount, UID_MAPPING_LABEL};
use strata_metadata::{Info, Kind, Snapshot};

/// Builds the mount description for a snapshot from the resolved locations
/// of its own layer and every ancestor layer.
pub struct MountComposer<'a> {
    resolver: &'a PathResolver,
    default_options: &'a [String],
    remap_ids: bool,
}

impl<'a> MountComposer<'a> {
    pub fn new(resolver: &'a PathResolver, default_options: &'a [String], remap_ids: bool) -> Self {
        Self {
            resolver,
            default_options,
            remap_ids,
        }
    }

    pub fn compose(&self, snapshot: &Snapshot, info: &Info) -> Result<Vec<Mount>, SnapshotterError> {
        if snapshot.parent_ids.is_empty() {
            // base layer: expose the snapshot's own fs directly
            let source = self.resolver.upper_path(&snapshot.id, &info.labels)?;
            return Ok(vec![bind_mount(&source, snapshot.kind == Kind::Active)]);
        }

        if snapshot.kind == Kind::View && snapshot.parent_ids.len() == 1 {
            // read-only exposure of a single committed layer
            let source = self.resolver.locate_fs(&snapshot.parent_ids[0])?;
            return Ok(vec![bind_mount(&source, false)]);
        }

        let mut options: Vec<String> = self.default_options.to_vec();

        if self.remap_ids
            && let (Some(uid_mapping), Some(gid_mapping)) = (
                info.labels.get(UID_MAPPING_LABEL),
                info.labels.get(GID_MAPPING_LABEL),
            )
        {
            idmap::parse(uid_mapping)?;
            idmap::parse(gid_mapping)?;
            options.push(format!("uidmap={uid_mapping}"));
            options.push(format!("gidmap={gid_mapping}"));
        }

        let mut parent_paths = Vec::with_capacity(snapshot.parent_ids.len());
        for parent_id in &snapshot.parent_ids {
            let path = self.resolver.locate_fs(parent_id)?;
            parent_paths.push(path.to_string_lossy().into_owned());
        }
        options.push(format!("lowerdir={}", parent_paths.join(":")));

        if snapshot.kind == Kind::Active {
            options.push(format!(
                "upperdir={}",
                self.resolver
                    .upper_path(&snapshot.id, &info.labels)?
                    .to_string_lossy()
            ));
            options.push(format!(
                "workdir={}",
                self.resolver
                    .work_path(&snapshot.id, &info.labels)?
                    .to_string_lossy()
            ));
        }

        Ok(vec![Mount {
            mount_type: "overlay".to_string(),
            source: "overlay".to_string(),
            target: String::new(),
            options,
        }])
    }
}

fn bind_mount(source: &std::path::Path, writable: bool) -> Mount {
    Mount {
        mount_type: "bind".to_string(),
        source: source.to_string_lossy().into_owned(),
        target: String::new(),
        options: vec![
            if writable { "rw" } else { "ro" }.to_string(),
            "rbind".to_string(),
        ],
    }
}
