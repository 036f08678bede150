use crate::MountError;
use nix::dir::Dir;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::path::Path;

const OVERLAY_INDEX_PARAM: &str = "/sys/module/overlay/parameters/index";
const UID_MAP: &str = "/proc/self/uid_map";

/// Whether the loaded overlay module understands the `index=` option.
pub fn supports_index() -> bool {
    Path::new(OVERLAY_INDEX_PARAM).exists()
}

/// Whether overlay mounts issued by this process require the `userxattr`
/// option. The kernel demands it when mounting from inside a user namespace;
/// a host-root process keeps the privileged xattr namespace.
pub fn needs_userxattr() -> bool {
    match std::fs::read_to_string(UID_MAP) {
        Ok(content) => !is_identity_mapping(&content),
        Err(e) => {
            tracing::debug!("could not read {}: {}, assuming host namespace", UID_MAP, e);
            false
        }
    }
}

fn is_identity_mapping(uid_map: &str) -> bool {
    let fields: Vec<&str> = uid_map.split_whitespace().collect();
    fields == ["0", "0", "4294967295"]
}

/// Whether the filesystem under `path` reports directory entry types.
/// Overlayfs lower layers are unusable without `d_type` (xfs without
/// `ftype=1` is the common offender). The directory must contain at least
/// one entry for the answer to be meaningful; empty directories report
/// supported.
pub fn supports_dtype(path: &Path) -> Result<bool, MountError> {
    let mut dir = Dir::open(path, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())?;
    for entry in dir.iter() {
        let entry = entry?;
        let name = entry.file_name().to_bytes();
        if name == b"." || name == b".." {
            continue;
        }
        if entry.file_type().is_none() {
            return Ok(false);
        }
    }
    Ok(true)
}
