use crate::{MountError, MountSpec, OPTIONS_PAGE_SIZE};
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use std::path::Path;

/// Apply a snapshot mount at `target`.
///
/// Overlay mounts pass the composed option string as mount data verbatim;
/// if the kernel rejects it the error reports the option-string length,
/// since blowing the mount-data page with a deep lowerdir stack is the
/// failure mode worth diagnosing here.
pub fn apply(spec: &MountSpec, target: &Path) -> Result<(), MountError> {
    std::fs::create_dir_all(target)?;

    match spec.mount_type.as_str() {
        "overlay" => overlay(spec, target),
        "bind" => bind(spec, target),
        other => Err(MountError::UnsupportedType(other.to_string())),
    }
}

fn overlay(spec: &MountSpec, target: &Path) -> Result<(), MountError> {
    let data = spec.data();
    if data.len() >= OPTIONS_PAGE_SIZE {
        tracing::warn!(
            "overlay options for {:?} are {} bytes, at or beyond the kernel page limit",
            target,
            data.len()
        );
    }

    mount(
        Some("overlay"),
        target,
        Some("overlay"),
        MsFlags::empty(),
        Some(data.as_str()),
    )
    .map_err(|errno| MountError::OverlayRejected {
        target: target.to_path_buf(),
        bytes: data.len(),
        errno,
    })?;

    tracing::debug!(
        "mounted overlay at {:?}, {} lower layers",
        target,
        spec.lower_layers()
    );
    Ok(())
}

fn bind(spec: &MountSpec, target: &Path) -> Result<(), MountError> {
    let source = Path::new(&spec.source);
    let read_only = spec.options.iter().any(|o| o == "ro");
    let recursive = spec.options.iter().any(|o| o == "rbind");

    let mut flags = MsFlags::MS_BIND;
    if recursive {
        flags |= MsFlags::MS_REC;
    }
    if read_only {
        flags |= MsFlags::MS_RDONLY;
    }

    mount(Some(source), target, None::<&str>, flags, None::<&str>).map_err(|errno| {
        MountError::BindFailed {
            src: source.to_path_buf(),
            target: target.to_path_buf(),
            errno,
        }
    })?;

    // the kernel ignores MS_RDONLY on the initial bind; write access is
    // only dropped by a remount
    if read_only {
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|errno| MountError::RemountReadOnly {
            target: target.to_path_buf(),
            errno,
        })?;
    }

    tracing::debug!(
        "bound layer {:?} at {:?}{}",
        source,
        target,
        if read_only { " read-only" } else { "" }
    );
    Ok(())
}

/// Detach the snapshot mount at `target`. A target that is not mounted is
/// not an error; removal and cleanup paths detach without tracking whether
/// a runtime ever mounted the snapshot.
pub fn detach(target: &Path) -> Result<(), MountError> {
    match umount2(target, MntFlags::MNT_DETACH) {
        Ok(()) => {
            tracing::debug!("detached snapshot mount at {:?}", target);
            Ok(())
        }
        Err(Errno::EINVAL) | Err(Errno::ENOENT) => {
            tracing::debug!("no snapshot mount at {:?}, nothing to detach", target);
            Ok(())
        }
        Err(errno) => Err(MountError::Detach {
            target: target.to_path_buf(),
            errno,
        }),
    }
}
