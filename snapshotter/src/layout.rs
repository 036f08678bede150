use crate::error::SnapshotterError;
use std::collections::HashSet;
use std::path::Path;
use tokio::fs;

/// Create a directory (and any missing parents) with the given mode.
pub async fn create_dir_mode(path: &Path, mode: u32) -> Result<(), SnapshotterError> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true).mode(mode);
    builder.create(path).await?;
    Ok(())
}

/// Verify the filesystem under `root` reports directory entry types.
pub async fn verify_dtype(root: &Path) -> Result<(), SnapshotterError> {
    let probe = tempfile::Builder::new()
        .prefix(".dtype-check-")
        .tempdir_in(root)?;
    fs::write(probe.path().join("file"), b"").await?;
    fs::create_dir(probe.path().join("dir")).await?;

    let supported = strata_mount::supports_dtype(probe.path())
        .map_err(|e| SnapshotterError::Internal(format!("d_type probe failed: {e}")))?;
    if !supported {
        return Err(SnapshotterError::FilesystemUnsupported(
            root.display().to_string(),
        ));
    }
    Ok(())
}

/// Best-effort migration of snapshot homes from the canonical root to the
/// short root. Per-snapshot failures are logged and skipped; the resolver's
/// dual-location lookup absorbs whatever stays behind. Migration is refused
/// outright when both roots already hold differing id sets, since that means
/// something else has been writing here.
pub async fn migrate_snapshots(canonical: &Path, short: &Path) -> Result<(), SnapshotterError> {
    let canonical_ids = dir_names(canonical).await?;
    if canonical_ids.is_empty() {
        return Ok(());
    }

    let short_ids = dir_names(short).await?;
    if !short_ids.is_empty() && short_ids != canonical_ids {
        tracing::warn!(
            "refusing snapshot migration: {:?} and {:?} hold differing id sets",
            canonical,
            short
        );
        return Ok(());
    }

    for id in canonical_ids {
        let from = canonical.join(&id);
        let to = short.join(&id);
        match fs::rename(&from, &to).await {
            Ok(()) => tracing::info!("migrated snapshot {} to {:?}", id, to),
            Err(e) => tracing::warn!("failed to migrate snapshot {} to {:?}: {}", id, to, e),
        }
    }
    Ok(())
}

async fn dir_names(root: &Path) -> Result<HashSet<String>, SnapshotterError> {
    let mut names = HashSet::new();
    let mut entries = match fs::read_dir(root).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            names.insert(entry.file_name().to_string_lossy().to_string());
        }
    }
    Ok(names)
}
