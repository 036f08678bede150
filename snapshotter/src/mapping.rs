use crate::error::SnapshotterError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;
use tokio::sync::Mutex;

pub const MAPPING_FILE: &str = ".path-mappings.json";

/// Reverse record from a derived hash pair back to the identity it was
/// computed from, so an operator can tell what a
/// `<shared_base>/<pod_hash>/<snapshot_hash>` directory belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathMapping {
    pub pod_hash: String,
    pub snapshot_hash: String,
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MappingFile {
    mappings: HashMap<String, PathMapping>,
}

/// In-memory index over the per-base `.path-mappings.json` file. The index is
/// advisory: callers log and continue when persistence fails.
#[derive(Default)]
pub struct PathMappingIndex {
    entries: Mutex<HashMap<String, PathMapping>>,
}

impl PathMappingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge records from `<base>/.path-mappings.json` into memory. A missing
    /// file is not an error; in-memory records win on conflict.
    pub async fn load(&self, base: &Path) -> Result<(), SnapshotterError> {
        let path = base.join(MAPPING_FILE);
        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let file: MappingFile = serde_json::from_str(&content)?;

        let mut entries = self.entries.lock().await;
        for (key, mapping) in file.mappings {
            entries.entry(key).or_insert(mapping);
        }
        Ok(())
    }

    /// Upsert a record and persist. `created_at` is preserved across
    /// re-registrations; `last_accessed` always moves forward.
    #[allow(clippy::too_many_arguments)]
    pub async fn register(
        &self,
        base: &Path,
        pod_hash: &str,
        snapshot_hash: &str,
        namespace: &str,
        pod_name: &str,
        container_name: &str,
        snapshot_id: &str,
    ) -> Result<(), SnapshotterError> {
        let now = Utc::now();
        let key = format!("{}/{}", pod_hash, snapshot_hash);

        let mut entries = self.entries.lock().await;
        let created_at = entries.get(&key).map(|m| m.created_at).unwrap_or(now);
        entries.insert(
            key,
            PathMapping {
                pod_hash: pod_hash.to_string(),
                snapshot_hash: snapshot_hash.to_string(),
                namespace: namespace.to_string(),
                pod_name: pod_name.to_string(),
                container_name: container_name.to_string(),
                snapshot_id: snapshot_id.to_string(),
                created_at,
                last_accessed: now,
            },
        );

        self.persist(base, &entries).await
    }

    /// Fetch a record by its hash pair, bumping `last_accessed`.
    pub async fn lookup(&self, pod_hash: &str, snapshot_hash: &str) -> Option<PathMapping> {
        let key = format!("{}/{}", pod_hash, snapshot_hash);
        let mut entries = self.entries.lock().await;
        let mapping = entries.get_mut(&key)?;
        mapping.last_accessed = Utc::now();
        Some(mapping.clone())
    }

    /// Evict records whose `last_accessed` is older than `max_age`; persist.
    /// Returns how many records were dropped.
    pub async fn cleanup_stale(
        &self,
        base: &Path,
        max_age: Duration,
    ) -> Result<usize, SnapshotterError> {
        let cutoff = Utc::now() - max_age;
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, m| m.last_accessed >= cutoff);
        let dropped = before - entries.len();
        if dropped > 0 {
            self.persist(base, &entries).await?;
        }
        Ok(dropped)
    }

    /// Evict records whose backing directory under `base` is gone; persist.
    pub async fn cleanup_orphans(&self, base: &Path) -> Result<usize, SnapshotterError> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, m| base.join(&m.pod_hash).join(&m.snapshot_hash).is_dir());
        let dropped = before - entries.len();
        if dropped > 0 {
            self.persist(base, &entries).await?;
        }
        Ok(dropped)
    }

    /// Snapshot of every record, for listing.
    pub async fn all(&self) -> Vec<PathMapping> {
        self.entries.lock().await.values().cloned().collect()
    }

    async fn persist(
        &self,
        base: &Path,
        entries: &HashMap<String, PathMapping>,
    ) -> Result<(), SnapshotterError> {
        // emitted in descending numeric snapshot_id order for readability
        let mut sorted: Vec<(&String, &PathMapping)> = entries.iter().collect();
        sorted.sort_by(|a, b| {
            match (
                a.1.snapshot_id.parse::<u64>(),
                b.1.snapshot_id.parse::<u64>(),
            ) {
                (Ok(x), Ok(y)) => y.cmp(&x),
                _ => b.1.snapshot_id.cmp(&a.1.snapshot_id),
            }
        });

        let mut mappings = serde_json::Map::new();
        for (key, mapping) in sorted {
            mappings.insert(key.clone(), serde_json::to_value(mapping)?);
        }
        let content =
            serde_json::to_string_pretty(&serde_json::json!({ "mappings": mappings }))?;

        let path = base.join(MAPPING_FILE);
        let tmp = base.join(format!("{}.tmp", MAPPING_FILE));
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
