use crate::error::MetadataError;
use crate::types::{Info, Kind, Snapshot, Usage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotRecord {
    id: u64,
    kind: Kind,
    parent: Option<String>,
    labels: HashMap<String, String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    usage: Usage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MetaState {
    next_id: u64,
    snapshots: BTreeMap<String, SnapshotRecord>,
}

impl MetaState {
    fn record(&self, key: &str) -> Result<&SnapshotRecord, MetadataError> {
        self.snapshots
            .get(key)
            .ok_or_else(|| MetadataError::NotFound(key.to_string()))
    }

    fn parent_ids(&self, record: &SnapshotRecord) -> Vec<String> {
        let mut ids = Vec::new();
        let mut current = record.parent.clone();
        while let Some(name) = current {
            match self.snapshots.get(&name) {
                Some(parent) => {
                    ids.push(parent.id.to_string());
                    current = parent.parent.clone();
                }
                None => break,
            }
        }
        ids
    }

    fn info(&self, key: &str, record: &SnapshotRecord) -> Info {
        Info {
            kind: record.kind,
            name: key.to_string(),
            parent: record.parent.clone(),
            labels: record.labels.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    fn get(&self, key: &str) -> Result<(Snapshot, Info, Usage), MetadataError> {
        let record = self.record(key)?;
        let snapshot = Snapshot {
            id: record.id.to_string(),
            kind: record.kind,
            parent_ids: self.parent_ids(record),
        };
        Ok((snapshot, self.info(key, record), record.usage))
    }

    fn walk<F, E>(&self, mut f: F) -> Result<(), E>
    where
        F: FnMut(&Info) -> Result<(), E>,
    {
        for (key, record) in &self.snapshots {
            f(&self.info(key, record))?;
        }
        Ok(())
    }

    fn ids(&self) -> HashSet<String> {
        self.snapshots.values().map(|r| r.id.to_string()).collect()
    }
}

/// Transactional key/value store backing the snapshotter, persisted as a
/// single JSON database file with atomic replace-on-commit.
pub struct MetaStore {
    path: PathBuf,
    state: RwLock<MetaState>,
}

impl MetaStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, MetadataError> {
        let path = path.as_ref().to_path_buf();
        let state: MetaState = match fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MetaState::default(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(
            "opened metadata store at {:?} with {} snapshots",
            path,
            state.snapshots.len()
        );

        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    /// Begin a read-only transaction. Readers run concurrently.
    pub async fn read(&self) -> ReadTx<'_> {
        ReadTx {
            guard: self.state.read().await,
        }
    }

    /// Begin a read-write transaction. Writers serialize among themselves;
    /// mutations apply to a scratch copy and become visible only on
    /// [`WriteTx::commit`]. Dropping the transaction rolls back.
    pub async fn write(&self) -> WriteTx<'_> {
        let guard = self.state.write().await;
        let work = guard.clone();
        WriteTx {
            path: &self.path,
            guard,
            work,
        }
    }
}

pub struct ReadTx<'a> {
    guard: RwLockReadGuard<'a, MetaState>,
}

impl ReadTx<'_> {
    pub fn get(&self, key: &str) -> Result<(Snapshot, Info, Usage), MetadataError> {
        self.guard.get(key)
    }

    pub fn walk<F, E>(&self, f: F) -> Result<(), E>
    where
        F: FnMut(&Info) -> Result<(), E>,
    {
        self.guard.walk(f)
    }

    pub fn ids(&self) -> HashSet<String> {
        self.guard.ids()
    }
}

pub struct WriteTx<'a> {
    path: &'a Path,
    guard: RwLockWriteGuard<'a, MetaState>,
    work: MetaState,
}

impl WriteTx<'_> {
    pub fn get(&self, key: &str) -> Result<(Snapshot, Info, Usage), MetadataError> {
        self.work.get(key)
    }

    pub fn walk<F, E>(&self, f: F) -> Result<(), E>
    where
        F: FnMut(&Info) -> Result<(), E>,
    {
        self.work.walk(f)
    }

    pub fn ids(&self) -> HashSet<String> {
        self.work.ids()
    }

    pub fn create(
        &mut self,
        kind: Kind,
        key: &str,
        parent: Option<&str>,
        labels: HashMap<String, String>,
    ) -> Result<Snapshot, MetadataError> {
        if !matches!(kind, Kind::Active | Kind::View) {
            return Err(MetadataError::InvalidArgument(format!(
                "snapshot kind {kind} cannot be created directly"
            )));
        }
        if key.is_empty() {
            return Err(MetadataError::InvalidArgument(
                "snapshot key must not be empty".to_string(),
            ));
        }
        if self.work.snapshots.contains_key(key) {
            return Err(MetadataError::AlreadyExists(key.to_string()));
        }

        if let Some(p) = parent {
            let parent_record = self
                .work
                .snapshots
                .get(p)
                .ok_or_else(|| MetadataError::NotFound(format!("parent snapshot {p}")))?;
            if parent_record.kind != Kind::Committed {
                return Err(MetadataError::InvalidArgument(format!(
                    "parent snapshot {p} is not committed"
                )));
            }
        }

        self.work.next_id += 1;
        let now = Utc::now();
        let record = SnapshotRecord {
            id: self.work.next_id,
            kind,
            parent: parent.map(String::from),
            labels,
            created_at: now,
            updated_at: now,
            usage: Usage::default(),
        };

        let snapshot = Snapshot {
            id: record.id.to_string(),
            kind,
            parent_ids: self.work.parent_ids(&record),
        };
        self.work.snapshots.insert(key.to_string(), record);

        Ok(snapshot)
    }

    pub fn commit_active(
        &mut self,
        key: &str,
        name: &str,
        usage: Usage,
        labels: HashMap<String, String>,
    ) -> Result<String, MetadataError> {
        if name.is_empty() {
            return Err(MetadataError::InvalidArgument(
                "commit name must not be empty".to_string(),
            ));
        }
        if self.work.snapshots.contains_key(name) {
            return Err(MetadataError::AlreadyExists(name.to_string()));
        }

        let record = self.work.record(key)?;
        if record.kind != Kind::Active {
            return Err(MetadataError::InvalidArgument(format!(
                "snapshot {key} is {}, not active",
                record.kind
            )));
        }

        let mut record = self
            .work
            .snapshots
            .remove(key)
            .ok_or_else(|| MetadataError::NotFound(key.to_string()))?;
        record.kind = Kind::Committed;
        record.usage = usage;
        record.labels.extend(labels);
        record.updated_at = Utc::now();
        let id = record.id.to_string();
        self.work.snapshots.insert(name.to_string(), record);

        Ok(id)
    }

    pub fn remove(&mut self, key: &str) -> Result<(String, Kind), MetadataError> {
        let _ = self.work.record(key)?;

        let has_dependents = self
            .work
            .snapshots
            .values()
            .any(|r| r.parent.as_deref() == Some(key));
        if has_dependents {
            return Err(MetadataError::HasDependents(key.to_string()));
        }

        let record = self
            .work
            .snapshots
            .remove(key)
            .ok_or_else(|| MetadataError::NotFound(key.to_string()))?;

        Ok((record.id.to_string(), record.kind))
    }

    /// Update mutable fields of a snapshot. Only labels may change; an empty
    /// fieldpath list replaces them wholesale.
    pub fn update(&mut self, info: &Info, fieldpaths: &[String]) -> Result<Info, MetadataError> {
        let record = self
            .work
            .snapshots
            .get_mut(&info.name)
            .ok_or_else(|| MetadataError::NotFound(info.name.clone()))?;

        if fieldpaths.is_empty() {
            record.labels = info.labels.clone();
        } else {
            for path in fieldpaths {
                if path == "labels" {
                    record.labels = info.labels.clone();
                } else if let Some(label) = path.strip_prefix("labels.") {
                    match info.labels.get(label) {
                        Some(value) => {
                            record.labels.insert(label.to_string(), value.clone());
                        }
                        None => {
                            record.labels.remove(label);
                        }
                    }
                } else {
                    return Err(MetadataError::InvalidArgument(format!(
                        "cannot update field {path}"
                    )));
                }
            }
        }

        record.updated_at = Utc::now();
        let record = self.work.record(&info.name)?;
        Ok(self.work.info(&info.name, record))
    }

    /// Persist the scratch state and publish it to readers.
    pub async fn commit(mut self) -> Result<(), MetadataError> {
        let content = serde_json::to_string_pretty(&self.work)?;
        let tmp = self.path.with_extension("db.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, self.path).await?;

        *self.guard = std::mem::take(&mut self.work);
        Ok(())
    }
}
