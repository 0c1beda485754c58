use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

use crate::domain::{DatasetRecord, ProviderId};
use crate::error::MobilityError;
use crate::lock::ScopedLock;

pub const METADATA_FILE_NAME: &str = "datasets_metadata.json";

/// What `load` does with a record whose `storage_path` no longer exists.
///
/// `Flag` keeps the record and logs the discrepancy; `Prune` drops it from
/// the in-memory view. Neither variant rewrites the backing file: repair, if
/// any, is the caller's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingPathPolicy {
    #[default]
    Flag,
    Prune,
}

/// Change signal for the backing file, captured at the last load. A differing
/// signal on the next probe means another writer got there first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileSignal {
    modified: SystemTime,
    len: u64,
}

impl FileSignal {
    fn probe(path: &Utf8Path) -> Option<Self> {
        let meta = fs::metadata(path.as_std_path()).ok()?;
        Some(Self {
            modified: meta.modified().ok()?,
            len: meta.len(),
        })
    }
}

/// Durable, process-and-thread-safe mapping of `dataset_id` to
/// [`DatasetRecord`], one store per base directory.
///
/// The backing JSON file and its sidecar lock file are the only coordination
/// points between store instances; the in-memory map is a private cache that
/// must be revalidated (`ensure_current`) before any read-then-write
/// decision. Mutations reload the freshest on-disk state under an exclusive
/// lock before applying their single change, so two writers touching
/// disjoint dataset ids both survive.
#[derive(Debug)]
pub struct MetadataStore {
    base_dir: Utf8PathBuf,
    file_path: Utf8PathBuf,
    lock_path: Utf8PathBuf,
    policy: MissingPathPolicy,
    records: HashMap<String, DatasetRecord>,
    signal: Option<FileSignal>,
}

impl MetadataStore {
    pub fn open(base_dir: impl Into<Utf8PathBuf>) -> Result<Self, MobilityError> {
        Self::open_with_policy(base_dir, MissingPathPolicy::default())
    }

    pub fn open_with_policy(
        base_dir: impl Into<Utf8PathBuf>,
        policy: MissingPathPolicy,
    ) -> Result<Self, MobilityError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(base_dir.as_std_path())
            .map_err(|err| MobilityError::Filesystem(format!("create {base_dir}: {err}")))?;
        let file_path = base_dir.join(METADATA_FILE_NAME);
        let lock_path = base_dir.join(format!("{METADATA_FILE_NAME}.lock"));
        let mut store = Self {
            base_dir,
            file_path,
            lock_path,
            policy,
            records: HashMap::new(),
            signal: None,
        };
        store.reload(true)?;
        Ok(store)
    }

    pub fn base_dir(&self) -> &Utf8Path {
        &self.base_dir
    }

    pub fn file_path(&self) -> &Utf8Path {
        &self.file_path
    }

    /// Absolute path of a record's extracted contents.
    pub fn resolve_storage_path(&self, record: &DatasetRecord) -> Utf8PathBuf {
        self.base_dir.join(&record.storage_path)
    }

    /// Read and parse the backing file under a shared lock.
    ///
    /// A missing or empty file is a valid "no records yet" state. Unparseable
    /// content is `CorruptMetadata`; whether that aborts or degrades to an
    /// empty store is the caller's choice.
    pub fn load(&self) -> Result<HashMap<String, DatasetRecord>, MobilityError> {
        let _guard = ScopedLock::shared(&self.lock_path)?;
        let mut records = self.read_unlocked()?;
        self.apply_path_policy(&mut records);
        Ok(records)
    }

    /// Write the full mapping atomically under an exclusive lock.
    ///
    /// No reader ever observes a half-written file: the content lands in a
    /// temp file in the same directory and is renamed over the target.
    pub fn save(
        &mut self,
        mut records: HashMap<String, DatasetRecord>,
    ) -> Result<(), MobilityError> {
        // The signal is probed while the lock is still held; probing after
        // release could capture another writer's signal and mask their write
        // from the next ensure_current.
        let signal = {
            let _guard = ScopedLock::exclusive(&self.lock_path)?;
            self.write_unlocked(&records)?;
            FileSignal::probe(&self.file_path)
        };
        self.apply_path_policy(&mut records);
        self.records = records;
        self.signal = signal;
        Ok(())
    }

    /// Re-read the backing file if its change signal differs from the one
    /// captured at the last load, or unconditionally when `force` is set.
    /// Returns whether a reload actually happened.
    pub fn reload(&mut self, force: bool) -> Result<bool, MobilityError> {
        let current = FileSignal::probe(&self.file_path);
        if !force && current == self.signal {
            return Ok(false);
        }
        self.records = self.load()?;
        self.signal = current;
        debug!(
            path = %self.file_path,
            records = self.records.len(),
            forced = force,
            "metadata reloaded"
        );
        Ok(true)
    }

    /// `reload(false)`: callers invoke this before any read-then-write
    /// sequence to minimize lost updates.
    pub fn ensure_current(&mut self) -> Result<bool, MobilityError> {
        self.reload(false)
    }

    pub fn get(&self, dataset_id: &str) -> Option<&DatasetRecord> {
        self.records.get(dataset_id)
    }

    /// All current records, freshly revalidated against disk. Corruption
    /// degrades to an empty listing with a logged warning so status-style
    /// callers stay ergonomic.
    pub fn records(&mut self) -> Vec<DatasetRecord> {
        match self.ensure_current() {
            Ok(_) => self.records.values().cloned().collect(),
            Err(err) => {
                warn!(path = %self.file_path, error = %err, "metadata unreadable, listing empty");
                Vec::new()
            }
        }
    }

    /// Insert or replace the entry for `record.dataset_id`.
    ///
    /// The freshest on-disk state is re-read under the exclusive lock
    /// immediately before the change is applied, never a possibly stale
    /// in-memory snapshot.
    pub fn upsert(&mut self, record: DatasetRecord) -> Result<(), MobilityError> {
        self.ensure_current()?;
        self.mutate(|records| {
            records.insert(record.dataset_id.clone(), record);
            Ok(Vec::new())
        })?;
        Ok(())
    }

    /// Remove one dataset and clean up its extracted directory. The parent
    /// provider directory is deleted only if nothing else remains in it.
    pub fn remove(&mut self, dataset_id: &str) -> Result<DatasetRecord, MobilityError> {
        self.ensure_current()?;
        let mut removed = self.mutate(|records| {
            records
                .remove(dataset_id)
                .map(|record| vec![record])
                .ok_or_else(|| MobilityError::RecordNotFound(dataset_id.to_string()))
        })?;
        let record = removed
            .pop()
            .ok_or_else(|| MobilityError::RecordNotFound(dataset_id.to_string()))?;
        self.cleanup_record(&record);
        Ok(record)
    }

    /// Remove every dataset belonging to `provider_id`.
    pub fn remove_provider(
        &mut self,
        provider_id: &ProviderId,
    ) -> Result<Vec<DatasetRecord>, MobilityError> {
        self.ensure_current()?;
        let removed = self.mutate(|records| {
            let keys: Vec<String> = records
                .iter()
                .filter(|(_, record)| &record.provider_id == provider_id)
                .map(|(key, _)| key.clone())
                .collect();
            if keys.is_empty() {
                return Err(MobilityError::RecordNotFound(provider_id.to_string()));
            }
            Ok(keys
                .iter()
                .filter_map(|key| records.remove(key))
                .collect())
        })?;
        for record in &removed {
            self.cleanup_record(record);
        }
        Ok(removed)
    }

    /// Remove every dataset in the store. Removing from an already empty
    /// store is a no-op, not an error.
    pub fn remove_all(&mut self) -> Result<Vec<DatasetRecord>, MobilityError> {
        self.ensure_current()?;
        let removed = self.mutate(|records| Ok(records.drain().map(|(_, r)| r).collect()))?;
        for record in &removed {
            self.cleanup_record(record);
        }
        Ok(removed)
    }

    /// Reload-fresh, apply one change, save-fresh, all under a single
    /// exclusive lock. The lock scope covers only file I/O; slow work like
    /// downloads happens long before a caller gets here.
    fn mutate<F>(&mut self, apply: F) -> Result<Vec<DatasetRecord>, MobilityError>
    where
        F: FnOnce(&mut HashMap<String, DatasetRecord>) -> Result<Vec<DatasetRecord>, MobilityError>,
    {
        let removed;
        let (mut records, signal) = {
            let _guard = ScopedLock::exclusive(&self.lock_path)?;
            let mut records = self.read_unlocked()?;
            removed = apply(&mut records)?;
            self.write_unlocked(&records)?;
            // Probed under the lock so the captured signal is ours, not a
            // later writer's.
            (records, FileSignal::probe(&self.file_path))
        };
        self.apply_path_policy(&mut records);
        self.records = records;
        self.signal = signal;
        Ok(removed)
    }

    /// Parse the backing file. Callers hold the appropriate lock.
    fn read_unlocked(&self) -> Result<HashMap<String, DatasetRecord>, MobilityError> {
        let content = match fs::read_to_string(self.file_path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(err) => {
                return Err(MobilityError::Filesystem(format!(
                    "read {}: {err}",
                    self.file_path
                )));
            }
        };
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&content).map_err(|err| MobilityError::CorruptMetadata {
            path: self.file_path.clone(),
            message: err.to_string(),
        })
    }

    /// Serialize to a temp file in the same directory and rename it over the
    /// target, so the previous content survives any mid-write failure.
    /// Callers hold the exclusive lock.
    fn write_unlocked(
        &self,
        records: &HashMap<String, DatasetRecord>,
    ) -> Result<(), MobilityError> {
        let content = serde_json::to_vec_pretty(records)
            .map_err(|err| MobilityError::StorageWrite(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix(".datasets_metadata")
            .tempfile_in(self.base_dir.as_std_path())
            .map_err(|err| MobilityError::StorageWrite(err.to_string()))?;
        temp.write_all(&content)
            .map_err(|err| MobilityError::StorageWrite(err.to_string()))?;
        temp.persist(self.file_path.as_std_path())
            .map_err(|err| MobilityError::StorageWrite(err.to_string()))?;
        Ok(())
    }

    fn apply_path_policy(&self, records: &mut HashMap<String, DatasetRecord>) {
        let missing: Vec<String> = records
            .iter()
            .filter(|(_, record)| !self.base_dir.join(&record.storage_path).as_std_path().exists())
            .map(|(key, _)| key.clone())
            .collect();
        for key in missing {
            match self.policy {
                MissingPathPolicy::Flag => {
                    warn!(dataset_id = %key, "storage path missing for recorded dataset");
                }
                MissingPathPolicy::Prune => {
                    warn!(dataset_id = %key, "storage path missing, pruning record from view");
                    records.remove(&key);
                }
            }
        }
    }

    /// Best-effort directory cleanup for a removed record. `remove_dir` on
    /// the provider directory fails when anything the store did not create
    /// is still inside, which is exactly the protection we want.
    fn cleanup_record(&self, record: &DatasetRecord) {
        let storage = self.base_dir.join(&record.storage_path);
        if storage.as_std_path().exists() {
            if let Err(err) = fs::remove_dir_all(storage.as_std_path()) {
                warn!(path = %storage, error = %err, "failed to delete dataset directory");
                return;
            }
            debug!(path = %storage, "deleted dataset directory");
        }
        if let Some(provider_dir) = storage.parent() {
            if provider_dir != self.base_dir && fs::remove_dir(provider_dir.as_std_path()).is_ok()
            {
                debug!(path = %provider_dir, "deleted empty provider directory");
            }
        }
    }
}
