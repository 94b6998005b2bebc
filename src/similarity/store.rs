//! Durable vector index shared by the synchronizer and the query path.
//!
//! Readers take a shared lock on the in-memory [`VectorIndex`]. Writers take
//! the cross-process index lock, catch up with whatever other processes
//! appended, append their own record and apply it in place, all under the
//! exclusive lock, so a reader sees either none or all of a batch.
//!
//! The file is only read back when it changed since this handle last touched
//! it: a header check tells whether the in-memory copy is current, a tail
//! replay covers appends from other processes, and a full reload is left for
//! files rewritten by someone else.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use crate::lock::FileLock;
use crate::similarity::index::{IndexEntry, IndexError, Metric, Neighbor, UpsertReport, VectorIndex};
use crate::similarity::storage::{FileState, Record, VectorStorage, VectorStorageError};

/// File name of the persisted index inside the store directory
pub const VECTORS_FILE_NAME: &str = "vectors.bin";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Storage error: {0}")]
    Storage(#[from] VectorStorageError),

    #[error("Index at {0} is locked by another process")]
    Busy(PathBuf),

    #[error("io error: {0}")]
    IO(#[from] std::io::Error),

    #[error("Index state poisoned")]
    Poisoned,
}

/// The in-memory index and the file position it reflects.
struct Snapshot {
    index: VectorIndex,
    /// `None` until something is written
    file: Option<FileState>,
}

/// Persistent, lock-protected vector index.
pub struct VectorStore {
    dir: PathBuf,
    storage: VectorStorage,
    model_id: [u8; 32],
    dimensions: usize,
    metric: Metric,
    snapshot: RwLock<Snapshot>,
    disk_reads: AtomicUsize,
}

impl VectorStore {
    /// Open the store in `dir`, creating an empty index if none exists.
    ///
    /// An existing file written for another model, dimensionality or metric
    /// is an error; the caller has to rebuild explicitly. A file holding more
    /// than one record is compacted.
    pub fn open(
        dir: &Path,
        model_id: [u8; 32],
        dimensions: usize,
        metric: Metric,
    ) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let storage = VectorStorage::new(dir.join(VECTORS_FILE_NAME));

        let _lock = FileLock::acquire_blocking(dir)?;
        let snapshot = if storage.exists() {
            let loaded = storage.load(&model_id, dimensions, metric)?;
            log::info!(
                "loaded {} vectors from {}",
                loaded.index.len(),
                storage.path().display()
            );

            let file = if loaded.replay.records > 1 || loaded.replay.torn_bytes > 0 {
                let state = storage.save(&loaded.index, &model_id)?;
                log::info!(
                    "compacted {} records into {}",
                    loaded.replay.records,
                    storage.path().display()
                );
                state
            } else {
                loaded.replay.state
            };

            Snapshot {
                index: loaded.index,
                file: Some(file),
            }
        } else {
            log::info!("no existing index at {}, starting fresh", storage.path().display());
            Snapshot {
                index: VectorIndex::new(dimensions, metric),
                file: None,
            }
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            storage,
            model_id,
            dimensions,
            metric,
            snapshot: RwLock::new(snapshot),
            disk_reads: AtomicUsize::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        self.storage.path()
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        self.read_index(|index| index.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Return the subset of `ids` already indexed.
    pub fn exists(&self, ids: &HashSet<String>) -> Result<HashSet<String>, StoreError> {
        self.read_index(|index| index.exists(ids))
    }

    /// Names of all indexed entries, in insertion order.
    pub fn names(&self) -> Result<Vec<(String, String)>, StoreError> {
        self.read_index(|index| {
            index
                .iter()
                .map(|entry| (entry.id.clone(), entry.metadata.name.clone()))
                .collect()
        })
    }

    pub fn query(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbor>, StoreError> {
        let hits = self.read_index(|index| index.query(vector, k))??;
        Ok(hits)
    }

    /// Insert or replace a batch and persist it.
    pub fn upsert(&self, entries: Vec<IndexEntry>) -> Result<UpsertReport, StoreError> {
        if entries.is_empty() {
            return Ok(UpsertReport::default());
        }

        let _lock = FileLock::acquire_blocking(&self.dir)?;
        let mut snapshot = self.snapshot.write().map_err(|_| StoreError::Poisoned)?;
        self.catch_up(&mut snapshot)?;

        snapshot.index.validate(&entries)?;
        self.persist(&mut snapshot, Record::Upsert(&entries))?;

        let count = entries.len();
        let report = snapshot.index.upsert(entries)?;
        log::info!("{count} embeddings added to index ({report:?})");
        Ok(report)
    }

    /// Remove entries by id. Maintenance only; sync never calls this.
    pub fn remove(&self, ids: &HashSet<String>) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let _lock = FileLock::acquire_blocking(&self.dir)?;
        let mut snapshot = self.snapshot.write().map_err(|_| StoreError::Poisoned)?;
        self.catch_up(&mut snapshot)?;

        let present = snapshot.index.exists(ids);
        if present.is_empty() {
            return Ok(0);
        }
        self.persist(&mut snapshot, Record::Remove(&present))?;

        Ok(snapshot.index.remove(&present))
    }

    /// Delete the persisted index in `dir` without opening it, so a store
    /// built for another model or metric can be rebuilt.
    ///
    /// Fails with [`StoreError::Busy`] while another process holds the
    /// index lock.
    pub fn discard(dir: &Path) -> Result<bool, StoreError> {
        let storage = VectorStorage::new(dir.join(VECTORS_FILE_NAME));
        if !storage.exists() {
            return Ok(false);
        }

        let _lock = FileLock::try_acquire(dir).map_err(|err| match err.kind() {
            std::io::ErrorKind::WouldBlock => StoreError::Busy(dir.to_path_buf()),
            _ => StoreError::IO(err),
        })?;
        storage.delete()?;
        log::warn!("discarded index at {}", storage.path().display());
        Ok(true)
    }

    /// How many times the file has been read back since open.
    #[cfg(test)]
    pub(crate) fn disk_reads(&self) -> usize {
        self.disk_reads.load(Ordering::Relaxed)
    }

    /// Bring the snapshot up to date with the file. Caller holds the index
    /// lock.
    fn catch_up(&self, snapshot: &mut Snapshot) -> Result<(), StoreError> {
        let on_disk = self.storage.state()?;

        match (snapshot.file, on_disk) {
            (Some(ours), Some(disk)) if ours == disk => {}

            (Some(ours), Some(disk)) if ours.generation == disk.generation && disk.len > ours.len => {
                let replay = self.storage.replay(ours, &mut snapshot.index)?;
                self.disk_reads.fetch_add(1, Ordering::Relaxed);
                log::debug!("replayed {} records appended by another writer", replay.records);
                snapshot.file = Some(replay.state);
            }

            (None, None) => {}

            (Some(_), None) => {
                log::warn!(
                    "{} was removed by another process, starting from an empty index",
                    self.storage.path().display()
                );
                snapshot.index = VectorIndex::new(self.dimensions, self.metric);
                snapshot.file = None;
            }

            (_, Some(_)) => {
                let loaded = self.storage.load(&self.model_id, self.dimensions, self.metric)?;
                self.disk_reads.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "reloaded {} vectors rewritten by another writer",
                    loaded.index.len()
                );
                snapshot.index = loaded.index;
                snapshot.file = Some(loaded.replay.state);
            }
        }

        Ok(())
    }

    /// Append `record`, creating the file first if needed.
    fn persist(&self, snapshot: &mut Snapshot, record: Record<'_>) -> Result<(), StoreError> {
        let at = match snapshot.file {
            Some(at) => at,
            None => self.storage.save(&snapshot.index, &self.model_id)?,
        };
        snapshot.file = Some(self.storage.append(at, record)?);
        Ok(())
    }

    fn read_index<T>(&self, f: impl FnOnce(&VectorIndex) -> T) -> Result<T, StoreError> {
        let guard = self.snapshot.read().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&guard.index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::index::EntryMetadata;

    const MODEL: [u8; 32] = [7u8; 32];

    fn entry(id: &str, vector: Vec<f32>) -> IndexEntry {
        IndexEntry {
            id: id.to_string(),
            vector,
            metadata: EntryMetadata {
                path: format!("corpus/{id}"),
                name: id.to_string(),
            },
        }
    }

    #[test]
    fn test_open_creates_empty_store() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VectorStore::open(tmp.path(), MODEL, 2, Metric::L2).unwrap();
        assert!(store.is_empty().unwrap());
        assert_eq!(store.dimensions(), 2);
        // nothing is written until the first upsert
        assert!(!store.path().exists());
    }

    #[test]
    fn test_upsert_visible_immediately() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VectorStore::open(tmp.path(), MODEL, 2, Metric::L2).unwrap();

        store.upsert(vec![entry("a", vec![1.0, 0.0])]).unwrap();

        let hits = store.query(&[1.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[0].distance, 0.0);
    }

    #[test]
    fn test_persists_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = VectorStore::open(tmp.path(), MODEL, 2, Metric::L2).unwrap();
            store
                .upsert(vec![entry("a", vec![1.0, 0.0]), entry("b", vec![0.0, 1.0])])
                .unwrap();
        }

        let store = VectorStore::open(tmp.path(), MODEL, 2, Metric::L2).unwrap();
        assert_eq!(store.len().unwrap(), 2);
        let asked: HashSet<String> = ["a".to_string(), "z".to_string()].into();
        assert_eq!(store.exists(&asked).unwrap(), HashSet::from(["a".to_string()]));
    }

    #[test]
    fn test_reopen_with_other_metric_fails() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = VectorStore::open(tmp.path(), MODEL, 2, Metric::L2).unwrap();
            store.upsert(vec![entry("a", vec![1.0, 0.0])]).unwrap();
        }

        let result = VectorStore::open(tmp.path(), MODEL, 2, Metric::Cosine);
        assert!(matches!(
            result,
            Err(StoreError::Storage(VectorStorageError::MetricMismatch { .. }))
        ));
    }

    #[test]
    fn test_bad_dimension_is_rejected_and_not_persisted() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VectorStore::open(tmp.path(), MODEL, 2, Metric::L2).unwrap();

        let result = store.upsert(vec![entry("a", vec![1.0, 0.0]), entry("b", vec![1.0])]);
        assert!(matches!(
            result,
            Err(StoreError::Index(IndexError::DimensionMismatch { .. }))
        ));
        assert!(store.is_empty().unwrap());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_two_handles_do_not_lose_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let first = VectorStore::open(tmp.path(), MODEL, 2, Metric::L2).unwrap();
        let second = VectorStore::open(tmp.path(), MODEL, 2, Metric::L2).unwrap();

        first.upsert(vec![entry("a", vec![1.0, 0.0])]).unwrap();
        second.upsert(vec![entry("b", vec![0.0, 1.0])]).unwrap();

        let reopened = VectorStore::open(tmp.path(), MODEL, 2, Metric::L2).unwrap();
        assert_eq!(reopened.len().unwrap(), 2);
        // the second handle merged the first one's batch
        assert_eq!(second.len().unwrap(), 2);
    }

    #[test]
    fn test_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VectorStore::open(tmp.path(), MODEL, 2, Metric::L2).unwrap();
        store
            .upsert(vec![entry("a", vec![1.0, 0.0]), entry("b", vec![0.0, 1.0])])
            .unwrap();

        let ids: HashSet<String> = ["a".to_string()].into();
        assert_eq!(store.remove(&ids).unwrap(), 1);

        let reopened = VectorStore::open(tmp.path(), MODEL, 2, Metric::L2).unwrap();
        assert_eq!(reopened.len().unwrap(), 1);
        assert_eq!(reopened.names().unwrap(), vec![("b".to_string(), "b".to_string())]);
    }

    #[test]
    fn test_discard_allows_reopen_with_other_metric() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = VectorStore::open(tmp.path(), MODEL, 2, Metric::L2).unwrap();
            store.upsert(vec![entry("a", vec![1.0, 0.0])]).unwrap();
        }

        assert!(VectorStore::discard(tmp.path()).unwrap());
        assert!(!VectorStore::discard(tmp.path()).unwrap());

        let store = VectorStore::open(tmp.path(), MODEL, 2, Metric::Cosine).unwrap();
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_discard_refuses_while_locked() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VectorStore::open(tmp.path(), MODEL, 2, Metric::L2).unwrap();
        store.upsert(vec![entry("a", vec![1.0, 0.0])]).unwrap();

        let _held = FileLock::try_acquire(tmp.path()).unwrap();
        assert!(matches!(
            VectorStore::discard(tmp.path()),
            Err(StoreError::Busy(_))
        ));
        assert!(store.path().exists());
    }

    #[test]
    fn test_batches_append_without_reading_back() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VectorStore::open(tmp.path(), MODEL, 2, Metric::L2).unwrap();

        let mut sizes = Vec::new();
        for i in 0..40 {
            store
                .upsert(vec![entry(&format!("img_{i:02}"), vec![i as f32, 1.0])])
                .unwrap();
            sizes.push(std::fs::metadata(store.path()).unwrap().len());
        }

        assert_eq!(store.disk_reads(), 0);
        assert_eq!(store.len().unwrap(), 40);
        // each batch grows the file by one record of the same size
        let steps: HashSet<u64> = sizes.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(steps.len(), 1);

        let reopened = VectorStore::open(tmp.path(), MODEL, 2, Metric::L2).unwrap();
        assert_eq!(reopened.len().unwrap(), 40);
        assert_eq!(reopened.names().unwrap()[7].0, "img_07");
        // compacted into a single record on open
        assert!(std::fs::metadata(reopened.path()).unwrap().len() < sizes[39]);
    }

    #[test]
    fn test_other_writer_appends_are_replayed_once() {
        let tmp = tempfile::tempdir().unwrap();
        let first = VectorStore::open(tmp.path(), MODEL, 2, Metric::L2).unwrap();
        let second = VectorStore::open(tmp.path(), MODEL, 2, Metric::L2).unwrap();

        first.upsert(vec![entry("a", vec![1.0, 0.0])]).unwrap();
        second.upsert(vec![entry("b", vec![0.0, 1.0])]).unwrap();
        assert_eq!(second.disk_reads(), 1);

        second.upsert(vec![entry("c", vec![1.0, 1.0])]).unwrap();
        assert_eq!(second.disk_reads(), 1);

        first.upsert(vec![entry("d", vec![2.0, 2.0])]).unwrap();
        assert_eq!(first.disk_reads(), 1);
        assert_eq!(
            first.names().unwrap().into_iter().map(|(id, _)| id).collect::<Vec<_>>(),
            vec!["a", "b", "c", "d"]
        );
    }

    #[test]
    fn test_rewrite_by_other_handle_forces_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let first = VectorStore::open(tmp.path(), MODEL, 2, Metric::L2).unwrap();
        first.upsert(vec![entry("a", vec![1.0, 0.0])]).unwrap();
        first.upsert(vec![entry("b", vec![0.0, 1.0])]).unwrap();

        // opening compacts, which starts a new generation
        let second = VectorStore::open(tmp.path(), MODEL, 2, Metric::L2).unwrap();
        second.upsert(vec![entry("c", vec![1.0, 1.0])]).unwrap();

        first.upsert(vec![entry("d", vec![2.0, 2.0])]).unwrap();
        assert_eq!(first.disk_reads(), 1);
        assert_eq!(first.len().unwrap(), 4);
    }

    #[test]
    fn test_interrupted_append_is_overwritten() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VectorStore::open(tmp.path(), MODEL, 2, Metric::L2).unwrap();
        store.upsert(vec![entry("a", vec![1.0, 0.0])]).unwrap();

        // half a record left by a crashed writer
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(store.path())
            .unwrap();
        std::io::Write::write_all(&mut file, &[1, 2, 0, 0, 0]).unwrap();
        drop(file);

        store.upsert(vec![entry("b", vec![0.0, 1.0])]).unwrap();

        let reopened = VectorStore::open(tmp.path(), MODEL, 2, Metric::L2).unwrap();
        assert_eq!(reopened.len().unwrap(), 2);
    }

    #[test]
    fn test_remove_of_absent_ids_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VectorStore::open(tmp.path(), MODEL, 2, Metric::L2).unwrap();
        store.upsert(vec![entry("a", vec![1.0, 0.0])]).unwrap();
        let before = std::fs::metadata(store.path()).unwrap().len();

        let ids: HashSet<String> = ["zzz".to_string()].into();
        assert_eq!(store.remove(&ids).unwrap(), 0);
        assert_eq!(std::fs::metadata(store.path()).unwrap().len(), before);
    }

    #[test]
    fn test_discard_seen_by_live_handle() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VectorStore::open(tmp.path(), MODEL, 2, Metric::L2).unwrap();
        store.upsert(vec![entry("a", vec![1.0, 0.0])]).unwrap();

        assert!(VectorStore::discard(tmp.path()).unwrap());
        store.upsert(vec![entry("b", vec![0.0, 1.0])]).unwrap();

        assert_eq!(store.names().unwrap(), vec![("b".to_string(), "b".to_string())]);
    }

    #[test]
    fn test_poisoned_state_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(VectorStore::open(tmp.path(), MODEL, 2, Metric::L2).unwrap());
        store.upsert(vec![entry("a", vec![1.0, 0.0])]).unwrap();

        let holder = store.clone();
        let _ = std::thread::spawn(move || {
            let _guard = holder.snapshot.write().unwrap();
            panic!("writer died holding the index");
        })
        .join();

        assert!(matches!(store.len(), Err(StoreError::Poisoned)));
        assert!(matches!(store.query(&[1.0, 0.0], 1), Err(StoreError::Poisoned)));
        assert!(matches!(
            store.upsert(vec![entry("b", vec![0.0, 1.0])]),
            Err(StoreError::Poisoned)
        ));
        // fixed at open, still reported
        assert_eq!(store.dimensions(), 2);
        assert_eq!(store.metric(), Metric::L2);
    }
}
