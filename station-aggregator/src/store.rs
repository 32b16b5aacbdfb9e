//! Durable record storage.
//!
//! Each station's latest payload lives in its own `<id>.json` file under the
//! configured data directory. Writes replace the whole record; there is no
//! merging.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, MutexGuard};

const RECORD_EXTENSION: &str = "json";
const LOCK_STRIPES: usize = 64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("station id {0:?} cannot be used as a record key")]
    InvalidKey(String),
    #[error("record storage failed: {0}")]
    Io(#[from] io::Error),
}

/// Whether a write created a new record or replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Created,
    Replaced,
}

/// File-backed `station id -> payload` store.
///
/// Operations on one id serialize on a striped async lock, so the
/// exists-then-write sequence in [`RecordStore::put`] cannot interleave with
/// another writer or the sweeper for the same id. Reads take no lock; records
/// are swapped in by rename, so a reader sees either the old or the new file.
pub struct RecordStore {
    dir: PathBuf,
    stripes: Vec<Mutex<()>>,
}

impl RecordStore {
    /// Creates a store rooted at `dir` without touching the filesystem.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Creates the data directory if needed and returns a store over it.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self::new(dir);
        fs::create_dir_all(&store.dir).await?;
        Ok(store)
    }

    /// Writes `payload` as the record for `station`.
    pub async fn put(&self, station: &str, payload: &str) -> Result<PutOutcome, StoreError> {
        self.put_with(station, payload, || {}).await
    }

    /// Like [`put`](Self::put), but runs `on_locked` once the station's lock
    /// is held and before any file is touched.
    ///
    /// Sweeps take the same lock, so whatever `on_locked` records is seen by
    /// a concurrent [`remove_if`](Self::remove_if) either entirely before or
    /// entirely after its predicate runs.
    pub async fn put_with<F>(
        &self,
        station: &str,
        payload: &str,
        on_locked: F,
    ) -> Result<PutOutcome, StoreError>
    where
        F: FnOnce(),
    {
        let path = self.record_path(station)?;
        let _guard = self.lock(station).await;
        on_locked();

        let outcome = if fs::try_exists(&path).await? {
            PutOutcome::Replaced
        } else {
            PutOutcome::Created
        };

        let staging = self.dir.join(format!(".{station}.{RECORD_EXTENSION}.tmp"));
        fs::write(&staging, payload.as_bytes()).await?;
        fs::rename(&staging, &path).await?;
        Ok(outcome)
    }

    /// Reads the record for `station`, if one exists.
    pub async fn get(&self, station: &str) -> Result<Option<String>, StoreError> {
        let path = self.record_path(station)?;
        match fs::read_to_string(&path).await {
            Ok(payload) => Ok(Some(payload)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn contains(&self, station: &str) -> Result<bool, StoreError> {
        let path = self.record_path(station)?;
        Ok(fs::try_exists(&path).await?)
    }

    /// Deletes the record for `station` when `predicate` holds.
    ///
    /// The predicate runs while the id's lock is held, so it sees a state no
    /// concurrent `put` for the same id can change underneath it. Returns
    /// whether the predicate held.
    pub async fn remove_if<F>(&self, station: &str, predicate: F) -> Result<bool, StoreError>
    where
        F: FnOnce() -> bool,
    {
        let path = self.record_path(station)?;
        let _guard = self.lock(station).await;
        if !predicate() {
            return Ok(false);
        }
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(err) => Err(err.into()),
        }
    }

    /// Lists the ids of all stored records.
    pub async fn ids(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                if !stem.starts_with('.') {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Removes every stored record.
    pub async fn clear(&self) -> Result<usize, StoreError> {
        let mut removed = 0;
        for id in self.ids().await? {
            if self.remove_if(&id, || true).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn lock(&self, station: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        station.hash(&mut hasher);
        let stripe = (hasher.finish() as usize) % self.stripes.len();
        self.stripes[stripe].lock().await
    }

    fn record_path(&self, station: &str) -> Result<PathBuf, StoreError> {
        let usable = !station.is_empty()
            && station != "."
            && station != ".."
            && !station.starts_with('.')
            && !station.contains(['/', '\\', '\0']);
        if !usable {
            return Err(StoreError::InvalidKey(station.to_string()));
        }
        Ok(self.dir.join(format!("{station}.{RECORD_EXTENSION}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_reports_created_then_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RecordStore::open(dir.path()).await.expect("open store");

        let first = store.put("S1", "{\"id\":\"S1\"}").await.expect("first put");
        let second = store
            .put("S1", "{\"id\":\"S1\",\"temp\":\"11\"}")
            .await
            .expect("second put");

        assert_eq!(first, PutOutcome::Created);
        assert_eq!(second, PutOutcome::Replaced);
        assert_eq!(
            store.get("S1").await.expect("get").as_deref(),
            Some("{\"id\":\"S1\",\"temp\":\"11\"}")
        );
    }

    #[tokio::test]
    async fn missing_record_reads_as_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RecordStore::open(dir.path()).await.expect("open store");

        assert_eq!(store.get("nobody").await.expect("get"), None);
        assert!(!store.contains("nobody").await.expect("contains"));
    }

    #[tokio::test]
    async fn rejects_keys_that_escape_the_data_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RecordStore::open(dir.path()).await.expect("open store");

        for key in ["", ".", "..", "../evil", "a/b", "a\\b", ".hidden"] {
            let result = store.put(key, "{}").await;
            assert!(
                matches!(result, Err(StoreError::InvalidKey(_))),
                "key {key:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn ids_lists_only_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RecordStore::open(dir.path()).await.expect("open store");
        store.put("B", "{}").await.expect("put B");
        store.put("A", "{}").await.expect("put A");
        std::fs::write(dir.path().join("notes.txt"), "ignored").expect("write stray file");
        std::fs::write(dir.path().join(".C.json.tmp"), "partial").expect("write staging file");

        assert_eq!(store.ids().await.expect("ids"), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn remove_if_honours_predicate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RecordStore::open(dir.path()).await.expect("open store");
        store.put("S1", "{}").await.expect("put");

        assert!(!store.remove_if("S1", || false).await.expect("keep"));
        assert!(store.contains("S1").await.expect("contains"));

        assert!(store.remove_if("S1", || true).await.expect("remove"));
        assert!(!store.contains("S1").await.expect("contains"));
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RecordStore::open(dir.path()).await.expect("open store");
        store.put("A", "{}").await.expect("put A");
        store.put("B", "{}").await.expect("put B");

        assert_eq!(store.clear().await.expect("clear"), 2);
        assert!(store.ids().await.expect("ids").is_empty());
    }

    #[tokio::test]
    async fn missing_directory_lists_no_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path().join("absent"));

        assert!(store.ids().await.expect("ids").is_empty());
    }
}
