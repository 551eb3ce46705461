//! Snapshot-file collection shared by several processes.
//!
//! # Design
//! - The JSON snapshot on disk is the only source of truth. Every call takes
//!   an exclusive lock file next to it, reloads the snapshot into an
//!   `InMemoryCollection`, runs there, and writes the snapshot back when the
//!   call changed something. Nothing is cached between calls.
//! - The lock file is created with `create_new`, so exactly one holder exists
//!   across processes. Within a process a mutex queues callers first.
//! - A lock file older than `stale_after` is assumed to belong to a process
//!   that died holding it and is removed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::memory_store::InMemoryCollection;
use crate::ports::{
    Document, DocumentCollection, Filter, FindOptions, IdGenerator, StoreError, Update,
};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60);
const LOCK_RETRY: Duration = Duration::from_millis(10);

/// `DocumentCollection` persisted to one JSON file.
pub struct SnapshotCollection {
    inner: InMemoryCollection,
    path: PathBuf,
    lock_path: PathBuf,
    local: Mutex<()>,
    lock_timeout: Duration,
    stale_after: Duration,
}

/// Holds the lock file until dropped.
struct FileLock {
    path: PathBuf,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to release snapshot lock");
        }
    }
}

/// Both locks, released in reverse order.
struct Held<'a> {
    _file: FileLock,
    _local: MutexGuard<'a, ()>,
}

impl SnapshotCollection {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::from_inner(InMemoryCollection::new(name), path.into())
    }

    pub fn with_id_generator(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self::from_inner(InMemoryCollection::with_id_generator(name, ids), path.into())
    }

    fn from_inner(inner: InMemoryCollection, path: PathBuf) -> Self {
        let mut lock_path = path.as_os_str().to_owned();
        lock_path.push(".lock");
        Self {
            inner,
            path,
            lock_path: PathBuf::from(lock_path),
            local: Mutex::new(()),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    /// How long a call waits for another holder before giving up with
    /// `StoreError::Unavailable`.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_stale_after(mut self, age: Duration) -> Self {
        self.stale_after = age;
        self
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn lock(&self) -> Result<Held<'_>, StoreError> {
        let local = self.local.lock().await;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let deadline = tokio::time::Instant::now() + self.lock_timeout;
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
                .await
            {
                Ok(_) => {
                    return Ok(Held {
                        _file: FileLock {
                            path: self.lock_path.clone(),
                        },
                        _local: local,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.remove_if_stale().await {
                        continue;
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(StoreError::Unavailable(format!(
                            "{} is held by another process",
                            self.lock_path.display()
                        )));
                    }
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn remove_if_stale(&self) -> bool {
        let age = match tokio::fs::metadata(&self.lock_path).await {
            Ok(meta) => meta.modified().ok().and_then(|at| at.elapsed().ok()),
            Err(_) => None,
        };
        match age {
            Some(age) if age > self.stale_after => {
                warn!(path = %self.lock_path.display(), ?age, "removing stale snapshot lock");
                tokio::fs::remove_file(&self.lock_path).await.is_ok()
            }
            _ => false,
        }
    }

    /// Lock, then load the current snapshot.
    async fn open(&self) -> Result<Held<'_>, StoreError> {
        let held = self.lock().await?;
        let loaded = self.inner.reload_snapshot(&self.path).await?;
        debug!(collection = %self.name(), loaded, "snapshot reloaded");
        Ok(held)
    }

    async fn persist(&self) -> Result<(), StoreError> {
        self.inner.save_snapshot(&self.path).await
    }
}

#[async_trait]
impl DocumentCollection for SnapshotCollection {
    async fn insert_one(&self, document: Document) -> Result<Document, StoreError> {
        let _held = self.open().await?;
        let stored = self.inner.insert_one(document).await?;
        self.persist().await?;
        Ok(stored)
    }

    async fn find(&self, filter: &Filter, options: &FindOptions) -> Result<Vec<Document>, StoreError> {
        let _held = self.open().await?;
        self.inner.find(filter, options).await
    }

    async fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> Result<Option<Document>, StoreError> {
        let _held = self.open().await?;
        let updated = self.inner.find_one_and_update(filter, update, upsert).await?;
        if updated.is_some() {
            self.persist().await?;
        }
        Ok(updated)
    }

    async fn delete_many(&self, filter: &Filter) -> Result<u64, StoreError> {
        let _held = self.open().await?;
        let deleted = self.inner.delete_many(filter).await?;
        if deleted > 0 {
            self.persist().await?;
        }
        Ok(deleted)
    }

    async fn count(&self, filter: &Filter) -> Result<u64, StoreError> {
        let _held = self.open().await?;
        self.inner.count(filter).await
    }

    async fn distinct(&self, field: &str, filter: &Filter) -> Result<Vec<Value>, StoreError> {
        let _held = self.open().await?;
        self.inner.distinct(field, filter).await
    }

    async fn create_index(&self, field: &str) -> Result<(), StoreError> {
        // Index declarations are per process; reloads keep them.
        self.inner.create_index(field).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn pair(dir: &Path) -> (SnapshotCollection, SnapshotCollection) {
        let path = dir.join("ops.json");
        (
            SnapshotCollection::new("ops", &path),
            SnapshotCollection::new("ops", &path),
        )
    }

    #[tokio::test]
    async fn writes_are_visible_to_another_handle_on_the_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = pair(dir.path());

        a.insert_one(doc(json!({"_id": "1", "state": "QUEUED"}))).await.unwrap();
        assert_eq!(b.count(&Filter::All).await.unwrap(), 1);

        b.insert_one(doc(json!({"_id": "2", "state": "QUEUED"}))).await.unwrap();
        b.find_one_and_update(&Filter::id("1"), &Update::new().set("state", "RUNNING"), false)
            .await
            .unwrap();

        // `a` sees both of `b`'s writes and does not overwrite them.
        let running = a.find_one(&Filter::eq("state", "RUNNING")).await.unwrap().unwrap();
        assert_eq!(running["_id"], "1");
        a.delete_many(&Filter::id("2")).await.unwrap();
        assert_eq!(b.count(&Filter::All).await.unwrap(), 1);
        assert!(!dir.path().join("ops.json.lock").exists());
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = pair(dir.path());
        a.insert_one(doc(json!({"_id": "1", "state": "QUEUED"}))).await.unwrap();

        let claim = Update::new().set("state", "RUNNING");
        let queued = Filter::and(vec![Filter::id("1"), Filter::eq("state", "QUEUED")]);
        let (left, right) = tokio::join!(
            a.find_one_and_update(&queued, &claim, false),
            b.find_one_and_update(&queued, &claim, false),
        );
        let winners = [left.unwrap(), right.unwrap()]
            .into_iter()
            .filter(Option::is_some)
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn indexes_survive_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = pair(dir.path());
        a.create_index("state").await.unwrap();

        b.insert_one(doc(json!({"_id": "1", "state": "QUEUED"}))).await.unwrap();
        assert_eq!(a.count(&Filter::eq("state", "QUEUED")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn held_lock_times_out_as_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ops.json");
        std::fs::write(dir.path().join("ops.json.lock"), b"").unwrap();

        let coll = SnapshotCollection::new("ops", &path).with_lock_timeout(Duration::from_millis(50));
        let err = coll.count(&Filter::All).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn stale_lock_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ops.json");
        std::fs::write(dir.path().join("ops.json.lock"), b"").unwrap();

        let coll = SnapshotCollection::new("ops", &path).with_stale_after(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(coll.count(&Filter::All).await.unwrap(), 0);
    }
}
