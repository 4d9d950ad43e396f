use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async lock per file name.
///
/// Upload, download and delete of the same file run one at a time; different
/// files proceed in parallel. An entry lives only while someone holds or waits
/// for its lock.
#[derive(Default)]
pub struct FileLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Held for the duration of one operation on a file.
pub struct FileGuard {
    file_name: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl FileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, file_name: &str) -> FileGuard {
        let lock = self
            .locks
            .entry(file_name.to_string())
            .or_default()
            .clone();
        let guard = lock.lock_owned().await;

        FileGuard {
            file_name: file_name.to_string(),
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    /// Number of file names with a live lock.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map still points at the lock: nobody holds or awaits it
        self.locks
            .remove_if(&self.file_name, |_, lock| Arc::strong_count(lock) == 1);
    }
}
