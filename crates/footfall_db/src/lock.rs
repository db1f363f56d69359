//! Single-writer lock for the analytical store.
//!
//! DuckDB admits one read-write process per file. `run-etl` takes an
//! exclusive `fs2` lock on `<store>.lock` before opening the store so a
//! concurrent run fails immediately. A small JSON note next to the lock
//! records which process holds it.

use chrono::Utc;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("{} is held by another writer", .0.display())]
    Held(PathBuf),

    #[error("cannot open lock file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Exclusive writer lock. Released on drop, together with the holder note.
pub struct WriterLock {
    _file: File,
    path: PathBuf,
    holder_note: Option<PathBuf>,
}

impl WriterLock {
    /// Take the lock for `store` without waiting.
    pub fn acquire(store: &Path) -> Result<Self, LockError> {
        let path = lock_file_path(store);
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        // Fully qualified so newer toolchains don't pick std's File::try_lock_exclusive.
        if let Err(err) = FileExt::try_lock_exclusive(&file) {
            return if err.kind() == io::ErrorKind::WouldBlock {
                Err(LockError::Held(store.to_path_buf()))
            } else {
                Err(io_err(err))
            };
        }

        debug!(lock = %path.display(), "writer lock taken");
        let holder_note = write_holder_note(&path);
        Ok(Self {
            _file: file,
            path,
            holder_note,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        if let Some(note) = self.holder_note.take() {
            let _ = fs::remove_file(note);
        }
        debug!(lock = %self.path.display(), "writer lock released");
    }
}

impl std::fmt::Debug for WriterLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("WriterLock").field(&self.path).finish()
    }
}

/// `analytics.duckdb` locks through `analytics.duckdb.lock`.
pub fn lock_file_path(store: &Path) -> PathBuf {
    let mut name = store.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

fn holder_note_path(lock: &Path) -> PathBuf {
    let mut name = lock.as_os_str().to_os_string();
    name.push(".json");
    PathBuf::from(name)
}

fn write_holder_note(lock: &Path) -> Option<PathBuf> {
    let note = serde_json::json!({
        "pid": std::process::id(),
        "since": Utc::now().to_rfc3339(),
    });
    let path = holder_note_path(lock);
    match fs::write(&path, note.to_string()) {
        Ok(()) => Some(path),
        Err(err) => {
            warn!("could not write {}: {}", path.display(), err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lock_file_sits_next_to_the_store() {
        assert_eq!(
            lock_file_path(Path::new("/data/analytics.duckdb")),
            PathBuf::from("/data/analytics.duckdb.lock")
        );
        assert_eq!(
            lock_file_path(Path::new("/data/store")),
            PathBuf::from("/data/store.lock")
        );
    }

    #[test]
    fn holder_note_lives_as_long_as_the_lock() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("analytics.duckdb");
        let note = dir.path().join("analytics.duckdb.lock.json");

        let lock = WriterLock::acquire(&store).unwrap();
        assert!(lock.path().exists());
        assert!(note.exists());
        drop(lock);
        assert!(!note.exists());

        WriterLock::acquire(&store).unwrap();
    }

    #[test]
    fn second_acquire_is_refused() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("analytics.duckdb");

        let _held = WriterLock::acquire(&store).unwrap();
        assert!(matches!(
            WriterLock::acquire(&store),
            Err(LockError::Held(_))
        ));
    }
}
