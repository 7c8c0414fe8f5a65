//! Filesystem helpers shared by the status area, snapshot store and
//! operation log.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

/// Write `contents` to `path` so readers never observe a partial file.
///
/// The bytes land in a uniquely named sibling first and are then renamed
/// over the destination, which is atomic on the same filesystem.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = temp_sibling(path);
    if let Err(e) = tokio::fs::write(&tmp, contents).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    write_atomic(path, &bytes).await
}

/// Read and deserialize a JSON file, mapping a missing file to `None`.
pub async fn read_json_opt<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Remove a file, treating "already gone" as success.
pub async fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Cross-process mutual exclusion through an exclusively created marker file.
///
/// The marker is removed when the guard drops. A marker older than
/// `stale_after` was left behind by a process that died while holding it and
/// is broken.
#[derive(Debug)]
pub struct FileGuard {
    path: PathBuf,
}

const GUARD_POLL: Duration = Duration::from_millis(5);

impl FileGuard {
    /// Wait up to `wait` for the marker at `path`.
    pub async fn acquire(path: &Path, wait: Duration, stale_after: Duration) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let created = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .await;
            match created {
                Ok(_) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }

            let modified = tokio::fs::metadata(path).await.and_then(|m| m.modified());
            if is_abandoned(modified, stale_after) {
                tracing::warn!(path = %path.display(), "Breaking abandoned guard file");
                remove_if_exists(path).await?;
                continue;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(busy(path));
            }
            tokio::time::sleep(GUARD_POLL).await;
        }
    }

    /// Blocking variant of `acquire` for use from `Drop`.
    pub fn acquire_blocking(path: &Path, wait: Duration, stale_after: Duration) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let deadline = std::time::Instant::now() + wait;
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(_) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }

            if is_abandoned(std::fs::metadata(path).and_then(|m| m.modified()), stale_after) {
                match std::fs::remove_file(path) {
                    Ok(()) => continue,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e),
                }
            }
            if std::time::Instant::now() >= deadline {
                return Err(busy(path));
            }
            std::thread::sleep(GUARD_POLL);
        }
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove guard file");
            }
        }
    }
}

fn is_abandoned(modified: io::Result<SystemTime>, stale_after: Duration) -> bool {
    modified
        .ok()
        .and_then(|at| at.elapsed().ok())
        .is_some_and(|age| age > stale_after)
}

fn busy(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{} is held by another process", path.display()),
    )
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}
