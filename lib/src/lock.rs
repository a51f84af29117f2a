// Copyright 2026 The DataLad Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Inter-process advisory locks based on exclusive lock-file creation.
//!
//! Locks guard the shared resources of this crate: configuration scope
//! files, SSH control-socket creation, archive extraction directories, the
//! batched helper pool, and the credential store. Acquisition order across
//! resources is static (credentials, then ssh-socket, then helper-pool,
//! then archive, then config), which makes a deadlock detector
//! unnecessary.

use std::fs;
use std::fs::OpenOptions;
use std::io;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use rand::Rng as _;
use thiserror::Error;

use crate::file_util::PathError;

const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(250);

/// Error acquiring an advisory lock.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Timed out after {waited:.1?} waiting for lock {path}; another process holds it")]
    Timeout { path: PathBuf, waited: Duration },
    #[error("Failed to create lock file")]
    Io(#[from] PathError),
}

/// Held advisory lock. Dropping releases the lock on every exit path.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            tracing::warn!(path = ?self.path, ?err, "failed to remove lock file");
        }
    }
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Acquires the lock file at `path`, waiting up to `timeout`.
///
/// A lock file older than `stale_after` (when given) is considered left
/// over from a dead process and is broken.
pub fn acquire(
    path: &Path,
    timeout: Duration,
    stale_after: Option<Duration>,
) -> Result<LockGuard, LockError> {
    let start = Instant::now();
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match OpenOptions::new().create_new(true).write(true).open(path) {
            Ok(mut file) => {
                // Contents are diagnostics only; the file's existence is the
                // lock.
                let _ = writeln!(file, "{}", std::process::id());
                tracing::debug!(?path, "acquired lock");
                return Ok(LockGuard {
                    path: path.to_path_buf(),
                });
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                if let Some(stale_after) = stale_after
                    && is_stale(path, stale_after)
                {
                    tracing::warn!(?path, "breaking stale lock");
                    let _ = fs::remove_file(path);
                    continue;
                }
                let waited = start.elapsed();
                if waited >= timeout {
                    return Err(LockError::Timeout {
                        path: path.to_path_buf(),
                        waited,
                    });
                }
                std::thread::sleep(with_jitter(backoff));
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Err(err) => {
                return Err(LockError::Io(PathError {
                    path: path.to_path_buf(),
                    source: err,
                }));
            }
        }
    }
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|mtime| mtime.elapsed().ok())
        .is_some_and(|age| age > stale_after)
}

fn with_jitter(base: Duration) -> Duration {
    let jitter: f64 = rand::rng().random_range(0.5..1.5);
    base.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        {
            let _guard = acquire(&path, Duration::from_secs(1), None).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_contention_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        let _guard = acquire(&path, Duration::from_secs(1), None).unwrap();
        let err = acquire(&path, Duration::from_millis(30), None).unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[test]
    fn test_stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        fs::write(&path, "12345\n").unwrap();
        let guard = acquire(&path, Duration::from_secs(1), Some(Duration::ZERO)).unwrap();
        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn test_mutual_exclusion_across_threads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        let counter = Arc::new(Mutex::new(0u32));
        let mut handles = vec![];
        for _ in 0..4 {
            let path = path.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                let _guard = acquire(&path, Duration::from_secs(10), None).unwrap();
                let mut held = counter.lock().unwrap();
                *held += 1;
                assert_eq!(*held, 1, "two threads inside the critical section");
                std::thread::sleep(Duration::from_millis(5));
                *held -= 1;
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
