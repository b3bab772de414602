//! Serialises marker writes across replicas sharing a filesystem.
//!
//! Two implementations exist behind one trait: an advisory file lock, and a
//! directory-creation mutex for filesystems where advisory locking is
//! unavailable (some network mounts). A capability probe at store
//! construction selects the implementation once, so callers never branch on
//! which one is active.

use std::fs::{self, OpenOptions};
use std::io;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::debug;

#[cfg(unix)]
use nix::fcntl::{Flock, FlockArg};

/// Tracing target for mutex selection and acquisition.
const MUTEX_TARGET: &str = "corral_state::mutex";

/// How long a directory mutex waits for a contended slot before failing.
const DIR_MUTEX_WAIT: Duration = Duration::from_secs(30);

/// Poll interval for a contended directory mutex.
const DIR_MUTEX_POLL: Duration = Duration::from_millis(100);

/// Errors raised while serialising a marker write.
#[derive(Debug, Error)]
pub enum MutexError {
    /// The lock file could not be opened or locked.
    #[error("failed to lock '{path}': {source}")]
    Lock {
        /// Lock file or directory involved.
        path: Utf8PathBuf,
        /// Underlying filesystem error.
        #[source]
        source: io::Error,
    },
    /// The directory mutex stayed contended past its wait budget.
    #[error("write mutex '{path}' still held after {waited_secs}s")]
    Contended {
        /// Lock directory involved.
        path: Utf8PathBuf,
        /// Seconds spent waiting.
        waited_secs: u64,
    },
}

/// Exclusive guard over a marker write. Released on drop.
pub trait WriteGuard {}

/// Mutual exclusion for writers of a shared marker file.
pub trait WriteMutex: Send + Sync {
    /// Blocks until the calling process holds the write mutex.
    ///
    /// # Errors
    ///
    /// Returns [`MutexError`] when the underlying lock primitive fails or
    /// the wait budget is exhausted.
    fn lock(&self) -> Result<Box<dyn WriteGuard>, MutexError>;
}

/// Selects the strongest write mutex the state directory supports.
///
/// Advisory locking is probed with a non-blocking acquisition on the
/// companion lock file; when the filesystem rejects the probe the
/// directory-creation mutex is used instead.
#[must_use]
pub fn select_mutex(lock_path: &Utf8Path, lock_dir: &Utf8Path) -> Box<dyn WriteMutex> {
    if flock_supported(lock_path) {
        debug!(target: MUTEX_TARGET, path = %lock_path, "using advisory file lock");
        Box::new(FlockMutex {
            path: lock_path.to_owned(),
        })
    } else {
        debug!(
            target: MUTEX_TARGET,
            path = %lock_dir,
            "advisory locking unavailable, using directory mutex"
        );
        Box::new(DirMutex {
            path: lock_dir.to_owned(),
        })
    }
}

#[cfg(unix)]
fn flock_supported(lock_path: &Utf8Path) -> bool {
    let file = match OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)
    {
        Ok(file) => file,
        Err(_) => return false,
    };
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(guard) => {
            drop(guard);
            true
        }
        // A busy lock still proves the primitive works.
        Err((_, errno)) => errno == nix::errno::Errno::EWOULDBLOCK,
    }
}

#[cfg(not(unix))]
fn flock_supported(_lock_path: &Utf8Path) -> bool {
    false
}

/// Advisory-lock mutex over a companion lock file.
#[derive(Debug)]
struct FlockMutex {
    path: Utf8PathBuf,
}

#[cfg(unix)]
impl WriteMutex for FlockMutex {
    fn lock(&self) -> Result<Box<dyn WriteGuard>, MutexError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)
            .map_err(|source| MutexError::Lock {
                path: self.path.clone(),
                source,
            })?;
        let guard =
            Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| MutexError::Lock {
                path: self.path.clone(),
                source: io::Error::from(errno),
            })?;
        Ok(Box::new(FlockGuard { _lock: guard }))
    }
}

#[cfg(not(unix))]
impl WriteMutex for FlockMutex {
    fn lock(&self) -> Result<Box<dyn WriteGuard>, MutexError> {
        Err(MutexError::Lock {
            path: self.path.clone(),
            source: io::Error::new(io::ErrorKind::Unsupported, "advisory locks need unix"),
        })
    }
}

#[cfg(unix)]
struct FlockGuard {
    _lock: Flock<std::fs::File>,
}

#[cfg(unix)]
impl WriteGuard for FlockGuard {}

/// Directory-creation mutex: `mkdir` succeeds for exactly one caller.
#[derive(Debug)]
struct DirMutex {
    path: Utf8PathBuf,
}

impl WriteMutex for DirMutex {
    fn lock(&self) -> Result<Box<dyn WriteGuard>, MutexError> {
        let started = Instant::now();
        loop {
            match fs::create_dir(&self.path) {
                Ok(()) => {
                    return Ok(Box::new(DirGuard {
                        path: self.path.clone(),
                    }));
                }
                Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                    if started.elapsed() >= DIR_MUTEX_WAIT {
                        return Err(MutexError::Contended {
                            path: self.path.clone(),
                            waited_secs: DIR_MUTEX_WAIT.as_secs(),
                        });
                    }
                    std::thread::sleep(DIR_MUTEX_POLL);
                }
                Err(source) => {
                    return Err(MutexError::Lock {
                        path: self.path.clone(),
                        source,
                    });
                }
            }
        }
    }
}

struct DirGuard {
    path: Utf8PathBuf,
}

impl WriteGuard for DirGuard {}

impl Drop for DirGuard {
    fn drop(&mut self) {
        if let Err(error) = fs::remove_dir(&self.path)
            && error.kind() != io::ErrorKind::NotFound
        {
            debug!(
                target: MUTEX_TARGET,
                path = %self.path,
                error = %error,
                "failed to release directory mutex"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use camino::Utf8PathBuf;

    use super::*;

    fn temp_paths() -> (tempfile::TempDir, Utf8PathBuf, Utf8PathBuf) {
        let temp = tempfile::tempdir().expect("create temp dir");
        let base = Utf8PathBuf::from_path_buf(temp.path().to_path_buf())
            .expect("temp dir should be utf-8");
        (temp, base.join("stamp.lock"), base.join("stamp.lock.d"))
    }

    #[test]
    fn probe_prefers_advisory_locks_on_local_filesystems() {
        let (_temp, lock_path, lock_dir) = temp_paths();
        let mutex = select_mutex(&lock_path, &lock_dir);
        let guard = mutex.lock().expect("acquire selected mutex");
        drop(guard);
    }

    #[test]
    fn dir_mutex_admits_exactly_one_holder() {
        let (_temp, _lock_path, lock_dir) = temp_paths();
        let mutex = DirMutex {
            path: lock_dir.clone(),
        };
        let guard = mutex.lock().expect("first acquisition succeeds");
        assert!(lock_dir.as_std_path().is_dir());

        // A second caller spins; verify the slot frees once the guard drops.
        drop(guard);
        assert!(!lock_dir.as_std_path().exists());
        let second = mutex.lock().expect("slot reusable after release");
        drop(second);
    }

    #[test]
    fn dir_mutex_serialises_concurrent_holders() {
        let (_temp, _lock_path, lock_dir) = temp_paths();
        let mutex = Arc::new(DirMutex { path: lock_dir });
        let counter = Arc::new(std::sync::Mutex::new(0_u32));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    let _guard = mutex.lock().expect("acquire dir mutex");
                    let mut held = counter.lock().expect("counter poisoned");
                    *held += 1;
                    assert_eq!(*held, 1, "two holders observed simultaneously");
                    std::thread::sleep(Duration::from_millis(10));
                    *held -= 1;
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker panicked");
        }
    }
}
