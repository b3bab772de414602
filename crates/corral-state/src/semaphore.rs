//! Durable coordination markers shared by every replica.
//!
//! A marker is a file whose existence is the flag; the stamp file carries
//! the last-applied build stamp as its content. Writes go through the
//! selected [`WriteMutex`](crate::WriteMutex) and a temporary-file-then-
//! rename step so concurrent readers never observe a partial value.

use std::fs;
use std::io::{self, Write};

use camino::Utf8PathBuf;
use corral_config::MarkerPaths;
use thiserror::Error;
use tracing::{debug, warn};

use crate::mutex::{self, MutexError, WriteMutex};

/// Tracing target for marker operations.
const STATE_TARGET: &str = "corral_state::semaphore";

/// Durable boolean markers managed by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// A destructive re-provision was requested.
    Destroy,
    /// Scaffolding completed successfully.
    Scaffold,
}

impl Marker {
    /// Canonical marker name used in diagnostics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Destroy => "destroy",
            Self::Scaffold => "scaffold",
        }
    }
}

/// Outcome of reading the persisted build stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stamp {
    /// No stamp has ever been persisted.
    Absent,
    /// A stamp file exists but its content is not an integer.
    Unparsable,
    /// The last successfully applied build stamp.
    Value(i64),
}

/// Errors raised by marker and stamp operations.
#[derive(Debug, Error)]
pub enum StateError {
    /// A marker file could not be created or removed.
    #[error("failed to update {marker} marker '{path}': {source}")]
    Marker {
        /// Marker involved.
        marker: &'static str,
        /// Marker file path.
        path: Utf8PathBuf,
        /// Underlying filesystem error.
        #[source]
        source: io::Error,
    },
    /// Setting the scaffold marker while a destroy is pending.
    #[error("refusing to mark scaffold complete while a destroy is requested")]
    ScaffoldWhileDestroyPending,
    /// The write mutex could not be taken.
    #[error(transparent)]
    Mutex(#[from] MutexError),
    /// The stamp file could not be written or moved into place.
    #[error("failed to persist stamp to '{path}': {source}")]
    StampWrite {
        /// Stamp file path.
        path: Utf8PathBuf,
        /// Underlying filesystem error.
        #[source]
        source: io::Error,
    },
    /// The stamp file exists but could not be read.
    #[error("failed to read stamp from '{path}': {source}")]
    StampRead {
        /// Stamp file path.
        path: Utf8PathBuf,
        /// Underlying filesystem error.
        #[source]
        source: io::Error,
    },
}

/// Store over the durable markers shared by every replica.
pub struct SemaphoreStore {
    paths: MarkerPaths,
    mutex: Box<dyn WriteMutex>,
}

impl SemaphoreStore {
    /// Builds a store over the given marker paths, probing the filesystem
    /// once for advisory-lock support.
    #[must_use]
    pub fn new(paths: MarkerPaths) -> Self {
        let mutex = mutex::select_mutex(paths.stamp_lock_path(), paths.stamp_lock_dir());
        Self { paths, mutex }
    }

    /// Whether the given marker is currently set.
    #[must_use]
    pub fn exists(&self, marker: Marker) -> bool {
        self.marker_path(marker).as_std_path().is_file()
    }

    /// Sets the given marker.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::ScaffoldWhileDestroyPending`] when asked to set
    /// the scaffold marker while a destroy is requested, or a filesystem
    /// error when the marker cannot be created.
    pub fn touch(&self, marker: Marker) -> Result<(), StateError> {
        if marker == Marker::Scaffold && self.exists(Marker::Destroy) {
            return Err(StateError::ScaffoldWhileDestroyPending);
        }
        let path = self.marker_path(marker);
        let _guard = self.mutex.lock()?;
        fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| StateError::Marker {
                marker: marker.as_str(),
                path: path.clone(),
                source,
            })?;
        debug!(target: STATE_TARGET, marker = marker.as_str(), path = %path, "marker set");
        Ok(())
    }

    /// Clears the given marker. Clearing an absent marker is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a filesystem error when the marker exists but cannot be
    /// removed.
    pub fn remove(&self, marker: Marker) -> Result<(), StateError> {
        let path = self.marker_path(marker);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(target: STATE_TARGET, marker = marker.as_str(), path = %path, "marker cleared");
                Ok(())
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StateError::Marker {
                marker: marker.as_str(),
                path,
                source,
            }),
        }
    }

    /// Reads the persisted build stamp.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::StampRead`] when the stamp file exists but
    /// cannot be read. Unparsable content is reported as
    /// [`Stamp::Unparsable`], not an error, so the caller can apply its
    /// conservative gating policy.
    pub fn read_stamp(&self) -> Result<Stamp, StateError> {
        let path = self.paths.stamp_path();
        match fs::read_to_string(path) {
            Ok(content) => match content.trim().parse::<i64>() {
                Ok(value) => Ok(Stamp::Value(value)),
                Err(_) => {
                    warn!(
                        target: STATE_TARGET,
                        path = %path,
                        "stamp file content is not an integer"
                    );
                    Ok(Stamp::Unparsable)
                }
            },
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(Stamp::Absent),
            Err(source) => Err(StateError::StampRead {
                path: path.to_owned(),
                source,
            }),
        }
    }

    /// Atomically persists a new build stamp.
    ///
    /// The value is written to a temporary file in the state directory and
    /// renamed into place while the write mutex is held, so a concurrent
    /// reader observes either the previous or the new value in full.
    ///
    /// # Errors
    ///
    /// Persistence failures are returned to the caller and never retried
    /// here; a silently missing stamp would cause a full re-upgrade on
    /// every restart.
    pub fn write_stamp(&self, value: i64) -> Result<(), StateError> {
        let path = self.paths.stamp_path();
        let _guard = self.mutex.lock()?;
        let mut temp = tempfile::NamedTempFile::new_in(self.paths.state_dir()).map_err(
            |source| StateError::StampWrite {
                path: path.to_owned(),
                source,
            },
        )?;
        writeln!(temp, "{value}").map_err(|source| StateError::StampWrite {
            path: path.to_owned(),
            source,
        })?;
        temp.as_file()
            .sync_all()
            .map_err(|source| StateError::StampWrite {
                path: path.to_owned(),
                source,
            })?;
        temp.persist(path)
            .map_err(|error| StateError::StampWrite {
                path: path.to_owned(),
                source: error.error,
            })?;
        debug!(target: STATE_TARGET, value, path = %path, "stamp persisted");
        Ok(())
    }

    /// Paths backing this store.
    #[must_use]
    pub fn paths(&self) -> &MarkerPaths {
        &self.paths
    }

    fn marker_path(&self, marker: Marker) -> Utf8PathBuf {
        match marker {
            Marker::Destroy => self.paths.destroy_path().to_owned(),
            Marker::Scaffold => self.paths.scaffold_path().to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use camino::Utf8PathBuf;
    use rstest::rstest;

    use super::*;

    fn temp_store() -> (tempfile::TempDir, SemaphoreStore) {
        let temp = tempfile::tempdir().expect("create temp dir");
        let state_dir = Utf8PathBuf::from_path_buf(temp.path().join("state"))
            .expect("temp dir should be utf-8");
        let paths = MarkerPaths::under(&state_dir).expect("derive marker paths");
        (temp, SemaphoreStore::new(paths))
    }

    #[rstest]
    #[case::destroy(Marker::Destroy)]
    #[case::scaffold(Marker::Scaffold)]
    fn markers_round_trip(#[case] marker: Marker) {
        let (_temp, store) = temp_store();
        assert!(!store.exists(marker));
        store.touch(marker).expect("set marker");
        assert!(store.exists(marker));
        store.remove(marker).expect("clear marker");
        assert!(!store.exists(marker));
    }

    #[test]
    fn removing_an_absent_marker_is_a_noop() {
        let (_temp, store) = temp_store();
        store.remove(Marker::Destroy).expect("noop removal");
        store.remove(Marker::Destroy).expect("second noop removal");
    }

    #[test]
    fn scaffold_refused_while_destroy_pending() {
        let (_temp, store) = temp_store();
        store.touch(Marker::Destroy).expect("set destroy");
        let error = store
            .touch(Marker::Scaffold)
            .expect_err("scaffold must be refused");
        assert!(matches!(error, StateError::ScaffoldWhileDestroyPending));

        store.remove(Marker::Destroy).expect("clear destroy");
        store.touch(Marker::Scaffold).expect("scaffold now allowed");
    }

    #[test]
    fn stamp_absent_then_value_then_unparsable() {
        let (_temp, store) = temp_store();
        assert_eq!(store.read_stamp().expect("read"), Stamp::Absent);

        store.write_stamp(1_700_000_000).expect("persist stamp");
        assert_eq!(
            store.read_stamp().expect("read"),
            Stamp::Value(1_700_000_000)
        );

        std::fs::write(store.paths().stamp_path(), "not-a-number\n")
            .expect("corrupt stamp file");
        assert_eq!(store.read_stamp().expect("read"), Stamp::Unparsable);
    }

    #[test]
    fn concurrent_stamp_writers_never_tear() {
        let (_temp, store) = temp_store();
        let store = Arc::new(store);
        store.write_stamp(0).expect("seed stamp");

        let writers: Vec<_> = (1..=8_i64)
            .map(|value| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store.write_stamp(value * 1_111_111).expect("write stamp");
                })
            })
            .collect();

        let reader = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..64 {
                    match store.read_stamp().expect("read stamp") {
                        Stamp::Value(value) => {
                            assert!(
                                value == 0 || value % 1_111_111 == 0,
                                "torn stamp value observed: {value}"
                            );
                        }
                        Stamp::Absent | Stamp::Unparsable => {
                            panic!("stamp vanished or tore during writes");
                        }
                    }
                }
            })
        };

        for writer in writers {
            writer.join().expect("writer panicked");
        }
        reader.join().expect("reader panicked");
    }
}
