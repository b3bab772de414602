//! Derives the durable marker paths shared by every replica.
//!
//! The markers live on a shared filesystem: any replica may read them, and
//! whichever replica holds the relevant lock may write them. Both the
//! orchestrator and the upgrade engine need to agree on the layout, so the
//! derivation lives here next to the configuration that feeds it.

use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::Config;

/// Canonical paths for the durable coordination markers.
#[derive(Debug, Clone)]
pub struct MarkerPaths {
    state_dir: Utf8PathBuf,
    destroy_path: Utf8PathBuf,
    scaffold_path: Utf8PathBuf,
    stamp_path: Utf8PathBuf,
    stamp_lock_path: Utf8PathBuf,
    stamp_lock_dir: Utf8PathBuf,
}

impl MarkerPaths {
    /// Derives marker paths from the shared configuration, creating the
    /// state directory when absent.
    ///
    /// # Errors
    ///
    /// Returns [`MarkerPathsError::StateDirectory`] when the state directory
    /// cannot be created.
    pub fn from_config(config: &Config) -> Result<Self, MarkerPathsError> {
        Self::under(config.state_dir())
    }

    /// Derives marker paths under an explicit state directory.
    ///
    /// # Errors
    ///
    /// Returns [`MarkerPathsError::StateDirectory`] when the directory
    /// cannot be created.
    pub fn under(state_dir: &Utf8Path) -> Result<Self, MarkerPathsError> {
        fs::create_dir_all(state_dir).map_err(|source| MarkerPathsError::StateDirectory {
            path: state_dir.to_owned(),
            source,
        })?;
        Ok(Self {
            destroy_path: state_dir.join(".destroy"),
            scaffold_path: state_dir.join(".scaffolded"),
            stamp_path: state_dir.join(".stamp"),
            stamp_lock_path: state_dir.join(".stamp.lock"),
            stamp_lock_dir: state_dir.join(".stamp.lock.d"),
            state_dir: state_dir.to_owned(),
        })
    }

    /// Directory holding all markers.
    #[must_use]
    pub fn state_dir(&self) -> &Utf8Path {
        self.state_dir.as_path()
    }

    /// Marker requesting a destructive re-provision on next bootstrap.
    #[must_use]
    pub fn destroy_path(&self) -> &Utf8Path {
        self.destroy_path.as_path()
    }

    /// Marker recording that scaffolding completed successfully.
    #[must_use]
    pub fn scaffold_path(&self) -> &Utf8Path {
        self.scaffold_path.as_path()
    }

    /// File carrying the last-applied build stamp.
    #[must_use]
    pub fn stamp_path(&self) -> &Utf8Path {
        self.stamp_path.as_path()
    }

    /// Companion lock file used by the atomic stamp-write protocol.
    #[must_use]
    pub fn stamp_lock_path(&self) -> &Utf8Path {
        self.stamp_lock_path.as_path()
    }

    /// Companion lock directory used when advisory locking is unavailable.
    #[must_use]
    pub fn stamp_lock_dir(&self) -> &Utf8Path {
        self.stamp_lock_dir.as_path()
    }
}

/// Errors raised while deriving marker paths.
#[derive(Debug, Error)]
pub enum MarkerPathsError {
    /// Creating the state directory failed.
    #[error("failed to prepare state directory '{path}': {source}")]
    StateDirectory {
        /// Directory that could not be created.
        path: Utf8PathBuf,
        /// Underlying filesystem error.
        #[source]
        source: io::Error,
    },
}
