//! Module manifest parsing.
//!
//! Each installable module carries a `manifest.yaml` at its root. Only the
//! dependency list matters for ordering; every other key is preserved by the
//! deserialiser being lenient, not by modelling it.

use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use thiserror::Error;

/// File name marking a directory as a module.
pub const MANIFEST_FILE: &str = "manifest.yaml";

/// Declarative description of a module's install-time dependencies.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModuleManifest {
    /// Names of modules that must be installed before this one.
    #[serde(default)]
    depends: Vec<String>,
}

impl ModuleManifest {
    /// Reads and parses the manifest inside the given module directory.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Read`] when the file cannot be read and
    /// [`ManifestError::Parse`] when its content is not valid YAML.
    pub fn load(module_dir: &Utf8Path) -> Result<Self, ManifestError> {
        let path = module_dir.join(MANIFEST_FILE);
        let content = fs::read_to_string(&path).map_err(|source| ManifestError::Read {
            path: path.clone(),
            source,
        })?;
        serde_saphyr::from_str(&content).map_err(|source| ManifestError::Parse { path, source })
    }

    /// Dependencies declared by the module.
    #[must_use]
    pub fn depends(&self) -> &[String] {
        &self.depends
    }
}

/// Errors raised while loading a module manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest file could not be read.
    #[error("failed to read manifest '{path}': {source}")]
    Read {
        /// Manifest path involved.
        path: Utf8PathBuf,
        /// Underlying filesystem error.
        #[source]
        source: io::Error,
    },
    /// The manifest content is not valid YAML.
    #[error("failed to parse manifest '{path}': {source}")]
    Parse {
        /// Manifest path involved.
        path: Utf8PathBuf,
        /// Underlying deserialisation error.
        #[source]
        source: serde_saphyr::Error,
    },
}
