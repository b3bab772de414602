//! Synchronises vendored module trees into the live module roots.
//!
//! Images ship modules in a read-only vendor directory; the live root is a
//! writable volume shared between replicas. Synchronisation copies new or
//! changed modules over and leaves identical ones alone so repeated boots
//! stay cheap. A target that is a symlink back to the source is already
//! live and is left untouched.

use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Tracing target for vendor synchronisation.
const VENDOR_TARGET: &str = "corral_modules::vendor";

/// Counts reported by a synchronisation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Modules newly copied into the target.
    pub copied: usize,
    /// Modules replaced because their content changed.
    pub updated: usize,
    /// Modules left alone because they were identical.
    pub unchanged: usize,
}

/// Errors raised during vendor synchronisation.
#[derive(Debug, Error)]
pub enum VendorError {
    /// A filesystem operation failed.
    #[error("vendor sync failed at '{path}': {source}")]
    Io {
        /// Path involved in the failing operation.
        path: Utf8PathBuf,
        /// Underlying filesystem error.
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Utf8Path) -> impl FnOnce(io::Error) -> VendorError + '_ {
    move |source| VendorError::Io {
        path: path.to_owned(),
        source,
    }
}

/// Copies new or changed modules from `source` into `target`.
///
/// # Errors
///
/// Returns [`VendorError::Io`] when a directory or file cannot be read,
/// created, or replaced.
pub fn sync_module_tree(source: &Utf8Path, target: &Utf8Path) -> Result<SyncReport, VendorError> {
    if !source.as_std_path().is_dir() {
        debug!(target: VENDOR_TARGET, source = %source, "vendor source absent, nothing to sync");
        return Ok(SyncReport::default());
    }
    if points_back_to(target, source) {
        debug!(
            target: VENDOR_TARGET,
            target = %target,
            "target is a symlink to the vendor source, skipping"
        );
        return Ok(SyncReport::default());
    }
    fs::create_dir_all(target).map_err(io_err(target))?;

    let mut report = SyncReport::default();
    let mut modules: Vec<Utf8PathBuf> = fs::read_dir(source)
        .map_err(io_err(source))?
        .filter_map(Result::ok)
        .filter_map(|entry| Utf8PathBuf::from_path_buf(entry.path()).ok())
        .filter(|path| path.as_std_path().is_dir())
        .collect();
    modules.sort();

    for module in modules {
        let Some(name) = module.file_name() else {
            continue;
        };
        let destination = target.join(name);
        if !destination.as_std_path().exists() {
            copy_tree(&module, &destination)?;
            report.copied += 1;
            info!(target: VENDOR_TARGET, module = name, "vendored module installed");
        } else if trees_differ(&module, &destination)? {
            fs::remove_dir_all(&destination).map_err(io_err(&destination))?;
            copy_tree(&module, &destination)?;
            report.updated += 1;
            info!(target: VENDOR_TARGET, module = name, "vendored module refreshed");
        } else {
            report.unchanged += 1;
        }
    }
    Ok(report)
}

/// Whether `target` is a symlink resolving to `source`.
fn points_back_to(target: &Utf8Path, source: &Utf8Path) -> bool {
    let std_target = target.as_std_path();
    if !std_target.is_symlink() {
        return false;
    }
    match (fs::canonicalize(std_target), fs::canonicalize(source.as_std_path())) {
        (Ok(resolved), Ok(canonical_source)) => resolved == canonical_source,
        _ => false,
    }
}

fn copy_tree(source: &Utf8Path, destination: &Utf8Path) -> Result<(), VendorError> {
    fs::create_dir_all(destination).map_err(io_err(destination))?;
    for entry in fs::read_dir(source).map_err(io_err(source))? {
        let dir_entry = entry.map_err(io_err(source))?;
        let Ok(path) = Utf8PathBuf::from_path_buf(dir_entry.path()) else {
            continue;
        };
        let Some(name) = path.file_name() else {
            continue;
        };
        let dest = destination.join(name);
        if path.as_std_path().is_dir() {
            copy_tree(&path, &dest)?;
        } else {
            fs::copy(&path, &dest).map_err(io_err(&path))?;
        }
    }
    Ok(())
}

fn trees_differ(left: &Utf8Path, right: &Utf8Path) -> Result<bool, VendorError> {
    let left_entries = sorted_entries(left)?;
    let right_entries = sorted_entries(right)?;
    let left_names: Vec<_> = left_entries.iter().filter_map(|p| p.file_name()).collect();
    let right_names: Vec<_> = right_entries.iter().filter_map(|p| p.file_name()).collect();
    if left_names != right_names {
        return Ok(true);
    }
    for path in &left_entries {
        let Some(name) = path.file_name() else {
            continue;
        };
        let counterpart = right.join(name);
        let is_dir = path.as_std_path().is_dir();
        if is_dir != counterpart.as_std_path().is_dir() {
            return Ok(true);
        }
        if is_dir {
            if trees_differ(path, &counterpart)? {
                return Ok(true);
            }
        } else {
            let ours = fs::read(path).map_err(io_err(path))?;
            let theirs = fs::read(&counterpart).map_err(io_err(&counterpart))?;
            if ours != theirs {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn sorted_entries(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, VendorError> {
    let mut entries: Vec<Utf8PathBuf> = fs::read_dir(dir)
        .map_err(io_err(dir))?
        .filter_map(Result::ok)
        .filter_map(|entry| Utf8PathBuf::from_path_buf(entry.path()).ok())
        .collect();
    entries.sort();
    Ok(entries)
}
