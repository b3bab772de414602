//! Deterministic discovery of module candidates under the configured roots.

use std::collections::HashSet;
use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::manifest::MANIFEST_FILE;

/// Tracing target for catalogue operations.
const CATALOGUE_TARGET: &str = "corral_modules::catalogue";

/// A directory identified as an installable module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleCandidate {
    name: String,
    path: Utf8PathBuf,
}

impl ModuleCandidate {
    /// Module name, taken from the directory name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding the module.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        self.path.as_path()
    }
}

/// Errors raised while walking module roots.
#[derive(Debug, Error)]
pub enum CatalogueError {
    /// A root directory could not be read.
    #[error("failed to read module root '{path}': {source}")]
    Root {
        /// Root directory involved.
        path: Utf8PathBuf,
        /// Underlying filesystem error.
        #[source]
        source: io::Error,
    },
}

/// Walks each root and collects module candidates at any depth.
///
/// Roots are visited in the order given; within a root, the walk is a
/// depth-first traversal with entries sorted lexicographically at every
/// level, so discovery is deterministic regardless of filesystem
/// enumeration order. A directory holding a manifest is a module and is not
/// descended into further; directories without one are treated as nested
/// collections and searched. The first occurrence of a name wins; later
/// duplicates are logged and skipped. Roots that do not exist are skipped
/// silently so a deployment may configure optional extras directories.
///
/// # Errors
///
/// Returns [`CatalogueError::Root`] when an existing directory in the walk
/// cannot be read.
pub fn discover(roots: &[Utf8PathBuf]) -> Result<Vec<ModuleCandidate>, CatalogueError> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut candidates = Vec::new();
    for root in roots {
        if !root.as_std_path().is_dir() {
            debug!(target: CATALOGUE_TARGET, root = %root, "module root absent, skipping");
            continue;
        }
        walk(root, &mut seen, &mut candidates)?;
    }
    Ok(candidates)
}

fn walk(
    dir: &Utf8Path,
    seen: &mut HashSet<String>,
    candidates: &mut Vec<ModuleCandidate>,
) -> Result<(), CatalogueError> {
    let mut entries: Vec<Utf8PathBuf> = fs::read_dir(dir)
        .map_err(|source| CatalogueError::Root {
            path: dir.to_owned(),
            source,
        })?
        .filter_map(Result::ok)
        .filter_map(|entry| Utf8PathBuf::from_path_buf(entry.path()).ok())
        .filter(|path| path.as_std_path().is_dir())
        .collect();
    entries.sort();
    for path in entries {
        if !path.join(MANIFEST_FILE).as_std_path().is_file() {
            walk(&path, seen, candidates)?;
            continue;
        }
        let Some(name) = path.file_name().map(str::to_owned) else {
            continue;
        };
        if seen.contains(&name) {
            debug!(
                target: CATALOGUE_TARGET,
                module = %name,
                path = %path,
                "duplicate module shadowed by earlier occurrence"
            );
            continue;
        }
        seen.insert(name.clone());
        candidates.push(ModuleCandidate { name, path });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;

    fn make_module(root: &Utf8Path, name: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).expect("create module dir");
        std::fs::write(dir.join(MANIFEST_FILE), "depends: []\n").expect("write manifest");
    }

    fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().expect("create temp dir");
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf())
            .expect("temp dir should be utf-8");
        (temp, root)
    }

    #[test]
    fn walk_is_lexicographic_within_a_root() {
        let (_temp, root) = temp_root();
        for name in ["zebra", "alpha", "mango"] {
            make_module(&root, name);
        }
        let found = discover(&[root]).expect("discover modules");
        let names: Vec<_> = found.iter().map(ModuleCandidate::name).collect();
        assert_eq!(names, ["alpha", "mango", "zebra"]);
    }

    #[test]
    fn first_root_wins_for_duplicate_names() {
        let (_temp_a, root_a) = temp_root();
        let (_temp_b, root_b) = temp_root();
        make_module(&root_a, "sale");
        make_module(&root_b, "sale");
        make_module(&root_b, "stock");

        let found = discover(&[root_a.clone(), root_b]).expect("discover modules");
        let sale = found
            .iter()
            .find(|candidate| candidate.name() == "sale")
            .expect("sale discovered");
        assert!(sale.path().starts_with(&root_a));
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn directories_without_manifests_are_not_modules() {
        let (_temp, root) = temp_root();
        make_module(&root, "real");
        std::fs::create_dir_all(root.join("not_a_module")).expect("create plain dir");

        let found = discover(&[root]).expect("discover modules");
        let names: Vec<_> = found.iter().map(ModuleCandidate::name).collect();
        assert_eq!(names, ["real"]);
    }

    #[test]
    fn nested_collections_are_searched() {
        let (_temp, root) = temp_root();
        make_module(&root, "flat");
        make_module(&root.join("community"), "nested");
        // Directories below a module are part of it, not further candidates.
        std::fs::create_dir_all(root.join("flat").join("data")).expect("create module data dir");

        let found = discover(&[root.clone()]).expect("discover modules");
        let names: Vec<_> = found.iter().map(ModuleCandidate::name).collect();
        assert_eq!(names, ["nested", "flat"]);
        let nested = found.first().expect("nested discovered");
        assert_eq!(nested.path(), root.join("community").join("nested"));
    }

    #[test]
    fn absent_roots_are_skipped() {
        let (_temp, root) = temp_root();
        make_module(&root, "only");
        let missing = root.join("does-not-exist");

        let found = discover(&[missing, root]).expect("discover modules");
        assert_eq!(found.len(), 1);
    }
}
