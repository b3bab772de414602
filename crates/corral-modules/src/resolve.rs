//! Dependency-ordered module resolution.
//!
//! Discovery feeds filtering feeds a three-colour depth-first topological
//! sort. Cycles never abort the walk: the back edge is dropped and both
//! participants still resolve, because an incomplete ordering is recoverable
//! while a refused bootstrap is not.

use std::collections::HashMap;

use camino::Utf8PathBuf;
use tracing::{debug, warn};

use crate::catalogue::{self, CatalogueError};
use crate::filter::FilterConfig;
use crate::manifest::ModuleManifest;

/// Tracing target for resolution.
const RESOLVE_TARGET: &str = "corral_modules::resolve";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Colour {
    Grey,
    Black,
}

/// Resolves the install order for every surviving module under the roots.
///
/// The output lists dependencies before dependents, contains no duplicates,
/// and is deterministic for a given filesystem state: candidates are walked
/// in lexicographic path order and ties break on discovery order.
///
/// # Errors
///
/// Returns [`CatalogueError`] when a module root cannot be read. Malformed
/// manifests are logged and contribute no ordering edges; the module itself
/// still resolves by discovery.
pub fn resolve(
    roots: &[Utf8PathBuf],
    filter: &FilterConfig,
) -> Result<Vec<String>, CatalogueError> {
    resolve_with_mandatory(roots, filter, &[])
}

/// Like [`resolve`], but force-includes the mandatory modules.
///
/// Mandatory names bypass the filter when discovered under the roots, and
/// are emitted first when not discovered at all, so core modules install
/// even when a blocklist or localisation rule would exclude them.
///
/// # Errors
///
/// Returns [`CatalogueError`] when a module root cannot be read.
pub fn resolve_with_mandatory(
    roots: &[Utf8PathBuf],
    filter: &FilterConfig,
    mandatory: &[String],
) -> Result<Vec<String>, CatalogueError> {
    let candidates = catalogue::discover(roots)?;
    let survivors: Vec<_> = candidates
        .iter()
        .filter(|candidate| {
            mandatory.iter().any(|name| name == candidate.name())
                || filter.permits(candidate.name())
        })
        .collect();

    let mut edges: HashMap<String, Vec<String>> = HashMap::new();
    for candidate in &survivors {
        let depends = match ModuleManifest::load(candidate.path()) {
            Ok(manifest) => manifest
                .depends()
                .iter()
                .filter(|dep| survivors.iter().any(|other| other.name() == dep.as_str()))
                .cloned()
                .collect(),
            Err(error) => {
                warn!(
                    target: RESOLVE_TARGET,
                    module = candidate.name(),
                    error = %error,
                    "malformed manifest, ordering constraints dropped"
                );
                Vec::new()
            }
        };
        edges.insert(candidate.name().to_owned(), depends);
    }

    let mut colour: HashMap<String, Colour> = HashMap::new();
    let mut ordered = Vec::with_capacity(survivors.len());
    for candidate in &survivors {
        visit(candidate.name(), &edges, &mut colour, &mut ordered);
    }

    let mut result: Vec<String> = Vec::with_capacity(mandatory.len() + ordered.len());
    for name in mandatory {
        if !ordered.contains(name) && !result.contains(name) {
            result.push(name.clone());
        }
    }
    result.extend(ordered);
    debug!(target: RESOLVE_TARGET, modules = result.len(), "resolution complete");
    Ok(result)
}

fn visit(
    name: &str,
    edges: &HashMap<String, Vec<String>>,
    colour: &mut HashMap<String, Colour>,
    ordered: &mut Vec<String>,
) {
    match colour.get(name) {
        Some(Colour::Black) => return,
        Some(Colour::Grey) => {
            // Back edge: break the branch, both participants still resolve.
            debug!(target: RESOLVE_TARGET, module = name, "dependency cycle broken");
            return;
        }
        None => {}
    }
    colour.insert(name.to_owned(), Colour::Grey);
    if let Some(depends) = edges.get(name) {
        for dep in depends {
            visit(dep, edges, colour, ordered);
        }
    }
    colour.insert(name.to_owned(), Colour::Black);
    ordered.push(name.to_owned());
}

#[cfg(test)]
mod tests {
    use camino::Utf8Path;

    use super::*;
    use crate::manifest::MANIFEST_FILE;

    fn make_module(root: &Utf8Path, name: &str, depends: &[&str]) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).expect("create module dir");
        let list = depends
            .iter()
            .map(|dep| format!("  - {dep}\n"))
            .collect::<String>();
        std::fs::write(dir.join(MANIFEST_FILE), format!("depends:\n{list}"))
            .expect("write manifest");
    }

    fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().expect("create temp dir");
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf())
            .expect("temp dir should be utf-8");
        (temp, root)
    }

    fn open_filter() -> FilterConfig {
        FilterConfig::new(&[], &[]).expect("compile filter")
    }

    #[test]
    fn dependencies_precede_dependents() {
        let (_temp, root) = temp_root();
        make_module(&root, "accounting", &["base"]);
        make_module(&root, "base", &[]);
        make_module(&root, "sale", &["accounting", "base"]);

        let order = resolve(&[root], &open_filter()).expect("resolve");
        let index = |name: &str| {
            order
                .iter()
                .position(|module| module == name)
                .expect("module resolved")
        };
        assert!(index("base") < index("accounting"));
        assert!(index("accounting") < index("sale"));
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn resolution_is_deterministic() {
        let (_temp, root) = temp_root();
        for name in ["delta", "bravo", "echo", "alpha"] {
            make_module(&root, name, &[]);
        }
        let first = resolve(&[root.clone()], &open_filter()).expect("resolve");
        let second = resolve(&[root], &open_filter()).expect("resolve");
        assert_eq!(first, second);
        assert_eq!(first, ["alpha", "bravo", "delta", "echo"]);
    }

    #[test]
    fn cycles_emit_each_participant_once() {
        let (_temp, root) = temp_root();
        make_module(&root, "ouroboros_head", &["ouroboros_tail"]);
        make_module(&root, "ouroboros_tail", &["ouroboros_head"]);

        let order = resolve(&[root], &open_filter()).expect("resolve");
        assert_eq!(order.len(), 2);
        assert!(order.contains(&"ouroboros_head".to_owned()));
        assert!(order.contains(&"ouroboros_tail".to_owned()));
    }

    #[test]
    fn unknown_dependency_targets_are_ignored() {
        let (_temp, root) = temp_root();
        make_module(&root, "sale", &["not_installed_anywhere"]);

        let order = resolve(&[root], &open_filter()).expect("resolve");
        assert_eq!(order, ["sale"]);
    }

    #[test]
    fn filtered_modules_contribute_no_edges() {
        let (_temp, root) = temp_root();
        make_module(&root, "l10n_fr_tax", &[]);
        make_module(&root, "sale", &["l10n_fr_tax"]);

        let filter = FilterConfig::new(&[], &["en_AU".to_owned()]).expect("compile filter");
        let order = resolve(&[root], &filter).expect("resolve");
        assert_eq!(order, ["sale"]);
    }

    #[test]
    fn malformed_manifest_still_resolves_by_discovery() {
        let (_temp, root) = temp_root();
        make_module(&root, "base", &[]);
        let dir = root.join("broken");
        std::fs::create_dir_all(&dir).expect("create module dir");
        std::fs::write(dir.join(MANIFEST_FILE), "depends: [unclosed\n")
            .expect("write manifest");

        let order = resolve(&[root], &open_filter()).expect("resolve");
        assert!(order.contains(&"broken".to_owned()));
        assert!(order.contains(&"base".to_owned()));
    }

    #[test]
    fn mandatory_modules_are_forced_in() {
        let (_temp, root) = temp_root();
        make_module(&root, "sale", &[]);

        let mandatory = vec!["base".to_owned(), "web".to_owned()];
        let filter = FilterConfig::new(&["^web$".to_owned()], &[]).expect("compile filter");
        make_module(&root, "web", &[]);

        let order = resolve_with_mandatory(&[root], &filter, &mandatory).expect("resolve");
        assert!(order.contains(&"base".to_owned()), "undiscovered mandatory emitted");
        assert!(order.contains(&"web".to_owned()), "filter bypassed for mandatory");
        assert!(order.contains(&"sale".to_owned()));
    }
}
