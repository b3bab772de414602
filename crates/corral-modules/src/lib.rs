//! Module catalogue, filtering, dependency resolution, and vendor sync.
//!
//! A module is a directory containing a `manifest.yaml`. This crate walks
//! the configured roots, prunes candidates through the blocklist and
//! localisation filters, orders the survivors so dependencies install
//! first, and keeps the live module roots in step with the vendored trees
//! shipped in the image.

mod catalogue;
mod filter;
mod manifest;
mod resolve;
mod vendor;

pub use catalogue::{CatalogueError, ModuleCandidate, discover};
pub use filter::{FilterConfig, FilterError};
pub use manifest::{MANIFEST_FILE, ManifestError, ModuleManifest};
pub use resolve::{resolve, resolve_with_mandatory};
pub use vendor::{SyncReport, VendorError, sync_module_tree};
