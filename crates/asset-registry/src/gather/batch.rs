//! Gather result batches.
//!
//! The gatherer owns these until they are drained; ownership transfers to
//! the registry state when the scheduler calls
//! [`Gatherer::get_and_trim_results`](super::Gatherer::get_and_trim_results).

use std::path::PathBuf;

use thin_vec::ThinVec;

use crate::graph::{DependencyCategory, DependencyProperties};
use crate::types::{AssetIdentifier, AssetRecord, PackageKind, PackageLocation};

/// One outgoing dependency declared by a package.
#[derive(Debug, Clone)]
pub struct DependencyEdge {
    pub identifier: AssetIdentifier,
    pub category: DependencyCategory,
    pub properties: DependencyProperties,
}

/// All dependency and package-level metadata gathered for one package.
/// Applying this replaces the package's prior outgoing edges wholesale.
#[derive(Debug, Clone)]
pub struct PackageDependencyRecord {
    pub package_name: String,
    pub dependencies: Vec<DependencyEdge>,
    pub package_hash: u64,
    pub kind: PackageKind,
    pub chunk_ids: ThinVec<i32>,
    pub location: PackageLocation,
    pub has_package_data: bool,
}

/// A drained batch of gather results.
#[derive(Debug, Default)]
pub struct GatherBatch {
    /// Virtual directory paths discovered.
    pub paths: Vec<String>,
    /// Asset records with raw (not yet post-processed) tag data.
    pub assets: Vec<AssetRecord>,
    /// Per-package dependency records.
    pub dependencies: Vec<PackageDependencyRecord>,
    /// Packages whose backing file was removed.
    pub removed_packages: Vec<String>,
    /// Files that could not be read this gather.
    pub blocked_files: Vec<PathBuf>,
    /// Package files fully processed so far, for progress reporting.
    pub packages_processed: usize,
}

impl GatherBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
            && self.assets.is_empty()
            && self.dependencies.is_empty()
            && self.removed_packages.is_empty()
            && self.blocked_files.is_empty()
    }

    /// Moves everything out of `other` onto the end of `self`.
    pub fn append(&mut self, other: &mut GatherBatch) {
        self.paths.append(&mut other.paths);
        self.assets.append(&mut other.assets);
        self.dependencies.append(&mut other.dependencies);
        self.removed_packages.append(&mut other.removed_packages);
        self.blocked_files.append(&mut other.blocked_files);
        self.packages_processed += std::mem::take(&mut other.packages_processed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_transfers_ownership() {
        let mut into = GatherBatch::new();
        let mut from = GatherBatch::new();
        from.paths.push("/Game".into());
        from.packages_processed = 3;

        into.append(&mut from);
        assert!(from.is_empty());
        assert_eq!(from.packages_processed, 0);
        assert_eq!(into.paths.len(), 1);
        assert_eq!(into.packages_processed, 3);
    }
}
