//! Asset enumeration filters.
//!
//! A raw [`AssetFilter`] is compiled into a normalized [`CompiledFilter`]
//! before matching: keys are case-folded once, recursive class sets are
//! expanded through the class inheritance map, and empty filters are
//! rejected up front so the match loop stays branch-light.

use fnv::{FnvHashMap, FnvHashSet};

use crate::types::{AssetRecord, NormalizedPath, PackageFlags};

/// Raw, caller-facing filter over asset records. All lists are OR within a
/// field and AND across fields.
#[derive(Debug, Clone, Default)]
pub struct AssetFilter {
    /// Exact package names.
    pub package_names: Vec<String>,
    /// Virtual directory paths, exact or recursive per `recursive_paths`.
    pub package_paths: Vec<String>,
    pub recursive_paths: bool,
    /// Asset class paths, optionally expanded through subclasses.
    pub class_paths: Vec<String>,
    pub recursive_classes: bool,
    /// Classes excluded from recursive expansion.
    pub recursive_classes_exclusion: Vec<String>,
    /// Exact object paths.
    pub object_paths: Vec<String>,
    /// Tag presence (value `None`) or tag/value equality requirements.
    pub tags_and_values: Vec<(String, Option<String>)>,
    /// Package flag bits that must all be present.
    pub include_package_flags: PackageFlags,
    /// Package flag bits that must all be absent.
    pub exclude_package_flags: PackageFlags,
}

impl AssetFilter {
    /// A filter with no criteria matches nothing and fails compilation;
    /// callers wanting "all assets" enumerate without a filter.
    pub fn is_empty(&self) -> bool {
        self.package_names.is_empty()
            && self.package_paths.is_empty()
            && self.class_paths.is_empty()
            && self.object_paths.is_empty()
            && self.tags_and_values.is_empty()
            && self.include_package_flags.is_empty()
            && self.exclude_package_flags.is_empty()
    }
}

/// Child class -> parent class map, fed by the registry's generator-class
/// cache. Used only to expand recursive class filters.
pub type ClassInheritanceMap = FnvHashMap<NormalizedPath, NormalizedPath>;

/// A compiled, normalized filter ready for matching.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    pub(crate) package_names: FnvHashSet<NormalizedPath>,
    pub(crate) package_paths: Vec<NormalizedPath>,
    pub(crate) recursive_paths: bool,
    pub(crate) class_paths: FnvHashSet<NormalizedPath>,
    pub(crate) object_paths: FnvHashSet<NormalizedPath>,
    tags_and_values: Vec<(String, Option<String>)>,
    include_package_flags: PackageFlags,
    exclude_package_flags: PackageFlags,
}

impl CompiledFilter {
    /// Compiles `filter`, expanding recursive classes through `classes`.
    /// Returns `None` for an empty filter (caller-misuse, not an error).
    pub fn compile(filter: &AssetFilter, classes: &ClassInheritanceMap) -> Option<Self> {
        if filter.is_empty() {
            return None;
        }

        let mut class_paths: FnvHashSet<NormalizedPath> = filter
            .class_paths
            .iter()
            .map(|c| NormalizedPath::new(c))
            .collect();
        if filter.recursive_classes && !class_paths.is_empty() {
            let exclusion: FnvHashSet<NormalizedPath> = filter
                .recursive_classes_exclusion
                .iter()
                .map(|c| NormalizedPath::new(c))
                .collect();
            class_paths = expand_recursive_classes(&class_paths, &exclusion, classes);
        }

        Some(Self {
            package_names: filter
                .package_names
                .iter()
                .map(|n| NormalizedPath::new(n))
                .collect(),
            package_paths: filter
                .package_paths
                .iter()
                .map(|p| NormalizedPath::new(p.trim_end_matches('/')))
                .collect(),
            recursive_paths: filter.recursive_paths,
            class_paths,
            object_paths: filter
                .object_paths
                .iter()
                .map(|p| NormalizedPath::new(p))
                .collect(),
            tags_and_values: filter.tags_and_values.clone(),
            include_package_flags: filter.include_package_flags,
            exclude_package_flags: filter.exclude_package_flags,
        })
    }

    /// Full verification of one record against every criterion.
    pub fn matches(&self, record: &AssetRecord) -> bool {
        if !self.package_names.is_empty() && !self.package_names.contains(&record.package_key()) {
            return false;
        }
        if !self.object_paths.is_empty() && !self.object_paths.contains(&record.key()) {
            return false;
        }
        if !self.class_paths.is_empty() && !self.class_paths.contains(&record.class_key()) {
            return false;
        }
        if !self.package_paths.is_empty() {
            let record_path = record.package_path_key();
            let hit = if self.recursive_paths {
                self.package_paths.iter().any(|base| record_path.is_under(base))
            } else {
                self.package_paths.iter().any(|base| record_path == *base)
            };
            if !hit {
                return false;
            }
        }
        for (tag, value) in &self.tags_and_values {
            match (record.tags.get(tag), value) {
                (None, _) => return false,
                (Some(found), Some(wanted)) if found != wanted => return false,
                _ => {}
            }
        }
        if !record.package_flags.contains(self.include_package_flags) {
            return false;
        }
        if !(record.package_flags & self.exclude_package_flags).is_empty() {
            return false;
        }
        true
    }
}

/// Walks the child->parent map transitively: a class is included when any
/// ancestor is in the requested set and no ancestor on the way is excluded.
fn expand_recursive_classes(
    requested: &FnvHashSet<NormalizedPath>,
    exclusion: &FnvHashSet<NormalizedPath>,
    classes: &ClassInheritanceMap,
) -> FnvHashSet<NormalizedPath> {
    let mut out: FnvHashSet<NormalizedPath> = requested
        .iter()
        .filter(|c| !exclusion.contains(*c))
        .cloned()
        .collect();
    for child in classes.keys() {
        if out.contains(child) || exclusion.contains(child) {
            continue;
        }
        let mut current = child;
        let mut hops = 0;
        while let Some(parent) = classes.get(current) {
            if exclusion.contains(parent) {
                break;
            }
            if requested.contains(parent) {
                out.insert(child.clone());
                break;
            }
            current = parent;
            hops += 1;
            if hops > classes.len() {
                // Inheritance cycle; bail out for this chain.
                break;
            }
        }
    }
    out
}
