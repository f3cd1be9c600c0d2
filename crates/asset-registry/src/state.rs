//! The authoritative in-memory index: asset records, package records, the
//! dependency graph, and the path tree.
//!
//! `RegistryState` is not thread-safe; callers hold the registry's interface
//! lock (write for mutation, read for queries). Secondary indexes by package
//! name, package path, and class are maintained on every mutation.

use std::sync::Arc;

use fnv::{FnvHashMap, FnvHashSet};

use crate::filter::{ClassInheritanceMap, CompiledFilter};
use crate::graph::{DependencyCategory, DependencyGraph, DependencyProperties};
use crate::path_tree::PathTree;
use crate::types::{AssetIdentifier, AssetRecord, NormalizedPath, PackageFlags, PackageRecord};

/// Tag carried by generator-class assets naming the class they generate.
pub const TAG_GENERATED_CLASS: &str = "GeneratedClass";
/// Tag carried by generator-class assets naming the parent class.
pub const TAG_PARENT_CLASS: &str = "ParentClass";

/// Which record wins an object-path collision between two packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionWinner {
    KeepExisting,
    TakeIncoming,
}

/// Pluggable collision tie-break. The deterministic default keeps the
/// lexicographically smaller package name.
pub type CollisionResolver = Arc<dyn Fn(&AssetRecord, &AssetRecord) -> CollisionWinner + Send + Sync>;

/// Conflict-resolution mode for [`RegistryState::initialize_from_existing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitializeMode {
    /// Wholesale replace the destination.
    Rebuild,
    /// Keep both sides; true key collisions go through the collision resolver.
    Append,
    /// Ignore assets already present in the destination.
    OnlyUpdateNew,
    /// Ignore assets not already present in the destination.
    OnlyUpdateExisting,
}

#[derive(Debug, Clone)]
struct ClassGeneratorInfo {
    generated_class: NormalizedPath,
    parent_class: NormalizedPath,
}

type IndexBuckets = FnvHashMap<NormalizedPath, Vec<NormalizedPath>>;

/// The authoritative registry tables.
#[derive(Default)]
pub struct RegistryState {
    assets: FnvHashMap<NormalizedPath, AssetRecord>,
    by_package_name: IndexBuckets,
    by_package_path: IndexBuckets,
    by_class: IndexBuckets,
    /// Package records keyed by normalized name; the display-cased name is
    /// kept beside the record for case-corrected lookups.
    packages: FnvHashMap<NormalizedPath, (String, PackageRecord)>,
    /// Packages legitimately observed with zero assets during gathering.
    empty_packages: FnvHashSet<NormalizedPath>,
    graph: DependencyGraph,
    path_tree: PathTree,
    /// Generator-class assets (keyed by asset key) feeding the class
    /// inheritance map used by recursive class filters.
    class_generators: FnvHashMap<NormalizedPath, ClassGeneratorInfo>,
    collision_resolver: Option<CollisionResolver>,
}

impl RegistryState {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Counters and access
    // -----------------------------------------------------------------------

    #[inline]
    pub fn num_assets(&self) -> usize {
        self.assets.len()
    }

    #[inline]
    pub fn num_packages(&self) -> usize {
        self.packages.len()
    }

    #[inline]
    pub fn num_depends_nodes(&self) -> usize {
        self.graph.num_nodes()
    }

    pub fn is_totally_empty(&self) -> bool {
        self.assets.is_empty()
            && self.packages.is_empty()
            && self.graph.num_nodes() == 0
            && self.path_tree.is_empty()
    }

    #[inline]
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    #[inline]
    pub fn graph_mut(&mut self) -> &mut DependencyGraph {
        &mut self.graph
    }

    #[inline]
    pub fn path_tree(&self) -> &PathTree {
        &self.path_tree
    }

    #[inline]
    pub fn path_tree_mut(&mut self) -> &mut PathTree {
        &mut self.path_tree
    }

    pub fn set_collision_resolver(&mut self, resolver: Option<CollisionResolver>) {
        self.collision_resolver = resolver;
    }

    // -----------------------------------------------------------------------
    // Asset mutation
    // -----------------------------------------------------------------------

    /// Inserts a record. Returns false if the key already exists (overwrite
    /// is disallowed; callers check-then-act, routing true collisions through
    /// [`Self::resolve_collision`]).
    pub fn add_asset(&mut self, record: AssetRecord) -> bool {
        let key = record.key();
        if self.assets.contains_key(&key) {
            return false;
        }
        self.index_insert(&key, &record);
        self.empty_packages.remove(&record.package_key());
        self.note_class_asset(&key, &record);
        self.assets.insert(key, record);
        true
    }

    /// Replaces the record at `key` with `new_record`, merging tags per
    /// `keep_deleted_tags` (true: union, old tags absent from new are
    /// retained; false: new tags replace entirely). Returns whether anything
    /// actually changed, or `None` when `key` has no record.
    pub fn update_asset(
        &mut self,
        key: &NormalizedPath,
        mut new_record: AssetRecord,
        keep_deleted_tags: bool,
    ) -> Option<bool> {
        let Some(existing) = self.assets.get(key) else {
            log::error!("update_asset called for {key} which is not present in the registry");
            return None;
        };

        if keep_deleted_tags {
            for (tag, value) in &existing.tags {
                new_record
                    .tags
                    .entry(tag.clone())
                    .or_insert_with(|| value.clone());
            }
        }

        let modified = *existing != new_record;
        let old_record = existing.clone();
        let new_key = new_record.key();

        // Secondary index dance: each key field that changed moves the asset
        // between buckets.
        if old_record.package_key() != new_record.package_key() || *key != new_key {
            bucket_remove(&mut self.by_package_name, &old_record.package_key(), key);
            bucket_add(&mut self.by_package_name, new_record.package_key(), new_key.clone());
        }
        if old_record.package_path_key() != new_record.package_path_key() || *key != new_key {
            bucket_remove(&mut self.by_package_path, &old_record.package_path_key(), key);
            bucket_add(&mut self.by_package_path, new_record.package_path_key(), new_key.clone());
        }
        if old_record.class_key() != new_record.class_key() || *key != new_key {
            bucket_remove(&mut self.by_class, &old_record.class_key(), key);
            bucket_add(&mut self.by_class, new_record.class_key(), new_key.clone());
        }

        self.class_generators.remove(key);
        self.note_class_asset(&new_key, &new_record);

        if *key != new_key {
            self.assets.remove(key);
            if self.assets.insert(new_key.clone(), new_record).is_some() {
                log::error!(
                    "update_asset moved {key} onto {new_key}, which was already present; \
                     the previous record was overwritten"
                );
            }
        } else {
            self.assets.insert(new_key, new_record);
        }
        Some(modified)
    }

    /// Removes the record at `key` from the index and all secondary indexes.
    /// Dependency-graph cleanup happens at package granularity via
    /// [`Self::remove_package`].
    pub fn remove_asset(&mut self, key: &NormalizedPath) -> Option<AssetRecord> {
        let record = self.assets.remove(key)?;
        bucket_remove(&mut self.by_package_name, &record.package_key(), key);
        bucket_remove(&mut self.by_package_path, &record.package_path_key(), key);
        bucket_remove(&mut self.by_class, &record.class_key(), key);
        self.class_generators.remove(key);
        Some(record)
    }

    /// Applies `flags` to every asset of a package. Returns whether any
    /// record was found.
    pub fn update_asset_data_package_flags(&mut self, package_name: &str, flags: PackageFlags) -> bool {
        let package_key = NormalizedPath::new(package_name);
        let Some(keys) = self.by_package_name.get(&package_key) else {
            return false;
        };
        let keys = keys.clone();
        let mut found = false;
        for key in keys {
            if let Some(record) = self.assets.get_mut(&key) {
                record.package_flags = flags;
                found = true;
            }
        }
        found
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    pub fn asset_by_object_path(&self, object_path: &str) -> Option<&AssetRecord> {
        self.assets.get(&NormalizedPath::new(object_path))
    }

    pub fn asset_by_key(&self, key: &NormalizedPath) -> Option<&AssetRecord> {
        self.assets.get(key)
    }

    /// Keys of every asset in a package.
    pub fn assets_in_package(&self, package_key: &NormalizedPath) -> &[NormalizedPath] {
        self.by_package_name
            .get(package_key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Package-level metadata with the case-corrected package name.
    pub fn package_data(&self, package_name: &str) -> Option<(&str, &PackageRecord)> {
        self.packages
            .get(&NormalizedPath::new(package_name))
            .map(|(name, record)| (name.as_str(), record))
    }

    pub fn set_package_data(&mut self, package_name: &str, record: PackageRecord) {
        self.packages
            .insert(NormalizedPath::new(package_name), (package_name.to_string(), record));
    }

    /// Removes the package record and cleans up the package's graph node.
    /// A node that still has referencers is kept as an edgeless placeholder
    /// so other packages' back-references stay resolvable.
    pub fn remove_package(&mut self, package_name: &str) -> bool {
        let package_key = NormalizedPath::new(package_name);
        let had_record = self.packages.remove(&package_key).is_some();
        self.empty_packages.remove(&package_key);

        let identifier = AssetIdentifier::from_package(package_name);
        if let Some(node) = self.graph.find_node(&identifier) {
            for category in DependencyCategory::ALL {
                self.graph.clear_edges(node, category);
            }
            if !self.graph.has_referencers(&identifier) {
                self.graph.remove_node(&identifier);
            }
        }
        had_record
    }

    pub fn mark_empty_package(&mut self, package_key: NormalizedPath) {
        self.empty_packages.insert(package_key);
    }

    pub fn is_empty_package(&self, package_key: &NormalizedPath) -> bool {
        self.empty_packages.contains(package_key)
    }

    pub(crate) fn empty_packages(&self) -> &FnvHashSet<NormalizedPath> {
        &self.empty_packages
    }

    pub(crate) fn packages(&self) -> impl Iterator<Item = (&str, &PackageRecord)> {
        self.packages.values().map(|(name, record)| (name.as_str(), record))
    }

    // -----------------------------------------------------------------------
    // Enumeration
    // -----------------------------------------------------------------------

    /// Enumerates assets matching `filter`, skipping any package in
    /// `packages_to_skip` (used by callers that already satisfied those from
    /// an in-memory pass). The visitor returns false to abort; the return
    /// value is false iff aborted.
    pub fn enumerate_assets<F>(
        &self,
        filter: &CompiledFilter,
        packages_to_skip: &FnvHashSet<NormalizedPath>,
        visitor: &mut F,
    ) -> bool
    where
        F: FnMut(&AssetRecord) -> bool,
    {
        // Pick the cheapest candidate set the filter allows, then verify each
        // candidate against the full filter.
        if !filter.object_paths.is_empty() {
            for key in &filter.object_paths {
                if let Some(record) = self.assets.get(key) {
                    if !self.visit_checked(record, filter, packages_to_skip, visitor) {
                        return false;
                    }
                }
            }
            return true;
        }
        if !filter.package_names.is_empty() {
            return self.visit_buckets(
                filter.package_names.iter(),
                &self.by_package_name,
                filter,
                packages_to_skip,
                visitor,
            );
        }
        if !filter.class_paths.is_empty() {
            return self.visit_buckets(
                filter.class_paths.iter(),
                &self.by_class,
                filter,
                packages_to_skip,
                visitor,
            );
        }
        if !filter.package_paths.is_empty() {
            if filter.recursive_paths {
                for (path, keys) in &self.by_package_path {
                    if filter.package_paths.iter().any(|base| path.is_under(base)) {
                        for key in keys {
                            if let Some(record) = self.assets.get(key) {
                                if !self.visit_checked(record, filter, packages_to_skip, visitor) {
                                    return false;
                                }
                            }
                        }
                    }
                }
                return true;
            }
            return self.visit_buckets(
                filter.package_paths.iter(),
                &self.by_package_path,
                filter,
                packages_to_skip,
                visitor,
            );
        }
        for record in self.assets.values() {
            if !self.visit_checked(record, filter, packages_to_skip, visitor) {
                return false;
            }
        }
        true
    }

    /// Enumerates every asset without a filter.
    pub fn enumerate_all_assets<F>(&self, visitor: &mut F) -> bool
    where
        F: FnMut(&AssetRecord) -> bool,
    {
        for record in self.assets.values() {
            if !visitor(record) {
                return false;
            }
        }
        true
    }

    fn visit_buckets<'a, I, F>(
        &self,
        wanted: I,
        buckets: &IndexBuckets,
        filter: &CompiledFilter,
        packages_to_skip: &FnvHashSet<NormalizedPath>,
        visitor: &mut F,
    ) -> bool
    where
        I: Iterator<Item = &'a NormalizedPath>,
        F: FnMut(&AssetRecord) -> bool,
    {
        for bucket_key in wanted {
            if let Some(keys) = buckets.get(bucket_key) {
                for key in keys {
                    if let Some(record) = self.assets.get(key) {
                        if !self.visit_checked(record, filter, packages_to_skip, visitor) {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    #[inline]
    fn visit_checked<F>(
        &self,
        record: &AssetRecord,
        filter: &CompiledFilter,
        packages_to_skip: &FnvHashSet<NormalizedPath>,
        visitor: &mut F,
    ) -> bool
    where
        F: FnMut(&AssetRecord) -> bool,
    {
        if packages_to_skip.contains(&record.package_key()) {
            return true;
        }
        if !filter.matches(record) {
            return true;
        }
        visitor(record)
    }

    // -----------------------------------------------------------------------
    // Class inheritance cache
    // -----------------------------------------------------------------------

    /// Documented side effect of asset mutation: a record that identifies a
    /// generator-class asset contributes to the class inheritance map.
    fn note_class_asset(&mut self, key: &NormalizedPath, record: &AssetRecord) {
        let (Some(generated), Some(parent)) = (
            record.tags.get(TAG_GENERATED_CLASS),
            record.tags.get(TAG_PARENT_CLASS),
        ) else {
            return;
        };
        self.class_generators.insert(
            key.clone(),
            ClassGeneratorInfo {
                generated_class: NormalizedPath::new(generated),
                parent_class: NormalizedPath::new(parent),
            },
        );
    }

    /// Child -> parent class map for recursive class filter compilation.
    pub fn class_inheritance_map(&self) -> ClassInheritanceMap {
        let mut map = ClassInheritanceMap::default();
        for info in self.class_generators.values() {
            map.insert(info.generated_class.clone(), info.parent_class.clone());
        }
        map
    }

    // -----------------------------------------------------------------------
    // Collision resolution
    // -----------------------------------------------------------------------

    /// Decides which of two records with the same object path wins. The
    /// deterministic fallback keeps the lexicographically smaller package
    /// name; either way the loss is logged loudly, never fatal.
    pub fn resolve_collision(&self, existing: &AssetRecord, incoming: &AssetRecord) -> CollisionWinner {
        let winner = match &self.collision_resolver {
            Some(resolver) => resolver(existing, incoming),
            None => {
                if incoming.package_name.to_ascii_lowercase() < existing.package_name.to_ascii_lowercase() {
                    CollisionWinner::TakeIncoming
                } else {
                    CollisionWinner::KeepExisting
                }
            }
        };
        log::error!(
            "object path collision on {}: packages {} and {}; keeping {}",
            existing.object_path,
            existing.package_name,
            incoming.package_name,
            match winner {
                CollisionWinner::KeepExisting => &existing.package_name,
                CollisionWinner::TakeIncoming => &incoming.package_name,
            }
        );
        winner
    }

    // -----------------------------------------------------------------------
    // Merging
    // -----------------------------------------------------------------------

    /// Merges `other` into `self` per `mode`. Packages, paths, and graph
    /// edges are unioned in every mode except `OnlyUpdateExisting`, which
    /// touches asset records (and their packages) only.
    pub fn initialize_from_existing(&mut self, other: &RegistryState, mode: InitializeMode) {
        if mode == InitializeMode::Rebuild {
            *self = RegistryState {
                collision_resolver: self.collision_resolver.clone(),
                ..RegistryState::default()
            };
        }

        for record in other.assets.values() {
            let key = record.key();
            match (self.assets.contains_key(&key), mode) {
                (false, InitializeMode::OnlyUpdateExisting) => {}
                (false, _) => {
                    self.add_asset(record.clone());
                }
                (true, InitializeMode::OnlyUpdateNew) => {}
                (true, InitializeMode::Append) => {
                    let existing = &self.assets[&key];
                    if existing.package_key() == record.package_key() {
                        self.update_asset(&key, record.clone(), false);
                    } else if self.resolve_collision(existing, record) == CollisionWinner::TakeIncoming {
                        self.update_asset(&key, record.clone(), false);
                    }
                }
                (true, _) => {
                    self.update_asset(&key, record.clone(), false);
                }
            }
        }

        let touch_all = mode != InitializeMode::OnlyUpdateExisting;
        for (name, record) in other.packages() {
            let key = NormalizedPath::new(name);
            if touch_all || self.by_package_name.contains_key(&key) {
                self.set_package_data(name, record.clone());
            }
        }
        if touch_all {
            for key in &other.empty_packages {
                self.empty_packages.insert(key.clone());
            }
            other.path_tree.enumerate_all(&mut |path| {
                self.path_tree.add_path(path);
                true
            });
            let mut edges: Vec<(AssetIdentifier, AssetIdentifier, DependencyCategory, DependencyProperties)> =
                Vec::new();
            other.graph.for_each_edge(|source, target, category, properties| {
                edges.push((source.clone(), target.clone(), category, properties));
            });
            for (source, target, category, properties) in edges {
                let source = self.graph.create_or_find_node(&source);
                let target = self.graph.create_or_find_node(&target);
                self.graph.add_edge(source, target, category, properties);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    pub fn log_stats(&self) {
        log::info!(
            "registry state: {} assets, {} packages ({} empty), {} depends nodes, {} edges, {} paths",
            self.num_assets(),
            self.num_packages(),
            self.empty_packages.len(),
            self.graph.num_nodes(),
            self.graph.num_edges(),
            self.path_tree.len(),
        );
    }

    // -----------------------------------------------------------------------
    // Index upkeep
    // -----------------------------------------------------------------------

    fn index_insert(&mut self, key: &NormalizedPath, record: &AssetRecord) {
        bucket_add(&mut self.by_package_name, record.package_key(), key.clone());
        bucket_add(&mut self.by_package_path, record.package_path_key(), key.clone());
        bucket_add(&mut self.by_class, record.class_key(), key.clone());
    }
}

fn bucket_add(buckets: &mut IndexBuckets, bucket_key: NormalizedPath, key: NormalizedPath) {
    buckets.entry(bucket_key).or_default().push(key);
}

fn bucket_remove(buckets: &mut IndexBuckets, bucket_key: &NormalizedPath, key: &NormalizedPath) {
    if let Some(bucket) = buckets.get_mut(bucket_key) {
        if let Some(pos) = bucket.iter().position(|k| k == key) {
            bucket.swap_remove(pos);
        }
        if bucket.is_empty() {
            buckets.remove(bucket_key);
        }
    }
}
