//! Directed multigraph over asset/package identifiers.
//!
//! One [`DependsNode`] per distinct identifier, created lazily with
//! create-or-find semantics. Edges are categorized and carry additive
//! property flags; every forward edge has a matching referencer backlink and
//! the double bookkeeping is kept consistent on every add/remove.
//!
//! Adjacency lists are optionally kept sorted by target identifier for
//! deterministic iteration; sorting is deferred during bulk loading and
//! performed once when the initial search completes.

use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use thin_vec::ThinVec;

use crate::types::AssetIdentifier;

// ---------------------------------------------------------------------------
// Categories and properties
// ---------------------------------------------------------------------------

/// Edge category. Package dependencies come from the package header,
/// searchable names from object declarations, manage edges from the
/// manage-reference graph search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DependencyCategory {
    Package = 0,
    SearchableName = 1,
    Manage = 2,
}

impl DependencyCategory {
    pub const ALL: [Self; 3] = [Self::Package, Self::SearchableName, Self::Manage];

    #[inline]
    fn index(self) -> usize {
        self as usize
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Package),
            1 => Some(Self::SearchableName),
            2 => Some(Self::Manage),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Property flags on a dependency edge. Flags are additive: coalescing
    /// duplicate edges unions them, never drops bits. A soft dependency is
    /// the absence of `HARD`.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct DependencyProperties: u8 {
        /// Target is required at load time.
        const HARD = 1 << 0;
        /// Dependency is used by the game at runtime, not just builds.
        const GAME = 1 << 1;
        /// Dependency is needed to build the referencing asset.
        const BUILD = 1 << 2;
        /// Manage edge was set directly on a seed, not via recursion.
        const DIRECT = 1 << 3;
    }
}

/// A `{required, excluded}` property-flag filter. An edge matches iff
/// `(flags & required) == required && (flags & excluded) == 0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DependencyQuery {
    pub required: DependencyProperties,
    pub excluded: DependencyProperties,
}

impl DependencyQuery {
    pub fn with_required(required: DependencyProperties) -> Self {
        Self {
            required,
            excluded: DependencyProperties::empty(),
        }
    }

    #[inline]
    pub fn matches(&self, flags: DependencyProperties) -> bool {
        flags.contains(self.required) && (flags & self.excluded).is_empty()
    }
}

/// One dependency or referencer result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetDependency {
    pub identifier: AssetIdentifier,
    pub category: DependencyCategory,
    pub properties: DependencyProperties,
}

// ---------------------------------------------------------------------------
// Node storage
// ---------------------------------------------------------------------------

/// A compact 32-bit index into the node slab. `u32::MAX` is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct DependsNodeId(u32);

impl DependsNodeId {
    #[inline]
    fn new(index: usize) -> Self {
        assert!(index < u32::MAX as usize, "depends node index overflow");
        Self(index as u32)
    }

    #[inline]
    pub fn get(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Edge {
    target: DependsNodeId,
    properties: DependencyProperties,
}

/// Graph node for one identifier: per-category outgoing edges plus incoming
/// referencer backlinks.
#[derive(Debug)]
struct DependsNode {
    identifier: AssetIdentifier,
    edges: [ThinVec<Edge>; 3],
    referencers: ThinVec<DependsNodeId>,
    sorted: [bool; 3],
}

impl DependsNode {
    fn new(identifier: AssetIdentifier) -> Self {
        Self {
            identifier,
            edges: Default::default(),
            referencers: ThinVec::new(),
            sorted: [false; 3],
        }
    }

    fn has_edge_to(&self, target: DependsNodeId) -> bool {
        self.edges
            .iter()
            .any(|bucket| bucket.iter().any(|edge| edge.target == target))
    }

    fn is_empty(&self) -> bool {
        self.edges.iter().all(|bucket| bucket.is_empty()) && self.referencers.is_empty()
    }
}

/// The DependsNode store.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    slots: Vec<Option<DependsNode>>,
    free: Vec<DependsNodeId>,
    index: FnvHashMap<AssetIdentifier, DependsNodeId>,
    /// Whether adjacency lists are kept eagerly sorted. Off during bulk
    /// loading for throughput.
    sort_enabled: bool,
    num_nodes: usize,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_edges(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .map(|node| node.edges.iter().map(ThinVec::len).sum::<usize>())
            .sum()
    }

    /// Finds the node for an identifier, or creates it. Idempotent.
    pub fn create_or_find_node(&mut self, identifier: &AssetIdentifier) -> DependsNodeId {
        if let Some(&id) = self.index.get(identifier) {
            return id;
        }
        let node = DependsNode::new(identifier.clone());
        let id = match self.free.pop() {
            Some(id) => {
                self.slots[id.get()] = Some(node);
                id
            }
            None => {
                let id = DependsNodeId::new(self.slots.len());
                self.slots.push(Some(node));
                id
            }
        };
        self.index.insert(identifier.clone(), id);
        self.num_nodes += 1;
        id
    }

    /// Lookup-only variant; never creates.
    pub fn find_node(&self, identifier: &AssetIdentifier) -> Option<DependsNodeId> {
        self.index.get(identifier).copied()
    }

    pub fn identifier_of(&self, id: DependsNodeId) -> Option<&AssetIdentifier> {
        self.node(id).map(|node| &node.identifier)
    }

    #[inline]
    fn node(&self, id: DependsNodeId) -> Option<&DependsNode> {
        self.slots.get(id.get()).and_then(Option::as_ref)
    }

    #[inline]
    fn node_mut(&mut self, id: DependsNodeId) -> Option<&mut DependsNode> {
        self.slots.get_mut(id.get()).and_then(Option::as_mut)
    }

    /// Adds a forward edge plus the matching backward referencer link.
    ///
    /// Duplicate edges between the same pair and category coalesce into one
    /// edge with a unioned property set. Self-edges are silently dropped.
    pub fn add_edge(
        &mut self,
        source: DependsNodeId,
        target: DependsNodeId,
        category: DependencyCategory,
        properties: DependencyProperties,
    ) {
        if source == target {
            return;
        }
        let Some(node) = self.node_mut(source) else {
            return;
        };
        let bucket = &mut node.edges[category.index()];
        if let Some(edge) = bucket.iter_mut().find(|edge| edge.target == target) {
            edge.properties |= properties;
            return;
        }
        bucket.push(Edge { target, properties });
        node.sorted[category.index()] = false;

        if let Some(target_node) = self.node_mut(target) {
            if !target_node.referencers.contains(&source) {
                target_node.referencers.push(source);
            }
        }
        if self.sort_enabled {
            self.sort_bucket(source, category);
        }
    }

    /// Removes all outgoing edges of a category from a node. The backlink on
    /// each target is dropped unless an edge via another category keeps the
    /// relationship alive.
    pub fn clear_edges(&mut self, source: DependsNodeId, category: DependencyCategory) {
        let Some(node) = self.node_mut(source) else {
            return;
        };
        let removed: Vec<DependsNodeId> = std::mem::take(&mut node.edges[category.index()])
            .into_iter()
            .map(|edge| edge.target)
            .collect();
        node.sorted[category.index()] = true;
        for target in removed {
            let still_linked = self
                .node(source)
                .map(|node| node.has_edge_to(target))
                .unwrap_or(false);
            if !still_linked {
                if let Some(target_node) = self.node_mut(target) {
                    target_node.referencers.retain(|&r| r != source);
                }
            }
        }
    }

    /// Dependencies of `identifier` in the given categories matching `query`.
    /// A missing identifier yields an empty result.
    pub fn get_dependencies(
        &self,
        identifier: &AssetIdentifier,
        categories: &[DependencyCategory],
        query: DependencyQuery,
    ) -> Vec<AssetDependency> {
        let mut out = Vec::new();
        let Some(id) = self.find_node(identifier) else {
            return out;
        };
        let Some(node) = self.node(id) else {
            return out;
        };
        for &category in categories {
            for edge in &node.edges[category.index()] {
                if !query.matches(edge.properties) {
                    continue;
                }
                if let Some(target) = self.node(edge.target) {
                    out.push(AssetDependency {
                        identifier: target.identifier.clone(),
                        category,
                        properties: edge.properties,
                    });
                }
            }
        }
        out
    }

    /// Referencers of `identifier`: nodes with a matching forward edge to it
    /// in any of the given categories. De-duplicated by identifier.
    pub fn get_referencers(
        &self,
        identifier: &AssetIdentifier,
        categories: &[DependencyCategory],
        query: DependencyQuery,
    ) -> Vec<AssetDependency> {
        let mut out = Vec::new();
        let Some(id) = self.find_node(identifier) else {
            return out;
        };
        let Some(node) = self.node(id) else {
            return out;
        };
        for &referencer_id in &node.referencers {
            let Some(referencer) = self.node(referencer_id) else {
                continue;
            };
            let mut matched: Option<(DependencyCategory, DependencyProperties)> = None;
            for &category in categories {
                for edge in &referencer.edges[category.index()] {
                    if edge.target == id && query.matches(edge.properties) {
                        matched = match matched {
                            // Union properties across categories; keep the first category.
                            Some((cat, props)) => Some((cat, props | edge.properties)),
                            None => Some((category, edge.properties)),
                        };
                    }
                }
            }
            if let Some((category, properties)) = matched {
                out.push(AssetDependency {
                    identifier: referencer.identifier.clone(),
                    category,
                    properties,
                });
            }
        }
        out
    }

    /// Toggles eager adjacency sorting. Enabling sorts every list once.
    pub fn set_sort_enabled(&mut self, enabled: bool) {
        self.sort_enabled = enabled;
        if !enabled {
            return;
        }
        let ids: Vec<DependsNodeId> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| DependsNodeId::new(i))
            .collect();
        for id in ids {
            for category in DependencyCategory::ALL {
                self.sort_bucket(id, category);
            }
            self.sort_referencers(id);
        }
    }

    #[inline]
    pub fn is_sort_enabled(&self) -> bool {
        self.sort_enabled
    }

    /// Whether a node's adjacency list for a category is currently sorted.
    pub fn is_sorted(&self, identifier: &AssetIdentifier, category: DependencyCategory) -> bool {
        self.find_node(identifier)
            .and_then(|id| self.node(id))
            .map(|node| node.sorted[category.index()])
            .unwrap_or(false)
    }

    /// Per-node sortedness control: sorts one adjacency list now, or marks
    /// it unsorted so a later bulk pass redoes it.
    pub fn set_sorted(&mut self, identifier: &AssetIdentifier, category: DependencyCategory, sorted: bool) {
        let Some(id) = self.find_node(identifier) else {
            return;
        };
        if sorted {
            self.sort_bucket(id, category);
        } else if let Some(node) = self.node_mut(id) {
            node.sorted[category.index()] = false;
        }
    }

    fn sort_bucket(&mut self, id: DependsNodeId, category: DependencyCategory) {
        let Some(node) = self.node(id) else {
            return;
        };
        if node.sorted[category.index()] {
            return;
        }
        let mut edges: Vec<Edge> = node.edges[category.index()].iter().copied().collect();
        edges.sort_by(|a, b| {
            let left = self.node(a.target).map(|n| &n.identifier);
            let right = self.node(b.target).map(|n| &n.identifier);
            left.cmp(&right)
        });
        if let Some(node) = self.node_mut(id) {
            node.edges[category.index()] = edges.into_iter().collect();
            node.sorted[category.index()] = true;
        }
    }

    fn sort_referencers(&mut self, id: DependsNodeId) {
        let Some(node) = self.node(id) else {
            return;
        };
        let mut referencers: Vec<DependsNodeId> = node.referencers.iter().copied().collect();
        referencers.sort_by(|&a, &b| {
            let left = self.node(a).map(|n| &n.identifier);
            let right = self.node(b).map(|n| &n.identifier);
            left.cmp(&right)
        });
        if let Some(node) = self.node_mut(id) {
            node.referencers = referencers.into_iter().collect();
        }
    }

    /// Removes a node entirely, unlinking it from all dependency and
    /// referencer lists. Returns false when the identifier has no node.
    pub fn remove_node(&mut self, identifier: &AssetIdentifier) -> bool {
        let Some(id) = self.find_node(identifier) else {
            return false;
        };
        let Some(node) = self.node(id) else {
            return false;
        };
        let targets: Vec<DependsNodeId> = node
            .edges
            .iter()
            .flat_map(|bucket| bucket.iter().map(|edge| edge.target))
            .collect();
        let referencers: Vec<DependsNodeId> = node.referencers.iter().copied().collect();

        for target in targets {
            if let Some(target_node) = self.node_mut(target) {
                target_node.referencers.retain(|&r| r != id);
            }
        }
        for referencer in referencers {
            if let Some(referencer_node) = self.node_mut(referencer) {
                for bucket in referencer_node.edges.iter_mut() {
                    bucket.retain(|edge| edge.target != id);
                }
            }
        }

        self.index.remove(identifier);
        self.slots[id.get()] = None;
        self.free.push(id);
        self.num_nodes -= 1;
        true
    }

    /// Whether the node has any incoming referencer links.
    pub fn has_referencers(&self, identifier: &AssetIdentifier) -> bool {
        self.find_node(identifier)
            .and_then(|id| self.node(id))
            .map(|node| !node.referencers.is_empty())
            .unwrap_or(false)
    }

    /// Whether the node carries no edges in either direction.
    pub fn is_empty_node(&self, identifier: &AssetIdentifier) -> bool {
        self.find_node(identifier)
            .and_then(|id| self.node(id))
            .map(DependsNode::is_empty)
            .unwrap_or(false)
    }

    /// Visits every (source, target, category, properties) edge, used by
    /// persistence and merging.
    pub fn for_each_edge<F>(&self, mut visitor: F)
    where
        F: FnMut(&AssetIdentifier, &AssetIdentifier, DependencyCategory, DependencyProperties),
    {
        for node in self.slots.iter().flatten() {
            for category in DependencyCategory::ALL {
                for edge in &node.edges[category.index()] {
                    if let Some(target) = self.node(edge.target) {
                        visitor(&node.identifier, &target.identifier, category, edge.properties);
                    }
                }
            }
        }
    }

    /// Visits every identifier with a node, including placeholder nodes that
    /// have no asset record.
    pub fn for_each_identifier<F>(&self, mut visitor: F)
    where
        F: FnMut(&AssetIdentifier),
    {
        for node in self.slots.iter().flatten() {
            visitor(&node.identifier);
        }
    }
}
