//! Registry state persistence.
//!
//! The persisted form is postcard-encoded and zstd-compressed, guarded by a
//! format-version constant. File writes go through a temp file and an atomic
//! rename. `SerializationOptions` controls which fields are elided for
//! space; everything not excluded round-trips exactly.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::thread::available_parallelism;

use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};
use crate::graph::{DependencyCategory, DependencyProperties};
use crate::state::RegistryState;
use crate::types::{AssetIdentifier, AssetRecord, NormalizedPath, PackageRecord, TagMap};

/// State format version - increment when changing the persisted layout.
pub const STATE_FORMAT_VERSION: u32 = 1;

/// Zstd compression level used for state files.
const STATE_COMPRESSION_LEVEL: i32 = 6;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Whether a per-class tag list is an allow-list or a deny-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagFilterMode {
    Allow,
    Deny,
}

/// Per-asset-class tag filtering for serialization.
#[derive(Debug, Clone)]
pub struct TagFilter {
    pub mode: TagFilterMode,
    /// Class path -> tag names the mode applies to. Classes not listed are
    /// passed through unfiltered.
    pub classes: FnvHashMap<NormalizedPath, Vec<String>>,
}

/// Controls which fields `save` elides.
#[derive(Debug, Clone)]
pub struct SerializationOptions {
    pub include_dependencies: bool,
    pub include_searchable_name_dependencies: bool,
    pub include_manage_dependencies: bool,
    pub include_package_data: bool,
    pub tag_filter: Option<TagFilter>,
    /// Skip assets whose tag map is empty after filtering.
    pub filter_assets_with_no_tags: bool,
}

impl SerializationOptions {
    /// Everything included; the round-trip law holds field-for-field.
    pub fn full() -> Self {
        Self {
            include_dependencies: true,
            include_searchable_name_dependencies: true,
            include_manage_dependencies: true,
            include_package_data: true,
            tag_filter: None,
            filter_assets_with_no_tags: false,
        }
    }

    fn included_categories(&self) -> Vec<DependencyCategory> {
        let mut out = Vec::new();
        if self.include_dependencies {
            out.push(DependencyCategory::Package);
            if self.include_searchable_name_dependencies {
                out.push(DependencyCategory::SearchableName);
            }
            if self.include_manage_dependencies {
                out.push(DependencyCategory::Manage);
            }
        }
        out
    }
}

impl Default for SerializationOptions {
    fn default() -> Self {
        Self::full()
    }
}

/// Applies the per-class tag filter to one record's tags.
pub(crate) fn filtered_tags(record: &AssetRecord, options: &SerializationOptions) -> TagMap {
    let Some(filter) = &options.tag_filter else {
        return record.tags.clone();
    };
    let Some(names) = filter.classes.get(&record.class_key()) else {
        return record.tags.clone();
    };
    record
        .tags
        .iter()
        .filter(|(tag, _)| {
            let listed = names.iter().any(|n| n == *tag);
            match filter.mode {
                TagFilterMode::Allow => listed,
                TagFilterMode::Deny => !listed,
            }
        })
        .map(|(tag, value)| (tag.clone(), value.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Persisted layout
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct PersistedEdge {
    source: u32,
    target: u32,
    category: u8,
    properties: u8,
}

#[derive(Serialize, Deserialize)]
struct PersistedState {
    version: u32,
    assets: Vec<AssetRecord>,
    packages: Vec<(String, PackageRecord)>,
    empty_packages: Vec<String>,
    paths: Vec<String>,
    identifiers: Vec<AssetIdentifier>,
    edges: Vec<PersistedEdge>,
}

// ---------------------------------------------------------------------------
// Save
// ---------------------------------------------------------------------------

/// Serializes `state` into `writer` per `options`.
pub fn save(state: &RegistryState, writer: impl Write, options: &SerializationOptions) -> Result<()> {
    let mut assets: Vec<AssetRecord> = Vec::with_capacity(state.num_assets());
    state.enumerate_all_assets(&mut |record| {
        let tags = filtered_tags(record, options);
        if options.filter_assets_with_no_tags && tags.is_empty() {
            return true;
        }
        let mut out = record.clone();
        out.tags = tags;
        assets.push(out);
        true
    });
    // Deterministic output independent of hash-map iteration order.
    assets.sort_by(|a, b| a.object_path.cmp(&b.object_path));

    let mut packages: Vec<(String, PackageRecord)> = Vec::new();
    let mut empty_packages: Vec<String> = Vec::new();
    if options.include_package_data {
        packages = state
            .packages()
            .map(|(name, record)| (name.to_string(), record.clone()))
            .collect();
        packages.sort_by(|a, b| a.0.cmp(&b.0));
        empty_packages = state.empty_packages().iter().map(|k| k.as_str().to_string()).collect();
        empty_packages.sort();
    }

    let categories = options.included_categories();
    let mut identifiers: Vec<AssetIdentifier> = Vec::new();
    let mut edges: Vec<PersistedEdge> = Vec::new();
    if !categories.is_empty() {
        state.graph().for_each_identifier(|identifier| {
            identifiers.push(identifier.clone());
        });
        identifiers.sort();
        let index: FnvHashMap<&AssetIdentifier, u32> = identifiers
            .iter()
            .enumerate()
            .map(|(i, id)| (id, i as u32))
            .collect();
        state.graph().for_each_edge(|source, target, category, properties| {
            if categories.contains(&category) {
                edges.push(PersistedEdge {
                    source: index[source],
                    target: index[target],
                    category: category as u8,
                    properties: properties.bits(),
                });
            }
        });
        edges.sort_by_key(|edge| (edge.source, edge.category, edge.target));
    }

    let mut paths = state.path_tree().paths();
    paths.sort();

    let persisted = PersistedState {
        version: STATE_FORMAT_VERSION,
        assets,
        packages,
        empty_packages,
        paths,
        identifiers,
        edges,
    };

    let mut encoder = zstd::Encoder::new(writer, STATE_COMPRESSION_LEVEL)
        .map_err(|error| RegistryError::Serialization(format!("failed to create zstd encoder: {error}")))?;
    let threads = available_parallelism().map(|x| x.get() as u32).unwrap_or(4);
    encoder
        .multithread(threads)
        .map_err(|error| RegistryError::Serialization(format!("failed to enable multi-threaded zstd: {error}")))?;
    let mut output = BufWriter::new(encoder.auto_finish());
    postcard::to_io(&persisted, &mut output)
        .map_err(|error| RegistryError::Serialization(format!("failed to encode state with postcard: {error}")))?;
    output
        .flush()
        .map_err(|error| RegistryError::Serialization(format!("failed to flush state stream: {error}")))?;
    Ok(())
}

/// Writes `state` to a file via temp file + atomic rename.
pub fn save_to_path(state: &RegistryState, path: &Path, options: &SerializationOptions) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    {
        let output = File::create(&tmp_path)?;
        save(state, output, options)?;
    }
    fs::rename(&tmp_path, path)?;
    log::debug!("wrote registry state to {}", path.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Deserializes a state written by [`save`]. Returns a fresh state; merging
/// into a live registry goes through `initialize_from_existing`.
pub fn load(reader: impl Read) -> Result<RegistryState> {
    let decoder = zstd::Decoder::new(reader)
        .map_err(|error| RegistryError::Serialization(format!("failed to create zstd decoder: {error}")))?;
    let mut input = BufReader::new(decoder);
    let mut scratch = vec![0u8; 4 * 1024];
    let (persisted, _): (PersistedState, _) = postcard::from_io((&mut input, &mut scratch))
        .map_err(|error| RegistryError::Serialization(format!("failed to decode state with postcard: {error}")))?;

    if persisted.version != STATE_FORMAT_VERSION {
        return Err(RegistryError::VersionMismatch {
            found: persisted.version,
            expected: STATE_FORMAT_VERSION,
        });
    }

    let mut state = RegistryState::new();
    for record in persisted.assets {
        if !state.add_asset(record) {
            return Err(RegistryError::Serialization(
                "duplicate object path in persisted state".to_string(),
            ));
        }
    }
    for (name, record) in persisted.packages {
        state.set_package_data(&name, record);
    }
    for name in persisted.empty_packages {
        state.mark_empty_package(NormalizedPath::new(&name));
    }
    for path in persisted.paths {
        state.path_tree_mut().add_path(&path);
    }

    let nodes: Vec<_> = persisted
        .identifiers
        .iter()
        .map(|identifier| state.graph_mut().create_or_find_node(identifier))
        .collect();
    for edge in persisted.edges {
        let (Some(&source), Some(&target)) =
            (nodes.get(edge.source as usize), nodes.get(edge.target as usize))
        else {
            return Err(RegistryError::Serialization(
                "edge references out-of-range identifier".to_string(),
            ));
        };
        let Some(category) = DependencyCategory::from_u8(edge.category) else {
            return Err(RegistryError::Serialization(format!(
                "unknown dependency category {}",
                edge.category
            )));
        };
        state.graph_mut().add_edge(
            source,
            target,
            category,
            DependencyProperties::from_bits_truncate(edge.properties),
        );
    }

    log::debug!(
        "loaded registry state: {} assets, {} depends nodes",
        state.num_assets(),
        state.num_depends_nodes()
    );
    Ok(state)
}

/// Reads a state file written by [`save_to_path`].
pub fn load_from_path(path: &Path) -> Result<RegistryState> {
    let input = File::open(path)?;
    load(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DependencyQuery;
    use crate::types::{PackageFlags, PackageKind};

    fn sample_state() -> RegistryState {
        let mut state = RegistryState::new();
        for (package, name, class) in [
            ("/Game/Weapons/Sword", "Sword", "/Script/Core.Weapon"),
            ("/Game/Weapons/Bow", "Bow", "/Script/Core.Weapon"),
            ("/Game/Maps/Arena", "Arena", "/Script/Core.World"),
        ] {
            let mut record = AssetRecord::new(package, name, class);
            record.tags.insert("DisplayName".into(), name.to_string());
            record.tags.insert("Internal".into(), "x".into());
            record.package_flags = PackageFlags::COOKED;
            record.chunk_ids = [1, 2].into_iter().collect();
            state.add_asset(record);
        }
        state.set_package_data(
            "/Game/Weapons/Sword",
            PackageRecord {
                package_hash: 0xfeed,
                kind: Some(PackageKind::Asset),
                chunk_ids: [1].into_iter().collect(),
                location: Default::default(),
            },
        );
        state.mark_empty_package(NormalizedPath::new("/Game/Empty"));
        state.path_tree_mut().add_path("/Game/Weapons");
        state.path_tree_mut().add_path("/Game/Maps");

        let sword = AssetIdentifier::from_package("/Game/Weapons/Sword");
        let bow = AssetIdentifier::from_package("/Game/Weapons/Bow");
        let arena = AssetIdentifier::from_package("/Game/Maps/Arena");
        let sword_node = state.graph_mut().create_or_find_node(&sword);
        let bow_node = state.graph_mut().create_or_find_node(&bow);
        let arena_node = state.graph_mut().create_or_find_node(&arena);
        state
            .graph_mut()
            .add_edge(arena_node, sword_node, DependencyCategory::Package, DependencyProperties::HARD);
        state
            .graph_mut()
            .add_edge(arena_node, bow_node, DependencyCategory::Package, DependencyProperties::GAME);
        state
            .graph_mut()
            .add_edge(sword_node, bow_node, DependencyCategory::Manage, DependencyProperties::DIRECT);
        state
    }

    fn round_trip(state: &RegistryState, options: &SerializationOptions) -> RegistryState {
        let mut bytes = Vec::new();
        save(state, &mut bytes, options).unwrap();
        load(bytes.as_slice()).unwrap()
    }

    #[test]
    fn full_round_trip_is_observationally_equal() {
        let state = sample_state();
        let loaded = round_trip(&state, &SerializationOptions::full());

        assert_eq!(loaded.num_assets(), state.num_assets());
        assert_eq!(loaded.num_packages(), state.num_packages());
        assert_eq!(loaded.num_depends_nodes(), state.num_depends_nodes());
        let original = state.asset_by_object_path("/Game/Weapons/Sword.Sword").unwrap();
        let restored = loaded.asset_by_object_path("/Game/Weapons/Sword.Sword").unwrap();
        assert_eq!(original, restored);
        assert!(loaded.is_empty_package(&NormalizedPath::new("/Game/Empty")));
        assert!(loaded.path_tree().path_exists("/Game/Maps"));

        let deps = loaded.graph().get_dependencies(
            &AssetIdentifier::from_package("/Game/Maps/Arena"),
            &[DependencyCategory::Package],
            DependencyQuery::default(),
        );
        assert_eq!(deps.len(), 2);
        let refs = loaded.graph().get_referencers(
            &AssetIdentifier::from_package("/Game/Weapons/Bow"),
            &DependencyCategory::ALL,
            DependencyQuery::default(),
        );
        assert_eq!(refs.len(), 2);
    }

    #[test]
    fn dependency_elision_options() {
        let state = sample_state();

        let mut options = SerializationOptions::full();
        options.include_manage_dependencies = false;
        let loaded = round_trip(&state, &options);
        assert!(loaded
            .graph()
            .get_dependencies(
                &AssetIdentifier::from_package("/Game/Weapons/Sword"),
                &[DependencyCategory::Manage],
                DependencyQuery::default(),
            )
            .is_empty());
        assert!(!loaded
            .graph()
            .get_dependencies(
                &AssetIdentifier::from_package("/Game/Maps/Arena"),
                &[DependencyCategory::Package],
                DependencyQuery::default(),
            )
            .is_empty());

        let mut options = SerializationOptions::full();
        options.include_dependencies = false;
        let loaded = round_trip(&state, &options);
        assert_eq!(loaded.num_depends_nodes(), 0);
        assert_eq!(loaded.num_assets(), state.num_assets());
    }

    #[test]
    fn package_data_elision() {
        let state = sample_state();
        let mut options = SerializationOptions::full();
        options.include_package_data = false;
        let loaded = round_trip(&state, &options);
        assert_eq!(loaded.num_packages(), 0);
        assert!(!loaded.is_empty_package(&NormalizedPath::new("/Game/Empty")));
    }

    #[test]
    fn tag_filtering_per_class() {
        let state = sample_state();
        let mut classes = FnvHashMap::default();
        classes.insert(
            NormalizedPath::new("/Script/Core.Weapon"),
            vec!["DisplayName".to_string()],
        );
        let mut options = SerializationOptions::full();
        options.tag_filter = Some(TagFilter {
            mode: TagFilterMode::Allow,
            classes,
        });
        let loaded = round_trip(&state, &options);

        let weapon = loaded.asset_by_object_path("/Game/Weapons/Sword.Sword").unwrap();
        assert!(weapon.tags.contains_key("DisplayName"));
        assert!(!weapon.tags.contains_key("Internal"));
        // Unlisted classes pass through unfiltered.
        let map = loaded.asset_by_object_path("/Game/Maps/Arena.Arena").unwrap();
        assert!(map.tags.contains_key("Internal"));
    }

    #[test]
    fn filter_assets_with_no_tags() {
        let mut state = sample_state();
        state.add_asset(AssetRecord::new("/Game/Bare", "Bare", "/Script/Core.Thing"));
        let mut options = SerializationOptions::full();
        options.filter_assets_with_no_tags = true;
        let loaded = round_trip(&state, &options);
        assert!(loaded.asset_by_object_path("/Game/Bare.Bare").is_none());
        assert_eq!(loaded.num_assets(), 3);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let state = sample_state();
        let mut bytes = Vec::new();
        save(&state, &mut bytes, &SerializationOptions::full()).unwrap();

        // Corrupt the version field inside the compressed payload.
        let decoded = zstd::decode_all(bytes.as_slice()).unwrap();
        let mut tampered = decoded.clone();
        tampered[0] = tampered[0].wrapping_add(1);
        let recompressed = zstd::encode_all(tampered.as_slice(), 1).unwrap();
        let error = load(recompressed.as_slice()).err().expect("load must fail");
        assert!(matches!(error, RegistryError::VersionMismatch { .. }));
    }

    #[test]
    fn synthetic_state_round_trips() {
        // Deterministic xorshift so the "random" state is reproducible.
        let mut seed = 0x9e3779b97f4a7c15u64;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        let mut state = RegistryState::new();
        let count = 2_000usize;
        for i in 0..count {
            let package = format!("/Game/Generated/Pkg{i:04}");
            let mut record = AssetRecord::new(&package, "Main", "/Script/Core.Thing");
            for t in 0..(next() % 4) {
                record.tags.insert(format!("Tag{t}"), format!("{}", next() % 1000));
            }
            record.chunk_ids = (0..(next() % 3)).map(|c| c as i32).collect();
            assert!(state.add_asset(record));
            state.path_tree_mut().add_path(crate::types::parent_virtual_path(&package));
        }
        for i in 0..count {
            let source = AssetIdentifier::from_package(&format!("/Game/Generated/Pkg{i:04}"));
            let source_node = state.graph_mut().create_or_find_node(&source);
            for _ in 0..(next() % 4) {
                let target_index = (next() as usize) % count;
                let target =
                    AssetIdentifier::from_package(&format!("/Game/Generated/Pkg{target_index:04}"));
                let target_node = state.graph_mut().create_or_find_node(&target);
                let properties = DependencyProperties::from_bits_truncate((next() % 8) as u8);
                state
                    .graph_mut()
                    .add_edge(source_node, target_node, DependencyCategory::Package, properties);
            }
        }

        let loaded = round_trip(&state, &SerializationOptions::full());
        assert_eq!(loaded.num_assets(), state.num_assets());
        assert_eq!(loaded.num_depends_nodes(), state.num_depends_nodes());
        assert_eq!(loaded.graph().num_edges(), state.graph().num_edges());
        for i in (0..count).step_by(97) {
            let path = format!("/Game/Generated/Pkg{i:04}.Main");
            assert_eq!(
                state.asset_by_object_path(&path),
                loaded.asset_by_object_path(&path)
            );
            let id = AssetIdentifier::from_package(&format!("/Game/Generated/Pkg{i:04}"));
            let mut original = state.graph().get_dependencies(
                &id,
                &[DependencyCategory::Package],
                DependencyQuery::default(),
            );
            let mut restored = loaded.graph().get_dependencies(
                &id,
                &[DependencyCategory::Package],
                DependencyQuery::default(),
            );
            original.sort_by(|a, b| a.identifier.cmp(&b.identifier));
            restored.sort_by(|a, b| a.identifier.cmp(&b.identifier));
            assert_eq!(original, restored);
        }
    }

    #[test]
    fn save_to_path_round_trips(){
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("registry").join("state.bin.zst");
        let state = sample_state();
        save_to_path(&state, &path, &SerializationOptions::full()).unwrap();
        let loaded = load_from_path(&path).unwrap();
        assert_eq!(loaded.num_assets(), state.num_assets());
    }
}
