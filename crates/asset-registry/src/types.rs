//! Core record and identifier types for the asset registry.
//!
//! Records are looked up by a case-insensitively normalized key
//! ([`NormalizedPath`]) matching the host filesystem's comparison policy.
//! The original (case-preserved) strings are kept on the records themselves.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thin_vec::ThinVec;

/// Tag name to value mapping on an asset. Key-unique, order-irrelevant;
/// `BTreeMap` gives deterministic serialization.
pub type TagMap = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Normalized lookup keys
// ---------------------------------------------------------------------------

/// A case-insensitively normalized object/package path used as a lookup key.
///
/// Normalization is ASCII lowercasing; virtual content paths are ASCII in
/// practice and this matches the host filesystem comparison policy.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct NormalizedPath(String);

impl NormalizedPath {
    pub fn new(path: &str) -> Self {
        Self(path.to_ascii_lowercase())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this key lies at or under `base` in the '/'-delimited hierarchy.
    pub fn is_under(&self, base: &NormalizedPath) -> bool {
        let base = base.as_str().trim_end_matches('/');
        self.0 == base || (self.0.len() > base.len() && self.0.starts_with(base) && self.0.as_bytes()[base.len()] == b'/')
    }
}

impl fmt::Display for NormalizedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NormalizedPath {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// ---------------------------------------------------------------------------
// Package classification
// ---------------------------------------------------------------------------

/// On-disk extension/kind of a package file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackageKind {
    /// A regular asset package (`.apkg`).
    Asset,
    /// A map/level package (`.amap`).
    Map,
}

impl PackageKind {
    /// Classifies a file extension; `None` for non-package files.
    pub fn from_extension(extension: &str) -> Option<Self> {
        if extension.eq_ignore_ascii_case("apkg") {
            Some(Self::Asset)
        } else if extension.eq_ignore_ascii_case("amap") {
            Some(Self::Map)
        } else {
            None
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Asset => "apkg",
            Self::Map => "amap",
        }
    }
}

/// Where a package's bytes live on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackageLocation {
    /// A loose file under a mount point.
    #[default]
    Loose,
    /// Packed inside a container archive.
    Container,
}

bitflags::bitflags! {
    /// Opaque package flag bits, passed through from the packaging pipeline
    /// unmodified. Only the bits below are interpreted by the registry itself.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PackageFlags: u32 {
        /// Package was produced by a cook/build pass.
        const COOKED = 1 << 0;
        /// Package contains a map/world.
        const CONTAINS_MAP = 1 << 1;
        /// Package only exists in editor builds.
        const EDITOR_ONLY = 1 << 2;
    }
}

// ---------------------------------------------------------------------------
// Asset and package records
// ---------------------------------------------------------------------------

/// One in-package object that "is an asset".
///
/// The object path (`package_name` + '.' + `asset_name`) is globally unique
/// among the records held by a `RegistryState` at any time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRecord {
    /// Full object path, e.g. `/Game/Weapons/Sword.Sword`.
    pub object_path: String,
    /// Object name within the package.
    pub asset_name: String,
    /// Path of the class this asset is an instance of.
    pub class_path: String,
    /// Owning package name, e.g. `/Game/Weapons/Sword`.
    pub package_name: String,
    /// Virtual directory holding the package, e.g. `/Game/Weapons`.
    pub package_path: String,
    /// Gathered tag/value pairs.
    pub tags: TagMap,
    /// Opaque package flag bits.
    pub package_flags: PackageFlags,
    /// Content-chunk assignment, passed through unmodified.
    pub chunk_ids: ThinVec<i32>,
}

impl AssetRecord {
    /// Builds a record from its package and object names. The object path and
    /// package path are derived.
    pub fn new(package_name: &str, asset_name: &str, class_path: &str) -> Self {
        let package_path = parent_virtual_path(package_name).to_string();
        Self {
            object_path: format!("{package_name}.{asset_name}"),
            asset_name: asset_name.to_string(),
            class_path: class_path.to_string(),
            package_name: package_name.to_string(),
            package_path,
            tags: TagMap::new(),
            package_flags: PackageFlags::empty(),
            chunk_ids: ThinVec::new(),
        }
    }

    /// Normalized lookup key for this record.
    #[inline]
    pub fn key(&self) -> NormalizedPath {
        NormalizedPath::new(&self.object_path)
    }

    #[inline]
    pub fn package_key(&self) -> NormalizedPath {
        NormalizedPath::new(&self.package_name)
    }

    #[inline]
    pub fn class_key(&self) -> NormalizedPath {
        NormalizedPath::new(&self.class_path)
    }

    #[inline]
    pub fn package_path_key(&self) -> NormalizedPath {
        NormalizedPath::new(&self.package_path)
    }

    /// Whether the two records carry the same chunk assignment.
    pub fn has_same_chunk_ids(&self, other: &AssetRecord) -> bool {
        self.chunk_ids == other.chunk_ids
    }
}

/// Package-level metadata, one per package name. Exists iff the package has
/// ever been observed, even with zero remaining asset records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    /// Opaque content digest of the package file.
    pub package_hash: u64,
    /// On-disk kind, when known.
    pub kind: Option<PackageKind>,
    /// Content-chunk assignment.
    pub chunk_ids: ThinVec<i32>,
    /// Loose file vs. container-packed.
    pub location: PackageLocation,
}

// ---------------------------------------------------------------------------
// Graph identifiers
// ---------------------------------------------------------------------------

/// Identity of one participant in the dependency graph: a package, an object
/// within a package, or a searchable name target.
///
/// Graph identifiers compare exactly (scan output is self-consistent); only
/// asset/package record lookup is case-normalized.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssetIdentifier {
    pub package_name: String,
    pub object_name: Option<String>,
    pub value_name: Option<String>,
}

impl AssetIdentifier {
    /// Identifier for a whole package.
    pub fn from_package(package_name: &str) -> Self {
        Self {
            package_name: package_name.to_string(),
            object_name: None,
            value_name: None,
        }
    }

    /// Identifier for an object, given its full object path
    /// (`/Pkg/Name.Object`).
    pub fn from_object_path(object_path: &str) -> Self {
        match object_path.rsplit_once('.') {
            Some((package, object)) => Self {
                package_name: package.to_string(),
                object_name: Some(object.to_string()),
                value_name: None,
            },
            None => Self::from_package(object_path),
        }
    }

    /// Identifier for a searchable name declared by an object.
    pub fn searchable_name(package_name: &str, object_name: &str, value_name: &str) -> Self {
        Self {
            package_name: package_name.to_string(),
            object_name: Some(object_name.to_string()),
            value_name: Some(value_name.to_string()),
        }
    }

    #[inline]
    pub fn is_package(&self) -> bool {
        self.object_name.is_none() && self.value_name.is_none()
    }
}

impl fmt::Display for AssetIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.package_name)?;
        if let Some(object) = &self.object_name {
            write!(f, ".{object}")?;
        }
        if let Some(value) = &self.value_name {
            write!(f, ":{value}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// Parent virtual directory of a '/'-delimited path (`/Game/A/B` -> `/Game/A`).
pub fn parent_virtual_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/",
        Some(idx) => &trimmed[..idx],
        None => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_path_is_case_insensitive() {
        assert_eq!(
            NormalizedPath::new("/Game/Weapons/Sword.Sword"),
            NormalizedPath::new("/game/weapons/sword.sword")
        );
    }

    #[test]
    fn normalized_path_is_under() {
        let base = NormalizedPath::new("/Game");
        assert!(NormalizedPath::new("/Game/Weapons").is_under(&base));
        assert!(NormalizedPath::new("/game").is_under(&base));
        assert!(!NormalizedPath::new("/GameExtra/Thing").is_under(&base));
    }

    #[test]
    fn asset_record_derives_paths() {
        let record = AssetRecord::new("/Game/Weapons/Sword", "Sword", "/Script/Core.Weapon");
        assert_eq!(record.object_path, "/Game/Weapons/Sword.Sword");
        assert_eq!(record.package_path, "/Game/Weapons");
    }

    #[test]
    fn identifier_from_object_path_splits_on_last_dot() {
        let id = AssetIdentifier::from_object_path("/Game/A.B");
        assert_eq!(id.package_name, "/Game/A");
        assert_eq!(id.object_name.as_deref(), Some("B"));
        assert!(!id.is_package());
        assert!(AssetIdentifier::from_package("/Game/A").is_package());
    }

    #[test]
    fn package_kind_from_extension() {
        assert_eq!(PackageKind::from_extension("apkg"), Some(PackageKind::Asset));
        assert_eq!(PackageKind::from_extension("AMAP"), Some(PackageKind::Map));
        assert_eq!(PackageKind::from_extension("txt"), None);
    }

    #[test]
    fn parent_path_of_root_child_is_root() {
        assert_eq!(parent_virtual_path("/Game"), "/");
        assert_eq!(parent_virtual_path("/Game/Weapons/Sword"), "/Game/Weapons");
    }
}
