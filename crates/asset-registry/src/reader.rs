//! Package file reading.
//!
//! The registry treats package parsing as an opaque collaborator: a
//! [`PackageReader`] turns a file path into asset records plus a package
//! dependency record. The built-in [`LoosePackageReader`] reads the loose
//! on-disk format (a small magic header followed by a postcard-encoded
//! body); hosts with container formats supply their own implementation.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thin_vec::ThinVec;

use crate::graph::{DependencyCategory, DependencyProperties};
use crate::types::{AssetIdentifier, AssetRecord, PackageFlags, PackageKind, PackageLocation, TagMap};

/// Magic bytes at the start of every loose package file.
pub const PACKAGE_MAGIC: [u8; 4] = *b"APKG";

/// Read failure for one package file. Converted into a blocked-file report by
/// the gatherer, never fatal to the scan.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("wrong magic bytes")]
    WrongMagic,

    #[error("file truncated")]
    Truncated,

    #[error("decode error: {0}")]
    Decode(String),
}

// ---------------------------------------------------------------------------
// On-disk body
// ---------------------------------------------------------------------------

/// One asset entry inside a package file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageAssetEntry {
    pub asset_name: String,
    pub class_path: String,
    /// Raw tag data; post-processed by the class metadata provider before it
    /// lands in the registry.
    pub tags: TagMap,
}

/// One dependency entry inside a package file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageDependencyEntry {
    pub identifier: AssetIdentifier,
    pub category: DependencyCategory,
    /// Raw property bits, see [`DependencyProperties`].
    pub properties: u8,
}

impl PackageDependencyEntry {
    pub fn properties(&self) -> DependencyProperties {
        DependencyProperties::from_bits_truncate(self.properties)
    }
}

/// Decoded body of a loose package file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageFileData {
    pub package_flags: u32,
    pub chunk_ids: Vec<i32>,
    pub assets: Vec<PackageAssetEntry>,
    pub dependencies: Vec<PackageDependencyEntry>,
}

/// Writes a loose package file; used by content tooling and test fixtures.
pub fn write_package_file(path: &Path, data: &PackageFileData) -> io::Result<()> {
    let body = postcard::to_allocvec(data)
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error.to_string()))?;
    let mut bytes = Vec::with_capacity(PACKAGE_MAGIC.len() + body.len());
    bytes.extend_from_slice(&PACKAGE_MAGIC);
    bytes.extend_from_slice(&body);
    fs::write(path, bytes)
}

// ---------------------------------------------------------------------------
// Read outcome
// ---------------------------------------------------------------------------

/// What one successfully read package file contributes to the gather.
#[derive(Debug, Clone)]
pub struct PackageReadOutcome {
    /// Fully-formed (but not yet tag-post-processed) asset records.
    pub assets: Vec<AssetRecord>,
    /// Outgoing dependencies declared by the package.
    pub dependencies: Vec<PackageDependencyEntry>,
    /// Opaque content digest of the file.
    pub package_hash: u64,
    pub chunk_ids: ThinVec<i32>,
    pub location: PackageLocation,
    pub has_package_data: bool,
    pub has_dependency_data: bool,
}

/// Opaque package-parsing collaborator.
pub trait PackageReader: Send + Sync {
    /// Reads one package file. `package_name` and `package_path` are the
    /// virtual identities the gatherer mapped the file to.
    fn read_file(
        &self,
        local_path: &Path,
        package_name: &str,
        package_path: &str,
        kind: PackageKind,
    ) -> Result<PackageReadOutcome, ReadError>;
}

/// Reader for the loose on-disk format.
#[derive(Debug, Default)]
pub struct LoosePackageReader;

impl PackageReader for LoosePackageReader {
    fn read_file(
        &self,
        local_path: &Path,
        package_name: &str,
        package_path: &str,
        kind: PackageKind,
    ) -> Result<PackageReadOutcome, ReadError> {
        let bytes = fs::read(local_path)?;
        if bytes.len() < PACKAGE_MAGIC.len() {
            return Err(ReadError::Truncated);
        }
        if bytes[..PACKAGE_MAGIC.len()] != PACKAGE_MAGIC {
            return Err(ReadError::WrongMagic);
        }
        let data: PackageFileData = postcard::from_bytes(&bytes[PACKAGE_MAGIC.len()..])
            .map_err(|error| match error {
                postcard::Error::DeserializeUnexpectedEnd => ReadError::Truncated,
                other => ReadError::Decode(other.to_string()),
            })?;

        let package_flags = PackageFlags::from_bits_truncate(data.package_flags);
        let chunk_ids: ThinVec<i32> = data.chunk_ids.iter().copied().collect();
        let assets = data
            .assets
            .iter()
            .map(|entry| {
                let mut record = AssetRecord::new(package_name, &entry.asset_name, &entry.class_path);
                record.package_path = package_path.to_string();
                record.tags = entry.tags.clone();
                record.package_flags = package_flags;
                record.chunk_ids = chunk_ids.clone();
                record
            })
            .collect();

        Ok(PackageReadOutcome {
            assets,
            dependencies: data.dependencies,
            package_hash: content_hash(&bytes),
            chunk_ids,
            location: PackageLocation::Loose,
            has_package_data: true,
            has_dependency_data: true,
        })
    }
}

/// FNV-1a over the file contents; the registry only needs a stable digest.
fn content_hash(bytes: &[u8]) -> u64 {
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = 0xcbf29ce484222325u64;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

impl PackageKind {
    /// Classifies a local file path; `None` for non-package files.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_data() -> PackageFileData {
        let mut tags = TagMap::new();
        tags.insert("Rarity".into(), "Epic".into());
        PackageFileData {
            package_flags: PackageFlags::COOKED.bits(),
            chunk_ids: vec![3],
            assets: vec![PackageAssetEntry {
                asset_name: "Sword".into(),
                class_path: "/Script/Core.Weapon".into(),
                tags,
            }],
            dependencies: vec![PackageDependencyEntry {
                identifier: AssetIdentifier::from_package("/Game/Materials/Steel"),
                category: DependencyCategory::Package,
                properties: DependencyProperties::HARD.bits(),
            }],
        }
    }

    #[test]
    fn reads_written_package() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Sword.apkg");
        write_package_file(&path, &sample_data()).unwrap();

        let outcome = LoosePackageReader
            .read_file(&path, "/Game/Weapons/Sword", "/Game/Weapons", PackageKind::Asset)
            .unwrap();
        assert_eq!(outcome.assets.len(), 1);
        let record = &outcome.assets[0];
        assert_eq!(record.object_path, "/Game/Weapons/Sword.Sword");
        assert_eq!(record.package_path, "/Game/Weapons");
        assert_eq!(record.package_flags, PackageFlags::COOKED);
        assert_eq!(outcome.dependencies.len(), 1);
        assert!(outcome.has_dependency_data);
        assert_ne!(outcome.package_hash, 0);
    }

    #[test]
    fn wrong_magic_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Bad.apkg");
        fs::write(&path, b"NOPE-not-a-package").unwrap();
        let error = LoosePackageReader
            .read_file(&path, "/Game/Bad", "/Game", PackageKind::Asset)
            .err()
            .expect("read must fail");
        assert!(matches!(error, ReadError::WrongMagic));
    }

    #[test]
    fn truncated_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Trunc.apkg");
        write_package_file(&path, &sample_data()).unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        let error = LoosePackageReader
            .read_file(&path, "/Game/Trunc", "/Game", PackageKind::Asset)
            .err()
            .expect("read must fail");
        assert!(matches!(error, ReadError::Truncated | ReadError::Decode(_)));
    }
}
