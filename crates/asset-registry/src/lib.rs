//! Asset registry gathering/caching engine.
//!
//! An in-process, incrementally-updated index of content-package metadata:
//! asset records, package records, a categorized dependency graph, and a
//! virtual-directory path tree. A background gatherer scans mounted
//! directories without blocking interactive use while concurrent readers
//! query a consistent view through a multi-reader/single-writer lock.
//!
//! - Memory tables and dependency graph: `state`, `graph`, `path_tree`
//! - Background scan pipeline: `gather` (gatherer + tick scheduler)
//! - Lock/notification discipline: `lock`, `events`
//! - Persistence with selective field elision: `persistence`
//! - Public facade: `registry`

pub mod classes;
pub mod error;
pub mod events;
pub mod filter;
pub mod gather;
pub mod graph;
pub mod lock;
pub mod manage;
pub mod path_tree;
pub mod persistence;
pub mod reader;
pub mod registry;
pub mod state;
pub mod types;
pub mod watcher;

// Re-export main types
pub use classes::{ClassMetadataProvider, ClassProviderRegistry};
pub use error::{RegistryError, Result};
pub use events::{EventHandler, RegistryEvent, SubscriberId};
pub use filter::AssetFilter;
pub use gather::{GatherMode, TickState};
pub use graph::{AssetDependency, DependencyCategory, DependencyProperties, DependencyQuery};
pub use manage::{ManageDecision, ManageReferencesContext, ManageSeed};
pub use persistence::SerializationOptions;
pub use reader::{LoosePackageReader, PackageReader, ReadError};
pub use registry::{AssetRegistry, RegistryConfig};
pub use state::{CollisionWinner, InitializeMode, RegistryState};
pub use types::{AssetIdentifier, AssetRecord, PackageFlags, PackageRecord, TagMap};
