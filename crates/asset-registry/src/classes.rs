//! Class metadata providers for tag post-processing.
//!
//! Gathered assets carry raw tag data; the declaring class may rewrite it
//! before the record lands in the registry. A class whose provider has not
//! been registered yet reads as not-loaded, and the gather scheduler defers
//! the asset for retry.

use std::sync::Arc;

use fnv::FnvHashMap;
use parking_lot::RwLock;

use crate::types::{NormalizedPath, TagMap};

/// Per-class tag finalization capability.
pub trait ClassMetadataProvider: Send + Sync {
    /// Rewrites the raw gathered tags for an asset of `class_path`.
    fn post_process_tags(&self, class_path: &str, tags: &TagMap) -> TagMap;
}

/// Pass-through provider: raw tags are final.
pub struct PassthroughProvider;

impl ClassMetadataProvider for PassthroughProvider {
    fn post_process_tags(&self, _class_path: &str, tags: &TagMap) -> TagMap {
        tags.clone()
    }
}

/// Registry of providers keyed by class path.
///
/// With a default provider installed (the common case), every class resolves
/// immediately. Built `strict`, only explicitly registered classes resolve,
/// which is how hosts model "class not loaded yet".
pub struct ClassProviderRegistry {
    providers: RwLock<FnvHashMap<NormalizedPath, Arc<dyn ClassMetadataProvider>>>,
    default_provider: Option<Arc<dyn ClassMetadataProvider>>,
}

impl ClassProviderRegistry {
    /// Registry with a pass-through default: no class ever defers.
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(FnvHashMap::default()),
            default_provider: Some(Arc::new(PassthroughProvider)),
        }
    }

    /// Registry with no default: unregistered classes read as not loaded.
    pub fn strict() -> Self {
        Self {
            providers: RwLock::new(FnvHashMap::default()),
            default_provider: None,
        }
    }

    /// Registers (or replaces) the provider for a class.
    pub fn register(&self, class_path: &str, provider: Arc<dyn ClassMetadataProvider>) {
        self.providers
            .write()
            .insert(NormalizedPath::new(class_path), provider);
    }

    pub fn unregister(&self, class_path: &str) {
        self.providers.write().remove(&NormalizedPath::new(class_path));
    }

    /// Provider for a class; `None` means the class is not loaded yet and the
    /// caller should defer.
    pub fn resolve(&self, class_path: &str) -> Option<Arc<dyn ClassMetadataProvider>> {
        if let Some(provider) = self.providers.read().get(&NormalizedPath::new(class_path)) {
            return Some(provider.clone());
        }
        self.default_provider.clone()
    }
}

impl Default for ClassProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UppercaseValues;

    impl ClassMetadataProvider for UppercaseValues {
        fn post_process_tags(&self, _class_path: &str, tags: &TagMap) -> TagMap {
            tags.iter()
                .map(|(k, v)| (k.clone(), v.to_ascii_uppercase()))
                .collect()
        }
    }

    #[test]
    fn default_registry_always_resolves() {
        let registry = ClassProviderRegistry::new();
        assert!(registry.resolve("/Script/Core.Anything").is_some());
    }

    #[test]
    fn strict_registry_defers_unknown_classes() {
        let registry = ClassProviderRegistry::strict();
        assert!(registry.resolve("/Script/Core.Weapon").is_none());

        registry.register("/Script/Core.Weapon", Arc::new(UppercaseValues));
        let provider = registry.resolve("/script/core.weapon").unwrap();
        let mut tags = TagMap::new();
        tags.insert("Rarity".into(), "epic".into());
        let out = provider.post_process_tags("/Script/Core.Weapon", &tags);
        assert_eq!(out.get("Rarity").map(String::as_str), Some("EPIC"));

        registry.unregister("/Script/Core.Weapon");
        assert!(registry.resolve("/Script/Core.Weapon").is_none());
    }
}
