//! The asset registry facade.
//!
//! [`AssetRegistry`] is the explicit context object consumers hold (one per
//! process, constructed at startup, torn down at shutdown — never an ambient
//! global). It wraps every state access in the interface-lock discipline:
//! queries take the read lock, mutations take the write lock and collect
//! notifications into an event context that is broadcast only after the
//! lock is released, on the notification thread.
//!
//! The thread that constructs the registry is the notification thread.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fnv::FnvHashSet;

use crate::classes::ClassProviderRegistry;
use crate::error::{RegistryError, Result};
use crate::events::{EventContext, EventDispatcher, EventHandler, RegistryEvent, SubscriberId};
use crate::filter::{AssetFilter, CompiledFilter};
use crate::gather::gatherer::{GatherMode, Gatherer};
use crate::gather::scheduler::{GatherScheduler, GatherState, TickInputs, TickState};
use crate::graph::{AssetDependency, DependencyCategory, DependencyQuery};
use crate::lock::{InterfaceLock, TickLock};
use crate::manage::{self, ManageReferencesContext};
use crate::persistence::{self, SerializationOptions};
use crate::reader::{LoosePackageReader, PackageReader};
use crate::state::{CollisionResolver, InitializeMode, RegistryState};
use crate::types::{AssetIdentifier, AssetRecord, NormalizedPath, PackageFlags, PackageRecord};
use crate::watcher::{self, WatcherEvent};

/// Sleep quantum for blocking wait loops; a heartbeat, not a busy spin.
const WAIT_SLEEP: Duration = Duration::from_millis(1);

/// Items pumped per take-over iteration when this thread runs the gather.
const TAKEOVER_PUMP_ITEMS: usize = 256;

/// Construction-time configuration.
pub struct RegistryConfig {
    pub gather_mode: GatherMode,
    /// Re-verify that discovered paths are still mounted before applying
    /// them (protects against unmount races mid-scan).
    pub verify_mounts_on_apply: bool,
    /// When true, classes without a registered metadata provider read as
    /// not-loaded and their assets defer.
    pub strict_class_resolution: bool,
    pub reader: Arc<dyn PackageReader>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            gather_mode: GatherMode::Asynchronous,
            verify_mounts_on_apply: true,
            strict_class_resolution: false,
            reader: Arc::new(LoosePackageReader),
        }
    }
}

/// Everything behind the interface lock. The scheduler's pending buffers
/// live here too so tick mutations happen under the same exclusive hold.
struct Guarded {
    state: RegistryState,
    scheduler: GatherScheduler,
}

/// See module docs.
pub struct AssetRegistry {
    guarded: InterfaceLock<Guarded>,
    gatherer: Gatherer,
    gather_state: GatherState,
    classes: ClassProviderRegistry,
    dispatcher: EventDispatcher,
    tick_lock: TickLock,
    verify_mounts: bool,
}

impl AssetRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            guarded: InterfaceLock::new(Guarded {
                state: RegistryState::new(),
                scheduler: GatherScheduler::new(),
            }),
            gatherer: Gatherer::new(config.gather_mode, config.reader),
            gather_state: GatherState::new(),
            classes: if config.strict_class_resolution {
                ClassProviderRegistry::strict()
            } else {
                ClassProviderRegistry::new()
            },
            dispatcher: EventDispatcher::new(),
            tick_lock: TickLock::new(),
            verify_mounts: config.verify_mounts_on_apply,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RegistryConfig::default())
    }

    /// Class metadata providers; hosts register classes as they load.
    #[inline]
    pub fn class_providers(&self) -> &ClassProviderRegistry {
        &self.classes
    }

    // -----------------------------------------------------------------------
    // Mounts and scanning
    // -----------------------------------------------------------------------

    pub fn add_mount_point(&self, local: &std::path::Path, virtual_root: &str) -> Result<()> {
        self.gatherer.add_mount_point(local, virtual_root)
    }

    pub fn remove_mount_point(&self, local: &std::path::Path) {
        self.gatherer.remove_mount_point(local);
    }

    /// Kicks off the search-all-assets pass over the registered mounts.
    /// With `synchronous` set, blocks until the gather completes.
    pub fn search_all_assets(&self, synchronous: bool) {
        self.gather_state.mark_search_all_assets_started();
        if synchronous {
            self.wait_for_completion();
        }
    }

    /// Forces a scan of specific directories and files, blocking until their
    /// results are applied. Runs the gather on the calling thread via the
    /// take-over fast path.
    pub fn scan_paths_synchronous(&self, directories: &[PathBuf], files: &[PathBuf]) {
        self.gatherer.add_required_directories(directories);
        self.gatherer.add_required_files(files);
        self.drive_to_completion();
    }

    /// Applies a batch of directory-watcher events.
    pub fn apply_watcher_events(&self, events: Vec<WatcherEvent>) {
        watcher::apply_watcher_events(&self.gatherer, events);
    }

    // -----------------------------------------------------------------------
    // Tick and waits
    // -----------------------------------------------------------------------

    /// Runs one scheduler tick within `max_duration` (`None` = full flush).
    /// Safe to call from any thread; events produced off the notification
    /// thread are deferred to it.
    pub fn tick(&self, max_duration: Option<Duration>) -> TickState {
        let _who_ticks = self.tick_lock.acquire();
        if self.gatherer.mode() == GatherMode::Synchronous {
            // The synchronous gatherer only works when pumped.
            self.gatherer.pump(usize::MAX);
        }

        let events_pending = self.dispatcher.has_pending();
        let mut context = EventContext::new();
        let interrupt = || self.guarded.has_high_priority_waiters();
        let interrupt: &dyn Fn() -> bool = &interrupt;
        let mut tick_state = {
            let mut guarded = self.guarded.write();
            let guarded = &mut *guarded;
            guarded.scheduler.tick(
                &mut guarded.state,
                TickInputs {
                    gatherer: &self.gatherer,
                    classes: &self.classes,
                    gather_state: &self.gather_state,
                    events: &mut context,
                    max_duration,
                    interrupt: Some(interrupt),
                    verify_mounts: self.verify_mounts,
                    events_pending,
                },
            )
        };
        // Lock released: now, and only now, notifications go out.
        self.dispatcher.broadcast_or_defer(context);

        if tick_state == TickState::WaitingForEvents && !self.dispatcher.is_notify_thread() {
            // The remaining work is event dispatch, which only the
            // notification thread may perform.
            tick_state = TickState::TickGameThreadActiveGatherIdle;
        }
        tick_state
    }

    /// Blocks until the gather reaches `Complete` (or `Idle`). Bounded
    /// backoff keeps this returning even through `UnableToProgress`; callers
    /// confirm full knowledge with `is_initial_search_completed` +
    /// `!is_gathering` before trusting negative lookups.
    pub fn wait_for_completion(&self) {
        self.drive_to_completion();
    }

    fn drive_to_completion(&self) {
        let takeover = self.gatherer.mode() == GatherMode::Asynchronous;
        if takeover {
            self.gatherer.pause();
        }
        loop {
            if takeover {
                while self.gatherer.pump(TAKEOVER_PUMP_ITEMS) {}
            }
            match self.tick(None) {
                TickState::Complete | TickState::Idle => break,
                TickState::TickGameThreadActiveGatherIdle => {
                    // Only the notification thread can drain the remaining
                    // events; the registry itself is fully up to date.
                    break;
                }
                TickState::UnableToProgress => std::thread::sleep(WAIT_SLEEP),
                _ => std::thread::sleep(WAIT_SLEEP),
            }
        }
        if takeover {
            self.gatherer.resume();
        }
    }

    /// Blocks until the background gatherer has nothing queued, without
    /// applying results. Returns whether idle was reached in time.
    pub fn wait_for_idle(&self, timeout: Option<Duration>) -> bool {
        self.gatherer.wait_for_idle(timeout)
    }

    /// Blocks until `package_name` is known to the registry or the gather
    /// completes without finding it. The escape hatch for callers that need
    /// one package early.
    pub fn wait_for_package(&self, package_name: &str, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let key = NormalizedPath::new(package_name);
        loop {
            {
                let guarded = self.guarded.read_high_priority();
                if !guarded.state.assets_in_package(&key).is_empty()
                    || guarded.state.package_data(package_name).is_some()
                {
                    return true;
                }
            }
            if !self.is_gathering() {
                return false;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return false;
                }
            }
            self.tick(Some(Duration::from_millis(5)));
            std::thread::sleep(WAIT_SLEEP);
        }
    }

    /// Whether gather work (disk side or unapplied results) remains.
    pub fn is_gathering(&self) -> bool {
        if !self.gatherer.is_idle() || self.gatherer.has_queued_results() {
            return true;
        }
        self.guarded.read().scheduler.has_pending_work()
    }

    /// Fast-path flag reads; no lock, relaxed ordering, monotonic.
    #[inline]
    pub fn is_search_all_assets(&self) -> bool {
        self.gather_state.is_search_all_assets()
    }

    #[inline]
    pub fn is_initial_search_completed(&self) -> bool {
        self.gather_state.is_initial_search_completed()
    }

    /// Monotonically increasing version for invalidating derived caches.
    #[inline]
    pub fn reallocation_version(&self) -> u64 {
        self.gather_state.reallocation_version()
    }

    /// Stops the gatherer. No new work starts after this returns.
    pub fn shutdown(&self) {
        self.gatherer.stop();
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Enumerates assets matching `filter`. Returns false (no partial
    /// results) when the filter is empty/invalid.
    pub fn enumerate_assets<F>(&self, filter: &AssetFilter, visitor: &mut F) -> bool
    where
        F: FnMut(&AssetRecord) -> bool,
    {
        let guarded = self.guarded.read();
        let classes = guarded.state.class_inheritance_map();
        let Some(compiled) = CompiledFilter::compile(filter, &classes) else {
            return false;
        };
        guarded
            .state
            .enumerate_assets(&compiled, &FnvHashSet::default(), visitor);
        true
    }

    /// Enumerates every asset in the registry.
    pub fn enumerate_all_assets<F>(&self, visitor: &mut F)
    where
        F: FnMut(&AssetRecord) -> bool,
    {
        self.guarded.read().state.enumerate_all_assets(visitor);
    }

    pub fn get_assets(&self, filter: &AssetFilter) -> Vec<AssetRecord> {
        let mut out = Vec::new();
        self.enumerate_assets(filter, &mut |record| {
            out.push(record.clone());
            true
        });
        out
    }

    pub fn get_assets_by_path(&self, package_path: &str, recursive: bool) -> Vec<AssetRecord> {
        self.get_assets(&AssetFilter {
            package_paths: vec![package_path.to_string()],
            recursive_paths: recursive,
            ..AssetFilter::default()
        })
    }

    pub fn get_assets_by_class(&self, class_path: &str, recursive: bool) -> Vec<AssetRecord> {
        self.get_assets(&AssetFilter {
            class_paths: vec![class_path.to_string()],
            recursive_classes: recursive,
            ..AssetFilter::default()
        })
    }

    pub fn get_assets_by_tags(&self, tags_and_values: &[(String, Option<String>)]) -> Vec<AssetRecord> {
        self.get_assets(&AssetFilter {
            tags_and_values: tags_and_values.to_vec(),
            ..AssetFilter::default()
        })
    }

    pub fn get_asset_by_object_path(&self, object_path: &str) -> Option<AssetRecord> {
        self.guarded
            .read()
            .state
            .asset_by_object_path(object_path)
            .cloned()
    }

    /// Package metadata with its case-corrected name.
    pub fn get_package_data(&self, package_name: &str) -> Option<(String, PackageRecord)> {
        self.guarded
            .read()
            .state
            .package_data(package_name)
            .map(|(name, record)| (name.to_string(), record.clone()))
    }

    pub fn get_dependencies(
        &self,
        identifier: &AssetIdentifier,
        categories: &[DependencyCategory],
        query: DependencyQuery,
    ) -> Vec<AssetDependency> {
        self.guarded
            .read()
            .state
            .graph()
            .get_dependencies(identifier, categories, query)
    }

    pub fn get_referencers(
        &self,
        identifier: &AssetIdentifier,
        categories: &[DependencyCategory],
        query: DependencyQuery,
    ) -> Vec<AssetDependency> {
        self.guarded
            .read()
            .state
            .graph()
            .get_referencers(identifier, categories, query)
    }

    // -----------------------------------------------------------------------
    // Paths
    // -----------------------------------------------------------------------

    pub fn path_exists(&self, path: &str) -> bool {
        self.guarded.read().state.path_tree().path_exists(path)
    }

    pub fn enumerate_paths(&self, base: &str, recursive: bool) -> Vec<String> {
        let mut out = Vec::new();
        self.guarded
            .read()
            .state
            .path_tree()
            .enumerate_sub_paths(base, recursive, &mut |path| {
                out.push(path.to_string());
                true
            });
        out
    }

    /// Adds a virtual directory. Returns false if already present.
    pub fn add_path(&self, path: &str) -> bool {
        let mut context = EventContext::new();
        let added = {
            let mut guarded = self.guarded.write();
            let added = guarded.state.path_tree_mut().add_path(path);
            if added {
                context.push(RegistryEvent::PathAdded(path.to_string()));
            }
            added
        };
        self.dispatcher.broadcast_or_defer(context);
        added
    }

    /// Removes a virtual directory. Refused while assets still exist under
    /// the path.
    pub fn remove_path(&self, path: &str) -> bool {
        self.remove_path_inner(path, false)
    }

    /// Removal that also evicts non-empty subtrees. Asset records under the
    /// path are untouched; this only mutates the tree.
    pub fn remove_path_forced(&self, path: &str) -> bool {
        self.remove_path_inner(path, true)
    }

    fn remove_path_inner(&self, path: &str, force: bool) -> bool {
        let mut context = EventContext::new();
        let removed = {
            let mut guarded = self.guarded.write();
            if !force && Self::any_asset_under(&guarded.state, path) {
                false
            } else {
                let removed = guarded.state.path_tree_mut().remove_path(path, force);
                if removed {
                    context.push(RegistryEvent::PathRemoved(path.to_string()));
                }
                removed
            }
        };
        self.dispatcher.broadcast_or_defer(context);
        removed
    }

    fn any_asset_under(state: &RegistryState, path: &str) -> bool {
        let base = NormalizedPath::new(path);
        let mut found = false;
        state.enumerate_all_assets(&mut |record| {
            if record.package_path_key().is_under(&base) {
                found = true;
                return false;
            }
            true
        });
        found
    }

    // -----------------------------------------------------------------------
    // Mutation passes
    // -----------------------------------------------------------------------

    /// Bulk-updates package flags across a package's assets.
    pub fn update_package_flags(&self, package_name: &str, flags: PackageFlags) -> bool {
        self.guarded
            .write()
            .state
            .update_asset_data_package_flags(package_name, flags)
    }

    /// Runs the manage-reference graph search (see `manage`).
    pub fn set_manage_references(&self, context: ManageReferencesContext<'_>) {
        let mut guarded = self.guarded.write();
        manage::set_manage_references(guarded.state.graph_mut(), context);
        self.gather_state.bump_reallocation_version();
    }

    pub fn set_collision_resolver(&self, resolver: Option<CollisionResolver>) {
        self.guarded.write().state.set_collision_resolver(resolver);
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn save(&self, writer: impl std::io::Write, options: &SerializationOptions) -> Result<()> {
        persistence::save(&self.guarded.read().state, writer, options)
    }

    pub fn save_to_path(&self, path: &std::path::Path, options: &SerializationOptions) -> Result<()> {
        persistence::save_to_path(&self.guarded.read().state, path, options)
    }

    /// Loads a persisted state into this registry. Only allowed while the
    /// registry is empty; merge through [`Self::append_state`] otherwise.
    pub fn load(&self, reader: impl std::io::Read) -> Result<()> {
        let loaded = persistence::load(reader)?;
        let mut guarded = self.guarded.write();
        if !guarded.state.is_totally_empty() {
            return Err(RegistryError::StateNotEmpty);
        }
        guarded.state.initialize_from_existing(&loaded, InitializeMode::Rebuild);
        self.gather_state.bump_reallocation_version();
        Ok(())
    }

    /// Merges a persisted state into this registry per `mode`.
    pub fn append_state(&self, reader: impl std::io::Read, mode: InitializeMode) -> Result<()> {
        let loaded = persistence::load(reader)?;
        let mut guarded = self.guarded.write();
        guarded.state.initialize_from_existing(&loaded, mode);
        self.gather_state.bump_reallocation_version();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    pub fn subscribe(&self, handler: EventHandler) -> SubscriberId {
        self.dispatcher.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.dispatcher.unsubscribe(id)
    }

    /// Flushes events deferred from other threads. Notification-thread only;
    /// a no-op elsewhere.
    pub fn pump_events(&self) {
        self.dispatcher.pump();
    }
}

impl Drop for AssetRegistry {
    fn drop(&mut self) {
        self.gatherer.stop();
    }
}
