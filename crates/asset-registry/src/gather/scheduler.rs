//! The gather tick state machine.
//!
//! Each tick drains result batches from the gatherer, applies them to the
//! registry state under the write lock, and collects notifications into the
//! caller's event context. Assets whose declaring class is not loaded yet
//! are deferred and retried on progress; dependency records defer with their
//! owning asset so a package's dependencies are never applied before its
//! asset records exist. Completion milestones fire exactly once, and
//! completion is never reported in a tick that still has notification
//! events to drain.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use fnv::FnvHashSet;

use super::batch::{GatherBatch, PackageDependencyRecord};
use super::gatherer::Gatherer;
use crate::classes::ClassProviderRegistry;
use crate::events::{EventContext, RegistryEvent};
use crate::graph::DependencyCategory;
use crate::state::{CollisionWinner, RegistryState};
use crate::types::{AssetIdentifier, AssetRecord, NormalizedPath, PackageRecord};

/// Budget/interrupt checks run once per this many processed items.
const TICK_CHECK_STRIDE: usize = 64;

/// Ticks without forward progress before the force-completion escape valve
/// engages (only once the gatherer itself has gone idle).
const FORCE_COMPLETION_AFTER_TICKS: u32 = 3;

/// In-tick retry passes over the deferred queues before the loop is treated
/// as runaway.
const MAX_RETRY_PASSES: u32 = 8;

// ---------------------------------------------------------------------------
// Process-wide gather flags
// ---------------------------------------------------------------------------

/// Whether adjacency lists are kept eagerly sorted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PerformanceMode {
    /// Throughput mode during the initial gather; sorting deferred.
    BulkLoading = 0,
    /// Steady state; lists kept sorted for deterministic iteration.
    MostlyStatic = 1,
}

impl PerformanceMode {
    /// Loads the mode from an atomic.
    pub fn load(atomic: &AtomicU8) -> Self {
        match atomic.load(Ordering::Relaxed) {
            1 => Self::MostlyStatic,
            _ => Self::BulkLoading,
        }
    }
}

/// One instance per registry. The two completion flags are monotonic one-way
/// transitions, intentionally readable without any lock; readers tolerate a
/// slightly stale value.
#[derive(Debug)]
pub struct GatherState {
    initial_search_started: AtomicBool,
    initial_search_completed: AtomicBool,
    /// Bumped on structural changes; invalidates caches derived from the
    /// registry's structural state.
    reallocation_version: AtomicU64,
    performance_mode: AtomicU8,
}

impl GatherState {
    pub fn new() -> Self {
        Self {
            initial_search_started: AtomicBool::new(false),
            initial_search_completed: AtomicBool::new(false),
            reallocation_version: AtomicU64::new(0),
            performance_mode: AtomicU8::new(PerformanceMode::BulkLoading as u8),
        }
    }

    pub fn mark_search_all_assets_started(&self) {
        self.initial_search_started.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_search_all_assets(&self) -> bool {
        self.initial_search_started.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_initial_search_completed(&self) {
        self.initial_search_completed.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_initial_search_completed(&self) -> bool {
        self.initial_search_completed.load(Ordering::Relaxed)
    }

    pub fn bump_reallocation_version(&self) {
        self.reallocation_version.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn reallocation_version(&self) -> u64 {
        self.reallocation_version.load(Ordering::Relaxed)
    }

    pub fn performance_mode(&self) -> PerformanceMode {
        PerformanceMode::load(&self.performance_mode)
    }

    pub(crate) fn set_performance_mode(&self, mode: PerformanceMode) {
        self.performance_mode.store(mode as u8, Ordering::Relaxed);
    }
}

impl Default for GatherState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tick state
// ---------------------------------------------------------------------------

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickState {
    /// No gather has started and nothing is queued.
    Idle,
    /// The disk gather has work and the consumer is actively draining.
    TickActiveGatherActive,
    /// The disk gather is momentarily quiet but processing continues.
    TickActiveGatherIdle,
    /// Remaining work is only safe on the designated notification thread.
    TickGameThreadActiveGatherIdle,
    /// All work done; notification events must drain before completion.
    WaitingForEvents,
    /// Blocked: paused externally, or deferred items with no forward
    /// progress and the force valve not yet engaged.
    UnableToProgress,
    Complete,
}

/// Time budget plus external early-exit condition, with strided checks so
/// tight loops do not hit the clock (or the interrupt) on every item.
struct TickBudget<'a> {
    deadline: Option<Instant>,
    interrupt: Option<&'a (dyn Fn() -> bool + 'a)>,
    counter: usize,
    expired: bool,
}

impl<'a> TickBudget<'a> {
    fn new(max_duration: Option<Duration>, interrupt: Option<&'a (dyn Fn() -> bool + 'a)>) -> Self {
        Self {
            deadline: max_duration.map(|d| Instant::now() + d),
            interrupt,
            counter: 0,
            expired: false,
        }
    }

    /// True once the budget is spent or the interrupt fired. Checked every
    /// `TICK_CHECK_STRIDE` calls.
    fn expired(&mut self) -> bool {
        if self.expired {
            return true;
        }
        if self.deadline.is_none() && self.interrupt.is_none() {
            return false;
        }
        self.counter += 1;
        if self.counter % TICK_CHECK_STRIDE == 0 {
            if let Some(deadline) = self.deadline {
                if Instant::now() >= deadline {
                    self.expired = true;
                }
            }
            if let Some(interrupt) = self.interrupt {
                if interrupt() {
                    self.expired = true;
                }
            }
        }
        self.expired
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Everything the tick body needs, borrowed from the registry while the
/// write lock is held. `events_pending` reflects the dispatcher's deferred
/// buffer at entry; the dispatcher itself is never touched under the lock.
pub struct TickInputs<'a> {
    pub gatherer: &'a Gatherer,
    pub classes: &'a ClassProviderRegistry,
    pub gather_state: &'a GatherState,
    pub events: &'a mut EventContext,
    pub max_duration: Option<Duration>,
    /// External early-exit condition, e.g. a high-priority reader waiting on
    /// the interface lock.
    pub interrupt: Option<&'a (dyn Fn() -> bool + 'a)>,
    /// Re-verify that discovered paths are still mounted before applying.
    pub verify_mounts: bool,
    pub events_pending: bool,
}

/// Per-registry tick bookkeeping: pending buffers, deferred queues, and
/// milestone state. Lives under the same write lock as the registry state.
pub struct GatherScheduler {
    pending_paths: VecDeque<String>,
    pending_assets: VecDeque<AssetRecord>,
    pending_dependencies: VecDeque<PackageDependencyRecord>,
    pending_removals: VecDeque<String>,
    pending_blocked: Vec<PathBuf>,
    deferred_assets: Vec<AssetRecord>,
    deferred_dependencies: Vec<PackageDependencyRecord>,
    /// Packages with at least one deferred asset; their dependency records
    /// defer too, preserving asset-before-dependency ordering.
    deferred_packages: FnvHashSet<NormalizedPath>,
    force_completion: bool,
    no_progress_ticks: u32,
    packages_processed: usize,
    last_progress_event: usize,
    /// Set once the current gather's finalization ran; re-armed when new
    /// work shows up after completion (an additional mount).
    finalized: bool,
    waiting_for_events: bool,
}

impl GatherScheduler {
    pub fn new() -> Self {
        Self {
            pending_paths: VecDeque::new(),
            pending_assets: VecDeque::new(),
            pending_dependencies: VecDeque::new(),
            pending_removals: VecDeque::new(),
            pending_blocked: Vec::new(),
            deferred_assets: Vec::new(),
            deferred_dependencies: Vec::new(),
            deferred_packages: FnvHashSet::default(),
            force_completion: false,
            no_progress_ticks: 0,
            packages_processed: 0,
            last_progress_event: 0,
            finalized: false,
            waiting_for_events: false,
        }
    }

    /// Whether the scheduler still holds unapplied work.
    pub fn has_pending_work(&self) -> bool {
        !self.pending_paths.is_empty()
            || !self.pending_assets.is_empty()
            || !self.pending_dependencies.is_empty()
            || !self.pending_removals.is_empty()
            || !self.deferred_assets.is_empty()
            || !self.deferred_dependencies.is_empty()
    }

    /// Runs one tick. `max_duration` of `None` means full flush.
    pub fn tick(&mut self, state: &mut RegistryState, inputs: TickInputs<'_>) -> TickState {
        let TickInputs {
            gatherer,
            classes,
            gather_state,
            events,
            max_duration,
            interrupt,
            verify_mounts,
            events_pending,
        } = inputs;

        // Step 1: take ownership of everything the gatherer has queued.
        let mut batch = GatherBatch::new();
        gatherer.get_and_trim_results(&mut batch);
        let drained_any = !batch.is_empty();
        self.absorb(batch);

        if drained_any && self.finalized {
            // New work after a completed search: an additional mount.
            self.finalized = false;
            self.waiting_for_events = false;
        }

        let mut budget = TickBudget::new(max_duration, interrupt);
        let mut applied = 0usize;

        // Step 2: discovered paths, re-verified against live mounts when the
        // configuration requires it (protects against unmount races).
        while let Some(path) = self.pending_paths.pop_front() {
            if budget.expired() {
                self.pending_paths.push_front(path);
                return self.active_state(gatherer);
            }
            if verify_mounts && !gatherer.is_mounted_virtual(&path) {
                log::debug!("discarding path {path}: no longer mounted");
                continue;
            }
            if state.path_tree_mut().add_path(&path) {
                events.push(RegistryEvent::PathAdded(path));
            }
        }

        // Step 2b: removals. Asset records go first, then package-level
        // cleanup with the placeholder rule for still-referenced nodes.
        while let Some(package_name) = self.pending_removals.pop_front() {
            if budget.expired() {
                self.pending_removals.push_front(package_name);
                return self.active_state(gatherer);
            }
            let package_key = NormalizedPath::new(&package_name);
            let keys: Vec<NormalizedPath> = state.assets_in_package(&package_key).to_vec();
            for key in keys {
                if let Some(removed) = state.remove_asset(&key) {
                    events.push(RegistryEvent::AssetRemoved(removed));
                }
            }
            state.remove_package(&package_name);
            gather_state.bump_reallocation_version();
        }

        // Steps 3-5: assets, then dependency records, then bounded retries of
        // the deferred queues while progress is being made.
        let mut pass = 0u32;
        loop {
            let before = applied;
            if !self.process_assets(state, classes, events, &mut budget, &mut applied) {
                return self.active_state(gatherer);
            }
            if !self.process_dependencies(state, &mut budget) {
                return self.active_state(gatherer);
            }

            if self.deferred_assets.is_empty() && self.deferred_dependencies.is_empty() {
                break;
            }
            let force_newly_engaged = self.maybe_engage_force_completion(gatherer, applied);
            let progressed = applied > before;
            // A deferred class that became resolvable since it was parked
            // also counts as forward progress worth a retry pass.
            let resolvable = self
                .deferred_assets
                .iter()
                .any(|record| classes.resolve(&record.class_path).is_some());
            if !progressed && !force_newly_engaged && !resolvable {
                break;
            }
            pass += 1;
            if pass > MAX_RETRY_PASSES {
                log::error!(
                    "deferred-asset retry did not terminate after {MAX_RETRY_PASSES} passes; \
                     {} assets remain deferred",
                    self.deferred_assets.len()
                );
                break;
            }
            self.requeue_deferred();
        }

        if applied > 0 {
            gather_state.bump_reallocation_version();
        }

        // Blocked files surface as an event, not an error.
        if !self.pending_blocked.is_empty() {
            events.push(RegistryEvent::FilesBlocked(std::mem::take(&mut self.pending_blocked)));
        }

        let gather_idle = gatherer.is_idle() && !gatherer.has_queued_results();
        if self.packages_processed > self.last_progress_event {
            self.last_progress_event = self.packages_processed;
            events.push(RegistryEvent::ScanProgress {
                packages_processed: self.packages_processed,
                is_discovery_complete: gather_idle,
            });
        }

        // Step 6: completion bookkeeping.
        if !gather_idle {
            self.no_progress_ticks = 0;
            return TickState::TickActiveGatherActive;
        }
        if self.has_live_pending() {
            return TickState::TickActiveGatherIdle;
        }
        if !self.deferred_assets.is_empty() || !self.deferred_dependencies.is_empty() {
            if applied == 0 {
                self.no_progress_ticks += 1;
            } else {
                self.no_progress_ticks = 0;
            }
            return TickState::UnableToProgress;
        }
        self.no_progress_ticks = 0;

        if !gather_state.is_search_all_assets() && self.packages_processed == 0 && !self.finalized {
            return TickState::Idle;
        }

        // A search-all pass that starts after a targeted scan already drained
        // everything still owes its milestone; re-run finalization for it.
        let owes_initial_milestone =
            gather_state.is_search_all_assets() && !gather_state.is_initial_search_completed();
        if !self.finalized || owes_initial_milestone {
            // This tick is responsible for reaching the drained state: run
            // one-time finalization before reporting anything further.
            self.finalized = true;
            self.waiting_for_events = true;
            state.graph_mut().set_sort_enabled(true);
            gather_state.set_performance_mode(PerformanceMode::MostlyStatic);
            // Milestones only apply to the search-all pass; a targeted scan
            // before it fires neither.
            if gather_state.is_search_all_assets() {
                let milestone = if gather_state.is_initial_search_completed() {
                    RegistryEvent::AdditionalMountSearchCompleted
                } else {
                    gather_state.mark_initial_search_completed();
                    RegistryEvent::InitialSearchCompleted
                };
                // Pushed after every asset event collected this gather, so
                // subscribers observe the milestone last.
                events.push(milestone);
            }
            state.log_stats();
            return TickState::WaitingForEvents;
        }

        if self.waiting_for_events {
            if events_pending || !events.is_empty() {
                return TickState::WaitingForEvents;
            }
            self.waiting_for_events = false;
        }
        TickState::Complete
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn absorb(&mut self, batch: GatherBatch) {
        self.pending_paths.extend(batch.paths);
        self.pending_assets.extend(batch.assets);
        self.pending_dependencies.extend(batch.dependencies);
        self.pending_removals.extend(batch.removed_packages);
        self.pending_blocked.extend(batch.blocked_files);
        self.packages_processed += batch.packages_processed;
    }

    fn has_live_pending(&self) -> bool {
        !self.pending_paths.is_empty()
            || !self.pending_assets.is_empty()
            || !self.pending_dependencies.is_empty()
            || !self.pending_removals.is_empty()
    }

    fn active_state(&self, gatherer: &Gatherer) -> TickState {
        if gatherer.is_idle() && !gatherer.has_queued_results() {
            TickState::TickActiveGatherIdle
        } else {
            TickState::TickActiveGatherActive
        }
    }

    /// Engages the force-completion valve once the gatherer has gone idle
    /// and several ticks passed with deferred items but no progress. Returns
    /// whether it newly engaged.
    fn maybe_engage_force_completion(&mut self, gatherer: &Gatherer, applied: usize) -> bool {
        if self.force_completion {
            return false;
        }
        if self.deferred_assets.is_empty() && self.deferred_dependencies.is_empty() {
            return false;
        }
        let stable = gatherer.is_idle()
            && !gatherer.has_queued_results()
            && !self.has_live_pending()
            && applied == 0
            && self.no_progress_ticks >= FORCE_COMPLETION_AFTER_TICKS;
        if stable {
            log::warn!(
                "forcing completion of {} deferred assets whose classes never loaded",
                self.deferred_assets.len()
            );
            self.force_completion = true;
            return true;
        }
        false
    }

    fn requeue_deferred(&mut self) {
        self.pending_assets.extend(self.deferred_assets.drain(..));
        self.pending_dependencies.extend(self.deferred_dependencies.drain(..));
        self.deferred_packages.clear();
    }

    /// Step 3: post-process and apply pending assets. Returns false when the
    /// budget expired mid-stream (queues preserved for the next tick).
    fn process_assets(
        &mut self,
        state: &mut RegistryState,
        classes: &ClassProviderRegistry,
        events: &mut EventContext,
        budget: &mut TickBudget,
        applied: &mut usize,
    ) -> bool {
        while let Some(mut record) = self.pending_assets.pop_front() {
            if budget.expired() {
                self.pending_assets.push_front(record);
                return false;
            }
            match classes.resolve(&record.class_path) {
                Some(provider) => {
                    record.tags = provider.post_process_tags(&record.class_path, &record.tags);
                }
                None if self.force_completion => {
                    // Escape valve: apply with raw tags rather than defer
                    // forever.
                }
                None => {
                    self.deferred_packages.insert(record.package_key());
                    self.deferred_assets.push(record);
                    continue;
                }
            }
            self.apply_asset(state, events, record);
            *applied += 1;
        }
        true
    }

    fn apply_asset(&mut self, state: &mut RegistryState, events: &mut EventContext, record: AssetRecord) {
        if state.path_tree_mut().add_path(&record.package_path) {
            events.push(RegistryEvent::PathAdded(record.package_path.clone()));
        }
        let key = record.key();
        match state.asset_by_key(&key) {
            None => {
                let event_copy = record.clone();
                state.add_asset(record);
                events.push(RegistryEvent::AssetAdded(event_copy));
            }
            Some(existing) if existing.package_key() == record.package_key() => {
                let event_copy = record.clone();
                if state.update_asset(&key, record, false) == Some(true) {
                    events.push(RegistryEvent::AssetUpdated(event_copy));
                }
            }
            Some(existing) => {
                // Two different packages produced the same object path.
                if state.resolve_collision(existing, &record) == CollisionWinner::TakeIncoming {
                    let event_copy = record.clone();
                    if state.update_asset(&key, record, false) == Some(true) {
                        events.push(RegistryEvent::AssetUpdated(event_copy));
                    }
                }
            }
        }
    }

    /// Step 4: apply pending dependency records, deferring any whose owning
    /// asset is still deferred.
    fn process_dependencies(&mut self, state: &mut RegistryState, budget: &mut TickBudget) -> bool {
        while let Some(record) = self.pending_dependencies.pop_front() {
            if budget.expired() {
                self.pending_dependencies.push_front(record);
                return false;
            }
            let package_key = NormalizedPath::new(&record.package_name);
            if self.deferred_packages.contains(&package_key) {
                self.deferred_dependencies.push(record);
                continue;
            }
            Self::apply_dependency_record(state, &package_key, record);
        }
        true
    }

    fn apply_dependency_record(
        state: &mut RegistryState,
        package_key: &NormalizedPath,
        record: PackageDependencyRecord,
    ) {
        let identifier = AssetIdentifier::from_package(&record.package_name);
        let node = state.graph_mut().create_or_find_node(&identifier);
        // Re-gathering replaces the package's prior outgoing edges wholesale;
        // manage edges are set by a separate pass and survive.
        state.graph_mut().clear_edges(node, DependencyCategory::Package);
        state.graph_mut().clear_edges(node, DependencyCategory::SearchableName);
        for edge in &record.dependencies {
            let target = state.graph_mut().create_or_find_node(&edge.identifier);
            state.graph_mut().add_edge(node, target, edge.category, edge.properties);
        }

        if record.has_package_data {
            state.set_package_data(
                &record.package_name,
                PackageRecord {
                    package_hash: record.package_hash,
                    kind: Some(record.kind),
                    chunk_ids: record.chunk_ids.clone(),
                    location: record.location,
                },
            );
        }
        if state.assets_in_package(package_key).is_empty() {
            state.mark_empty_package(package_key.clone());
        }
    }
}

impl Default for GatherScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::{ClassMetadataProvider, PassthroughProvider};
    use crate::gather::gatherer::GatherMode;
    use crate::reader::{
        write_package_file, LoosePackageReader, PackageAssetEntry, PackageFileData,
    };
    use crate::types::TagMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Rig {
        _dir: TempDir,
        gatherer: Gatherer,
        scheduler: GatherScheduler,
        state: RegistryState,
        gather_state: GatherState,
    }

    impl Rig {
        fn new(write_fixtures: impl FnOnce(&std::path::Path)) -> Self {
            let dir = TempDir::new().unwrap();
            write_fixtures(dir.path());
            let gatherer = Gatherer::new(GatherMode::Synchronous, Arc::new(LoosePackageReader));
            gatherer.add_mount_point(dir.path(), "/Game").unwrap();
            Self {
                _dir: dir,
                gatherer,
                scheduler: GatherScheduler::new(),
                state: RegistryState::new(),
                gather_state: GatherState::new(),
            }
        }

        fn tick(&mut self, classes: &ClassProviderRegistry) -> (TickState, EventContext) {
            self.gatherer.pump(usize::MAX);
            let mut events = EventContext::new();
            let tick_state = self.scheduler.tick(
                &mut self.state,
                TickInputs {
                    gatherer: &self.gatherer,
                    classes,
                    gather_state: &self.gather_state,
                    events: &mut events,
                    max_duration: None,
                    interrupt: None,
                    verify_mounts: true,
                    events_pending: false,
                },
            );
            (tick_state, events)
        }

        fn tick_to_completion(&mut self, classes: &ClassProviderRegistry) -> Vec<EventContext> {
            let mut contexts = Vec::new();
            for _ in 0..32 {
                let (tick_state, events) = self.tick(classes);
                contexts.push(events);
                if tick_state == TickState::Complete {
                    return contexts;
                }
            }
            panic!("tick loop did not complete");
        }
    }

    fn simple_package(asset: &str, class: &str) -> PackageFileData {
        PackageFileData {
            assets: vec![PackageAssetEntry {
                asset_name: asset.to_string(),
                class_path: class.to_string(),
                tags: TagMap::new(),
            }],
            ..PackageFileData::default()
        }
    }

    #[test]
    fn scan_applies_assets_and_completes_after_events_drain() {
        let mut rig = Rig::new(|root| {
            write_package_file(&root.join("Sword.apkg"), &simple_package("Sword", "/Script/C.Weapon"))
                .unwrap();
        });
        let classes = ClassProviderRegistry::new();
        rig.gather_state.mark_search_all_assets_started();

        let (first, events) = rig.tick(&classes);
        assert_eq!(first, TickState::WaitingForEvents);
        assert!(events
            .iter()
            .any(|e| matches!(e, RegistryEvent::InitialSearchCompleted)));
        assert!(rig.gather_state.is_initial_search_completed());
        assert!(rig.state.asset_by_object_path("/Game/Sword.Sword").is_some());

        let (second, _) = rig.tick(&classes);
        assert_eq!(second, TickState::Complete);
        // Completion is monotone: ticking again stays complete.
        let (third, _) = rig.tick(&classes);
        assert_eq!(third, TickState::Complete);
    }

    #[test]
    fn unresolved_class_defers_then_applies_on_registration() {
        let mut rig = Rig::new(|root| {
            write_package_file(
                &root.join("Inst.apkg"),
                &simple_package("Inst", "/Game/Classes.Weapon_C"),
            )
            .unwrap();
        });
        let classes = ClassProviderRegistry::strict();
        rig.gather_state.mark_search_all_assets_started();

        let (tick_state, _) = rig.tick(&classes);
        assert_eq!(tick_state, TickState::UnableToProgress);
        assert!(rig.state.asset_by_object_path("/Game/Inst.Inst").is_none());
        // Dependencies deferred with the asset: no graph node, no package
        // record yet.
        assert!(rig.state.package_data("/Game/Inst").is_none());

        classes.register("/Game/Classes.Weapon_C", Arc::new(PassthroughProvider));
        rig.tick_to_completion(&classes);
        assert!(rig.state.asset_by_object_path("/Game/Inst.Inst").is_some());
        assert!(rig.state.package_data("/Game/Inst").is_some());
        assert_eq!(rig.state.num_assets(), 1);
    }

    #[test]
    fn force_completion_valve_engages_after_stable_ticks() {
        let mut rig = Rig::new(|root| {
            write_package_file(
                &root.join("Inst.apkg"),
                &simple_package("Inst", "/Game/Classes.Never_C"),
            )
            .unwrap();
        });
        let classes = ClassProviderRegistry::strict();
        rig.gather_state.mark_search_all_assets_started();

        let contexts = rig.tick_to_completion(&classes);
        assert!(contexts.len() > FORCE_COMPLETION_AFTER_TICKS as usize);
        // The valve applied the asset with raw tags rather than deferring
        // forever.
        assert!(rig.state.asset_by_object_path("/Game/Inst.Inst").is_some());
    }

    #[test]
    fn milestone_event_orders_after_asset_events() {
        let mut rig = Rig::new(|root| {
            write_package_file(&root.join("A.apkg"), &simple_package("A", "/Script/C.Thing")).unwrap();
            write_package_file(&root.join("B.apkg"), &simple_package("B", "/Script/C.Thing")).unwrap();
        });
        let classes = ClassProviderRegistry::new();
        rig.gather_state.mark_search_all_assets_started();

        let contexts = rig.tick_to_completion(&classes);
        let flattened: Vec<&RegistryEvent> = contexts.iter().flat_map(|c| c.iter()).collect();
        let milestone = flattened
            .iter()
            .position(|e| matches!(e, RegistryEvent::InitialSearchCompleted))
            .expect("milestone fired");
        for (i, event) in flattened.iter().enumerate() {
            if matches!(event, RegistryEvent::AssetAdded(_)) {
                assert!(i < milestone, "asset event after milestone");
            }
        }
    }

    #[test]
    fn tag_post_processing_runs_before_records_land() {
        struct Stamp;
        impl ClassMetadataProvider for Stamp {
            fn post_process_tags(&self, _class: &str, tags: &TagMap) -> TagMap {
                let mut out = tags.clone();
                out.insert("Stamped".into(), "yes".into());
                out
            }
        }

        let mut rig = Rig::new(|root| {
            write_package_file(&root.join("S.apkg"), &simple_package("S", "/Script/C.Weapon")).unwrap();
        });
        let classes = ClassProviderRegistry::new();
        classes.register("/Script/C.Weapon", Arc::new(Stamp));
        rig.gather_state.mark_search_all_assets_started();
        rig.tick_to_completion(&classes);

        let record = rig.state.asset_by_object_path("/Game/S.S").unwrap();
        assert_eq!(record.tags.get("Stamped").map(String::as_str), Some("yes"));
    }
}
