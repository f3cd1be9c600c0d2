//! Package file discovery and reading.
//!
//! The gatherer walks mounted directories, classifies files, reads each
//! candidate through the [`PackageReader`] collaborator, and publishes
//! results into thread-safe queues. It runs either synchronously (work
//! happens when the caller pumps) or asynchronously (a dedicated worker
//! thread), chosen at construction and immutable thereafter.
//!
//! Unreadable or malformed package files become blocked-file entries in the
//! result batch; the scan continues.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;

use super::batch::{DependencyEdge, GatherBatch, PackageDependencyRecord};
use crate::error::{RegistryError, Result};
use crate::reader::PackageReader;
use crate::types::{parent_virtual_path, PackageKind};

/// How many queued file reads one worker iteration hands to rayon at once.
const READ_BATCH: usize = 8;

/// Sleep quantum for pause/idle polling loops.
const POLL_SLEEP: Duration = Duration::from_millis(1);

/// Execution mode, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherMode {
    /// All work happens on the calling thread when explicitly pumped.
    Synchronous,
    /// A dedicated background thread discovers and reads continuously.
    Asynchronous,
}

#[derive(Debug, Clone)]
struct MountPoint {
    local: PathBuf,
    virtual_root: String,
}

#[derive(Debug)]
enum ScanTask {
    Directory { local: PathBuf, virtual_path: String },
    File { local: PathBuf, virtual_path: String, kind: PackageKind },
}

enum WorkerSignal {
    Wake,
    Stop,
}

struct GatherShared {
    reader: Arc<dyn PackageReader>,
    queue: Mutex<VecDeque<ScanTask>>,
    results: Mutex<GatherBatch>,
    mounts: RwLock<Vec<MountPoint>>,
    paused: AtomicBool,
    stopped: AtomicBool,
    /// True while the worker is mid-item; `is_idle` is queue-empty AND not
    /// busy, so a drained queue with an in-flight read still reads as busy.
    busy: AtomicBool,
}

impl GatherShared {
    fn is_idle(&self) -> bool {
        !self.busy.load(Ordering::SeqCst) && self.queue.lock().is_empty()
    }

    fn enqueue(&self, task: ScanTask) {
        self.queue.lock().push_back(task);
    }

    /// Maps a local path to its virtual package path (extension stripped for
    /// files). `None` when no mount covers it.
    fn virtual_for_local(&self, local: &Path, is_file: bool) -> Option<String> {
        let mounts = self.mounts.read();
        for mount in mounts.iter() {
            let Ok(suffix) = local.strip_prefix(&mount.local) else {
                continue;
            };
            let mut out = mount.virtual_root.trim_end_matches('/').to_string();
            let components: Vec<_> = suffix.components().collect();
            for (i, component) in components.iter().enumerate() {
                let name = component.as_os_str().to_string_lossy();
                let last = i + 1 == components.len();
                if last && is_file {
                    let stem = Path::new(name.as_ref())
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| name.into_owned());
                    out.push('/');
                    out.push_str(&stem);
                } else {
                    out.push('/');
                    out.push_str(&name);
                }
            }
            return Some(out);
        }
        None
    }

    // -----------------------------------------------------------------------
    // Task processing (runs on the worker thread or a pumping caller)
    // -----------------------------------------------------------------------

    /// Processes one queued item (a directory, or a rayon batch of files).
    /// Returns false when the queue was empty.
    fn process_next(&self) -> bool {
        self.busy.store(true, Ordering::SeqCst);
        let task = self.queue.lock().pop_front();
        let Some(task) = task else {
            self.busy.store(false, Ordering::SeqCst);
            return false;
        };
        match task {
            ScanTask::Directory { local, virtual_path } => {
                self.process_directory(&local, &virtual_path);
            }
            first @ ScanTask::File { .. } => {
                let mut files = vec![first];
                {
                    let mut queue = self.queue.lock();
                    while files.len() < READ_BATCH {
                        match queue.front() {
                            Some(ScanTask::File { .. }) => {
                                files.push(queue.pop_front().expect("front just checked"));
                            }
                            _ => break,
                        }
                    }
                }
                self.process_files(files);
            }
        }
        self.busy.store(false, Ordering::SeqCst);
        true
    }

    fn process_directory(&self, local: &Path, virtual_path: &str) {
        let entries = match fs::read_dir(local) {
            Ok(entries) => entries,
            Err(error) => {
                log::warn!("failed to enumerate {}: {error}", local.display());
                return;
            }
        };
        let mut children: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
        children.sort();

        let mut discovered_paths = Vec::new();
        for child in children {
            let Some(name) = child.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if child.is_dir() {
                let child_virtual = format!("{virtual_path}/{name}");
                discovered_paths.push(child_virtual.clone());
                self.enqueue(ScanTask::Directory {
                    local: child,
                    virtual_path: child_virtual,
                });
            } else if let Some(kind) = PackageKind::from_path(&child) {
                let stem = child
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or(name);
                self.enqueue(ScanTask::File {
                    local: child,
                    virtual_path: format!("{virtual_path}/{stem}"),
                    kind,
                });
            }
        }
        if !discovered_paths.is_empty() {
            self.results.lock().paths.append(&mut discovered_paths);
        }
    }

    fn process_files(&self, files: Vec<ScanTask>) {
        let outcomes: Vec<_> = files
            .par_iter()
            .map(|task| {
                let ScanTask::File { local, virtual_path, kind } = task else {
                    unreachable!("process_files only receives file tasks");
                };
                let package_path = parent_virtual_path(virtual_path).to_string();
                let result = self
                    .reader
                    .read_file(local, virtual_path, &package_path, *kind);
                (local.clone(), virtual_path.clone(), *kind, result)
            })
            .collect();

        let mut results = self.results.lock();
        for (local, virtual_path, kind, outcome) in outcomes {
            match outcome {
                Ok(read) => {
                    results.assets.extend(read.assets);
                    results.dependencies.push(PackageDependencyRecord {
                        package_name: virtual_path,
                        dependencies: read
                            .dependencies
                            .iter()
                            .map(|entry| DependencyEdge {
                                identifier: entry.identifier.clone(),
                                category: entry.category,
                                properties: entry.properties(),
                            })
                            .collect(),
                        package_hash: read.package_hash,
                        kind,
                        chunk_ids: read.chunk_ids,
                        location: read.location,
                        has_package_data: read.has_package_data,
                    });
                    results.packages_processed += 1;
                }
                Err(error) => {
                    log::warn!("blocked package file {}: {error}", local.display());
                    results.blocked_files.push(local);
                    results.packages_processed += 1;
                }
            }
        }
    }
}

/// The gatherer. See module docs.
pub struct Gatherer {
    shared: Arc<GatherShared>,
    mode: GatherMode,
    signal_tx: Sender<WorkerSignal>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Gatherer {
    pub fn new(mode: GatherMode, reader: Arc<dyn PackageReader>) -> Self {
        let shared = Arc::new(GatherShared {
            reader,
            queue: Mutex::new(VecDeque::new()),
            results: Mutex::new(GatherBatch::new()),
            mounts: RwLock::new(Vec::new()),
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            busy: AtomicBool::new(false),
        });
        let (signal_tx, signal_rx) = crossbeam_channel::unbounded();
        let worker = match mode {
            GatherMode::Synchronous => None,
            GatherMode::Asynchronous => {
                let worker_shared = shared.clone();
                Some(
                    std::thread::Builder::new()
                        .name("asset-gatherer".to_string())
                        .spawn(move || worker_loop(worker_shared, signal_rx))
                        .expect("failed to spawn gather thread"),
                )
            }
        };
        Self {
            shared,
            mode,
            signal_tx,
            worker: Mutex::new(worker),
        }
    }

    #[inline]
    pub fn mode(&self) -> GatherMode {
        self.mode
    }

    // -----------------------------------------------------------------------
    // Mount management
    // -----------------------------------------------------------------------

    /// Registers a mount and queues its root for scanning.
    pub fn add_mount_point(&self, local: &Path, virtual_root: &str) -> Result<()> {
        if !virtual_root.starts_with('/') {
            return Err(RegistryError::Mount(format!(
                "virtual root must start with '/': {virtual_root}"
            )));
        }
        if !local.is_dir() {
            return Err(RegistryError::Mount(format!(
                "mount directory does not exist: {}",
                local.display()
            )));
        }
        let virtual_root = virtual_root.trim_end_matches('/').to_string();
        self.shared.mounts.write().push(MountPoint {
            local: local.to_path_buf(),
            virtual_root: virtual_root.clone(),
        });
        self.shared.results.lock().paths.push(virtual_root.clone());
        self.shared.enqueue(ScanTask::Directory {
            local: local.to_path_buf(),
            virtual_path: virtual_root,
        });
        self.wake();
        Ok(())
    }

    /// Unregisters a mount and discards queued work under it.
    pub fn remove_mount_point(&self, local: &Path) {
        self.shared.mounts.write().retain(|m| m.local != local);
        self.shared.queue.lock().retain(|task| {
            let task_local = match task {
                ScanTask::Directory { local, .. } => local,
                ScanTask::File { local, .. } => local,
            };
            !task_local.starts_with(local)
        });
    }

    /// Whether any mount still covers the given virtual path. The scheduler
    /// uses this to re-verify results against mounts removed mid-scan.
    pub fn is_mounted_virtual(&self, virtual_path: &str) -> bool {
        let candidate = virtual_path.to_ascii_lowercase();
        self.shared.mounts.read().iter().any(|mount| {
            let base = mount.virtual_root.to_ascii_lowercase();
            candidate == base
                || (candidate.len() > base.len()
                    && candidate.starts_with(&base)
                    && candidate.as_bytes()[base.len()] == b'/')
        })
    }

    // -----------------------------------------------------------------------
    // Targeted scans and incremental hooks
    // -----------------------------------------------------------------------

    /// Queues specific files for scanning outside normal mount enumeration.
    /// A path with an ambiguous extension falls back to probing the known
    /// package extensions on disk.
    pub fn add_required_files(&self, files: &[PathBuf]) {
        for file in files {
            if let Some(kind) = PackageKind::from_path(file) {
                self.enqueue_file(file, kind);
            } else {
                for kind in [PackageKind::Asset, PackageKind::Map] {
                    let candidate = file.with_extension(kind.extension());
                    if candidate.is_file() {
                        self.enqueue_file(&candidate, kind);
                    }
                }
            }
        }
        self.wake();
    }

    /// Queues specific directories for scanning.
    pub fn add_required_directories(&self, directories: &[PathBuf]) {
        for directory in directories {
            if let Some(virtual_path) = self.shared.virtual_for_local(directory, false) {
                self.shared.enqueue(ScanTask::Directory {
                    local: directory.clone(),
                    virtual_path,
                });
            } else {
                log::warn!("required directory {} is not mounted", directory.display());
            }
        }
        self.wake();
    }

    /// Directory-watcher hook: a package file appeared.
    pub fn on_file_created(&self, local: &Path) {
        if let Some(kind) = PackageKind::from_path(local) {
            self.enqueue_file(local, kind);
            self.wake();
        }
    }

    /// Directory-watcher hook: a package file changed.
    pub fn on_file_modified(&self, local: &Path) {
        self.on_file_created(local);
    }

    /// Directory-watcher hook: a package file disappeared. The removal rides
    /// the same result pipeline as discovery so ordering is preserved.
    pub fn on_file_removed(&self, local: &Path) {
        let Some(virtual_path) = self.shared.virtual_for_local(local, true) else {
            return;
        };
        self.shared
            .queue
            .lock()
            .retain(|task| !matches!(task, ScanTask::File { local: l, .. } if l == local));
        self.shared.results.lock().removed_packages.push(virtual_path);
    }

    fn enqueue_file(&self, local: &Path, kind: PackageKind) {
        let Some(virtual_path) = self.shared.virtual_for_local(local, true) else {
            log::warn!("required file {} is not mounted", local.display());
            return;
        };
        self.shared.enqueue(ScanTask::File {
            local: local.to_path_buf(),
            virtual_path,
            kind,
        });
    }

    // -----------------------------------------------------------------------
    // Results and lifecycle
    // -----------------------------------------------------------------------

    /// Non-blocking drain: moves accumulated results into `out`.
    pub fn get_and_trim_results(&self, out: &mut GatherBatch) {
        let mut results = self.shared.results.lock();
        out.append(&mut results);
    }

    /// Whether undrained results are waiting.
    pub fn has_queued_results(&self) -> bool {
        !self.shared.results.lock().is_empty()
    }

    /// Whether discovery and reading have nothing left to do.
    pub fn is_idle(&self) -> bool {
        self.shared.is_idle()
    }

    /// Processes up to `max_items` queued items on the calling thread.
    /// Returns whether work remains. This is the synchronous-mode pump and
    /// the take-over fast path for a paused asynchronous gatherer.
    pub fn pump(&self, max_items: usize) -> bool {
        for _ in 0..max_items {
            if self.shared.stopped.load(Ordering::SeqCst) {
                return false;
            }
            if !self.shared.process_next() {
                return false;
            }
        }
        !self.shared.is_idle()
    }

    /// Blocks until the gatherer is idle or the timeout elapses. Returns
    /// whether idle was reached. Bounded sleep loop, not a busy spin.
    pub fn wait_for_idle(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.mode == GatherMode::Synchronous {
                self.pump(usize::MAX);
            }
            if self.shared.is_idle() || self.shared.stopped.load(Ordering::SeqCst) {
                return self.shared.is_idle();
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return false;
                }
            }
            std::thread::sleep(POLL_SLEEP);
        }
    }

    /// Asks the worker to yield to a higher-priority consumer. Idempotent.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        self.wake();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Hard stop. An in-flight file read completes, but no new work starts
    /// after this returns.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        let _ = self.signal_tx.send(WorkerSignal::Stop);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    fn wake(&self) {
        let _ = self.signal_tx.send(WorkerSignal::Wake);
    }
}

impl Drop for Gatherer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: Arc<GatherShared>, signal_rx: Receiver<WorkerSignal>) {
    while !shared.stopped.load(Ordering::SeqCst) {
        if shared.paused.load(Ordering::SeqCst) {
            std::thread::sleep(POLL_SLEEP);
            continue;
        }
        if shared.process_next() {
            continue;
        }
        // Queue drained: block until woken or re-check after a bounded wait.
        match signal_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(WorkerSignal::Stop) => break,
            Ok(WorkerSignal::Wake) | Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{
        write_package_file, LoosePackageReader, PackageAssetEntry, PackageFileData,
    };
    use tempfile::TempDir;

    fn package_with_assets(names: &[&str]) -> PackageFileData {
        PackageFileData {
            assets: names
                .iter()
                .map(|name| PackageAssetEntry {
                    asset_name: (*name).to_string(),
                    class_path: "/Script/Core.Thing".to_string(),
                    tags: Default::default(),
                })
                .collect(),
            ..PackageFileData::default()
        }
    }

    fn sync_gatherer() -> Gatherer {
        Gatherer::new(GatherMode::Synchronous, Arc::new(LoosePackageReader))
    }

    #[test]
    fn synchronous_scan_discovers_paths_and_assets() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("Weapons")).unwrap();
        write_package_file(
            &dir.path().join("Weapons/Sword.apkg"),
            &package_with_assets(&["Sword"]),
        )
        .unwrap();
        write_package_file(&dir.path().join("Empty.apkg"), &package_with_assets(&[])).unwrap();
        fs::write(dir.path().join("README.txt"), "not a package").unwrap();

        let gatherer = sync_gatherer();
        gatherer.add_mount_point(dir.path(), "/Game").unwrap();
        assert!(gatherer.wait_for_idle(Some(Duration::from_secs(5))));

        let mut batch = GatherBatch::new();
        gatherer.get_and_trim_results(&mut batch);
        assert!(batch.paths.contains(&"/Game".to_string()));
        assert!(batch.paths.contains(&"/Game/Weapons".to_string()));
        assert_eq!(batch.assets.len(), 1);
        assert_eq!(batch.assets[0].object_path, "/Game/Weapons/Sword.Sword");
        assert_eq!(batch.dependencies.len(), 2);
        assert_eq!(batch.packages_processed, 2);
        assert!(batch.blocked_files.is_empty());

        // Drain is destructive.
        let mut second = GatherBatch::new();
        gatherer.get_and_trim_results(&mut second);
        assert!(second.is_empty());
    }

    #[test]
    fn malformed_package_becomes_blocked_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("Corrupt.apkg"), b"garbage").unwrap();

        let gatherer = sync_gatherer();
        gatherer.add_mount_point(dir.path(), "/Game").unwrap();
        gatherer.wait_for_idle(Some(Duration::from_secs(5)));

        let mut batch = GatherBatch::new();
        gatherer.get_and_trim_results(&mut batch);
        assert_eq!(batch.blocked_files.len(), 1);
        assert!(batch.assets.is_empty());
    }

    #[test]
    fn asynchronous_scan_reaches_idle() {
        let dir = TempDir::new().unwrap();
        for i in 0..20 {
            write_package_file(
                &dir.path().join(format!("Pkg{i}.apkg")),
                &package_with_assets(&["Main"]),
            )
            .unwrap();
        }

        let gatherer = Gatherer::new(GatherMode::Asynchronous, Arc::new(LoosePackageReader));
        gatherer.add_mount_point(dir.path(), "/Game").unwrap();
        assert!(gatherer.wait_for_idle(Some(Duration::from_secs(10))));

        let mut batch = GatherBatch::new();
        gatherer.get_and_trim_results(&mut batch);
        assert_eq!(batch.assets.len(), 20);
        gatherer.stop();
    }

    #[test]
    fn pause_holds_back_the_worker() {
        let dir = TempDir::new().unwrap();
        write_package_file(&dir.path().join("One.apkg"), &package_with_assets(&["One"])).unwrap();

        let gatherer = Gatherer::new(GatherMode::Asynchronous, Arc::new(LoosePackageReader));
        gatherer.pause();
        gatherer.add_mount_point(dir.path(), "/Game").unwrap();
        assert!(!gatherer.wait_for_idle(Some(Duration::from_millis(50))));

        // Take-over fast path: a paused gatherer can be pumped by the caller.
        while gatherer.pump(16) {}
        assert!(gatherer.is_idle());
        gatherer.resume();
        gatherer.stop();
    }

    #[test]
    fn file_removal_rides_the_result_pipeline() {
        let dir = TempDir::new().unwrap();
        let gatherer = sync_gatherer();
        gatherer.add_mount_point(dir.path(), "/Game").unwrap();
        gatherer.wait_for_idle(Some(Duration::from_secs(5)));
        let mut drained = GatherBatch::new();
        gatherer.get_and_trim_results(&mut drained);

        gatherer.on_file_removed(&dir.path().join("Gone.apkg"));
        let mut batch = GatherBatch::new();
        gatherer.get_and_trim_results(&mut batch);
        assert_eq!(batch.removed_packages, vec!["/Game/Gone".to_string()]);
    }

    #[test]
    fn required_files_probe_ambiguous_extensions() {
        let dir = TempDir::new().unwrap();
        write_package_file(&dir.path().join("Thing.amap"), &package_with_assets(&["Thing"])).unwrap();

        let gatherer = sync_gatherer();
        gatherer.add_mount_point(dir.path(), "/Game").unwrap();
        gatherer.wait_for_idle(Some(Duration::from_secs(5)));
        let mut drained = GatherBatch::new();
        gatherer.get_and_trim_results(&mut drained);

        // No extension given: the gatherer probes for .apkg/.amap on disk.
        gatherer.add_required_files(&[dir.path().join("Thing")]);
        gatherer.wait_for_idle(Some(Duration::from_secs(5)));
        let mut batch = GatherBatch::new();
        gatherer.get_and_trim_results(&mut batch);
        assert_eq!(batch.assets.len(), 1);
        assert_eq!(batch.assets[0].object_path, "/Game/Thing.Thing");
    }

    #[test]
    fn unmounted_virtual_paths_are_detected() {
        let dir = TempDir::new().unwrap();
        let gatherer = sync_gatherer();
        gatherer.add_mount_point(dir.path(), "/Game").unwrap();
        assert!(gatherer.is_mounted_virtual("/Game"));
        assert!(gatherer.is_mounted_virtual("/Game/Sub"));
        assert!(!gatherer.is_mounted_virtual("/GameOther"));

        gatherer.remove_mount_point(dir.path());
        assert!(!gatherer.is_mounted_virtual("/Game"));
    }
}
