//! Directory-watcher bridge.
//!
//! The watcher itself is an external collaborator that delivers debounced
//! events; this module translates them into gatherer work items so live
//! filesystem changes ride the same pipeline as the initial scan. Covered
//! paths are coalesced first so a batch of events under one directory
//! becomes a single rescan.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::gather::gatherer::Gatherer;

/// One debounced filesystem event. Collapsing Removed+Added pairs into
/// Modified is the watcher's responsibility before forwarding.
#[derive(Debug, Clone)]
pub enum WatcherEvent {
    Added(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
    /// The watcher lost track (overflow, remount); everything under `path`
    /// must be rescanned.
    RescanRequired {
        path: PathBuf,
        since: Option<SystemTime>,
    },
}

/// Forwards a batch of watcher events into the gatherer.
pub fn apply_watcher_events(gatherer: &Gatherer, events: Vec<WatcherEvent>) {
    let mut rescans: Vec<PathBuf> = Vec::new();
    for event in events {
        match event {
            WatcherEvent::Added(path) => gatherer.on_file_created(&path),
            WatcherEvent::Modified(path) => gatherer.on_file_modified(&path),
            WatcherEvent::Removed(path) => gatherer.on_file_removed(&path),
            WatcherEvent::RescanRequired { path, since: _ } => rescans.push(path),
        }
    }
    if !rescans.is_empty() {
        let rescans = coalesce_event_paths(rescans);
        gatherer.add_required_directories(&rescans);
    }
}

/// Computes the minimal set of paths that must be rescanned for a batch of
/// events: sort by depth so ancestors come first, then drop any path already
/// covered by a selected ancestor.
pub fn coalesce_event_paths(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    if paths.len() <= 1 {
        return paths;
    }

    let mut candidates: Vec<(PathBuf, usize)> = paths
        .into_iter()
        .map(|path| {
            let depth = path_depth(&path);
            (path, depth)
        })
        .collect();
    candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

    let mut selected: HashSet<PathBuf> = HashSet::new();
    let mut out: Vec<PathBuf> = Vec::new();
    'candidates: for (path, _) in candidates {
        let mut ancestor = path.as_path();
        while let Some(parent) = ancestor.parent() {
            if selected.contains(parent) {
                continue 'candidates;
            }
            ancestor = parent;
        }
        if selected.insert(path.clone()) {
            out.push(path);
        }
    }
    out
}

fn path_depth(path: &Path) -> usize {
    path.components().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(values: &[&str]) -> Vec<PathBuf> {
        values.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn coalesce_drops_covered_children() {
        let out = coalesce_event_paths(paths(&["/a/b/c", "/a/b", "/a/b/d", "/x/y"]));
        assert_eq!(out, paths(&["/a/b", "/x/y"]));
    }

    #[test]
    fn coalesce_deduplicates_identical_paths() {
        let out = coalesce_event_paths(paths(&["/a/b", "/a/b"]));
        assert_eq!(out, paths(&["/a/b"]));
    }

    #[test]
    fn coalesce_keeps_unrelated_paths() {
        let out = coalesce_event_paths(paths(&["/a/b", "/c/d"]));
        assert_eq!(out.len(), 2);
    }
}
