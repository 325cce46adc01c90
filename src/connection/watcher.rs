//! Workspace file watching
//!
//! Watches the workspace root recursively and reports batches of changes to
//! files matching the [`FileWatchPattern`]. The debouncer only says "this
//! path changed", so an initial scan seeds the set of known files and each
//! event is classified as created, changed or deleted against it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, Debouncer, new_debouncer};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::connection::config::FileWatchPattern;
use crate::connection::error::WatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    Created,
    Changed,
    Deleted,
}

/// A single change, `path` is absolute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: FileChangeKind,
}

/// Tracks which matching files exist to classify raw change events
#[derive(Debug, Default)]
pub struct ChangeTracker {
    known: HashSet<PathBuf>,
}

impl ChangeTracker {
    /// Seed from every matching file currently under `root`
    pub fn scan(root: &Path, pattern: &FileWatchPattern) -> Self {
        let known = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                entry
                    .path()
                    .strip_prefix(root)
                    .is_ok_and(|relative| pattern.matches(relative))
            })
            .map(|entry| entry.into_path())
            .collect::<HashSet<_>>();

        debug!(
            root = %root.display(),
            files = known.len(),
            "Seeded watched file set"
        );
        Self { known }
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// `None` when a path vanished that was never seen
    pub fn classify(&mut self, path: &Path, exists: bool) -> Option<FileChangeKind> {
        match (exists, self.known.contains(path)) {
            (true, true) => Some(FileChangeKind::Changed),
            (true, false) => {
                self.known.insert(path.to_path_buf());
                Some(FileChangeKind::Created)
            }
            (false, true) => {
                self.known.remove(path);
                Some(FileChangeKind::Deleted)
            }
            (false, false) => None,
        }
    }
}

/// Debounced watcher emitting batches of [`FileChange`]
pub struct FileWatcher {
    _debouncer: Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<Vec<FileChange>>,
}

impl FileWatcher {
    pub fn new(
        root: &Path,
        pattern: FileWatchPattern,
        debounce: Duration,
    ) -> Result<Self, WatchError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        // Events arrive with canonical paths on platforms with symlinked tmp dirs
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let mut tracker = ChangeTracker::scan(&root, &pattern);
        let event_root = root.clone();
        let glob = pattern.as_str().to_string();

        let mut debouncer = new_debouncer(
            debounce,
            move |res: Result<Vec<DebouncedEvent>, notify::Error>| match res {
                Ok(events) => {
                    let batch = collect_changes(&event_root, &pattern, &mut tracker, events);
                    if !batch.is_empty() && event_tx.send(batch).is_err() {
                        debug!("Watch receiver dropped");
                    }
                }
                Err(e) => warn!(error = %e, "Filesystem watch error"),
            },
        )
        .map_err(WatchError::Create)?;

        debouncer
            .watcher()
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|source| WatchError::Watch {
                path: root.clone(),
                source,
            })?;

        info!(
            path = %root.display(),
            glob = %glob,
            debounce_ms = debounce.as_millis() as u64,
            "Started file watcher"
        );

        Ok(Self {
            _debouncer: debouncer,
            event_rx,
        })
    }

    /// Next batch of changes; `None` once the watcher is gone
    pub async fn recv(&mut self) -> Option<Vec<FileChange>> {
        self.event_rx.recv().await
    }
}

fn collect_changes(
    root: &Path,
    pattern: &FileWatchPattern,
    tracker: &mut ChangeTracker,
    events: Vec<DebouncedEvent>,
) -> Vec<FileChange> {
    let mut seen = HashSet::new();
    let mut batch = Vec::new();

    for event in events {
        let Ok(relative) = event.path.strip_prefix(root) else {
            continue;
        };
        if !pattern.matches(relative) || !seen.insert(event.path.clone()) {
            continue;
        }

        let exists = event.path.is_file();
        if let Some(kind) = tracker.classify(&event.path, exists) {
            debug!(path = %event.path.display(), ?kind, "Watched file changed");
            batch.push(FileChange {
                path: event.path,
                kind,
            });
        }
    }

    batch
}
