//! Workspace file watch for `workspace/didChangeWatchedFiles`.
//!
//! A recursive debounced watch on the workspace root. The debouncer only says
//! "something happened to this path", so the kind of change is recovered by
//! comparing against the set of matching files we know about.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use globset::{GlobBuilder, GlobMatcher};
use notify_debouncer_mini::notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer};
use tokio::sync::mpsc;

use crate::error::ClientError;
use crate::types::{FileChangeType, FileEvent};

const DEBOUNCE: Duration = Duration::from_millis(250);

/// Glob for files in the workspace whose changes the server is told about.
pub const CLIENT_CONFIG_GLOB: &str = "**/.clientrc";

pub(crate) fn compile_pattern(glob: &str) -> Result<GlobMatcher, ClientError> {
    let glob = GlobBuilder::new(glob)
        .literal_separator(true)
        .build()
        .map_err(|e| ClientError::Pattern(e.to_string()))?;
    Ok(glob.compile_matcher())
}

fn is_watched(root: &Path, matcher: &GlobMatcher, path: &Path) -> bool {
    match path.strip_prefix(root) {
        Ok(relative) => matcher.is_match(relative),
        Err(_) => false,
    }
}

/// Decide what happened to `path`, updating `known` to match.
///
/// A vanished path we never saw is noise and yields `None`.
fn classify(path: &Path, exists: bool, known: &mut HashSet<PathBuf>) -> Option<FileChangeType> {
    match (exists, known.contains(path)) {
        (true, true) => Some(FileChangeType::Changed),
        (true, false) => {
            known.insert(path.to_path_buf());
            Some(FileChangeType::Created)
        }
        (false, true) => {
            known.remove(path);
            Some(FileChangeType::Deleted)
        }
        (false, false) => None,
    }
}

/// Matching files present when the watch starts.
///
/// Ignore files are not honoured here: the live watch reports ignored paths
/// too, and both sides have to agree on what is known.
fn initial_inventory(root: &Path, matcher: &GlobMatcher) -> HashSet<PathBuf> {
    ignore::WalkBuilder::new(root)
        .standard_filters(false)
        .build()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
        .map(ignore::DirEntry::into_path)
        .filter(|path| is_watched(root, matcher, path))
        .collect()
}

/// Keeps the watch alive; dropping it stops watching.
pub(crate) struct FileWatcher {
    _debouncer: Debouncer<RecommendedWatcher>,
}

impl FileWatcher {
    /// Watch `root` recursively and send batches of matching changes to `tx`.
    pub fn start(
        root: &Path,
        glob: &str,
        tx: mpsc::Sender<Vec<FileEvent>>,
    ) -> Result<Self, ClientError> {
        let matcher = compile_pattern(glob)?;
        // Watch backends report canonical paths.
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let known = Arc::new(Mutex::new(initial_inventory(&root, &matcher)));
        tracing::debug!(
            root = %root.display(),
            glob,
            existing = known.lock().unwrap_or_else(PoisonError::into_inner).len(),
            "Starting file watch"
        );

        let handler_root = root.clone();
        let mut debouncer = new_debouncer(DEBOUNCE, move |result: DebounceEventResult| {
            let events = match result {
                Ok(events) => events,
                Err(err) => {
                    tracing::warn!("File watch error: {err:?}");
                    return;
                }
            };

            let mut known = known.lock().unwrap_or_else(PoisonError::into_inner);
            let batch: Vec<FileEvent> = events
                .into_iter()
                .map(|event| event.path)
                .filter(|path| is_watched(&handler_root, &matcher, path))
                .collect::<HashSet<_>>()
                .into_iter()
                .filter_map(|path| {
                    let kind = classify(&path, path.is_file(), &mut known)?;
                    Some(FileEvent { path, kind })
                })
                .collect();
            drop(known);

            if !batch.is_empty() && tx.blocking_send(batch).is_err() {
                tracing::debug!("File watch receiver dropped");
            }
        })?;

        debouncer
            .watcher()
            .watch(&root, RecursiveMode::Recursive)?;

        Ok(Self {
            _debouncer: debouncer,
        })
    }
}
