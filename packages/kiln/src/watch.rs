//! Bridges the `notify`/`notify-debouncer-full` callback API into an async
//! stream the change pipeline (`pipeline`) can drain.
//!
//! The debouncer invokes its callback from its own background thread, not
//! from a Tokio task, so the bridge is a bounded `tokio::sync::mpsc` channel
//! fed with `blocking_send` from that thread — the same "hand a blocking
//! producer a channel and let an async consumer drain it" shape this crate
//! already uses for the daemon's idle monitor.

use std::time::Duration;

use color_eyre::{Result, eyre::Context as _};
use notify_debouncer_full::{
    DebounceEventResult, Debouncer, FileIdMap,
    notify::{RecommendedWatcher, RecursiveMode},
};
use tokio::sync::mpsc;
use tracing::warn;

use crate::path::AbsDirPath;

/// A single coalesced filesystem change, already reduced to the shape the
/// pipeline needs: a path and what happened to it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawChange {
    pub path: std::path::PathBuf,
    pub kind: RawChangeKind,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RawChangeKind {
    Added,
    Modified,
    Deleted,
    /// A directory (not a single file) was removed. Most watchers already
    /// expand a recursive directory removal into a `Deleted` event per
    /// contained file, but some platforms/backends coalesce it into one
    /// folder-level event instead — this lets the pipeline fall back to
    /// enumerating the store for that case (§4.4 "Deletion of a directory").
    DirectoryDeleted,
}

/// Owns the live debouncer; dropping this stops the watch.
pub struct Watch {
    _debouncer: Debouncer<RecommendedWatcher, FileIdMap>,
}

/// Start watching `roots` (recursively) for changes, coalesced over
/// `debounce` and delivered as [`RawChange`]s on the returned receiver.
///
/// The channel is bounded at a generous depth; a full channel means the
/// pipeline is falling behind; the debouncer's callback logs and drops the
/// batch rather than blocking the watcher thread indefinitely.
pub fn watch(roots: &[AbsDirPath], debounce: Duration, capacity: usize) -> Result<(Watch, mpsc::Receiver<RawChange>)> {
    let (tx, rx) = mpsc::channel(capacity);

    let callback = move |result: DebounceEventResult| match result {
        Ok(events) => {
            for event in events {
                for change in classify(&event) {
                    if tx.blocking_send(change).is_err() {
                        warn!("change pipeline receiver dropped; watcher events are being discarded");
                    }
                }
            }
        }
        Err(errors) => {
            for err in errors {
                warn!(?err, "file watcher reported an error");
            }
        }
    };

    let mut debouncer = notify_debouncer_full::new_debouncer(debounce, None, callback).context("start file watcher")?;
    for root in roots {
        debouncer
            .watcher()
            .watch(root.as_std_path(), RecursiveMode::Recursive)
            .with_context(|| format!("watch {root:?}"))?;
    }

    Ok((Watch { _debouncer: debouncer }, rx))
}

fn classify(event: &notify_debouncer_full::DebouncedEvent) -> Vec<RawChange> {
    use notify_debouncer_full::notify::{EventKind, event::RemoveKind};

    let kind = match event.kind {
        EventKind::Create(_) => RawChangeKind::Added,
        EventKind::Modify(_) => RawChangeKind::Modified,
        EventKind::Remove(RemoveKind::Folder) => RawChangeKind::DirectoryDeleted,
        EventKind::Remove(_) => RawChangeKind::Deleted,
        _ => return vec![],
    };
    event
        .paths
        .iter()
        .map(|path| RawChange { path: path.clone(), kind })
        .collect()
}
