//! Self-monitoring for restart triggers (§6 "Restart triggers").
//!
//! The daemon watches its own executable, any configured builder modules,
//! and its configuration file. When one of them changes and then quiesces
//! (no further modification for a grace period), the daemon requests a
//! clean restart so a supervising wrapper can relaunch it with the new
//! binary/config in place. Reuses the change pipeline's watcher
//! infrastructure (`crate::watch`) pointed at a second, non-source watch
//! root rather than building a second notify integration from scratch.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration,
};

use color_eyre::{Result, eyre::eyre};
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use crate::{
    path::{AbsDirPath, AbsFilePath},
    watch::{self, RawChange, Watch},
};

/// Exit code on a clean, requested shutdown.
pub const EXIT_CLEAN: i32 = 0;
/// Exit code when the daemon fails to initialize before entering its main
/// loop (e.g. the store could not be opened).
pub const EXIT_INIT_FAILURE: i32 = 1;
/// Exit code signalling a supervising wrapper should relaunch the daemon:
/// the executable, a builder module, or the configuration file changed and
/// quiesced.
pub const EXIT_RESTART_REQUESTED: i32 = 3;

/// How long a watched file must go unmodified before a restart is
/// requested, once a change is first observed.
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Watches a fixed set of files (not the source tree) for changes that
/// should trigger a daemon restart.
pub struct RestartMonitor {
    _watch: Watch,
    rx: mpsc::Receiver<RawChange>,
    watched_files: HashSet<PathBuf>,
    grace_period: Duration,
}

impl RestartMonitor {
    /// Watches `files` for changes. Each file's parent directory is
    /// recursively watched (the underlying watcher only supports directory
    /// roots); `files` not under a common parent are each given their own
    /// watch root.
    pub fn new(files: Vec<AbsFilePath>) -> Result<Self> {
        Self::with_grace_period(files, DEFAULT_GRACE_PERIOD)
    }

    pub fn with_grace_period(files: Vec<AbsFilePath>, grace_period: Duration) -> Result<Self> {
        let watched_files: HashSet<PathBuf> = files.iter().map(|f| f.as_std_path().to_path_buf()).collect();

        let mut roots: Vec<AbsDirPath> = Vec::new();
        for file in &files {
            let Some(parent) = file.parent() else { continue };
            if !roots.iter().any(|root| root.as_std_path() == parent.as_std_path()) {
                roots.push(parent);
            }
        }

        let (watch, rx) = watch::watch(&roots, Duration::from_millis(200), 64)?;
        Ok(Self {
            _watch: watch,
            rx,
            watched_files,
            grace_period,
        })
    }

    /// Blocks until one of the monitored files changes and then quiesces
    /// for the configured grace period, at which point a restart should be
    /// requested. Returns an error if the underlying watch channel closes
    /// first (the watcher was dropped — not expected in normal operation).
    #[instrument(skip(self))]
    pub async fn wait_for_restart_request(mut self) -> Result<()> {
        loop {
            let change = self.rx.recv().await.ok_or_else(|| eyre!("restart watch channel closed"))?;
            if !self.is_watched(&change.path) {
                continue;
            }
            debug!(path = ?change.path, "watched file changed, waiting for quiescence");
            self.wait_for_quiescence().await;
            return Ok(());
        }
    }

    fn is_watched(&self, path: &Path) -> bool {
        self.watched_files.contains(path)
    }

    async fn wait_for_quiescence(&mut self) {
        loop {
            match tokio::time::timeout(self.grace_period, self.rx.recv()).await {
                Ok(Some(change)) if self.is_watched(&change.path) => continue,
                Ok(Some(_)) => continue,
                Ok(None) => return,
                Err(_) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[tokio::test]
    async fn unrelated_changes_are_ignored() {
        let dir = tempdir().unwrap();
        let watched = dir.path().join("kiln.toml");
        tokio::fs::write(&watched, b"a").await.unwrap();
        let monitor = RestartMonitor::with_grace_period(
            vec![AbsFilePath::try_from(watched.clone()).unwrap()],
            Duration::from_millis(100),
        )
        .unwrap();

        tokio::fs::write(dir.path().join("other.txt"), b"hi").await.unwrap();

        let result = tokio::time::timeout(Duration::from_millis(500), monitor.wait_for_restart_request()).await;
        assert!(result.is_err(), "unrelated file changes should not trigger a restart request");
    }

    #[tokio::test]
    async fn watched_file_change_triggers_after_quiescence() {
        let dir = tempdir().unwrap();
        let watched = dir.path().join("kiln.toml");
        tokio::fs::write(&watched, b"a").await.unwrap();
        let monitor = RestartMonitor::with_grace_period(
            vec![AbsFilePath::try_from(watched.clone()).unwrap()],
            Duration::from_millis(100),
        )
        .unwrap();

        tokio::fs::write(&watched, b"b").await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), monitor.wait_for_restart_request()).await;
        assert!(result.is_ok(), "watched file change should eventually trigger a restart request");
        assert!(result.unwrap().is_ok());
    }

    #[test]
    fn exit_codes_are_distinct() {
        assert_ne!(EXIT_CLEAN, EXIT_INIT_FAILURE);
        assert_ne!(EXIT_CLEAN, EXIT_RESTART_REQUESTED);
        assert_ne!(EXIT_INIT_FAILURE, EXIT_RESTART_REQUESTED);
    }
}
