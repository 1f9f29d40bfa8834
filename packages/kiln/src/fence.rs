//! The fence coordinator (C3).
//!
//! Guarantees that a "what is the current state?" RPC request observes
//! every filesystem event generated before it was enqueued. A caller
//! allocates a fence id, drops a sentinel file into a dedicated directory
//! inside the watched tree, then parks until the change pipeline (`pipeline`)
//! reports having seen that sentinel disappear. Grounded on the same
//! atomic-file-then-park idiom `fs::LockFile` uses elsewhere in this crate,
//! generalized to a `DashMap` of parked one-shot channels (the teacher
//! already depends on `dashmap` for its job-exclusivity map).

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use color_eyre::Result;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{instrument, warn};

use crate::{
    fs,
    path::{AbsDirPath, AbsFilePath, JoinWith as _, RelFilePath},
};

/// How many times a fence round trip retries sentinel creation/deletion
/// before giving up and releasing the caller degraded.
const MAX_RETRIES: u32 = 5;

/// How long a parked fence waits for the change pipeline to report the
/// sentinel's deletion before degrading on its own. Guards against a fence
/// directory nobody is watching (or a watcher that died) parking a caller
/// forever — a live daemon's own watcher normally satisfies a fence within
/// milliseconds, so this only ever bites in practice when something upstream
/// is already broken.
const FENCE_TIMEOUT: Duration = Duration::from_secs(5);

/// The file extension sentinel files use, so the change pipeline can
/// recognize and filter them out of ordinary source/product classification.
pub const FENCE_EXTENSION: &str = "kilnfence";

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct FenceId(pub u64);

/// What a parked request learns when its fence resolves.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FenceOutcome {
    /// The sentinel round trip was observed; state is caught up.
    Satisfied,
    /// Retries were exhausted; the caller must still be serviced, but
    /// observed state may be stale.
    DegradedTimedOut,
}

/// Coordinates fence round trips against a single dedicated directory.
#[derive(Debug)]
pub struct FenceCoordinator {
    dir: AbsDirPath,
    next_id: AtomicU64,
    parked: DashMap<FenceId, oneshot::Sender<FenceOutcome>>,
}

impl FenceCoordinator {
    pub fn new(dir: AbsDirPath) -> Self {
        Self {
            dir,
            next_id: AtomicU64::new(0),
            parked: DashMap::new(),
        }
    }

    pub fn dir(&self) -> &AbsDirPath {
        &self.dir
    }

    /// Name a sentinel file would carry for `id`: `fenceFile~<id>.kilnfence`.
    fn sentinel_name(id: FenceId) -> String {
        format!("fenceFile~{}.{FENCE_EXTENSION}", id.0)
    }

    /// Parse a fence id back out of a sentinel file's name, if it is one.
    pub fn parse_sentinel_name(name: &str) -> Option<FenceId> {
        let rest = name.strip_prefix("fenceFile~")?;
        let digits = rest.strip_suffix(&format!(".{FENCE_EXTENSION}"))?;
        digits.parse().ok().map(FenceId)
    }

    /// Run a full fence round trip: allocate an id, create then delete the
    /// sentinel (retrying up to [`MAX_RETRIES`] times on I/O failure), park
    /// a receiver for it, and return both so the caller can await
    /// resolution once the change pipeline reports the deletion observed.
    ///
    /// If nothing reports the deletion within [`FENCE_TIMEOUT`] — no watcher
    /// covers the fence directory, or it fell behind — the fence degrades
    /// itself rather than parking the caller forever.
    #[instrument(skip(self))]
    pub async fn begin(self: &Arc<Self>) -> (FenceId, oneshot::Receiver<FenceOutcome>) {
        let id = FenceId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        self.parked.insert(id, tx);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.round_trip_once(id).await {
                Ok(()) => break,
                Err(err) if attempt >= MAX_RETRIES => {
                    warn!(?err, fence_id = id.0, attempts = attempt, "fence round trip exhausted retries");
                    self.resolve(id, FenceOutcome::DegradedTimedOut);
                    return (id, rx);
                }
                Err(err) => {
                    warn!(?err, fence_id = id.0, attempt, "fence round trip failed, retrying");
                }
            }
        }

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(FENCE_TIMEOUT).await;
            coordinator.resolve(id, FenceOutcome::DegradedTimedOut);
        });

        (id, rx)
    }

    async fn round_trip_once(&self, id: FenceId) -> Result<()> {
        let name = RelFilePath::try_from(Self::sentinel_name(id))?;
        let path: AbsFilePath = self.dir.join(&name);
        fs::create_file(&path).await?;
        fs::remove_file(&path).await?;
        Ok(())
    }

    /// Called by the change pipeline once it observes a sentinel file's
    /// deletion — releases the parked request, if still parked.
    #[instrument(skip(self))]
    pub fn on_sentinel_deleted(&self, id: FenceId) {
        self.resolve(id, FenceOutcome::Satisfied);
    }

    fn resolve(&self, id: FenceId, outcome: FenceOutcome) {
        if let Some((_, tx)) = self.parked.remove(&id) {
            let _ = tx.send(outcome);
        }
    }

    /// Whether a path sits inside this fence directory — the change
    /// pipeline uses this to route events to [`Self::on_sentinel_deleted`]
    /// instead of ordinary classification.
    pub fn owns(&self, path: &AbsFilePath) -> bool {
        path.as_str_lossy().starts_with(self.dir.as_str_lossy().as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn sentinel_name_round_trips() {
        let id = FenceId(42);
        let name = FenceCoordinator::sentinel_name(id);
        assert_eq!(name, "fenceFile~42.kilnfence");
        assert_eq!(FenceCoordinator::parse_sentinel_name(&name), Some(id));
    }

    #[test]
    fn parse_sentinel_name_rejects_unrelated_files() {
        assert_eq!(FenceCoordinator::parse_sentinel_name("foo.txt"), None);
        assert_eq!(FenceCoordinator::parse_sentinel_name("fenceFile~notanumber.kilnfence"), None);
    }

    #[tokio::test]
    async fn begin_creates_and_removes_sentinel() {
        let dir = tempdir().unwrap();
        let coordinator = Arc::new(FenceCoordinator::new(AbsDirPath::try_from(dir.path().to_path_buf()).unwrap()));
        let (id, rx) = coordinator.begin().await;
        coordinator.on_sentinel_deleted(id);
        let outcome = rx.await.unwrap();
        assert_eq!(outcome, FenceOutcome::Satisfied);

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none(), "sentinel should not remain on disk");
    }

    #[tokio::test]
    async fn owns_checks_directory_membership() {
        let dir = tempdir().unwrap();
        let coordinator = FenceCoordinator::new(AbsDirPath::try_from(dir.path().to_path_buf()).unwrap());
        let inside = AbsFilePath::try_from(dir.path().join("fenceFile~1.kilnfence")).unwrap();
        let outside = AbsFilePath::try_from("/somewhere/else.txt").unwrap();
        assert!(coordinator.owns(&inside));
        assert!(!coordinator.owns(&outside));
    }
}
