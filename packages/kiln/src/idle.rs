//! The idle detector (C9).
//!
//! Extends the teacher's wall-clock [`crate::daemon::IdleState`] with the
//! actual quiescence definition this daemon needs (§4.9): idle means the
//! active-file queue, the to-examine queue, and the scheduler's in-flight
//! set are all empty. Every transition into that state broadcasts over a
//! `tokio::sync::watch` channel (rather than only resetting a timer), and
//! the first such transition after startup triggers a one-time store
//! compaction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use crate::store::Store;

/// How the idle detector reads the depth of each of the three queues §4.9
/// requires to be empty. Callers wire these up from whatever they actually
/// hold: a bounded channel's `max_capacity() - capacity()`, a dedup set's
/// `len()`, an in-flight map's `len()`. Kept as plain closures rather than
/// references to the concrete types so this module doesn't need to depend
/// on `pipeline`/`scheduler` internals.
pub struct IdleProbes {
    pub active_queue_len: Box<dyn Fn() -> usize + Send + Sync>,
    pub to_examine_len: Box<dyn Fn() -> usize + Send + Sync>,
    pub in_flight_len: Box<dyn Fn() -> usize + Send + Sync>,
}

impl IdleProbes {
    fn is_idle(&self) -> bool {
        (self.active_queue_len)() == 0 && (self.to_examine_len)() == 0 && (self.in_flight_len)() == 0
    }
}

impl std::fmt::Debug for IdleProbes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleProbes").finish_non_exhaustive()
    }
}

/// Polls [`IdleProbes`] on a fixed cadence and reacts to transitions into
/// the idle state.
#[derive(Debug)]
pub struct IdleDetector {
    probes: IdleProbes,
    store: Store,
    compacted_once: AtomicBool,
    on_idle: watch::Sender<u64>,
}

impl IdleDetector {
    pub fn new(probes: IdleProbes, store: Store) -> Self {
        let (on_idle, _) = watch::channel(0);
        Self {
            probes,
            store,
            compacted_once: AtomicBool::new(false),
            on_idle,
        }
    }

    /// Subscribe to idle transitions. The counter increments once per
    /// transition into idle; the RPC `asset exists` handler uses this to
    /// know when to re-check files it previously reported missing.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.on_idle.subscribe()
    }

    /// Whether the core is idle right now, per §4.9's definition.
    pub fn is_idle(&self) -> bool {
        self.probes.is_idle()
    }

    /// Polls at `poll_interval` until cancelled, compacting the store once
    /// on the first idle transition and broadcasting every transition.
    #[instrument(skip_all)]
    pub async fn run(&self, poll_interval: Duration) {
        let mut was_idle = false;
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            ticker.tick().await;
            let idle_now = self.probes.is_idle();
            if idle_now && !was_idle {
                self.on_transition_to_idle().await;
            }
            was_idle = idle_now;
        }
    }

    async fn on_transition_to_idle(&self) {
        debug!("core transitioned to idle");
        if !self.compacted_once.swap(true, Ordering::SeqCst) {
            if let Err(err) = self.store.compact().await {
                warn!(?err, "startup compaction failed");
            }
        }
        self.on_idle.send_modify(|count| *count += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn probes_with(flag: Arc<AtomicUsize>) -> IdleProbes {
        let read = Arc::clone(&flag);
        IdleProbes {
            active_queue_len: Box::new(move || read.load(Ordering::SeqCst)),
            to_examine_len: Box::new(|| 0),
            in_flight_len: Box::new(|| 0),
        }
    }

    #[tokio::test]
    async fn transition_to_idle_compacts_store_once() {
        let store = Store::in_memory().await.unwrap();
        let depth = Arc::new(AtomicUsize::new(1));
        let detector = IdleDetector::new(probes_with(Arc::clone(&depth)), store);
        assert!(!detector.is_idle());

        depth.store(0, Ordering::SeqCst);
        assert!(detector.is_idle());

        let mut rx = detector.subscribe();
        detector.on_transition_to_idle().await;
        assert_eq!(*rx.borrow_and_update(), 1);
        assert!(detector.compacted_once.load(Ordering::SeqCst));

        // A second transition broadcasts again but does not recompact
        // (nothing observable to assert on recompaction directly, but the
        // flag should remain set and the counter should advance).
        detector.on_transition_to_idle().await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 2);
    }

    #[tokio::test]
    async fn run_broadcasts_on_idle_transition() {
        let store = Store::in_memory().await.unwrap();
        let depth = Arc::new(AtomicUsize::new(0));
        let detector = Arc::new(IdleDetector::new(probes_with(Arc::clone(&depth)), store));
        let mut rx = detector.subscribe();

        let detector2 = Arc::clone(&detector);
        let handle = tokio::spawn(async move { detector2.run(Duration::from_millis(5)).await });

        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .expect("idle transition should be observed")
            .unwrap();
        assert_eq!(*rx.borrow(), 1);

        handle.abort();
    }
}
