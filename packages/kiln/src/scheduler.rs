//! The job planner and scheduler (C6).
//!
//! Owns the authoritative view of per-source builder matching, fingerprint
//! comparison, and job dispatch. Runs as a single supervisor task that reads
//! [`AnalysisRequest`]s off the change pipeline's output channel and fans
//! job execution out to a bounded worker pool gated by a `tokio::Semaphore`
//! (the same bounded-concurrency shape the teacher's `copy_dir_with_concurrency`
//! uses for bulk file copies) — workers call into builder capability
//! functions and report back an outcome; only the supervisor ever touches
//! the store (§5 "workers never touch the store directly").
//!
//! Per-source exclusivity (§5 "two jobs sharing a SourceKey never run
//! concurrently") is enforced with an `Arc<DashMap<SourceKey,
//! Arc<tokio::sync::Mutex<()>>>>`: dispatching a job locks that source's
//! entry for the duration of the job, so a second job for the same key
//! queues up on the mutex rather than running alongside the first.

use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicUsize, Ordering},
    },
    time::UNIX_EPOCH,
};

use color_eyre::Result;
use dashmap::DashMap;
use kiln_protocol::{
    AssetNotification, AssetNotificationKind, BuilderId, Fingerprint, JobId, JobInfoProjection, JobStatus,
    PlatformId, PlanJobsOutcome, RunJobOutcome, SourceFileNotification, SourceNotificationKind, SourceKey,
};
use tokio::sync::{Mutex, Notify, Semaphore, mpsc};
use tracing::{debug, instrument, warn};

use std::collections::HashMap;

use crate::{
    builder::{BuilderRegistry, PlanJobsRequest, RunJobRequest},
    catalog::Catalog,
    fs,
    path::{AbsDirPath, AbsFilePath, JoinWith as _, RelFilePath, TryJoinWith as _},
    pipeline::{AnalysisReason, AnalysisRequest, DedupSet, InFlightProductSet},
    scan::PathResolver,
    store::{ProductsAnswer, Store},
};

/// Sentinel builder id recorded against a job that never reached builder
/// matching, e.g. a path rejected for exceeding the configured length limit.
const NO_BUILDER: BuilderId = BuilderId(uuid::Uuid::nil());

/// Fixed configuration and shared state the scheduler needs to plan and
/// dispatch jobs. Cheap to clone; every field is already `Arc`-backed or
/// itself cheap.
#[derive(Clone)]
pub struct Scheduler {
    store: Store,
    resolver: Arc<PathResolver>,
    registry: Arc<BuilderRegistry>,
    platforms: Vec<PlatformId>,
    cache_root: AbsDirPath,
    dedup: DedupSet,
    next_job_id: Arc<AtomicI64>,
    concurrency: Arc<Semaphore>,
    exclusive: Arc<DashMap<SourceKey, Arc<Mutex<()>>>>,
    in_flight: Arc<DashMap<JobId, JobInfoProjection>>,
    in_flight_products: InFlightProductSet,
    critical_remaining: Arc<AtomicUsize>,
    critical_done: Arc<Notify>,
    asset_notify: mpsc::Sender<AssetNotification>,
    source_notify: mpsc::Sender<SourceFileNotification>,
    catalogs: Arc<HashMap<PlatformId, Catalog>>,
}

impl Scheduler {
    #[instrument(skip_all)]
    pub async fn new(
        store: Store,
        resolver: PathResolver,
        registry: BuilderRegistry,
        platforms: Vec<PlatformId>,
        cache_root: AbsDirPath,
        dedup: DedupSet,
        in_flight_products: InFlightProductSet,
        asset_notify: mpsc::Sender<AssetNotification>,
        source_notify: mpsc::Sender<SourceFileNotification>,
        catalogs: Arc<HashMap<PlatformId, Catalog>>,
    ) -> Result<Self> {
        let highest = store.highest_job_id().await?;
        Ok(Self {
            store,
            resolver: Arc::new(resolver),
            registry: Arc::new(registry),
            platforms,
            cache_root,
            dedup,
            next_job_id: Arc::new(AtomicI64::new(highest.0 + 1)),
            concurrency: Arc::new(Semaphore::new(num_cpus::get())),
            exclusive: Arc::new(DashMap::new()),
            in_flight: Arc::new(DashMap::new()),
            in_flight_products,
            critical_remaining: Arc::new(AtomicUsize::new(0)),
            critical_done: Arc::new(Notify::new()),
            asset_notify,
            source_notify,
            catalogs,
        })
    }

    fn allocate_job_id(&self) -> JobId {
        JobId(self.next_job_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Clears `request`'s dedup entry now that it's actually been dequeued
    /// for analysis, per §4.4's queueing discipline — only at this point may
    /// a fresh event for the same path be queued again.
    fn dequeue_for_analysis(&self, request: &AnalysisRequest) {
        self.dedup.remove(&request.relpath);
    }

    /// Drains `analysis_rx`, clearing each request's dedup entry (§4.4: the
    /// dedup set is only cleared once a request is dequeued for analysis)
    /// and spawning a bounded worker task per request. Returns once
    /// `analysis_rx` closes.
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, mut analysis_rx: mpsc::Receiver<AnalysisRequest>) {
        while let Some(request) = analysis_rx.recv().await {
            self.dequeue_for_analysis(&request);
            let permit = match Arc::clone(&self.concurrency).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let scheduler = Arc::clone(&self);
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(err) = scheduler.process(request).await {
                    warn!(?err, "failed to process analysis request");
                }
            });
        }
    }

    /// Blocks until every critical job discovered during the initial startup
    /// scan has reached a terminal state (§11 "critical-job startup
    /// gating") — callers (e.g. the idle detector, the RPC surface) should
    /// await this before treating the daemon as ready to serve requests
    /// that depend on critical assets already being built.
    pub async fn wait_for_critical_jobs(&self) {
        loop {
            if self.critical_remaining.load(Ordering::SeqCst) == 0 {
                return;
            }
            self.critical_done.notified().await;
        }
    }

    fn mark_critical_started(&self, critical: bool) {
        if critical {
            self.critical_remaining.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn mark_critical_finished(&self, critical: bool) {
        if critical && self.critical_remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.critical_done.notify_waiters();
        }
    }

    #[instrument(skip(self), fields(relpath = %request.relpath))]
    async fn process(&self, request: AnalysisRequest) -> Result<()> {
        match request.reason {
            AnalysisReason::Removed => self.process_removed(&request.relpath).await,
            AnalysisReason::PathTooLong => self.process_path_too_long(&request.relpath).await,
            AnalysisReason::Changed => self.process_changed(&request.relpath).await,
        }
    }

    async fn process_removed(&self, relpath: &RelFilePath) -> Result<()> {
        let source = relpath.as_str_lossy().into_owned();
        for platform in &self.platforms {
            for job_key in self.store.job_descriptions_for(&source, platform).await? {
                let key = SourceKey::new(source.clone(), platform.clone(), job_key);
                self.retire_source(&key).await?;
            }
        }
        let _ = self
            .source_notify
            .send(SourceFileNotification {
                relpath: source,
                scanfolder: String::new(),
                kind: SourceNotificationKind::FileRemoved,
            })
            .await;
        Ok(())
    }

    async fn process_path_too_long(&self, relpath: &RelFilePath) -> Result<()> {
        let source = relpath.as_str_lossy().into_owned();
        for platform in &self.platforms {
            let key = SourceKey::new(source.clone(), platform.clone(), "default");
            self.store.fail_job(self.allocate_job_id(), &key, NO_BUILDER, JobStatus::FailedPathTooLong).await?;
        }
        warn!(%source, "source path exceeds configured maximum length");
        Ok(())
    }

    async fn process_changed(&self, relpath: &RelFilePath) -> Result<()> {
        let Some(abs) = self.resolver.find_active_source(relpath).await else {
            return self.process_removed(relpath).await;
        };

        let matching = self.registry.matching(relpath);
        if matching.is_empty() {
            return Ok(());
        }

        for builder in matching {
            let outcome = (builder.plan_jobs)(PlanJobsRequest {
                relpath: relpath.clone(),
                abs_path: abs.clone(),
                platforms: self.platforms.clone(),
            })
            .await;

            let descriptors = match outcome {
                PlanJobsOutcome::Success(descriptors) => descriptors,
                PlanJobsOutcome::Failed => {
                    warn!(builder = %builder.registration.name, "plan_jobs failed");
                    continue;
                }
                PlanJobsOutcome::ShuttingDown => return Ok(()),
            };

            self.reconcile_missing_jobs(relpath, &builder.registration.id, &descriptors).await?;

            for descriptor in descriptors {
                let key = SourceKey::new(relpath.as_str_lossy().into_owned(), descriptor.platform.clone(), descriptor.job_key.clone());
                self.maybe_dispatch(
                    relpath,
                    &abs,
                    &key,
                    builder.registration.id,
                    &builder.registration.version,
                    builder.registration.test_for_exclusive_lock,
                    descriptor,
                )
                .await?;
            }
        }

        let _ = self
            .source_notify
            .send(SourceFileNotification {
                relpath: relpath.as_str_lossy().into_owned(),
                scanfolder: String::new(),
                kind: SourceNotificationKind::FileChanged,
            })
            .await;
        Ok(())
    }

    /// Clears any previously recorded job for this (source, builder) pair
    /// whose job key no longer appears in the builder's current plan — the
    /// builder has decided it no longer wants to build that unit.
    async fn reconcile_missing_jobs(&self, relpath: &RelFilePath, builder_id: &BuilderId, descriptors: &[kiln_protocol::JobDescriptor]) -> Result<()> {
        let source = relpath.as_str_lossy().into_owned();
        let recorded = self.store.jobs_for_source(&source).await?;
        for job in recorded {
            if job.builder_id != *builder_id {
                continue;
            }
            let still_planned = descriptors
                .iter()
                .any(|d| d.platform == *job.source.platform() && d.job_key == job.source.job_key());
            if !still_planned {
                self.retire_source(&job.source).await?;
            }
        }
        Ok(())
    }

    /// Computes the new fingerprint and, if it differs from the recorded
    /// one (or the recorded products have gone missing), dispatches the job.
    async fn maybe_dispatch(
        &self,
        relpath: &RelFilePath,
        abs: &AbsFilePath,
        key: &SourceKey,
        builder_id: BuilderId,
        builder_version: &str,
        builder_tests_exclusive_lock: bool,
        descriptor: kiln_protocol::JobDescriptor,
    ) -> Result<()> {
        let probe_exclusive_lock = builder_tests_exclusive_lock || descriptor.check_exclusive_lock;
        if probe_exclusive_lock && !fs::try_exclusive(abs).await.unwrap_or(true) {
            debug!(%key, "source file is exclusively locked by another process, deferring");
            return Ok(());
        }

        let new_fingerprint = compute_fingerprint(abs, builder_version, &descriptor.extra_fingerprint_info).await?;
        let recorded_fingerprint = self.store.get_fingerprint(key).await?;
        let products_intact = matches!(self.store.get_products(key).await?, ProductsAnswer::Known(_));

        if recorded_fingerprint == new_fingerprint && products_intact && !recorded_fingerprint.is_failed() {
            return Ok(());
        }

        let lock = Arc::clone(self.exclusive.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).value());
        let _guard = lock.lock().await;

        self.mark_critical_started(descriptor.critical);
        self.dispatch(relpath, abs, key, builder_id, descriptor, new_fingerprint).await
    }

    #[instrument(skip(self, descriptor))]
    async fn dispatch(
        &self,
        relpath: &RelFilePath,
        abs: &AbsFilePath,
        key: &SourceKey,
        builder_id: BuilderId,
        descriptor: kiln_protocol::JobDescriptor,
        new_fingerprint: Fingerprint,
    ) -> Result<()> {
        let job_id = self.allocate_job_id();
        let critical = descriptor.critical;
        self.in_flight.insert(
            job_id,
            JobInfoProjection {
                job_id,
                source: key.source().to_string(),
                builder_id,
                platform: key.platform().clone(),
                job_key: key.job_key().to_string(),
                status: JobStatus::InProgress,
            },
        );
        self.store.record_job(job_id, key, builder_id, JobStatus::InProgress).await?;

        let output_dir = self.cache_root.try_join_dir(key.platform().as_str())?;
        let Some(builder) = self.registry.get(&builder_id) else {
            self.in_flight.remove(&job_id);
            return Ok(());
        };

        // The job is about to rewrite whatever products it previously built
        // for this key. Mark those paths in flight first so the change
        // pipeline doesn't mistake the job's own delete-then-recreate for an
        // orphaned product (§5).
        let rewritten_products = match self.store.get_products(key).await? {
            ProductsAnswer::Known(products) => self.mark_products_in_flight(key, &products),
            _ => Vec::new(),
        };

        let run_job = builder.run_job.clone();
        let outcome = run_job(RunJobRequest {
            relpath: relpath.clone(),
            abs_path: abs.clone(),
            job: descriptor,
            output_dir,
        })
        .await;

        self.unmark_products_in_flight(&rewritten_products);
        self.in_flight.remove(&job_id);
        self.mark_critical_finished(critical);

        match outcome {
            RunJobOutcome::Success(products) => self.apply_success(job_id, key, builder_id, new_fingerprint, products).await,
            RunJobOutcome::Failed => self.apply_failure(job_id, key, builder_id, JobStatus::Failed).await,
            RunJobOutcome::Crashed => self.apply_failure(job_id, key, builder_id, JobStatus::Failed).await,
            RunJobOutcome::Cancelled => self.apply_failure(job_id, key, builder_id, JobStatus::Cancelled).await,
        }
    }

    /// Writes the fingerprint, product list, and a `Completed` job record in
    /// one transaction, then deletes any product the prior build produced
    /// but the new one didn't (§4.6 "job completion is atomic").
    async fn apply_success(&self, job_id: JobId, key: &SourceKey, builder_id: BuilderId, fingerprint: Fingerprint, products: Vec<String>) -> Result<()> {
        let prior = self.store.get_products(key).await?;
        self.store.complete_job(job_id, key, builder_id, fingerprint, products.clone()).await?;

        if let Some(catalog) = self.catalogs.get(key.platform()) {
            for product in &products {
                let size = match RelFilePath::try_from(product.as_str()) {
                    Ok(rel) => {
                        let path = self.cache_root.try_join_dir(key.platform().as_str())?.join(&rel);
                        fs::Metadata::from_file(&path).await.ok().flatten().map(|meta| meta.len).unwrap_or(0)
                    }
                    Err(_) => 0,
                };
                catalog.record_changed(product, size);
            }
        }

        if let ProductsAnswer::Known(prior_products) = prior {
            for stale in prior_products.into_iter().filter(|p| !products.contains(p)) {
                if let Ok(rel) = RelFilePath::try_from(stale.as_str()) {
                    let path = self.cache_root.try_join_dir(key.platform().as_str())?.join(&rel);
                    if let Err(err) = fs::remove_file(&path).await {
                        warn!(?err, ?path, "failed to remove stale product");
                    }
                }
                if let Some(catalog) = self.catalogs.get(key.platform()) {
                    catalog.record_removed(&stale);
                }
            }
        }

        let _ = self
            .asset_notify
            .send(AssetNotification {
                relpath: key.source().to_string(),
                kind: AssetNotificationKind::AssetChanged,
            })
            .await;
        Ok(())
    }

    async fn apply_failure(&self, job_id: JobId, key: &SourceKey, builder_id: BuilderId, status: JobStatus) -> Result<()> {
        self.store.fail_job(job_id, key, builder_id, status).await?;
        let _ = self
            .asset_notify
            .send(AssetNotification {
                relpath: key.source().to_string(),
                kind: AssetNotificationKind::AssetFailed,
            })
            .await;
        Ok(())
    }

    /// Removes every trace of a source key: fingerprint, products (deleted
    /// from disk too), and job history, then notifies subscribers.
    async fn retire_source(&self, key: &SourceKey) -> Result<()> {
        if let ProductsAnswer::Known(products) = self.store.get_products(key).await? {
            for product in products {
                if let Ok(rel) = RelFilePath::try_from(product.as_str()) {
                    let path = self.cache_root.try_join_dir(key.platform().as_str())?.join(&rel);
                    if let Err(err) = fs::remove_file(&path).await {
                        warn!(?err, ?path, "failed to remove orphaned product");
                    }
                }
                if let Some(catalog) = self.catalogs.get(key.platform()) {
                    catalog.record_removed(&product);
                }
            }
        }
        self.store.clear_fingerprint(key).await?;
        let _ = self
            .asset_notify
            .send(AssetNotification {
                relpath: key.source().to_string(),
                kind: AssetNotificationKind::AssetRemoved,
            })
            .await;
        Ok(())
    }

    /// Marks each of `key`'s current product paths as in flight for the
    /// duration of a dispatch, returning the absolute paths actually
    /// inserted so the caller can remove exactly those once the job
    /// resolves (not whatever happens to be recorded by then).
    fn mark_products_in_flight(&self, key: &SourceKey, products: &[String]) -> Vec<AbsFilePath> {
        let mut marked = Vec::with_capacity(products.len());
        let Ok(platform_dir) = self.cache_root.try_join_dir(key.platform().as_str()) else {
            return marked;
        };
        for product in products {
            let Ok(rel) = RelFilePath::try_from(product.as_str()) else { continue };
            let path = platform_dir.join(&rel);
            self.in_flight_products.insert(path.clone());
            marked.push(path);
        }
        marked
    }

    fn unmark_products_in_flight(&self, paths: &[AbsFilePath]) {
        for path in paths {
            self.in_flight_products.remove(path);
        }
    }

    /// A snapshot of currently in-flight jobs, for the RPC surface's
    /// job-info projection (merged with store history by the caller).
    pub fn in_flight_jobs(&self) -> Vec<JobInfoProjection> {
        self.in_flight.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

/// Computes the fingerprint for a build unit: the CRC-32 of the source
/// file's bytes, folded together with its size, truncated mtime, executable
/// bit, the builder's version string, and any builder-supplied extra
/// fingerprint info — so a fingerprint changes if the file content changes,
/// if the file's metadata changes in a way that matters, or if the builder
/// itself changed in a way it wants reflected (§4.6 "what participates in a
/// fingerprint").
async fn compute_fingerprint(abs: &AbsFilePath, builder_version: &str, extra_fingerprint_info: &[u8]) -> Result<Fingerprint> {
    let content = fs::hash_file(abs).await?;
    let executable = fs::is_executable(abs).await;
    let metadata = std::fs::metadata(abs.as_std_path())?;
    let mtime_secs = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    Ok(fold_fingerprint(content, metadata.len(), mtime_secs, executable, builder_version, extra_fingerprint_info))
}

/// Combines the file's content fingerprint with the metadata and builder
/// identity that also participate in "did this build unit change", per
/// §4.6's fingerprint composition (content + size + mtime + executable bit
/// + builder version + builder-supplied extra info).
fn fold_fingerprint(content: Fingerprint, size: u64, mtime_secs: u64, executable: bool, builder_version: &str, extra: &[u8]) -> Fingerprint {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&u32::from(content).to_le_bytes());
    hasher.update(&size.to_le_bytes());
    hasher.update(&mtime_secs.to_le_bytes());
    hasher.update(&[executable as u8]);
    hasher.update(builder_version.as_bytes());
    hasher.update(extra);
    Fingerprint::from(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn fingerprint_changes_when_builder_version_changes() {
        let content = Fingerprint::Value(42);
        let a = fold_fingerprint(content, 5, 0, false, "v1", &[]);
        let b = fold_fingerprint(content, 5, 0, false, "v2", &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_changes_when_extra_info_changes() {
        let content = Fingerprint::Value(42);
        let a = fold_fingerprint(content, 5, 0, false, "v1", &[1, 2, 3]);
        let b = fold_fingerprint(content, 5, 0, false, "v1", &[4, 5, 6]);
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_stable_for_unchanged_input() {
        let content = Fingerprint::Value(42);
        let a = fold_fingerprint(content, 5, 0, false, "v1", &[]);
        let b = fold_fingerprint(content, 5, 0, false, "v1", &[]);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn critical_gating_resolves_once_counter_drains() {
        let store = Store::in_memory().await.unwrap();
        let resolver = PathResolver::new(vec![], vec![], vec![]);
        let (asset_tx, _asset_rx) = mpsc::channel(8);
        let (source_tx, _source_rx) = mpsc::channel(8);
        let scheduler = Scheduler::new(
            store,
            resolver,
            BuilderRegistry::new(),
            vec![PlatformId::new("pc")],
            AbsDirPath::try_from(tempdir().unwrap().keep()).unwrap(),
            DedupSet::default(),
            InFlightProductSet::default(),
            asset_tx,
            source_tx,
            Arc::new(HashMap::new()),
        )
        .await
        .unwrap();

        scheduler.mark_critical_started(true);
        let waited = tokio::time::timeout(std::time::Duration::from_millis(50), scheduler.wait_for_critical_jobs()).await;
        assert!(waited.is_err(), "should still be waiting on the critical job");

        scheduler.mark_critical_finished(true);
        tokio::time::timeout(std::time::Duration::from_secs(1), scheduler.wait_for_critical_jobs())
            .await
            .expect("critical gate should resolve once the counter drains");
    }
}
