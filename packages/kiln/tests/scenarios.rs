//! End-to-end scenarios exercising the scheduler (and, where a scenario
//! needs it, the change pipeline and RPC surface) against a real SQLite
//! store and real temp-directory filesystem state, rather than through any
//! single module's unit tests in isolation.

use std::{collections::HashMap, sync::Arc, time::Duration};

use kiln::{
    builder::{BuilderRegistry, PlanJobsFn, PlanJobsRequest, RunJobFn, RunJobRequest},
    fence::FenceCoordinator,
    path::{AbsDirPath, RelFilePath, TryJoinWith as _},
    pipeline::{AnalysisReason, AnalysisRequest, DedupSet, InFlightProductSet, PipelineConfig},
    rpc::{Rpc, RpcIdentity},
    scan::{PathResolver, ScanFolder},
    scheduler::Scheduler,
    store::{ProductsAnswer, Store},
    watch::{RawChange, RawChangeKind},
};
use kiln_protocol::{
    AssetNotification, BuilderId, BuilderRegistration, JobDescriptor, JobId, JobInfoRequest,
    JobStatus, PatternKind, PlanJobsOutcome, PlatformId, RunJobOutcome, SourceFileNotification, SourceKey,
};
use pretty_assertions::assert_eq;
use tempfile::tempdir;
use tokio::sync::mpsc;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn next_notification(rx: &mut mpsc::Receiver<AssetNotification>) -> AssetNotification {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for asset notification")
        .expect("asset notification channel closed")
}

fn registration(name: &str, pattern: &str) -> BuilderRegistration {
    BuilderRegistration {
        id: BuilderId::new(),
        name: name.to_string(),
        patterns: vec![(pattern.to_string(), PatternKind::Glob)],
        version: "1".to_string(),
        priority: 0,
        critical: false,
        test_for_exclusive_lock: false,
    }
}

/// A builder that plans one job per requested platform and, on run, reports
/// success with a single platform-tagged product — no files touch disk.
fn echo_builder() -> (PlanJobsFn, RunJobFn) {
    let plan: PlanJobsFn = Arc::new(|req: PlanJobsRequest| {
        Box::pin(async move {
            let descriptors = req
                .platforms
                .iter()
                .map(|platform| JobDescriptor {
                    platform: platform.clone(),
                    job_key: "default".to_string(),
                    priority: 0,
                    critical: false,
                    check_exclusive_lock: false,
                    extra_fingerprint_info: vec![],
                    params: serde_json::Value::Null,
                })
                .collect();
            PlanJobsOutcome::Success(descriptors)
        })
    });
    let run: RunJobFn = Arc::new(|req: RunJobRequest| {
        Box::pin(async move { RunJobOutcome::Success(vec![format!("{}.product", req.job.platform.as_str())]) })
    });
    (plan, run)
}

async fn new_scheduler(
    store: Store,
    resolver: PathResolver,
    registry: BuilderRegistry,
    platforms: Vec<PlatformId>,
    cache_root: AbsDirPath,
    dedup: DedupSet,
    in_flight_products: InFlightProductSet,
) -> (
    Scheduler,
    mpsc::Sender<AssetNotification>,
    mpsc::Receiver<AssetNotification>,
    mpsc::Receiver<SourceFileNotification>,
) {
    let (asset_tx, asset_rx) = mpsc::channel(32);
    let (source_tx, source_rx) = mpsc::channel(32);
    let scheduler = Scheduler::new(
        store,
        resolver,
        registry,
        platforms,
        cache_root,
        dedup,
        in_flight_products,
        asset_tx.clone(),
        source_tx,
        Arc::new(HashMap::new()),
    )
    .await
    .unwrap();
    (scheduler, asset_tx, asset_rx, source_rx)
}

fn abs_dir(path: &std::path::Path) -> AbsDirPath {
    AbsDirPath::try_from(path.to_path_buf()).unwrap()
}

// Scenario 1: a fresh file under a scan folder, with a builder that targets
// every configured platform, dispatches and completes one job per platform.
#[tokio::test]
async fn fresh_file_dispatches_one_job_per_configured_platform() {
    let scan_dir = tempdir().unwrap();
    tokio::fs::write(scan_dir.path().join("foo.txt"), b"hello").await.unwrap();

    let store = Store::in_memory().await.unwrap();
    let resolver = PathResolver::new(vec![ScanFolder::new(abs_dir(scan_dir.path()), None, true, 0)], vec![], vec![]);
    let mut registry = BuilderRegistry::new();
    let (plan, run) = echo_builder();
    registry.register(registration("echo", "*.txt"), plan, run).unwrap();

    let platforms = vec![PlatformId::new("pc"), PlatformId::new("es3")];
    let dedup = DedupSet::default();
    let cache_root = abs_dir(&tempdir().unwrap().keep());
    let in_flight_products = InFlightProductSet::default();
    let (scheduler, _asset_tx, mut asset_rx, _source_rx) = new_scheduler(store.clone(), resolver, registry, platforms, cache_root, dedup, in_flight_products).await;

    let (analysis_tx, analysis_rx) = mpsc::channel(8);
    let handle = Arc::new(scheduler);
    tokio::spawn(Arc::clone(&handle).run(analysis_rx));

    analysis_tx
        .send(AnalysisRequest {
            relpath: RelFilePath::try_from("foo.txt").unwrap(),
            reason: AnalysisReason::Changed,
        })
        .await
        .unwrap();

    next_notification(&mut asset_rx).await;
    next_notification(&mut asset_rx).await;

    let jobs = store.jobs_for_source("foo.txt").await.unwrap();
    assert_eq!(jobs.len(), 2, "expected one completed job per configured platform");
    assert!(jobs.iter().all(|job| job.status == JobStatus::Completed));
    let mut platforms: Vec<&str> = jobs.iter().map(|job| job.source.platform().as_str()).collect();
    platforms.sort_unstable();
    assert_eq!(platforms, vec!["es3", "pc"]);
}

// Scenario 2: a higher-precedence scan folder's file shadows a lower one;
// once the override is deleted, the lower-precedence file is revealed and
// reprocessed, producing a different fingerprint.
#[tokio::test]
async fn override_reveal_rebuilds_with_a_different_fingerprint() {
    let high = tempdir().unwrap();
    let low = tempdir().unwrap();
    tokio::fs::write(high.path().join("foo.txt"), b"override content").await.unwrap();
    tokio::fs::write(low.path().join("foo.txt"), b"base content, much longer than the override").await.unwrap();

    let store = Store::in_memory().await.unwrap();
    let resolver = PathResolver::new(
        vec![
            ScanFolder::new(abs_dir(high.path()), None, true, -2),
            ScanFolder::new(abs_dir(low.path()), None, true, -1),
        ],
        vec![],
        vec![],
    );
    let mut registry = BuilderRegistry::new();
    let (plan, run) = echo_builder();
    registry.register(registration("echo", "*.txt"), plan, run).unwrap();

    let dedup = DedupSet::default();
    let cache_root = abs_dir(&tempdir().unwrap().keep());
    let (scheduler, _asset_tx, mut asset_rx, _source_rx) =
        new_scheduler(store.clone(), resolver, registry, vec![PlatformId::new("pc")], cache_root, dedup, InFlightProductSet::default()).await;

    let (analysis_tx, analysis_rx) = mpsc::channel(8);
    let handle = Arc::new(scheduler);
    tokio::spawn(Arc::clone(&handle).run(analysis_rx));

    let relpath = RelFilePath::try_from("foo.txt").unwrap();
    analysis_tx
        .send(AnalysisRequest { relpath: relpath.clone(), reason: AnalysisReason::Changed })
        .await
        .unwrap();
    next_notification(&mut asset_rx).await;

    let key = SourceKey::new("foo.txt", PlatformId::new("pc"), "default");
    let first_fingerprint = store.get_fingerprint(&key).await.unwrap();

    tokio::fs::remove_file(high.path().join("foo.txt")).await.unwrap();
    analysis_tx
        .send(AnalysisRequest { relpath, reason: AnalysisReason::Changed })
        .await
        .unwrap();
    next_notification(&mut asset_rx).await;

    let second_fingerprint = store.get_fingerprint(&key).await.unwrap();
    assert_ne!(first_fingerprint, second_fingerprint, "revealing the lower-precedence file should change the fingerprint");
}

// Scenario 3: a product deleted out from under a still-existing source is
// detected by the change pipeline, which fails the fingerprint and
// re-enqueues the source; the scheduler then rebuilds it successfully.
#[tokio::test]
async fn product_loss_forces_a_rebuild_through_a_failed_sentinel() {
    let scan_dir = tempdir().unwrap();
    tokio::fs::write(scan_dir.path().join("foo.txt"), b"hello").await.unwrap();
    let cache_root = abs_dir(&tempdir().unwrap().keep());

    let store = Store::in_memory().await.unwrap();
    let resolver = PathResolver::new(vec![ScanFolder::new(abs_dir(scan_dir.path()), None, true, 0)], vec![], vec![]);

    let mut registry = BuilderRegistry::new();
    let plan: PlanJobsFn = Arc::new(|req: PlanJobsRequest| {
        Box::pin(async move {
            PlanJobsOutcome::Success(vec![JobDescriptor {
                platform: req.platforms[0].clone(),
                job_key: "default".to_string(),
                priority: 0,
                critical: false,
                check_exclusive_lock: false,
                extra_fingerprint_info: vec![],
                params: serde_json::Value::Null,
            }])
        })
    });
    let run: RunJobFn = Arc::new(|req: RunJobRequest| {
        Box::pin(async move {
            let product = req.output_dir.try_join_file("foo.arc1").unwrap();
            tokio::fs::create_dir_all(req.output_dir.as_std_path()).await.unwrap();
            tokio::fs::write(product.as_std_path(), b"built").await.unwrap();
            RunJobOutcome::Success(vec!["foo.arc1".to_string()])
        })
    });
    registry.register(registration("echo", "*.txt"), plan, run).unwrap();

    let dedup = DedupSet::default();
    let in_flight_products = InFlightProductSet::default();
    let (scheduler, asset_tx, mut asset_rx, _source_rx) = new_scheduler(
        store.clone(),
        resolver.clone(),
        registry,
        vec![PlatformId::new("pc")],
        cache_root.clone(),
        dedup.clone(),
        Arc::clone(&in_flight_products),
    )
    .await;

    let (analysis_tx, analysis_rx) = mpsc::channel(8);
    let handle = Arc::new(scheduler);
    tokio::spawn(Arc::clone(&handle).run(analysis_rx));

    let relpath = RelFilePath::try_from("foo.txt").unwrap();
    analysis_tx
        .send(AnalysisRequest { relpath: relpath.clone(), reason: AnalysisReason::Changed })
        .await
        .unwrap();
    next_notification(&mut asset_rx).await;

    let key = SourceKey::new("foo.txt", PlatformId::new("pc"), "default");
    assert!(matches!(store.get_products(&key).await.unwrap(), ProductsAnswer::Known(products) if products == vec!["foo.arc1".to_string()]));

    let product_path = cache_root.try_join_dir("pc").unwrap().try_join_file("foo.arc1").unwrap();
    tokio::fs::remove_file(product_path.as_std_path()).await.unwrap();

    let fence = Arc::new(FenceCoordinator::new(abs_dir(&tempdir().unwrap().keep())));
    let pipeline_config = PipelineConfig {
        resolver,
        store: store.clone(),
        fence,
        cache_root,
        platforms: vec![PlatformId::new("pc")],
        max_path_len: 260,
        in_flight_products,
        asset_notify: asset_tx,
    };
    let (raw_tx, raw_rx) = mpsc::channel(8);
    tokio::spawn(kiln::pipeline::run(pipeline_config, dedup, raw_rx, analysis_tx));

    raw_tx
        .send(RawChange { path: product_path.as_std_path().to_path_buf(), kind: RawChangeKind::Deleted })
        .await
        .unwrap();

    // The pipeline notices the orphaned product before the scheduler ever
    // rebuilds it, and emits a removal notification for it first.
    let removed = next_notification(&mut asset_rx).await;
    assert_eq!(removed.relpath, "foo.arc1");
    assert_eq!(removed.kind, kiln_protocol::AssetNotificationKind::AssetRemoved);

    next_notification(&mut asset_rx).await;

    let products = store.get_products(&key).await.unwrap();
    assert!(matches!(products, ProductsAnswer::Known(p) if p == vec!["foo.arc1".to_string()]));
    let jobs = store.jobs_for_source("foo.txt").await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Completed);
}

// Scenario 4: a source that previously produced two products now produces
// only one; the stale product is removed from both the store and disk.
#[tokio::test]
async fn fewer_products_on_rebuild_removes_the_stale_product() {
    let scan_dir = tempdir().unwrap();
    let source_path = scan_dir.path().join("foo.txt");
    tokio::fs::write(&source_path, b"version one").await.unwrap();
    let cache_root = abs_dir(&tempdir().unwrap().keep());

    let store = Store::in_memory().await.unwrap();
    let resolver = PathResolver::new(vec![ScanFolder::new(abs_dir(scan_dir.path()), None, true, 0)], vec![], vec![]);

    let call_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let mut registry = BuilderRegistry::new();
    let plan: PlanJobsFn = Arc::new(|req: PlanJobsRequest| {
        Box::pin(async move {
            PlanJobsOutcome::Success(vec![JobDescriptor {
                platform: req.platforms[0].clone(),
                job_key: "default".to_string(),
                priority: 0,
                critical: false,
                check_exclusive_lock: false,
                extra_fingerprint_info: vec![],
                params: serde_json::Value::Null,
            }])
        })
    });
    let run: RunJobFn = {
        let call_count = Arc::clone(&call_count);
        Arc::new(move |req: RunJobRequest| {
            let call_count = Arc::clone(&call_count);
            Box::pin(async move {
                tokio::fs::create_dir_all(req.output_dir.as_std_path()).await.unwrap();
                let attempt = call_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let products = if attempt == 0 {
                    tokio::fs::write(req.output_dir.try_join_file("a.out").unwrap().as_std_path(), b"a").await.unwrap();
                    tokio::fs::write(req.output_dir.try_join_file("b.out").unwrap().as_std_path(), b"b").await.unwrap();
                    vec!["a.out".to_string(), "b.out".to_string()]
                } else {
                    tokio::fs::write(req.output_dir.try_join_file("a.out").unwrap().as_std_path(), b"a2").await.unwrap();
                    vec!["a.out".to_string()]
                };
                RunJobOutcome::Success(products)
            })
        })
    };
    registry.register(registration("echo", "*.txt"), plan, run).unwrap();

    let dedup = DedupSet::default();
    let (scheduler, _asset_tx, mut asset_rx, _source_rx) = new_scheduler(
        store.clone(),
        resolver,
        registry,
        vec![PlatformId::new("pc")],
        cache_root.clone(),
        dedup,
        InFlightProductSet::default(),
    )
    .await;

    let (analysis_tx, analysis_rx) = mpsc::channel(8);
    let handle = Arc::new(scheduler);
    tokio::spawn(Arc::clone(&handle).run(analysis_rx));

    let relpath = RelFilePath::try_from("foo.txt").unwrap();
    analysis_tx
        .send(AnalysisRequest { relpath: relpath.clone(), reason: AnalysisReason::Changed })
        .await
        .unwrap();
    next_notification(&mut asset_rx).await;

    let platform_root = cache_root.try_join_dir("pc").unwrap();
    assert!(platform_root.try_join_file("a.out").unwrap().as_std_path().exists());
    assert!(platform_root.try_join_file("b.out").unwrap().as_std_path().exists());

    // Force a new dispatch: content (and therefore fingerprint) must differ.
    tokio::fs::write(&source_path, b"version two, long enough to shift size too").await.unwrap();
    analysis_tx
        .send(AnalysisRequest { relpath, reason: AnalysisReason::Changed })
        .await
        .unwrap();
    next_notification(&mut asset_rx).await;

    let key = SourceKey::new("foo.txt", PlatformId::new("pc"), "default");
    let products = store.get_products(&key).await.unwrap();
    assert!(matches!(products, ProductsAnswer::Known(p) if p == vec!["a.out".to_string()]));
    assert!(platform_root.try_join_file("a.out").unwrap().as_std_path().exists());
    assert!(!platform_root.try_join_file("b.out").unwrap().as_std_path().exists(), "stale product should be removed from disk");
}

// Scenario 5: `job_info` merges the scheduler's in-flight projection with
// store history while a job is running, then reflects its completion.
#[tokio::test]
async fn job_info_reflects_in_flight_then_completed_state() {
    let scan_dir = tempdir().unwrap();
    tokio::fs::write(scan_dir.path().join("foo.txt"), b"hello").await.unwrap();
    let cache_root = abs_dir(&tempdir().unwrap().keep());

    let store = Store::in_memory().await.unwrap();
    let resolver = Arc::new(PathResolver::new(vec![ScanFolder::new(abs_dir(scan_dir.path()), None, true, 0)], vec![], vec![]));

    let release = Arc::new(tokio::sync::Notify::new());
    let mut registry = BuilderRegistry::new();
    let plan: PlanJobsFn = Arc::new(|req: PlanJobsRequest| {
        Box::pin(async move {
            PlanJobsOutcome::Success(vec![JobDescriptor {
                platform: req.platforms[0].clone(),
                job_key: "default".to_string(),
                priority: 0,
                critical: false,
                check_exclusive_lock: false,
                extra_fingerprint_info: vec![],
                params: serde_json::Value::Null,
            }])
        })
    });
    let run: RunJobFn = {
        let release = Arc::clone(&release);
        Arc::new(move |_req: RunJobRequest| {
            let release = Arc::clone(&release);
            Box::pin(async move {
                release.notified().await;
                RunJobOutcome::Success(vec!["foo.arc1".to_string()])
            })
        })
    };
    registry.register(registration("echo", "*.txt"), plan, run).unwrap();

    let dedup = DedupSet::default();
    let (scheduler, _asset_tx, mut asset_rx, _source_rx) = new_scheduler(
        store.clone(),
        (*resolver).clone(),
        registry,
        vec![PlatformId::new("pc")],
        cache_root.clone(),
        dedup.clone(),
        InFlightProductSet::default(),
    )
    .await;

    let fence = Arc::new(FenceCoordinator::new(abs_dir(&tempdir().unwrap().keep())));
    let joblog = kiln::joblog::JobLog::new(abs_dir(&tempdir().unwrap().keep()), 100);
    let rpc = Rpc::new(
        store.clone(),
        Arc::clone(&resolver),
        scheduler.clone(),
        fence,
        Arc::new(HashMap::new()),
        joblog,
        dedup,
        cache_root,
        "demo".to_string(),
        vec![PlatformId::new("pc")],
        RpcIdentity {
            identifier: "kiln-daemon".to_string(),
            branch_token: "secret".to_string(),
            api_version: 1,
        },
    );

    let (analysis_tx, analysis_rx) = mpsc::channel(8);
    let handle = Arc::new(scheduler);
    tokio::spawn(Arc::clone(&handle).run(analysis_rx));

    analysis_tx
        .send(AnalysisRequest {
            relpath: RelFilePath::try_from("foo.txt").unwrap(),
            reason: AnalysisReason::Changed,
        })
        .await
        .unwrap();

    // Give the scheduler a moment to dispatch and park on `release`.
    tokio::time::timeout(TIMEOUT, async {
        loop {
            if !handle.in_flight_jobs().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job never reached in-flight state");

    let mid_flight = rpc.job_info(JobInfoRequest { source: "foo.txt".to_string() }).await;
    assert!(mid_flight.success);
    assert_eq!(mid_flight.jobs.len(), 1);
    assert_eq!(mid_flight.jobs[0].status, JobStatus::InProgress);

    release.notify_waiters();
    next_notification(&mut asset_rx).await;

    let after_completion = rpc.job_info(JobInfoRequest { source: "foo.txt".to_string() }).await;
    assert!(after_completion.success);
    assert_eq!(after_completion.jobs.len(), 1);
    assert_eq!(after_completion.jobs[0].status, JobStatus::Completed);
}

// Scenario 6: restarting a scheduler against a store that already has job
// history resumes job ids from `highest_job_id + 1`, never reusing one.
#[tokio::test]
async fn scheduler_resumes_job_ids_after_restart() {
    let store = Store::in_memory().await.unwrap();
    let key = SourceKey::new("foo.txt", PlatformId::new("pc"), "default");
    store
        .complete_job(JobId(41), &key, BuilderId::new(), kiln_protocol::Fingerprint::Value(1), vec!["foo.arc1".to_string()])
        .await
        .unwrap();
    assert_eq!(store.highest_job_id().await.unwrap(), JobId(41));

    let scan_dir = tempdir().unwrap();
    tokio::fs::write(scan_dir.path().join("foo.txt"), b"changed content").await.unwrap();
    let resolver = PathResolver::new(vec![ScanFolder::new(abs_dir(scan_dir.path()), None, true, 0)], vec![], vec![]);

    let mut registry = BuilderRegistry::new();
    let (plan, run) = echo_builder();
    registry.register(registration("echo", "*.txt"), plan, run).unwrap();

    let dedup = DedupSet::default();
    let cache_root = abs_dir(&tempdir().unwrap().keep());
    let (scheduler, _asset_tx, mut asset_rx, _source_rx) = new_scheduler(
        store.clone(),
        resolver,
        registry,
        vec![PlatformId::new("pc")],
        cache_root,
        dedup,
        InFlightProductSet::default(),
    )
    .await;

    let (analysis_tx, analysis_rx) = mpsc::channel(8);
    let handle = Arc::new(scheduler);
    tokio::spawn(Arc::clone(&handle).run(analysis_rx));

    analysis_tx
        .send(AnalysisRequest {
            relpath: RelFilePath::try_from("foo.txt").unwrap(),
            reason: AnalysisReason::Changed,
        })
        .await
        .unwrap();
    next_notification(&mut asset_rx).await;

    let jobs = store.jobs_for_source("foo.txt").await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].job_id.0 > 41, "new job id {} should be greater than the pre-existing highest job id 41", jobs[0].job_id.0);
}
