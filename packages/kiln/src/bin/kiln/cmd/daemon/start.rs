use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{FromRef, Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use clap::Args;
use color_eyre::{
    Result, Section, SectionExt,
    eyre::{Context as _, bail},
};
use derive_more::Debug;
use futures::StreamExt as _;
use kiln::{
    builder::BuilderRegistry,
    catalog::Catalog,
    config::Config,
    daemon::{DaemonContext, DaemonPaths, IdleState},
    fence::FenceCoordinator,
    fs,
    idle::{IdleDetector, IdleProbes},
    joblog::JobLog,
    path::{AbsFilePath, JoinWith as _, TryJoinWith as _},
    pattern::CompiledPattern,
    pipeline::{self, AnalysisReason, AnalysisRequest, DedupSet, InFlightProductSet, PipelineConfig},
    restart::{self, RestartMonitor},
    rpc::{Rpc, RpcIdentity},
    scan::{PathResolver, ScanFolder},
    scheduler::Scheduler,
    store::Store,
    watch as kiln_watch,
};
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tower_http::trace::TraceLayer;
use tracing::{Subscriber, debug, dispatcher, info, instrument, warn};
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::{TopLevelFlags, log};

const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const DEBOUNCE: Duration = Duration::from_millis(200);
const WATCH_CHANNEL_CAPACITY: usize = 4096;
const ANALYSIS_CHANNEL_CAPACITY: usize = 4096;
const NOTIFICATION_CHANNEL_CAPACITY: usize = 1024;
const CATALOG_SAVE_INTERVAL: Duration = Duration::from_secs(5);
const CORE_IDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const API_VERSION: u32 = 1;

#[derive(Clone, Args, Debug)]
pub struct Options {
    /// Path to the daemon's configuration file.
    #[arg(long = "config", env = "KILN_CONFIG")]
    config: AbsFilePath,
}

#[instrument(skip(cli_logger))]
pub async fn exec(
    top_level_flags: TopLevelFlags,
    cli_logger: impl Subscriber + Send + Sync,
    options: Options,
) -> Result<()> {
    // Set up daemon directory.
    let cache_dir = fs::user_global_cache_path().await?;
    fs::create_dir_all(&cache_dir).await?;

    let paths = DaemonPaths::initialize().await?;
    let pid = std::process::id();
    let log_file_path = cache_dir.try_join_file(format!("kilnd.{}.log", pid))?;

    // Redirect logging into file (for daemon mode). We need to redirect the
    // logging firstly so that we can continue to see logs if the invoking
    // terminal exits, but more importantly because the invoking terminal
    // exiting causes the STDOUT and STDERR pipes of this program to close,
    // which means the process crashes with a SIGPIPE if it attempts to write to
    // them.
    let (file_logger, flame_guard) = dispatcher::with_default(&cli_logger.into(), || {
        debug!(?paths, ?log_file_path, "file paths");
        info!(?log_file_path, "logging to file");

        log::make_logger(
            #[allow(
                clippy::disallowed_methods,
                reason = "sync in main thread is OK, dispatcher closure is sync"
            )]
            std::fs::File::create(log_file_path.as_std_path())?,
            top_level_flags.profile,
            top_level_flags.color,
        )
    })?;
    file_logger.init();

    // If a pid-file exists, read it and check if the process is running. Exit
    // if another instance is running.
    if paths.daemon_running().await?.is_some() {
        bail!("kilnd is already running");
    }

    // Write and lock a pid-file.
    let mut pid_file = fslock::LockFile::open(paths.pid_file_path.as_os_str())?;
    if !pid_file.try_lock_with_pid()? {
        bail!("kilnd is already running");
    }

    // Install a handler that ignores SIGHUP so that terminal exits don't kill
    // the daemon.
    #[cfg(unix)]
    unsafe {
        signal_hook::low_level::register(signal_hook::consts::SIGHUP, || {
            warn!("ignoring SIGHUP");
        })?;
    }

    let config = Config::load(&options.config).await.context("load config")?;
    fs::create_dir_all(&config.cache_root).await.context("create cache root")?;

    let (core, rpc) = match wire_core(&config, &options.config).await {
        Ok(wired) => wired,
        Err(err) => {
            warn!(?err, "failed to wire core components");
            cleanup(&paths).await;
            std::process::exit(restart::EXIT_INIT_FAILURE);
        }
    };

    // Bind to port 0 to get a random ephemeral port from the OS. Since this binds
    // an ephemeral port, this does not conflict with typical userspace ports (3000,
    // 8000, 8080, etc) or service ports.
    let listener = tokio::net::TcpListener::bind("localhost:0")
        .await
        .context("open local server")?;
    let addr = listener
        .local_addr()
        .context("read listen address for socket")?;
    info!(?addr, "server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let idle = IdleState::new(IDLE_TIMEOUT);
    let state = ServerState {
        shutdown_tx: shutdown_tx.clone(),
        idle: idle.clone(),
    };

    let app = Router::new()
        .route("/api/v0/health", get(health))
        .route("/api/v0/shutdown", post(shutdown))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            track_activity_middleware,
        ))
        .layer(TraceLayer::new_for_http());

    // Write context file for daemon clients.
    let message = DaemonContext {
        pid,
        url: format!("{addr}"),
        log_file_path,
    };
    let encoded = serde_json::to_string(&message)
        .context("encode ready message")
        .with_section(|| format!("{message:?}").header("Message:"))?;
    fs::write(&paths.context_path, &encoded)
        .await
        .with_context(|| format!("write daemon context to {:?}", paths.context_path))?;

    let restart_requested = {
        let shutdown_tx = shutdown_tx.clone();
        spawn_restart_monitor(&config, &options.config, shutdown_tx)?
    };

    let _rpc = rpc;

    // We don't immediately handle the error with `?` here so that we can perform
    // the cleanup operations regardless of whether an error occurred.
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(idle, shutdown_rx))
        .await
        .context("start server");

    cleanup(&paths).await;

    // TODO: Unsure if we need to keep this, the guard _should_ flush on drop.
    if let Some(flame_guard) = flame_guard {
        flame_guard.flush().context("flush flame_guard")?;
    }

    served?;

    if restart_requested.load(std::sync::atomic::Ordering::SeqCst) {
        std::process::exit(restart::EXIT_RESTART_REQUESTED);
    }
    std::process::exit(restart::EXIT_CLEAN);
}

async fn cleanup(paths: &DaemonPaths) {
    info!(?paths, "exiting; cleaning up context files");
    if let Err(err) = fs::remove_file(&paths.pid_file_path).await {
        warn!(?err, path = ?paths.pid_file_path, "failed to remove pid file");
    }
    if let Err(err) = fs::remove_file(&paths.context_path).await {
        warn!(?err, path = ?paths.context_path, "failed to remove context file");
    }
    info!("context files cleaned up");
}

/// Assembles every core component (C1-C9) and starts their background
/// tasks, returning the handle the control surface needs to hold alive
/// ([`Rpc`], currently unbound to any transport per the asset RPC surface's
/// transport-agnostic non-goal) alongside a marker struct so the caller has
/// a single fallible entry point.
async fn wire_core(config: &Config, config_path: &AbsFilePath) -> Result<((), Rpc)> {
    let scan_folders: Vec<ScanFolder> = config
        .scan_folders
        .iter()
        .map(|folder| ScanFolder::new(folder.root.clone(), folder.output_prefix.clone(), folder.recursive, folder.order))
        .collect();

    let mut excludes = Vec::with_capacity(config.excludes.len());
    for (pattern, kind) in &config.excludes {
        excludes.push(CompiledPattern::compile(pattern, *kind).with_context(|| format!("compile exclude pattern {pattern:?}"))?);
    }

    let resolver = PathResolver::new(scan_folders.clone(), excludes, config.metadata_suffixes.clone());

    if !config.builders.is_empty() {
        warn!(count = config.builders.len(), "builder modules are configured but loading them is out of scope; starting with an empty registry");
    }
    let registry = BuilderRegistry::new();

    let store_path = config.cache_root.try_join_file("kiln.db")?;
    let store = Store::open(store_path.as_std_path().to_path_buf()).await.context("open store")?;

    let mut catalogs = HashMap::new();
    for platform in &config.platforms {
        let catalog_path = config
            .platform_cache_root(platform)
            .try_join_dir(&config.game_name)?
            .try_join_file("assetcatalog.xml")?;
        fs::create_dir_all(&catalog_path.parent().expect("catalog path has a parent"))
            .await
            .context("create catalog directory")?;
        let catalog = Catalog::load(catalog_path).await.context("load product catalog")?;
        catalogs.insert(platform.clone(), catalog);
    }
    let catalogs = Arc::new(catalogs);
    spawn_catalog_savers(&catalogs);

    let fence_dir = config.cache_root.try_join_dir(".fence")?;
    fs::create_dir_all(&fence_dir).await.context("create fence directory")?;
    let fence = Arc::new(FenceCoordinator::new(fence_dir));

    let joblog_dir = config.cache_root.try_join_dir(".joblogs")?;
    let joblog = JobLog::new(joblog_dir, config.max_retained_logs);

    let dedup: DedupSet = DedupSet::default();
    let in_flight_products: InFlightProductSet = InFlightProductSet::default();
    let (asset_tx, asset_rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);
    let (source_tx, source_rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);
    spawn_notification_loggers(asset_rx, source_rx);

    let scheduler = Scheduler::new(
        store.clone(),
        resolver.clone(),
        registry,
        config.platforms.clone(),
        config.cache_root.clone(),
        dedup.clone(),
        Arc::clone(&in_flight_products),
        asset_tx.clone(),
        source_tx,
        Arc::clone(&catalogs),
    )
    .await
    .context("build scheduler")?;

    let mut watch_roots = scan_folders.iter().map(|folder| folder.root.clone()).collect::<Vec<_>>();
    watch_roots.push(config.cache_root.clone());
    let (_watch, raw_rx) = kiln_watch::watch(&watch_roots, DEBOUNCE, WATCH_CHANNEL_CAPACITY).context("start file watcher")?;
    // Leak the watcher handle for the life of the process: dropping it would
    // stop the underlying notify debouncer, and nothing else owns it once
    // this function returns.
    std::mem::forget(_watch);

    let (analysis_tx, analysis_rx) = mpsc::channel(ANALYSIS_CHANNEL_CAPACITY);

    let pipeline_config = PipelineConfig {
        resolver: resolver.clone(),
        store: store.clone(),
        fence: Arc::clone(&fence),
        cache_root: config.cache_root.clone(),
        platforms: config.platforms.clone(),
        max_path_len: config.max_path_len,
        in_flight_products,
        asset_notify: asset_tx,
    };
    tokio::spawn(pipeline::run(pipeline_config, dedup.clone(), raw_rx, analysis_tx.clone()));

    let scheduler_for_run = Arc::new(scheduler.clone());
    tokio::spawn(scheduler_for_run.run(analysis_rx));

    spawn_initial_scan(resolver.clone(), dedup.clone(), analysis_tx.clone());

    let probes = {
        let dedup = dedup.clone();
        let analysis_tx = analysis_tx.clone();
        let scheduler = scheduler.clone();
        IdleProbes {
            active_queue_len: Box::new(move || dedup.len()),
            to_examine_len: Box::new(move || analysis_tx.max_capacity() - analysis_tx.capacity()),
            in_flight_len: Box::new(move || scheduler.in_flight_jobs().len()),
        }
    };
    let idle_detector = Arc::new(IdleDetector::new(probes, store.clone()));
    {
        let detector = Arc::clone(&idle_detector);
        tokio::spawn(async move { detector.run(CORE_IDLE_POLL_INTERVAL).await });
    }

    let identity = RpcIdentity {
        identifier: config.game_name.clone(),
        branch_token: config.branch_token.clone(),
        api_version: API_VERSION,
    };
    let rpc = Rpc::new(
        store,
        Arc::new(resolver),
        scheduler,
        fence,
        catalogs,
        joblog,
        dedup,
        config.cache_root.clone(),
        config.game_name.clone(),
        config.platforms.clone(),
        identity,
    );
    {
        let mut idle_rx = idle_detector.subscribe();
        let rpc = rpc.clone();
        tokio::spawn(async move {
            while idle_rx.changed().await.is_ok() {
                rpc.clear_missing_cache();
            }
        });
    }

    // The configuration file itself is a restart trigger, threaded through
    // by the caller alongside the executable and any builder modules.
    let _ = config_path;

    Ok(((), rpc))
}

/// Spawns one background save-loop task per platform catalog. Each task
/// holds its own `Arc` clone of the whole map so it keeps its catalog alive
/// for the life of the process without borrowing from this function's stack.
fn spawn_catalog_savers(catalogs: &Arc<HashMap<kiln_protocol::PlatformId, Catalog>>) {
    for platform in catalogs.keys().cloned().collect::<Vec<_>>() {
        let catalogs = Arc::clone(catalogs);
        tokio::spawn(async move {
            if let Some(catalog) = catalogs.get(&platform) {
                catalog.run(CATALOG_SAVE_INTERVAL).await;
            }
        });
    }
}

fn spawn_notification_loggers(
    mut asset_rx: mpsc::Receiver<kiln_protocol::AssetNotification>,
    mut source_rx: mpsc::Receiver<kiln_protocol::SourceFileNotification>,
) {
    tokio::spawn(async move {
        while let Some(notification) = asset_rx.recv().await {
            debug!(?notification, "asset notification");
        }
    });
    tokio::spawn(async move {
        while let Some(notification) = source_rx.recv().await {
            debug!(?notification, "source notification");
        }
    });
}

/// Walks every scan folder once at startup so files already on disk before
/// this daemon ever ran get planned and built, the same as any other change
/// (§11 "critical-job startup gating" assumes an initial scan populates the
/// critical-job counter before the idle detector's first transition).
fn spawn_initial_scan(resolver: PathResolver, dedup: DedupSet, analysis_tx: mpsc::Sender<AnalysisRequest>) {
    tokio::spawn(async move {
        for folder in resolver.scan_folders().to_vec() {
            let mut entries = fs::walk_files(&folder.root);
            while let Some(entry) = entries.next().await {
                let abs = match entry {
                    Ok(abs) => abs,
                    Err(err) => {
                        warn!(?err, "failed to walk scan folder during initial scan");
                        continue;
                    }
                };
                if resolver.is_excluded(&abs) {
                    continue;
                }
                let Some((relpath, _)) = resolver.to_relative(&abs) else {
                    continue;
                };
                if dedup.insert(relpath.clone()) {
                    let _ = analysis_tx
                        .send(AnalysisRequest {
                            relpath,
                            reason: AnalysisReason::Changed,
                        })
                        .await;
                }
            }
        }
    });
}

fn spawn_restart_monitor(config: &Config, config_path: &AbsFilePath, shutdown_tx: watch::Sender<bool>) -> Result<Arc<std::sync::atomic::AtomicBool>> {
    let mut watched = vec![AbsFilePath::try_from(std::env::current_exe().context("read current executable path")?)?, config_path.clone()];
    for builder in &config.builders {
        watched.push(builder.module_path.clone());
    }

    let monitor = RestartMonitor::new(watched)?;
    let requested = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = Arc::clone(&requested);
    tokio::spawn(async move {
        if monitor.wait_for_restart_request().await.is_ok() {
            info!("restart trigger observed, requesting graceful shutdown");
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            let _ = shutdown_tx.send(true);
        }
    });
    Ok(requested)
}

/// Middleware to track activity on every request.
async fn track_activity_middleware(
    State(state): State<ServerState>,
    request: Request,
    next: Next,
) -> Response {
    state.idle.touch();
    next.run(request).await
}

/// Wait for a shutdown signal from either OS signals (SIGINT/SIGTERM) or the
/// explicit shutdown channel.
async fn shutdown_signal(idle: IdleState, mut shutdown_rx: watch::Receiver<bool>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let explicit_shutdown = async {
        let _ = shutdown_rx.changed().await;
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT (Ctrl+C), starting graceful shutdown");
        },
        _ = terminate => {
            info!("received SIGTERM, starting graceful shutdown");
        },
        _ = explicit_shutdown => {
            info!("received explicit shutdown request, starting graceful shutdown");
        },
        _ = idle.monitor() => {
            info!("idle timeout reached, starting graceful shutdown");
        }
    }
}

#[derive(Debug, Clone, FromRef)]
struct ServerState {
    shutdown_tx: watch::Sender<bool>,
    idle: IdleState,
}

#[instrument]
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

#[instrument]
async fn shutdown(State(state): State<ServerState>) -> Json<serde_json::Value> {
    info!("shutdown request received");

    let _ = state.shutdown_tx.send(true);

    Json(serde_json::json!({ "ok": true }))
}
