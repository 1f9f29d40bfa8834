//! The change pipeline (C4).
//!
//! Ingests raw watcher events, coalesces and classifies them, and forwards
//! per-source analysis requests to the scheduler. Built from three explicit
//! `tokio::sync::mpsc` stages — raw → classified → analysis — each drained
//! in bounded batches per turn so the pipeline stays responsive to
//! cancellation even under a flood of events, mirroring the bounded-batch
//! discipline this crate already uses for its worker pool.

use std::sync::Arc;

use color_eyre::Result;
use dashmap::DashSet;
use kiln_protocol::{AssetNotification, AssetNotificationKind, PlatformId, SourceKey};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::{
    fence::{FenceCoordinator, FenceId},
    path::{AbsDirPath, AbsFilePath, RelFilePath},
    scan::PathResolver,
    store::Store,
    watch::{RawChange, RawChangeKind},
};

/// How many items a single stage drains per scheduling turn before yielding
/// back to the runtime, so a burst on one stage can't starve the others.
const BATCH_SIZE: usize = 256;

/// The per-path dedup set shared between this pipeline and the scheduler
/// that consumes its output.
///
/// Per §4.4's queueing discipline, a path is only eligible to be re-enqueued
/// once the item already in flight for it has actually been dequeued for
/// analysis — so the pipeline inserts here before handing a request to the
/// scheduler, and the scheduler removes the entry once it dequeues that
/// request (see `scheduler::Scheduler::dequeue_for_analysis`), not before.
pub type DedupSet = Arc<DashSet<RelFilePath>>;

/// Absolute product paths a dispatched job is currently expected to
/// (re)write, shared between the scheduler and this pipeline.
///
/// A builder rewriting an existing product does so with its own
/// create/delete/rename on that path, which the watcher reports exactly
/// like any other deletion. Without this set, `classify_in_cache_tree`
/// cannot tell that self-inflicted write apart from a real orphaning of the
/// product (the file removed by something other than the job that owns it)
/// and would spuriously fail the source's fingerprint and re-enqueue it,
/// racing a legitimate rebuild already in flight for the same key. The
/// scheduler inserts a key's previously recorded products here for the
/// duration of `dispatch` and removes them once the job resolves.
pub type InFlightProductSet = Arc<DashSet<AbsFilePath>>;

/// What the pipeline hands the scheduler for a single source that needs
/// (re-)analysis.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AnalysisRequest {
    pub relpath: RelFilePath,
    pub reason: AnalysisReason,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AnalysisReason {
    Changed,
    Removed,
    PathTooLong,
}

/// An event already sorted into one of the three branches §4.4 describes.
#[derive(Clone, Debug)]
enum Classified {
    Analyze(AnalysisRequest),
    FenceSentinelDeleted(FenceId),
    /// A product file was lost out from under a source that's still
    /// present. `product` is the specific cache-relative path that
    /// disappeared, when the event pinpointed exactly one (a single-file
    /// deletion); a whole-directory deletion synthesizes one entry per
    /// affected source without a specific product.
    ProductRemoved { source: SourceKey, product: Option<RelFilePath> },
}

/// Fixed configuration the pipeline classifies events against. Cheap to
/// clone; holds only `Arc`-backed or already-cheap-to-clone state.
pub struct PipelineConfig {
    pub resolver: PathResolver,
    pub store: Store,
    pub fence: Arc<FenceCoordinator>,
    pub cache_root: AbsDirPath,
    pub platforms: Vec<PlatformId>,
    pub max_path_len: usize,
    pub in_flight_products: InFlightProductSet,
    pub asset_notify: mpsc::Sender<AssetNotification>,
}

/// Runs the three pipeline stages against `raw_rx`, forwarding analysis
/// requests to `out`. Returns when `raw_rx` closes (the watcher was
/// dropped) or `out` closes (the scheduler shut down).
///
/// `dedup` is shared with the scheduler: an entry is inserted here the first
/// time a path is enqueued for analysis, and stays present — suppressing
/// redundant re-enqueues from a flood of filesystem events — until the
/// scheduler dequeues that request and clears it, per §4.4.
#[instrument(skip_all)]
pub async fn run(
    config: PipelineConfig,
    dedup: DedupSet,
    mut raw_rx: mpsc::Receiver<RawChange>,
    out: mpsc::Sender<AnalysisRequest>,
) {
    let mut batch = Vec::with_capacity(BATCH_SIZE);

    loop {
        batch.clear();
        let received = raw_rx.recv_many(&mut batch, BATCH_SIZE).await;
        if received == 0 {
            debug!("raw change channel closed, pipeline exiting");
            return;
        }

        for change in batch.drain(..) {
            match classify(&config, change).await {
                Ok(classified) => {
                    for item in classified {
                        match item {
                            Classified::Analyze(request) => {
                                if !dedup.insert(request.relpath.clone()) {
                                    continue;
                                }
                                if out.send(request).await.is_err() {
                                    debug!("analysis queue closed, pipeline exiting");
                                    return;
                                }
                            }
                            Classified::FenceSentinelDeleted(id) => {
                                config.fence.on_sentinel_deleted(id);
                            }
                            Classified::ProductRemoved { source, product } => {
                                if let Err(err) = handle_orphaned_product(&config, &dedup, &out, &source, product).await {
                                    warn!(?err, ?source, "failed to handle orphaned product deletion");
                                }
                            }
                        }
                    }
                }
                Err(err) => warn!(?err, "failed to classify change event"),
            }
        }
    }
}

#[instrument(skip(config))]
async fn classify(config: &PipelineConfig, change: RawChange) -> Result<Vec<Classified>> {
    let Ok(abs) = AbsFilePath::try_from(change.path.clone()) else {
        return Ok(vec![]);
    };

    if config.resolver.is_excluded(&abs) {
        return Ok(vec![]);
    }

    if let Some(id) = fence_sentinel_id(config, &abs, change.kind) {
        return Ok(vec![Classified::FenceSentinelDeleted(id)]);
    }

    if is_under(&abs, &config.cache_root) {
        return classify_in_cache_tree(config, &abs, change.kind).await;
    }

    if change.kind == RawChangeKind::DirectoryDeleted {
        return classify_deleted_source_directory(config, &abs).await;
    }

    if let Some(resolved) = config.resolver.metadata_resolve(&abs).await? {
        return classify_in_source_tree(config, &resolved, change.kind).await;
    }

    classify_in_source_tree(config, &abs, change.kind).await
}

fn fence_sentinel_id(config: &PipelineConfig, abs: &AbsFilePath, kind: RawChangeKind) -> Option<FenceId> {
    if kind != RawChangeKind::Deleted || !config.fence.owns(abs) {
        return None;
    }
    let name = abs.file_name_str_lossy()?;
    FenceCoordinator::parse_sentinel_name(&name)
}

async fn classify_in_cache_tree(config: &PipelineConfig, abs: &AbsFilePath, kind: RawChangeKind) -> Result<Vec<Classified>> {
    if kind == RawChangeKind::DirectoryDeleted {
        return classify_deleted_cache_directory(config, abs).await;
    }

    if kind != RawChangeKind::Deleted {
        // Products are only ever written by dispatched jobs (tracked by
        // `in_flight_products`); an add/modify inside the cache tree that
        // isn't a known in-flight write is not actionable here.
        return Ok(vec![]);
    }

    if config.in_flight_products.contains(abs) {
        // A dispatched job is currently rewriting this exact product path;
        // this is that job's own delete-then-recreate, not an orphaning.
        return Ok(vec![]);
    }

    let Some((platform, product_relpath)) = product_relpath_under_cache(config, abs) else {
        return Ok(vec![]);
    };

    let Some(source) = config.store.source_of_product(&platform, product_relpath.as_str_lossy().as_ref()).await? else {
        return Ok(vec![]);
    };

    Ok(vec![Classified::ProductRemoved { source, product: Some(product_relpath) }])
}

/// A whole cache directory was removed in one event rather than per-file
/// (§4.4 "cache directory deletion of a known folder"): enumerate every
/// product the store still thinks lives under that prefix and synthesize a
/// `ProductRemoved` per distinct source, so each gets rebuilt.
async fn classify_deleted_cache_directory(config: &PipelineConfig, abs: &AbsFilePath) -> Result<Vec<Classified>> {
    let candidate = abs.as_str_lossy();
    let cache_root = config.cache_root.as_str_lossy();
    let Some(rest) = candidate.strip_prefix(cache_root.as_ref()).map(|r| r.trim_start_matches('/')) else {
        return Ok(vec![]);
    };
    let mut segments = rest.splitn(2, '/');
    let Some(platform_str) = segments.next() else { return Ok(vec![]) };
    let Some(platform) = config.platforms.iter().find(|p| p.as_str() == platform_str).cloned() else {
        return Ok(vec![]);
    };
    let prefix = segments.next().unwrap_or("");

    let sources = config.store.sources_with_products_under_prefix(&platform, prefix).await?;
    Ok(sources.into_iter().map(|source| Classified::ProductRemoved { source, product: None }).collect())
}

/// A source-tree directory was removed in one event rather than per-file:
/// enumerate every source the store still knows under that relative prefix
/// and synthesize a removal request for each (§4.4 "Deletion of a
/// directory").
async fn classify_deleted_source_directory(config: &PipelineConfig, abs: &AbsFilePath) -> Result<Vec<Classified>> {
    let Some((relpath, _folder)) = config.resolver.to_relative(abs) else {
        return Ok(vec![]);
    };
    let requests = sources_under_deleted_directory(&config.store, relpath.as_str_lossy().as_ref()).await?;
    Ok(requests.into_iter().map(Classified::Analyze).collect())
}

/// A product was deleted out from under a source that the scheduler didn't
/// delete it itself (i.e. not in the in-flight set). If the source still
/// exists, force a rebuild by failing its fingerprint and re-enqueueing it
/// for analysis (§4.4 "Otherwise, if a product is deleted while its source
/// still exists..."), after notifying subscribers that the product is gone
/// (spec §8 scenario 3: "A ProductRemoved notification must be emitted").
async fn handle_orphaned_product(
    config: &PipelineConfig,
    dedup: &DedupSet,
    out: &mpsc::Sender<AnalysisRequest>,
    source: &SourceKey,
    product: Option<RelFilePath>,
) -> Result<()> {
    let relpath = RelFilePath::try_from(source.source())?;
    let Some(abs) = config.resolver.find_active_source(&relpath).await else {
        return Ok(());
    };
    if config.resolver.to_relative(&abs).is_none() {
        return Ok(());
    }

    // The store still lists the lost product(s) at this point (nothing here
    // clears `products`, only the fingerprint) so this is the only chance to
    // notify with the name(s) that are about to go stale.
    let removed_products = match product {
        Some(product) => vec![product.as_str_lossy().into_owned()],
        None => match config.store.get_products(source).await? {
            crate::store::ProductsAnswer::Known(products) => products,
            crate::store::ProductsAnswer::UnknownSource => vec![],
        },
    };
    for removed in removed_products {
        let _ = config
            .asset_notify
            .send(AssetNotification {
                relpath: removed,
                kind: AssetNotificationKind::AssetRemoved,
            })
            .await;
    }

    config.store.set_fingerprint(source, kiln_protocol::Fingerprint::Failed).await?;

    if dedup.insert(relpath.clone()) {
        let _ = out
            .send(AnalysisRequest {
                relpath,
                reason: AnalysisReason::Changed,
            })
            .await;
    }
    Ok(())
}

fn product_relpath_under_cache(config: &PipelineConfig, abs: &AbsFilePath) -> Option<(PlatformId, RelFilePath)> {
    let candidate = abs.as_str_lossy();
    let cache_root = config.cache_root.as_str_lossy();
    let rest = candidate.strip_prefix(cache_root.as_ref())?.trim_start_matches('/');
    let mut segments = rest.splitn(2, '/');
    let platform = segments.next()?;
    let remainder = segments.next()?;
    let platform = config.platforms.iter().find(|p| p.as_str() == platform)?.clone();
    RelFilePath::try_from(remainder).ok().map(|rel| (platform, rel))
}

async fn classify_in_source_tree(config: &PipelineConfig, abs: &AbsFilePath, kind: RawChangeKind) -> Result<Vec<Classified>> {
    let Some((relpath, folder)) = config.resolver.to_relative(abs) else {
        return Ok(vec![]);
    };

    let cache_relpath = folder.rewrite_for_output(relpath.as_str_lossy().as_ref());
    if cache_relpath.len() > config.max_path_len {
        return Ok(vec![Classified::Analyze(AnalysisRequest {
            relpath,
            reason: AnalysisReason::PathTooLong,
        })]);
    }

    match kind {
        RawChangeKind::Deleted => {
            if config.resolver.find_override(&relpath, folder).await.is_some() {
                return Ok(vec![Classified::Analyze(AnalysisRequest {
                    relpath,
                    reason: AnalysisReason::Changed,
                })]);
            }
            Ok(vec![Classified::Analyze(AnalysisRequest {
                relpath,
                reason: AnalysisReason::Removed,
            })])
        }
        RawChangeKind::Added | RawChangeKind::Modified => Ok(vec![Classified::Analyze(AnalysisRequest {
            relpath,
            reason: AnalysisReason::Changed,
        })]),
        // Handled earlier in `classify` via `classify_deleted_source_directory`
        // before this function is ever reached with this path.
        RawChangeKind::DirectoryDeleted => Ok(vec![]),
    }
}

/// Enumerate every still-known source under a deleted directory's relative
/// prefix, synthesizing a removal request for each (§4.4 "Deletion of a
/// directory").
#[instrument(skip(store))]
pub async fn sources_under_deleted_directory(store: &Store, relprefix: &str) -> Result<Vec<AnalysisRequest>> {
    let sources = store.sources_under_prefix(relprefix).await?;
    sources
        .into_iter()
        .map(|source| {
            Ok(AnalysisRequest {
                relpath: RelFilePath::try_from(source)?,
                reason: AnalysisReason::Removed,
            })
        })
        .collect()
}

fn is_under(abs: &AbsFilePath, root: &AbsDirPath) -> bool {
    abs.as_str_lossy().starts_with(root.as_str_lossy().as_ref())
}
