//! The RPC surface (C8).
//!
//! Implemented as plain async methods on [`Rpc`] that take and return the
//! typed request/response payloads from `kiln-protocol` — no transport is
//! attached here, consistent with this daemon's non-goal of shipping its own
//! wire framing. A caller binds these methods to whatever transport it
//! likes (the ambient `axum` control surface, a test harness calling
//! directly, etc).
//!
//! Two handlers are fenced (§4.8): job info and job log both need the
//! change pipeline to have drained everything already in flight before they
//! answer, so a stale in-progress read doesn't race a completion that's
//! already on disk. Both round-trip through [`FenceCoordinator`] before
//! doing any work.

use std::sync::Arc;

use dashmap::DashSet;
use kiln_protocol::{
    AssetExistsRequest, AssetExistsResponse, AssetIdRequest, AssetIdResponse, AssetStatus, FullPathRequest,
    FullPathResponse, JobInfoProjection, JobInfoRequest, JobInfoResponse, JobLogRequest, JobLogResponse, JobStatus,
    NegotiationFailure, NegotiationRequest, NegotiationResponse, PlatformId, SourceKey, StatusRequest, StatusResponse,
};
use tracing::{instrument, warn};

use crate::{
    catalog::Catalog,
    fence::FenceCoordinator,
    joblog::JobLog,
    path::{AbsDirPath, AbsFilePath, JoinWith as _, RelFilePath, TryJoinWith as _},
    pipeline::{DedupSet, InFlightProductSet},
    scan::PathResolver,
    scheduler::Scheduler,
    store::{ProductsAnswer, Store},
};

/// Everything a single negotiated client connection needs identified up
/// front so `negotiate` can reject a self-connection, a stale branch, or an
/// incompatible client without touching any of the real handlers.
pub struct RpcIdentity {
    pub identifier: String,
    pub branch_token: String,
    pub api_version: u32,
}

/// The RPC surface. Cheap to clone — every field is `Arc`-backed, a
/// `Clone`-cheap handle, or plain data copied at construction time.
#[derive(Clone)]
pub struct Rpc {
    store: Store,
    resolver: Arc<PathResolver>,
    scheduler: Scheduler,
    fence: Arc<FenceCoordinator>,
    catalogs: Arc<std::collections::HashMap<PlatformId, Catalog>>,
    joblog: JobLog,
    dedup: DedupSet,
    cache_root: AbsDirPath,
    game_name: String,
    platforms: Vec<PlatformId>,
    default_platform: PlatformId,
    missing_cache: Arc<DashSet<String>>,
    identity: Arc<RpcIdentity>,
}

impl Rpc {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        resolver: Arc<PathResolver>,
        scheduler: Scheduler,
        fence: Arc<FenceCoordinator>,
        catalogs: Arc<std::collections::HashMap<PlatformId, Catalog>>,
        joblog: JobLog,
        dedup: DedupSet,
        cache_root: AbsDirPath,
        game_name: String,
        platforms: Vec<PlatformId>,
        identity: RpcIdentity,
    ) -> Self {
        let default_platform = platforms.first().cloned().unwrap_or_else(|| PlatformId::new("default"));
        Self {
            store,
            resolver,
            scheduler,
            fence,
            catalogs,
            joblog,
            dedup,
            cache_root,
            game_name,
            platforms,
            default_platform,
            missing_cache: Arc::new(DashSet::new()),
            identity: Arc::new(identity),
        }
    }

    /// Drops every cached "previously missing" answer. Wired to the idle
    /// detector's on-idle broadcast (§4.9) so `asset_exists` re-checks files
    /// it gave up on the last time the core was busy.
    pub fn clear_missing_cache(&self) {
        self.missing_cache.clear();
    }

    /// The handshake a client performs before issuing any other request.
    #[instrument(skip(self, request))]
    pub fn negotiate(&self, request: &NegotiationRequest) -> NegotiationResponse {
        if request.identifier == self.identity.identifier {
            return NegotiationResponse {
                accepted: false,
                failure: Some(NegotiationFailure::IdentifiesAsSelf),
            };
        }
        if request.branch_token != self.identity.branch_token {
            return NegotiationResponse {
                accepted: false,
                failure: Some(NegotiationFailure::BranchTokenMismatch),
            };
        }
        if request.api_version != self.identity.api_version {
            return NegotiationResponse {
                accepted: false,
                failure: Some(NegotiationFailure::ApiVersionMismatch),
            };
        }
        NegotiationResponse { accepted: true, failure: None }
    }

    /// Derives an asset id from an arbitrary input path (§4.8).
    ///
    /// - An absolute path under the cache root has the cache root, the
    ///   platform segment, and (if present) the game-name segment stripped;
    ///   the remainder is the id.
    /// - An absolute path under a scan folder resolves to its source's
    ///   default-platform product list; the first product is the id, or the
    ///   relative source path if the source has no products yet.
    /// - Anything else (already relative, or unrecognized) is returned
    ///   unchanged with success.
    /// - Any failure along the way returns the original input, unsuccessful.
    #[instrument(skip(self))]
    pub async fn asset_id(&self, request: AssetIdRequest) -> AssetIdResponse {
        let Ok(abs) = AbsFilePath::try_from(request.input.as_str()) else {
            // Not an absolute path: treat it as already being an id.
            return AssetIdResponse { success: true, id: request.input };
        };

        if let Some(id) = self.derive_id_from_cache_path(&abs) {
            return AssetIdResponse { success: true, id };
        }

        if let Some((rel, _folder)) = self.resolver.to_relative(&abs) {
            let source = rel.as_str_lossy().into_owned();
            if let Some(id) = self.first_product_for_source(&source).await {
                return AssetIdResponse { success: true, id };
            }
            return AssetIdResponse { success: true, id: source };
        }

        AssetIdResponse { success: false, id: request.input }
    }

    fn derive_id_from_cache_path(&self, abs: &AbsFilePath) -> Option<String> {
        let rest = abs
            .as_str_lossy()
            .strip_prefix(self.cache_root.as_str_lossy().as_ref())?
            .trim_start_matches('/')
            .to_string();
        let mut segments = rest.splitn(2, '/');
        let _platform = segments.next()?;
        let remainder = segments.next()?;
        let remainder = remainder
            .strip_prefix(&format!("{}/", self.game_name))
            .unwrap_or(remainder);
        Some(remainder.to_string())
    }

    /// The first recorded product for `source` under the default platform,
    /// across whatever job keys that source has planned builds for.
    async fn first_product_for_source(&self, source: &str) -> Option<String> {
        let job_keys = self.store.job_descriptions_for(source, &self.default_platform).await.ok()?;
        for job_key in job_keys {
            let key = SourceKey::new(source.to_string(), self.default_platform.clone(), job_key);
            if let Ok(ProductsAnswer::Known(products)) = self.store.get_products(&key).await {
                if let Some(first) = products.into_iter().next() {
                    return Some(first);
                }
            }
        }
        None
    }

    /// Derives a full path from an asset id: the inverse of [`Rpc::asset_id`]
    /// (§4.8). Tries the id as a catalog product first, then as a known
    /// source (returning the active, highest-precedence file), then as a
    /// literal path. Anything else is returned unchanged, unsuccessful.
    #[instrument(skip(self))]
    pub async fn full_path(&self, request: FullPathRequest) -> FullPathResponse {
        if let Some(path) = self.product_full_path(&request.asset_id) {
            return FullPathResponse { success: true, path };
        }

        if let Ok(rel) = RelFilePath::try_from(request.asset_id.as_str()) {
            if let Some(abs) = self.resolver.find_active_source(&rel).await {
                return FullPathResponse {
                    success: true,
                    path: abs.as_str_lossy().into_owned(),
                };
            }
        }

        if let Ok(abs) = AbsFilePath::try_from(request.asset_id.as_str()) {
            if abs.exists().await {
                return FullPathResponse {
                    success: true,
                    path: abs.as_str_lossy().into_owned(),
                };
            }
        }

        FullPathResponse { success: false, path: request.asset_id }
    }

    /// Looks `asset_id` up in each platform's catalog (default platform
    /// first) and, if found, computes the product's full path on disk.
    fn product_full_path(&self, asset_id: &str) -> Option<String> {
        let ordered = std::iter::once(&self.default_platform).chain(self.platforms.iter().filter(|p| *p != &self.default_platform));
        for platform in ordered {
            let Some(catalog) = self.catalogs.get(platform) else { continue };
            let Some(entry) = catalog.lookup(asset_id) else { continue };
            let Ok(rel) = RelFilePath::try_from(entry.relative_path.as_str()) else { continue };
            let Ok(platform_root) = self.cache_root.try_join_dir(platform.as_str()) else { continue };
            return Some(platform_root.join(&rel).as_str_lossy().into_owned());
        }
        None
    }

    /// Waits for the fence round trip before answering a fenced request
    /// (§4.8), ensuring every filesystem event already observed has finished
    /// draining through the pipeline before the answer is computed.
    async fn await_fence(&self) {
        let (id, rx) = self.fence.begin().await;
        match rx.await {
            Ok(_outcome) => {}
            Err(_) => warn!(?id, "fence coordinator dropped before resolving"),
        }
    }

    /// Job history for a source (§4.8). Fenced. Merges in-flight scheduler
    /// state with store history, preferring the in-flight projection for any
    /// job id both report.
    #[instrument(skip(self))]
    pub async fn job_info(&self, request: JobInfoRequest) -> JobInfoResponse {
        self.await_fence().await;

        let source_key = request.source.to_lowercase();
        let mut jobs: Vec<JobInfoProjection> = self
            .scheduler
            .in_flight_jobs()
            .into_iter()
            .filter(|job| job.source.to_lowercase() == source_key)
            .collect();

        match self.store.jobs_for_source(&request.source).await {
            Ok(records) => {
                for record in records {
                    if jobs.iter().any(|job| job.job_id == record.job_id) {
                        continue;
                    }
                    jobs.push(JobInfoProjection {
                        job_id: record.job_id,
                        source: record.source.source().to_string(),
                        builder_id: record.builder_id,
                        platform: record.source.platform().clone(),
                        job_key: record.source.job_key().to_string(),
                        status: record.status,
                    });
                }
                JobInfoResponse { success: true, jobs }
            }
            Err(err) => {
                warn!(?err, "job history lookup failed");
                JobInfoResponse { success: false, jobs }
            }
        }
    }

    /// Log contents for a job id (§4.8). Fenced. A job that never reached a
    /// builder because its source path exceeded the configured length limit
    /// reports a distinct error instead of attempting a log file lookup.
    #[instrument(skip(self))]
    pub async fn job_log(&self, request: JobLogRequest) -> JobLogResponse {
        self.await_fence().await;

        let record = match self.store.job_by_id(request.job_id).await {
            Ok(record) => record,
            Err(err) => {
                return JobLogResponse {
                    success: false,
                    log: Vec::new(),
                    error: Some(err.to_string()),
                };
            }
        };

        let Some(record) = record else {
            return JobLogResponse {
                success: false,
                log: Vec::new(),
                error: Some("unknown job id".to_string()),
            };
        };

        if record.status == JobStatus::FailedPathTooLong {
            return JobLogResponse {
                success: false,
                log: Vec::new(),
                error: Some("source path exceeded the configured maximum length; no build was attempted".to_string()),
            };
        }

        match self.joblog.read(request.job_id).await {
            Ok(Some(log)) => JobLogResponse { success: true, log, error: None },
            Ok(None) => JobLogResponse {
                success: false,
                log: Vec::new(),
                error: Some("no log recorded for this job".to_string()),
            },
            Err(err) => JobLogResponse {
                success: false,
                log: Vec::new(),
                error: Some(err.to_string()),
            },
        }
    }

    /// Whether an asset exists, checked as a product first and then as a
    /// source under any configured platform (§4.8). Not fenced: a brief
    /// staleness window is acceptable here, traded for not blocking on every
    /// lookup. Negative answers are cached until the core's next idle
    /// transition (§4.9), re-checked via [`Rpc::clear_missing_cache`].
    #[instrument(skip(self))]
    pub async fn asset_exists(&self, request: AssetExistsRequest) -> AssetExistsResponse {
        if self.missing_cache.contains(&request.input) {
            return AssetExistsResponse { exists: false };
        }

        let exists = self.check_existence(&request.input).await;
        if !exists {
            self.missing_cache.insert(request.input);
        }
        AssetExistsResponse { exists }
    }

    async fn check_existence(&self, input: &str) -> bool {
        if self.product_full_path(input).is_some() {
            return true;
        }
        let Ok(rel) = RelFilePath::try_from(input) else {
            return false;
        };
        let source = rel.as_str_lossy().into_owned();
        for platform in &self.platforms {
            let Ok(job_keys) = self.store.job_descriptions_for(&source, platform).await else { continue };
            for job_key in job_keys {
                let key = SourceKey::new(source.clone(), platform.clone(), job_key);
                if let Ok(fingerprint) = self.store.get_fingerprint(&key).await {
                    if !fingerprint.is_absent() {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// A lightweight enumerated status for an input (§4.8): queued if still
    /// waiting to be dequeued for analysis, in progress if the scheduler is
    /// actively building it, compiled if its last build succeeded, missing
    /// if its last build failed, unknown otherwise.
    #[instrument(skip(self))]
    pub async fn status(&self, request: StatusRequest) -> StatusResponse {
        let Ok(rel) = RelFilePath::try_from(request.input.as_str()) else {
            return StatusResponse { status: AssetStatus::Unknown };
        };

        if self.dedup.contains(&rel) {
            return StatusResponse { status: AssetStatus::Queued };
        }

        let lowered = request.input.to_lowercase();
        if self
            .scheduler
            .in_flight_jobs()
            .iter()
            .any(|job| job.source.to_lowercase() == lowered)
        {
            return StatusResponse { status: AssetStatus::InProgress };
        }

        let source = rel.as_str_lossy().into_owned();
        for platform in &self.platforms {
            let Ok(job_keys) = self.store.job_descriptions_for(&source, platform).await else { continue };
            for job_key in job_keys {
                let key = SourceKey::new(source.clone(), platform.clone(), job_key);
                match self.store.get_fingerprint(&key).await {
                    Ok(fingerprint) if fingerprint.is_failed() => return StatusResponse { status: AssetStatus::Missing },
                    Ok(fingerprint) if !fingerprint.is_absent() => return StatusResponse { status: AssetStatus::Compiled },
                    _ => {}
                }
            }
        }
        StatusResponse { status: AssetStatus::Unknown }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::BuilderRegistry;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    async fn test_rpc(cache_root: AbsDirPath, resolver: PathResolver) -> (Rpc, Store) {
        let store = Store::in_memory().await.unwrap();
        let (asset_tx, _asset_rx) = mpsc::channel(8);
        let (source_tx, _source_rx) = mpsc::channel(8);
        let dedup = DedupSet::default();
        let in_flight_products = InFlightProductSet::default();
        let scheduler = Scheduler::new(
            store.clone(),
            resolver.clone(),
            BuilderRegistry::new(),
            vec![PlatformId::new("pc")],
            cache_root.clone(),
            dedup.clone(),
            in_flight_products,
            asset_tx,
            source_tx,
            Arc::new(HashMap::new()),
        )
        .await
        .unwrap();

        let fence_dir = tempdir().unwrap();
        let fence = Arc::new(FenceCoordinator::new(AbsDirPath::try_from(fence_dir.keep()).unwrap()));
        let joblog = JobLog::new(AbsDirPath::try_from(tempdir().unwrap().keep()).unwrap(), 100);

        let rpc = Rpc::new(
            store.clone(),
            Arc::new(resolver),
            scheduler,
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
        (rpc, store)
    }

    #[tokio::test]
    async fn asset_id_for_relative_input_is_returned_unchanged() {
        let cache_root = AbsDirPath::try_from(tempdir().unwrap().keep()).unwrap();
        let resolver = PathResolver::new(vec![], vec![], vec![]);
        let (rpc, _store) = test_rpc(cache_root, resolver).await;

        let response = rpc.asset_id(AssetIdRequest { input: "textures/foo.png".to_string() }).await;
        assert!(response.success);
        assert_eq!(response.id, "textures/foo.png");
    }

    #[tokio::test]
    async fn asset_id_for_cache_path_strips_root_platform_and_game_name() {
        let dir = tempdir().unwrap();
        let cache_root = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        let resolver = PathResolver::new(vec![], vec![], vec![]);
        let (rpc, _store) = test_rpc(cache_root.clone(), resolver).await;

        let input = cache_root.as_str_lossy().into_owned() + "/pc/demo/textures/foo.arc1";
        let response = rpc.asset_id(AssetIdRequest { input }).await;
        assert!(response.success);
        assert_eq!(response.id, "textures/foo.arc1");
    }

    #[tokio::test]
    async fn negotiate_rejects_self_identifier() {
        let cache_root = AbsDirPath::try_from(tempdir().unwrap().keep()).unwrap();
        let resolver = PathResolver::new(vec![], vec![], vec![]);
        let (rpc, _store) = test_rpc(cache_root, resolver).await;

        let response = rpc.negotiate(&NegotiationRequest {
            identifier: "kiln-daemon".to_string(),
            process_id: "1".to_string(),
            branch_token: "secret".to_string(),
            api_version: 1,
            platform: "pc".to_string(),
        });
        assert!(!response.accepted);
        assert_eq!(response.failure, Some(NegotiationFailure::IdentifiesAsSelf));
    }

    #[tokio::test]
    async fn negotiate_rejects_branch_token_mismatch() {
        let cache_root = AbsDirPath::try_from(tempdir().unwrap().keep()).unwrap();
        let resolver = PathResolver::new(vec![], vec![], vec![]);
        let (rpc, _store) = test_rpc(cache_root, resolver).await;

        let response = rpc.negotiate(&NegotiationRequest {
            identifier: "some-client".to_string(),
            process_id: "1".to_string(),
            branch_token: "wrong".to_string(),
            api_version: 1,
            platform: "pc".to_string(),
        });
        assert!(!response.accepted);
        assert_eq!(response.failure, Some(NegotiationFailure::BranchTokenMismatch));
    }

    #[tokio::test]
    async fn negotiate_accepts_matching_client() {
        let cache_root = AbsDirPath::try_from(tempdir().unwrap().keep()).unwrap();
        let resolver = PathResolver::new(vec![], vec![], vec![]);
        let (rpc, _store) = test_rpc(cache_root, resolver).await;

        let response = rpc.negotiate(&NegotiationRequest {
            identifier: "some-client".to_string(),
            process_id: "1".to_string(),
            branch_token: "secret".to_string(),
            api_version: 1,
            platform: "pc".to_string(),
        });
        assert!(response.accepted);
        assert_eq!(response.failure, None);
    }

    #[tokio::test]
    async fn job_info_merges_in_flight_and_store_history() {
        let cache_root = AbsDirPath::try_from(tempdir().unwrap().keep()).unwrap();
        let resolver = PathResolver::new(vec![], vec![], vec![]);
        let (rpc, store) = test_rpc(cache_root, resolver).await;

        let key = SourceKey::new("foo.txt", PlatformId::new("pc"), "default");
        store
            .record_job(kiln_protocol::JobId(1), &key, kiln_protocol::BuilderId::new(), kiln_protocol::JobStatus::Completed)
            .await
            .unwrap();

        let response = rpc.job_info(JobInfoRequest { source: "foo.txt".to_string() }).await;
        assert!(response.success);
        assert_eq!(response.jobs.len(), 1);
        assert_eq!(response.jobs[0].job_id, kiln_protocol::JobId(1));
    }

    #[tokio::test]
    async fn job_log_reports_unknown_job_id() {
        let cache_root = AbsDirPath::try_from(tempdir().unwrap().keep()).unwrap();
        let resolver = PathResolver::new(vec![], vec![], vec![]);
        let (rpc, _store) = test_rpc(cache_root, resolver).await;

        let response = rpc.job_log(JobLogRequest { job_id: kiln_protocol::JobId(999) }).await;
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("unknown job id"));
    }

    #[tokio::test]
    async fn asset_exists_is_false_for_unknown_input() {
        let cache_root = AbsDirPath::try_from(tempdir().unwrap().keep()).unwrap();
        let resolver = PathResolver::new(vec![], vec![], vec![]);
        let (rpc, _store) = test_rpc(cache_root, resolver).await;

        let response = rpc.asset_exists(AssetExistsRequest { input: "never/heard/of/it.txt".to_string() }).await;
        assert!(!response.exists);
    }

    #[tokio::test]
    async fn status_is_unknown_for_unrecognized_input() {
        let cache_root = AbsDirPath::try_from(tempdir().unwrap().keep()).unwrap();
        let resolver = PathResolver::new(vec![], vec![], vec![]);
        let (rpc, _store) = test_rpc(cache_root, resolver).await;

        let response = rpc.status(StatusRequest { input: "nope.txt".to_string() }).await;
        assert_eq!(response.status, AssetStatus::Unknown);
    }
}
