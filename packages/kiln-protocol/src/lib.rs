//! Shared message and identity types for the `kiln` asset processor.
//!
//! This crate holds the typed vocabulary that the daemon's core (the `kiln`
//! crate) and any RPC transport binding it to a client exchange: source
//! identity, fingerprints, job records, builder registration records, and
//! the request/response payloads of the RPC surface. It intentionally knows
//! nothing about how those payloads travel over a wire — that's a
//! transport's job, not this crate's.

use std::{cmp::Ordering, fmt, hash::Hasher};

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use strum::{Display as StrumDisplay, EnumString};
use uuid::Uuid;

/// A platform identifier (e.g. `pc`, `es3`).
///
/// Platform ids are compared case-sensitively; unlike [`SourceKey`], there is
/// no ambiguity here the source format needs to paper over.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize)]
#[display("{_0}")]
pub struct PlatformId(pub String);

impl PlatformId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PlatformId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A stable 128-bit identifier for a registered builder.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
#[display("{_0}")]
pub struct BuilderId(pub Uuid);

impl BuilderId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BuilderId {
    fn default() -> Self {
        Self::new()
    }
}

/// A monotonically assigned job identifier.
///
/// Job ids are 64-bit and strictly increasing for the lifetime of a given
/// store; [`JobId::SEED`] is the value `highest_job_id()` reports when the
/// store is empty, per the restart-continuity requirement.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, From, Into, Serialize, Deserialize,
)]
#[display("{_0}")]
pub struct JobId(pub i64);

impl JobId {
    /// What `highest_job_id()` reports when no jobs have ever been recorded.
    pub const SEED: i64 = -1;

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// A content fingerprint over a build unit's inputs.
///
/// Stored on disk and over the wire as a raw `u32`: `0` means "absent" and
/// `1` means "failed build, retry next time". All other values are
/// content-derived CRC-32 checksums. This type exists so in-process code
/// never has to remember the sentinel encoding itself — conversions to and
/// from the raw `u32` are the only place that encoding is visible.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum Fingerprint {
    Absent,
    Failed,
    Value(u32),
}

impl Fingerprint {
    pub fn is_absent(self) -> bool {
        matches!(self, Fingerprint::Absent)
    }

    pub fn is_failed(self) -> bool {
        matches!(self, Fingerprint::Failed)
    }
}

impl From<u32> for Fingerprint {
    fn from(value: u32) -> Self {
        match value {
            0 => Fingerprint::Absent,
            1 => Fingerprint::Failed,
            value => Fingerprint::Value(value),
        }
    }
}

impl From<Fingerprint> for u32 {
    fn from(value: Fingerprint) -> Self {
        match value {
            Fingerprint::Absent => 0,
            Fingerprint::Failed => 1,
            Fingerprint::Value(value) => value,
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fingerprint::Absent => f.write_str("absent"),
            Fingerprint::Failed => f.write_str("failed"),
            Fingerprint::Value(value) => write!(f, "{value:#010x}"),
        }
    }
}

/// The tuple identifying a single build unit: a relative source path, the
/// platform it's being built for, and the builder-assigned job key.
///
/// Comparison and hashing are case-insensitive (matching the case-insensitive
/// filesystems this daemon is expected to run on), but the originally
/// observed casing of the source path is always preserved and returned by
/// [`SourceKey::source`] — some consumers downstream are case-sensitive.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceKey {
    source: String,
    platform: PlatformId,
    job_key: String,
}

impl SourceKey {
    pub fn new(source: impl Into<String>, platform: PlatformId, job_key: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            platform,
            job_key: job_key.into(),
        }
    }

    /// The relative source path, in its originally observed casing.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn platform(&self) -> &PlatformId {
        &self.platform
    }

    pub fn job_key(&self) -> &str {
        &self.job_key
    }

    fn comparison_key(&self) -> (String, &PlatformId, &str) {
        (self.source.to_lowercase(), &self.platform, self.job_key.as_str())
    }
}

impl PartialEq for SourceKey {
    fn eq(&self, other: &Self) -> bool {
        self.comparison_key() == other.comparison_key()
    }
}

impl Eq for SourceKey {}

impl std::hash::Hash for SourceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.comparison_key().hash(state);
    }
}

impl PartialOrd for SourceKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SourceKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.comparison_key().cmp(&other.comparison_key())
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::{}", self.source, self.platform, self.job_key)
    }
}

/// The outcome status of a single build attempt.
#[derive(
    Copy, Clone, Eq, PartialEq, Hash, Debug, StrumDisplay, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    FailedPathTooLong,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::Failed
                | JobStatus::FailedPathTooLong
                | JobStatus::Cancelled
        )
    }
}

/// A historical record of one build attempt.
///
/// Records are append-only: a new attempt for the same
/// (source, platform, builder, job key) creates a new row and clears
/// `latest` on the prior one, rather than overwriting it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub source: SourceKey,
    pub builder_id: BuilderId,
    pub status: JobStatus,
    pub latest: bool,
}

/// How a builder's match pattern should be interpreted.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum PatternKind {
    Glob,
    Regex,
}

/// A builder registration record, as tracked by the builder registry.
///
/// This is the static, serializable half of a builder's identity — the
/// executable `plan_jobs`/`run_job` capability functions live beside this in
/// `kiln::builder::BuilderDescriptor`, which isn't representable in this
/// wire-agnostic crate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuilderRegistration {
    pub id: BuilderId,
    pub name: String,
    pub patterns: Vec<(String, PatternKind)>,
    pub version: String,
    pub priority: i32,
    pub critical: bool,
    pub test_for_exclusive_lock: bool,
}

/// What a builder's `plan_jobs` capability reports.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PlanJobsOutcome {
    Success(Vec<JobDescriptor>),
    Failed,
    ShuttingDown,
}

/// A single job a builder wants run for a source, as emitted by `plan_jobs`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub platform: PlatformId,
    pub job_key: String,
    pub priority: i32,
    pub critical: bool,
    pub check_exclusive_lock: bool,
    pub extra_fingerprint_info: Vec<u8>,
    pub params: serde_json::Value,
}

/// What a builder's `run_job` capability reports.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RunJobOutcome {
    Success(Vec<String>),
    Failed,
    Crashed,
    Cancelled,
}

/// Lightweight enumerated status, as returned by the `status request` RPC.
#[derive(
    Copy, Clone, Eq, PartialEq, Hash, Debug, StrumDisplay, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
pub enum AssetStatus {
    Unknown,
    Queued,
    InProgress,
    Compiled,
    Missing,
}

/// Request/response pair: derive an asset id from an arbitrary path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssetIdRequest {
    pub input: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssetIdResponse {
    pub success: bool,
    pub id: String,
}

/// Request/response pair: derive a full path from an asset id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FullPathRequest {
    pub asset_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FullPathResponse {
    pub success: bool,
    pub path: String,
}

/// A projection of a [`JobRecord`] suitable for the wire, merging
/// in-memory scheduler state with store history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobInfoProjection {
    pub job_id: JobId,
    pub source: String,
    pub builder_id: BuilderId,
    pub platform: PlatformId,
    pub job_key: String,
    pub status: JobStatus,
}

/// Request/response pair: job info for a source path. Fenced.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobInfoRequest {
    pub source: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobInfoResponse {
    pub success: bool,
    pub jobs: Vec<JobInfoProjection>,
}

/// Request/response pair: job log contents for a job id. Fenced.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobLogRequest {
    pub job_id: JobId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobLogResponse {
    pub success: bool,
    pub log: Vec<u8>,
    pub error: Option<String>,
}

/// Request/response pair: does this asset/source exist.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssetExistsRequest {
    pub input: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssetExistsResponse {
    pub exists: bool,
}

/// Request/response pair: lightweight status lookup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusRequest {
    pub input: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: AssetStatus,
}

/// Handshake negotiation payload a client presents before issuing requests.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NegotiationRequest {
    pub identifier: String,
    pub process_id: String,
    pub branch_token: String,
    pub api_version: u32,
    pub platform: String,
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, StrumDisplay, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
pub enum NegotiationFailure {
    IdentifiesAsSelf,
    BranchTokenMismatch,
    ApiVersionMismatch,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NegotiationResponse {
    pub accepted: bool,
    pub failure: Option<NegotiationFailure>,
}

/// Outbound notification: a watched source file changed or was removed.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum SourceNotificationKind {
    FileChanged,
    FileRemoved,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceFileNotification {
    pub relpath: String,
    pub scanfolder: String,
    pub kind: SourceNotificationKind,
}

/// Outbound notification: a published asset changed or was removed.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum AssetNotificationKind {
    AssetChanged,
    AssetRemoved,
    AssetFailed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssetNotification {
    pub relpath: String,
    pub kind: AssetNotificationKind,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fingerprint_sentinels_round_trip() {
        assert_eq!(Fingerprint::from(0), Fingerprint::Absent);
        assert_eq!(Fingerprint::from(1), Fingerprint::Failed);
        assert_eq!(Fingerprint::from(42), Fingerprint::Value(42));
        assert_eq!(u32::from(Fingerprint::Absent), 0);
        assert_eq!(u32::from(Fingerprint::Failed), 1);
        assert_eq!(u32::from(Fingerprint::Value(42)), 42);
    }

    #[test]
    fn source_key_case_insensitive_eq_preserves_casing() {
        let a = SourceKey::new("Foo/Bar.txt", PlatformId::new("pc"), "default");
        let b = SourceKey::new("foo/bar.txt", PlatformId::new("pc"), "default");
        assert_eq!(a, b);
        assert_eq!(a.source(), "Foo/Bar.txt");
        assert_eq!(b.source(), "foo/bar.txt");
    }

    #[test]
    fn source_key_differs_by_platform_or_job_key() {
        let a = SourceKey::new("foo.txt", PlatformId::new("pc"), "default");
        let b = SourceKey::new("foo.txt", PlatformId::new("es3"), "default");
        let c = SourceKey::new("foo.txt", PlatformId::new("pc"), "other");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn job_id_seed_is_negative_one() {
        assert_eq!(JobId::SEED, -1);
    }
}
