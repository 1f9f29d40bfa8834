//! Per-job log storage (§6 on-disk layout, §11 "Job log retention/rotation").
//!
//! One log file per job, named deterministically from `(jobId, source,
//! platform, builderId, jobKey)` so a file can be located from just the job
//! id without an auxiliary index. Nothing in the original source bounded how
//! many of these accumulate; we add a bounded LRU-by-job-id eviction so a
//! long-lived daemon's log directory doesn't grow without limit, configured
//! by `Config::max_retained_logs`.

use color_eyre::{Result, eyre::Context as _};
use kiln_protocol::{BuilderId, JobId, PlatformId};
use tracing::{instrument, warn};

use crate::{
    fs,
    path::{AbsDirPath, AbsFilePath, JoinWith as _, RelFilePath, TryJoinWith as _},
};

/// Replaces path separators and other characters that would otherwise split
/// a single deterministic filename across directories or collide across
/// platforms.
fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == ':' { '_' } else { c })
        .collect()
}

/// The deterministic file name for one job's log, zero-padded on the job id
/// so a plain lexicographic directory listing sorts oldest-first.
fn log_file_name(job_id: JobId, source: &str, platform: &PlatformId, builder_id: BuilderId, job_key: &str) -> String {
    format!(
        "{:020}__{}__{}__{}__{}.log",
        job_id.0,
        sanitize(source),
        sanitize(platform.as_str()),
        builder_id,
        sanitize(job_key),
    )
}

/// Manages the per-job log directory: writing, reading, and bounded
/// eviction of old log files.
#[derive(Clone, Debug)]
pub struct JobLog {
    dir: AbsDirPath,
    max_retained: usize,
}

impl JobLog {
    pub fn new(dir: AbsDirPath, max_retained: usize) -> Self {
        Self { dir, max_retained }
    }

    fn path_for(&self, job_id: JobId, source: &str, platform: &PlatformId, builder_id: BuilderId, job_key: &str) -> Result<AbsFilePath> {
        let name = log_file_name(job_id, source, platform, builder_id, job_key);
        self.dir.try_join_file(name)
    }

    /// Writes a job's log content, creating the log directory if needed,
    /// then evicts old logs past `max_retained`.
    #[instrument(skip(self, content))]
    pub async fn write(
        &self,
        job_id: JobId,
        source: &str,
        platform: &PlatformId,
        builder_id: BuilderId,
        job_key: &str,
        content: &[u8],
    ) -> Result<AbsFilePath> {
        fs::create_dir_all(&self.dir).await.context("create job log directory")?;
        let path = self.path_for(job_id, source, platform, builder_id, job_key)?;
        fs::write(&path, content).await.context("write job log")?;
        if let Err(err) = self.evict_excess().await {
            warn!(?err, "job log eviction failed");
        }
        Ok(path)
    }

    /// Reads a job's log content by id alone, locating the file by its
    /// zero-padded job-id prefix. Returns `None` if no log was ever written
    /// for this job (e.g. it failed before a builder ran, per §4.8's
    /// path-too-long case, which the RPC handler reports with a distinct
    /// message instead of attempting this lookup).
    #[instrument(skip(self))]
    pub async fn read(&self, job_id: JobId) -> Result<Option<Vec<u8>>> {
        let prefix = format!("{:020}__", job_id.0);
        let Ok(mut entries) = fs::read_dir(&self.dir).await else {
            return Ok(None);
        };
        while let Some(entry) = entries.next_entry().await.context("read job log directory entry")? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) {
                let path = self.dir.join(RelFilePath::try_from(name.as_ref())?);
                return fs::read_buffered(&path).await.context("read job log file");
            }
        }
        Ok(None)
    }

    /// Deletes the oldest log files (lowest job id, via the zero-padded
    /// prefix's lexicographic order) until the directory holds at most
    /// `max_retained` entries.
    async fn evict_excess(&self) -> Result<()> {
        let mut names = Vec::new();
        let Ok(mut entries) = fs::read_dir(&self.dir).await else {
            return Ok(());
        };
        while let Some(entry) = entries.next_entry().await.context("read job log directory entry")? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        if names.len() <= self.max_retained {
            return Ok(());
        }
        names.sort();
        let excess = names.len() - self.max_retained;
        for name in names.into_iter().take(excess) {
            let path = self.dir.join(RelFilePath::try_from(name.as_str())?);
            if let Err(err) = fs::remove_file(&path).await {
                warn!(?err, ?path, "failed to evict old job log");
            }
        }
        Ok(())
    }
}
