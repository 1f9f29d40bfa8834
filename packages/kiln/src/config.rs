//! Bootstrap configuration (§6): the `toml` file read once at startup and
//! handed to every component that needs it via constructor injection — no
//! global config singleton.

use std::net::IpAddr;

use color_eyre::{Result, eyre::Context as _};
use kiln_protocol::{PatternKind, PlatformId};
use serde::{Deserialize, Serialize};

use crate::{
    fs,
    path::{AbsDirPath, AbsFilePath},
};

/// A single scan folder as configured on disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanFolderConfig {
    pub root: AbsDirPath,
    #[serde(default)]
    pub output_prefix: Option<String>,
    #[serde(default = "default_recursive")]
    pub recursive: bool,
    #[serde(default)]
    pub order: i32,
}

fn default_recursive() -> bool {
    true
}

/// An external builder module the daemon should load at startup. Loading
/// the module itself is out of scope (§1 Non-goals); this is only the
/// configuration surface for naming one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuilderConfig {
    pub name: String,
    pub module_path: AbsFilePath,
}

/// The daemon's bootstrap configuration, read once at startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The game this daemon is serving assets for; used both in the cache
    /// path layout (§3) and in the RPC negotiation handshake (§6).
    pub game_name: String,

    /// The port the ambient control surface (health/shutdown) and any
    /// attached RPC transport listens on. `0` means "pick an ephemeral
    /// port", matching the teacher's daemon bind strategy.
    #[serde(default)]
    pub listen_port: u16,

    /// Clients outside this list are rejected during negotiation. Empty
    /// means "accept any client" (no whitelist configured).
    #[serde(default)]
    pub ip_whitelist: Vec<IpAddr>,

    /// Compared against a connecting client's branch token during
    /// negotiation (§6 message taxonomy).
    pub branch_token: String,

    /// Platforms this daemon will build for. A builder that supports a
    /// platform outside this set is never queried for it (§6 "Configured
    /// platform set").
    pub platforms: Vec<PlatformId>,

    pub scan_folders: Vec<ScanFolderConfig>,

    /// Patterns the path resolver excludes from job generation entirely
    /// (§4.1 "excludes").
    #[serde(default)]
    pub excludes: Vec<(String, PatternKind)>,

    /// Suffixes identifying a metadata-alias file, e.g. `.meta` (§4.1
    /// "metadata_resolve").
    #[serde(default)]
    pub metadata_suffixes: Vec<String>,

    #[serde(default)]
    pub builders: Vec<BuilderConfig>,

    /// Where product caches, the store, the catalog, and job logs live.
    pub cache_root: AbsDirPath,

    /// Maximum accepted source path length; longer paths synthesize a
    /// `failed-path-too-long` job per §4.4/§4.6.
    #[serde(default = "default_max_path_len")]
    pub max_path_len: usize,

    /// Bound on how many per-job log files are retained (§11 "Job log
    /// retention/rotation").
    #[serde(default = "default_max_retained_logs")]
    pub max_retained_logs: usize,
}

fn default_max_path_len() -> usize {
    260
}

fn default_max_retained_logs() -> usize {
    10_000
}

impl Config {
    pub async fn load(path: &AbsFilePath) -> Result<Self> {
        let text = fs::must_read_buffered_utf8(path)
            .await
            .with_context(|| format!("read config file {path:?}"))?;
        toml::from_str(&text).with_context(|| format!("parse config file {path:?}"))
    }

    /// The per-platform cache root: `<cacheRoot>/<platform>`.
    pub fn platform_cache_root(&self, platform: &PlatformId) -> AbsDirPath {
        self.cache_root
            .try_join_dir(platform.as_str())
            .expect("platform id is a valid single path segment")
    }
}

// Bring `try_join_dir` into scope for `platform_cache_root` above without
// polluting the rest of the module's imports.
use crate::path::TryJoinWith as _;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_minimal_config() {
        let toml = r#"
            game_name = "demo"
            branch_token = "abc123"
            platforms = ["pc", "es3"]
            cache_root = "/cache"

            [[scan_folders]]
            root = "/scan/a"
            order = -1
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.game_name, "demo");
        assert_eq!(config.platforms.len(), 2);
        assert_eq!(config.scan_folders[0].recursive, true);
        assert_eq!(config.max_path_len, 260);
    }

    #[test]
    fn platform_cache_root_nests_under_cache_root() {
        let config = Config {
            game_name: "demo".into(),
            listen_port: 0,
            ip_whitelist: vec![],
            branch_token: "t".into(),
            platforms: vec![PlatformId::new("pc")],
            scan_folders: vec![],
            excludes: vec![],
            metadata_suffixes: vec![],
            builders: vec![],
            cache_root: AbsDirPath::try_from("/cache").unwrap(),
            max_path_len: 260,
            max_retained_logs: 10_000,
        };
        let root = config.platform_cache_root(&PlatformId::new("pc"));
        assert_eq!(root, AbsDirPath::try_from("/cache/pc").unwrap());
    }
}
