//! The path resolver (C1).
//!
//! Normalizes paths, maps between absolute and scan-folder-relative forms,
//! applies scan-folder override precedence, and resolves metadata-file
//! aliases back to the source file they describe. This module owns no
//! mutable state beyond its configuration — the scan folder list, the
//! exclude list, and the metadata-suffix list are all fixed at construction
//! time and reloaded wholesale on a config change, never mutated in place.

use color_eyre::Result;
use tracing::{instrument, warn};

use crate::{
    fs,
    path::{AbsDirPath, AbsFilePath, JoinWith as _, RelFilePath, RelativeTo as _},
    pattern::CompiledPattern,
};

/// A configured scan folder: a root directory that contributes sources.
///
/// `output_prefix` rewrites a scan folder's relative source path under a
/// different prefix in the cache tree than its on-disk path (§11
/// "Scan-folder-scoped output prefixes"); `None` means the relative path is
/// used unchanged.
#[derive(Clone, Debug)]
pub struct ScanFolder {
    pub root: AbsDirPath,
    pub output_prefix: Option<String>,
    pub recursive: bool,
    pub order: i32,
    registration_index: usize,
}

impl ScanFolder {
    pub fn new(root: AbsDirPath, output_prefix: Option<String>, recursive: bool, order: i32) -> Self {
        Self {
            root,
            output_prefix,
            recursive,
            order,
            registration_index: 0,
        }
    }

    /// The relative path a product should be written under, given the
    /// relative path of its source inside this scan folder.
    pub fn rewrite_for_output(&self, rel: &str) -> String {
        match &self.output_prefix {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}/{rel}"),
            _ => rel.to_string(),
        }
    }
}

/// Resolves paths against a fixed set of scan folders, an exclude list, and
/// a metadata-suffix list.
#[derive(Clone, Debug)]
pub struct PathResolver {
    scan_folders: Vec<ScanFolder>,
    excludes: Vec<CompiledPattern>,
    metadata_suffixes: Vec<String>,
}

impl PathResolver {
    /// Build a resolver. Scan folders are sorted ascending by `(order,
    /// registration order)` per §4.1's ordering rule: lower `order` wins,
    /// ties broken by the order folders were registered in.
    pub fn new(
        scan_folders: impl IntoIterator<Item = ScanFolder>,
        excludes: Vec<CompiledPattern>,
        metadata_suffixes: Vec<String>,
    ) -> Self {
        let mut scan_folders: Vec<ScanFolder> = scan_folders
            .into_iter()
            .enumerate()
            .map(|(i, mut folder)| {
                folder.registration_index = i;
                folder
            })
            .collect();
        scan_folders.sort_by(|a, b| {
            a.order
                .cmp(&b.order)
                .then(a.registration_index.cmp(&b.registration_index))
        });
        Self {
            scan_folders,
            excludes,
            metadata_suffixes,
        }
    }

    pub fn scan_folders(&self) -> &[ScanFolder] {
        &self.scan_folders
    }

    /// Normalize a path string: forward slashes only. No `..` collapsing,
    /// no case change — see §4.1.
    pub fn normalize(path: &str) -> String {
        path.replace('\\', "/")
    }

    /// Find the scan folder that owns the given absolute path, and the
    /// source path relative to it.
    ///
    /// A non-recursive scan folder only owns its immediate children; a file
    /// nested deeper is reported as not living under it.
    #[instrument(skip(self))]
    pub fn to_relative(&self, abs: &AbsFilePath) -> Option<(RelFilePath, &ScanFolder)> {
        for folder in &self.scan_folders {
            let Ok(rel) = abs.relative_to(&folder.root) else {
                continue;
            };
            if !folder.recursive && rel.components().count() > 1 {
                continue;
            }
            return Some((rel, folder));
        }
        None
    }

    /// Walk scan folders in ascending precedence order, returning the first
    /// absolute path that exists on disk for `relpath`.
    #[instrument(skip(self))]
    pub async fn find_active_source(&self, relpath: &RelFilePath) -> Option<AbsFilePath> {
        for folder in &self.scan_folders {
            if !folder.recursive && relpath.components().count() > 1 {
                continue;
            }
            let candidate = folder.root.join(relpath);
            if candidate.exists().await {
                return Some(candidate);
            }
        }
        None
    }

    /// Return a higher-precedence file that shadows `relpath` as owned by
    /// `owning`, or `None` if no such override exists.
    ///
    /// Higher precedence means a strictly earlier position in the sorted
    /// scan-folder list (lower `order`, or same `order` registered earlier).
    #[instrument(skip(self))]
    pub async fn find_override(
        &self,
        relpath: &RelFilePath,
        owning: &ScanFolder,
    ) -> Option<AbsFilePath> {
        for folder in &self.scan_folders {
            if folder.registration_index == owning.registration_index && folder.order == owning.order {
                break;
            }
            if !folder.recursive && relpath.components().count() > 1 {
                continue;
            }
            let candidate = folder.root.join(relpath);
            if candidate.exists().await {
                return Some(candidate);
            }
        }
        None
    }

    /// Apply the exclude-pattern list to an absolute path.
    ///
    /// Patterns are matched against the path relative to whichever scan
    /// folder owns it (falling back to the bare file name for paths outside
    /// every scan folder, e.g. the cache tree), not the full absolute path —
    /// a pattern like `*.tmp` is written to exclude any file named `*.tmp`
    /// regardless of which machine's absolute scan-folder root it sits
    /// under.
    pub fn is_excluded(&self, abs: &AbsFilePath) -> bool {
        let candidate = match self.to_relative(abs) {
            Some((rel, _)) => rel.as_str_lossy().into_owned(),
            None => abs
                .file_name_str_lossy()
                .map(|name| name.into_owned())
                .unwrap_or_else(|| abs.as_str_lossy().into_owned()),
        };
        self.excludes.iter().any(|pattern| pattern.is_match(&candidate))
    }

    /// If `path` ends with a registered metadata suffix, rewrite it to the
    /// underlying source file, using the directory's actual on-disk casing.
    ///
    /// Returns `Ok(None)` both when the path isn't a metadata alias and
    /// (after logging a warning) when the underlying file doesn't exist —
    /// callers are expected to drop the event in both cases, per §4.1.
    #[instrument(skip(self))]
    pub async fn metadata_resolve(&self, path: &AbsFilePath) -> Result<Option<AbsFilePath>> {
        let candidate = path.as_str_lossy().to_string();
        let lower = candidate.to_lowercase();
        let Some(suffix) = self
            .metadata_suffixes
            .iter()
            .find(|suffix| lower.ends_with(&suffix.to_lowercase()))
        else {
            return Ok(None);
        };

        let underlying_str = &candidate[..candidate.len() - suffix.len()];
        let Ok(underlying) = AbsFilePath::try_from(underlying_str) else {
            warn!(?path, "metadata alias did not resolve to a valid path");
            return Ok(None);
        };

        match real_case(&underlying).await {
            Ok(Some(real)) => Ok(Some(real)),
            Ok(None) => {
                warn!(?path, ?underlying, "metadata alias has no underlying source file");
                Ok(None)
            }
            Err(err) => {
                warn!(?path, ?err, "failed to resolve metadata alias casing");
                Ok(None)
            }
        }
    }
}

/// Find the actual on-disk casing of `path`'s final component, by scanning
/// its parent directory. Other components are assumed to already be
/// correctly cased (they came from a scan folder root we control).
async fn real_case(path: &AbsFilePath) -> Result<Option<AbsFilePath>> {
    let Some(parent) = path.parent() else {
        return Ok(if path.exists().await { Some(path.clone()) } else { None });
    };
    let Some(wanted) = path.file_name_str_lossy() else {
        return Ok(None);
    };
    let wanted_lower = wanted.to_lowercase();

    let mut entries = match fs::read_dir(&parent).await {
        Ok(entries) => entries,
        Err(_) => return Ok(None),
    };
    while let Some(entry) = entries.next_entry().await.unwrap_or(None) {
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if name_str.to_lowercase() == wanted_lower {
            return Ok(Some(parent.join(RelFilePath::try_from(name_str.as_ref())?)));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_protocol::PatternKind;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn abs_dir(path: &std::path::Path) -> AbsDirPath {
        AbsDirPath::try_from(path.to_path_buf()).unwrap()
    }

    #[tokio::test]
    async fn override_reveals_lower_precedence_file_when_higher_is_deleted() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        tokio::fs::create_dir_all(&a).await.unwrap();
        tokio::fs::create_dir_all(&b).await.unwrap();
        tokio::fs::write(a.join("foo.txt"), b"from a").await.unwrap();
        tokio::fs::write(b.join("foo.txt"), b"from b").await.unwrap();

        let resolver = PathResolver::new(
            vec![
                ScanFolder::new(abs_dir(&a), None, true, -1),
                ScanFolder::new(abs_dir(&b), None, true, -2),
            ],
            vec![],
            vec![],
        );

        let relpath = RelFilePath::try_from("foo.txt").unwrap();
        // b has lower `order` (-2 < -1) so it's higher precedence and wins.
        let active = resolver.find_active_source(&relpath).await.unwrap();
        assert_eq!(active, abs_dir(&b).join(relpath.clone()));

        let owning_b = resolver
            .scan_folders()
            .iter()
            .find(|f| f.order == -2)
            .unwrap()
            .clone();
        tokio::fs::remove_file(b.join("foo.txt")).await.unwrap();
        let revealed = resolver.find_override(&relpath, &owning_b).await;
        assert_eq!(revealed, Some(abs_dir(&a).join(relpath)));
    }

    #[test]
    fn exclude_pattern_matches() {
        let resolver = PathResolver::new(
            vec![],
            vec![CompiledPattern::compile("*.tmp", PatternKind::Glob).unwrap()],
            vec![],
        );
        let excluded = AbsFilePath::try_from("/scan/foo.tmp").unwrap();
        let kept = AbsFilePath::try_from("/scan/foo.txt").unwrap();
        assert!(resolver.is_excluded(&excluded));
        assert!(!resolver.is_excluded(&kept));
    }

    #[test]
    fn non_recursive_folder_rejects_nested_paths() {
        let dir = tempdir().unwrap();
        let resolver = PathResolver::new(
            vec![ScanFolder::new(abs_dir(dir.path()), None, false, 0)],
            vec![],
            vec![],
        );
        let nested = dir.path().join("sub").join("foo.txt");
        let abs = AbsFilePath::try_from(nested).unwrap();
        assert!(resolver.to_relative(&abs).is_none());
    }

    #[test]
    fn output_prefix_rewrites_cache_relative_path() {
        let folder = ScanFolder::new(
            AbsDirPath::try_from("/scan").unwrap(),
            Some("gamedata".to_string()),
            true,
            0,
        );
        assert_eq!(folder.rewrite_for_output("foo/bar.txt"), "gamedata/foo/bar.txt");

        let default_folder = ScanFolder::new(AbsDirPath::try_from("/scan").unwrap(), None, true, 0);
        assert_eq!(default_folder.rewrite_for_output("foo/bar.txt"), "foo/bar.txt");
    }
}
