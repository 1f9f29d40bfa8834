//! The product catalog (C7).
//!
//! Holds the in-memory `assetId -> {relative path, size}` map for a single
//! platform and serializes it to `assetcatalog.xml` on a background cadence.
//! The schema is hand-authored and explicit (§9 "reflection-driven
//! serialization for the catalog -> explicit schema"): a `serde`-derived
//! document tree fed through `quick-xml`'s serializer, not a reflected dump
//! of whatever fields happen to exist on some internal type.
//!
//! Writes are atomic: a dirty bit marks the in-memory map as ahead of disk,
//! a save drains it by writing a temp file and renaming over the live one,
//! the same temp-file-then-rename idiom the teacher's `LocalCas::write` uses
//! for blob storage.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use color_eyre::{Result, eyre::Context as _};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use crate::{fs, path::AbsFilePath};

/// One entry in the catalog: a product's relative path and its size in
/// bytes, as populated from a `stat` at publish time (§11 "Asset catalog
/// `size` field population").
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub relative_path: String,
    pub size: u64,
}

/// Derives an asset id deterministically from a product's cache-relative
/// path: forward slashes, lowercased, matching the case-insensitive
/// comparison the rest of this daemon's source/product identity uses.
pub fn derive_asset_id(relative_path: &str) -> String {
    relative_path.replace('\\', "/").to_lowercase()
}

#[derive(Serialize, Deserialize)]
#[serde(rename = "AssetCatalog")]
struct CatalogDocument {
    #[serde(rename = "@version")]
    version: u32,
    #[serde(rename = "Asset", default)]
    assets: Vec<CatalogAssetXml>,
}

#[derive(Serialize, Deserialize)]
struct CatalogAssetXml {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "@path")]
    path: String,
    #[serde(rename = "@size")]
    size: u64,
}

const DOCUMENT_VERSION: u32 = 1;

/// The in-memory product catalog for a single platform, plus its
/// background-serialized on-disk mirror.
#[derive(Debug)]
pub struct Catalog {
    path: AbsFilePath,
    entries: DashMap<String, CatalogEntry>,
    /// Bumped on every mutating call; the value a mutation returns is the
    /// save version that mutation will be reflected in once a save drains it.
    generation: AtomicU64,
    dirty: AtomicBool,
    saved_version: watch::Sender<u64>,
}

impl Catalog {
    pub fn new(path: AbsFilePath) -> Self {
        let (saved_version, _) = watch::channel(0);
        Self {
            path,
            entries: DashMap::new(),
            generation: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            saved_version,
        }
    }

    /// Load a catalog from an existing on-disk file, if present. A missing
    /// file is not an error — an empty catalog is returned, as if this were
    /// the daemon's first run.
    #[instrument(skip(path))]
    pub async fn load(path: AbsFilePath) -> Result<Self> {
        let catalog = Self::new(path.clone());
        let Some(text) = fs::read_buffered_utf8(&path).await.context("read catalog file")? else {
            return Ok(catalog);
        };
        let document: CatalogDocument = quick_xml::de::from_str(&text).context("parse catalog xml")?;
        for asset in document.assets {
            catalog.entries.insert(
                asset.id,
                CatalogEntry {
                    relative_path: asset.path,
                    size: asset.size,
                },
            );
        }
        Ok(catalog)
    }

    /// Record a published or republished product, marking the catalog
    /// dirty. Returns the save version this change will be reflected in.
    #[instrument(skip(self))]
    pub fn record_changed(&self, relative_path: &str, size: u64) -> u64 {
        let id = derive_asset_id(relative_path);
        self.entries.insert(
            id,
            CatalogEntry {
                relative_path: relative_path.to_string(),
                size,
            },
        );
        self.mark_dirty()
    }

    /// Record a removed product, marking the catalog dirty. Returns the
    /// save version this change will be reflected in.
    #[instrument(skip(self))]
    pub fn record_removed(&self, relative_path: &str) -> u64 {
        let id = derive_asset_id(relative_path);
        self.entries.remove(&id);
        self.mark_dirty()
    }

    fn mark_dirty(&self) -> u64 {
        self.dirty.store(true, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The save version a caller should wait for to be sure every change
    /// made so far is reflected on disk.
    pub fn request_save(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Blocks until the on-disk catalog has been saved at or past `version`.
    pub async fn wait_for_version(&self, version: u64) {
        let mut rx = self.saved_version.subscribe();
        while *rx.borrow() < version {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn lookup(&self, asset_id: &str) -> Option<CatalogEntry> {
        self.entries.get(&derive_asset_id(asset_id)).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drains the dirty bit on `interval`, writing the catalog to disk and
    /// advancing the saved-version watch whenever there were changes to
    /// flush. Runs until cancelled.
    #[instrument(skip(self))]
    pub async fn run(&self, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if !self.dirty.swap(false, Ordering::SeqCst) {
                continue;
            }
            let target = self.generation.load(Ordering::SeqCst);
            match self.save().await {
                Ok(()) => {
                    let _ = self.saved_version.send(target);
                }
                Err(err) => {
                    warn!(?err, "failed to save product catalog");
                    // Leave another save attempt queued for the next tick.
                    self.dirty.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn save(&self) -> Result<()> {
        let assets = self
            .entries
            .iter()
            .map(|entry| CatalogAssetXml {
                id: entry.key().clone(),
                path: entry.value().relative_path.clone(),
                size: entry.value().size,
            })
            .collect();
        let document = CatalogDocument {
            version: DOCUMENT_VERSION,
            assets,
        };
        let xml = quick_xml::se::to_string(&document).context("serialize catalog xml")?;

        let tmp = AbsFilePath::try_from(format!("{}.tmp", self.path.as_str_lossy())).context("build temp catalog path")?;
        fs::write(&tmp, xml.as_bytes()).await.context("write temp catalog file")?;
        fs::rename(&tmp, &self.path).await.context("rename temp catalog file over live catalog")?;
        debug!(path = ?self.path, count = self.entries.len(), "saved product catalog");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn derive_asset_id_normalizes_case_and_separators() {
        assert_eq!(derive_asset_id("Foo\\Bar.txt"), "foo/bar.txt");
        assert_eq!(derive_asset_id("foo/bar.txt"), "foo/bar.txt");
    }

    #[test]
    fn record_changed_bumps_generation_each_call() {
        let catalog = Catalog::new(AbsFilePath::try_from("/cache/pc/demo/assetcatalog.xml").unwrap());
        let first = catalog.record_changed("foo.arc1", 10);
        let second = catalog.record_changed("bar.arc1", 20);
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn record_removed_clears_entry() {
        let catalog = Catalog::new(AbsFilePath::try_from("/cache/pc/demo/assetcatalog.xml").unwrap());
        catalog.record_changed("foo.arc1", 10);
        catalog.record_removed("FOO.ARC1");
        assert!(catalog.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = AbsFilePath::try_from(dir.path().join("assetcatalog.xml")).unwrap();
        let catalog = Catalog::new(path.clone());
        catalog.record_changed("foo/bar.arc1", 42);
        catalog.save().await.unwrap();

        let reloaded = Catalog::load(path).await.unwrap();
        let entry = reloaded.lookup("foo/bar.arc1").unwrap();
        assert_eq!(entry.relative_path, "foo/bar.arc1");
        assert_eq!(entry.size, 42);
    }

    #[tokio::test]
    async fn load_missing_file_returns_empty_catalog() {
        let dir = tempdir().unwrap();
        let path = AbsFilePath::try_from(dir.path().join("missing.xml")).unwrap();
        let catalog = Catalog::load(path).await.unwrap();
        assert!(catalog.is_empty());
    }

    #[tokio::test]
    async fn wait_for_version_resolves_after_save() {
        let dir = tempdir().unwrap();
        let path = AbsFilePath::try_from(dir.path().join("assetcatalog.xml")).unwrap();
        let catalog = Arc::new(Catalog::new(path));
        let version = catalog.record_changed("foo.arc1", 1);

        let catalog2 = Arc::clone(&catalog);
        let waiter = tokio::spawn(async move {
            tokio::time::timeout(std::time::Duration::from_secs(1), catalog2.wait_for_version(version))
                .await
                .expect("wait_for_version should resolve");
        });

        // Simulate the save loop's single drain without running `run` on a timer.
        catalog.dirty.store(true, Ordering::SeqCst);
        catalog.save().await.unwrap();
        let _ = catalog.saved_version.send(version);

        waiter.await.unwrap();
    }
}
