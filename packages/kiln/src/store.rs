//! The fingerprint/product store (C2).
//!
//! A durable `rusqlite`-backed key-value store mapping `(source, platform,
//! job key)` to `(fingerprint, product list)`, plus an append-only job
//! history with a `latest` flag. Grounded directly on the teacher's
//! `cache/local/metadata.rs` (`Connection`, `execute_batch` schema setup,
//! prepared statements, `params!`), generalized from a single `saved_units`
//! table to the three tables §4.2 requires.
//!
//! Workers never touch this module directly (§5): the scheduler's
//! completion handler is the sole writer. Every public method here runs the
//! blocking `rusqlite` call on a blocking thread via `spawn_blocking`,
//! serialized through a `std::sync::Mutex` around the connection — matching
//! this crate's existing convention (see `fs::LockFile`) of keeping
//! synchronous, blocking-capable code off the async executor's threads.

use std::{path::Path, sync::Arc};

use color_eyre::{
    Result,
    eyre::{Context as _, bail},
};
use kiln_protocol::{BuilderId, Fingerprint, JobId, JobRecord, JobStatus, PlatformId, SourceKey};
use rusqlite::{Connection, OptionalExtension as _, params};
use tokio::{sync::Mutex as AsyncMutex, task::spawn_blocking};
use tracing::{debug, instrument};

/// The current on-disk schema version. Bump this and extend
/// [`migrate`] when the schema changes; existing stores are upgraded
/// in place where possible, dropped and recreated otherwise.
const SCHEMA_VERSION: i64 = 1;

/// The escape character used by [`Store::find_products_by_prefix`] and
/// [`Store::find_sources_by_prefix`] to neutralize `%`/`_` in caller input
/// before appending the trailing wildcard. Chosen because it's not legal in
/// filesystem paths on any platform this daemon targets.
const LIKE_ESCAPE: char = '|';

/// The three-way answer to "what products does this source have".
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProductsAnswer {
    /// The source has no recorded fingerprint at all.
    UnknownSource,
    /// The source is known but currently has no products.
    Known(Vec<String>),
}

#[derive(Clone, Debug)]
pub struct Store {
    conn: Arc<AsyncMutex<Connection>>,
}

impl Store {
    #[instrument(name = "Store::open", skip(path))]
    pub async fn open(path: impl AsRef<Path> + Send + 'static) -> Result<Self> {
        let conn = spawn_blocking(move || -> Result<Connection> {
            let path = path.as_ref();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create store directory {parent:?}"))?;
            }
            let conn = Connection::open(path).with_context(|| format!("open store at {path:?}"))?;
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")
                .context("set pragmas")?;
            migrate(&conn)?;
            Ok(conn)
        })
        .await
        .context("join task")??;

        Ok(Self {
            conn: Arc::new(AsyncMutex::new(conn)),
        })
    }

    /// An ephemeral store backed by SQLite's `:memory:` mode, useful for
    /// tests that don't care about persistence across restarts.
    pub async fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory store")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;").context("set pragmas")?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(AsyncMutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .context("join task")?
    }

    #[instrument(skip(self))]
    pub async fn get_fingerprint(&self, key: &SourceKey) -> Result<Fingerprint> {
        let key = key.clone();
        self.with_conn(move |conn| get_fingerprint_sync(conn, &key)).await
    }

    /// Upserts a fingerprint. Setting to [`Fingerprint::Absent`] is a no-op
    /// when the source isn't recorded, and cascades like
    /// [`Store::clear_fingerprint`] when it is.
    #[instrument(skip(self))]
    pub async fn set_fingerprint(&self, key: &SourceKey, fingerprint: Fingerprint) -> Result<()> {
        let key = key.clone();
        self.with_conn(move |conn| {
            if fingerprint.is_absent() {
                return clear_fingerprint_sync(conn, &key);
            }
            upsert_fingerprint_sync(conn, &key, fingerprint)
        })
        .await
    }

    /// Cascades: removes the fingerprint, every product, and every
    /// `JobRecord` for this source key (invariant: fingerprint absent iff
    /// no jobs and no products).
    #[instrument(skip(self))]
    pub async fn clear_fingerprint(&self, key: &SourceKey) -> Result<()> {
        let key = key.clone();
        self.with_conn(move |conn| clear_fingerprint_sync(conn, &key)).await
    }

    #[instrument(skip(self))]
    pub async fn get_products(&self, key: &SourceKey) -> Result<ProductsAnswer> {
        let key = key.clone();
        self.with_conn(move |conn| get_products_sync(conn, &key)).await
    }

    /// Replaces the product list for `key` atomically. Rejects the call
    /// (no partial writes) if `key` has no recorded fingerprint.
    #[instrument(skip(self, products))]
    pub async fn set_products(&self, key: &SourceKey, products: Vec<String>) -> Result<()> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().context("begin transaction")?;
            let fingerprint = get_fingerprint_sync(&tx, &key)?;
            if fingerprint.is_absent() {
                bail!("cannot set products for {key}: no fingerprint recorded yet");
            }
            replace_products_sync(&tx, &key, &products)?;
            tx.commit().context("commit transaction")?;
            Ok(())
        })
        .await
    }

    /// Atomically records a job's successful completion: the new
    /// fingerprint, its full product list, and a `Completed` `JobRecord`, all
    /// in one transaction (§4.6 "job completion is a single atomic write").
    #[instrument(skip(self, products))]
    pub async fn complete_job(
        &self,
        job_id: JobId,
        key: &SourceKey,
        builder_id: BuilderId,
        fingerprint: Fingerprint,
        products: Vec<String>,
    ) -> Result<()> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().context("begin transaction")?;
            upsert_fingerprint_sync(&tx, &key, fingerprint)?;
            replace_products_sync(&tx, &key, &products)?;
            record_job_sync(&tx, job_id, &key, builder_id, JobStatus::Completed)?;
            tx.commit().context("commit transaction")?;
            Ok(())
        })
        .await
    }

    /// Atomically records a job's failure: a failed-sentinel fingerprint and
    /// a `JobRecord` carrying `status`, in one transaction. `status` should
    /// be one of `Failed`, `FailedPathTooLong`, or `Cancelled`.
    #[instrument(skip(self))]
    pub async fn fail_job(
        &self,
        job_id: JobId,
        key: &SourceKey,
        builder_id: BuilderId,
        status: JobStatus,
    ) -> Result<()> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().context("begin transaction")?;
            upsert_fingerprint_sync(&tx, &key, Fingerprint::Failed)?;
            record_job_sync(&tx, job_id, &key, builder_id, status)?;
            tx.commit().context("commit transaction")?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn clear_products(&self, key: &SourceKey) -> Result<()> {
        let key = key.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM products WHERE source_lower = ?1 AND platform = ?2 AND job_key = ?3",
                params![key.source().to_lowercase(), key.platform().as_str(), key.job_key()],
            )
            .context("clear products")?;
            Ok(())
        })
        .await
    }

    /// Reverse lookup, scoped to `platform` since the same relative product
    /// path may legitimately be produced by two different platforms (the
    /// physical file lives under `<cacheRoot>/<platform>/...`, so the pair
    /// (platform, product path) — not the path alone — is what's unique).
    #[instrument(skip(self))]
    pub async fn source_of_product(&self, platform: &PlatformId, product: &str) -> Result<Option<SourceKey>> {
        let product = product.to_string();
        let platform = platform.clone();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT s.source_display, p.platform, p.job_key
                 FROM products p
                 JOIN sources s ON s.source_lower = p.source_lower
                              AND s.platform = p.platform
                              AND s.job_key = p.job_key
                 WHERE p.platform = ?1 AND p.product_lower = ?2",
                params![platform.as_str(), product.to_lowercase()],
                |row| {
                    Ok(SourceKey::new(
                        row.get::<_, String>(0)?,
                        PlatformId::new(row.get::<_, String>(1)?),
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .context("lookup source of product")
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn job_descriptions_for(&self, source: &str, platform: &PlatformId) -> Result<Vec<String>> {
        let source = source.to_string();
        let platform = platform.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT DISTINCT job_key FROM jobs
                     WHERE source_lower = ?1 AND platform = ?2 AND latest = 1",
                )
                .context("prepare statement")?;
            let rows = stmt
                .query_map(params![source.to_lowercase(), platform.as_str()], |row| {
                    row.get::<_, String>(0)
                })
                .context("query job descriptions")?;
            rows.collect::<rusqlite::Result<Vec<_>>>().context("collect rows")
        })
        .await
    }

    /// Writes a new `JobRecord` and, in the same transaction, clears
    /// `latest` on any prior record matching `(source, platform, builder,
    /// job key)`.
    #[instrument(skip(self))]
    pub async fn record_job(
        &self,
        job_id: JobId,
        key: &SourceKey,
        builder_id: BuilderId,
        status: JobStatus,
    ) -> Result<()> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().context("begin transaction")?;
            record_job_sync(&tx, job_id, &key, builder_id, status)?;
            tx.commit().context("commit transaction")?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn jobs_for_source(&self, source: &str) -> Result<Vec<JobRecord>> {
        let source = source.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT job_id, source_display, platform, job_key, builder_id, status, latest
                     FROM jobs WHERE source_lower = ?1 AND latest = 1",
                )
                .context("prepare statement")?;
            let rows = stmt
                .query_map(params![source.to_lowercase()], row_to_job_record)
                .context("query jobs for source")?;
            rows.collect::<rusqlite::Result<Vec<_>>>().context("collect rows")
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn job_by_id(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT job_id, source_display, platform, job_key, builder_id, status, latest
                 FROM jobs WHERE job_id = ?1",
                params![job_id.0],
                row_to_job_record,
            )
            .optional()
            .context("lookup job by id")
        })
        .await
    }

    /// Returns the largest job id ever recorded, or `-1` if the store is
    /// empty — used to seed the monotonic counter on restart. Per §9's
    /// flagged open question, this is always `i64`, never the boolean
    /// `false`-as-error-sentinel the original source used.
    #[instrument(skip(self))]
    pub async fn highest_job_id(&self) -> Result<JobId> {
        self.with_conn(|conn| {
            let highest: Option<i64> = conn
                .query_row("SELECT MAX(job_id) FROM jobs", [], |row| row.get(0))
                .context("query highest job id")?;
            Ok(JobId(highest.unwrap_or(JobId::SEED)))
        })
        .await
    }

    /// Reclaims space and refreshes query planner statistics.
    #[instrument(skip(self))]
    pub async fn compact(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch("PRAGMA optimize; ANALYZE;").context("compact store")?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn find_products_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}%", escape_like(&prefix.to_lowercase()));
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT DISTINCT product_display FROM products WHERE product_lower LIKE ?1 ESCAPE '{LIKE_ESCAPE}'"
                ))
                .context("prepare statement")?;
            let rows = stmt
                .query_map(params![pattern], |row| row.get::<_, String>(0))
                .context("query products by prefix")?;
            rows.collect::<rusqlite::Result<Vec<_>>>().context("collect rows")
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn find_sources_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}%", escape_like(&prefix.to_lowercase()));
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT DISTINCT source_display FROM sources WHERE source_lower LIKE ?1 ESCAPE '{LIKE_ESCAPE}'"
                ))
                .context("prepare statement")?;
            let rows = stmt
                .query_map(params![pattern], |row| row.get::<_, String>(0))
                .context("query sources by prefix")?;
            rows.collect::<rusqlite::Result<Vec<_>>>().context("collect rows")
        })
        .await
    }

    /// Delete every source, product, and job record under a relative
    /// directory prefix. Used when a source directory is deleted wholesale
    /// (§4.4 "Deletion of a directory").
    #[instrument(skip(self))]
    pub async fn sources_under_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}/%", escape_like(&prefix.to_lowercase()));
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT DISTINCT source_display FROM sources WHERE source_lower LIKE ?1 ESCAPE '{LIKE_ESCAPE}'"
                ))
                .context("prepare statement")?;
            let rows = stmt
                .query_map(params![pattern], |row| row.get::<_, String>(0))
                .context("query sources under prefix")?;
            rows.collect::<rusqlite::Result<Vec<_>>>().context("collect rows")
        })
        .await
    }

    /// Every distinct source that currently has a product under `prefix`
    /// within `platform`'s cache tree. An empty `prefix` matches the whole
    /// platform. Used when a cache directory is removed in one event rather
    /// than per-file (§4.4 "cache directory deletion of a known folder").
    #[instrument(skip(self))]
    pub async fn sources_with_products_under_prefix(&self, platform: &PlatformId, prefix: &str) -> Result<Vec<SourceKey>> {
        let platform = platform.clone();
        let pattern = if prefix.is_empty() {
            "%".to_string()
        } else {
            format!("{}/%", escape_like(&prefix.to_lowercase()))
        };
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT DISTINCT s.source_display, p.job_key
                     FROM products p
                     JOIN sources s ON s.source_lower = p.source_lower
                                  AND s.platform = p.platform
                                  AND s.job_key = p.job_key
                     WHERE p.platform = ?1 AND p.product_lower LIKE ?2 ESCAPE '{LIKE_ESCAPE}'"
                ))
                .context("prepare statement")?;
            let rows = stmt
                .query_map(params![platform.as_str(), pattern], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .context("query sources with products under prefix")?;
            let pairs = rows.collect::<rusqlite::Result<Vec<_>>>().context("collect rows")?;
            Ok(pairs
                .into_iter()
                .map(|(source, job_key)| SourceKey::new(source, platform.clone(), job_key))
                .collect())
        })
        .await
    }
}

fn get_fingerprint_sync(conn: &Connection, key: &SourceKey) -> Result<Fingerprint> {
    let raw: Option<u32> = conn
        .query_row(
            "SELECT fingerprint FROM sources WHERE source_lower = ?1 AND platform = ?2 AND job_key = ?3",
            params![key.source().to_lowercase(), key.platform().as_str(), key.job_key()],
            |row| row.get(0),
        )
        .optional()
        .context("query fingerprint")?;
    Ok(raw.map(Fingerprint::from).unwrap_or(Fingerprint::Absent))
}

fn upsert_fingerprint_sync(conn: &Connection, key: &SourceKey, fingerprint: Fingerprint) -> Result<()> {
    conn.execute(
        "INSERT INTO sources (source_lower, source_display, platform, job_key, fingerprint)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (source_lower, platform, job_key)
         DO UPDATE SET fingerprint = excluded.fingerprint, source_display = excluded.source_display",
        params![
            key.source().to_lowercase(),
            key.source(),
            key.platform().as_str(),
            key.job_key(),
            u32::from(fingerprint),
        ],
    )
    .context("upsert fingerprint")?;
    Ok(())
}

fn replace_products_sync(conn: &Connection, key: &SourceKey, products: &[String]) -> Result<()> {
    conn.execute(
        "DELETE FROM products WHERE source_lower = ?1 AND platform = ?2 AND job_key = ?3",
        params![key.source().to_lowercase(), key.platform().as_str(), key.job_key()],
    )
    .context("clear prior products")?;
    for product in products {
        conn.execute(
            "INSERT INTO products (source_lower, platform, job_key, product_lower, product_display)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                key.source().to_lowercase(),
                key.platform().as_str(),
                key.job_key(),
                product.to_lowercase(),
                product,
            ],
        )
        .with_context(|| format!("insert product {product:?}"))?;
    }
    Ok(())
}

fn record_job_sync(conn: &Connection, job_id: JobId, key: &SourceKey, builder_id: BuilderId, status: JobStatus) -> Result<()> {
    conn.execute(
        "UPDATE jobs SET latest = 0
         WHERE source_lower = ?1 AND platform = ?2 AND builder_id = ?3 AND job_key = ?4",
        params![
            key.source().to_lowercase(),
            key.platform().as_str(),
            builder_id.to_string(),
            key.job_key(),
        ],
    )
    .context("clear prior latest flag")?;
    conn.execute(
        "INSERT INTO jobs (job_id, source_lower, source_display, platform, job_key, builder_id, status, latest)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)",
        params![
            job_id.0,
            key.source().to_lowercase(),
            key.source(),
            key.platform().as_str(),
            key.job_key(),
            builder_id.to_string(),
            status.to_string(),
        ],
    )
    .context("insert job record")?;
    Ok(())
}

fn clear_fingerprint_sync(conn: &Connection, key: &SourceKey) -> Result<()> {
    let tx = conn.unchecked_transaction().context("begin transaction")?;
    tx.execute(
        "DELETE FROM products WHERE source_lower = ?1 AND platform = ?2 AND job_key = ?3",
        params![key.source().to_lowercase(), key.platform().as_str(), key.job_key()],
    )
    .context("delete products")?;
    tx.execute(
        "DELETE FROM jobs WHERE source_lower = ?1 AND platform = ?2 AND job_key = ?3",
        params![key.source().to_lowercase(), key.platform().as_str(), key.job_key()],
    )
    .context("delete jobs")?;
    tx.execute(
        "DELETE FROM sources WHERE source_lower = ?1 AND platform = ?2 AND job_key = ?3",
        params![key.source().to_lowercase(), key.platform().as_str(), key.job_key()],
    )
    .context("delete source")?;
    tx.commit().context("commit transaction")?;
    Ok(())
}

fn get_products_sync(conn: &Connection, key: &SourceKey) -> Result<ProductsAnswer> {
    let fingerprint = get_fingerprint_sync(conn, key)?;
    if fingerprint.is_absent() {
        return Ok(ProductsAnswer::UnknownSource);
    }
    let mut stmt = conn
        .prepare(
            "SELECT product_display FROM products
             WHERE source_lower = ?1 AND platform = ?2 AND job_key = ?3",
        )
        .context("prepare statement")?;
    let rows = stmt
        .query_map(
            params![key.source().to_lowercase(), key.platform().as_str(), key.job_key()],
            |row| row.get::<_, String>(0),
        )
        .context("query products")?;
    let products = rows.collect::<rusqlite::Result<Vec<_>>>().context("collect rows")?;
    Ok(ProductsAnswer::Known(products))
}

fn row_to_job_record(row: &rusqlite::Row) -> rusqlite::Result<JobRecord> {
    let job_id: i64 = row.get(0)?;
    let source: String = row.get(1)?;
    let platform: String = row.get(2)?;
    let job_key: String = row.get(3)?;
    let builder_id: String = row.get(4)?;
    let status: String = row.get(5)?;
    let latest: bool = row.get(6)?;
    Ok(JobRecord {
        job_id: JobId(job_id),
        source: SourceKey::new(source, PlatformId::new(platform), job_key),
        builder_id: builder_id
            .parse()
            .map(BuilderId)
            .unwrap_or_else(|_| BuilderId(uuid::Uuid::nil())),
        status: status.parse().unwrap_or(JobStatus::Failed),
        latest,
    })
}

fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c == '%' || c == '_' || c == LIKE_ESCAPE {
            out.push(LIKE_ESCAPE);
        }
        out.push(c);
    }
    out
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_meta (id INTEGER PRIMARY KEY CHECK (id = 0), version INTEGER NOT NULL);",
    )
    .context("create schema_meta table")?;

    let version: Option<i64> = conn
        .query_row("SELECT version FROM schema_meta WHERE id = 0", [], |row| row.get(0))
        .optional()
        .context("read schema version")?;

    match version {
        None => {
            create_schema_v1(conn)?;
            conn.execute("INSERT INTO schema_meta (id, version) VALUES (0, ?1)", params![SCHEMA_VERSION])
                .context("record schema version")?;
        }
        Some(v) if v == SCHEMA_VERSION => {
            // Already current; still safe to add any missing tables/indices
            // so an in-place upgrade within the same major version is a
            // no-op rather than an error.
            create_schema_v1(conn)?;
        }
        Some(v) if v < SCHEMA_VERSION => {
            debug!(from = v, to = SCHEMA_VERSION, "upgrading store schema in place");
            create_schema_v1(conn)?;
            conn.execute("UPDATE schema_meta SET version = ?1 WHERE id = 0", params![SCHEMA_VERSION])
                .context("bump schema version")?;
        }
        Some(v) => {
            debug!(found = v, expected = SCHEMA_VERSION, "store schema newer than expected; dropping and recreating");
            conn.execute_batch("DROP TABLE IF EXISTS jobs; DROP TABLE IF EXISTS products; DROP TABLE IF EXISTS sources;")
                .context("drop stale tables")?;
            create_schema_v1(conn)?;
            conn.execute("UPDATE schema_meta SET version = ?1 WHERE id = 0", params![SCHEMA_VERSION])
                .context("reset schema version")?;
        }
    }
    Ok(())
}

fn create_schema_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sources (
            source_lower TEXT NOT NULL,
            source_display TEXT NOT NULL,
            platform TEXT NOT NULL,
            job_key TEXT NOT NULL,
            fingerprint INTEGER NOT NULL,
            PRIMARY KEY (source_lower, platform, job_key)
        );
        CREATE INDEX IF NOT EXISTS idx_sources_source_platform ON sources(source_lower, platform);
        CREATE INDEX IF NOT EXISTS idx_sources_source ON sources(source_lower);
        CREATE INDEX IF NOT EXISTS idx_sources_platform ON sources(platform);

        CREATE TABLE IF NOT EXISTS products (
            source_lower TEXT NOT NULL,
            platform TEXT NOT NULL,
            job_key TEXT NOT NULL,
            product_lower TEXT NOT NULL,
            product_display TEXT NOT NULL,
            PRIMARY KEY (source_lower, platform, job_key, product_lower),
            FOREIGN KEY (source_lower, platform, job_key)
                REFERENCES sources(source_lower, platform, job_key) ON DELETE CASCADE
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_products_product ON products(platform, product_lower);

        CREATE TABLE IF NOT EXISTS jobs (
            job_id INTEGER PRIMARY KEY,
            source_lower TEXT NOT NULL,
            source_display TEXT NOT NULL,
            platform TEXT NOT NULL,
            job_key TEXT NOT NULL,
            builder_id TEXT NOT NULL,
            status TEXT NOT NULL,
            latest INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_latest_lookup ON jobs(source_lower, platform, builder_id, job_key);
        CREATE INDEX IF NOT EXISTS idx_jobs_source ON jobs(source_lower);",
    )
    .context("create v1 schema")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn key(source: &str) -> SourceKey {
        SourceKey::new(source, PlatformId::new("pc"), "default")
    }

    #[tokio::test]
    async fn fingerprint_absent_iff_no_jobs_or_products() {
        let store = Store::in_memory().await.unwrap();
        let k = key("foo.txt");
        assert_eq!(store.get_fingerprint(&k).await.unwrap(), Fingerprint::Absent);
        assert_eq!(store.get_products(&k).await.unwrap(), ProductsAnswer::UnknownSource);

        store.set_fingerprint(&k, Fingerprint::Value(42)).await.unwrap();
        assert_eq!(store.get_fingerprint(&k).await.unwrap(), Fingerprint::Value(42));
        assert_eq!(store.get_products(&k).await.unwrap(), ProductsAnswer::Known(vec![]));

        store.set_products(&k, vec!["foo.arc1".to_string()]).await.unwrap();
        store
            .record_job(JobId(1), &k, BuilderId::new(), JobStatus::Completed)
            .await
            .unwrap();

        store.clear_fingerprint(&k).await.unwrap();
        assert_eq!(store.get_fingerprint(&k).await.unwrap(), Fingerprint::Absent);
        assert_eq!(store.get_products(&k).await.unwrap(), ProductsAnswer::UnknownSource);
        assert!(store.jobs_for_source("foo.txt").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_products_rejected_without_fingerprint() {
        let store = Store::in_memory().await.unwrap();
        let k = key("foo.txt");
        let result = store.set_products(&k, vec!["foo.arc1".to_string()]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn case_insensitive_round_trip_preserves_casing() {
        let store = Store::in_memory().await.unwrap();
        let k = key("Foo/Bar.txt");
        store.set_fingerprint(&k, Fingerprint::Value(1234)).await.unwrap();

        let lookup = key("foo/bar.txt");
        assert_eq!(store.get_fingerprint(&lookup).await.unwrap(), Fingerprint::Value(1234));

        let sources = store.find_sources_by_prefix("foo/").await.unwrap();
        assert_eq!(sources, vec!["Foo/Bar.txt".to_string()]);
    }

    #[tokio::test]
    async fn only_one_latest_job_record_per_tuple() {
        let store = Store::in_memory().await.unwrap();
        let k = key("foo.txt");
        let builder = BuilderId::new();
        store.set_fingerprint(&k, Fingerprint::Value(1)).await.unwrap();

        store.record_job(JobId(1), &k, builder, JobStatus::Completed).await.unwrap();
        store.record_job(JobId(2), &k, builder, JobStatus::Completed).await.unwrap();

        let latest = store.jobs_for_source("foo.txt").await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].job_id, JobId(2));
    }

    #[tokio::test]
    async fn highest_job_id_is_negative_one_when_empty() {
        let store = Store::in_memory().await.unwrap();
        assert_eq!(store.highest_job_id().await.unwrap(), JobId::SEED.into());
    }

    #[tokio::test]
    async fn prefix_search_escapes_wildcards() {
        let store = Store::in_memory().await.unwrap();
        let k = key("weird%name_here.txt");
        store.set_fingerprint(&k, Fingerprint::Value(1)).await.unwrap();

        let no_match = store.find_sources_by_prefix("weirdXname").await.unwrap();
        assert!(no_match.is_empty(), "escaped wildcard should not match unrelated text");

        let exact = store.find_sources_by_prefix("weird%name_").await.unwrap();
        assert_eq!(exact, vec!["weird%name_here.txt".to_string()]);
    }

    #[tokio::test]
    async fn complete_job_writes_fingerprint_products_and_record_atomically() {
        let store = Store::in_memory().await.unwrap();
        let k = key("foo.txt");
        let builder = BuilderId::new();

        store
            .complete_job(JobId(1), &k, builder, Fingerprint::Value(7), vec!["foo.arc1".to_string()])
            .await
            .unwrap();

        assert_eq!(store.get_fingerprint(&k).await.unwrap(), Fingerprint::Value(7));
        assert_eq!(
            store.get_products(&k).await.unwrap(),
            ProductsAnswer::Known(vec!["foo.arc1".to_string()])
        );
        let jobs = store.jobs_for_source("foo.txt").await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn fail_job_writes_failed_sentinel_and_record() {
        let store = Store::in_memory().await.unwrap();
        let k = key("foo.txt");
        let builder = BuilderId::new();

        store.fail_job(JobId(1), &k, builder, JobStatus::Failed).await.unwrap();

        assert!(store.get_fingerprint(&k).await.unwrap().is_failed());
        let jobs = store.jobs_for_source("foo.txt").await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn source_of_product_reverse_lookup() {
        let store = Store::in_memory().await.unwrap();
        let k = key("foo.txt");
        store.set_fingerprint(&k, Fingerprint::Value(1)).await.unwrap();
        store.set_products(&k, vec!["foo.arc1".to_string()]).await.unwrap();

        let found = store.source_of_product(&PlatformId::new("pc"), "FOO.ARC1").await.unwrap();
        assert_eq!(found, Some(k));
    }

    #[tokio::test]
    async fn source_of_product_is_scoped_per_platform() {
        let store = Store::in_memory().await.unwrap();
        let pc_key = SourceKey::new("a.txt", PlatformId::new("pc"), "default");
        let es3_key = SourceKey::new("b.txt", PlatformId::new("es3"), "default");
        store.set_fingerprint(&pc_key, Fingerprint::Value(1)).await.unwrap();
        store.set_fingerprint(&es3_key, Fingerprint::Value(2)).await.unwrap();
        // Two different sources happen to emit a product with the same
        // relative name on two different platforms; this must not collide.
        store.set_products(&pc_key, vec!["shared.arc1".to_string()]).await.unwrap();
        store.set_products(&es3_key, vec!["shared.arc1".to_string()]).await.unwrap();

        let found_pc = store.source_of_product(&PlatformId::new("pc"), "shared.arc1").await.unwrap();
        let found_es3 = store.source_of_product(&PlatformId::new("es3"), "shared.arc1").await.unwrap();
        assert_eq!(found_pc, Some(pc_key));
        assert_eq!(found_es3, Some(es3_key));
    }
}
