//! Bounded, time-limited address -> coordinates cache in front of an external geocoder.
//!
//! The store is a SQLite file holding one row per normalized address. Every resolution
//! borrows its own pooled connection, writes are single-statement upserts, and after each
//! write the table is trimmed back under its ceiling by dropping the oldest-expiring half.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use remap_core::Coordinates;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::SqliteConnection;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{sha256_hex, CollaboratorError};

pub const DEFAULT_TTL_DAYS: i64 = 90;
pub const DEFAULT_MAX_ENTRIES: u64 = 20_000;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS geocode_cache (
    fingerprint TEXT PRIMARY KEY NOT NULL,
    address     TEXT NOT NULL,
    longitude   REAL NOT NULL,
    latitude    REAL NOT NULL,
    created_at  INTEGER NOT NULL,
    expires_at  INTEGER NOT NULL
)
"#;

const CREATE_EXPIRY_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS geocode_cache_expires_at ON geocode_cache (expires_at)";

/// External address resolver, consulted only on cache misses.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> Result<Coordinates, CollaboratorError>;
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("address is empty after normalization")]
    EmptyAddress,
    #[error("could not resolve {address:?}: {source}")]
    Geocode {
        address: String,
        #[source]
        source: CollaboratorError,
    },
    #[error("geocode cache store failure: {0}")]
    Store(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct GeocodeCacheConfig {
    pub ttl: TimeDelta,
    pub max_entries: u64,
    pub max_connections: u32,
}

impl Default for GeocodeCacheConfig {
    fn default() -> Self {
        Self {
            ttl: TimeDelta::days(DEFAULT_TTL_DAYS),
            max_entries: DEFAULT_MAX_ENTRIES,
            max_connections: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub address: String,
    pub coordinates: Coordinates,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stale: u64,
    pub writes: u64,
    pub evicted: u64,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale: AtomicU64,
    writes: AtomicU64,
    evicted: AtomicU64,
}

impl CacheCounters {
    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

/// Case-folded, trimmed address with inner whitespace runs collapsed.
pub fn normalize_address(address: &str) -> String {
    address
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

enum Lookup {
    Live(CacheEntry),
    Stale,
    Absent,
}

type CacheRow = (String, String, f64, f64, i64, i64);

fn row_to_entry(row: CacheRow) -> CacheEntry {
    let (fingerprint, address, longitude, latitude, created_at, expires_at) = row;
    CacheEntry {
        fingerprint,
        address,
        coordinates: Coordinates::new(longitude, latitude),
        created_at: DateTime::from_timestamp(created_at, 0).unwrap_or_default(),
        expires_at: DateTime::from_timestamp(expires_at, 0).unwrap_or_default(),
    }
}

#[derive(Debug, Clone)]
pub struct GeocodeCache {
    pool: SqlitePool,
    config: GeocodeCacheConfig,
    counters: Arc<CacheCounters>,
}

impl GeocodeCache {
    /// Open (or create) the cache store at `path` and make sure its schema exists.
    pub async fn open(path: impl AsRef<Path>, config: GeocodeCacheConfig) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .with_context(|| format!("opening geocode cache {}", path.display()))?;

        sqlx::query(CREATE_TABLE)
            .execute(&pool)
            .await
            .context("creating geocode_cache table")?;
        sqlx::query(CREATE_EXPIRY_INDEX)
            .execute(&pool)
            .await
            .context("creating geocode_cache expiry index")?;

        info!(path = %path.display(), max_entries = config.max_entries, "geocode cache open");
        Ok(Self {
            pool,
            config,
            counters: Arc::new(CacheCounters::default()),
        })
    }

    pub fn config(&self) -> &GeocodeCacheConfig {
        &self.config
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    /// Total rows, live and stale.
    pub async fn len(&self) -> Result<u64, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM geocode_cache")
            .fetch_one(&mut *conn)
            .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn is_empty(&self) -> Result<bool, sqlx::Error> {
        Ok(self.len().await? == 0)
    }

    /// Live entry for `address`, without consulting the geocoder.
    pub async fn lookup(&self, address: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>, sqlx::Error> {
        let fingerprint = sha256_hex(normalize_address(address).as_bytes());
        let mut conn = self.pool.acquire().await?;
        match Self::lookup_on(&mut conn, &fingerprint, now).await? {
            Lookup::Live(entry) => Ok(Some(entry)),
            Lookup::Stale | Lookup::Absent => Ok(None),
        }
    }

    pub async fn resolve(&self, address: &str, geocoder: &dyn Geocoder) -> Result<Coordinates, ResolveError> {
        self.resolve_at(address, geocoder, Utc::now()).await
    }

    /// Resolve `address` as of `now`: a live hit never reaches the geocoder; a miss or an
    /// expired row calls it once and overwrites the row with a fresh TTL.
    pub async fn resolve_at(
        &self,
        address: &str,
        geocoder: &dyn Geocoder,
        now: DateTime<Utc>,
    ) -> Result<Coordinates, ResolveError> {
        let normalized = normalize_address(address);
        if normalized.is_empty() {
            return Err(ResolveError::EmptyAddress);
        }
        let fingerprint = sha256_hex(normalized.as_bytes());

        {
            let mut conn = self.pool.acquire().await?;
            match Self::lookup_on(&mut conn, &fingerprint, now).await? {
                Lookup::Live(entry) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(address = %normalized, "geocode cache hit");
                    return Ok(entry.coordinates);
                }
                Lookup::Stale => {
                    self.counters.stale.fetch_add(1, Ordering::Relaxed);
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                }
                Lookup::Absent => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let coordinates = geocoder
            .geocode(address.trim())
            .await
            .map_err(|source| ResolveError::Geocode {
                address: normalized.clone(),
                source,
            })?;

        let entry = CacheEntry {
            fingerprint,
            address: normalized,
            coordinates,
            created_at: now,
            expires_at: now + self.config.ttl,
        };
        self.store(&entry).await?;

        if let Err(err) = self.evict_if_needed().await {
            warn!(error = %err, "geocode cache eviction failed");
        }
        Ok(coordinates)
    }

    async fn lookup_on(
        conn: &mut SqliteConnection,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<Lookup, sqlx::Error> {
        let row: Option<CacheRow> = sqlx::query_as(
            r#"
            SELECT fingerprint, address, longitude, latitude, created_at, expires_at
              FROM geocode_cache
             WHERE fingerprint = ?1
            "#,
        )
        .bind(fingerprint)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(match row.map(row_to_entry) {
            Some(entry) if entry.is_live(now) => Lookup::Live(entry),
            Some(_) => Lookup::Stale,
            None => Lookup::Absent,
        })
    }

    async fn store(&self, entry: &CacheEntry) -> Result<(), sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(
            r#"
            INSERT INTO geocode_cache (fingerprint, address, longitude, latitude, created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (fingerprint) DO UPDATE SET
                address    = excluded.address,
                longitude  = excluded.longitude,
                latitude   = excluded.latitude,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(&entry.fingerprint)
        .bind(&entry.address)
        .bind(entry.coordinates.lon)
        .bind(entry.coordinates.lat)
        .bind(entry.created_at.timestamp())
        .bind(entry.expires_at.timestamp())
        .execute(&mut *conn)
        .await?;
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Drop the oldest-expiring half of the table once it holds more than `max_entries` rows.
    ///
    /// Count and delete share one `BEGIN IMMEDIATE` transaction, so concurrent callers
    /// serialize and the second one sees the already-shrunk table.
    pub async fn evict_if_needed(&self) -> Result<u64, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        let outcome = evict_oldest_half(&mut *conn, self.config.max_entries).await;
        let finish = if outcome.is_ok() { "COMMIT" } else { "ROLLBACK" };
        if let Err(err) = sqlx::query(finish).execute(&mut *conn).await {
            // Never hand a connection stuck inside a transaction back to the pool.
            conn.close_on_drop();
            outcome?;
            return Err(err);
        }

        let (total, evicted) = outcome?;
        if evicted > 0 {
            self.counters.evicted.fetch_add(evicted, Ordering::Relaxed);
            info!(total, evicted, ceiling = self.config.max_entries, "geocode cache evicted oldest entries");
        }
        Ok(evicted)
    }
}

/// Returns the row count seen and the rows deleted.
async fn evict_oldest_half(conn: &mut SqliteConnection, max_entries: u64) -> Result<(u64, u64), sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM geocode_cache")
        .fetch_one(&mut *conn)
        .await?;
    let total = count.max(0) as u64;
    if total <= max_entries {
        return Ok((total, 0));
    }

    let result = sqlx::query(
        r#"
        DELETE FROM geocode_cache
         WHERE fingerprint IN (
               SELECT fingerprint
                 FROM geocode_cache
                ORDER BY expires_at ASC, created_at ASC, fingerprint ASC
                LIMIT ?1
         )
        "#,
    )
    .bind((total / 2) as i64)
    .execute(&mut *conn)
    .await?;
    Ok((total, result.rows_affected()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct CountingGeocoder {
        calls: AtomicUsize,
        fail_with: StdMutex<Option<CollaboratorError>>,
    }

    impl CountingGeocoder {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Geocoder for CountingGeocoder {
        async fn geocode(&self, address: &str) -> Result<Coordinates, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.fail_with.lock().unwrap().clone() {
                return Err(err);
            }
            if address.to_lowercase().contains("san marco") {
                Ok(Coordinates::new(12.338_848_7, 45.434_172_3))
            } else {
                let n = address.len() as f64;
                Ok(Coordinates::new(11.0 + n / 1000.0, 45.0 + n / 1000.0))
            }
        }
    }

    async fn open_cache(dir: &Path, max_entries: u64) -> GeocodeCache {
        GeocodeCache::open(
            dir.join("cache.sqlite"),
            GeocodeCacheConfig {
                max_entries,
                ..GeocodeCacheConfig::default()
            },
        )
        .await
        .expect("open cache")
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).expect("ts").with_timezone(&Utc)
    }

    #[test]
    fn normalization_case_folds_and_trims() {
        assert_eq!(
            normalize_address("  Piazza  San Marco,\tVenezia "),
            "piazza san marco, venezia"
        );
    }

    #[tokio::test]
    async fn second_resolution_within_ttl_is_served_from_cache() {
        let dir = tempdir().expect("tempdir");
        let cache = open_cache(dir.path(), DEFAULT_MAX_ENTRIES).await;
        let geocoder = CountingGeocoder::default();

        let first = cache
            .resolve_at("Piazza San Marco, Venezia", &geocoder, ts("2026-01-01T10:00:00Z"))
            .await
            .expect("first");
        let second = cache
            .resolve_at("piazza san marco, venezia ", &geocoder, ts("2026-03-20T10:00:00Z"))
            .await
            .expect("second");

        assert_eq!(first, second);
        assert_eq!(geocoder.calls(), 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.writes, 1);
    }

    #[tokio::test]
    async fn expired_entries_are_never_hits() {
        let dir = tempdir().expect("tempdir");
        let cache = open_cache(dir.path(), DEFAULT_MAX_ENTRIES).await;
        let geocoder = CountingGeocoder::default();
        let written_at = ts("2026-01-01T00:00:00Z");

        cache
            .resolve_at("Arena di Verona", &geocoder, written_at)
            .await
            .expect("first");
        let expiry = written_at + TimeDelta::days(DEFAULT_TTL_DAYS);

        assert!(cache.lookup("Arena di Verona", expiry).await.expect("lookup").is_none());
        assert!(cache
            .lookup("Arena di Verona", expiry - TimeDelta::seconds(1))
            .await
            .expect("lookup")
            .is_some());

        cache
            .resolve_at("Arena di Verona", &geocoder, expiry)
            .await
            .expect("refresh");
        assert_eq!(geocoder.calls(), 2);
        assert_eq!(cache.stats().stale, 1);

        let refreshed = cache.lookup("arena di verona", expiry).await.expect("lookup").expect("live");
        assert_eq!(refreshed.expires_at, expiry + TimeDelta::days(DEFAULT_TTL_DAYS));
        assert_eq!(cache.len().await.expect("len"), 1);
    }

    #[tokio::test]
    async fn failed_resolution_writes_nothing() {
        let dir = tempdir().expect("tempdir");
        let cache = open_cache(dir.path(), DEFAULT_MAX_ENTRIES).await;
        let geocoder = CountingGeocoder::default();
        *geocoder.fail_with.lock().unwrap() = Some(CollaboratorError::NotFound("no features".into()));

        let err = cache
            .resolve("Via Inesistente 999, Atlantide", &geocoder)
            .await
            .expect_err("should fail");
        assert!(matches!(err, ResolveError::Geocode { .. }));
        assert_eq!(cache.len().await.expect("len"), 0);
        assert_eq!(cache.stats().writes, 0);
    }

    #[tokio::test]
    async fn empty_address_is_rejected_without_external_call() {
        let dir = tempdir().expect("tempdir");
        let cache = open_cache(dir.path(), DEFAULT_MAX_ENTRIES).await;
        let geocoder = CountingGeocoder::default();
        let err = cache.resolve("   ", &geocoder).await.expect_err("empty");
        assert!(matches!(err, ResolveError::EmptyAddress));
        assert_eq!(geocoder.calls(), 0);
    }

    #[tokio::test]
    async fn coordinates_keep_resolver_precision() {
        let dir = tempdir().expect("tempdir");
        let cache = open_cache(dir.path(), DEFAULT_MAX_ENTRIES).await;
        let geocoder = CountingGeocoder::default();
        let now = ts("2026-05-01T00:00:00Z");
        cache
            .resolve_at("Piazza San Marco", &geocoder, now)
            .await
            .expect("resolve");
        let entry = cache.lookup("Piazza San Marco", now).await.expect("lookup").expect("live");
        assert_eq!(entry.coordinates, Coordinates::new(12.338_848_7, 45.434_172_3));
    }

    #[tokio::test]
    async fn concurrent_evictions_remove_half_once() {
        let dir = tempdir().expect("tempdir");
        let cache = open_cache(dir.path(), 10).await;
        let base = ts("2026-01-01T00:00:00Z").timestamp();
        for i in 0..20_i64 {
            sqlx::query(
                "INSERT INTO geocode_cache (fingerprint, address, longitude, latitude, created_at, expires_at)
                 VALUES (?1, ?2, 12.0, 45.0, ?3, ?4)",
            )
            .bind(format!("fp-{i:02}"))
            .bind(format!("address {i}"))
            .bind(base + i)
            .bind(base + i + 1_000)
            .execute(&cache.pool)
            .await
            .expect("insert");
        }

        let (first, second) = tokio::join!(cache.evict_if_needed(), cache.evict_if_needed());
        let evicted = first.expect("first eviction") + second.expect("second eviction");

        assert_eq!(evicted, 10);
        assert_eq!(cache.len().await.expect("len"), 10);
        assert_eq!(cache.stats().evicted, 10);
    }

    #[tokio::test]
    async fn overflow_evicts_oldest_expiring_half() {
        let dir = tempdir().expect("tempdir");
        let cache = open_cache(dir.path(), DEFAULT_MAX_ENTRIES).await;
        let base = ts("2026-01-01T00:00:00Z").timestamp();

        let mut tx = cache.pool.begin().await.expect("begin");
        for i in 0..DEFAULT_MAX_ENTRIES as i64 {
            sqlx::query(
                "INSERT INTO geocode_cache (fingerprint, address, longitude, latitude, created_at, expires_at)
                 VALUES (?1, ?2, 12.0, 45.0, ?3, ?4)",
            )
            .bind(format!("fp-{i:05}"))
            .bind(format!("address {i}"))
            .bind(base + i)
            .bind(base + i + 1_000)
            .execute(&mut *tx)
            .await
            .expect("insert");
        }
        tx.commit().await.expect("commit");
        assert_eq!(cache.len().await.expect("len"), DEFAULT_MAX_ENTRIES);

        // The 20,001st entry expires latest and must survive.
        let geocoder = CountingGeocoder::default();
        let now = ts("2026-06-01T00:00:00Z");
        cache
            .resolve_at("Piazza San Marco, Venezia", &geocoder, now)
            .await
            .expect("resolve");

        let remaining = cache.len().await.expect("len");
        assert!(remaining <= 10_001, "remaining={remaining}");
        assert_eq!(cache.stats().evicted, 10_000);
        assert!(cache
            .lookup("Piazza San Marco, Venezia", now)
            .await
            .expect("lookup")
            .is_some());

        let (min_expiry,): (i64,) = sqlx::query_as("SELECT MIN(expires_at) FROM geocode_cache")
            .fetch_one(&cache.pool)
            .await
            .expect("min");
        assert_eq!(min_expiry, base + 10_000 + 1_000);
    }

    #[tokio::test]
    async fn small_ceiling_stays_bounded_across_writes() {
        let dir = tempdir().expect("tempdir");
        let cache = open_cache(dir.path(), 10).await;
        let geocoder = CountingGeocoder::default();
        let start = ts("2026-01-01T00:00:00Z");

        for i in 0..50 {
            cache
                .resolve_at(&format!("Via Roma {i}, Padova"), &geocoder, start + TimeDelta::minutes(i))
                .await
                .expect("resolve");
            assert!(cache.len().await.expect("len") <= 10);
        }
        assert_eq!(geocoder.calls(), 50);
    }

    #[tokio::test]
    async fn concurrent_resolutions_share_the_store() {
        let dir = tempdir().expect("tempdir");
        let cache = open_cache(dir.path(), DEFAULT_MAX_ENTRIES).await;
        let geocoder = Arc::new(CountingGeocoder::default());

        let mut handles = Vec::new();
        for i in 0..8 {
            let cache = cache.clone();
            let geocoder = geocoder.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .resolve(&format!("Prato della Valle {i}, Padova"), geocoder.as_ref())
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("resolve");
        }
        assert_eq!(cache.len().await.expect("len"), 8);
    }
}
