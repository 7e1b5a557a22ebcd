//! Snapshot retention, raw feed archive, retrying HTTP plumbing and the geocode cache.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use remap_core::Snapshot;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

mod geocode_cache;
mod http;

pub use geocode_cache::{
    normalize_address, CacheEntry, CacheStats, GeocodeCache, GeocodeCacheConfig, Geocoder,
    ResolveError, DEFAULT_MAX_ENTRIES, DEFAULT_TTL_DAYS,
};
pub use http::{
    is_transient_request_error, is_transient_status, CollaboratorError, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RateLimit, RetryPolicy,
};

pub const CRATE_NAME: &str = "remap-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Readers observe either the previous file or the complete new one.
async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let staging = dir.join(format!(".{}.partial", Uuid::new_v4()));
    let written = async {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staging)
            .await?;
        file.write_all(bytes).await?;
        file.sync_all().await
    }
    .await
    .with_context(|| format!("staging {}", staging.display()));

    let renamed = match written {
        Ok(()) => fs::rename(&staging, path)
            .await
            .with_context(|| format!("moving {} into place", path.display())),
        Err(err) => Err(err),
    };
    if renamed.is_err() {
        let _ = fs::remove_file(&staging).await;
    }
    renamed
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    /// Relative to the archive root.
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of raw feed bodies: `<stamp>/<provider>/<sha256>.<ext>`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, fetched_at: DateTime<Utc>, provider: &str, content_hash: &str, extension: &str) -> PathBuf {
        let ext = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        [
            fetched_at.format("%Y%m%dT%H%M%SZ").to_string(),
            provider.to_string(),
            format!("{content_hash}.{ext}"),
        ]
        .iter()
        .collect()
    }

    /// Identical bodies fetched in the same second share one file.
    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        provider: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = sha256_hex(bytes);
        let relative_path = self.path_for(fetched_at, provider, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("probing {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomically(&absolute_path, bytes).await?;
            debug!(provider, bytes = bytes.len(), path = %relative_path.display(), "archived raw feed");
        }

        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

/// Holds the most recent successfully applied snapshot per provider.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn retained_path(&self, provider: &str) -> PathBuf {
        self.root.join(provider).join("retained.json")
    }

    pub async fn load_retained(&self, provider: &str) -> anyhow::Result<Option<Snapshot>> {
        let path = self.retained_path(provider);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        let snapshot = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing retained snapshot {}", path.display()))?;
        Ok(Some(snapshot))
    }

    /// Replace the retained snapshot. The previous one stays intact until the rename lands.
    pub async fn retain(&self, snapshot: &Snapshot) -> anyhow::Result<PathBuf> {
        let path = self.retained_path(&snapshot.provider);
        let bytes = serde_json::to_vec(snapshot)
            .with_context(|| format!("serializing snapshot for {}", snapshot.provider))?;
        write_atomically(&path, &bytes).await?;
        debug!(
            provider = %snapshot.provider,
            records = snapshot.records.len(),
            path = %path.display(),
            "retained snapshot"
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remap_core::EventRecord;
    use tempfile::tempdir;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).expect("timestamp").with_timezone(&Utc)
    }

    #[test]
    fn sha256_matches_known_digest() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn archive_paths_are_stamped_and_content_addressed() {
        let store = ArtifactStore::new("/var/remap/artifacts");
        let path = store.path_for(at("2026-05-01T07:30:05Z"), "unpli", "abc123", ".json");
        assert_eq!(path, PathBuf::from("20260501T073005Z/unpli/abc123.json"));
        let bare = store.path_for(at("2026-05-01T07:30:05Z"), "unpli", "abc123", "");
        assert_eq!(bare.extension().and_then(|e| e.to_str()), Some("bin"));
    }

    #[tokio::test]
    async fn identical_feed_bodies_share_one_archive_file() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let fetched_at = at("2026-02-24T12:00:00Z");

        let first = store
            .store_bytes(fetched_at, "ticketmaster", "json", br#"{"events":[]}"#)
            .await
            .expect("first");
        let again = store
            .store_bytes(fetched_at, "ticketmaster", "json", br#"{"events":[]}"#)
            .await
            .expect("again");
        let other = store
            .store_bytes(fetched_at, "ticketmaster", "json", br#"{"events":[{}]}"#)
            .await
            .expect("other");

        assert!(!first.deduplicated && again.deduplicated && !other.deduplicated);
        assert_eq!(first.absolute_path, again.absolute_path);
        assert_ne!(first.content_hash, other.content_hash);
        assert_eq!(std::fs::read(&first.absolute_path).expect("read"), br#"{"events":[]}"#);
    }

    #[tokio::test]
    async fn snapshot_store_retains_latest_snapshot_per_provider() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        assert!(store.load_retained("unpli").await.expect("load").is_none());

        let first = Snapshot::new(
            "unpli",
            at("2026-03-01T06:00:00Z"),
            vec![EventRecord::new("1", "Sagra del Baccalà").sealed()],
        );
        store.retain(&first).await.expect("retain first");

        let second = Snapshot::new(
            "unpli",
            at("2026-03-02T06:00:00Z"),
            vec![
                EventRecord::new("1", "Sagra del Baccalà").sealed(),
                EventRecord::new("2", "Festa dell'Uva").sealed(),
            ],
        );
        store.retain(&second).await.expect("retain second");

        let loaded = store.load_retained("unpli").await.expect("load").expect("present");
        assert_eq!(loaded, second);
        assert!(store.load_retained("ticketmaster").await.expect("load").is_none());

        let leftovers = std::fs::read_dir(dir.path().join("unpli"))
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn corrupt_retained_snapshot_is_an_error_not_an_empty_one() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let path = store.retained_path("tm");
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, b"{not json").expect("write");
        assert!(store.load_retained("tm").await.is_err());
    }
}
