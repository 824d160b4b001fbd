//! Content-addressed render cache.
//!
//! Keys are deterministic digests of (source document hash, resolution,
//! watermark fingerprint), so identical inputs always resolve to the same
//! artifact. Entries are immutable once populated: a store against an
//! existing key is a success no-op, and concurrent writers racing on the
//! same key are harmless because content addressing guarantees equivalent
//! bytes: the first rename wins and everyone else discards their staging
//! file.

use std::{
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

/// Hex length of the watermark text fingerprint folded into cache keys.
const WATERMARK_FINGERPRINT_LEN: usize = 16;

/// Deterministic content address for a rendered page artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for a (document, resolution, watermark) tuple.
    ///
    /// Fields are separated by NUL so adjacent values can never alias, and
    /// the watermark contributes a short fingerprint (empty when no
    /// watermark is requested) rather than its raw text.
    pub fn derive(source_hash: &str, dpi: u32, watermark_text: Option<&str>) -> Self {
        let fingerprint = watermark_text.map(watermark_fingerprint).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(source_hash.as_bytes());
        hasher.update([0u8]);
        hasher.update(dpi.to_le_bytes());
        hasher.update([0u8]);
        hasher.update(fingerprint.as_bytes());

        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Short hash distinguishing cache entries that differ only by overlay text.
pub fn watermark_fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..WATERMARK_FINGERPRINT_LEN].to_string()
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode cache metadata: {0}")]
    Meta(#[from] serde_json::Error),
}

/// Sidecar metadata stored alongside a cached artifact so hits never have
/// to re-probe the source document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMeta {
    pub pages: u32,
}

pub struct RenderCache {
    dir: PathBuf,
}

impl RenderCache {
    /// Open the cache rooted at `dir`, creating it if necessary.
    pub fn new(dir: PathBuf) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Canonical artifact path for a key.
    pub fn artifact_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.webp", key.as_str()))
    }

    fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.as_str()))
    }

    /// Pure existence check against the key's canonical path.
    pub async fn lookup(&self, key: &CacheKey) -> Result<Option<PathBuf>, CacheError> {
        let path = self.artifact_path(key);
        if tokio::fs::try_exists(&path).await? {
            Ok(Some(path))
        } else {
            Ok(None)
        }
    }

    /// Create a staging file inside the cache directory.
    ///
    /// Staging must live on the same filesystem as the final path so the
    /// eventual persist is a single atomic rename.
    pub fn stage(&self) -> Result<NamedTempFile, CacheError> {
        Ok(NamedTempFile::new_in(&self.dir)?)
    }

    /// Move a staged artifact under its key. Idempotent: if the key is
    /// already populated the staged copy is discarded and the existing
    /// artifact is returned untouched.
    pub fn store(&self, key: &CacheKey, staged: NamedTempFile) -> Result<PathBuf, CacheError> {
        let target = self.artifact_path(key);
        persist_noclobber(staged, &target)?;
        Ok(target)
    }

    /// Record the page-count sidecar for a key, with the same first-writer
    /// semantics as the artifact itself.
    pub fn store_meta(&self, key: &CacheKey, meta: &CacheMeta) -> Result<(), CacheError> {
        let mut staged = NamedTempFile::new_in(&self.dir)?;
        staged.write_all(&serde_json::to_vec(meta)?)?;
        staged.flush()?;
        persist_noclobber(staged, &self.meta_path(key))?;
        Ok(())
    }

    /// Read the page-count sidecar; any failure is treated as a miss.
    pub async fn read_meta(&self, key: &CacheKey) -> Option<CacheMeta> {
        let path = self.meta_path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(meta) => Some(meta),
                Err(err) => {
                    debug!(
                        target = "infra::cache",
                        path = %path.display(),
                        error = %err,
                        "unreadable cache sidecar; ignoring"
                    );
                    None
                }
            },
            Err(_) => None,
        }
    }
}

fn persist_noclobber(staged: NamedTempFile, target: &Path) -> Result<(), io::Error> {
    if target.exists() {
        // First writer won; nothing to do.
        return Ok(());
    }
    match staged.persist_noclobber(target) {
        Ok(_) => Ok(()),
        Err(err) if err.error.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err.error),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn identical_tuples_derive_identical_keys() {
        let a = CacheKey::derive("ab12", 200, Some("ACME Corp"));
        let b = CacheKey::derive("ab12", 200, Some("ACME Corp"));
        assert_eq!(a, b);
    }

    #[test]
    fn every_tuple_component_feeds_the_key() {
        let base = CacheKey::derive("ab12", 200, Some("ACME Corp"));
        assert_ne!(base, CacheKey::derive("cd34", 200, Some("ACME Corp")));
        assert_ne!(base, CacheKey::derive("ab12", 300, Some("ACME Corp")));
        assert_ne!(base, CacheKey::derive("ab12", 200, Some("Other Ltd")));
        assert_ne!(base, CacheKey::derive("ab12", 200, None));
    }

    #[test]
    fn fingerprint_is_short_and_stable() {
        let fp = watermark_fingerprint("ACME Corp");
        assert_eq!(fp.len(), WATERMARK_FINGERPRINT_LEN);
        assert_eq!(fp, watermark_fingerprint("ACME Corp"));
        assert_ne!(fp, watermark_fingerprint("acme corp"));
    }

    #[tokio::test]
    async fn lookup_misses_until_stored_then_hits() {
        let dir = TempDir::new().expect("temp dir");
        let cache = RenderCache::new(dir.path().to_path_buf()).expect("cache");
        let key = CacheKey::derive("ab12", 200, None);

        assert!(cache.lookup(&key).await.expect("lookup").is_none());

        let mut staged = cache.stage().expect("stage");
        staged.write_all(b"artifact-bytes").expect("write");
        let stored = cache.store(&key, staged).expect("store");

        let hit = cache.lookup(&key).await.expect("lookup").expect("hit");
        assert_eq!(hit, stored);
        assert_eq!(std::fs::read(&hit).expect("read"), b"artifact-bytes");
    }

    #[tokio::test]
    async fn storing_twice_is_a_noop_for_the_second_writer() {
        let dir = TempDir::new().expect("temp dir");
        let cache = RenderCache::new(dir.path().to_path_buf()).expect("cache");
        let key = CacheKey::derive("ab12", 200, Some("ACME Corp"));

        let mut first = cache.stage().expect("stage");
        first.write_all(b"artifact-bytes").expect("write");
        cache.store(&key, first).expect("first store");

        let mut second = cache.stage().expect("stage");
        second.write_all(b"artifact-bytes").expect("write");
        cache.store(&key, second).expect("second store is a no-op");

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .collect();
        assert_eq!(entries.len(), 1, "exactly one artifact per key");
    }

    #[tokio::test]
    async fn sidecar_round_trips_and_missing_sidecar_is_a_miss() {
        let dir = TempDir::new().expect("temp dir");
        let cache = RenderCache::new(dir.path().to_path_buf()).expect("cache");
        let key = CacheKey::derive("ab12", 200, None);

        assert!(cache.read_meta(&key).await.is_none());

        cache
            .store_meta(&key, &CacheMeta { pages: 12 })
            .expect("store meta");
        let meta = cache.read_meta(&key).await.expect("meta");
        assert_eq!(meta.pages, 12);
    }
}
