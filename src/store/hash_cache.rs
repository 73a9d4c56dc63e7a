//! Hash cache repository.
//!
//! Persists `(path, algorithm) -> (digest, size, mtime, cached_at)` so
//! repeated hashing of unchanged files is a table lookup. An entry is a
//! hit iff a fresh `stat` of the path yields the same size and an mtime
//! within 1 ms of the cached one; a failed `stat` is a miss, not an
//! error.

use std::{fs, path::Path, time::UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, params};

use crate::{errors::ProvenanceError, utils::unix_now};

/// Cached/current metadata must agree within this many seconds.
const MTIME_TOLERANCE: f64 = 0.001;

/// `stat` a path for cache validation: `(size, mtime seconds)`, or
/// `None` when the path cannot be stat'd.
pub(crate) fn file_stat(path: &str) -> Option<(i64, f64)> {
    let meta = fs::metadata(Path::new(path)).ok()?;
    let mtime = meta
        .modified()
        .ok()?
        .duration_since(UNIX_EPOCH)
        .ok()?
        .as_secs_f64();
    Some((meta.len() as i64, mtime))
}

/// Repository over the `hash_cache` table. Writable only through this
/// type, and always consulted under the caller's transaction so the
/// cache never reflects a digest for a not-yet-committed artifact.
pub struct HashCacheRepository<'c> {
    conn: &'c Connection,
}

impl<'c> HashCacheRepository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Cached digest for `(path, algorithm)` if still valid.
    pub fn get_one(
        &self,
        path: &str,
        algorithm: &str,
    ) -> Result<Option<String>, ProvenanceError> {
        let Some((size, mtime)) = file_stat(path) else {
            return Ok(None);
        };

        let entry: Option<(String, i64, f64)> = self
            .conn
            .query_row(
                "SELECT digest, size, mtime FROM hash_cache WHERE path = ?1 AND algorithm = ?2",
                params![path, algorithm],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        Ok(entry.and_then(|(digest, cached_size, cached_mtime)| {
            (cached_size == size && (cached_mtime - mtime).abs() < MTIME_TOLERANCE)
                .then_some(digest)
        }))
    }

    /// All still-valid cached digests for a path. Partial: algorithms
    /// never hashed for this path are simply absent.
    pub fn get_all(
        &self,
        path: &str,
    ) -> Result<std::collections::BTreeMap<String, String>, ProvenanceError> {
        let Some((size, mtime)) = file_stat(path) else {
            return Ok(Default::default());
        };

        let mut stmt = self
            .conn
            .prepare("SELECT algorithm, digest, size, mtime FROM hash_cache WHERE path = ?1")?;
        let rows = stmt.query_map(params![path], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, f64>(3)?,
            ))
        })?;

        let mut result = std::collections::BTreeMap::new();
        for row in rows {
            let (algorithm, digest, cached_size, cached_mtime) = row?;
            if cached_size == size && (cached_mtime - mtime).abs() < MTIME_TOLERANCE {
                result.insert(algorithm, digest);
            }
        }
        Ok(result)
    }

    /// Upsert one entry, stamping `cached_at` with the current time.
    pub fn put_one(
        &self,
        path: &str,
        algorithm: &str,
        digest: &str,
        size: i64,
        mtime: f64,
    ) -> Result<(), ProvenanceError> {
        self.conn.execute(
            "INSERT INTO hash_cache (path, algorithm, digest, size, mtime, cached_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(path, algorithm) DO UPDATE SET
                 digest = excluded.digest,
                 size = excluded.size,
                 mtime = excluded.mtime,
                 cached_at = excluded.cached_at",
            params![path, algorithm, digest, size, mtime, unix_now()],
        )?;
        Ok(())
    }

    /// Upsert several algorithms for one path in a single pass.
    pub fn put_many(
        &self,
        path: &str,
        hashes: &std::collections::BTreeMap<String, String>,
        size: i64,
        mtime: f64,
    ) -> Result<(), ProvenanceError> {
        let now = unix_now();
        let mut stmt = self.conn.prepare(
            "INSERT INTO hash_cache (path, algorithm, digest, size, mtime, cached_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(path, algorithm) DO UPDATE SET
                 digest = excluded.digest,
                 size = excluded.size,
                 mtime = excluded.mtime,
                 cached_at = excluded.cached_at",
        )?;
        for (algorithm, digest) in hashes {
            stmt.execute(params![path, algorithm, digest, size, mtime, now])?;
        }
        Ok(())
    }

    /// Remove one algorithm's entry for a path, or all entries when
    /// `algorithm` is `None`.
    pub fn invalidate(
        &self,
        path: &str,
        algorithm: Option<&str>,
    ) -> Result<(), ProvenanceError> {
        match algorithm {
            Some(algorithm) => self.conn.execute(
                "DELETE FROM hash_cache WHERE path = ?1 AND algorithm = ?2",
                params![path, algorithm],
            )?,
            None => self
                .conn
                .execute("DELETE FROM hash_cache WHERE path = ?1", params![path])?,
        };
        Ok(())
    }

    /// Delete entries cached more than `max_age_days` ago. Returns the
    /// number of rows removed.
    pub fn prune(&self, max_age_days: i64) -> Result<usize, ProvenanceError> {
        let cutoff = unix_now() - (max_age_days as f64) * 86_400.0;
        let removed = self.conn.execute(
            "DELETE FROM hash_cache WHERE cached_at < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::store::Store;

    fn scratch_file(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> String {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).expect("create scratch file");
        f.write_all(content).expect("write scratch file");
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open_in_memory().expect("store");
        let cache = HashCacheRepository::new(store.conn());

        let path = scratch_file(&dir, "data.bin", b"payload");
        let (size, mtime) = file_stat(&path).expect("stat");

        cache
            .put_one(&path, "blake3", "00ff", size, mtime)
            .expect("put");
        assert_eq!(
            cache.get_one(&path, "blake3").expect("get"),
            Some("00ff".to_string())
        );
        assert_eq!(cache.get_one(&path, "sha256").expect("get"), None);
    }

    /// An entry whose recorded mtime drifted by 2 ms from the file's
    /// actual mtime is stale.
    #[test]
    fn test_mtime_drift_invalidates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open_in_memory().expect("store");
        let cache = HashCacheRepository::new(store.conn());

        let path = scratch_file(&dir, "data.bin", b"payload");
        let (size, mtime) = file_stat(&path).expect("stat");

        cache
            .put_one(&path, "blake3", "00ff", size, mtime + 0.002)
            .expect("put");
        assert_eq!(cache.get_one(&path, "blake3").expect("get"), None);

        // Re-caching with accurate metadata replaces the stale entry.
        cache
            .put_one(&path, "blake3", "11ee", size, mtime)
            .expect("put");
        assert_eq!(
            cache.get_one(&path, "blake3").expect("get"),
            Some("11ee".to_string())
        );
    }

    #[test]
    fn test_size_mismatch_invalidates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open_in_memory().expect("store");
        let cache = HashCacheRepository::new(store.conn());

        let path = scratch_file(&dir, "data.bin", b"payload");
        let (size, mtime) = file_stat(&path).expect("stat");

        cache
            .put_one(&path, "blake3", "00ff", size + 1, mtime)
            .expect("put");
        assert_eq!(cache.get_one(&path, "blake3").expect("get"), None);
    }

    #[test]
    fn test_missing_path_is_a_miss() {
        let store = Store::open_in_memory().expect("store");
        let cache = HashCacheRepository::new(store.conn());
        assert_eq!(
            cache
                .get_one("/no/such/path/anywhere", "blake3")
                .expect("get"),
            None
        );
        assert!(cache.get_all("/no/such/path/anywhere").expect("get").is_empty());
    }

    #[test]
    fn test_invalidate_and_prune() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open_in_memory().expect("store");
        let cache = HashCacheRepository::new(store.conn());

        let path = scratch_file(&dir, "data.bin", b"payload");
        let (size, mtime) = file_stat(&path).expect("stat");

        let mut hashes = std::collections::BTreeMap::new();
        hashes.insert("blake3".to_string(), "aa".to_string());
        hashes.insert("sha256".to_string(), "bb".to_string());
        cache.put_many(&path, &hashes, size, mtime).expect("put");

        cache.invalidate(&path, Some("blake3")).expect("invalidate");
        assert_eq!(cache.get_one(&path, "blake3").expect("get"), None);
        assert!(cache.get_one(&path, "sha256").expect("get").is_some());

        cache.invalidate(&path, None).expect("invalidate all");
        assert!(cache.get_all(&path).expect("get_all").is_empty());

        // Entries stamped now survive a 30-day prune.
        cache.put_many(&path, &hashes, size, mtime).expect("put");
        assert_eq!(cache.prune(30).expect("prune"), 0);
        // A zero-day cutoff is in the future relative to the stamps.
        assert_eq!(cache.prune(-1).expect("prune"), 2);
    }
}
