//! File hashing service.
//!
//! Computes one or more digests for a file in a single read pass,
//! consulting and repopulating the hash cache. A path that cannot be
//! stat'd or read yields `None` rather than an error; the cache is only
//! written after a complete pass, so a read failure mid-file leaves no
//! partial state.

use std::{collections::BTreeMap, fs::File, io::Read};

use rusqlite::Connection;

use crate::{
    errors::ProvenanceError,
    hashing::registry::HashRegistry,
    store::hash_cache::{HashCacheRepository, file_stat},
};

/// Read granularity for the single-pass hash loop.
const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Service over the registry and the per-store hash cache. Methods take
/// the connection explicitly so cache reads and writes join whatever
/// transaction the caller holds.
pub struct HashingService<'r> {
    registry: &'r HashRegistry,
}

impl<'r> HashingService<'r> {
    pub fn new(registry: &'r HashRegistry) -> Self {
        Self { registry }
    }

    /// Compute digests for every requested algorithm in one file pass.
    ///
    /// Returns `None` iff the path cannot be stat'd or read. Cached
    /// digests are reused when the file's size and mtime still match;
    /// only the missing algorithms are computed. Naming an unregistered
    /// algorithm is an error, not a miss.
    pub fn compute_hashes(
        &self,
        conn: &Connection,
        path: &str,
        algorithms: &[String],
    ) -> Result<Option<BTreeMap<String, String>>, ProvenanceError> {
        let Some((size, mtime)) = file_stat(path) else {
            return Ok(None);
        };

        let cache = HashCacheRepository::new(conn);
        let mut known = cache.get_all(path)?;

        let needed: Vec<&str> = algorithms
            .iter()
            .map(String::as_str)
            .filter(|a| !known.contains_key(*a))
            .collect();

        if !needed.is_empty() {
            let mut hashers = Vec::with_capacity(needed.len());
            for algorithm in &needed {
                hashers.push((algorithm.to_string(), self.registry.hasher(algorithm)?));
            }

            let mut file = match File::open(path) {
                Ok(file) => file,
                Err(err) => {
                    tracing::debug!(path, error = %err, "file vanished before hashing");
                    return Ok(None);
                }
            };

            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let read = match file.read(&mut buf) {
                    Ok(read) => read,
                    Err(err) => {
                        tracing::debug!(path, error = %err, "read failed mid-hash");
                        return Ok(None);
                    }
                };
                if read == 0 {
                    break;
                }
                for (_, hasher) in &mut hashers {
                    hasher.update(&buf[..read]);
                }
            }

            let mut fresh = BTreeMap::new();
            for (algorithm, hasher) in hashers {
                fresh.insert(algorithm, hasher.finalize());
            }
            cache.put_many(path, &fresh, size, mtime)?;
            known.extend(fresh);
        }

        let mut result = BTreeMap::new();
        for algorithm in algorithms {
            if let Some(digest) = known.get(algorithm) {
                result.insert(algorithm.clone(), digest.clone());
            }
        }
        Ok(Some(result))
    }

    /// Single-algorithm convenience wrapper around
    /// [`compute_hashes`](Self::compute_hashes).
    pub fn compute_hash(
        &self,
        conn: &Connection,
        path: &str,
        algorithm: &str,
    ) -> Result<Option<String>, ProvenanceError> {
        let hashes = self.compute_hashes(conn, path, &[algorithm.to_string()])?;
        Ok(hashes.and_then(|mut h| h.remove(algorithm)))
    }

    /// Still-valid cached digest without touching the file contents.
    pub fn get_cached_hash(
        &self,
        conn: &Connection,
        path: &str,
        algorithm: &str,
    ) -> Result<Option<String>, ProvenanceError> {
        HashCacheRepository::new(conn).get_one(path, algorithm)
    }

    /// All still-valid cached digests for a path.
    pub fn get_cached_hashes(
        &self,
        conn: &Connection,
        path: &str,
    ) -> Result<BTreeMap<String, String>, ProvenanceError> {
        HashCacheRepository::new(conn).get_all(path)
    }

    /// Drop cached digests for a path (one algorithm, or all).
    pub fn invalidate_cache(
        &self,
        conn: &Connection,
        path: &str,
        algorithm: Option<&str>,
    ) -> Result<(), ProvenanceError> {
        HashCacheRepository::new(conn).invalidate(path, algorithm)
    }

    /// Remove cache entries older than `max_age_days`.
    pub fn clean_stale_cache(
        &self,
        conn: &Connection,
        max_age_days: i64,
    ) -> Result<usize, ProvenanceError> {
        HashCacheRepository::new(conn).prune(max_age_days)
    }
}
