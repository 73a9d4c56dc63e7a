//! Artifact repository.
//!
//! Content-addressed objects keyed by an opaque random id, with a
//! one-to-many `(algorithm, digest)` table. Registration deduplicates
//! across algorithms: any hash of the input mapping that already
//! identifies an artifact resolves the whole registration to that
//! artifact and extends it with the hashes it lacks.

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::{Connection, OptionalExtension, params};

use crate::{
    errors::ProvenanceError,
    store::models::{Artifact, ArtifactDetail, ArtifactJobs, HashEntry, Job, JobType},
    utils::{new_artifact_id, unix_now},
};

/// Prefix lookups below this length always miss.
const MIN_HASH_PREFIX: usize = 8;

/// An artifact listing entry with its most recent output path.
#[derive(Debug, Clone)]
pub struct ArtifactListing {
    pub detail: ArtifactDetail,
    pub path: Option<String>,
}

/// A recently produced output with the job timestamp that produced it.
#[derive(Debug, Clone)]
pub struct RecentOutput {
    pub detail: ArtifactDetail,
    pub path: String,
    pub job_timestamp: f64,
}

/// A unique `(artifact, path)` output record used by verification
/// sweeps.
#[derive(Debug, Clone)]
pub struct OutputRecord {
    pub artifact_id: String,
    pub path: String,
    pub size: i64,
    pub hashes: Vec<HashEntry>,
}

/// Repository over `artifacts` and `artifact_hashes`.
pub struct ArtifactRepository<'c> {
    conn: &'c Connection,
}

impl<'c> ArtifactRepository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Register an artifact under one or more hash digests.
    ///
    /// Digests are lowercased before comparison and storage. If any
    /// `(algorithm, digest)` of the input already identifies an
    /// artifact, that artifact is extended with the input's missing
    /// hashes and `(id, false)` is returned; the mapping is iterated in
    /// algorithm order, so the first match is deterministic. Otherwise a
    /// fresh id is allocated and `(id, true)` returned. An empty mapping
    /// is rejected with [`NoHashes`](ProvenanceError::NoHashes).
    pub fn register(
        &self,
        hashes: &BTreeMap<String, String>,
        size: i64,
        path: Option<&str>,
        source_type: Option<&str>,
        source_url: Option<&str>,
        metadata: Option<&str>,
    ) -> Result<(String, bool), ProvenanceError> {
        if hashes.is_empty() {
            return Err(ProvenanceError::NoHashes);
        }

        for (algorithm, digest) in hashes {
            let digest = digest.to_lowercase();
            let existing: Option<String> = self
                .conn
                .query_row(
                    "SELECT artifact_id FROM artifact_hashes
                     WHERE algorithm = ?1 AND digest = ?2",
                    params![algorithm, digest],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(artifact_id) = existing {
                self.extend_hashes(&artifact_id, hashes)?;
                return Ok((artifact_id, false));
            }
        }

        let artifact_id = new_artifact_id();
        self.conn.execute(
            "INSERT INTO artifacts
                 (id, size, first_seen_at, first_seen_path, source_type, source_url, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                artifact_id,
                size,
                unix_now(),
                path,
                source_type,
                source_url,
                metadata
            ],
        )?;
        for (algorithm, digest) in hashes {
            self.conn.execute(
                "INSERT INTO artifact_hashes (artifact_id, algorithm, digest)
                 VALUES (?1, ?2, ?3)",
                params![artifact_id, algorithm, digest.to_lowercase()],
            )?;
        }
        Ok((artifact_id, true))
    }

    /// Attach the hashes of `hashes` that the artifact does not yet
    /// carry. A hash already owned by a *different* artifact indicates
    /// divergent content under distinct algorithms; it is logged and
    /// left untouched.
    fn extend_hashes(
        &self,
        artifact_id: &str,
        hashes: &BTreeMap<String, String>,
    ) -> Result<(), ProvenanceError> {
        for (algorithm, digest) in hashes {
            let digest = digest.to_lowercase();
            let owner: Option<String> = self
                .conn
                .query_row(
                    "SELECT artifact_id FROM artifact_hashes
                     WHERE algorithm = ?1 AND digest = ?2",
                    params![algorithm, digest],
                    |row| row.get(0),
                )
                .optional()?;

            match owner {
                None => {
                    self.conn.execute(
                        "INSERT INTO artifact_hashes (artifact_id, algorithm, digest)
                         VALUES (?1, ?2, ?3)",
                        params![artifact_id, algorithm, digest],
                    )?;
                }
                Some(owner) if owner != artifact_id => {
                    tracing::warn!(
                        algorithm,
                        digest,
                        resolved = artifact_id,
                        conflicting = owner,
                        "hash mapping matches two distinct artifacts"
                    );
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Artifact by exact id, with hashes.
    pub fn get(&self, artifact_id: &str) -> Result<Option<ArtifactDetail>, ProvenanceError> {
        let artifact = self
            .conn
            .query_row(
                "SELECT * FROM artifacts WHERE id = ?1",
                params![artifact_id],
                Artifact::from_row,
            )
            .optional()?;
        match artifact {
            Some(artifact) => {
                let hashes = self.get_hashes(&artifact.id)?;
                Ok(Some(ArtifactDetail { artifact, hashes }))
            }
            None => Ok(None),
        }
    }

    /// All hash rows for an artifact, ordered by algorithm.
    pub fn get_hashes(&self, artifact_id: &str) -> Result<Vec<HashEntry>, ProvenanceError> {
        let mut stmt = self.conn.prepare(
            "SELECT algorithm, digest FROM artifact_hashes
             WHERE artifact_id = ?1 ORDER BY algorithm",
        )?;
        let rows = stmt.query_map(params![artifact_id], |row| {
            Ok(HashEntry {
                algorithm: row.get(0)?,
                digest: row.get(1)?,
            })
        })?;
        let mut hashes = Vec::new();
        for row in rows {
            hashes.push(row?);
        }
        Ok(hashes)
    }

    /// Artifact by full digest or digest prefix (>= 8 hex chars).
    ///
    /// `algorithm = None` matches any algorithm. An ambiguous prefix
    /// (two or more distinct artifacts) yields `None`, as does a prefix
    /// shorter than the minimum.
    pub fn get_by_hash(
        &self,
        digest: &str,
        algorithm: Option<&str>,
    ) -> Result<Option<ArtifactDetail>, ProvenanceError> {
        let digest = digest.to_lowercase();
        if digest.len() < MIN_HASH_PREFIX {
            return Ok(None);
        }
        let pattern = format!("{digest}%");

        let mut ids: Vec<String> = Vec::new();
        match algorithm {
            Some(algorithm) => {
                let mut stmt = self.conn.prepare(
                    "SELECT DISTINCT artifact_id FROM artifact_hashes
                     WHERE algorithm = ?1 AND digest LIKE ?2 LIMIT 2",
                )?;
                let rows = stmt.query_map(params![algorithm, pattern], |row| row.get(0))?;
                for row in rows {
                    ids.push(row?);
                }
            }
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT DISTINCT artifact_id FROM artifact_hashes
                     WHERE digest LIKE ?1 LIMIT 2",
                )?;
                let rows = stmt.query_map(params![pattern], |row| row.get(0))?;
                for row in rows {
                    ids.push(row?);
                }
            }
        }

        match ids.as_slice() {
            [id] => self.get(id),
            _ => Ok(None),
        }
    }

    /// Most recent artifact associated with a filesystem path.
    ///
    /// Search order: latest producing job's output row, then latest
    /// consuming job's input row, then `first_seen_path`.
    pub fn get_by_path(&self, path: &str) -> Result<Option<ArtifactDetail>, ProvenanceError> {
        let from_outputs: Option<String> = self
            .conn
            .query_row(
                "SELECT jo.artifact_id FROM job_outputs jo
                 JOIN jobs j ON jo.job_id = j.id
                 WHERE jo.path = ?1
                 ORDER BY j.timestamp DESC LIMIT 1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(artifact_id) = from_outputs {
            return self.get(&artifact_id);
        }

        let from_inputs: Option<String> = self
            .conn
            .query_row(
                "SELECT ji.artifact_id FROM job_inputs ji
                 JOIN jobs j ON ji.job_id = j.id
                 WHERE ji.path = ?1
                 ORDER BY j.timestamp DESC LIMIT 1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(artifact_id) = from_inputs {
            return self.get(&artifact_id);
        }

        let from_first_seen: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM artifacts WHERE first_seen_path = ?1 LIMIT 1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        match from_first_seen {
            Some(artifact_id) => self.get(&artifact_id),
            None => Ok(None),
        }
    }

    /// Jobs that produced and consumed an artifact, each most recent
    /// first.
    pub fn get_jobs(&self, artifact_id: &str) -> Result<ArtifactJobs, ProvenanceError> {
        let mut produced_stmt = self.conn.prepare(
            "SELECT DISTINCT jobs.* FROM jobs
             JOIN job_outputs ON jobs.id = job_outputs.job_id
             WHERE job_outputs.artifact_id = ?1
             ORDER BY jobs.timestamp DESC",
        )?;
        let produced = produced_stmt.query_map(params![artifact_id], Job::from_row)?;

        let mut consumed_stmt = self.conn.prepare(
            "SELECT DISTINCT jobs.* FROM jobs
             JOIN job_inputs ON jobs.id = job_inputs.job_id
             WHERE job_inputs.artifact_id = ?1
             ORDER BY jobs.timestamp DESC",
        )?;
        let consumed = consumed_stmt.query_map(params![artifact_id], Job::from_row)?;

        let mut jobs = ArtifactJobs::default();
        for row in produced {
            jobs.produced_by.push(row?);
        }
        for row in consumed {
            jobs.consumed_by.push(row?);
        }
        Ok(jobs)
    }

    /// Every path the artifact has been seen at, lexicographically
    /// sorted: the union of input paths, output paths, and the
    /// first-seen path.
    pub fn get_locations(&self, artifact_id: &str) -> Result<Vec<String>, ProvenanceError> {
        let mut paths: BTreeSet<String> = BTreeSet::new();

        let mut outputs = self
            .conn
            .prepare("SELECT DISTINCT path FROM job_outputs WHERE artifact_id = ?1")?;
        for row in outputs.query_map(params![artifact_id], |row| row.get::<_, String>(0))? {
            paths.insert(row?);
        }

        let mut inputs = self
            .conn
            .prepare("SELECT DISTINCT path FROM job_inputs WHERE artifact_id = ?1")?;
        for row in inputs.query_map(params![artifact_id], |row| row.get::<_, String>(0))? {
            paths.insert(row?);
        }

        let first_seen: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT first_seen_path FROM artifacts WHERE id = ?1",
                params![artifact_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(Some(path)) = first_seen {
            paths.insert(path);
        }

        Ok(paths.into_iter().collect())
    }

    /// Record an upload destination, deduplicated, in the artifact's
    /// JSON `uploaded_to` list. Unknown artifacts are ignored.
    pub fn update_upload(
        &self,
        artifact_id: &str,
        uploaded_to: &str,
    ) -> Result<(), ProvenanceError> {
        let current: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT uploaded_to FROM artifacts WHERE id = ?1",
                params![artifact_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Ok(());
        };

        let mut destinations: Vec<String> = match current.as_deref() {
            Some(json) => serde_json::from_str(json)?,
            None => Vec::new(),
        };
        if destinations.iter().any(|d| d == uploaded_to) {
            return Ok(());
        }
        destinations.push(uploaded_to.to_string());

        self.conn.execute(
            "UPDATE artifacts SET uploaded_to = ?1 WHERE id = ?2",
            params![serde_json::to_string(&destinations)?, artifact_id],
        )?;
        Ok(())
    }

    /// All artifacts, most recently seen first, each with its latest
    /// output path (if any).
    pub fn get_all(&self, limit: usize) -> Result<Vec<ArtifactListing>, ProvenanceError> {
        let mut stmt = self.conn.prepare(
            "SELECT a.*,
                    (SELECT jo.path FROM job_outputs jo
                     JOIN jobs j ON jo.job_id = j.id
                     WHERE jo.artifact_id = a.id
                     ORDER BY j.timestamp DESC LIMIT 1) AS latest_path
             FROM artifacts a
             ORDER BY a.first_seen_at DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((Artifact::from_row(row)?, row.get::<_, Option<String>>("latest_path")?))
        })?;

        let mut listings = Vec::new();
        for row in rows {
            let (artifact, path) = row?;
            let hashes = self.get_hashes(&artifact.id)?;
            listings.push(ArtifactListing {
                detail: ArtifactDetail { artifact, hashes },
                path,
            });
        }
        Ok(listings)
    }

    /// Recently produced outputs, optionally filtered by job type.
    /// `Some(Run)` also matches jobs with no recorded type.
    pub fn get_recent_outputs(
        &self,
        limit: usize,
        job_type: Option<JobType>,
    ) -> Result<Vec<RecentOutput>, ProvenanceError> {
        let type_clause = match job_type {
            Some(JobType::Run) => "AND (j.job_type IS NULL OR j.job_type = 'run')",
            Some(JobType::Build) => "AND j.job_type = 'build'",
            None => "",
        };
        let sql = format!(
            "SELECT a.*, jo.path AS output_path, j.timestamp AS job_timestamp
             FROM artifacts a
             JOIN job_outputs jo ON a.id = jo.artifact_id
             JOIN jobs j ON jo.job_id = j.id
             WHERE 1 = 1 {type_clause}
             ORDER BY j.timestamp DESC
             LIMIT ?1"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                Artifact::from_row(row)?,
                row.get::<_, String>("output_path")?,
                row.get::<_, f64>("job_timestamp")?,
            ))
        })?;

        let mut outputs = Vec::new();
        for row in rows {
            let (artifact, path, job_timestamp) = row?;
            let hashes = self.get_hashes(&artifact.id)?;
            outputs.push(RecentOutput {
                detail: ArtifactDetail { artifact, hashes },
                path,
                job_timestamp,
            });
        }
        Ok(outputs)
    }

    /// Number of distinct artifacts produced by build jobs.
    pub fn count_build_outputs(&self) -> Result<i64, ProvenanceError> {
        Ok(self.conn.query_row(
            "SELECT count(DISTINCT jo.artifact_id) FROM job_outputs jo
             JOIN jobs j ON jo.job_id = j.id
             WHERE j.job_type = 'build'",
            [],
            |row| row.get(0),
        )?)
    }

    /// Every unique `(artifact, path)` output pair, for verification
    /// sweeps over the working tree.
    pub fn get_all_outputs_with_paths(&self) -> Result<Vec<OutputRecord>, ProvenanceError> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT jo.artifact_id, jo.path, a.size
             FROM job_outputs jo
             JOIN artifacts a ON jo.artifact_id = a.id
             ORDER BY a.first_seen_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (artifact_id, path, size) = row?;
            let hashes = self.get_hashes(&artifact_id)?;
            records.push(OutputRecord {
                artifact_id,
                path,
                size,
                hashes,
            });
        }
        Ok(records)
    }

    /// Delete all hash rows for an artifact (orphan sweep helper).
    pub fn delete_hashes(&self, artifact_id: &str) -> Result<(), ProvenanceError> {
        self.conn.execute(
            "DELETE FROM artifact_hashes WHERE artifact_id = ?1",
            params![artifact_id],
        )?;
        Ok(())
    }

    /// Delete an artifact row (orphan sweep helper).
    pub fn delete(&self, artifact_id: &str) -> Result<(), ProvenanceError> {
        self.conn
            .execute("DELETE FROM artifacts WHERE id = ?1", params![artifact_id])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn hashes(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(a, d)| (a.to_string(), d.to_string()))
            .collect()
    }

    #[test]
    fn test_register_requires_hashes() {
        let store = Store::open_in_memory().expect("store");
        let repo = ArtifactRepository::new(store.conn());
        let err = repo
            .register(&BTreeMap::new(), 0, None, None, None, None)
            .unwrap_err();
        assert!(matches!(err, ProvenanceError::NoHashes));
    }

    /// Re-registering under a known hash extends the artifact instead of
    /// creating a new one.
    #[test]
    fn test_register_dedup_across_algorithms() {
        let store = Store::open_in_memory().expect("store");
        let repo = ArtifactRepository::new(store.conn());

        let blake3_digest = "ab".repeat(32);
        let sha256_digest = "cd".repeat(32);

        let (first_id, created) = repo
            .register(
                &hashes(&[("blake3", &blake3_digest)]),
                7,
                Some("/data/p.csv"),
                None,
                None,
                None,
            )
            .expect("register");
        assert!(created);

        let (second_id, created) = repo
            .register(
                &hashes(&[("blake3", &blake3_digest), ("sha256", &sha256_digest)]),
                7,
                Some("/data/p.csv"),
                None,
                None,
                None,
            )
            .expect("register");
        assert!(!created);
        assert_eq!(first_id, second_id);

        let detail = repo.get(&first_id).expect("get").expect("artifact");
        assert_eq!(detail.hashes.len(), 2);
        assert_eq!(detail.digest("blake3"), Some(blake3_digest.as_str()));
        assert_eq!(detail.digest("sha256"), Some(sha256_digest.as_str()));
    }

    #[test]
    fn test_register_lowercases_digests() {
        let store = Store::open_in_memory().expect("store");
        let repo = ArtifactRepository::new(store.conn());

        let upper = "AB".repeat(32);
        let (id, _) = repo
            .register(&hashes(&[("blake3", &upper)]), 1, None, None, None, None)
            .expect("register");
        let detail = repo.get(&id).expect("get").expect("artifact");
        assert_eq!(detail.digest("blake3"), Some("ab".repeat(32).as_str()));
    }

    #[test]
    fn test_get_by_hash_prefix_rules() {
        let store = Store::open_in_memory().expect("store");
        let repo = ArtifactRepository::new(store.conn());

        let digest = format!("1234abcd{}", "0".repeat(56));
        let (id, _) = repo
            .register(&hashes(&[("blake3", &digest)]), 1, None, None, None, None)
            .expect("register");

        assert!(repo.get_by_hash("", None).expect("lookup").is_none());
        assert!(repo.get_by_hash("1234abc", None).expect("lookup").is_none());

        let found = repo
            .get_by_hash("1234abcd", None)
            .expect("lookup")
            .expect("artifact");
        assert_eq!(found.artifact.id, id);

        let found = repo
            .get_by_hash(&digest, Some("blake3"))
            .expect("lookup")
            .expect("artifact");
        assert_eq!(found.artifact.id, id);
        assert!(
            repo.get_by_hash(&digest, Some("sha256"))
                .expect("lookup")
                .is_none()
        );
    }

    #[test]
    fn test_get_by_hash_ambiguous_prefix_is_none() {
        let store = Store::open_in_memory().expect("store");
        let repo = ArtifactRepository::new(store.conn());

        let a = format!("feedbeef11{}", "0".repeat(54));
        let b = format!("feedbeef22{}", "0".repeat(54));
        repo.register(&hashes(&[("blake3", &a)]), 1, None, None, None, None)
            .expect("register");
        repo.register(&hashes(&[("blake3", &b)]), 1, None, None, None, None)
            .expect("register");

        assert!(repo.get_by_hash("feedbeef", None).expect("lookup").is_none());
        assert!(
            repo.get_by_hash("feedbeef11", None)
                .expect("lookup")
                .is_some()
        );
    }

    #[test]
    fn test_update_upload_deduplicates() {
        let store = Store::open_in_memory().expect("store");
        let repo = ArtifactRepository::new(store.conn());

        let (id, _) = repo
            .register(
                &hashes(&[("blake3", &"ee".repeat(32))]),
                1,
                None,
                None,
                None,
                None,
            )
            .expect("register");

        repo.update_upload(&id, "s3://bucket/a").expect("upload");
        repo.update_upload(&id, "s3://bucket/a").expect("upload");
        repo.update_upload(&id, "gs://bucket/b").expect("upload");

        let detail = repo.get(&id).expect("get").expect("artifact");
        let destinations: Vec<String> =
            serde_json::from_str(detail.artifact.uploaded_to.as_deref().expect("json"))
                .expect("parse");
        assert_eq!(destinations, vec!["s3://bucket/a", "gs://bucket/b"]);
    }

    #[test]
    fn test_get_locations_sorted_union() {
        let store = Store::open_in_memory().expect("store");
        let repo = ArtifactRepository::new(store.conn());

        let (id, _) = repo
            .register(
                &hashes(&[("blake3", &"aa".repeat(32))]),
                1,
                Some("/z/first_seen.csv"),
                None,
                None,
                None,
            )
            .expect("register");

        store
            .conn()
            .execute(
                "INSERT INTO jobs (id, timestamp, command) VALUES (1, 1.0, 'x')",
                [],
            )
            .expect("job");
        store
            .conn()
            .execute(
                "INSERT INTO job_outputs (job_id, artifact_id, path) VALUES (1, ?1, '/a/out.csv')",
                params![id],
            )
            .expect("output");
        store
            .conn()
            .execute(
                "INSERT INTO job_inputs (job_id, artifact_id, path) VALUES (1, ?1, '/m/in.csv')",
                params![id],
            )
            .expect("input");

        assert_eq!(
            repo.get_locations(&id).expect("locations"),
            vec!["/a/out.csv", "/m/in.csv", "/z/first_seen.csv"]
        );
    }
}
