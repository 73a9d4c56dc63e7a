//! Job repository.
//!
//! Immutable execution records and their input/output associations.
//! Linking is idempotent with respect to the composite primary key
//! `(job_id, artifact_id, path)`; a job row is never updated after
//! creation except for `synced_at`.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use crate::{
    errors::ProvenanceError,
    store::{
        artifact::ArtifactRepository,
        models::{Job, JobIoEntry, JobType},
    },
    utils::new_job_uid,
};

/// Uid prefix lookups below this length always miss.
const MIN_UID_PREFIX: usize = 4;

/// Extract the primary script name from a command: the basename of the
/// first `*.py`/`*.sh` token, else the token following `-m`.
pub fn extract_script(command: &str) -> Option<String> {
    let parts: Vec<&str> = command.split_whitespace().collect();
    for (i, part) in parts.iter().enumerate() {
        if part.ends_with(".py") || part.ends_with(".sh") {
            return Path::new(part)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned());
        }
        if *part == "-m" && i + 1 < parts.len() {
            return Some(parts[i + 1].to_string());
        }
    }
    None
}

/// Field set for creating a job row. `script` is derived from the
/// command; `job_uid` is generated.
#[derive(Debug, Default)]
pub struct NewJob<'a> {
    pub command: &'a str,
    pub timestamp: f64,
    pub step_identity: Option<&'a str>,
    pub session_id: Option<i64>,
    pub step_number: Option<i64>,
    pub step_name: Option<&'a str>,
    pub git_repo: Option<&'a str>,
    pub git_commit: Option<&'a str>,
    pub git_branch: Option<&'a str>,
    pub duration_seconds: Option<f64>,
    pub exit_code: Option<i64>,
    pub status: Option<&'a str>,
    pub metadata: Option<&'a str>,
    pub job_type: Option<JobType>,
    pub telemetry: Option<&'a str>,
}

impl<'a> NewJob<'a> {
    pub fn new(command: &'a str, timestamp: f64) -> Self {
        Self {
            command,
            timestamp,
            ..Default::default()
        }
    }
}

/// Repository over `jobs`, `job_inputs`, and `job_outputs`.
pub struct JobRepository<'c> {
    conn: &'c Connection,
}

impl<'c> JobRepository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Insert a job row, generating its 8-hex uid from the OS RNG and
    /// deriving `script` from the command. Returns `(job_id, job_uid)`.
    pub fn create(&self, job: &NewJob) -> Result<(i64, String), ProvenanceError> {
        let script = extract_script(job.command);
        let job_uid = new_job_uid();

        self.conn.execute(
            "INSERT INTO jobs
                 (job_uid, timestamp, command, script, step_identity, session_id,
                  step_number, step_name, git_repo, git_commit, git_branch,
                  duration_seconds, exit_code, status, job_type, metadata, telemetry)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                job_uid,
                job.timestamp,
                job.command,
                script,
                job.step_identity,
                job.session_id,
                job.step_number,
                job.step_name,
                job.git_repo,
                job.git_commit,
                job.git_branch,
                job.duration_seconds,
                job.exit_code,
                job.status,
                job.job_type.map(|t| t.as_str()),
                job.metadata,
                job.telemetry,
            ],
        )?;
        Ok((self.conn.last_insert_rowid(), job_uid))
    }

    /// Job by local sequence id.
    pub fn get(&self, job_id: i64) -> Result<Option<Job>, ProvenanceError> {
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM jobs WHERE id = ?1",
                params![job_id],
                Job::from_row,
            )
            .optional()?)
    }

    /// Job by uid, exact first, then prefix (>= 4 chars). An ambiguous
    /// prefix yields `None`.
    pub fn get_by_uid(&self, job_uid: &str) -> Result<Option<Job>, ProvenanceError> {
        let exact = self
            .conn
            .query_row(
                "SELECT * FROM jobs WHERE job_uid = ?1",
                params![job_uid],
                Job::from_row,
            )
            .optional()?;
        if exact.is_some() {
            return Ok(exact);
        }

        if job_uid.len() < MIN_UID_PREFIX {
            return Ok(None);
        }

        let mut stmt = self
            .conn
            .prepare("SELECT * FROM jobs WHERE job_uid LIKE ?1 LIMIT 2")?;
        let rows = stmt.query_map(params![format!("{job_uid}%")], Job::from_row)?;
        let mut matches = Vec::new();
        for row in rows {
            matches.push(row?);
        }
        match matches.len() {
            1 => Ok(matches.pop()),
            _ => Ok(None),
        }
    }

    /// Record an input artifact for a job. Re-linking the same
    /// `(job, artifact, path)` is a no-op.
    pub fn add_input(
        &self,
        job_id: i64,
        artifact_id: &str,
        path: &str,
    ) -> Result<(), ProvenanceError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO job_inputs (job_id, artifact_id, path) VALUES (?1, ?2, ?3)",
            params![job_id, artifact_id, path],
        )?;
        Ok(())
    }

    /// Record an output artifact for a job. Re-linking the same
    /// `(job, artifact, path)` is a no-op.
    pub fn add_output(
        &self,
        job_id: i64,
        artifact_id: &str,
        path: &str,
    ) -> Result<(), ProvenanceError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO job_outputs (job_id, artifact_id, path) VALUES (?1, ?2, ?3)",
            params![job_id, artifact_id, path],
        )?;
        Ok(())
    }

    /// Input associations for a job, resolved against the artifact
    /// table.
    pub fn get_inputs(&self, job_id: i64) -> Result<Vec<JobIoEntry>, ProvenanceError> {
        self.get_io(job_id, "job_inputs")
    }

    /// Output associations for a job, resolved against the artifact
    /// table.
    pub fn get_outputs(&self, job_id: i64) -> Result<Vec<JobIoEntry>, ProvenanceError> {
        self.get_io(job_id, "job_outputs")
    }

    fn get_io(&self, job_id: i64, table: &str) -> Result<Vec<JobIoEntry>, ProvenanceError> {
        let sql = format!(
            "SELECT io.path, io.artifact_id, a.size, a.first_seen_path
             FROM {table} io
             JOIN artifacts a ON io.artifact_id = a.id
             WHERE io.job_id = ?1
             ORDER BY io.path"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![job_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let artifacts = ArtifactRepository::new(self.conn);
        let mut entries = Vec::new();
        for row in rows {
            let (path, artifact_id, size, first_seen_path) = row?;
            let hashes = artifacts.get_hashes(&artifact_id)?;
            entries.push(JobIoEntry {
                path,
                artifact_id,
                size,
                hashes,
                first_seen_path,
            });
        }
        Ok(entries)
    }

    /// Most recent jobs.
    pub fn get_recent(&self, limit: usize) -> Result<Vec<Job>, ProvenanceError> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM jobs ORDER BY timestamp DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], Job::from_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    /// Jobs of one session, most recent first.
    pub fn get_by_session(
        &self,
        session_id: i64,
        limit: usize,
    ) -> Result<Vec<Job>, ProvenanceError> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM jobs WHERE session_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session_id, limit as i64], Job::from_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    /// Full-text search over command and script. Terms are quoted so
    /// shell punctuation in the query cannot break the FTS syntax.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<Job>, ProvenanceError> {
        let match_expr = query
            .split_whitespace()
            .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(" ");
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }

        let mut stmt = self.conn.prepare(
            "SELECT j.* FROM jobs j
             JOIN jobs_fts fts ON j.id = fts.rowid
             WHERE jobs_fts MATCH ?1
             ORDER BY j.timestamp DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![match_expr, limit as i64], Job::from_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    /// Jobs that ran a specific script, by exact name, suffix, or
    /// command substring.
    pub fn get_by_script(&self, script: &str, limit: usize) -> Result<Vec<Job>, ProvenanceError> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM jobs
             WHERE script = ?1 OR script LIKE ?2 OR command LIKE ?3
             ORDER BY timestamp DESC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![
                script,
                format!("%{script}"),
                format!("%{script}%"),
                limit as i64
            ],
            Job::from_row,
        )?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    /// Every unique written file across all jobs, ordered by path.
    pub fn get_all_written_files(&self) -> Result<Vec<JobIoEntry>, ProvenanceError> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT jo.path, jo.artifact_id, a.size, a.first_seen_path
             FROM job_outputs jo
             JOIN artifacts a ON jo.artifact_id = a.id
             ORDER BY jo.path",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let artifacts = ArtifactRepository::new(self.conn);
        let mut entries = Vec::new();
        for row in rows {
            let (path, artifact_id, size, first_seen_path) = row?;
            let hashes = artifacts.get_hashes(&artifact_id)?;
            entries.push(JobIoEntry {
                path,
                artifact_id,
                size,
                hashes,
                first_seen_path,
            });
        }
        Ok(entries)
    }

    /// Delete a job and its I/O association rows.
    pub fn delete_job(&self, job_id: i64) -> Result<(), ProvenanceError> {
        self.conn
            .execute("DELETE FROM job_inputs WHERE job_id = ?1", params![job_id])?;
        self.conn
            .execute("DELETE FROM job_outputs WHERE job_id = ?1", params![job_id])?;
        self.conn
            .execute("DELETE FROM jobs WHERE id = ?1", params![job_id])?;
        Ok(())
    }

    /// Delete each listed artifact iff nothing references it: no job
    /// input, no job output, no collection membership. Idempotent;
    /// assumes the caller holds the write lock.
    pub fn cleanup_orphaned_artifacts(
        &self,
        artifact_ids: &[String],
    ) -> Result<usize, ProvenanceError> {
        let artifacts = ArtifactRepository::new(self.conn);
        let mut removed = 0;
        for artifact_id in artifact_ids {
            if self.is_referenced(artifact_id)? {
                continue;
            }
            artifacts.delete_hashes(artifact_id)?;
            artifacts.delete(artifact_id)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Remove output records for the given artifacts, then delete any of
    /// them left orphaned.
    pub fn clear_output_records(
        &self,
        artifact_ids: &[String],
    ) -> Result<(), ProvenanceError> {
        let artifacts = ArtifactRepository::new(self.conn);
        for artifact_id in artifact_ids {
            self.conn.execute(
                "DELETE FROM job_outputs WHERE artifact_id = ?1",
                params![artifact_id],
            )?;
        }
        for artifact_id in artifact_ids {
            if self.is_referenced(artifact_id)? {
                continue;
            }
            artifacts.delete_hashes(artifact_id)?;
            artifacts.delete(artifact_id)?;
        }
        Ok(())
    }

    fn is_referenced(&self, artifact_id: &str) -> Result<bool, ProvenanceError> {
        let referenced: i64 = self.conn.query_row(
            "SELECT
                 EXISTS (SELECT 1 FROM job_inputs WHERE artifact_id = ?1)
               + EXISTS (SELECT 1 FROM job_outputs WHERE artifact_id = ?1)
               + EXISTS (SELECT 1 FROM collection_members WHERE artifact_id = ?1)",
            params![artifact_id],
            |row| row.get(0),
        )?;
        Ok(referenced > 0)
    }

    /// Stamp a job's remote sync time, the only mutable job column.
    pub fn mark_synced(&self, job_id: i64, synced_at: f64) -> Result<(), ProvenanceError> {
        self.conn.execute(
            "UPDATE jobs SET synced_at = ?1 WHERE id = ?2",
            params![synced_at, job_id],
        )?;
        Ok(())
    }
}
