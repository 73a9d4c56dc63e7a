//! Job recording service.
//!
//! The single write path of the engine: one call registers a command
//! execution, its hashed I/O artifacts, and its placement in the active
//! session, all inside one immediate transaction. Any failure before
//! commit leaves the store unchanged; a hashing failure for a single
//! path is not fatal, the path is dropped and the job still recorded.

use std::fs;

use rusqlite::Connection;

use crate::{
    errors::ProvenanceError,
    hashing::{HashRegistry, HashingService},
    store::{
        Store,
        artifact::ArtifactRepository,
        job::{JobRepository, NewJob},
        models::JobType,
        session::{SessionRepository, compute_step_identity},
    },
};

/// Everything a caller supplies to record one execution.
#[derive(Debug, Clone)]
pub struct RecordJobRequest {
    /// Full command string as executed.
    pub command: String,
    /// Start time (unix seconds).
    pub timestamp: f64,
    pub git_repo: Option<String>,
    pub git_commit: Option<String>,
    pub git_branch: Option<String>,
    pub duration_seconds: Option<f64>,
    pub exit_code: Option<i64>,
    /// Paths the command read, as observed by the tracer.
    pub input_files: Vec<String>,
    /// Paths the command wrote, as observed by the tracer.
    pub output_files: Vec<String>,
    /// JSON metadata document (see [`crate::trace::JobMetadata`]).
    pub metadata: Option<String>,
    pub step_name: Option<String>,
    /// Whether to place the job in the active session (default true).
    pub assign_to_session: bool,
    pub job_type: Option<JobType>,
    /// Repository root used for path normalization.
    pub repo_root: Option<String>,
    /// JSON telemetry links.
    pub telemetry: Option<String>,
    /// Algorithms to hash artifacts with. BLAKE3 is always included so
    /// every registered artifact stays reachable by lineage extraction.
    pub hash_algorithms: Vec<String>,
}

impl RecordJobRequest {
    pub fn new(command: impl Into<String>, timestamp: f64) -> Self {
        Self {
            command: command.into(),
            timestamp,
            git_repo: None,
            git_commit: None,
            git_branch: None,
            duration_seconds: None,
            exit_code: None,
            input_files: Vec::new(),
            output_files: Vec::new(),
            metadata: None,
            step_name: None,
            assign_to_session: true,
            job_type: None,
            repo_root: None,
            telemetry: None,
            hash_algorithms: vec!["blake3".to_string()],
        }
    }
}

/// Outcome of a successful recording.
#[derive(Debug, Clone)]
pub struct RecordedJob {
    pub job_id: i64,
    pub job_uid: String,
    pub session_id: Option<i64>,
    pub step_number: Option<i64>,
    pub step_identity: String,
}

/// Service combining the repositories and the hashing service into the
/// transactional `record_job` operation.
pub struct JobRecordingService<'s, 'r> {
    store: &'s mut Store,
    registry: &'r HashRegistry,
}

impl<'s, 'r> JobRecordingService<'s, 'r> {
    pub fn new(store: &'s mut Store, registry: &'r HashRegistry) -> Self {
        Self { store, registry }
    }

    /// Record a job with its inputs and outputs.
    ///
    /// Procedure, executed in one immediate transaction:
    /// 1. drop every path BLAKE3 cannot hash (missing or unreadable);
    /// 2. compute the step identity over the surviving paths;
    /// 3. place the job in the active session (created on demand),
    ///    reusing the step number of a previously seen identity;
    /// 4. insert the job row;
    /// 5. hash each surviving path with the requested algorithm set in
    ///    one pass, register the artifacts, and link them idempotently.
    pub fn record_job(
        &mut self,
        request: &RecordJobRequest,
    ) -> Result<RecordedJob, ProvenanceError> {
        let hashing = HashingService::new(self.registry);
        let tx = self.store.begin()?;
        let recorded = Self::record_in_tx(&tx, &hashing, request)?;
        tx.commit()?;
        Ok(recorded)
    }

    fn record_in_tx(
        conn: &Connection,
        hashing: &HashingService,
        request: &RecordJobRequest,
    ) -> Result<RecordedJob, ProvenanceError> {
        let inputs = Self::filter_hashable(conn, hashing, &request.input_files)?;
        let outputs = Self::filter_hashable(conn, hashing, &request.output_files)?;

        let step_identity = compute_step_identity(
            &inputs,
            &outputs,
            request.repo_root.as_deref(),
            Some(&request.command),
        );

        let (session_id, step_number) = if request.assign_to_session {
            let sessions = SessionRepository::new(conn);
            let session_id = sessions.get_or_create_active()?;

            let step_number = match sessions.get_step_by_identity(session_id, &step_identity)? {
                Some(previous) => match previous.step_number {
                    Some(number) => number,
                    None => sessions.get_next_step_number(session_id)?,
                },
                None => sessions.get_next_step_number(session_id)?,
            };
            sessions.update_current_step(session_id, step_number)?;
            if let Some(commit) = request.git_commit.as_deref() {
                sessions.update_git_commits(session_id, commit, true)?;
            }
            (Some(session_id), Some(step_number))
        } else {
            (None, None)
        };

        let jobs = JobRepository::new(conn);
        let (job_id, job_uid) = jobs.create(&NewJob {
            command: &request.command,
            timestamp: request.timestamp,
            step_identity: Some(&step_identity),
            session_id,
            step_number,
            step_name: request.step_name.as_deref(),
            git_repo: request.git_repo.as_deref(),
            git_commit: request.git_commit.as_deref(),
            git_branch: request.git_branch.as_deref(),
            duration_seconds: request.duration_seconds,
            exit_code: request.exit_code,
            status: None,
            metadata: request.metadata.as_deref(),
            job_type: request.job_type,
            telemetry: request.telemetry.as_deref(),
        })?;

        let mut algorithms = request.hash_algorithms.clone();
        if !algorithms.iter().any(|a| a == "blake3") {
            algorithms.insert(0, "blake3".to_string());
        }

        Self::register_io(conn, hashing, &jobs, job_id, &inputs, &algorithms, true)?;
        Self::register_io(conn, hashing, &jobs, job_id, &outputs, &algorithms, false)?;

        Ok(RecordedJob {
            job_id,
            job_uid,
            session_id,
            step_number,
            step_identity,
        })
    }

    /// Keep only paths BLAKE3 can hash, preserving order. Hashes land
    /// in the cache, so the registration pass below reuses them.
    fn filter_hashable(
        conn: &Connection,
        hashing: &HashingService,
        files: &[String],
    ) -> Result<Vec<String>, ProvenanceError> {
        let mut hashable = Vec::with_capacity(files.len());
        for path in files {
            match hashing.compute_hash(conn, path, "blake3")? {
                Some(_) => hashable.push(path.clone()),
                None => {
                    tracing::debug!(path, "dropping unhashable file from job record");
                }
            }
        }
        Ok(hashable)
    }

    fn register_io(
        conn: &Connection,
        hashing: &HashingService,
        jobs: &JobRepository,
        job_id: i64,
        paths: &[String],
        algorithms: &[String],
        is_input: bool,
    ) -> Result<(), ProvenanceError> {
        let artifacts = ArtifactRepository::new(conn);
        for path in paths {
            let Some(hashes) = hashing.compute_hashes(conn, path, algorithms)? else {
                // Vanished between the filter pass and registration.
                tracing::debug!(path, "file disappeared before artifact registration");
                continue;
            };
            let size = fs::metadata(path).map(|m| m.len() as i64).unwrap_or(0);
            let (artifact_id, _) =
                artifacts.register(&hashes, size, Some(path), None, None, None)?;
            if is_input {
                jobs.add_input(job_id, &artifact_id, path)?;
            } else {
                jobs.add_output(job_id, &artifact_id, path)?;
            }
        }
        Ok(())
    }
}
