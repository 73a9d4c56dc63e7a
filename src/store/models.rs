//! Typed rows of the provenance store.
//!
//! Every struct mirrors one table of the schema in
//! [`schema`](super::schema) and carries a `from_row` mapper used by the
//! repositories. Relationships are by identifier only: artifacts are
//! shared among jobs and collections by `artifact_id`, and their
//! lifetime is the union over all referencing rows.

use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// Content-addressed file artifact.
///
/// Created by the first successful hashing that produces an unknown
/// `(algorithm, digest)`; extended with new hash rows when a later
/// registration provides an additional algorithm; deleted only by an
/// explicit orphan sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Opaque 32-hex-char identifier, stable across algorithm additions.
    pub id: String,
    /// Size in bytes at first registration.
    pub size: i64,
    /// Wall-clock registration time (unix seconds).
    pub first_seen_at: f64,
    /// Path observed at first registration, if any. Not unique.
    pub first_seen_path: Option<String>,
    /// Provenance annotation: where the content came from (e.g. `https`).
    pub source_type: Option<String>,
    /// Original download URL when `source_type` names a remote source.
    pub source_url: Option<String>,
    /// JSON list of upload destinations, deduplicated.
    pub uploaded_to: Option<String>,
    /// Last remote sync time, if ever synced.
    pub synced_at: Option<f64>,
    /// Free-form JSON annotations.
    pub metadata: Option<String>,
}

impl Artifact {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            size: row.get("size")?,
            first_seen_at: row.get("first_seen_at")?,
            first_seen_path: row.get("first_seen_path")?,
            source_type: row.get("source_type")?,
            source_url: row.get("source_url")?,
            uploaded_to: row.get("uploaded_to")?,
            synced_at: row.get("synced_at")?,
            metadata: row.get("metadata")?,
        })
    }
}

/// One `(algorithm, digest)` pair attached to an artifact. Globally
/// unique; the same artifact may carry several rows under distinct
/// algorithms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashEntry {
    pub algorithm: String,
    /// Lowercase hex digest.
    pub digest: String,
}

/// An artifact together with all of its hash rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDetail {
    pub artifact: Artifact,
    /// Every `(algorithm, digest)` pair recorded for the artifact.
    /// Non-empty by invariant.
    pub hashes: Vec<HashEntry>,
}

impl ArtifactDetail {
    /// Digest under a specific algorithm, if recorded.
    pub fn digest(&self, algorithm: &str) -> Option<&str> {
        self.hashes
            .iter()
            .find(|h| h.algorithm == algorithm)
            .map(|h| h.digest.as_str())
    }

    /// BLAKE3 digest; lineage extraction keys on this.
    pub fn blake3(&self) -> Option<&str> {
        self.digest("blake3")
    }

    /// First recorded digest, used where a single display hash is needed.
    pub fn primary_digest(&self) -> Option<&str> {
        self.hashes.first().map(|h| h.digest.as_str())
    }
}

/// Job classification: wrapper-invoked runs vs. environment builds.
/// Absent (`NULL`) rows are treated as runs by step lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Run,
    Build,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Run => "run",
            JobType::Build => "build",
        }
    }

    pub(crate) fn from_column(value: Option<String>) -> Option<Self> {
        match value.as_deref() {
            Some("run") => Some(JobType::Run),
            Some("build") => Some(JobType::Build),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of a single command execution.
///
/// Never updated after creation except for `synced_at`. When
/// `session_id` is set, `step_number` is a dense 1-based ordinal within
/// that session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Local sequence id.
    pub id: i64,
    /// 8-hex-char random identifier; prefix lookups need >= 4 chars.
    pub job_uid: Option<String>,
    /// Start time (unix seconds).
    pub timestamp: f64,
    /// Full command string as executed.
    pub command: String,
    /// Derived: first `*.py`/`*.sh` token in the command, else the token
    /// after `-m`.
    pub script: Option<String>,
    /// 64-hex BLAKE3 over normalized I/O paths; maps re-executions of
    /// the same logical step to the same step slot.
    pub step_identity: Option<String>,
    pub session_id: Option<i64>,
    pub step_number: Option<i64>,
    /// User-assigned step name.
    pub step_name: Option<String>,
    pub git_repo: Option<String>,
    pub git_commit: Option<String>,
    pub git_branch: Option<String>,
    pub duration_seconds: Option<f64>,
    pub exit_code: Option<i64>,
    pub synced_at: Option<f64>,
    pub status: Option<String>,
    pub job_type: Option<JobType>,
    /// JSON document; recognized keys are modeled in [`crate::trace`].
    pub metadata: Option<String>,
    /// JSON links to external experiment trackers.
    pub telemetry: Option<String>,
}

impl Job {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            job_uid: row.get("job_uid")?,
            timestamp: row.get("timestamp")?,
            command: row.get("command")?,
            script: row.get("script")?,
            step_identity: row.get("step_identity")?,
            session_id: row.get("session_id")?,
            step_number: row.get("step_number")?,
            step_name: row.get("step_name")?,
            git_repo: row.get("git_repo")?,
            git_commit: row.get("git_commit")?,
            git_branch: row.get("git_branch")?,
            duration_seconds: row.get("duration_seconds")?,
            exit_code: row.get("exit_code")?,
            synced_at: row.get("synced_at")?,
            status: row.get("status")?,
            job_type: JobType::from_column(row.get("job_type")?),
            metadata: row.get("metadata")?,
            telemetry: row.get("telemetry")?,
        })
    }
}

/// Input or output association resolved against the artifact table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobIoEntry {
    /// Filesystem location observed during execution. May be empty for
    /// rows imported from older stores.
    pub path: String,
    pub artifact_id: String,
    pub size: i64,
    pub hashes: Vec<HashEntry>,
    /// Fallback location from the artifact row.
    pub first_seen_path: Option<String>,
}

impl JobIoEntry {
    /// The association path, falling back to the artifact's first-seen
    /// path when the row carries an empty string.
    pub fn effective_path(&self) -> Option<&str> {
        if !self.path.is_empty() {
            return Some(&self.path);
        }
        self.first_seen_path.as_deref().filter(|p| !p.is_empty())
    }

    /// Digest under a specific algorithm, if recorded.
    pub fn digest(&self, algorithm: &str) -> Option<&str> {
        self.hashes
            .iter()
            .find(|h| h.algorithm == algorithm)
            .map(|h| h.digest.as_str())
    }

    /// BLAKE3 digest; lineage extraction keys on this.
    pub fn blake3(&self) -> Option<&str> {
        self.digest("blake3")
    }
}

/// Producer/consumer view of an artifact, each timestamp-descending.
#[derive(Debug, Clone, Default)]
pub struct ArtifactJobs {
    pub produced_by: Vec<Job>,
    pub consumed_by: Vec<Job>,
}

/// Ordered container of steps forming a reproducible pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    /// 64-hex-char random identifier assigned at creation, never
    /// mutated.
    pub hash: Option<String>,
    pub created_at: f64,
    /// Hash of the artifact this session was reconstructed from, if any.
    pub source_artifact_hash: Option<String>,
    /// Step number of the most recent assignment.
    pub current_step: i64,
    /// At most one session is active at any instant.
    pub is_active: bool,
    pub git_repo: Option<String>,
    /// First non-null commit seen across the session's jobs.
    pub git_commit_start: Option<String>,
    /// Latest commit seen; overwritten on every update.
    pub git_commit_end: Option<String>,
    pub synced_at: Option<f64>,
    pub metadata: Option<String>,
}

impl Session {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            hash: row.get("hash")?,
            created_at: row.get("created_at")?,
            source_artifact_hash: row.get("source_artifact_hash")?,
            current_step: row.get("current_step")?,
            is_active: row.get::<_, i64>("is_active")? != 0,
            git_repo: row.get("git_repo")?,
            git_commit_start: row.get("git_commit_start")?,
            git_commit_end: row.get("git_commit_end")?,
            synced_at: row.get("synced_at")?,
            metadata: row.get("metadata")?,
        })
    }
}

/// Result of checking whether a session mixes git commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConsistency {
    /// True iff at most one distinct non-null commit appears.
    pub consistent: bool,
    pub commits: Vec<String>,
    pub warning: Option<String>,
}

/// Display-oriented session digest: one entry per step number, latest
/// execution only.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: i64,
    pub hash: Option<String>,
    pub created_at: f64,
    pub current_step: i64,
    pub total_steps: usize,
    pub is_active: bool,
    pub git_consistent: bool,
    pub git_warning: Option<String>,
    /// Latest execution of each step, ascending by step number.
    pub steps: Vec<Job>,
}

/// Named group of artifacts and/or child collections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub id: i64,
    pub name: String,
    pub collection_type: Option<String>,
    pub source_type: Option<String>,
    pub source_url: Option<String>,
    pub uploaded_to: Option<String>,
    pub created_at: f64,
    pub synced_at: Option<f64>,
    pub metadata: Option<String>,
}

impl Collection {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            collection_type: row.get("collection_type")?,
            source_type: row.get("source_type")?,
            source_url: row.get("source_url")?,
            uploaded_to: row.get("uploaded_to")?,
            created_at: row.get("created_at")?,
            synced_at: row.get("synced_at")?,
            metadata: row.get("metadata")?,
        })
    }
}

/// Membership row: references exactly one of artifact or child
/// collection (enforced by a check constraint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionMember {
    pub id: i64,
    pub collection_id: i64,
    pub artifact_id: Option<String>,
    pub child_collection_id: Option<i64>,
    pub path_in_collection: Option<String>,
}

impl CollectionMember {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            collection_id: row.get("collection_id")?,
            artifact_id: row.get("artifact_id")?,
            child_collection_id: row.get("child_collection_id")?,
            path_in_collection: row.get("path_in_collection")?,
        })
    }
}
