//! Provider seams for the external collaborators the engine consumes.
//!
//! Version control, experiment telemetry, and cloud storage live in
//! separate tooling; the engine only ever sees them through the narrow
//! traits below. Implementations are supplied by the embedding
//! application (a git CLI wrapper, a W&B detector, an S3 uploader) and
//! stay out of this crate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::ProvenanceError;

/// Repository context captured for a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VcsInfo {
    /// Remote URL or local path identifying the repository.
    pub repo: Option<String>,
    /// Commit hash at execution time.
    pub commit: Option<String>,
    /// Branch name at execution time.
    pub branch: Option<String>,
    /// Whether the working tree had uncommitted changes.
    pub dirty: bool,
}

/// How a path relates to the repository a job ran in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileClass {
    /// Under the repository root and known to version control.
    Tracked,
    /// Under the repository root but not committed.
    Untracked,
    /// Outside the repository root.
    External,
    /// Under an installed-package prefix.
    SitePackage,
}

/// Version control backend the invoker queries before recording.
pub trait VcsProvider {
    /// Backend identifier, e.g. `git`.
    fn name(&self) -> &'static str;

    /// Repository root containing `path`, if any.
    fn repo_root(&self, path: &str) -> Result<Option<String>, ProvenanceError>;

    /// Repository context at `repo_root`.
    fn info(&self, repo_root: &str) -> Result<VcsInfo, ProvenanceError>;

    /// Classify a path relative to the repository.
    fn classify_file(&self, repo_root: &str, path: &str)
    -> Result<FileClass, ProvenanceError>;

    /// Whether the backing tool is installed.
    fn is_available(&self) -> bool {
        true
    }
}

/// One experiment-tracker run detected during a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRun {
    /// Provider identifier, e.g. `wandb`.
    pub provider: String,
    pub run_id: String,
    pub url: Option<String>,
    /// Provider-specific extras (project, entity, sweep id).
    pub extra: BTreeMap<String, String>,
}

/// Experiment tracking backend consulted after a job finishes. Detected
/// runs are serialized into the job's `telemetry` JSON column.
pub trait TelemetryProvider {
    /// Provider identifier, e.g. `wandb`, `mlflow`.
    fn name(&self) -> &'static str;

    /// Runs created under `repo_root` inside the job's time window.
    fn detect_runs(
        &self,
        repo_root: &str,
        start_time: f64,
        end_time: f64,
    ) -> Result<Vec<TelemetryRun>, ProvenanceError>;

    /// Whether the backing library or directory layout is present.
    fn is_available(&self) -> bool {
        true
    }
}

/// Cloud storage backend used to sync artifacts; successful uploads are
/// recorded through the artifact repository's `update_upload`.
pub trait CloudStorageProvider {
    /// URL scheme this provider handles, e.g. `s3`, `gs`.
    fn scheme(&self) -> &'static str;

    /// Split a provider URL into `(bucket, key)`.
    fn parse_url(&self, url: &str) -> Result<(String, String), ProvenanceError>;

    /// Upload a local file, returning the destination URL.
    fn upload(&self, local_path: &str, url: &str) -> Result<String, ProvenanceError>;

    /// Download a remote object to a local path.
    fn download(&self, url: &str, local_path: &str) -> Result<(), ProvenanceError>;

    /// Whether the provider's tooling is installed.
    fn is_available(&self) -> bool {
        true
    }
}
