//! Lineage reconstruction.
//!
//! The job DAG is implicit in `job_inputs`/`job_outputs` sharing
//! artifact ids; this service reconstructs the upstream subgraph of a
//! target artifact per query via depth-first traversal of most-recent
//! producers. Visited sets and the depth bound make the traversal
//! terminate even if a degenerate store contains a cycle; a cycle is a
//! diagnostic, never a panic.
//!
//! Lineage extraction keys on BLAKE3: I/O entries without a BLAKE3
//! digest are dropped from the emitted pairs.

use std::collections::HashSet;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::{
    errors::ProvenanceError,
    store::{
        artifact::ArtifactRepository,
        job::JobRepository,
        models::{ArtifactDetail, Job, JobIoEntry},
    },
};

/// One side of a job's I/O in lineage output: the BLAKE3 digest plus the
/// path observed during execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoRef {
    pub hash: String,
    pub path: String,
    pub size: i64,
}

impl IoRef {
    fn from_entry(entry: &JobIoEntry) -> Option<Self> {
        let hash = entry.blake3()?.to_string();
        Some(Self {
            hash,
            path: entry.effective_path().unwrap_or_default().to_string(),
            size: entry.size,
        })
    }
}

/// A job in a lineage listing, with its (possibly filtered) I/O.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageJob {
    pub job: Job,
    pub inputs: Vec<IoRef>,
    pub outputs: Vec<IoRef>,
    pub input_artifact_ids: Vec<String>,
    pub output_artifact_ids: Vec<String>,
}

/// Filtered lineage of one target artifact.
#[derive(Debug, Clone)]
pub struct FilteredLineage {
    pub target: ArtifactDetail,
    /// Producing jobs, timestamp ascending, I/O restricted to on-path
    /// artifacts.
    pub jobs: Vec<LineageJob>,
    /// BLAKE3 digests of every artifact on a path from the target to
    /// the roots.
    pub on_path_hashes: HashSet<String>,
}

/// Node of the nested upstream tree view.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LineageNode {
    /// Traversal stopped here: depth exceeded or already visited.
    Truncated { id: String },
    /// The artifact id could not be resolved.
    NotFound { id: String },
    /// A resolved artifact and, when known, the job that produced it.
    Artifact {
        detail: ArtifactDetail,
        produced_by: Option<LineageProducer>,
    },
}

/// The producing job inside a [`LineageNode`] tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageProducer {
    pub job_id: i64,
    pub command: String,
    pub timestamp: f64,
    pub inputs: Vec<LineageNode>,
}

/// Upstream traversal over producers of artifacts.
pub struct LineageService<'c> {
    conn: &'c Connection,
}

impl<'c> LineageService<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Resolve a target reference: exact artifact id first, then BLAKE3
    /// digest or digest prefix.
    fn resolve(&self, reference: &str) -> Result<Option<ArtifactDetail>, ProvenanceError> {
        let artifacts = ArtifactRepository::new(self.conn);
        if let Some(detail) = artifacts.get(reference)? {
            return Ok(Some(detail));
        }
        artifacts.get_by_hash(reference, Some("blake3"))
    }

    /// Most recent producer of an artifact, if any.
    fn producer(&self, artifact_id: &str) -> Result<Option<Job>, ProvenanceError> {
        let artifacts = ArtifactRepository::new(self.conn);
        let mut jobs = artifacts.get_jobs(artifact_id)?;
        Ok(if jobs.produced_by.is_empty() {
            None
        } else {
            Some(jobs.produced_by.remove(0))
        })
    }

    /// Every job in the lineage DAG of the given targets, sorted by
    /// timestamp ascending (topological under the time order of
    /// production). Unresolvable targets are dropped.
    pub fn get_lineage_jobs(
        &self,
        targets: &[String],
        max_depth: usize,
    ) -> Result<Vec<LineageJob>, ProvenanceError> {
        let mut resolved = Vec::new();
        for target in targets {
            if let Some(detail) = self.resolve(target)? {
                resolved.push(detail.artifact.id.clone());
            } else {
                tracing::debug!(target, "lineage target did not resolve");
            }
        }

        let mut visited_artifacts: HashSet<String> = HashSet::new();
        let mut visited_jobs: HashSet<i64> = HashSet::new();
        let mut lineage: Vec<LineageJob> = Vec::new();

        for artifact_id in resolved {
            self.trace_jobs(
                &artifact_id,
                0,
                max_depth,
                &mut visited_artifacts,
                &mut visited_jobs,
                &mut lineage,
            )?;
        }

        lineage.sort_by(|a, b| {
            a.job
                .timestamp
                .partial_cmp(&b.job.timestamp)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(lineage)
    }

    fn trace_jobs(
        &self,
        artifact_id: &str,
        depth: usize,
        max_depth: usize,
        visited_artifacts: &mut HashSet<String>,
        visited_jobs: &mut HashSet<i64>,
        lineage: &mut Vec<LineageJob>,
    ) -> Result<(), ProvenanceError> {
        if depth > max_depth || !visited_artifacts.insert(artifact_id.to_string()) {
            return Ok(());
        }

        let Some(producer) = self.producer(artifact_id)? else {
            return Ok(());
        };
        if !visited_jobs.insert(producer.id) {
            return Ok(());
        }

        let jobs = JobRepository::new(self.conn);
        let inputs = jobs.get_inputs(producer.id)?;
        let outputs = jobs.get_outputs(producer.id)?;

        let entry = LineageJob {
            inputs: inputs.iter().filter_map(IoRef::from_entry).collect(),
            outputs: outputs.iter().filter_map(IoRef::from_entry).collect(),
            input_artifact_ids: inputs.iter().map(|i| i.artifact_id.clone()).collect(),
            output_artifact_ids: outputs.iter().map(|o| o.artifact_id.clone()).collect(),
            job: producer,
        };

        for input in &inputs {
            self.trace_jobs(
                &input.artifact_id,
                depth + 1,
                max_depth,
                visited_artifacts,
                visited_jobs,
                lineage,
            )?;
        }

        lineage.push(entry);
        Ok(())
    }

    /// Lineage of one target with I/O restricted to on-path artifacts.
    ///
    /// The on-path set is the target's BLAKE3 digest plus the digest of
    /// every input of every visited producing job; each job's outputs
    /// and inputs are filtered against it. Returns `None` when the
    /// target does not resolve or carries no BLAKE3 digest.
    pub fn get_filtered_lineage(
        &self,
        target: &str,
        max_depth: usize,
    ) -> Result<Option<FilteredLineage>, ProvenanceError> {
        let Some(detail) = self.resolve(target)? else {
            return Ok(None);
        };
        let Some(target_hash) = detail.blake3().map(str::to_string) else {
            return Ok(None);
        };

        let mut on_path: HashSet<String> = HashSet::new();
        on_path.insert(target_hash);

        let mut visited_artifacts: HashSet<String> = HashSet::new();
        let mut visited_jobs: HashSet<i64> = HashSet::new();
        // (job, all inputs, all outputs) in visit order; filtered below.
        let mut collected: Vec<(Job, Vec<JobIoEntry>, Vec<JobIoEntry>)> = Vec::new();

        self.trace_filtered(
            &detail.artifact.id,
            0,
            max_depth,
            &mut on_path,
            &mut visited_artifacts,
            &mut visited_jobs,
            &mut collected,
        )?;

        let mut lineage: Vec<LineageJob> = collected
            .into_iter()
            .map(|(job, inputs, outputs)| LineageJob {
                inputs: inputs
                    .iter()
                    .filter_map(IoRef::from_entry)
                    .filter(|r| on_path.contains(&r.hash))
                    .collect(),
                outputs: outputs
                    .iter()
                    .filter_map(IoRef::from_entry)
                    .filter(|r| on_path.contains(&r.hash))
                    .collect(),
                input_artifact_ids: inputs.iter().map(|i| i.artifact_id.clone()).collect(),
                output_artifact_ids: outputs.iter().map(|o| o.artifact_id.clone()).collect(),
                job,
            })
            .collect();

        lineage.sort_by(|a, b| {
            a.job
                .timestamp
                .partial_cmp(&b.job.timestamp)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(Some(FilteredLineage {
            target: detail,
            jobs: lineage,
            on_path_hashes: on_path,
        }))
    }

    #[allow(clippy::too_many_arguments)]
    fn trace_filtered(
        &self,
        artifact_id: &str,
        depth: usize,
        max_depth: usize,
        on_path: &mut HashSet<String>,
        visited_artifacts: &mut HashSet<String>,
        visited_jobs: &mut HashSet<i64>,
        collected: &mut Vec<(Job, Vec<JobIoEntry>, Vec<JobIoEntry>)>,
    ) -> Result<(), ProvenanceError> {
        if depth > max_depth || !visited_artifacts.insert(artifact_id.to_string()) {
            return Ok(());
        }

        let Some(producer) = self.producer(artifact_id)? else {
            return Ok(());
        };
        if !visited_jobs.insert(producer.id) {
            return Ok(());
        }

        let jobs = JobRepository::new(self.conn);
        let inputs = jobs.get_inputs(producer.id)?;
        let outputs = jobs.get_outputs(producer.id)?;

        for input in &inputs {
            if let Some(hash) = input.blake3() {
                on_path.insert(hash.to_string());
            }
            self.trace_filtered(
                &input.artifact_id,
                depth + 1,
                max_depth,
                on_path,
                visited_artifacts,
                visited_jobs,
                collected,
            )?;
        }

        collected.push((producer, inputs, outputs));
        Ok(())
    }

    /// Nested upstream tree for one artifact, truncated at `depth`.
    pub fn get_artifact_lineage(
        &self,
        reference: &str,
        depth: usize,
    ) -> Result<LineageNode, ProvenanceError> {
        let artifacts = ArtifactRepository::new(self.conn);
        let resolved = match artifacts.get(reference)? {
            Some(detail) => Some(detail),
            None => artifacts.get_by_hash(reference, None)?,
        };
        let artifact_id = resolved
            .map(|d| d.artifact.id)
            .unwrap_or_else(|| reference.to_string());

        let mut visited = HashSet::new();
        self.trace_tree(&artifact_id, 0, depth, &mut visited)
    }

    fn trace_tree(
        &self,
        artifact_id: &str,
        current_depth: usize,
        max_depth: usize,
        visited: &mut HashSet<String>,
    ) -> Result<LineageNode, ProvenanceError> {
        if current_depth > max_depth || !visited.insert(artifact_id.to_string()) {
            return Ok(LineageNode::Truncated {
                id: artifact_id.to_string(),
            });
        }

        let artifacts = ArtifactRepository::new(self.conn);
        let Some(detail) = artifacts.get(artifact_id)? else {
            return Ok(LineageNode::NotFound {
                id: artifact_id.to_string(),
            });
        };

        let produced_by = match self.producer(artifact_id)? {
            Some(producer) => {
                let jobs = JobRepository::new(self.conn);
                let inputs = jobs.get_inputs(producer.id)?;
                let mut nodes = Vec::with_capacity(inputs.len());
                for input in &inputs {
                    nodes.push(self.trace_tree(
                        &input.artifact_id,
                        current_depth + 1,
                        max_depth,
                        visited,
                    )?);
                }
                Some(LineageProducer {
                    job_id: producer.id,
                    command: producer.command,
                    timestamp: producer.timestamp,
                    inputs: nodes,
                })
            }
            None => None,
        };

        Ok(LineageNode::Artifact { detail, produced_by })
    }
}
