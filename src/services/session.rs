//! Session DAG analyses.
//!
//! All analyses operate on the *latest execution* of each step: the job
//! row with the highest timestamp per step number. The DAG itself is
//! never materialized; dependencies are reconstructed per query from
//! path-level producer/consumer overlap between the latest executions.
//!
//! A step is directly stale when it consumed an artifact that differs
//! from what the current producer of the same path emits; staleness then
//! propagates downstream to a fixed point. Artifacts inherit a
//! three-state lattice from their producing execution: `active`,
//! `stale`, or `superseded`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::{
    errors::ProvenanceError,
    store::{
        job::JobRepository,
        models::{GitConsistency, Job, SessionSummary},
        session::SessionRepository,
    },
};

/// State of an artifact relative to its session's DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactState {
    /// Produced by the latest execution of a non-stale step.
    Active,
    /// Produced by the latest execution of a stale step.
    Stale,
    /// Produced by an execution that is not the latest of its step.
    Superseded,
}

/// Reconstructed dependency structure of a session's latest executions.
#[derive(Debug, Default)]
pub struct DagDependencies {
    /// Current producer per output path: `path -> (step, artifact)`.
    /// On a path collision the higher step number wins.
    pub outputs_now: HashMap<String, (i64, String)>,
    /// `step -> upstream steps` it consumes from.
    pub depends_on: BTreeMap<i64, BTreeSet<i64>>,
    /// `step -> path -> artifact id` actually consumed by its latest
    /// execution, restricted to paths some earlier step produces.
    pub consumed_artifacts: BTreeMap<i64, BTreeMap<String, String>>,
}

/// Analyses over one session's step DAG.
pub struct SessionService<'c> {
    conn: &'c Connection,
}

impl<'c> SessionService<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Latest execution of each step number.
    fn latest_by_step(&self, session_id: i64) -> Result<BTreeMap<i64, Job>, ProvenanceError> {
        let sessions = SessionRepository::new(self.conn);
        let mut latest: BTreeMap<i64, Job> = BTreeMap::new();
        for job in sessions.get_steps(session_id)? {
            let Some(number) = job.step_number else {
                continue;
            };
            match latest.get(&number) {
                Some(existing) if existing.timestamp >= job.timestamp => {}
                _ => {
                    latest.insert(number, job);
                }
            }
        }
        Ok(latest)
    }

    /// Reconstruct the dependency edges between latest executions.
    pub fn dependencies(&self, session_id: i64) -> Result<DagDependencies, ProvenanceError> {
        let latest = self.latest_by_step(session_id)?;
        let jobs = JobRepository::new(self.conn);

        let mut dag = DagDependencies::default();
        for (&number, job) in &latest {
            for output in jobs.get_outputs(job.id)? {
                let Some(path) = output.effective_path() else {
                    continue;
                };
                match dag.outputs_now.get(path) {
                    Some((producer, _)) if *producer > number => {}
                    _ => {
                        dag.outputs_now
                            .insert(path.to_string(), (number, output.artifact_id.clone()));
                    }
                }
            }
        }

        for (&number, job) in &latest {
            let depends = dag.depends_on.entry(number).or_default();
            let consumed = dag.consumed_artifacts.entry(number).or_default();
            for input in jobs.get_inputs(job.id)? {
                let Some(path) = input.effective_path() else {
                    continue;
                };
                if let Some((producer, _)) = dag.outputs_now.get(path) {
                    if *producer < number {
                        depends.insert(*producer);
                        consumed.insert(path.to_string(), input.artifact_id.clone());
                    }
                }
            }
        }
        Ok(dag)
    }

    /// Step numbers whose latest execution is stale, directly or through
    /// an upstream dependency. Sorted ascending.
    pub fn get_stale_steps(&self, session_id: i64) -> Result<Vec<i64>, ProvenanceError> {
        let dag = self.dependencies(session_id)?;

        let mut stale: BTreeSet<i64> = BTreeSet::new();
        for (number, consumed) in &dag.consumed_artifacts {
            for (path, consumed_artifact) in consumed {
                if let Some((_, current_artifact)) = dag.outputs_now.get(path) {
                    if consumed_artifact != current_artifact {
                        stale.insert(*number);
                        break;
                    }
                }
            }
        }

        // Propagate downstream to a fixed point.
        loop {
            let mut changed = false;
            for (number, depends) in &dag.depends_on {
                if !stale.contains(number) && depends.iter().any(|d| stale.contains(d)) {
                    stale.insert(*number);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        Ok(stale.into_iter().collect())
    }

    /// Artifacts produced by the latest execution of any stale step.
    pub fn get_stale_artifacts(&self, session_id: i64) -> Result<Vec<String>, ProvenanceError> {
        let stale: HashSet<i64> = self.get_stale_steps(session_id)?.into_iter().collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let latest = self.latest_by_step(session_id)?;
        let jobs = JobRepository::new(self.conn);

        let mut artifact_ids = Vec::new();
        let mut seen = HashSet::new();
        for (number, job) in &latest {
            if !stale.contains(number) {
                continue;
            }
            for output in jobs.get_outputs(job.id)? {
                if seen.insert(output.artifact_id.clone()) {
                    artifact_ids.push(output.artifact_id);
                }
            }
        }
        Ok(artifact_ids)
    }

    /// Steps whose latest execution consumes any artifact produced by
    /// the latest execution of `step_number`. Sorted ascending.
    pub fn get_downstream_steps(
        &self,
        session_id: i64,
        step_number: i64,
    ) -> Result<Vec<i64>, ProvenanceError> {
        let latest = self.latest_by_step(session_id)?;
        let Some(source) = latest.get(&step_number) else {
            return Ok(Vec::new());
        };

        let jobs = JobRepository::new(self.conn);
        let source_artifacts: HashSet<String> = jobs
            .get_outputs(source.id)?
            .into_iter()
            .map(|o| o.artifact_id)
            .collect();
        if source_artifacts.is_empty() {
            return Ok(Vec::new());
        }

        let mut downstream = Vec::new();
        for (&number, job) in &latest {
            if number == step_number {
                continue;
            }
            let consumes = jobs
                .get_inputs(job.id)?
                .iter()
                .any(|input| source_artifacts.contains(&input.artifact_id));
            if consumes {
                downstream.push(number);
            }
        }
        Ok(downstream)
    }

    /// Classify every artifact produced within the session.
    ///
    /// Base lattice: outputs of non-latest executions are superseded;
    /// outputs of latest executions are stale when their step is stale,
    /// else active. The expanded view additionally propagates
    /// supersession through historical consumption: an execution that
    /// consumed a superseded artifact has superseded outputs, to a fixed
    /// point. Staleness takes precedence over expanded supersession.
    pub fn get_artifact_states(
        &self,
        session_id: i64,
        expanded: bool,
    ) -> Result<BTreeMap<String, ArtifactState>, ProvenanceError> {
        let sessions = SessionRepository::new(self.conn);
        let jobs = JobRepository::new(self.conn);

        let executions = sessions.get_steps(session_id)?;
        let latest = self.latest_by_step(session_id)?;
        let stale: HashSet<i64> = self.get_stale_steps(session_id)?.into_iter().collect();

        let is_latest = |job: &Job| {
            job.step_number
                .and_then(|n| latest.get(&n))
                .map(|l| l.id == job.id)
                .unwrap_or(false)
        };

        let mut states: BTreeMap<String, ArtifactState> = BTreeMap::new();
        let mut superseded: HashSet<String> = HashSet::new();

        for job in &executions {
            if is_latest(job) {
                continue;
            }
            for output in jobs.get_outputs(job.id)? {
                superseded.insert(output.artifact_id.clone());
                states.insert(output.artifact_id, ArtifactState::Superseded);
            }
        }

        // Latest executions overwrite: the current producer decides.
        for job in &executions {
            if !is_latest(job) {
                continue;
            }
            let step_stale = job.step_number.map(|n| stale.contains(&n)).unwrap_or(false);
            for output in jobs.get_outputs(job.id)? {
                let state = if step_stale {
                    ArtifactState::Stale
                } else {
                    ArtifactState::Active
                };
                superseded.remove(&output.artifact_id);
                states.insert(output.artifact_id, state);
            }
        }

        if expanded {
            loop {
                let mut changed = false;
                for job in &executions {
                    let tainted = jobs
                        .get_inputs(job.id)?
                        .iter()
                        .any(|input| superseded.contains(&input.artifact_id));
                    if !tainted {
                        continue;
                    }
                    for output in jobs.get_outputs(job.id)? {
                        if superseded.insert(output.artifact_id.clone()) {
                            changed = true;
                            if states.get(&output.artifact_id) != Some(&ArtifactState::Stale) {
                                states.insert(output.artifact_id, ArtifactState::Superseded);
                            }
                        }
                    }
                }
                if !changed {
                    break;
                }
            }
        }

        Ok(states)
    }

    /// Display summary of the session (latest execution per step).
    pub fn get_summary(
        &self,
        session_id: i64,
    ) -> Result<Option<SessionSummary>, ProvenanceError> {
        SessionRepository::new(self.conn).get_summary(session_id)
    }

    /// Whether the session's jobs all agree on one git commit.
    pub fn check_git_consistency(
        &self,
        session_id: i64,
    ) -> Result<GitConsistency, ProvenanceError> {
        SessionRepository::new(self.conn).check_git_consistency(session_id)
    }
}
