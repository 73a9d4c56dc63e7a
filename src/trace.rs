//! Typed documents exchanged with external collaborators.
//!
//! The subprocess tracer is a separate process; the engine consumes its
//! output as a [`TraceRecord`]. The invoker classifies
//! `opened_files` into inputs and outputs (by stat comparison around
//! the job's start) before calling the recording service; that
//! classification is not done here.
//!
//! [`JobMetadata`] models the recognized keys of the `jobs.metadata`
//! JSON column, which reproduction tooling reads back to recreate the
//! environment.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::ProvenanceError;

/// One record emitted by the tracer per execution.
///
/// Unknown fields are ignored so tracer versions can evolve
/// independently of the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceRecord {
    /// Absolute paths the process opened.
    pub opened_files: Vec<String>,
    /// Names of modules imported during the run.
    pub imported_modules: Vec<String>,
    /// Environment variables read, with the values observed.
    pub env_reads: BTreeMap<String, String>,
    /// Absolute paths of the files backing imported modules.
    pub modules_files: Vec<String>,
    /// Shared libraries loaded by the process.
    pub shared_libs: Vec<String>,
    /// Installed packages with exact versions.
    pub installed_packages: BTreeMap<String, String>,
    /// Packages actually imported; version may be unknown.
    pub used_packages: BTreeMap<String, Option<String>>,
    pub sys_prefix: Option<String>,
    pub sys_base_prefix: Option<String>,
    pub virtual_env: Option<String>,
    /// The traced process argv.
    pub argv: Vec<String>,
}

impl TraceRecord {
    pub fn from_json(json: &str) -> Result<Self, ProvenanceError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, ProvenanceError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Package sets captured for a job, split by ecosystem and by run vs
/// build phase. Values are versions where known.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Packages {
    pub pip: BTreeMap<String, Option<String>>,
    pub dpkg: BTreeMap<String, Option<String>>,
    pub build_pip: BTreeMap<String, Option<String>>,
    pub build_dpkg: BTreeMap<String, Option<String>>,
}

impl Packages {
    /// Split a package map into exact-version (`name == version`) and
    /// any-version (`name` only) install sets, the shape reproduction
    /// consumers install from.
    pub fn split_install_sets(
        packages: &BTreeMap<String, Option<String>>,
    ) -> (BTreeMap<String, String>, Vec<String>) {
        let mut exact = BTreeMap::new();
        let mut any = Vec::new();
        for (name, version) in packages {
            match version {
                Some(version) => {
                    exact.insert(name.clone(), version.clone());
                }
                None => any.push(name.clone()),
            }
        }
        (exact, any)
    }
}

/// Descriptive environment snapshot recorded with a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeInfo {
    pub os: Option<String>,
    pub cpu: Option<String>,
    pub cuda: Option<String>,
    pub gpu: Option<String>,
}

/// Recognized structure of the `jobs.metadata` JSON column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobMetadata {
    pub packages: Packages,
    pub runtime: RuntimeInfo,
    /// Environment variables to reapply at reproduction.
    pub env_vars: BTreeMap<String, String>,
}

impl JobMetadata {
    pub fn from_json(json: &str) -> Result<Self, ProvenanceError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, ProvenanceError> {
        Ok(serde_json::to_string(self)?)
    }
}
