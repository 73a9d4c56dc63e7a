//! Step reference parser for DAG node references.
//!
//! `@N` names run step N; `@BN` names build step N. The leading `@` and
//! the `B` are both optional on input (`3`, `B1`), but the canonical
//! rendering always includes them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{errors::ProvenanceError, store::models::JobType};

/// A parsed step reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReference {
    /// 1-indexed step number.
    pub step_number: i64,
    /// Build step (`@BN`) vs run step (`@N`).
    pub is_build: bool,
    /// The reference string as given.
    pub original: String,
}

impl StepReference {
    /// Job type filter matching this reference in step queries. Run
    /// references match jobs with no recorded type.
    pub fn job_type(&self) -> Option<JobType> {
        self.is_build.then_some(JobType::Build)
    }
}

impl fmt::Display for StepReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_build {
            write!(f, "@B{}", self.step_number)
        } else {
            write!(f, "@{}", self.step_number)
        }
    }
}

/// Quick check whether a string uses step reference syntax.
pub fn is_step_reference(s: &str) -> bool {
    s.starts_with('@')
}

/// Parse a step reference string (`@1`, `@B2`, `3`, `B1`).
pub fn parse_step_reference(reference: &str) -> Result<StepReference, ProvenanceError> {
    let invalid = |detail: &str| {
        ProvenanceError::InvalidStepReference(reference.to_string(), detail.to_string())
    };

    let mut working = reference.strip_prefix('@').unwrap_or(reference);
    if working.is_empty() {
        return Err(invalid("empty after removing @"));
    }

    let is_build = working.starts_with('B') || working.starts_with('b');
    if is_build {
        working = &working[1..];
        if working.is_empty() {
            return Err(invalid("no step number after B"));
        }
    }

    if !working.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("expected a number; use @N or @BN"));
    }
    let step_number: i64 = working
        .parse()
        .map_err(|_| invalid("step number out of range"))?;
    if step_number < 1 {
        return Err(invalid("step number must be positive"));
    }

    Ok(StepReference {
        step_number,
        is_build,
        original: reference.to_string(),
    })
}
