//! Entity lookup: resolve a user-supplied identifier to the entity it
//! names.
//!
//! Accepted identifier shapes:
//! - step references (`@N` run step, `@BN` build step) against the
//!   active session;
//! - job uids (8 hex chars, prefix match from 4);
//! - artifact hashes (prefix match from 8);
//! - session hashes (64 hex chars).
//!
//! Short hex strings are ambiguous between job uids and artifact hash
//! prefixes; jobs are tried first, matching how uids are displayed.

use rusqlite::Connection;

use crate::{
    errors::ProvenanceError,
    lookup::step_parser::{is_step_reference, parse_step_reference},
    store::{
        artifact::ArtifactRepository,
        job::JobRepository,
        models::{ArtifactDetail, Job, Session},
        session::SessionRepository,
    },
    utils::is_lower_hex,
};

/// A successfully resolved identifier.
#[derive(Debug, Clone)]
pub enum LookupResult {
    /// Resolved via job uid.
    Job(Job),
    /// Resolved via artifact hash (full or prefix).
    Artifact(ArtifactDetail),
    /// Resolved via session hash.
    Session(Session),
    /// Resolved via a step reference against the active session.
    SessionStep(Job),
}

/// Resolver over the repositories.
pub struct EntityLookup<'c> {
    conn: &'c Connection,
}

impl<'c> EntityLookup<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Resolve an identifier, trying each shape in turn. A malformed
    /// step reference is an error; everything else simply resolves to
    /// `None` when nothing matches.
    pub fn lookup(&self, identifier: &str) -> Result<Option<LookupResult>, ProvenanceError> {
        if is_step_reference(identifier) {
            return self.lookup_step(identifier);
        }
        if !is_lower_hex(identifier) {
            return Ok(None);
        }

        if identifier.len() <= 8 {
            if let Some(job) = self.lookup_job(identifier)? {
                return Ok(Some(LookupResult::Job(job)));
            }
        }

        if let Some(detail) = self.lookup_artifact(identifier)? {
            return Ok(Some(LookupResult::Artifact(detail)));
        }

        if identifier.len() == 64 {
            if let Some(session) =
                SessionRepository::new(self.conn).get_by_hash(identifier)?
            {
                return Ok(Some(LookupResult::Session(session)));
            }
        }

        Ok(None)
    }

    /// Job by uid, exact or prefix.
    pub fn lookup_job(&self, uid: &str) -> Result<Option<Job>, ProvenanceError> {
        JobRepository::new(self.conn).get_by_uid(uid)
    }

    /// Artifact by hash prefix across all algorithms.
    pub fn lookup_artifact(
        &self,
        hash_prefix: &str,
    ) -> Result<Option<ArtifactDetail>, ProvenanceError> {
        ArtifactRepository::new(self.conn).get_by_hash(hash_prefix, None)
    }

    /// Step of the active session named by a `@N` / `@BN` reference.
    pub fn lookup_step(
        &self,
        reference: &str,
    ) -> Result<Option<LookupResult>, ProvenanceError> {
        let parsed = parse_step_reference(reference)?;
        let sessions = SessionRepository::new(self.conn);
        let Some(active) = sessions.get_active()? else {
            return Ok(None);
        };
        let step = sessions.get_step_by_number(active.id, parsed.step_number, parsed.job_type())?;
        Ok(step.map(LookupResult::SessionStep))
    }
}
