//! Error types for the pipetrace crate.
//!
//! This module defines a unified error enumeration used across hashing,
//! the relational store, job recording, and lineage reconstruction. It
//! integrates with `thiserror` to provide rich `Display` implementations
//! and error source chaining where applicable.
//!
//! Notes:
//! - Each variant carries contextual details via its message payload.
//! - Unreadable files are not an error: the hashing service reports them
//!   as `None` and the recording service drops the affected path.
//! - Ambiguous prefix lookups are likewise observable as `None` results,
//!   not as errors.

use thiserror::Error;

#[derive(Error, Debug)]
/// Unified error enumeration for the pipetrace library.
///
/// - Used across hash dispatch, the artifact/job/session repositories,
///   job recording and lineage services.
/// - Implements `std::error::Error` via `thiserror`.
pub enum ProvenanceError {
    /// A caller named a hash algorithm that is not registered.
    #[error("The `{0}` is not a registered hash algorithm.")]
    UnknownAlgorithm(String),

    /// A registered algorithm cannot construct a hasher on this platform.
    #[error("Hash algorithm `{0}` is unavailable: {1}")]
    AlgorithmUnavailable(String, String),

    /// Artifact registration was attempted with an empty hash mapping.
    #[error("At least one hash is required to register an artifact.")]
    NoHashes,

    /// Parsing a `@N` / `@BN` step reference failed.
    #[error("Invalid step reference `{0}`: {1}")]
    InvalidStepReference(String, String),

    /// The underlying relational store reported an error. Constraint
    /// violations abort the enclosing transaction.
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// I/O error from underlying reader or writer.
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),

    /// Encoding or decoding a JSON metadata document failed.
    #[error("Invalid metadata document: {0}")]
    InvalidMetadata(#[from] serde_json::Error),

    /// Generic custom error for miscellaneous failures.
    #[error("{0}")]
    CustomError(String),
}

impl ProvenanceError {
    /// Whether this error is a relational constraint conflict (unique or
    /// foreign key violation) reported by the store.
    pub fn is_store_conflict(&self) -> bool {
        match self {
            ProvenanceError::Store(rusqlite::Error::SqliteFailure(err, _)) => {
                matches!(err.code, rusqlite::ErrorCode::ConstraintViolation)
            }
            _ => false,
        }
    }
}
