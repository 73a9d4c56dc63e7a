//! Shared utilities for pipetrace including wall-clock capture, random
//! identifier generation, and hex-string validation helpers.

use rand::RngCore;
use rand::rngs::OsRng;
use uuid::Uuid;

/// Current wall-clock time as fractional unix seconds, the resolution the
/// store persists in its REAL columns.
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Fresh artifact identifier: 32 lowercase hex characters (16 random bytes).
/// Stable across algorithm additions; carries no content information.
pub fn new_artifact_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Fresh job uid: 8 lowercase hex characters (4 bytes from the OS RNG).
pub fn new_job_uid() -> String {
    let mut bytes = [0u8; 4];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Fresh session hash: 64 lowercase hex characters (32 bytes from the OS
/// RNG). Assigned at creation and never recomputed; it identifies the
/// session, not its contents.
pub fn new_session_hash() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Whether `s` is non-empty and consists only of lowercase hex digits.
pub fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
