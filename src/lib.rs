//! Pipetrace is a local provenance engine for computational pipelines:
//! it hashes the files a command reads and writes into a
//! content-addressed artifact store, records the execution as an
//! immutable job, places it as a step in the active session, and
//! reconstructs lineage DAGs and staleness information from the
//! accumulated records.
pub mod errors;
pub mod hashing;
pub mod lookup;
pub mod providers;
pub mod services;
pub mod store;
pub mod trace;
pub mod utils;
