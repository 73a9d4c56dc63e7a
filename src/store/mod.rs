//! The relational provenance store and its repositories.
//!
//! [`Store`] owns the SQLite connection, applies the schema at open
//! time, and hands out transactions. Repositories borrow a connection
//! (or a transaction, which derefs to one) per call scope, so a single
//! `record_job` transaction can span artifact registration, job
//! creation, session placement, and the hash cache.

pub mod artifact;
pub mod collection;
pub mod hash_cache;
pub mod job;
pub mod models;
pub mod schema;
pub mod session;

use std::path::Path;

use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::errors::ProvenanceError;

/// Handle to one provenance database.
///
/// The store is single-process: mutating calls serialize on SQLite's
/// writer lock (transactions are opened `IMMEDIATE`), and every service
/// call sees a consistent snapshot for its duration.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if necessary) a store at `path` and apply the
    /// schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ProvenanceError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// In-memory store, used by tests and ephemeral analyses.
    pub fn open_in_memory() -> Result<Self, ProvenanceError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, ProvenanceError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        conn.execute_batch(schema::SCHEMA)?;
        conn.execute_batch(schema::FTS_SCHEMA)?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
            [schema::SCHEMA_VERSION],
        )?;
        Ok(Self { conn })
    }

    /// Shared connection for read paths and single-statement writes.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Begin an immediate (write-locked) transaction. Dropping the
    /// returned handle without committing rolls everything back.
    pub fn begin(&mut self) -> Result<Transaction<'_>, ProvenanceError> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }

    /// Recorded schema version.
    pub fn schema_version(&self) -> Result<i64, ProvenanceError> {
        Ok(self
            .conn
            .query_row("SELECT max(version) FROM schema_version", [], |row| {
                row.get(0)
            })?)
    }
}
