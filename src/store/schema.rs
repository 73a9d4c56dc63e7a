//! SQLite schema definition for the provenance store.
//!
//! The schema is applied idempotently at open time. Logical layout:
//! - `artifacts` / `artifact_hashes`: content-addressed objects with
//!   one row per `(algorithm, digest)` pair.
//! - `jobs` / `job_inputs` / `job_outputs`: immutable execution records
//!   and their I/O associations (composite primary keys make linking
//!   idempotent).
//! - `sessions`: ordered step containers; at most one row is active.
//! - `hash_cache`: `(path, algorithm)` digest cache validated by
//!   size + mtime.
//! - `collections` / `collection_members`: named artifact groups; each
//!   member references exactly one of artifact or child collection.
//! - `jobs_fts`: FTS5 index over command/script, kept in sync by
//!   triggers.

/// Current schema version, recorded in `schema_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Tables, constraints, and indexes.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS artifacts (
    id TEXT PRIMARY KEY,
    size INTEGER NOT NULL,
    first_seen_at REAL NOT NULL,
    first_seen_path TEXT,
    source_type TEXT,
    source_url TEXT,
    uploaded_to TEXT,              -- JSON list of destinations
    synced_at REAL,
    metadata TEXT                  -- JSON
);
CREATE INDEX IF NOT EXISTS idx_artifacts_first_seen ON artifacts(first_seen_at);
CREATE INDEX IF NOT EXISTS idx_artifacts_synced ON artifacts(synced_at);

CREATE TABLE IF NOT EXISTS artifact_hashes (
    artifact_id TEXT NOT NULL REFERENCES artifacts(id) ON DELETE CASCADE,
    algorithm TEXT NOT NULL,
    digest TEXT NOT NULL,
    PRIMARY KEY (algorithm, digest)
);
CREATE INDEX IF NOT EXISTS idx_artifact_hashes_artifact ON artifact_hashes(artifact_id);
CREATE INDEX IF NOT EXISTS idx_artifact_hashes_digest ON artifact_hashes(digest);

CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    hash TEXT UNIQUE,              -- 64 hex chars, fixed at creation
    created_at REAL NOT NULL,
    source_artifact_hash TEXT,
    current_step INTEGER DEFAULT 1,
    is_active INTEGER DEFAULT 0,
    git_repo TEXT,
    git_commit_start TEXT,
    git_commit_end TEXT,
    synced_at REAL,
    metadata TEXT
);
CREATE INDEX IF NOT EXISTS idx_sessions_hash ON sessions(hash);
CREATE INDEX IF NOT EXISTS idx_sessions_source ON sessions(source_artifact_hash);
CREATE INDEX IF NOT EXISTS idx_sessions_active ON sessions(is_active);

CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_uid TEXT UNIQUE,           -- 8 hex chars
    timestamp REAL NOT NULL,
    command TEXT NOT NULL,
    script TEXT,
    step_identity TEXT,            -- 64 hex chars, BLAKE3 of normalized I/O
    session_id INTEGER REFERENCES sessions(id),
    step_number INTEGER,
    step_name TEXT,
    git_repo TEXT,
    git_commit TEXT,
    git_branch TEXT,
    duration_seconds REAL,
    exit_code INTEGER,
    synced_at REAL,
    status TEXT,
    job_type TEXT,                 -- 'run', 'build', or NULL
    metadata TEXT,                 -- JSON
    telemetry TEXT                 -- JSON
);
CREATE INDEX IF NOT EXISTS idx_jobs_timestamp ON jobs(timestamp);
CREATE INDEX IF NOT EXISTS idx_jobs_script ON jobs(script);
CREATE INDEX IF NOT EXISTS idx_jobs_git_commit ON jobs(git_commit);
CREATE INDEX IF NOT EXISTS idx_jobs_synced ON jobs(synced_at);
CREATE INDEX IF NOT EXISTS idx_jobs_session ON jobs(session_id);
CREATE INDEX IF NOT EXISTS idx_jobs_step_identity ON jobs(step_identity);

CREATE TABLE IF NOT EXISTS job_inputs (
    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    artifact_id TEXT NOT NULL REFERENCES artifacts(id),
    path TEXT NOT NULL,
    PRIMARY KEY (job_id, artifact_id, path)
);
CREATE INDEX IF NOT EXISTS idx_job_inputs_artifact ON job_inputs(artifact_id);
CREATE INDEX IF NOT EXISTS idx_job_inputs_path ON job_inputs(path);

CREATE TABLE IF NOT EXISTS job_outputs (
    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    artifact_id TEXT NOT NULL REFERENCES artifacts(id),
    path TEXT NOT NULL,
    PRIMARY KEY (job_id, artifact_id, path)
);
CREATE INDEX IF NOT EXISTS idx_job_outputs_artifact ON job_outputs(artifact_id);
CREATE INDEX IF NOT EXISTS idx_job_outputs_path ON job_outputs(path);

CREATE TABLE IF NOT EXISTS collections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    collection_type TEXT,
    source_type TEXT,
    source_url TEXT,
    uploaded_to TEXT,
    created_at REAL NOT NULL,
    synced_at REAL,
    metadata TEXT
);
CREATE INDEX IF NOT EXISTS idx_collections_name ON collections(name);
CREATE INDEX IF NOT EXISTS idx_collections_type ON collections(collection_type);
CREATE INDEX IF NOT EXISTS idx_collections_source ON collections(source_url);

CREATE TABLE IF NOT EXISTS collection_members (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection_id INTEGER NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
    artifact_id TEXT REFERENCES artifacts(id),
    child_collection_id INTEGER REFERENCES collections(id) ON DELETE CASCADE,
    path_in_collection TEXT,
    CHECK ((artifact_id IS NULL) != (child_collection_id IS NULL))
);
CREATE INDEX IF NOT EXISTS idx_collection_members_collection ON collection_members(collection_id);
CREATE INDEX IF NOT EXISTS idx_collection_members_artifact ON collection_members(artifact_id);
CREATE INDEX IF NOT EXISTS idx_collection_members_child ON collection_members(child_collection_id);

CREATE TABLE IF NOT EXISTS hash_cache (
    path TEXT NOT NULL,
    algorithm TEXT NOT NULL,
    digest TEXT NOT NULL,
    size INTEGER NOT NULL,
    mtime REAL NOT NULL,
    cached_at REAL NOT NULL,
    PRIMARY KEY (path, algorithm)
);
CREATE INDEX IF NOT EXISTS idx_hash_cache_path ON hash_cache(path);
CREATE INDEX IF NOT EXISTS idx_hash_cache_updated ON hash_cache(cached_at);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);
"#;

/// Full-text index over job commands and scripts, with triggers keeping
/// it in sync with the `jobs` table. Jobs are immutable after creation,
/// so insert and delete triggers suffice.
pub const FTS_SCHEMA: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS jobs_fts USING fts5(
    command,
    script,
    content='jobs',
    content_rowid='id'
);

CREATE TRIGGER IF NOT EXISTS jobs_fts_insert AFTER INSERT ON jobs BEGIN
    INSERT INTO jobs_fts(rowid, command, script)
    VALUES (new.id, new.command, coalesce(new.script, ''));
END;

CREATE TRIGGER IF NOT EXISTS jobs_fts_delete AFTER DELETE ON jobs BEGIN
    INSERT INTO jobs_fts(jobs_fts, rowid, command, script)
    VALUES ('delete', old.id, old.command, coalesce(old.script, ''));
END;
"#;
