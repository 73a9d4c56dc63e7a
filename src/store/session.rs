//! Session repository and step identity.
//!
//! Sessions are ordered containers of steps. A step is identified not by
//! when it ran but by the *shape* of its I/O: input and output paths are
//! normalized (repo- or home-relative, numeric runs globified), sorted,
//! and hashed with BLAKE3. Re-executing the same logical step therefore
//! lands on the same step number, which is what makes staleness analysis
//! and re-runs possible.
//!
//! At most one session is active at any instant; new jobs join it by
//! default. The session `hash` is random, fixed at creation, and
//! identifies the session rather than its contents.

use std::{
    borrow::Cow,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use path_absolutize::Absolutize;
use regex::Regex;
use rusqlite::{Connection, OptionalExtension, params};

use crate::{
    errors::ProvenanceError,
    store::{
        job::extract_script,
        models::{GitConsistency, Job, JobType, Session, SessionSummary},
    },
    utils::{new_session_hash, unix_now},
};

/// Runs of >= 3 digits preceded by `_` or `-` and followed by `.`, `/`,
/// or end-of-string collapse to `*`, so rotating counters (checkpoints,
/// run directories) do not change a step's identity.
static NUMERIC_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([_-])\d{3,}(\.|/|$)").expect("numeric-run pattern"));

/// Replace globifiable numeric runs in a path string with `*`.
pub fn globify_numbers(path: &str) -> String {
    NUMERIC_RUN.replace_all(path, "${1}*${2}").into_owned()
}

fn forward_slashes(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Normalize a path for step identity computation.
///
/// Relative to `repo_root` when under it, else relative to the home
/// directory when under it, else reduced to its basename; numeric runs
/// are globified in the result. The output always uses forward slashes,
/// keeping identities platform-stable.
pub fn normalize_path(path: &str, repo_root: Option<&str>) -> String {
    let raw = Path::new(path);
    let abs: Cow<Path> = raw.absolutize().unwrap_or(Cow::Borrowed(raw));

    if let Some(root) = repo_root {
        let root_abs: PathBuf = Path::new(root)
            .absolutize()
            .map(Cow::into_owned)
            .unwrap_or_else(|_| PathBuf::from(root));
        if let Ok(rel) = abs.strip_prefix(&root_abs) {
            return globify_numbers(&forward_slashes(rel));
        }
    }

    if let Some(home) = dirs::home_dir() {
        if let Ok(rel) = abs.strip_prefix(&home) {
            return globify_numbers(&forward_slashes(rel));
        }
    }

    let name = abs
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    globify_numbers(&name)
}

/// Compute the step identity hash for a job's I/O shape.
///
/// Inputs and outputs are normalized and sorted independently, then
/// joined as `INPUTS:`/`OUTPUTS:` sections with NUL separators and
/// hashed with BLAKE3. A job with no hashable I/O falls back to
/// `COMMAND:<script>` so command-only steps still get a stable slot.
pub fn compute_step_identity(
    input_paths: &[String],
    output_paths: &[String],
    repo_root: Option<&str>,
    command: Option<&str>,
) -> String {
    let mut inputs: Vec<String> = input_paths
        .iter()
        .map(|p| normalize_path(p, repo_root))
        .collect();
    inputs.sort();
    let mut outputs: Vec<String> = output_paths
        .iter()
        .map(|p| normalize_path(p, repo_root))
        .collect();
    outputs.sort();

    if inputs.is_empty() && outputs.is_empty() {
        if let Some(command) = command {
            let script = extract_script(command).unwrap_or_else(|| command.to_string());
            return blake3::hash(format!("COMMAND:{script}").as_bytes())
                .to_hex()
                .to_string();
        }
    }

    let mut parts = Vec::with_capacity(inputs.len() + outputs.len() + 2);
    parts.push("INPUTS:".to_string());
    parts.extend(inputs);
    parts.push("OUTPUTS:".to_string());
    parts.extend(outputs);
    blake3::hash(parts.join("\0").as_bytes()).to_hex().to_string()
}

/// Repository over the `sessions` table and the session-scoped views of
/// `jobs`.
pub struct SessionRepository<'c> {
    conn: &'c Connection,
}

impl<'c> SessionRepository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// The active session's id, creating and activating a fresh session
    /// if none is active.
    pub fn get_or_create_active(&self) -> Result<i64, ProvenanceError> {
        let active: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM sessions WHERE is_active = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = active {
            return Ok(id);
        }

        self.conn.execute(
            "INSERT INTO sessions (hash, created_at, is_active) VALUES (?1, ?2, 1)",
            params![new_session_hash(), unix_now()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// The currently active session, if any.
    pub fn get_active(&self) -> Result<Option<Session>, ProvenanceError> {
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM sessions WHERE is_active = 1",
                [],
                Session::from_row,
            )
            .optional()?)
    }

    /// Activate one session, deactivating all others first.
    pub fn set_active(&self, session_id: i64) -> Result<(), ProvenanceError> {
        self.conn.execute("UPDATE sessions SET is_active = 0", [])?;
        self.conn.execute(
            "UPDATE sessions SET is_active = 1 WHERE id = ?1",
            params![session_id],
        )?;
        Ok(())
    }

    /// Create a session with a fresh 64-hex hash, optionally activating
    /// it.
    pub fn create(
        &self,
        source_artifact_hash: Option<&str>,
        git_repo: Option<&str>,
        git_commit: Option<&str>,
        make_active: bool,
    ) -> Result<i64, ProvenanceError> {
        if make_active {
            self.conn.execute("UPDATE sessions SET is_active = 0", [])?;
        }
        self.conn.execute(
            "INSERT INTO sessions
                 (hash, created_at, source_artifact_hash, git_repo, git_commit_start, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                new_session_hash(),
                unix_now(),
                source_artifact_hash,
                git_repo,
                git_commit,
                make_active as i64
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Session by id.
    pub fn get(&self, session_id: i64) -> Result<Option<Session>, ProvenanceError> {
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM sessions WHERE id = ?1",
                params![session_id],
                Session::from_row,
            )
            .optional()?)
    }

    /// Session by its 64-hex identifier hash.
    pub fn get_by_hash(&self, session_hash: &str) -> Result<Option<Session>, ProvenanceError> {
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM sessions WHERE hash = ?1",
                params![session_hash],
                Session::from_row,
            )
            .optional()?)
    }

    /// All executions in a session, ordered by step number then
    /// timestamp. Re-executions of one step appear as multiple rows.
    pub fn get_steps(&self, session_id: i64) -> Result<Vec<Job>, ProvenanceError> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM jobs WHERE session_id = ?1
             ORDER BY step_number ASC, timestamp ASC",
        )?;
        let rows = stmt.query_map(params![session_id], Job::from_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    /// Latest execution of the step with the given identity hash, if the
    /// session has seen it.
    pub fn get_step_by_identity(
        &self,
        session_id: i64,
        step_identity: &str,
    ) -> Result<Option<Job>, ProvenanceError> {
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM jobs
                 WHERE session_id = ?1 AND step_identity = ?2
                 ORDER BY timestamp DESC LIMIT 1",
                params![session_id, step_identity],
                Job::from_row,
            )
            .optional()?)
    }

    /// Latest execution of a step by number. Run lookups match jobs with
    /// no recorded type; build lookups require `job_type = 'build'`.
    pub fn get_step_by_number(
        &self,
        session_id: i64,
        step_number: i64,
        job_type: Option<JobType>,
    ) -> Result<Option<Job>, ProvenanceError> {
        let sql = match job_type {
            Some(JobType::Build) => {
                "SELECT * FROM jobs
                 WHERE session_id = ?1 AND step_number = ?2 AND job_type = 'build'
                 ORDER BY timestamp DESC LIMIT 1"
            }
            _ => {
                "SELECT * FROM jobs
                 WHERE session_id = ?1 AND step_number = ?2
                   AND (job_type IS NULL OR job_type = 'run')
                 ORDER BY timestamp DESC LIMIT 1"
            }
        };
        Ok(self
            .conn
            .query_row(sql, params![session_id, step_number], Job::from_row)
            .optional()?)
    }

    /// Latest execution of a step by its user-assigned name.
    pub fn get_step_by_name(
        &self,
        session_id: i64,
        step_name: &str,
    ) -> Result<Option<Job>, ProvenanceError> {
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM jobs
                 WHERE session_id = ?1 AND step_name = ?2
                 ORDER BY timestamp DESC LIMIT 1",
                params![session_id, step_name],
                Job::from_row,
            )
            .optional()?)
    }

    /// Next free step number: `max(step_number) + 1`, starting at 1.
    pub fn get_next_step_number(&self, session_id: i64) -> Result<i64, ProvenanceError> {
        let max_step: Option<i64> = self.conn.query_row(
            "SELECT max(step_number) FROM jobs WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(max_step.unwrap_or(0) + 1)
    }

    /// Record the step number of the most recent assignment.
    pub fn update_current_step(
        &self,
        session_id: i64,
        step_number: i64,
    ) -> Result<(), ProvenanceError> {
        self.conn.execute(
            "UPDATE sessions SET current_step = ?1 WHERE id = ?2",
            params![step_number, session_id],
        )?;
        Ok(())
    }

    /// Evolve the session's commit bounds: `git_commit_start` is set on
    /// the first non-null commit seen, `git_commit_end` always tracks
    /// the latest.
    pub fn update_git_commits(
        &self,
        session_id: i64,
        git_commit: &str,
        update_start: bool,
    ) -> Result<(), ProvenanceError> {
        if update_start {
            self.conn.execute(
                "UPDATE sessions SET git_commit_start = ?1
                 WHERE id = ?2 AND git_commit_start IS NULL",
                params![git_commit, session_id],
            )?;
        }
        self.conn.execute(
            "UPDATE sessions SET git_commit_end = ?1 WHERE id = ?2",
            params![git_commit, session_id],
        )?;
        Ok(())
    }

    /// Rename every execution of a step, honoring the run/build split.
    pub fn rename_step(
        &self,
        session_id: i64,
        step_number: i64,
        new_name: &str,
        job_type: Option<JobType>,
    ) -> Result<(), ProvenanceError> {
        let sql = match job_type {
            Some(JobType::Build) => {
                "UPDATE jobs SET step_name = ?1
                 WHERE session_id = ?2 AND step_number = ?3 AND job_type = 'build'"
            }
            _ => {
                "UPDATE jobs SET step_name = ?1
                 WHERE session_id = ?2 AND step_number = ?3
                   AND (job_type IS NULL OR job_type = 'run')"
            }
        };
        self.conn
            .execute(sql, params![new_name, session_id, step_number])?;
        Ok(())
    }

    /// Step placement of one job within a session.
    pub fn get_step_for_job(
        &self,
        session_id: i64,
        job_id: i64,
    ) -> Result<Option<Job>, ProvenanceError> {
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM jobs WHERE session_id = ?1 AND id = ?2",
                params![session_id, job_id],
                Job::from_row,
            )
            .optional()?)
    }

    /// Remove a session: its jobs are detached (session id, step number
    /// and step name cleared), not deleted, then the session row is
    /// dropped.
    pub fn clear(&self, session_id: i64) -> Result<(), ProvenanceError> {
        self.conn.execute(
            "UPDATE jobs SET session_id = NULL, step_number = NULL, step_name = NULL
             WHERE session_id = ?1",
            params![session_id],
        )?;
        self.conn
            .execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        Ok(())
    }

    /// Whether the session's jobs all agree on one git commit.
    pub fn check_git_consistency(
        &self,
        session_id: i64,
    ) -> Result<GitConsistency, ProvenanceError> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT git_commit FROM jobs
             WHERE session_id = ?1 AND git_commit IS NOT NULL",
        )?;
        let rows = stmt.query_map(params![session_id], |row| row.get::<_, String>(0))?;
        let mut commits = Vec::new();
        for row in rows {
            commits.push(row?);
        }

        let consistent = commits.len() <= 1;
        let warning = (!consistent).then(|| {
            let shorts: Vec<&str> = commits
                .iter()
                .map(|c| if c.len() >= 8 { &c[..8] } else { c.as_str() })
                .collect();
            format!(
                "Pipeline has {} different git commits: {}",
                commits.len(),
                shorts.join(", ")
            )
        });
        Ok(GitConsistency {
            consistent,
            commits,
            warning,
        })
    }

    /// Display summary: one entry per step number, latest execution
    /// only, plus git consistency.
    pub fn get_summary(
        &self,
        session_id: i64,
    ) -> Result<Option<SessionSummary>, ProvenanceError> {
        let Some(session) = self.get(session_id)? else {
            return Ok(None);
        };

        let steps = self.get_steps(session_id)?;
        let git = self.check_git_consistency(session_id)?;

        let mut latest: std::collections::BTreeMap<i64, Job> = std::collections::BTreeMap::new();
        for job in steps {
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

        Ok(Some(SessionSummary {
            id: session.id,
            hash: session.hash,
            created_at: session.created_at,
            current_step: session.current_step,
            total_steps: latest.len(),
            is_active: session.is_active,
            git_consistent: git.consistent,
            git_warning: git.warning,
            steps: latest.into_values().collect(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use quickcheck::quickcheck;

    use super::*;
    use crate::store::Store;

    #[test]
    fn test_globify_numbers() {
        assert_eq!(globify_numbers("checkpoint_01234.pt"), "checkpoint_*.pt");
        assert_eq!(globify_numbers("runs/2024_001/log"), "runs/2024_*/log");
        assert_eq!(globify_numbers("model-123456"), "model-*");
        // Fewer than three digits, or digits without a separator, stay.
        assert_eq!(globify_numbers("epoch_12.pt"), "epoch_12.pt");
        assert_eq!(globify_numbers("v2024.csv"), "v2024.csv");
        // Digits followed by more name characters stay.
        assert_eq!(globify_numbers("run_123x.csv"), "run_123x.csv");
    }

    quickcheck! {
        fn prop_globify_idempotent(path: String) -> bool {
            let once = globify_numbers(&path);
            globify_numbers(&once) == once
        }
    }

    #[test]
    fn test_normalize_path_repo_relative() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_string_lossy().into_owned();
        let inside = dir.path().join("data/batch_0042/x.csv");

        let normalized = normalize_path(&inside.to_string_lossy(), Some(&root));
        assert_eq!(normalized, "data/batch_*/x.csv");

        // Outside the root, the basename is used.
        let outside = "/srv/elsewhere/output_1234.bin";
        assert_eq!(normalize_path(outside, Some(&root)), "output_*.bin");
    }

    #[test]
    fn test_normalize_path_idempotent_under_root() {
        let cwd = std::env::current_dir().expect("cwd");
        let root = cwd.to_string_lossy().into_owned();
        let path = cwd.join("artifacts/model_0007.pkl");

        let once = normalize_path(&path.to_string_lossy(), Some(&root));
        let twice = normalize_path(&once, Some(&root));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_step_identity_is_order_insensitive_and_section_sensitive() {
        let a = compute_step_identity(
            &["/x/one.csv".into(), "/x/two.csv".into()],
            &["/x/out.csv".into()],
            None,
            None,
        );
        let b = compute_step_identity(
            &["/x/two.csv".into(), "/x/one.csv".into()],
            &["/x/out.csv".into()],
            None,
            None,
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        // The same paths on the other side of the I/O split differ.
        let swapped = compute_step_identity(
            &["/x/out.csv".into()],
            &["/x/one.csv".into(), "/x/two.csv".into()],
            None,
            None,
        );
        assert_ne!(a, swapped);
    }

    #[test]
    fn test_step_identity_command_fallback() {
        let by_command = compute_step_identity(&[], &[], None, Some("python train.py --x 1"));
        // The fallback keys on the script, not the full argv.
        let same_script = compute_step_identity(&[], &[], None, Some("python train.py --x 2"));
        assert_eq!(by_command, same_script);

        let other_script = compute_step_identity(&[], &[], None, Some("python other.py"));
        assert_ne!(by_command, other_script);

        // With I/O present the command is irrelevant.
        let with_io =
            compute_step_identity(&["/a.csv".into()], &[], None, Some("python train.py"));
        let with_io_other =
            compute_step_identity(&["/a.csv".into()], &[], None, Some("python other.py"));
        assert_eq!(with_io, with_io_other);
    }

    #[test]
    fn test_active_session_singleton() {
        let store = Store::open_in_memory().expect("store");
        let repo = SessionRepository::new(store.conn());

        let first = repo.get_or_create_active().expect("create");
        let again = repo.get_or_create_active().expect("reuse");
        assert_eq!(first, again);

        let session = repo.get_active().expect("get").expect("active");
        assert_eq!(session.id, first);
        assert_eq!(session.hash.as_deref().map(str::len), Some(64));

        let second = repo.create(None, None, None, true).expect("create");
        assert_ne!(first, second);
        let actives: i64 = store
            .conn()
            .query_row(
                "SELECT count(*) FROM sessions WHERE is_active = 1",
                [],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(actives, 1);
        assert_eq!(repo.get_active().expect("get").expect("active").id, second);

        repo.set_active(first).expect("activate");
        assert_eq!(repo.get_active().expect("get").expect("active").id, first);
    }

    #[test]
    fn test_git_commit_bounds() {
        let store = Store::open_in_memory().expect("store");
        let repo = SessionRepository::new(store.conn());
        let session_id = repo.get_or_create_active().expect("create");

        repo.update_git_commits(session_id, "aaaa1111", true)
            .expect("update");
        repo.update_git_commits(session_id, "bbbb2222", true)
            .expect("update");

        let session = repo.get(session_id).expect("get").expect("session");
        assert_eq!(session.git_commit_start.as_deref(), Some("aaaa1111"));
        assert_eq!(session.git_commit_end.as_deref(), Some("bbbb2222"));
    }

    #[test]
    fn test_clear_detaches_jobs() {
        let store = Store::open_in_memory().expect("store");
        let repo = SessionRepository::new(store.conn());
        let session_id = repo.get_or_create_active().expect("create");

        store
            .conn()
            .execute(
                "INSERT INTO jobs (timestamp, command, session_id, step_number, step_name)
                 VALUES (1.0, 'x', ?1, 1, 'prep')",
                params![session_id],
            )
            .expect("job");

        repo.clear(session_id).expect("clear");
        assert!(repo.get(session_id).expect("get").is_none());

        let (session, step, name): (Option<i64>, Option<i64>, Option<String>) = store
            .conn()
            .query_row(
                "SELECT session_id, step_number, step_name FROM jobs",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .expect("job row");
        assert_eq!((session, step, name), (None, None, None));
    }
}
