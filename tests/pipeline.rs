//! Integration tests that drive full record/analyze/trace cycles through
//! an in-memory store: linear pipelines, staleness propagation after
//! re-runs, diamond dependencies, and filtered lineage extraction.

use std::{collections::BTreeMap, io::Write, path::PathBuf};

use pipetrace::{
    hashing::HashRegistry,
    services::{
        ArtifactState, JobRecordingService, LineageService, RecordJobRequest, SessionService,
    },
    store::{
        Store,
        artifact::ArtifactRepository,
        job::JobRepository,
        session::SessionRepository,
    },
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Scratch pipeline: a temp tree plus a store to record into.
struct Pipeline {
    dir: tempfile::TempDir,
    store: Store,
    registry: HashRegistry,
}

impl Pipeline {
    fn new() -> Self {
        init_tracing();
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
            store: Store::open_in_memory().expect("store"),
            registry: HashRegistry::new(),
        }
    }

    fn write(&self, name: &str, content: &str) -> String {
        let path: PathBuf = self.dir.path().join(name);
        let mut f = std::fs::File::create(&path).expect("create file");
        f.write_all(content.as_bytes()).expect("write file");
        path.to_string_lossy().into_owned()
    }

    fn record(
        &mut self,
        command: &str,
        timestamp: f64,
        inputs: &[&str],
        outputs: &[&str],
    ) -> pipetrace::services::RecordedJob {
        let mut request = RecordJobRequest::new(command, timestamp);
        request.input_files = inputs.iter().map(|s| s.to_string()).collect();
        request.output_files = outputs.iter().map(|s| s.to_string()).collect();
        request.exit_code = Some(0);
        JobRecordingService::new(&mut self.store, &self.registry)
            .record_job(&request)
            .expect("record job")
    }

    fn artifact_at(&self, path: &str) -> String {
        ArtifactRepository::new(self.store.conn())
            .get_by_path(path)
            .expect("lookup")
            .expect("artifact for path")
            .artifact
            .id
    }
}

/// Linear pipeline: two steps, everything fresh, lineage in order.
#[test]
fn test_linear_pipeline_freshness() {
    let mut pipeline = Pipeline::new();
    let input = pipeline.write("input.csv", "aaa");
    let processed = pipeline.write("processed.csv", "AAA");
    let model = pipeline.write("model.pkl", "m1");

    let j1 = pipeline.record(
        "python preprocess.py input.csv processed.csv",
        100.0,
        &[&input],
        &[&processed],
    );
    let j2 = pipeline.record(
        "python train.py processed.csv model.pkl",
        200.0,
        &[&processed],
        &[&model],
    );

    assert_eq!(j1.step_number, Some(1));
    assert_eq!(j2.step_number, Some(2));
    assert_eq!(j1.session_id, j2.session_id);
    let session_id = j1.session_id.expect("session");

    let service = SessionService::new(pipeline.store.conn());
    assert!(service.get_stale_steps(session_id).expect("stale").is_empty());
    assert!(
        service
            .get_stale_artifacts(session_id)
            .expect("stale artifacts")
            .is_empty()
    );
    assert_eq!(
        service
            .get_downstream_steps(session_id, 1)
            .expect("downstream"),
        vec![2]
    );

    let summary = service
        .get_summary(session_id)
        .expect("summary")
        .expect("session");
    assert_eq!(summary.total_steps, 2);
    assert!(summary.git_consistent);

    let lineage = LineageService::new(pipeline.store.conn());
    let model_artifact = pipeline.artifact_at(&model);
    let jobs = lineage
        .get_lineage_jobs(&[model_artifact], 10)
        .expect("lineage");
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].job.id, j1.job_id);
    assert_eq!(jobs[1].job.id, j2.job_id);
    assert_eq!(jobs[0].inputs.len(), 1);
    assert!(jobs[0].inputs[0].path.ends_with("input.csv"));
}

/// Re-running the first step with changed content lands on the same step
/// number and makes the downstream step stale.
#[test]
fn test_staleness_propagation_after_rerun() {
    let mut pipeline = Pipeline::new();
    let input = pipeline.write("input.csv", "aaa");
    let processed = pipeline.write("processed.csv", "AAA");
    let model = pipeline.write("model.pkl", "m1");

    let j1 = pipeline.record(
        "python preprocess.py input.csv processed.csv",
        100.0,
        &[&input],
        &[&processed],
    );
    let j2 = pipeline.record(
        "python train.py processed.csv model.pkl",
        200.0,
        &[&processed],
        &[&model],
    );
    let session_id = j1.session_id.expect("session");
    let model_artifact = pipeline.artifact_at(&model);
    let old_processed_artifact = pipeline.artifact_at(&processed);

    // New upstream content, same logical step. The new content has a
    // different length so the hash cache cannot serve the old digest
    // even when both writes land within its mtime tolerance.
    pipeline.write("input.csv", "bbbb");
    pipeline.write("processed.csv", "BBBB");
    let j1_rerun = pipeline.record(
        "python preprocess.py input.csv processed.csv",
        300.0,
        &[&input],
        &[&processed],
    );
    assert_eq!(j1_rerun.step_number, j1.step_number);
    assert_eq!(j1_rerun.step_identity, j1.step_identity);

    let service = SessionService::new(pipeline.store.conn());
    assert_eq!(service.get_stale_steps(session_id).expect("stale"), vec![2]);
    assert_eq!(
        service
            .get_stale_artifacts(session_id)
            .expect("stale artifacts"),
        vec![model_artifact.clone()]
    );

    let states = service
        .get_artifact_states(session_id, false)
        .expect("states");
    assert_eq!(states.get(&model_artifact), Some(&ArtifactState::Stale));
    assert_eq!(
        states.get(&old_processed_artifact),
        Some(&ArtifactState::Superseded)
    );
    let new_processed_artifact = pipeline.artifact_at(&processed);
    assert_ne!(new_processed_artifact, old_processed_artifact);
    assert_eq!(
        states.get(&new_processed_artifact),
        Some(&ArtifactState::Active)
    );

    // The dependency edge 2 -> 1 is visible with the consumed artifact.
    let dag = service.dependencies(session_id).expect("dag");
    assert_eq!(
        dag.depends_on.get(&2).map(|d| d.iter().copied().collect::<Vec<_>>()),
        Some(vec![1])
    );
    assert_eq!(
        dag.consumed_artifacts
            .get(&2)
            .and_then(|c| c.values().next())
            .map(String::as_str),
        Some(old_processed_artifact.as_str())
    );
}

/// Diamond: two extractors feed one combiner; the combiner depends on
/// both and lineage lists all three in timestamp order.
#[test]
fn test_diamond_dependencies_and_lineage() {
    let mut pipeline = Pipeline::new();
    let input = pipeline.write("input.csv", "source");
    let a = pipeline.write("a.csv", "left");
    let b = pipeline.write("b.csv", "right");
    let merged = pipeline.write("merged.json", "{}");
    let debug_log = pipeline.write("debug.log", "noise");

    let ja = pipeline.record(
        "python extract_a.py input.csv a.csv",
        100.0,
        &[&input],
        &[&a, &debug_log],
    );
    let jb = pipeline.record(
        "python extract_b.py input.csv b.csv",
        200.0,
        &[&input],
        &[&b],
    );
    let jc = pipeline.record(
        "python combine.py a.csv b.csv merged.json",
        300.0,
        &[&a, &b],
        &[&merged],
    );
    let session_id = ja.session_id.expect("session");

    let service = SessionService::new(pipeline.store.conn());
    let summary = service
        .get_summary(session_id)
        .expect("summary")
        .expect("session");
    assert_eq!(summary.total_steps, 3);

    let dag = service.dependencies(session_id).expect("dag");
    assert_eq!(
        dag.depends_on
            .get(&3)
            .map(|d| d.iter().copied().collect::<Vec<_>>()),
        Some(vec![1, 2])
    );
    assert_eq!(dag.consumed_artifacts.get(&3).map(BTreeMap::len), Some(2));

    assert_eq!(
        service.get_downstream_steps(session_id, 1).expect("downstream"),
        vec![3]
    );
    assert_eq!(
        service.get_downstream_steps(session_id, 3).expect("downstream"),
        Vec::<i64>::new()
    );

    let lineage = LineageService::new(pipeline.store.conn());
    let merged_artifact = pipeline.artifact_at(&merged);
    let jobs = lineage
        .get_lineage_jobs(&[merged_artifact.clone()], 10)
        .expect("lineage");
    assert_eq!(
        jobs.iter().map(|j| j.job.id).collect::<Vec<_>>(),
        vec![ja.job_id, jb.job_id, jc.job_id]
    );

    // Filtered lineage keeps only artifacts on the path to the target:
    // the extractor's debug log is filtered out of its outputs.
    let filtered = lineage
        .get_filtered_lineage(&merged_artifact, 10)
        .expect("filtered")
        .expect("resolved");
    assert_eq!(filtered.jobs.len(), 3);
    let ja_entry = filtered
        .jobs
        .iter()
        .find(|j| j.job.id == ja.job_id)
        .expect("extractor job");
    assert_eq!(ja_entry.outputs.len(), 1);
    assert!(ja_entry.outputs[0].path.ends_with("a.csv"));

    let debug_artifact = pipeline.artifact_at(&debug_log);
    let debug_digest = ArtifactRepository::new(pipeline.store.conn())
        .get(&debug_artifact)
        .expect("get")
        .expect("artifact")
        .blake3()
        .expect("digest")
        .to_string();
    assert!(!filtered.on_path_hashes.contains(&debug_digest));
}

/// Lineage resolves targets by BLAKE3 digest and by digest prefix.
#[test]
fn test_lineage_resolution_by_hash_prefix() {
    let mut pipeline = Pipeline::new();
    let input = pipeline.write("raw.csv", "raw");
    let out = pipeline.write("clean.csv", "clean");

    let job = pipeline.record("python clean.py raw.csv clean.csv", 50.0, &[&input], &[&out]);

    let outputs = JobRepository::new(pipeline.store.conn())
        .get_outputs(job.job_id)
        .expect("outputs");
    let digest = outputs[0].blake3().expect("digest").to_string();

    let lineage = LineageService::new(pipeline.store.conn());
    let by_digest = lineage
        .get_lineage_jobs(&[digest.clone()], 10)
        .expect("lineage");
    assert_eq!(by_digest.len(), 1);

    let by_prefix = lineage
        .get_lineage_jobs(&[digest[..16].to_string()], 10)
        .expect("lineage");
    assert_eq!(by_prefix.len(), 1);

    // Unresolvable targets are dropped, not fatal.
    let none = lineage
        .get_lineage_jobs(&["ffffffff00000000".to_string()], 10)
        .expect("lineage");
    assert!(none.is_empty());
}

/// Globified output names keep a rotating checkpoint on one step; the
/// expanded view marks the downstream model superseded even though no
/// path collision makes it stale.
#[test]
fn test_expanded_view_propagates_supersession() {
    let mut pipeline = Pipeline::new();
    let data = pipeline.write("data.csv", "d");
    let ckpt1 = pipeline.write("checkpoint_0001.pt", "w1");

    let j1 = pipeline.record(
        "python train.py data.csv",
        100.0,
        &[&data],
        &[&ckpt1],
    );
    let model = pipeline.write("model.onnx", "export1");
    pipeline.record(
        "python export.py checkpoint model.onnx",
        200.0,
        &[&ckpt1],
        &[&model],
    );
    let session_id = j1.session_id.expect("session");
    let old_ckpt_artifact = pipeline.artifact_at(&ckpt1);
    let model_artifact = pipeline.artifact_at(&model);

    // A later epoch writes a new checkpoint file; the numeric run is
    // globified, so this is the same logical step.
    let ckpt2 = pipeline.write("checkpoint_0002.pt", "w2");
    let j1_rerun = pipeline.record(
        "python train.py data.csv",
        300.0,
        &[&data],
        &[&ckpt2],
    );
    assert_eq!(j1_rerun.step_number, j1.step_number);

    let service = SessionService::new(pipeline.store.conn());
    // No path collision: the old checkpoint path has no current
    // producer, so nothing is stale.
    assert!(service.get_stale_steps(session_id).expect("stale").is_empty());

    let base = service
        .get_artifact_states(session_id, false)
        .expect("states");
    assert_eq!(
        base.get(&old_ckpt_artifact),
        Some(&ArtifactState::Superseded)
    );
    assert_eq!(base.get(&model_artifact), Some(&ArtifactState::Active));

    let expanded = service
        .get_artifact_states(session_id, true)
        .expect("states");
    assert_eq!(
        expanded.get(&model_artifact),
        Some(&ArtifactState::Superseded)
    );
}

/// Step numbers stay dense and sequential as distinct steps arrive, and
/// re-registration across algorithms keeps one artifact.
#[test]
fn test_step_numbering_and_artifact_identity() {
    let mut pipeline = Pipeline::new();

    let mut last_session = None;
    for (i, name) in ["one", "two", "three"].iter().enumerate() {
        let out = pipeline.write(&format!("{name}.out"), name);
        let recorded = pipeline.record(&format!("python {name}.py"), (i as f64) * 10.0, &[], &[&out]);
        assert_eq!(recorded.step_number, Some(i as i64 + 1));
        last_session = recorded.session_id;
    }
    let session_id = last_session.expect("session");

    // Dense from 1: every number in 1..=max appears.
    let steps = SessionRepository::new(pipeline.store.conn())
        .get_steps(session_id)
        .expect("steps");
    let mut numbers: Vec<i64> = steps.iter().filter_map(|j| j.step_number).collect();
    numbers.sort();
    numbers.dedup();
    assert_eq!(numbers, vec![1, 2, 3]);

    // Hashing the same file under a wider algorithm set extends the
    // artifact rather than splitting it.
    let shared = pipeline.write("shared.bin", "same-bytes");
    let mut request = RecordJobRequest::new("python reuse.py", 500.0);
    request.input_files = vec![shared.clone()];
    request.hash_algorithms = vec!["blake3".to_string(), "sha256".to_string()];
    let registry = HashRegistry::new();
    JobRecordingService::new(&mut pipeline.store, &registry)
        .record_job(&request)
        .expect("record");

    let detail = ArtifactRepository::new(pipeline.store.conn())
        .get_by_path(&shared)
        .expect("lookup")
        .expect("artifact");
    assert!(detail.digest("sha256").is_some());
    assert!(detail.blake3().is_some());
}
