// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sandbox::{Sandbox, SandboxParams};
use storage::{FileCacher, FilesystemStorage, Storage};
use tempfile::TempDir;

use crate::artifacts::{
    DigestHolder, GradingArtifacts, GradingFileInput, GradingFileOutput,
};
use crate::caching::DependencyCache;
use crate::steps_with_caching;

struct TestEnv {
    dir: TempDir,
    storage: Arc<dyn Storage>,
    cacher: Arc<FileCacher>,
    cache: DependencyCache,
}

fn setup() -> TestEnv {
    let dir = TempDir::new().unwrap();
    let storage: Arc<dyn Storage> =
        Arc::new(FilesystemStorage::new(dir.path().join(".storage")).unwrap());
    let cacher = Arc::new(FileCacher::new(storage.clone()).unwrap());
    let cache = DependencyCache::new(&dir.path().join(".box"), storage.clone()).unwrap();
    TestEnv {
        dir,
        storage,
        cacher,
        cache,
    }
}

impl TestEnv {
    fn sandbox(&self) -> Sandbox {
        Sandbox::new("stupid", self.cacher.clone(), Some("test"), Some(self.dir.path())).unwrap()
    }

    fn root(&self) -> PathBuf {
        self.dir.path().to_owned()
    }
}

///
/// An artifact plan mirroring a solution run: a staged executable script, stdout
/// captured to `box-out.txt` and copied out to `dest`.
///
fn script_artifacts(env: &TestEnv, script_digest: &str, dest: &Path) -> GradingArtifacts {
    let mut artifacts = GradingArtifacts::with_root(env.root());
    artifacts.inputs.push(
        GradingFileInput::from_digest(
            DigestHolder::with_value(script_digest),
            "executable.sh",
        )
        .executable(),
    );
    artifacts
        .outputs
        .push(GradingFileOutput::to_path("box-out.txt", dest));
    artifacts
}

fn run_params() -> SandboxParams {
    let mut params = SandboxParams::new();
    params.set_stdall(None, Some(PathBuf::from("box-out.txt")), None);
    params
}

async fn put_script(env: &TestEnv, content: &str) -> String {
    env.cacher
        .put_file_from_bytes(content.as_bytes())
        .await
        .unwrap()
}

async fn run_cached(env: &TestEnv, artifacts: &mut GradingArtifacts) {
    let mut sandbox = env.sandbox();
    steps_with_caching::run(
        "/bin/sh executable.sh",
        &run_params(),
        &mut sandbox,
        artifacts,
        &env.cache,
    )
    .await
    .unwrap();
    sandbox.cleanup(true).await;
}

fn logs_cached(artifacts: &GradingArtifacts) -> bool {
    artifacts.logs.as_ref().unwrap().is_cached()
}

#[tokio::test]
async fn run_from_digest() {
    let env = setup();
    let digest = put_script(&env, "echo 5").await;

    let mut artifacts = script_artifacts(&env, &digest, Path::new("out.txt"));
    run_cached(&env, &mut artifacts).await;

    assert_eq!(
        std::fs::read_to_string(env.root().join("out.txt")).unwrap().trim(),
        "5"
    );
    let logs = artifacts.logs.as_ref().unwrap();
    assert!(logs.run().is_some());
    assert!(!logs.is_cached());
}

#[tokio::test]
async fn second_run_is_cached_with_same_digests() {
    let env = setup();
    let digest = put_script(&env, "echo 5").await;

    let mut first = script_artifacts(&env, &digest, Path::new("out.txt"));
    run_cached(&env, &mut first).await;
    let first_digest = first.outputs[0].digest.as_ref().unwrap().get();
    assert!(!logs_cached(&first));

    let mut second = script_artifacts(&env, &digest, Path::new("out.txt"));
    run_cached(&env, &mut second).await;
    let second_digest = second.outputs[0].digest.as_ref().unwrap().get();
    assert!(logs_cached(&second));
    assert_eq!(first_digest, second_digest);
    assert_eq!(
        first.logs.as_ref().unwrap().run(),
        second.logs.as_ref().unwrap().run()
    );
}

#[tokio::test]
async fn cache_hit_materializes_to_new_dest() {
    let env = setup();
    let digest = put_script(&env, "echo 5").await;

    let mut first = script_artifacts(&env, &digest, Path::new("out.txt"));
    run_cached(&env, &mut first).await;
    assert!(!logs_cached(&first));

    // Hashed outputs are not keyed by their dest path, so a renamed dest still hits and
    // gets materialized from the storage.
    let mut second = script_artifacts(&env, &digest, Path::new("another-out.txt"));
    run_cached(&env, &mut second).await;
    assert!(logs_cached(&second));
    assert_eq!(
        std::fs::read_to_string(env.root().join("another-out.txt"))
            .unwrap()
            .trim(),
        "5"
    );
}

#[tokio::test]
async fn changing_input_file_evicts() {
    let env = setup();
    let script_path = env.root().join("executable.sh");
    std::fs::write(&script_path, "echo 42").unwrap();

    let mut artifacts = GradingArtifacts::with_root(env.root());
    artifacts
        .inputs
        .push(GradingFileInput::from_path("executable.sh", "executable.sh"));
    artifacts
        .outputs
        .push(GradingFileOutput::to_path("box-out.txt", "out.txt"));
    run_cached(&env, &mut artifacts).await;
    assert!(!logs_cached(&artifacts));
    assert_eq!(
        std::fs::read_to_string(env.root().join("out.txt")).unwrap().trim(),
        "42"
    );

    // Same plan, same key; the changed input fingerprint forces a re-run.
    std::fs::write(&script_path, "echo 4567").unwrap();
    let mut changed = GradingArtifacts::with_root(env.root());
    changed
        .inputs
        .push(GradingFileInput::from_path("executable.sh", "executable.sh"));
    changed
        .outputs
        .push(GradingFileOutput::to_path("box-out.txt", "out.txt"));
    run_cached(&env, &mut changed).await;
    assert!(!logs_cached(&changed));
    assert_eq!(
        std::fs::read_to_string(env.root().join("out.txt")).unwrap().trim(),
        "4567"
    );
}

#[tokio::test]
async fn plain_output_change_on_disk_evicts() {
    let env = setup();
    let digest = put_script(&env, "echo 5").await;

    let plain_plan = || {
        let mut artifacts = GradingArtifacts::with_root(env.root());
        artifacts.inputs.push(
            GradingFileInput::from_digest(DigestHolder::with_value(digest.as_str()), "executable.sh")
                .executable(),
        );
        artifacts
            .outputs
            .push(GradingFileOutput::to_plain_path("box-out.txt", "out.txt"));
        artifacts
    };

    let mut first = plain_plan();
    run_cached(&env, &mut first).await;
    assert!(!logs_cached(&first));

    let mut unchanged = plain_plan();
    run_cached(&env, &mut unchanged).await;
    assert!(logs_cached(&unchanged));

    // Tampering with the tracked output forces a re-run.
    std::fs::write(env.root().join("out.txt"), "tampered").unwrap();
    let mut tampered = plain_plan();
    run_cached(&env, &mut tampered).await;
    assert!(!logs_cached(&tampered));
    assert_eq!(
        std::fs::read_to_string(env.root().join("out.txt")).unwrap().trim(),
        "5"
    );
}

#[tokio::test]
async fn plain_output_exec_bit_toggle_evicts() {
    use std::os::unix::fs::PermissionsExt;

    let env = setup();
    let digest = put_script(&env, "echo 5").await;

    let plan = || {
        let mut artifacts = GradingArtifacts::with_root(env.root());
        artifacts.inputs.push(
            GradingFileInput::from_digest(DigestHolder::with_value(digest.as_str()), "executable.sh")
                .executable(),
        );
        artifacts.outputs.push(
            GradingFileOutput::to_plain_path("box-out.txt", "out.txt").executable(),
        );
        artifacts
    };

    let mut first = plan();
    run_cached(&env, &mut first).await;
    assert!(!logs_cached(&first));

    let mut unchanged = plan();
    run_cached(&env, &mut unchanged).await;
    assert!(logs_cached(&unchanged));

    // The executable bit participates in the artifact check for plain outputs.
    std::fs::set_permissions(
        env.root().join("out.txt"),
        std::fs::Permissions::from_mode(0o644),
    )
    .unwrap();
    let mut toggled = plan();
    run_cached(&env, &mut toggled).await;
    assert!(!logs_cached(&toggled));
}

#[tokio::test]
async fn hashed_output_exec_bit_toggle_does_not_evict() {
    use std::os::unix::fs::PermissionsExt;

    let env = setup();
    let digest = put_script(&env, "echo 5").await;

    let mut first = script_artifacts(&env, &digest, Path::new("out.txt"));
    run_cached(&env, &mut first).await;
    assert!(!logs_cached(&first));

    // The value is identified by content; the on-disk bit is not fingerprinted.
    std::fs::set_permissions(
        env.root().join("out.txt"),
        std::fs::Permissions::from_mode(0o755),
    )
    .unwrap();
    let mut second = script_artifacts(&env, &digest, Path::new("out.txt"));
    run_cached(&env, &mut second).await;
    assert!(logs_cached(&second));
}

#[tokio::test]
async fn failing_run_log_is_replayed_from_cache() {
    let env = setup();
    let digest = put_script(&env, "echo partial; exit 7").await;

    let mut first = script_artifacts(&env, &digest, Path::new("out.txt"));
    run_cached(&env, &mut first).await;
    let first_log = first.logs.as_ref().unwrap().run().unwrap();
    assert_eq!(first_log.exitcode, 7);
    assert!(!logs_cached(&first));

    let mut second = script_artifacts(&env, &digest, Path::new("out.txt"));
    run_cached(&env, &mut second).await;
    assert!(logs_cached(&second));
    assert_eq!(second.logs.as_ref().unwrap().run().unwrap().exitcode, 7);
}

#[tokio::test]
async fn missing_storage_blob_rolls_back_and_evicts() {
    let env = setup();
    let digest = put_script(&env, "echo 5").await;

    let mut first = script_artifacts(&env, &digest, Path::new("out.txt"));
    run_cached(&env, &mut first).await;
    let produced = first.outputs[0].digest.as_ref().unwrap().get().unwrap();

    // Corrupt the storage under the cache; the next lookup must fall back to re-running.
    env.storage.delete(&produced).await.unwrap();
    let mut second = script_artifacts(&env, &digest, Path::new("out.txt"));
    run_cached(&env, &mut second).await;
    assert!(!logs_cached(&second));
    // The re-run repopulated the storage.
    assert!(env.storage.exists(&produced).await.unwrap());
}

#[tokio::test]
async fn unproduced_digest_consumption_is_rejected() {
    let env = setup();

    let holder = DigestHolder::new();
    let mut artifacts = GradingArtifacts::with_root(env.root());
    artifacts
        .inputs
        .push(GradingFileInput::from_digest(holder, "consumed"));

    let extra = serde_json::Value::Null;
    let commands = ["true".to_owned()];
    let list = std::slice::from_ref(&artifacts);
    assert!(env.cache.enter(&commands, list, &extra).await.is_err());
}

#[tokio::test]
async fn producer_must_precede_consumer() {
    let env = setup();

    let holder = DigestHolder::new();
    let mut produce = GradingArtifacts::with_root(env.root());
    produce
        .outputs
        .push(GradingFileOutput::to_digest("a.txt", holder.clone()));
    let mut consume = GradingArtifacts::with_root(env.root());
    consume
        .inputs
        .push(GradingFileInput::from_digest(holder, "b.txt"));

    let extra = serde_json::Value::Null;
    let commands = ["true".to_owned()];

    // Producer declared first: fine.
    let ordered = [produce.clone(), consume.clone()];
    assert!(env.cache.enter(&commands, &ordered, &extra).await.is_ok());

    // Consumer first: rejected.
    let holder = DigestHolder::new();
    produce.outputs[0].digest = Some(holder.clone());
    consume.inputs[0].digest = Some(holder);
    let reversed = [consume, produce];
    assert!(env.cache.enter(&commands, &reversed, &extra).await.is_err());
}

#[tokio::test]
async fn failed_compile_is_not_recorded() {
    let env = setup();
    let source = env.root().join("broken.sh");
    std::fs::write(&source, "this is not really compiled").unwrap();

    let compile_plan = || {
        let mut artifacts = GradingArtifacts::with_root(env.root());
        artifacts
            .inputs
            .push(GradingFileInput::from_path("broken.sh", "compilable"));
        artifacts.outputs.push(
            GradingFileOutput::to_digest("executable", DigestHolder::new()).executable(),
        );
        artifacts.logs = Some(crate::artifacts::GradingLogsHolder::new());
        artifacts
    };

    let commands = vec!["/bin/sh -c 'exit 1'".to_owned()];
    let params = SandboxParams::new();

    for _ in 0..2 {
        let artifacts = compile_plan();
        let mut sandbox = env.sandbox();
        let ok = steps_with_caching::compile(
            &commands,
            &params,
            &mut sandbox,
            &artifacts,
            &env.cache,
        )
        .await
        .unwrap();
        assert!(!ok);
        // Never served from cache: failures are not recorded.
        assert!(!artifacts.logs.as_ref().unwrap().is_cached());
        let preprocess = artifacts.logs.as_ref().unwrap().preprocess().unwrap();
        assert_eq!(preprocess.last().unwrap().exitcode, 1);
        sandbox.cleanup(true).await;
    }
}
