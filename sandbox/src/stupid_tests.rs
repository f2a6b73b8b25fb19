// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::path::Path;
use std::sync::Arc;

use storage::{FileCacher, FilesystemStorage};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

use crate::params::SandboxParams;
use crate::status::ExitStatus;
use crate::{Sandbox, Truncator};

fn make_sandbox(dir: &TempDir) -> Sandbox {
    let storage = FilesystemStorage::new(dir.path().join("storage")).unwrap();
    let cacher = Arc::new(FileCacher::new(Arc::new(storage)).unwrap());
    Sandbox::new("stupid", cacher, Some("test"), Some(dir.path())).unwrap()
}

fn sh(script: &str) -> Vec<String> {
    vec!["/bin/sh".to_owned(), "-c".to_owned(), script.to_owned()]
}

#[tokio::test]
async fn hello_run_log_hydration() {
    let dir = TempDir::new().unwrap();
    let mut sandbox = make_sandbox(&dir);

    let mut params = SandboxParams::new();
    params.set_stdall(None, Some("run.out".into()), None);
    sandbox.set_params(params);

    assert!(sandbox.execute_without_std(&sh("echo hello")).await);
    assert_eq!(sandbox.get_exit_code(), 0);
    assert_eq!(sandbox.get_exit_status(), ExitStatus::Ok);
    assert!(sandbox.get_execution_time().unwrap() >= 0.0);
    assert!(sandbox.get_memory_used().unwrap() > 0);
    assert_eq!(
        sandbox
            .get_file_to_string(Path::new("run.out"), None)
            .await
            .unwrap(),
        "hello\n"
    );
    assert!(sandbox
        .get_human_exit_description()
        .contains("successfully finished"));
}

#[tokio::test]
async fn nonzero_return_status() {
    let dir = TempDir::new().unwrap();
    let mut sandbox = make_sandbox(&dir);

    assert!(sandbox.execute_without_std(&sh("exit 3")).await);
    assert_eq!(sandbox.get_exit_code(), 3);
    assert_eq!(sandbox.get_exit_status(), ExitStatus::NonzeroReturn);
}

#[tokio::test]
async fn signal_status() {
    let dir = TempDir::new().unwrap();
    let mut sandbox = make_sandbox(&dir);

    assert!(sandbox.execute_without_std(&sh("kill -9 $$")).await);
    assert_eq!(sandbox.get_exit_status(), ExitStatus::Signal);
    assert_eq!(sandbox.get_killing_signal(), 9);
}

#[tokio::test]
async fn cpu_timeout_status() {
    let dir = TempDir::new().unwrap();
    let mut sandbox = make_sandbox(&dir);

    let mut params = SandboxParams::new();
    params.timeout = Some(200);
    sandbox.set_params(params);

    assert!(sandbox.execute_without_std(&sh("while :; do :; done")).await);
    assert_eq!(sandbox.get_exit_status(), ExitStatus::Timeout);
    assert!(sandbox.get_execution_time().unwrap() >= 0.2);
}

#[tokio::test]
async fn wall_timeout_status() {
    let dir = TempDir::new().unwrap();
    let mut sandbox = make_sandbox(&dir);

    let mut params = SandboxParams::new();
    params.wallclock_timeout = Some(300);
    sandbox.set_params(params);

    assert!(sandbox.execute_without_std(&sh("sleep 5")).await);
    assert_eq!(sandbox.get_exit_status(), ExitStatus::WallTimeout);
    assert!(sandbox.get_execution_wall_clock_time().unwrap() >= 0.3);
}

#[tokio::test]
async fn file_staging_roundtrip() {
    let dir = TempDir::new().unwrap();
    let sandbox = make_sandbox(&dir);

    sandbox
        .create_file_from_string(Path::new("input.txt"), "stage me", false, true)
        .await
        .unwrap();
    assert!(sandbox.file_exists(Path::new("input.txt")));
    assert_eq!(
        sandbox
            .get_file_to_string(Path::new("input.txt"), None)
            .await
            .unwrap(),
        "stage me"
    );
    assert_eq!(sandbox.stat_file(Path::new("input.txt")).unwrap().len(), 8);

    sandbox.remove_file(Path::new("input.txt")).await;
    assert!(!sandbox.file_exists(Path::new("input.txt")));
}

#[tokio::test]
async fn storage_staging_and_symlink() {
    let dir = TempDir::new().unwrap();
    let sandbox = make_sandbox(&dir);

    let digest = sandbox
        .file_cacher()
        .put_file_from_bytes(b"#!/bin/sh\necho run\n")
        .await
        .unwrap();

    // A plain copy.
    sandbox
        .create_file_from_storage(Path::new("copy"), &digest, false, true, false)
        .await
        .unwrap();
    assert!(!sandbox.relative_path(Path::new("copy")).is_symlink());

    // A symlinked executable install.
    sandbox
        .create_file_from_storage(Path::new("exe"), &digest, true, true, true)
        .await
        .unwrap();
    assert!(sandbox.relative_path(Path::new("exe")).is_symlink());
    assert_eq!(
        sandbox
            .get_file_to_string(Path::new("exe"), None)
            .await
            .unwrap(),
        "#!/bin/sh\necho run\n"
    );
}

#[tokio::test]
async fn sandbox_file_into_storage() {
    let dir = TempDir::new().unwrap();
    let sandbox = make_sandbox(&dir);

    sandbox
        .create_file_from_string(Path::new("produced.txt"), "output bytes", false, true)
        .await
        .unwrap();
    let digest = sandbox
        .get_file_to_storage(Path::new("produced.txt"), "", None)
        .await
        .unwrap();
    assert_eq!(
        sandbox.file_cacher().get_file_content(&digest).await.unwrap(),
        b"output bytes"
    );
}

#[tokio::test]
async fn truncated_reads() {
    let dir = TempDir::new().unwrap();
    let sandbox = make_sandbox(&dir);

    sandbox
        .create_file_from_string(Path::new("long.txt"), "0123456789", false, true)
        .await
        .unwrap();
    assert_eq!(
        sandbox
            .get_file_to_string(Path::new("long.txt"), Some(4))
            .await
            .unwrap(),
        "0123"
    );

    let digest = sandbox
        .get_file_to_storage(Path::new("long.txt"), "", Some(6))
        .await
        .unwrap();
    assert_eq!(
        sandbox.file_cacher().get_file_content(&digest).await.unwrap(),
        b"012345"
    );
}

#[tokio::test]
async fn truncator_unlimited() {
    let mut reader = Truncator::new("full text".as_bytes(), None);
    let mut buf = String::new();
    reader.read_to_string(&mut buf).await.unwrap();
    assert_eq!(buf, "full text");
}

#[tokio::test]
async fn glob_lists_sandbox_files() {
    let dir = TempDir::new().unwrap();
    let sandbox = make_sandbox(&dir);

    sandbox
        .create_file_from_string(Path::new("a.in"), "", false, true)
        .await
        .unwrap();
    sandbox
        .create_file_from_string(Path::new("b.in"), "", false, true)
        .await
        .unwrap();
    sandbox
        .create_file_from_string(Path::new("c.out"), "", false, true)
        .await
        .unwrap();

    let mut matched = sandbox.glob("*.in");
    matched.sort();
    assert_eq!(
        matched,
        vec![std::path::PathBuf::from("a.in"), std::path::PathBuf::from("b.in")]
    );
}

#[tokio::test]
async fn cleanup_deletes_root() {
    let dir = TempDir::new().unwrap();
    let mut sandbox = make_sandbox(&dir);
    let root = sandbox.get_root_path().to_owned();
    assert!(root.exists());
    sandbox.cleanup(true).await;
    assert!(!root.exists());
}
