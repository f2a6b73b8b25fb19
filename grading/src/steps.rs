// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::path::{Path, PathBuf};

use log::warn;
use sandbox::{Sandbox, SandboxParams};
use serde::{Deserialize, Serialize};
use storage::copy_chunked;
use tokio::io::AsyncWriteExt;

use crate::artifacts::{GradingArtifacts, PreprocessLog, RunLog};
use crate::outcome::Outcome;

pub const MAX_STDOUT_LEN: u64 = 1024 * 1024 * 128; // 128 MB

///
/// A testcase as seen by an evaluation: an index within its group plus the input and
/// reference-output paths.
///
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestcaseIO {
    pub index: usize,
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
}

///
/// A RunLog annotated with where the run's streams ended up on the host.
///
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TestcaseLog {
    #[serde(flatten)]
    pub run: Option<RunLog>,
    pub stdout_absolute_path: Option<PathBuf>,
    pub stderr_absolute_path: Option<PathBuf>,
    pub log_absolute_path: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckerResult {
    pub outcome: Outcome,
    #[serde(default)]
    pub message: String,
    /// The verdict the checker produced before the soft-TLE rewrite, when one applied.
    #[serde(default)]
    pub no_tle_outcome: Option<Outcome>,
}

impl CheckerResult {
    pub fn of(outcome: Outcome) -> CheckerResult {
        CheckerResult {
            outcome,
            message: String::new(),
            no_tle_outcome: None,
        }
    }

    pub fn with_message(outcome: Outcome, message: impl Into<String>) -> CheckerResult {
        CheckerResult {
            outcome,
            message: message.into(),
            no_tle_outcome: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub result: CheckerResult,
    pub testcase: TestcaseIO,
    pub log: TestcaseLog,
}

///
/// Stage every input of the plan into the sandbox.
///
pub async fn process_input_artifacts(
    artifacts: &GradingArtifacts,
    sandbox: &Sandbox,
) -> Result<(), String> {
    for input in &artifacts.inputs {
        if let Some(digest) = &input.digest {
            let value = digest
                .get()
                .ok_or_else(|| format!("Input digest for {} was never produced", input.dest.display()))?;
            sandbox
                .create_file_from_storage(&input.dest, &value, input.executable, true, input.executable)
                .await?;
            continue;
        }
        let src = input
            .src
            .as_ref()
            .ok_or_else(|| format!("Input for {} has no source", input.dest.display()))?;
        let host_path = artifacts.root.join(src);
        sandbox
            .create_file_from_other_file(&input.dest, &host_path, input.executable, true, false)
            .await?;
    }
    Ok(())
}

///
/// Stage every output of the plan out of the sandbox, honoring the optional, maxlen and
/// executable flags. Returns false when a required output is missing.
///
pub async fn process_output_artifacts(
    artifacts: &GradingArtifacts,
    sandbox: &Sandbox,
) -> Result<bool, String> {
    for output in &artifacts.outputs {
        if !sandbox.file_exists(&output.src) {
            if output.optional {
                continue;
            }
            warn!("Output artifact {} does not exist.", output.src.display());
            return Ok(false);
        }
        if let Some(digest) = &output.digest {
            let value = sandbox
                .get_file_to_storage(&output.src, "", output.maxlen)
                .await?;
            digest.set(Some(value));
            if output.dest.is_none() {
                continue;
            }
        }
        let dest = output
            .dest
            .as_ref()
            .ok_or_else(|| format!("Output for {} has no destination", output.src.display()))?;
        let dst = artifacts.root.join(dest);
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| e.to_string())?;
        }
        let mut reader = sandbox.get_file(&output.src, output.maxlen).await?;
        let mut writer = tokio::fs::File::create(&dst)
            .await
            .map_err(|e| format!("Failed to create {}: {e}", dst.display()))?;
        copy_chunked(&mut reader, &mut writer, None)
            .await
            .map_err(|e| e.to_string())?;
        writer.flush().await.map_err(|e| e.to_string())?;
        drop(writer);
        if output.executable {
            set_executable(&dst).await?;
        }
    }
    Ok(true)
}

async fn set_executable(path: &Path) -> Result<(), String> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|e| format!("Failed to chmod {}: {e}", path.display()))
}

fn is_cpp_command(exe: &str) -> bool {
    exe.ends_with("g++") || exe.ends_with("clang++")
}

fn plan_stages_bits_stdcpp(artifacts: &GradingArtifacts) -> bool {
    artifacts
        .inputs
        .iter()
        .any(|input| input.dest == Path::new("bits/stdc++.h"))
}

///
/// Run the compilation command list inside the sandbox, capturing each command's output
/// into per-command log files. Stops at the first nonzero exit. Returns true iff every
/// command returned zero and every non-optional output was produced.
///
pub async fn compile(
    commands: &[String],
    params: &SandboxParams,
    sandbox: &mut Sandbox,
    artifacts: &GradingArtifacts,
) -> Result<bool, String> {
    process_input_artifacts(artifacts, sandbox).await?;

    if commands.is_empty() {
        // Code does not need preprocessing of any kind.
        return Ok(true);
    }

    let inject_include = plan_stages_bits_stdcpp(artifacts);
    let mut logs: Vec<PreprocessLog> = Vec::new();
    sandbox.set_params(params.clone());

    for (i, command) in commands.iter().enumerate() {
        let mut cmd =
            shlex::split(command).ok_or_else(|| format!("Malformed command: {command}"))?;
        if cmd.is_empty() {
            return Err(format!("Malformed command: {command}"));
        }
        let stdout_file = PathBuf::from(format!("compile-{i}.stdout"));
        let stderr_file = PathBuf::from(format!("compile-{i}.stderr"));
        sandbox
            .params_mut()
            .set_stdall(None, Some(stdout_file.clone()), Some(stderr_file.clone()));

        if inject_include && is_cpp_command(&cmd[0]) {
            // Resolve the staged bits/stdc++.h from the sandbox directory.
            cmd.push("-I.".to_owned());
        }

        if !sandbox.execute_without_std(&cmd).await {
            warn!("Sandbox crashed while processing command: {cmd:?}");
            if let Some(holder) = &artifacts.logs {
                holder.set_preprocess(logs);
            }
            return Ok(false);
        }

        let stderr_log = if sandbox.file_exists(&stderr_file) {
            sandbox.get_file_to_string(&stderr_file, None).await?
        } else {
            "<No stderr produced by command>".to_owned()
        };
        let stdout_log = if sandbox.file_exists(&stdout_file) {
            sandbox.get_file_to_string(&stdout_file, None).await?
        } else {
            "<No stdout produced by command>".to_owned()
        };

        let log = PreprocessLog {
            cmd,
            exitcode: sandbox.get_exit_code(),
            log: format!("{stderr_log}\n{stdout_log}"),
        };
        let failed = log.exitcode != 0;
        logs.push(log);
        if failed {
            break;
        }
    }

    let ok = logs.last().map(|log| log.exitcode == 0).unwrap_or(true);
    if let Some(holder) = &artifacts.logs {
        holder.set_preprocess(logs);
    }
    if !ok {
        return Ok(false);
    }

    process_output_artifacts(artifacts, sandbox).await
}

///
/// Run a single command inside the sandbox and capture its RunLog. Success here is
/// orthogonal to the child's own exit status: a None return means the sandbox itself
/// failed or an output went missing, while any completed execution produces a log for
/// the caller to classify.
///
pub async fn run(
    command: &str,
    params: &SandboxParams,
    sandbox: &mut Sandbox,
    artifacts: &GradingArtifacts,
) -> Result<Option<RunLog>, String> {
    process_input_artifacts(artifacts, sandbox).await?;
    let cmd = shlex::split(command).ok_or_else(|| format!("Malformed command: {command}"))?;
    if cmd.is_empty() {
        return Err(format!("Malformed command: {command}"));
    }
    sandbox.set_params(params.clone());

    if !sandbox.execute_without_std(&cmd).await {
        warn!("Sandbox crashed while processing command: {cmd:?}");
        return Ok(None);
    }

    if !process_output_artifacts(artifacts, sandbox).await? {
        return Ok(None);
    }

    let run_log = RunLog {
        exitcode: sandbox.get_exit_code(),
        exitstatus: sandbox.get_exit_status(),
        time: sandbox.get_execution_time(),
        memory: sandbox.get_memory_used(),
        wall_time: sandbox.get_execution_wall_clock_time(),
    };
    if let Some(holder) = &artifacts.logs {
        holder.set_run(run_log.clone());
    }
    Ok(Some(run_log))
}

///
/// The built-in token-wise comparator used when no checker is configured: split both
/// sides by whitespace and compare the token sequences.
///
pub fn wcmp_check(expected: &str, output: &str) -> Outcome {
    let expected_words: Vec<&str> = expected.split_whitespace().collect();
    let output_words: Vec<&str> = output.split_whitespace().collect();
    if expected_words == output_words {
        Outcome::Accepted
    } else {
        Outcome::WrongAnswer
    }
}
