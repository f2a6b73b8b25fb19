// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::path::{Path, PathBuf};

use grading::{
    steps_with_caching, DigestHolder, DigestOrDest, DigestOrSource, GradingArtifacts,
    GradingFileInput, GradingFileOutput, RunLog,
};
use log::{debug, warn};

use crate::environment::{
    merge_execution_configs, sandbox_params_from_config, ExecutionConfig,
};
use crate::package::Context;
use crate::schema::CodeItem;

pub const TESTLIB: &str = "testlib.h";
pub const JNGEN: &str = "jngen.h";
pub const BITS_STDCPP: &str = "bits/stdc++.h";

pub fn get_extension(code: &CodeItem) -> String {
    code.path
        .extension()
        .map(|ext| ext.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub fn find_language_name(ctx: &Context, code: &CodeItem) -> Result<String, String> {
    match &code.language {
        Some(language) => Ok(ctx.env.get_language(language)?.name.clone()),
        None => Ok(ctx
            .env
            .language_for_extension(&get_extension(code))?
            .name
            .clone()),
    }
}

fn is_cpp_command(exe: &str) -> bool {
    exe.ends_with("g++") || exe.ends_with("clang++")
}

///
/// Substitute an alternative compiler name into the compile commands, for hosts where
/// `g++` resolves to a different toolchain.
///
fn normalize_compiler(ctx: &Context, commands: Vec<String>) -> Vec<String> {
    let Some(alternative) = ctx.env.compiler_extension().gpp_alternative else {
        return commands;
    };
    commands
        .into_iter()
        .map(|command| command.replace("g++", &alternative))
        .collect()
}

///
/// Whether any compile command resolves to a clang-like compiler, in which case the
/// vendored `bits/stdc++.h` must be staged for `#include <bits/stdc++.h>` to resolve.
///
fn detect_clang(commands: &[String]) -> bool {
    for command in commands {
        let Some(cmd) = shlex::split(command) else {
            continue;
        };
        let Some(exe) = cmd.first() else {
            continue;
        };
        if !is_cpp_command(exe) {
            continue;
        }
        let output = std::process::Command::new(exe).arg("-v").output();
        let Ok(output) = output else {
            warn!("Failed to probe compiler version for {exe}");
            continue;
        };
        let stderr = String::from_utf8_lossy(&output.stderr);
        if let Some(first_line) = stderr.lines().next() {
            if first_line.contains("clang") {
                return true;
            }
        }
    }
    false
}

///
/// Extra headers automatically staged next to a C++ compilation: `testlib.h` and
/// `jngen.h` when present in the package, and `bits/stdc++.h` for clang-like compilers.
///
fn auto_include_inputs(ctx: &Context, commands: &[String]) -> Vec<GradingFileInput> {
    let mut inputs = Vec::new();
    if !commands.iter().any(|c| {
        shlex::split(c)
            .and_then(|cmd| cmd.first().cloned())
            .is_some_and(|exe| is_cpp_command(&exe))
    }) {
        return inputs;
    }
    for header in [TESTLIB, JNGEN] {
        if ctx.root.join(header).is_file() {
            inputs.push(GradingFileInput::from_path(header, header));
        }
    }
    if ctx.root.join(BITS_STDCPP).is_file() && detect_clang(commands) {
        inputs.push(GradingFileInput::from_path(BITS_STDCPP, BITS_STDCPP));
    }
    inputs
}

///
/// Where a compilation-support file lands inside the sandbox: next to the compilable,
/// keeping its path relative to the code item's directory when possible.
///
fn compilation_file_dest(code: &CodeItem, file: &Path) -> PathBuf {
    let base = code.path.parent().unwrap_or(Path::new(""));
    match file.strip_prefix(base) {
        Ok(stripped) => stripped.to_owned(),
        Err(_) => PathBuf::from(file.file_name().unwrap_or(file.as_os_str())),
    }
}

///
/// Compile a code item and return the digest of the produced executable. Interpreted
/// languages return the digest of the source itself.
///
pub async fn compile_item(ctx: &mut Context, code: &CodeItem) -> Result<String, String> {
    let language = find_language_name(ctx, code)?;
    let compilation = ctx.env.compilation_config(&language)?;
    let mapping = ctx.env.file_mapping(&language)?;
    let source_path = ctx.root.join(&code.path);

    if compilation.commands.is_empty() {
        // The language is not compiled; the source is the executable.
        return ctx
            .cacher
            .put_file_from_path(&source_path)
            .await
            .map_err(|e| e.to_string());
    }

    let commands: Vec<String> = compilation
        .commands
        .iter()
        .map(|command| mapping.apply(command))
        .collect();
    let commands = normalize_compiler(ctx, commands);
    let params = sandbox_params_from_config(compilation.sandbox.as_ref());

    let compiled_digest = DigestHolder::new();
    let mut artifacts = GradingArtifacts::with_root(&ctx.root);
    artifacts.inputs.extend(auto_include_inputs(ctx, &commands));
    for file in &code.compilation_files {
        artifacts.inputs.push(GradingFileInput::from_path(
            file.clone(),
            compilation_file_dest(code, file),
        ));
    }
    artifacts.inputs.push(GradingFileInput::from_path(
        code.path.clone(),
        &mapping.compilable,
    ));
    artifacts.outputs.push(
        GradingFileOutput::to_digest(&mapping.executable, compiled_digest.clone()).executable(),
    );
    artifacts.logs = Some(grading::GradingLogsHolder::new());

    let Context {
        sandbox, cache, ..
    } = ctx;
    let ok = steps_with_caching::compile(&commands, &params, sandbox, &artifacts, cache).await?;
    if !ok {
        let mut message = format!("Compilation of {} failed", code.path.display());
        if let Some(preprocess) = artifacts.logs.as_ref().and_then(|l| l.preprocess()) {
            if let Some(last) = preprocess.last() {
                message = format!(
                    "{message}\nCommand: {:?}\nExit code: {}\n{}",
                    last.cmd, last.exitcode, last.log
                );
            }
        }
        return Err(message);
    }

    compiled_digest
        .get()
        .ok_or_else(|| format!("Compilation of {} produced no executable", code.path.display()))
}

///
/// Run a compiled code item once, wiring stdio and extra artifact I/O per the caller's
/// request and passing everything through the dependency cache.
///
pub async fn run_item(
    ctx: &mut Context,
    code: &CodeItem,
    executable: DigestOrSource,
    stdin: Option<DigestOrSource>,
    stdout: Option<DigestOrDest>,
    stderr: Option<DigestOrDest>,
    extra_inputs: Vec<GradingFileInput>,
    extra_outputs: Vec<GradingFileOutput>,
    extra_args: Option<&str>,
    extra_config: Option<&ExecutionConfig>,
) -> Result<Option<RunLog>, String> {
    let language = find_language_name(ctx, code)?;
    let base_config = ctx.env.execution_config(&language)?;
    let execution = match extra_config {
        Some(extra) => merge_execution_configs([&base_config, extra].into_iter()),
        None => base_config,
    };
    let mapping = ctx.env.file_mapping(&language)?;
    let mut params = sandbox_params_from_config(execution.sandbox.as_ref());

    params.set_stdall(
        stdin.as_ref().map(|_| PathBuf::from(&mapping.input)),
        stdout.as_ref().map(|_| PathBuf::from(&mapping.output)),
        stderr.as_ref().map(|_| PathBuf::from(&mapping.error)),
    );

    let command = execution
        .command
        .ok_or_else(|| format!("Language {language} has no execution command"))?;
    let mut command = mapping.apply(&command);
    if let Some(extra_args) = extra_args {
        let mut splitted =
            shlex::split(&command).ok_or_else(|| format!("Malformed command: {command}"))?;
        splitted.extend(
            shlex::split(extra_args)
                .ok_or_else(|| format!("Malformed extra args: {extra_args}"))?,
        );
        command = shlex::join(splitted.iter().map(String::as_str));
    }

    let mut artifacts = GradingArtifacts::with_root(&ctx.root);
    artifacts.inputs.push(
        GradingFileInput::from_source(&executable, &mapping.executable).executable(),
    );
    if let Some(stdin) = &stdin {
        artifacts
            .inputs
            .push(GradingFileInput::from_source(stdin, &mapping.input));
    }
    if let Some(stdout) = &stdout {
        artifacts
            .outputs
            .push(GradingFileOutput::to_dest(&mapping.output, stdout));
    }
    if let Some(stderr) = &stderr {
        artifacts
            .outputs
            .push(GradingFileOutput::to_dest(&mapping.error, stderr));
    }
    artifacts.inputs.extend(extra_inputs);
    artifacts.outputs.extend(extra_outputs);

    debug!("Running {command}");
    let Context {
        sandbox, cache, ..
    } = ctx;
    steps_with_caching::run(&command, &params, sandbox, &mut artifacts, cache).await
}
