// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use grading::{DigestHolder, DigestOrDest, DigestOrSource};
use hashing::Fingerprint;
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::code::{compile_item, run_item};
use crate::environment::{EnvironmentSandbox, ExecutionConfig};
use crate::package::Context;
use crate::schema::{GeneratorCall, Testcase, TestcaseSubgroup};
use crate::stressing::args::{self, ArgsGenerator};
use crate::testcases::{clear_built_testcases, find_built_testcases};
use crate::validators;

fn group_input(group_path: &Path, subgroup_prefix: &str, i: usize) -> PathBuf {
    group_path.join(format!("{subgroup_prefix}{i:03}.in"))
}

fn group_output(group_path: &Path, subgroup_prefix: &str, i: usize) -> PathBuf {
    group_path.join(format!("{subgroup_prefix}{i:03}.out"))
}

///
/// Expand a generator-call argument template. Build-time expansion is deterministic: the
/// randomness is seeded from the argument string itself, so the same declared call
/// always produces the same testcase.
///
pub fn expand_build_args(ctx: &Context, raw_args: &str) -> Result<String, String> {
    let parsed = args::parse(raw_args)?;
    let vars = ctx.pkg.expanded_vars();
    let generator = ArgsGenerator::new(&vars);
    let seed = Fingerprint::digest(raw_args.as_bytes()).prefix_u64();
    let mut rng = StdRng::seed_from_u64(seed);
    generator.generate(&parsed, &mut rng)
}

///
/// Expand a generator-call argument template with fresh randomness, for stress runs and
/// one-off calls.
///
pub fn expand_random_args(ctx: &Context, raw_args: &str) -> Result<String, String> {
    let parsed = args::parse(raw_args)?;
    let vars = ctx.pkg.expanded_vars();
    let generator = ArgsGenerator::new(&vars);
    let mut rng = rand::rngs::StdRng::from_entropy();
    generator.generate(&parsed, &mut rng)
}

fn copy_testcase_over(
    ctx: &Context,
    testcase: &Testcase,
    group_path: &Path,
    subgroup_prefix: &str,
    i: usize,
) -> Result<(), String> {
    let input_src = ctx.root.join(&testcase.input_path);
    std::fs::copy(&input_src, group_input(group_path, subgroup_prefix, i))
        .map_err(|e| format!("Failed to copy testcase {}: {e}", input_src.display()))?;
    if let Some(output_path) = &testcase.output_path {
        let output_src = ctx.root.join(output_path);
        if output_src.is_file() {
            std::fs::copy(&output_src, group_output(group_path, subgroup_prefix, i))
                .map_err(|e| format!("Failed to copy testcase output {}: {e}", output_src.display()))?;
        }
    }
    Ok(())
}

async fn run_generator(
    ctx: &mut Context,
    generator_name: &str,
    raw_args: Option<&str>,
    compiled_digest: &str,
    group_path: &Path,
    subgroup_prefix: &str,
    i: usize,
) -> Result<(), String> {
    let generator = ctx.pkg.get_generator(generator_name)?.clone();
    let expanded_args = match raw_args {
        Some(raw_args) => Some(expand_build_args(ctx, raw_args)?),
        None => None,
    };

    let stderr_digest = DigestHolder::new();
    let run_log = run_item(
        ctx,
        &generator.code,
        DigestOrSource::from_digest_value(compiled_digest),
        None,
        Some(DigestOrDest::from_path(group_input(
            group_path,
            subgroup_prefix,
            i,
        ))),
        Some(DigestOrDest::from_digest(stderr_digest.clone())),
        vec![],
        vec![],
        expanded_args.as_deref().filter(|args| !args.is_empty()),
        None,
    )
    .await?;

    let failed = run_log.as_ref().map(|log| log.exitcode != 0).unwrap_or(true);
    if failed {
        let mut message = format!(
            "Failed generating test {i} from group path {}",
            group_path.display()
        );
        if let Some(digest) = stderr_digest.get() {
            if let Some(stderr) = ctx.get_digest_as_string(&digest).await {
                if !stderr.is_empty() {
                    message = format!("{message}\nStderr:\n{stderr}");
                }
            }
        }
        return Err(message);
    }
    Ok(())
}

///
/// Compile every (tracked) generator of the package, keyed by generator name.
///
pub async fn compile_generators(
    ctx: &mut Context,
    tracked_generators: Option<&HashSet<String>>,
) -> Result<HashMap<String, String>, String> {
    let generators: Vec<_> = ctx
        .pkg
        .generators
        .iter()
        .filter(|generator| {
            tracked_generators
                .map(|tracked| tracked.contains(&generator.name))
                .unwrap_or(true)
        })
        .cloned()
        .collect();

    let mut compiled = HashMap::new();
    for generator in generators {
        info!("Compiling generator {}", generator.name);
        let digest = compile_item(ctx, &generator.code)
            .await
            .map_err(|e| format!("Failed compiling generator {}: {e}", generator.name))?;
        compiled.insert(generator.name.clone(), digest);
    }
    Ok(compiled)
}

///
/// Obtain the generator script of a subgroup as text: either the `.txt` file itself, or
/// the stdout of the compiled script program.
///
async fn run_generator_script(
    ctx: &mut Context,
    subgroup: &TestcaseSubgroup,
) -> Result<String, String> {
    let script = subgroup
        .generator_script
        .clone()
        .ok_or_else(|| "Subgroup has no generator script".to_owned())?;

    let script_digest = if script.path.extension().map(|e| e == "txt").unwrap_or(false) {
        ctx.cacher
            .put_file_from_path(&ctx.root.join(&script.path))
            .await
            .map_err(|e| e.to_string())?
    } else {
        let compiled_digest = compile_item(ctx, &script).await.map_err(|e| {
            format!(
                "Failed compiling generator script for group {}: {e}",
                subgroup.name
            )
        })?;

        let stdout_digest = DigestHolder::new();
        let stderr_digest = DigestHolder::new();
        let run_log = run_item(
            ctx,
            &script,
            DigestOrSource::from_digest_value(&compiled_digest),
            None,
            Some(DigestOrDest::from_digest(stdout_digest.clone())),
            Some(DigestOrDest::from_digest(stderr_digest.clone())),
            vec![],
            vec![],
            None,
            None,
        )
        .await?;

        let failed = run_log.as_ref().map(|log| log.exitcode != 0).unwrap_or(true);
        if failed {
            let mut message = format!("Could not run generator script for group {}", subgroup.name);
            if let Some(digest) = stderr_digest.get() {
                if let Some(stderr) = ctx.get_digest_as_string(&digest).await {
                    message = format!("{message}\nStderr:\n{stderr}");
                }
            }
            return Err(message);
        }
        stdout_digest
            .get()
            .ok_or_else(|| "Generator script produced no output".to_owned())?
    };

    let content = ctx
        .cacher
        .get_file_content(&script_digest)
        .await
        .map_err(|e| e.to_string())?;
    Ok(String::from_utf8_lossy(&content).into_owned())
}

///
/// The `(generator, args)` pairs declared by a generator script, one per non-empty,
/// non-comment line.
///
fn extract_script_lines(script: &str) -> Result<Vec<(String, String)>, String> {
    let mut calls = Vec::new();
    for line in script.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parts =
            shlex::split(line).ok_or_else(|| format!("Malformed generator script line: {line}"))?;
        let Some((name, args)) = parts.split_first() else {
            continue;
        };
        calls.push((
            name.clone(),
            shlex::join(args.iter().map(String::as_str)),
        ));
    }
    Ok(calls)
}

///
/// The names of the generators actually used by the selected groups.
///
async fn necessary_generators(
    ctx: &mut Context,
    groups: &HashSet<String>,
) -> Result<HashSet<String>, String> {
    let existing: HashSet<String> = ctx
        .pkg
        .generators
        .iter()
        .map(|generator| generator.name.clone())
        .collect();

    let group_list: Vec<_> = ctx
        .pkg
        .testcases
        .iter()
        .filter(|group| groups.contains(group.name()))
        .cloned()
        .collect();

    let mut necessary = HashSet::new();
    for group in group_list {
        for subgroup in all_subgroups(&group.subgroup, &group.subgroups) {
            for call in &subgroup.generators {
                necessary.insert(call.name.clone());
            }
            if subgroup.generator_script.is_some() {
                let script = run_generator_script(ctx, &subgroup).await?;
                for (name, _) in extract_script_lines(&script)? {
                    necessary.insert(name);
                }
            }
        }
    }
    Ok(existing.intersection(&necessary).cloned().collect())
}

///
/// The subgroups to generate for a group, in order. A group without subgroups is itself
/// a single anonymous subgroup; otherwise the group's own sources come first, as a
/// subgroup named `main`.
///
fn all_subgroups(own: &TestcaseSubgroup, subgroups: &[TestcaseSubgroup]) -> Vec<TestcaseSubgroup> {
    if subgroups.is_empty() {
        return vec![own.clone()];
    }
    let mut renamed = own.clone();
    renamed.name = "main".to_owned();
    let mut all = vec![renamed];
    all.extend(subgroups.iter().cloned());
    all
}

async fn generate_testcases_for_subgroup(
    ctx: &mut Context,
    subgroup: &TestcaseSubgroup,
    group_path: &Path,
    subgroup_prefix: &str,
    compiled_generators: &HashMap<String, String>,
) -> Result<(), String> {
    std::fs::create_dir_all(group_path)
        .map_err(|e| format!("Failed to create {}: {e}", group_path.display()))?;

    let mut i = 0;

    // Individual testcases.
    for testcase in &subgroup.testcases {
        copy_testcase_over(ctx, testcase, group_path, subgroup_prefix, i)?;
        i += 1;
    }

    // Glob testcases.
    if let Some(testcase_glob) = &subgroup.testcase_glob {
        let pattern = ctx.root.join(testcase_glob);
        let pattern = pattern
            .to_str()
            .ok_or_else(|| "Invalid testcase glob".to_owned())?;
        let mut matched: Vec<PathBuf> = glob::glob(pattern)
            .map_err(|e| format!("Invalid testcase glob: {e}"))?
            .filter_map(Result::ok)
            .collect();
        matched.sort();
        for input_path in matched {
            if !input_path.is_file()
                || input_path.extension().map(|e| e != "in").unwrap_or(true)
            {
                continue;
            }
            let output_path = input_path.with_extension("out");
            let testcase = Testcase {
                input_path,
                output_path: Some(output_path),
            };
            copy_testcase_over(ctx, &testcase, group_path, subgroup_prefix, i)?;
            i += 1;
        }
    }

    // Run single generators.
    for call in subgroup.generators.clone() {
        let digest = compiled_generators
            .get(&call.name)
            .ok_or_else(|| format!("Generator {} not compiled", call.name))?
            .clone();
        run_generator(
            ctx,
            &call.name,
            call.args.as_deref(),
            &digest,
            group_path,
            subgroup_prefix,
            i,
        )
        .await?;
        i += 1;
    }

    // Run the generator script.
    if subgroup.generator_script.is_some() {
        let script = run_generator_script(ctx, subgroup).await?;
        for (name, call_args) in extract_script_lines(&script)? {
            let digest = compiled_generators
                .get(&name)
                .ok_or_else(|| format!("Generator {name} not compiled"))?
                .clone();
            run_generator(
                ctx,
                &name,
                Some(&call_args),
                &digest,
                group_path,
                subgroup_prefix,
                i,
            )
            .await?;
            i += 1;
        }
    }

    Ok(())
}

///
/// Build the input files of every (selected) testcase group, in declaration order.
///
pub async fn generate_testcases(
    ctx: &mut Context,
    groups: Option<&HashSet<String>>,
) -> Result<(), String> {
    let tracked = match groups {
        Some(groups) => Some(necessary_generators(ctx, groups).await?),
        None => None,
    };
    let compiled_generators = compile_generators(ctx, tracked.as_ref()).await?;

    clear_built_testcases(ctx)?;

    let group_list: Vec<_> = ctx.pkg.testcases.clone();
    for group in group_list {
        if let Some(groups) = groups {
            if !groups.contains(group.name()) {
                continue;
            }
        }
        let group_path = ctx.build_testgroup_path(group.name());

        if group.subgroups.is_empty() {
            // The group is itself a single subgroup; filenames carry no prefix.
            generate_testcases_for_subgroup(ctx, &group.subgroup, &group_path, "", &compiled_generators)
                .await?;
            continue;
        }

        for (index, subgroup) in all_subgroups(&group.subgroup, &group.subgroups)
            .iter()
            .enumerate()
        {
            let prefix = format!("{index}-{}-", subgroup.name);
            generate_testcases_for_subgroup(ctx, subgroup, &group_path, &prefix, &compiled_generators)
                .await?;
        }
    }
    Ok(())
}

///
/// Generate one standalone input from a generator call, expanding its argument template
/// with fresh randomness and optionally validating the produced testcase. Returns the
/// call with its arguments expanded, for reporting and regression scripts.
///
pub async fn generate_standalone(
    ctx: &mut Context,
    call: &GeneratorCall,
    output: &Path,
    validate: bool,
    generator_digest: Option<&str>,
    validator_digest: Option<&str>,
) -> Result<GeneratorCall, String> {
    let expanded_args = expand_random_args(ctx, call.args.as_deref().unwrap_or(""))?;

    let generator = ctx.pkg.get_generator(&call.name)?.clone();
    let generator_digest = match generator_digest {
        Some(digest) => digest.to_owned(),
        None => compile_item(ctx, &generator.code).await?,
    };

    let stderr_digest = DigestHolder::new();
    let run_log = run_item(
        ctx,
        &generator.code,
        DigestOrSource::from_digest_value(&generator_digest),
        None,
        Some(DigestOrDest::from_path(output)),
        Some(DigestOrDest::from_digest(stderr_digest.clone())),
        vec![],
        vec![],
        Some(&expanded_args).map(String::as_str).filter(|s| !s.is_empty()),
        None,
    )
    .await?;

    let failed = run_log.as_ref().map(|log| log.exitcode != 0).unwrap_or(true);
    if failed {
        let mut message = format!(
            "Failed generating test using generator call {} {expanded_args}",
            call.name
        );
        if let Some(digest) = stderr_digest.get() {
            if let Some(stderr) = ctx.get_digest_as_string(&digest).await {
                message = format!("{message}\nStderr:\n{stderr}");
            }
        }
        return Err(message);
    }

    if validate {
        if let Some(validator) = ctx.pkg.validator.clone() {
            let validator_digest = match validator_digest {
                Some(digest) => digest.to_owned(),
                None => compile_item(ctx, &validator).await?,
            };
            let (ok, message, _) =
                validators::validate_test(ctx, &output.to_owned(), &validator, &validator_digest)
                    .await?;
            if !ok {
                return Err(format!(
                    "Failed validating testcase generated by call {} {expanded_args}\nMessage: {}\nTestcase written at {}",
                    call.name,
                    message.unwrap_or_default(),
                    output.display()
                ));
            }
        }
    }

    Ok(GeneratorCall {
        name: call.name.clone(),
        args: Some(expanded_args),
    })
}

///
/// Run the main solution over one built testcase to produce its reference output, under
/// a doubled time limit and the package's memory and output limits.
///
pub async fn generate_output_for_testcase(
    ctx: &mut Context,
    main_solution_digest: &str,
    testcase: &Testcase,
    stderr_path: Option<&Path>,
) -> Result<(), String> {
    let main_solution = ctx
        .pkg
        .main_solution()
        .ok_or_else(|| "No main solution found to generate outputs for testcases".to_owned())?
        .clone();
    let output_path = testcase
        .output_path
        .clone()
        .ok_or_else(|| "Testcase has no output path".to_owned())?;

    let sandbox_config = EnvironmentSandbox {
        time_limit: Some(ctx.pkg.time_limit * 2),
        wall_time_limit: Some(ctx.pkg.time_limit * 2),
        memory_limit: Some(ctx.pkg.memory_limit),
        file_size_limit: Some(ctx.pkg.output_limit),
        ..EnvironmentSandbox::default()
    };
    let extra_config = ExecutionConfig {
        command: None,
        sandbox: Some(sandbox_config),
    };

    let run_log = run_item(
        ctx,
        &main_solution.code,
        DigestOrSource::from_digest_value(main_solution_digest),
        Some(DigestOrSource::from_path(&testcase.input_path)),
        Some(DigestOrDest::from_path(&output_path)),
        stderr_path.map(DigestOrDest::from_path),
        vec![],
        vec![],
        None,
        Some(&extra_config),
    )
    .await?;

    let failed = run_log.as_ref().map(|log| log.exitcode != 0).unwrap_or(true);
    if failed {
        let mut message = format!(
            "Failed generating output for {}",
            testcase.input_path.display()
        );
        if let Some(log) = run_log {
            let verdict = crate::checkers::check_with_no_output(ctx, Some(&log));
            message = format!(
                "{message}\nMain solution exited with code {}\nVerdict: {}",
                log.exitcode, verdict.outcome
            );
        }
        return Err(message);
    }
    Ok(())
}

///
/// Produce the reference output of every built testcase that does not have one, using
/// the main solution. Skipped entirely when the package has no main solution.
///
pub async fn generate_outputs_for_testcases(
    ctx: &mut Context,
    groups: Option<&HashSet<String>>,
) -> Result<(), String> {
    let Some(main_solution) = ctx.pkg.main_solution().cloned() else {
        info!("No main solution; skipping reference output generation.");
        return Ok(());
    };

    info!("Compiling main solution...");
    let solution_digest = compile_item(ctx, &main_solution.code)
        .await
        .map_err(|e| format!("Failed compiling main solution: {e}"))?;

    let gen_runs_dir = ctx.runs_dir().join(".gen");
    let _ = std::fs::remove_dir_all(&gen_runs_dir);
    std::fs::create_dir_all(&gen_runs_dir).map_err(|e| e.to_string())?;
    let stderr_path = gen_runs_dir.join("main.stderr");

    let group_list: Vec<_> = ctx.pkg.testcases.clone();
    for group in group_list {
        if let Some(groups) = groups {
            if !groups.contains(group.name()) {
                continue;
            }
        }
        for testcase in find_built_testcases(ctx, &group) {
            generate_output_for_testcase(ctx, &solution_digest, &testcase, Some(&stderr_path))
                .await?;
        }
    }
    Ok(())
}
