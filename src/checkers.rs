// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::path::Path;

use grading::steps::{wcmp_check, CheckerResult};
use grading::{
    DigestHolder, DigestOrDest, DigestOrSource, GradingFileInput, Outcome, RunLog,
};
use sandbox::ExitStatus;

use crate::code::{compile_item, run_item};
use crate::package::Context;
use crate::schema::Testcase;

///
/// Compile the configured checker, or return None when the package has no checker and
/// the built-in token comparator applies.
///
pub async fn compile_checker(ctx: &mut Context) -> Result<Option<String>, String> {
    let Some(checker) = ctx.pkg.checker.clone() else {
        return Ok(None);
    };
    let digest = compile_item(ctx, &checker)
        .await
        .map_err(|e| format!("Failed compiling checker: {e}"))?;
    Ok(Some(digest))
}

///
/// Classify a run log into an early-terminal verdict, before any output comparison.
///
fn check_pre_output(ctx: &Context, run_log: Option<&RunLog>) -> CheckerResult {
    let Some(run_log) = run_log else {
        return CheckerResult::of(Outcome::InternalError);
    };

    let time_limit = ctx.pkg.time_limit;
    if let Some(time) = run_log.time {
        if time * 1000.0 > (time_limit * 2) as f64 {
            return CheckerResult::of(Outcome::TimeLimitExceeded);
        }
    }

    match run_log.exitstatus {
        ExitStatus::Signal | ExitStatus::NonzeroReturn => {
            CheckerResult::of(Outcome::RuntimeError)
        }
        ExitStatus::Timeout | ExitStatus::WallTimeout => {
            CheckerResult::of(Outcome::TimeLimitExceeded)
        }
        ExitStatus::MemoryLimitExceeded => CheckerResult::of(Outcome::MemoryLimitExceeded),
        ExitStatus::OutputLimitExceeded => CheckerResult::of(Outcome::OutputLimitExceeded),
        ExitStatus::SandboxError => CheckerResult::of(Outcome::InternalError),
        ExitStatus::Ok => CheckerResult::of(Outcome::Accepted),
    }
}

///
/// The soft-TLE rewrite: when the run beat the doubled limit but exceeded the declared
/// one, the verdict becomes TLE and the pre-rewrite verdict is kept for reporting.
///
fn convert_tle(ctx: &Context, mut result: CheckerResult, run_log: Option<&RunLog>) -> CheckerResult {
    if result.outcome == Outcome::TimeLimitExceeded {
        return result;
    }
    if let Some(time) = run_log.and_then(|log| log.time) {
        if time * 1000.0 >= ctx.pkg.time_limit as f64 {
            result.no_tle_outcome = Some(result.outcome);
            result.outcome = Outcome::TimeLimitExceeded;
        }
    }
    result
}

///
/// Classification without any output check, used when running with `--nocheck` or when a
/// testcase has no reference output.
///
pub fn check_with_no_output(ctx: &Context, run_log: Option<&RunLog>) -> CheckerResult {
    let result = check_pre_output(ctx, run_log);
    convert_tle(ctx, result, run_log)
}

async fn builtin_check(
    ctx: &Context,
    testcase: &Testcase,
    program_output: &Path,
) -> Result<CheckerResult, String> {
    let Some(output_path) = &testcase.output_path else {
        return Ok(CheckerResult::of(Outcome::Accepted));
    };
    let expected = tokio::fs::read_to_string(ctx.root.join(output_path))
        .await
        .map_err(|e| format!("Failed to read {}: {e}", output_path.display()))?;
    let output = tokio::fs::read_to_string(program_output)
        .await
        .map_err(|e| format!("Failed to read {}: {e}", program_output.display()))?;
    Ok(CheckerResult::of(wcmp_check(&expected, &output)))
}

///
/// Run the checker (or the built-in comparator) for one testcase and map its exit code
/// to a verdict: 0 accepted, 1 or 2 wrong answer, 3 judge failed, anything else an
/// internal error. The checker's stderr is attached as the result message.
///
pub async fn check(
    ctx: &mut Context,
    checker_digest: Option<&str>,
    run_log: Option<&RunLog>,
    testcase: &Testcase,
    program_output: &Path,
    skip_run_log: bool,
) -> Result<CheckerResult, String> {
    if !skip_run_log {
        let result = check_pre_output(ctx, run_log);
        if result.outcome != Outcome::Accepted {
            return Ok(convert_tle(ctx, result, run_log));
        }
    }

    let output_size = tokio::fs::metadata(program_output)
        .await
        .map(|meta| meta.len())
        .unwrap_or(0);
    let output_limit = ctx.pkg.output_limit;
    if output_size > output_limit * 1024 {
        return Ok(CheckerResult::with_message(
            Outcome::OutputLimitExceeded,
            format!(
                "Output size is {}kb, limit is {output_limit}kb.",
                output_size / 1024
            ),
        ));
    }

    let result = match checker_digest {
        None => builtin_check(ctx, testcase, program_output).await?,
        Some(digest) => {
            let checker = ctx
                .pkg
                .checker
                .clone()
                .ok_or_else(|| "Checker digest given but no checker configured".to_owned())?;

            let error = DigestHolder::new();
            let mut inputs = vec![
                GradingFileInput::from_path(testcase.input_path.clone(), "input.txt"),
                GradingFileInput::from_path(program_output, "output.txt"),
            ];
            match &testcase.output_path {
                Some(output_path) => inputs.push(GradingFileInput::from_path(
                    output_path.clone(),
                    "expected.txt",
                )),
                // Two-way checking: no reference output exists; hand the checker the
                // produced output again so the three positional files are present.
                None => inputs.push(GradingFileInput::from_path(
                    program_output,
                    "expected.txt",
                )),
            }

            let checker_run_log = run_item(
                ctx,
                &checker,
                DigestOrSource::from_digest_value(digest),
                None,
                None,
                Some(DigestOrDest::from_digest(error.clone())),
                inputs,
                vec![],
                Some("input.txt output.txt expected.txt"),
                None,
            )
            .await?;

            let message = match error.get() {
                Some(digest) => ctx.get_digest_as_string(&digest).await.unwrap_or_default(),
                None => String::new(),
            };

            match checker_run_log {
                None => CheckerResult::of(Outcome::InternalError),
                Some(log) => match log.exitcode {
                    0 => CheckerResult::with_message(Outcome::Accepted, message),
                    1 | 2 => CheckerResult::with_message(Outcome::WrongAnswer, message),
                    3 => CheckerResult::with_message(Outcome::JudgeFailed, message),
                    _ => CheckerResult::of(Outcome::InternalError),
                },
            }
        }
    };

    // The soft-TLE rewrite applies uniformly, including when the pre-output
    // classification was skipped.
    Ok(convert_tle(ctx, result, run_log))
}
