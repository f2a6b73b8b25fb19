// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use grading::steps::{Evaluation, TestcaseIO, TestcaseLog};
use grading::{DigestOrDest, DigestOrSource, Outcome};
use log::info;
use serde::Serialize;

use crate::checkers;
use crate::code::{compile_item, run_item};
use crate::environment::{EnvironmentSandbox, ExecutionConfig, VerificationLevel};
use crate::package::Context;
use crate::schema::{Solution, Testcase};
use crate::testcases::find_built_testcases;

///
/// One element of the evaluation stream: which solution, group and testcase the attached
/// evaluation belongs to. Items are emitted in the exact order they are produced.
///
#[derive(Clone, Debug, Serialize)]
pub struct EvaluationItem {
    pub solution_index: usize,
    pub group_name: String,
    pub testcase_index: usize,
    pub eval: Evaluation,
}

#[derive(Clone, Debug)]
pub struct GroupSkeleton {
    pub name: String,
    pub testcases: Vec<Testcase>,
}

///
/// The static shape of a run: which solutions over which groups and testcases, known
/// before any evaluation happens so consumers can render progress incrementally.
///
#[derive(Clone, Debug)]
pub struct SolutionReportSkeleton {
    pub solutions: Vec<(usize, Solution)>,
    pub groups: Vec<GroupSkeleton>,
    pub group_first: bool,
}

/// solution path → group name → evaluations received so far (None while pending).
pub type StructuredEvaluation = HashMap<String, HashMap<String, Vec<Option<Evaluation>>>>;

impl SolutionReportSkeleton {
    pub fn empty_structured_evaluation(&self) -> StructuredEvaluation {
        let mut res = StructuredEvaluation::new();
        for (_, solution) in &self.solutions {
            let mut groups = HashMap::new();
            for group in &self.groups {
                groups.insert(group.name.clone(), vec![None; group.testcases.len()]);
            }
            res.insert(solution.code.path.display().to_string(), groups);
        }
        res
    }
}

fn is_fast(solution: &Solution) -> bool {
    // A solution expecting TLE is considered slow.
    !solution.outcome.is_slow()
}

///
/// Compile every selected solution, stopping at the first compile error.
///
pub async fn compile_solutions(
    ctx: &mut Context,
    tracked_solutions: Option<&HashSet<String>>,
) -> Result<HashMap<PathBuf, String>, String> {
    let solutions: Vec<Solution> = ctx
        .pkg
        .solutions
        .iter()
        .filter(|solution| {
            tracked_solutions
                .map(|tracked| tracked.contains(&solution.code.path.display().to_string()))
                .unwrap_or(true)
        })
        .cloned()
        .collect();

    let mut compiled = HashMap::new();
    for solution in solutions {
        info!("Compiling solution {}...", solution.code.path.display());
        let digest = compile_item(ctx, &solution.code)
            .await
            .map_err(|e| format!("Failed compiling solution {}: {e}", solution.code.path.display()))?;
        compiled.insert(solution.code.path.clone(), digest);
    }
    Ok(compiled)
}

///
/// Run one solution over one testcase: build the per-solution sandbox budget, capture
/// stdout/stderr under the runs directory, and classify through the checker.
///
async fn run_solution_on_testcase(
    ctx: &mut Context,
    solution: &Solution,
    compiled_digest: &str,
    checker_digest: Option<&str>,
    check: bool,
    testcase: &Testcase,
    output_dir: &Path,
    testcase_index: usize,
    verification: VerificationLevel,
) -> Result<Evaluation, String> {
    let mut time_limit = ctx.pkg.time_limit;
    if verification >= VerificationLevel::Full {
        // Run under double TL; the soft-TLE rewrite recovers the true verdict.
        time_limit *= 2;
    }
    let wall_time_limit = if ctx.sandbox.use_soft_timeout() {
        ctx.pkg.time_limit * 2
    } else {
        time_limit
    };
    let sandbox_config = EnvironmentSandbox {
        time_limit: Some(time_limit),
        wall_time_limit: Some(wall_time_limit),
        memory_limit: Some(ctx.pkg.memory_limit),
        file_size_limit: Some(ctx.pkg.output_limit),
        ..EnvironmentSandbox::default()
    };
    let extra_config = ExecutionConfig {
        command: None,
        sandbox: Some(sandbox_config),
    };

    let input_name = testcase
        .input_path
        .file_name()
        .ok_or_else(|| format!("Invalid testcase input {}", testcase.input_path.display()))?;
    let output_path = output_dir.join(input_name).with_extension("out");
    let error_path = output_path.with_extension("err");
    let log_path = output_path.with_extension("log");
    std::fs::create_dir_all(output_dir).map_err(|e| e.to_string())?;

    let run_log = run_item(
        ctx,
        &solution.code,
        DigestOrSource::from_digest_value(compiled_digest),
        Some(DigestOrSource::from_path(&testcase.input_path)),
        Some(DigestOrDest::from_path(&output_path)),
        Some(DigestOrDest::from_path(&error_path)),
        vec![],
        vec![],
        None,
        Some(&extra_config),
    )
    .await?;

    let result = if check {
        checkers::check(
            ctx,
            checker_digest,
            run_log.as_ref(),
            testcase,
            &output_path,
            false,
        )
        .await?
    } else {
        checkers::check_with_no_output(ctx, run_log.as_ref())
    };

    let eval = Evaluation {
        result,
        testcase: TestcaseIO {
            index: testcase_index,
            input: Some(testcase.input_path.clone()),
            output: testcase.output_path.clone(),
        },
        log: TestcaseLog {
            run: run_log,
            stdout_absolute_path: Some(output_path),
            stderr_absolute_path: Some(error_path),
            log_absolute_path: Some(log_path.clone()),
        },
    };

    if let Ok(rendered) = serde_yaml::to_string(&eval) {
        let _ = std::fs::write(&log_path, rendered);
    }
    Ok(eval)
}

fn selected_solutions(
    ctx: &Context,
    tracked_solutions: Option<&HashSet<String>>,
    verification: VerificationLevel,
) -> Vec<(usize, Solution)> {
    ctx.pkg
        .solutions
        .iter()
        .enumerate()
        .filter(|(_, solution)| verification >= VerificationLevel::AllSolutions || is_fast(solution))
        .filter(|(_, solution)| {
            tracked_solutions
                .map(|tracked| tracked.contains(&solution.code.path.display().to_string()))
                .unwrap_or(true)
        })
        .map(|(i, solution)| (i, solution.clone()))
        .collect()
}

pub fn report_skeleton(
    ctx: &Context,
    tracked_solutions: Option<&HashSet<String>>,
    verification: VerificationLevel,
    group_first: bool,
) -> SolutionReportSkeleton {
    let solutions = selected_solutions(ctx, tracked_solutions, verification);
    let groups = ctx
        .pkg
        .testcases
        .iter()
        .map(|group| GroupSkeleton {
            name: group.name().to_owned(),
            testcases: find_built_testcases(ctx, group),
        })
        .collect();
    SolutionReportSkeleton {
        solutions,
        groups,
        group_first,
    }
}

///
/// Evaluate the selected solutions over every built testcase, streaming
/// `EvaluationItem`s to the sink in the requested order (all groups per solution, or all
/// solutions per group). The returned vector holds the same items for aggregation.
///
pub async fn run_solutions(
    ctx: &mut Context,
    tracked_solutions: Option<&HashSet<String>>,
    verification: VerificationLevel,
    check: bool,
    group_first: bool,
    on_item: &mut dyn FnMut(&EvaluationItem),
) -> Result<(SolutionReportSkeleton, Vec<EvaluationItem>), String> {
    let checker_digest = if check {
        checkers::compile_checker(ctx).await?
    } else {
        None
    };
    let compiled_solutions = compile_solutions(ctx, tracked_solutions).await?;

    // Clear the runs directory and rely on the cache to repopulate it.
    let runs_dir = ctx.runs_dir();
    let _ = std::fs::remove_dir_all(&runs_dir);
    std::fs::create_dir_all(&runs_dir).map_err(|e| e.to_string())?;

    let skeleton = report_skeleton(ctx, tracked_solutions, verification, group_first);

    let mut items = Vec::new();
    let mut pairs: Vec<(usize, Solution, String)> = Vec::new();
    if group_first {
        for group in &skeleton.groups {
            for (index, solution) in &skeleton.solutions {
                pairs.push((*index, solution.clone(), group.name.clone()));
            }
        }
    } else {
        for (index, solution) in &skeleton.solutions {
            for group in &skeleton.groups {
                pairs.push((*index, solution.clone(), group.name.clone()));
            }
        }
    }

    for (solution_index, solution, group_name) in pairs {
        let digest = compiled_solutions
            .get(&solution.code.path)
            .ok_or_else(|| format!("Solution {} was not compiled", solution.code.path.display()))?
            .clone();
        let group = skeleton
            .groups
            .iter()
            .find(|group| group.name == group_name)
            .ok_or_else(|| format!("Unknown group {group_name}"))?
            .clone();
        let output_dir = runs_dir.join(solution_index.to_string()).join(&group_name);

        for (testcase_index, testcase) in group.testcases.iter().enumerate() {
            info!(
                "Running solution {} on test {group_name}/{testcase_index}...",
                solution.code.path.display()
            );
            let eval = run_solution_on_testcase(
                ctx,
                &solution,
                &digest,
                checker_digest.as_deref(),
                check,
                testcase,
                &output_dir,
                testcase_index,
                verification,
            )
            .await?;
            let item = EvaluationItem {
                solution_index,
                group_name: group_name.clone(),
                testcase_index,
                eval,
            };
            on_item(&item);
            items.push(item);
        }
    }

    Ok((skeleton, items))
}

///
/// Key the streamed items into the structured `solution → group → [evaluation]` view.
///
pub fn structure_evaluations(
    skeleton: &SolutionReportSkeleton,
    items: &[EvaluationItem],
) -> StructuredEvaluation {
    let mut structured = skeleton.empty_structured_evaluation();
    for item in items {
        let Some((_, solution)) = skeleton
            .solutions
            .iter()
            .find(|(index, _)| *index == item.solution_index)
        else {
            continue;
        };
        if let Some(groups) = structured.get_mut(&solution.code.path.display().to_string()) {
            if let Some(evals) = groups.get_mut(&item.group_name) {
                if item.testcase_index < evals.len() {
                    evals[item.testcase_index] = Some(item.eval.clone());
                }
            }
        }
    }
    structured
}

fn evals_time_in_ms(evals: &[&Evaluation]) -> u64 {
    evals
        .iter()
        .filter_map(|eval| eval.log.run.as_ref())
        .filter_map(|run| run.time)
        .map(|time| (time * 1000.0) as u64)
        .max()
        .unwrap_or(0)
}

fn evals_memory_in_mib(evals: &[&Evaluation]) -> u64 {
    evals
        .iter()
        .filter_map(|eval| eval.log.run.as_ref())
        .filter_map(|run| run.memory)
        .map(|memory| memory / (1024 * 1024))
        .max()
        .unwrap_or(0)
}

///
/// The aggregated verdict of one solution over its evaluations.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SolutionVerdict {
    pub ok: bool,
    pub unmatched_outcomes: BTreeSet<Outcome>,
    /// Set when the solution expects a TLE but still passed under the doubled limit.
    pub double_tl_warning: bool,
    pub max_time_ms: u64,
    pub max_memory_mib: u64,
}

///
/// Compute a solution's final verdict: every bad outcome must be matched by the expected
/// outcome, and a solution expected to fail must actually fail at least once.
///
pub fn solution_verdict(
    ctx: &Context,
    solution: &Solution,
    evals: &[&Evaluation],
    verification: VerificationLevel,
) -> SolutionVerdict {
    let mut bad_outcomes = BTreeSet::new();
    let mut no_tle_bad_outcomes = BTreeSet::new();
    for eval in evals {
        if eval.result.outcome != Outcome::Accepted {
            bad_outcomes.insert(eval.result.outcome);
        }
        if let Some(no_tle) = eval.result.no_tle_outcome {
            if no_tle != Outcome::Accepted {
                no_tle_bad_outcomes.insert(no_tle);
            }
        }
    }

    let unmatched: BTreeSet<Outcome> = bad_outcomes
        .iter()
        .copied()
        .filter(|outcome| !solution.outcome.matches(*outcome))
        .collect();
    let matched: BTreeSet<Outcome> = bad_outcomes
        .difference(&unmatched)
        .copied()
        .collect();
    let expected_outcome_is_bad = !solution.outcome.matches(Outcome::Accepted);
    let ok = unmatched.is_empty() && !(expected_outcome_is_bad && matched.is_empty());

    let max_time_ms = evals_time_in_ms(evals);
    let mut non_tle = bad_outcomes.clone();
    non_tle.extend(no_tle_bad_outcomes.iter().copied());
    non_tle.remove(&Outcome::TimeLimitExceeded);
    let double_tl_warning = verification >= VerificationLevel::Full
        && solution.outcome.matches(Outcome::TimeLimitExceeded)
        && !matched.is_empty()
        && non_tle.is_empty()
        && max_time_ms < ctx.pkg.time_limit * 2;

    SolutionVerdict {
        ok,
        unmatched_outcomes: unmatched,
        double_tl_warning,
        max_time_ms,
        max_memory_mib: evals_memory_in_mib(evals),
    }
}

fn testcase_marker(eval: &Evaluation) -> &'static str {
    match eval.result.outcome {
        Outcome::Accepted => "+",
        Outcome::TimeLimitExceeded => "T",
        Outcome::RuntimeError => "R",
        Outcome::WrongAnswer => "W",
        Outcome::MemoryLimitExceeded => "M",
        Outcome::OutputLimitExceeded => "O",
        _ => "!",
    }
}

///
/// Print the run report from the streamed items and compute the overall success flag:
/// true iff every selected solution matched its expected outcome.
///
pub fn print_run_report(
    ctx: &Context,
    skeleton: &SolutionReportSkeleton,
    items: &[EvaluationItem],
    verification: VerificationLevel,
    detailed: bool,
) -> bool {
    let structured = structure_evaluations(skeleton, items);

    let mut ok = true;
    for (solution_index, solution) in &skeleton.solutions {
        let path = solution.code.path.display().to_string();
        let solution_testdir = ctx.runs_dir().join(solution_index.to_string());
        println!("{path} ({})", solution_testdir.display());

        let Some(groups) = structured.get(&path) else {
            continue;
        };
        let mut all_evals: Vec<&Evaluation> = Vec::new();
        for group in &skeleton.groups {
            let Some(evals) = groups.get(&group.name) else {
                continue;
            };
            let present: Vec<&Evaluation> = evals.iter().flatten().collect();
            all_evals.extend(present.iter().copied());

            let mut line = format!("{} ({} ms)", group.name, evals_time_in_ms(&present));
            for (index, eval) in present.iter().enumerate() {
                line.push_str(&format!(" {index}/{}", testcase_marker(eval)));
            }
            println!("{line}");

            if detailed {
                for eval in &present {
                    let time_ms = eval
                        .log
                        .run
                        .as_ref()
                        .and_then(|run| run.time)
                        .map(|time| (time * 1000.0) as u64)
                        .unwrap_or(0);
                    println!(
                        "  {}: {} ({time_ms} ms){}",
                        eval.testcase.index,
                        eval.result.outcome,
                        eval.result
                            .no_tle_outcome
                            .map(|outcome| format!(" [no-TL verdict: {outcome}]"))
                            .unwrap_or_default(),
                    );
                }
            }
        }

        let verdict = solution_verdict(ctx, solution, &all_evals, verification);
        if verdict.ok {
            print!("OK Expected: {}", solution.outcome);
        } else {
            ok = false;
            print!("FAILED Expected: {}", solution.outcome);
            if verdict.unmatched_outcomes.is_empty() {
                print!(", got: {}", Outcome::Accepted.name());
            } else {
                let names: Vec<&str> = verdict
                    .unmatched_outcomes
                    .iter()
                    .map(Outcome::name)
                    .collect();
                print!(", got: {}", names.join(" "));
            }
        }
        println!();
        if verdict.double_tl_warning {
            println!("WARNING The solution still passed in double TL.");
        }
        println!("Time: {} ms", verdict.max_time_ms);
        println!("Memory: {} MiB", verdict.max_memory_mib);
        println!();
    }
    ok
}
