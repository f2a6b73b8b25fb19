// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::{Duration, Instant};

use grading::{DigestOrDest, DigestOrSource, Outcome};
use log::info;
use serde::Serialize;

use crate::checkers;
use crate::code::{compile_item, run_item};
use crate::generators::generate_standalone;
use crate::package::Context;
use crate::schema::{CodeItem, GeneratorCall, Stress};
use crate::solutions::compile_solutions;
use crate::stressing::finder::{
    self, evaluate, CheckingMode, FinderCall, FinderCallRunner, FinderResult,
    FinderSolutionResult, FinderTree,
};
use crate::validators;

#[derive(Clone, Debug, Serialize)]
pub struct StressFinding {
    pub generator: GeneratorCall,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct StressReport {
    pub findings: Vec<StressFinding>,
    pub executed: usize,
}

///
/// Per-input memoization of solution and checker runs: each unique `(solution, checker)`
/// pair runs at most once per generated input.
///
struct MemoizedRunner {
    solution_indices: HashMap<String, usize>,
    solutions_digest: HashMap<String, String>,
    finders_digest: HashMap<String, String>,
    solution_items: HashMap<String, CodeItem>,
    input_path: PathBuf,
    /// Stands in for the reference output when none is generated (two-way checking).
    empty_path: PathBuf,
    expected_output_path: PathBuf,
    solution_memo: HashMap<String, FinderSolutionResult>,
    call_memo: HashMap<FinderCall, FinderResult>,
}

impl MemoizedRunner {
    fn reset_for_input(&mut self) {
        self.solution_memo.clear();
        self.call_memo.clear();
    }

    fn run_solution<'a>(
        &'a mut self,
        ctx: &'a mut Context,
        solution: String,
    ) -> Pin<Box<dyn Future<Output = Result<FinderSolutionResult, String>> + 'a>> {
        Box::pin(async move {
            if let Some(result) = self.solution_memo.get(&solution) {
                return Ok(result.clone());
            }
            let index = *self
                .solution_indices
                .get(&solution)
                .ok_or_else(|| format!("Unknown solution {solution}"))?;
            let code = self
                .solution_items
                .get(&solution)
                .ok_or_else(|| format!("Unknown solution {solution}"))?
                .clone();
            let digest = self
                .solutions_digest
                .get(&solution)
                .ok_or_else(|| format!("Solution {solution} was not compiled"))?
                .clone();

            let output_path = self
                .input_path
                .with_file_name(format!("{index}.out"));
            let stderr_path = output_path.with_extension("err");

            let run_log = run_item(
                ctx,
                &code,
                DigestOrSource::from_digest_value(&digest),
                Some(DigestOrSource::from_path(&self.input_path)),
                Some(DigestOrDest::from_path(&output_path)),
                Some(DigestOrDest::from_path(&stderr_path)),
                vec![],
                vec![],
                None,
                None,
            )
            .await?;

            let result = FinderSolutionResult {
                output_path,
                stderr_path: Some(stderr_path),
                run_log,
            };
            self.solution_memo.insert(solution, result.clone());
            Ok(result)
        })
    }
}

impl FinderCallRunner for MemoizedRunner {
    fn run<'a>(
        &'a mut self,
        ctx: &'a mut Context,
        call: FinderCall,
    ) -> Pin<Box<dyn Future<Output = Result<FinderResult, String>> + 'a>> {
        Box::pin(async move {
            if let Some(result) = self.call_memo.get(&call) {
                return Ok(result.clone());
            }

            let solution_result = self.run_solution(ctx, call.solution.clone()).await?;

            let checker_result = match &call.checker {
                None => {
                    checkers::check_with_no_output(ctx, solution_result.run_log.as_ref())
                }
                Some(checker) => {
                    let digest = self
                        .finders_digest
                        .get(&checker.path)
                        .ok_or_else(|| format!("Checker {} was not compiled", checker.path))?
                        .clone();
                    let expected_path = match checker.mode {
                        CheckingMode::ThreeWay => self.expected_output_path.clone(),
                        CheckingMode::TwoWay => self.empty_path.clone(),
                    };
                    let testcase = crate::schema::Testcase {
                        input_path: self.input_path.clone(),
                        output_path: Some(expected_path),
                    };
                    checkers::check(
                        ctx,
                        Some(&digest),
                        solution_result.run_log.as_ref(),
                        &testcase,
                        &solution_result.output_path,
                        false,
                    )
                    .await?
                }
            };

            let result = FinderResult {
                solution: call.solution.clone(),
                outcome: checker_result.outcome,
                checker: call.checker.clone(),
                solution_result: Some(solution_result),
                checker_result: Some(checker_result),
            };
            self.call_memo.insert(call, result.clone());
            Ok(result)
        })
    }
}

///
/// Stress-test: repeatedly generate a random input and evaluate the finder expression
/// over it, collecting inputs whose evaluation is true, until the findings limit or the
/// time budget is reached.
///
pub async fn run_stress(
    ctx: &mut Context,
    name: &str,
    generator_args: Option<&str>,
    finder_expression: Option<&str>,
    timeout: Duration,
    findings_limit: usize,
) -> Result<StressReport, String> {
    let stress = match finder_expression {
        Some(finder) => Stress {
            name: name.to_owned(),
            generator: GeneratorCall {
                name: name.to_owned(),
                args: generator_args.map(str::to_owned),
            },
            finder: finder.to_owned(),
        },
        None => ctx.pkg.get_stress(name)?.clone(),
    };

    let generator = ctx.pkg.get_generator(&stress.generator.name)?.clone();
    let generator_digest = compile_item(ctx, &generator.code)
        .await
        .map_err(|e| format!("Failed compiling generator {}: {e}", generator.name))?;

    let tree: FinderTree = finder::parse(&stress.finder)?;
    tree.validate(ctx)?;

    let solutions = tree.all_solutions(ctx)?;
    let checker_paths = tree.all_checkers(ctx)?;
    let needs_expected_output = tree.needs_expected_output(ctx)?;

    let solution_indices: HashMap<String, usize> = solutions
        .iter()
        .enumerate()
        .map(|(index, path)| (path.clone(), index))
        .collect();
    let solution_items: HashMap<String, CodeItem> = solutions
        .iter()
        .map(|path| {
            let item = ctx
                .pkg
                .get_solution(path)
                .map(|solution| solution.code.clone())
                .unwrap_or_else(|| CodeItem::from_path(path));
            (path.clone(), item)
        })
        .collect();

    let tracked: std::collections::HashSet<String> = solutions.iter().cloned().collect();
    let mut solutions_digest: HashMap<String, String> = HashMap::new();
    for (path, digest) in compile_solutions(ctx, Some(&tracked)).await? {
        solutions_digest.insert(path.display().to_string(), digest);
    }
    // Solutions referenced by the expression but absent from the package.
    for path in &solutions {
        if !solutions_digest.contains_key(path) {
            let item = solution_items.get(path).cloned().unwrap_or_else(|| CodeItem::from_path(path));
            let digest = compile_item(ctx, &item).await?;
            solutions_digest.insert(path.clone(), digest);
        }
    }

    info!("Compiling finders...");
    let mut finders_digest = HashMap::new();
    for path in checker_paths {
        let item = ctx
            .pkg
            .checker
            .clone()
            .filter(|checker| checker.path.display().to_string() == path)
            .unwrap_or_else(|| CodeItem::from_path(&path));
        let digest = compile_item(ctx, &item)
            .await
            .map_err(|e| format!("Failed compiling checker {path}: {e}"))?;
        finders_digest.insert(path, digest);
    }

    let compiled_validator = validators::compile_main_validator(ctx).await?;

    // Start from a clean stress directory.
    let stress_dir = ctx.runs_dir().join(".stress");
    let _ = std::fs::remove_dir_all(&stress_dir);
    std::fs::create_dir_all(&stress_dir).map_err(|e| e.to_string())?;
    let empty_path = stress_dir.join(".empty");
    std::fs::write(&empty_path, "").map_err(|e| e.to_string())?;
    let input_path = stress_dir.join("input");

    let mut runner = MemoizedRunner {
        solution_indices,
        solutions_digest,
        finders_digest,
        solution_items,
        input_path: input_path.clone(),
        empty_path: empty_path.clone(),
        expected_output_path: empty_path.clone(),
        solution_memo: HashMap::new(),
        call_memo: HashMap::new(),
    };

    let start_time = Instant::now();
    let mut report = StressReport::default();

    while report.findings.len() < findings_limit {
        if start_time.elapsed() > timeout {
            break;
        }

        let expanded_call = generate_standalone(
            ctx,
            &stress.generator,
            &input_path,
            true,
            Some(&generator_digest),
            compiled_validator.as_ref().map(|(_, digest)| digest.as_str()),
        )
        .await?;

        runner.reset_for_input();
        runner.expected_output_path = empty_path.clone();

        if needs_expected_output {
            let main_solution = solutions
                .first()
                .ok_or_else(|| "No solutions to stress".to_owned())?
                .clone();
            let main_result = runner.run_solution(ctx, main_solution).await?;
            let main_check = checkers::check_with_no_output(ctx, main_result.run_log.as_ref());
            if main_check.outcome != Outcome::Accepted {
                return Err(format!(
                    "Error while generating main solution output.\nInput written at {}.\nOutput written at {}.\nIf you don't want reference outputs to be generated, use the two-way modifier (`2:`) in your finder expression.",
                    input_path.display(),
                    main_result.output_path.display(),
                ));
            }
            runner.expected_output_path = main_result.output_path.clone();
        }

        let finder_outcome = evaluate(&tree.expr, ctx, &mut runner).await?;

        let internal_errors: Vec<_> = finder_outcome
            .results
            .iter()
            .filter(|result| result.outcome == Outcome::InternalError)
            .collect();
        if !internal_errors.is_empty() {
            let mut message = format!(
                "Checkers failed during stress test {name} with args {} {}",
                expanded_call.name,
                expanded_call.args.as_deref().unwrap_or(""),
            );
            for result in internal_errors {
                if let (Some(checker), Some(checker_result)) =
                    (&result.checker, &result.checker_result)
                {
                    message = format!(
                        "{message}\nChecker {} failed with message: {}",
                        checker.path, checker_result.message
                    );
                }
            }
            return Err(message);
        }

        report.executed += 1;

        if !finder_outcome.truth_value {
            // Be cooperative with the rest of the runtime between iterations.
            tokio::time::sleep(Duration::from_millis(1)).await;
            continue;
        }

        let findings_dir = stress_dir.join("findings");
        std::fs::create_dir_all(&findings_dir).map_err(|e| e.to_string())?;
        let finding_path = findings_dir.join(format!("{}.in", report.findings.len()));
        std::fs::copy(&input_path, &finding_path).map_err(|e| e.to_string())?;

        info!(
            "FINDING Generator args are \"{} {}\"",
            expanded_call.name,
            expanded_call.args.as_deref().unwrap_or("")
        );

        report.findings.push(StressFinding {
            generator: expanded_call,
        });

        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    Ok(report)
}

///
/// Render the stress findings, with the generator calls that reproduce them.
///
pub fn print_stress_report(ctx: &Context, report: &StressReport) {
    println!("Executed {} tests.", report.executed);
    if report.findings.is_empty() {
        println!("No stress test findings.");
        return;
    }
    println!("Found {} testcases.", report.findings.len());
    let findings_dir = ctx.runs_dir().join(".stress").join("findings");
    println!("Findings: {}", findings_dir.display());
    println!();
    for (index, finding) in report.findings.iter().enumerate() {
        println!("Finding {}", index + 1);
        println!(
            "Generator: {} {}",
            finding.generator.name,
            finding.generator.args.as_deref().unwrap_or("")
        );
        println!();
    }
}
