// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use grading::{DigestOrDest, DigestOrSource};
use tokio::io::AsyncReadExt;

use casebox::builder;
use casebox::code::{compile_item, run_item};
use casebox::environment::VerificationLevel;
use casebox::generators::generate_standalone;
use casebox::package::{clear_package, Context};
use casebox::schema::{CodeItem, ExpectedOutcome, GeneratorCall};
use casebox::solutions::{print_run_report, run_solutions};
use casebox::stresses::{print_stress_report, run_stress};

///
/// casebox: build testcases, judge solutions and stress-test for counterexamples, from
/// a declarative problem package.
///
#[derive(Parser)]
#[command(name = "casebox", version, about)]
struct Cli {
    /// Path to the problem package directory.
    #[arg(long, default_value = ".")]
    path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Regenerate testcases and reference outputs.
    Build {
        /// Verification level (0-5).
        #[arg(short = 'v', long = "verification", default_value_t = 4)]
        verification: u8,
    },
    /// Evaluate solutions; exits 0 iff every selected solution matched its expected
    /// outcome.
    Run {
        /// Only run the given solutions (by path).
        solutions: Vec<String>,
        /// Only run solutions whose expected outcome intersects this one.
        #[arg(long)]
        outcome: Option<String>,
        /// Classify runs without checking outputs.
        #[arg(long)]
        nocheck: bool,
        /// Print a per-testcase report.
        #[arg(long)]
        detailed: bool,
        /// Evaluate all solutions per group instead of all groups per solution.
        #[arg(long)]
        group_first: bool,
        /// Verification level (0-5).
        #[arg(short = 'v', long = "verification", default_value_t = 4)]
        verification: u8,
    },
    /// Run one solution over a single testcase read from stdin or produced by a one-off
    /// generator call.
    Irun {
        /// Solution to run; defaults to the main solution.
        solution: Option<String>,
        /// Generator call producing the input, e.g. "gen 10 20".
        #[arg(short = 'g', long = "generator")]
        generator: Option<String>,
    },
    /// Search randomized inputs for one satisfying the stress's finder expression.
    Stress {
        /// Name of a declared stress test, or of a generator when -f is given.
        name: String,
        /// Generator argument template to use with -f.
        #[arg(short = 'g', long = "generator-args")]
        generator_args: Option<String>,
        /// Ad-hoc finder expression over solution outcomes.
        #[arg(short = 'f', long = "finder")]
        finder: Option<String>,
        /// Time budget in seconds.
        #[arg(long, default_value_t = 10)]
        timeout: u64,
        /// Stop after this many findings.
        #[arg(long, default_value_t = 1)]
        findings: usize,
    },
    /// Drop the `.box` cache and the `build` directory.
    Clear,
    /// Produce a standalone executable for a code item next to the package.
    Compile {
        /// What to compile: solution, generator, checker or validator.
        kind: String,
        /// Path of the code item, or name of the generator.
        item: String,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    let code = match runtime.block_on(execute(cli)) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err}");
            1
        }
    };
    std::process::exit(code);
}

async fn execute(cli: Cli) -> Result<i32, String> {
    match cli.command {
        Command::Clear => {
            clear_package(&cli.path)?;
            println!("Cleared cache and build directories.");
            Ok(0)
        }
        Command::Build { verification } => {
            let mut ctx = Context::load(&cli.path).await?;
            let result = builder::build(
                &mut ctx,
                VerificationLevel::from_value(verification),
                None,
            )
            .await;
            ctx.shutdown().await;
            result.map(|()| 0)
        }
        Command::Run {
            solutions,
            outcome,
            nocheck,
            detailed,
            group_first,
            verification,
        } => {
            let mut ctx = Context::load(&cli.path).await?;
            let verification = VerificationLevel::from_value(verification);

            let mut tracked: Option<HashSet<String>> = if solutions.is_empty() {
                None
            } else {
                Some(solutions.into_iter().collect())
            };
            if let Some(outcome) = outcome {
                let expected: ExpectedOutcome = outcome.parse()?;
                let matching: HashSet<String> = ctx
                    .pkg
                    .solutions
                    .iter()
                    .filter(|solution| solution.outcome.intersects(expected))
                    .map(|solution| solution.code.path.display().to_string())
                    .collect();
                tracked = Some(match tracked {
                    Some(tracked) => tracked.intersection(&matching).cloned().collect(),
                    None => matching,
                });
            }

            let result = run_solutions(
                &mut ctx,
                tracked.as_ref(),
                verification,
                !nocheck,
                group_first,
                &mut |item| {
                    println!(
                        "[{}] {}/{}: {}",
                        item.solution_index,
                        item.group_name,
                        item.testcase_index,
                        item.eval.result.outcome,
                    );
                },
            )
            .await;

            let code = match &result {
                Ok((skeleton, items)) => {
                    let ok = print_run_report(&ctx, skeleton, items, verification, detailed);
                    i32::from(!ok)
                }
                Err(_) => 1,
            };
            ctx.shutdown().await;
            result.map(|_| code)
        }
        Command::Irun {
            solution,
            generator,
        } => {
            let mut ctx = Context::load(&cli.path).await?;
            let result = irun(&mut ctx, solution, generator).await;
            ctx.shutdown().await;
            result.map(|()| 0)
        }
        Command::Stress {
            name,
            generator_args,
            finder,
            timeout,
            findings,
        } => {
            let mut ctx = Context::load(&cli.path).await?;
            let result = run_stress(
                &mut ctx,
                &name,
                generator_args.as_deref(),
                finder.as_deref(),
                Duration::from_secs(timeout),
                findings,
            )
            .await;
            let code = match &result {
                Ok(report) => {
                    print_stress_report(&ctx, report);
                    0
                }
                Err(_) => 1,
            };
            ctx.shutdown().await;
            result.map(|_| code)
        }
        Command::Compile { kind, item } => {
            let mut ctx = Context::load(&cli.path).await?;
            let result = compile_standalone(&mut ctx, &kind, &item).await;
            ctx.shutdown().await;
            result.map(|()| 0)
        }
    }
}

///
/// A single interactive run: input from a one-off generator call or from stdin, output
/// straight to the terminal.
///
async fn irun(
    ctx: &mut Context,
    solution: Option<String>,
    generator: Option<String>,
) -> Result<(), String> {
    let solution = match solution {
        Some(path) => ctx
            .pkg
            .get_solution(&path)
            .map(|solution| solution.code.clone())
            .unwrap_or_else(|| CodeItem::from_path(&path)),
        None => {
            ctx.pkg
                .main_solution()
                .ok_or_else(|| "Package has no main solution to run".to_owned())?
                .code
                .clone()
        }
    };

    let irun_dir = ctx.runs_dir().join(".irun");
    std::fs::create_dir_all(&irun_dir).map_err(|e| e.to_string())?;
    let input_path = irun_dir.join("input");

    match generator {
        Some(generator_call) => {
            let (name, args) = match generator_call.split_once(char::is_whitespace) {
                Some((name, args)) => (name.to_owned(), Some(args.to_owned())),
                None => (generator_call, None),
            };
            let call = GeneratorCall { name, args };
            generate_standalone(ctx, &call, &input_path, true, None, None).await?;
        }
        None => {
            println!("Reading testcase input from stdin (end with EOF):");
            let mut buffer = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut buffer)
                .await
                .map_err(|e| e.to_string())?;
            std::fs::write(&input_path, buffer).map_err(|e| e.to_string())?;
        }
    }

    let digest = compile_item(ctx, &solution).await?;
    let output_path = irun_dir.join("output");
    let error_path = irun_dir.join("stderr");
    let run_log = run_item(
        ctx,
        &solution,
        DigestOrSource::from_digest_value(&digest),
        Some(DigestOrSource::from_path(&input_path)),
        Some(DigestOrDest::from_path(&output_path)),
        Some(DigestOrDest::from_path(&error_path)),
        vec![],
        vec![],
        None,
        None,
    )
    .await?
    .ok_or_else(|| "Sandbox failed while running the solution".to_owned())?;

    println!(
        "Exit code: {} ({})",
        run_log.exitcode,
        serde_yaml::to_string(&run_log.exitstatus)
            .unwrap_or_default()
            .trim()
    );
    if let Some(time) = run_log.time {
        println!("Time: {} ms", (time * 1000.0) as u64);
    }
    println!("Output:");
    let output = std::fs::read_to_string(&output_path).unwrap_or_default();
    print!("{output}");
    Ok(())
}

///
/// Compile a code item and install the produced executable next to the package.
///
async fn compile_standalone(ctx: &mut Context, kind: &str, item: &str) -> Result<(), String> {
    let code = match kind {
        "generator" => ctx.pkg.get_generator(item)?.code.clone(),
        "checker" => ctx
            .pkg
            .checker
            .clone()
            .filter(|checker| checker.path.display().to_string() == item)
            .unwrap_or_else(|| CodeItem::from_path(item)),
        "validator" => ctx
            .pkg
            .validator
            .clone()
            .filter(|validator| validator.path.display().to_string() == item)
            .unwrap_or_else(|| CodeItem::from_path(item)),
        "solution" => ctx
            .pkg
            .get_solution(item)
            .map(|solution| solution.code.clone())
            .unwrap_or_else(|| CodeItem::from_path(item)),
        other => {
            return Err(format!(
                "Unknown compile kind {other}; expected solution, generator, checker or validator"
            ))
        }
    };

    let digest = compile_item(ctx, &code).await?;
    let stem = code
        .path
        .file_stem()
        .ok_or_else(|| format!("Invalid code path {}", code.path.display()))?;
    let dest = ctx.root.join(stem);
    ctx.cacher
        .get_file_to_path(&digest, &dest)
        .await
        .map_err(|e| e.to_string())?;

    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| e.to_string())?;
    println!("Executable written to {}", dest.display());
    Ok(())
}
