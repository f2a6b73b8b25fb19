// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use grading::{Outcome, RunLog};
use sandbox::ExitStatus;
use tempfile::TempDir;

use casebox::builder;
use casebox::checkers;
use casebox::environment::{default_environment, VerificationLevel};
use casebox::package::{load_package, Context};
use casebox::schema::Testcase;
use casebox::solutions::{run_solutions, solution_verdict, EvaluationItem};
use casebox::stresses::run_stress;

struct PackageBuilder {
    dir: TempDir,
    files: Vec<(PathBuf, String)>,
    manifest: String,
}

impl PackageBuilder {
    fn new(manifest: &str) -> PackageBuilder {
        PackageBuilder {
            dir: TempDir::new().unwrap(),
            files: vec![],
            manifest: manifest.to_owned(),
        }
    }

    fn file(mut self, path: &str, content: &str) -> PackageBuilder {
        self.files.push((PathBuf::from(path), content.to_owned()));
        self
    }

    fn write(self) -> TempDir {
        let root = self.dir.path();
        std::fs::write(root.join("problem.yml"), &self.manifest).unwrap();
        for (path, content) in &self.files {
            let full = root.join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(full, content).unwrap();
        }
        self.dir
    }
}

async fn load_context(root: &Path) -> Context {
    let root = root.canonicalize().unwrap();
    let pkg = load_package(&root).unwrap();
    Context::new(root, pkg, default_environment())
        .await
        .unwrap()
}

fn read_test(ctx: &Context, group: &str, name: &str) -> String {
    std::fs::read_to_string(ctx.build_testgroup_path(group).join(name)).unwrap()
}

const GENERATION_MANIFEST: &str = r#"
name: determinism
timeLimit: 2000
memoryLimit: 256
generators:
  - name: g
    path: gen.sh
solutions:
  - path: sol0.sh
    outcome: accepted
testcases:
  - name: gen1
    testcases:
      - inputPath: manual/0.in
    subgroups:
      - name: gen
        generators:
          - name: g
            args: "123"
          - name: g
            args: "424242"
      - name: genScript
        generatorScript:
          path: script.txt
"#;

const ECHO_GENERATOR: &str = "echo \"$1\"\n";
const CAT_SOLUTION: &str = "cat\n";

fn generation_package() -> TempDir {
    PackageBuilder::new(GENERATION_MANIFEST)
        .file("gen.sh", ECHO_GENERATOR)
        .file("sol0.sh", CAT_SOLUTION)
        .file("manual/0.in", "777\n")
        .file("script.txt", "g 25\n")
        .write()
}

#[tokio::test]
async fn generation_is_deterministic() {
    let dir = generation_package();
    let mut ctx = load_context(dir.path()).await;

    builder::build(&mut ctx, VerificationLevel::None, None)
        .await
        .unwrap();

    assert_eq!(read_test(&ctx, "gen1", "0-main-000.in"), "777\n");
    assert_eq!(read_test(&ctx, "gen1", "1-gen-000.in"), "123\n");
    assert_eq!(read_test(&ctx, "gen1", "1-gen-001.in"), "424242\n");
    assert_eq!(read_test(&ctx, "gen1", "2-genScript-000.in"), "25\n");

    // Reference outputs come from the main solution (cat): identical to the inputs.
    assert_eq!(read_test(&ctx, "gen1", "0-main-000.out"), "777\n");
    assert_eq!(read_test(&ctx, "gen1", "1-gen-000.out"), "123\n");
    assert_eq!(read_test(&ctx, "gen1", "2-genScript-000.out"), "25\n");

    ctx.shutdown().await;
}

#[tokio::test]
async fn rebuild_after_generator_change_regenerates_only_affected_content() {
    let dir = generation_package();

    {
        let mut ctx = load_context(dir.path()).await;
        builder::build(&mut ctx, VerificationLevel::None, None)
            .await
            .unwrap();
        assert_eq!(read_test(&ctx, "gen1", "1-gen-000.in"), "123\n");
        ctx.shutdown().await;
    }

    // The generator changes behavior for the first call only.
    std::fs::write(
        dir.path().join("gen.sh"),
        "if [ \"$1\" = \"123\" ]; then echo 4567; else echo \"$1\"; fi\n",
    )
    .unwrap();

    let mut ctx = load_context(dir.path()).await;
    builder::build(&mut ctx, VerificationLevel::None, None)
        .await
        .unwrap();
    assert_eq!(read_test(&ctx, "gen1", "1-gen-000.in"), "4567\n");
    assert_eq!(read_test(&ctx, "gen1", "1-gen-001.in"), "424242\n");
    ctx.shutdown().await;
}

#[tokio::test]
async fn rebuild_without_changes_is_stable() {
    let dir = generation_package();

    let first = {
        let mut ctx = load_context(dir.path()).await;
        builder::build(&mut ctx, VerificationLevel::None, None)
            .await
            .unwrap();
        let res = read_test(&ctx, "gen1", "1-gen-000.in");
        ctx.shutdown().await;
        res
    };

    let mut ctx = load_context(dir.path()).await;
    builder::build(&mut ctx, VerificationLevel::None, None)
        .await
        .unwrap();
    assert_eq!(read_test(&ctx, "gen1", "1-gen-000.in"), first);
    ctx.shutdown().await;
}

const VERDICT_MANIFEST: &str = r#"
name: verdicts
timeLimit: 2000
memoryLimit: 256
outputLimit: 64
checker:
  path: chk.sh
generators:
  - name: g
    path: gen.sh
solutions:
  - path: sol0.sh
    outcome: accepted
  - path: sol1.sh
    outcome: wa
  - path: sol2.sh
    outcome: rte
  - path: sol6.sh
    outcome: ole
  - path: solbad.sh
    outcome: wa
testcases:
  - name: gen1
    generators:
      - name: g
        args: "1"
      - name: g
        args: "7"
      - name: g
        args: "25"
"#;

const TOKEN_CHECKER: &str = r#"
expected=$(cat "$3")
actual=$(cat "$2")
if [ "$expected" = "$actual" ]; then
  exit 0
else
  echo "outputs differ" >&2
  exit 1
fi
"#;

fn verdict_package() -> TempDir {
    PackageBuilder::new(VERDICT_MANIFEST)
        .file("gen.sh", ECHO_GENERATOR)
        .file("chk.sh", TOKEN_CHECKER)
        .file("sol0.sh", CAT_SOLUTION)
        .file(
            "sol1.sh",
            "read x; if [ \"$x\" = \"25\" ]; then echo 26; else echo \"$x\"; fi\n",
        )
        .file("sol2.sh", "exit 1\n")
        .file("sol6.sh", "head -c 300000 /dev/zero\n")
        .file("solbad.sh", CAT_SOLUTION)
        .write()
}

fn evals_for<'a>(
    items: &'a [EvaluationItem],
    solution_index: usize,
) -> Vec<&'a grading::Evaluation> {
    items
        .iter()
        .filter(|item| item.solution_index == solution_index)
        .map(|item| &item.eval)
        .collect()
}

#[tokio::test]
async fn solution_verdict_table() {
    let dir = verdict_package();
    let mut ctx = load_context(dir.path()).await;

    builder::build(&mut ctx, VerificationLevel::None, None)
        .await
        .unwrap();

    let mut streamed = Vec::new();
    let (skeleton, items) = run_solutions(
        &mut ctx,
        None,
        VerificationLevel::AllSolutions,
        true,
        false,
        &mut |item| streamed.push((item.solution_index, item.testcase_index)),
    )
    .await
    .unwrap();

    // The stream respects solution-first order.
    assert_eq!(
        streamed,
        vec![
            (0, 0),
            (0, 1),
            (0, 2),
            (1, 0),
            (1, 1),
            (1, 2),
            (2, 0),
            (2, 1),
            (2, 2),
            (3, 0),
            (3, 1),
            (3, 2),
            (4, 0),
            (4, 1),
            (4, 2)
        ]
    );

    // sol0 (correct): all accepted.
    let evals = evals_for(&items, 0);
    assert!(evals
        .iter()
        .all(|eval| eval.result.outcome == Outcome::Accepted));

    // sol1 (wrong at 25): the third testcase is a wrong answer with the checker message.
    let evals = evals_for(&items, 1);
    assert_eq!(evals[0].result.outcome, Outcome::Accepted);
    assert_eq!(evals[1].result.outcome, Outcome::Accepted);
    assert_eq!(evals[2].result.outcome, Outcome::WrongAnswer);
    assert!(evals[2].result.message.contains("outputs differ"));

    // sol2 (exits nonzero): runtime error everywhere.
    let evals = evals_for(&items, 2);
    assert!(evals
        .iter()
        .all(|eval| eval.result.outcome == Outcome::RuntimeError));

    // sol6 (gigantic output): output limit exceeded.
    let evals = evals_for(&items, 3);
    assert!(evals
        .iter()
        .all(|eval| eval.result.outcome == Outcome::OutputLimitExceeded));

    // Final verdicts: expected outcomes matched for the declared solutions, and the
    // solution that promised WA but got all-accepted fails.
    let verdicts: HashMap<usize, bool> = skeleton
        .solutions
        .iter()
        .map(|(index, solution)| {
            let verdict = solution_verdict(
                &ctx,
                solution,
                &evals_for(&items, *index),
                VerificationLevel::AllSolutions,
            );
            (*index, verdict.ok)
        })
        .collect();
    assert!(verdicts[&0]);
    assert!(verdicts[&1]);
    assert!(verdicts[&2]);
    assert!(verdicts[&3]);
    assert!(!verdicts[&4]);

    // Per-run outputs land under the runs directory.
    assert!(ctx
        .runs_dir()
        .join("0")
        .join("gen1")
        .join("000.out")
        .is_file());

    ctx.shutdown().await;
}

#[tokio::test]
async fn checker_exit_codes_map_to_verdicts() {
    let manifest = r#"
name: checkermap
timeLimit: 2000
memoryLimit: 256
checker:
  path: chk42.sh
generators:
  - name: g
    path: gen.sh
solutions:
  - path: sol0.sh
    outcome: accepted
testcases:
  - name: main
    generators:
      - name: g
        args: "5"
"#;
    let dir = PackageBuilder::new(manifest)
        .file("gen.sh", ECHO_GENERATOR)
        .file("chk42.sh", "exit 42\n")
        .file("sol0.sh", CAT_SOLUTION)
        .write();
    let mut ctx = load_context(dir.path()).await;

    builder::build(&mut ctx, VerificationLevel::None, None)
        .await
        .unwrap();
    let (_, items) = run_solutions(
        &mut ctx,
        None,
        VerificationLevel::AllSolutions,
        true,
        false,
        &mut |_| {},
    )
    .await
    .unwrap();

    // A checker exit code outside {0, 1, 2, 3} is an internal error.
    assert_eq!(items[0].eval.result.outcome, Outcome::InternalError);
    ctx.shutdown().await;
}

fn run_log(exitstatus: ExitStatus, time: f64) -> RunLog {
    RunLog {
        exitcode: 0,
        exitstatus,
        time: Some(time),
        memory: Some(1024),
        wall_time: Some(time),
    }
}

#[tokio::test]
async fn soft_tle_rewrite_records_pre_verdict() {
    let dir = generation_package();
    let mut ctx = load_context(dir.path()).await;
    // timeLimit for this test's purposes: 2000ms, double limit 4000ms.

    let input = dir.path().join("tc.in");
    let expected = dir.path().join("tc.out");
    let output = dir.path().join("got.out");
    std::fs::write(&input, "1\n").unwrap();
    std::fs::write(&expected, "1\n").unwrap();
    std::fs::write(&output, "1\n").unwrap();
    let testcase = Testcase {
        input_path: input.clone(),
        output_path: Some(expected.clone()),
    };

    // Within the limit: plain accepted.
    let result = checkers::check(
        &mut ctx,
        None,
        Some(&run_log(ExitStatus::Ok, 1.0)),
        &testcase,
        &output,
        false,
    )
    .await
    .unwrap();
    assert_eq!(result.outcome, Outcome::Accepted);
    assert_eq!(result.no_tle_outcome, None);

    // Soft TLE: beat the doubled limit but exceeded the declared one; the checker's
    // verdict is preserved in no_tle_outcome.
    let result = checkers::check(
        &mut ctx,
        None,
        Some(&run_log(ExitStatus::Ok, 2.5)),
        &testcase,
        &output,
        false,
    )
    .await
    .unwrap();
    assert_eq!(result.outcome, Outcome::TimeLimitExceeded);
    assert_eq!(result.no_tle_outcome, Some(Outcome::Accepted));

    // Soft TLE over a wrong answer.
    std::fs::write(&output, "2\n").unwrap();
    let result = checkers::check(
        &mut ctx,
        None,
        Some(&run_log(ExitStatus::Ok, 2.5)),
        &testcase,
        &output,
        false,
    )
    .await
    .unwrap();
    assert_eq!(result.outcome, Outcome::TimeLimitExceeded);
    assert_eq!(result.no_tle_outcome, Some(Outcome::WrongAnswer));

    // Hard TLE: over the doubled limit; no pre-rewrite verdict is recorded.
    let result = checkers::check(
        &mut ctx,
        None,
        Some(&run_log(ExitStatus::Ok, 4.5)),
        &testcase,
        &output,
        false,
    )
    .await
    .unwrap();
    assert_eq!(result.outcome, Outcome::TimeLimitExceeded);
    assert_eq!(result.no_tle_outcome, None);

    // A sandbox-reported timeout is a TLE regardless of measured time.
    let result = checkers::check(
        &mut ctx,
        None,
        Some(&run_log(ExitStatus::Timeout, 2.1)),
        &testcase,
        &output,
        false,
    )
    .await
    .unwrap();
    assert_eq!(result.outcome, Outcome::TimeLimitExceeded);

    ctx.shutdown().await;
}

#[tokio::test]
async fn nocheck_classifies_without_output_comparison() {
    let dir = generation_package();
    let ctx = load_context(dir.path()).await;

    let result = checkers::check_with_no_output(&ctx, Some(&run_log(ExitStatus::Signal, 0.1)));
    assert_eq!(result.outcome, Outcome::RuntimeError);

    let result =
        checkers::check_with_no_output(&ctx, Some(&run_log(ExitStatus::MemoryLimitExceeded, 0.1)));
    assert_eq!(result.outcome, Outcome::MemoryLimitExceeded);

    let result = checkers::check_with_no_output(&ctx, None);
    assert_eq!(result.outcome, Outcome::InternalError);

    ctx.shutdown().await;
}

const STRESS_MANIFEST: &str = r#"
name: stressable
timeLimit: 2000
memoryLimit: 256
checker:
  path: chk.sh
generators:
  - name: rnd
    path: gen.sh
solutions:
  - path: sol0.sh
    outcome: accepted
  - path: sol1.sh
    outcome: wa
stresses:
  - name: break-sol1
    generator:
      name: rnd
      args: "[1..3]"
    finder: "[sol1.sh] ~ wrong-answer"
"#;

#[tokio::test]
async fn stress_finds_counterexample() {
    let dir = PackageBuilder::new(STRESS_MANIFEST)
        .file("gen.sh", ECHO_GENERATOR)
        .file("chk.sh", TOKEN_CHECKER)
        .file("sol0.sh", CAT_SOLUTION)
        .file(
            "sol1.sh",
            "read x; if [ \"$x\" = \"2\" ]; then echo 99; else echo \"$x\"; fi\n",
        )
        .write();
    let mut ctx = load_context(dir.path()).await;

    let report = run_stress(
        &mut ctx,
        "break-sol1",
        None,
        None,
        Duration::from_secs(60),
        1,
    )
    .await
    .unwrap();

    assert_eq!(report.findings.len(), 1);
    // The bug triggers exactly on input 2; the expanded generator call reproduces it.
    assert_eq!(
        report.findings[0].generator.args.as_deref(),
        Some("2")
    );
    let finding = ctx.runs_dir().join(".stress/findings/0.in");
    assert_eq!(std::fs::read_to_string(finding).unwrap(), "2\n");

    ctx.shutdown().await;
}

#[tokio::test]
async fn stress_with_ad_hoc_finder() {
    let dir = PackageBuilder::new(STRESS_MANIFEST)
        .file("gen.sh", ECHO_GENERATOR)
        .file("chk.sh", TOKEN_CHECKER)
        .file("sol0.sh", CAT_SOLUTION)
        .file(
            "sol1.sh",
            "read x; if [ \"$x\" = \"2\" ]; then echo 99; else echo \"$x\"; fi\n",
        )
        .write();
    let mut ctx = load_context(dir.path()).await;

    // `[sol1.sh] != [$]`: find an input where sol1 disagrees with the main solution.
    let report = run_stress(
        &mut ctx,
        "rnd",
        Some("[1..3]"),
        Some("[sol1.sh] != [$]"),
        Duration::from_secs(60),
        1,
    )
    .await
    .unwrap();

    assert_eq!(report.findings.len(), 1);
    ctx.shutdown().await;
}

#[tokio::test]
async fn validator_rejects_bad_testcase() {
    let manifest = r#"
name: validated
timeLimit: 2000
memoryLimit: 256
validator:
  path: val.sh
generators:
  - name: g
    path: gen.sh
solutions:
  - path: sol0.sh
    outcome: accepted
testcases:
  - name: main
    generators:
      - name: g
        args: "1000000000"
"#;
    // The validator rejects inputs above 100.
    let validator = r#"
read x
if [ "$x" -gt 100 ]; then
  echo "value too large: $x" >&2
  exit 1
fi
exit 0
"#;
    let dir = PackageBuilder::new(manifest)
        .file("gen.sh", ECHO_GENERATOR)
        .file("val.sh", validator)
        .file("sol0.sh", CAT_SOLUTION)
        .write();
    let mut ctx = load_context(dir.path()).await;

    let err = builder::build(&mut ctx, VerificationLevel::Validate, None)
        .await
        .unwrap_err();
    assert!(err.contains("validation failed"), "{err}");
    ctx.shutdown().await;
}

#[tokio::test]
async fn validator_hit_bounds_are_collected() {
    let manifest = r#"
name: bounded
timeLimit: 2000
memoryLimit: 256
validator:
  path: val.sh
generators:
  - name: g
    path: gen.sh
solutions:
  - path: sol0.sh
    outcome: accepted
testcases:
  - name: main
    generators:
      - name: g
        args: "1"
vars:
  MAX_N: 100
"#;
    // A validator that writes a testOverview log marking only the min bound as hit. It
    // receives vars as --MAX_N=100 and the log file name after --testOverviewLogFileName.
    let validator = r#"
logfile=""
grab=0
for arg in "$@"; do
  if [ "$grab" = "1" ]; then logfile="$arg"; grab=0; continue; fi
  if [ "$arg" = "--testOverviewLogFileName" ]; then grab=1; fi
done
read x
if [ -n "$logfile" ]; then
  echo "\"n\": min-value-hit" > "$logfile"
fi
exit 0
"#;
    let dir = PackageBuilder::new(manifest)
        .file("gen.sh", ECHO_GENERATOR)
        .file("val.sh", validator)
        .file("sol0.sh", CAT_SOLUTION)
        .write();
    let mut ctx = load_context(dir.path()).await;

    casebox::generators::generate_testcases(&mut ctx, None)
        .await
        .unwrap();
    let infos = casebox::validators::validate_testcases(&mut ctx, None)
        .await
        .unwrap();
    assert_eq!(infos.len(), 1);
    assert!(infos[0].ok);
    assert_eq!(infos[0].hit_bounds.get("n"), Some(&(true, false)));

    ctx.shutdown().await;
}

#[tokio::test]
async fn group_first_ordering() {
    let dir = verdict_package();
    let mut ctx = load_context(dir.path()).await;

    builder::build(&mut ctx, VerificationLevel::None, None)
        .await
        .unwrap();

    let mut streamed = Vec::new();
    run_solutions(
        &mut ctx,
        None,
        VerificationLevel::AllSolutions,
        false,
        true,
        &mut |item| streamed.push((item.solution_index, item.testcase_index)),
    )
    .await
    .unwrap();

    // All solutions per group: solution index varies before testcase order restarts.
    let first_block: Vec<_> = streamed.iter().take(3).map(|(s, _)| *s).collect();
    assert_eq!(first_block, vec![0, 0, 0]);
    assert_eq!(streamed.len(), 15);
    assert_eq!(streamed[3].0, 1);

    ctx.shutdown().await;
}
