// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::future::Future;
use std::pin::Pin;

use grading::steps::CheckerResult;
use grading::{Outcome, RunLog};

use crate::package::Context;
use crate::schema::ExpectedOutcome;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CheckingMode {
    /// Checker sees input, actual output and the main solution's reference output.
    ThreeWay,
    /// No reference output is generated; the checker sees the actual output twice.
    TwoWay,
}

///
/// A checker reference inside a finder expression, after `$` resolution.
///
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FinderChecker {
    pub path: String,
    pub mode: CheckingMode,
}

///
/// How an eval clause asked to be checked: implicitly (package checker), explicitly by
/// name, or not at all (`ON :nil`).
///
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CheckerSpec {
    Default,
    Nil,
    Named { token: String, mode: CheckingMode },
}

///
/// One `[solution (ON checker)?]` clause.
///
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FinderEval {
    pub solution: String,
    pub checker: CheckerSpec,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FinderExpr {
    Or(Box<FinderExpr>, Box<FinderExpr>),
    And(Box<FinderExpr>, Box<FinderExpr>),
    Not(Box<FinderExpr>),
    /// `[sol] ~ expected` (or `!~`).
    Matching {
        eval: FinderEval,
        positive: bool,
        expected: ExpectedOutcome,
    },
    /// `[sol] == [other]` (or `!=`).
    EquatingEval {
        lhs: FinderEval,
        positive: bool,
        rhs: FinderEval,
    },
    /// `[sol] == outcome` (or `!=`).
    EquatingOutcome {
        lhs: FinderEval,
        positive: bool,
        outcome: Outcome,
    },
}

peg::parser! {
    grammar finder() for str {
        rule ws() = quiet!{[' ']*}

        pub rule start() -> FinderExpr = ws() e:disjunction() ws() { e }

        rule disjunction() -> FinderExpr
            = lhs:conjunction() rest:(ws() "||" ws() rhs:conjunction() { rhs })* {
                rest.into_iter().fold(lhs, |acc, rhs| {
                    FinderExpr::Or(Box::new(acc), Box::new(rhs))
                })
            }

        rule conjunction() -> FinderExpr
            = lhs:atom() rest:(ws() "&&" ws() rhs:atom() { rhs })* {
                rest.into_iter().fold(lhs, |acc, rhs| {
                    FinderExpr::And(Box::new(acc), Box::new(rhs))
                })
            }

        rule atom() -> FinderExpr
            = "!" ws() "(" ws() e:disjunction() ws() ")" { FinderExpr::Not(Box::new(e)) }
            / "(" ws() e:disjunction() ws() ")" { e }
            / logical()

        rule logical() -> FinderExpr
            = lhs:eval() ws() positive:equality() ws() rhs:eval() {
                FinderExpr::EquatingEval { lhs, positive, rhs }
            }
            / lhs:eval() ws() positive:equality() ws() outcome:outcome() {
                FinderExpr::EquatingOutcome { lhs, positive, outcome }
            }
            / eval:eval() ws() positive:matcher() ws() expected:expected_outcome() {
                FinderExpr::Matching { eval, positive, expected }
            }

        rule eval() -> FinderEval
            = "[" ws() solution:name() ws() checker:checking()? ws() "]" {
                FinderEval {
                    solution,
                    checker: checker.unwrap_or(CheckerSpec::Default),
                }
            }

        rule checking() -> CheckerSpec
            = ("ON" / "on") ws() ":nil" { CheckerSpec::Nil }
            / ("ON" / "on") ws() mode:checking_mode()? token:name() {
                CheckerSpec::Named {
                    token,
                    mode: mode.unwrap_or(CheckingMode::ThreeWay),
                }
            }

        rule checking_mode() -> CheckingMode
            = "2" ":" { CheckingMode::TwoWay }
            / "3" ":" { CheckingMode::ThreeWay }

        rule matcher() -> bool
            = "!~" { false }
            / "~" { true }

        rule equality() -> bool
            = "==" { true }
            / "!=" { false }

        rule name() -> String
            = "\"" s:filename() "\"" { s }
            / filename()

        rule filename() -> String
            = s:$(['/' | 'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '.' | '$']+)
            { s.to_owned() }

        rule outcome() -> Outcome
            = s:$(['A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '+']+) {?
                parse_outcome(s).ok_or("outcome")
            }

        rule expected_outcome() -> ExpectedOutcome
            = s:$(['A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '+']+) {?
                s.parse().or(Err("expected outcome"))
            }
    }
}

///
/// Parse an outcome literal for an equating clause. An ExpectedOutcome shorthand is
/// accepted as long as it names exactly one concrete outcome.
///
fn parse_outcome(token: &str) -> Option<Outcome> {
    let normalized = token.trim().to_lowercase().replace('_', "-").replace(' ', "-");
    if let Ok(outcome) = normalized.parse::<Outcome>() {
        return Some(outcome);
    }
    let expected: ExpectedOutcome = token.parse().ok()?;
    let matches = expected.get_matches();
    if matches.len() == 1 {
        Some(matches[0])
    } else {
        None
    }
}

///
/// A parsed finder expression, before package-level validation.
///
#[derive(Clone, Debug, PartialEq)]
pub struct FinderTree {
    pub expr: FinderExpr,
}

pub fn parse(expression: &str) -> Result<FinderTree, String> {
    let expr = finder::start(expression)
        .map_err(|e| format!("Failed to parse finder expression {expression:?}: {e}"))?;
    Ok(FinderTree { expr })
}

fn walk_evals<'a>(expr: &'a FinderExpr, out: &mut Vec<&'a FinderEval>) {
    match expr {
        FinderExpr::Or(lhs, rhs) | FinderExpr::And(lhs, rhs) => {
            walk_evals(lhs, out);
            walk_evals(rhs, out);
        }
        FinderExpr::Not(inner) => walk_evals(inner, out),
        FinderExpr::Matching { eval, .. } => out.push(eval),
        FinderExpr::EquatingEval { lhs, rhs, .. } => {
            out.push(lhs);
            out.push(rhs);
        }
        FinderExpr::EquatingOutcome { lhs, .. } => out.push(lhs),
    }
}

impl FinderTree {
    fn evals(&self) -> Vec<&FinderEval> {
        let mut out = Vec::new();
        walk_evals(&self.expr, &mut out);
        out
    }

    fn resolve_solution(ctx: &Context, token: &str) -> Result<String, String> {
        if token == "$" {
            let main = ctx
                .pkg
                .main_solution()
                .ok_or_else(|| "Finder expression references the main solution, but the package has none".to_owned())?;
            Ok(main.code.path.display().to_string())
        } else {
            Ok(token.to_owned())
        }
    }

    fn resolve_checker_token(ctx: &Context, token: &str) -> Result<String, String> {
        if token == "$" {
            let checker = ctx.pkg.checker.as_ref().ok_or_else(|| {
                "Finder expression references the main checker, but the package has none".to_owned()
            })?;
            Ok(checker.path.display().to_string())
        } else {
            Ok(token.to_owned())
        }
    }

    ///
    /// The checker one eval clause resolves to, after defaulting and `$` expansion.
    ///
    pub fn resolve_checker(
        ctx: &Context,
        spec: &CheckerSpec,
    ) -> Result<Option<FinderChecker>, String> {
        match spec {
            CheckerSpec::Nil => Ok(None),
            CheckerSpec::Default => Ok(ctx.pkg.checker.as_ref().map(|checker| FinderChecker {
                path: checker.path.display().to_string(),
                mode: CheckingMode::ThreeWay,
            })),
            CheckerSpec::Named { token, mode } => Ok(Some(FinderChecker {
                path: Self::resolve_checker_token(ctx, token)?,
                mode: *mode,
            })),
        }
    }

    ///
    /// Every distinct solution referenced by the expression, with the main solution
    /// prepended when expected outputs are needed. The main solution always sorts first.
    ///
    pub fn all_solutions(&self, ctx: &Context) -> Result<Vec<String>, String> {
        let mut res: Vec<String> = Vec::new();
        for eval in self.evals() {
            let solution = Self::resolve_solution(ctx, &eval.solution)?;
            if !res.contains(&solution) {
                res.push(solution);
            }
        }
        if self.needs_expected_output(ctx)? {
            let main = ctx
                .pkg
                .main_solution()
                .ok_or_else(|| "Three-way checking requires a main solution".to_owned())?;
            let main_path = main.code.path.display().to_string();
            if !res.contains(&main_path) {
                res.push(main_path);
            }
        }
        if let Some(main) = ctx.pkg.main_solution() {
            let main_path = main.code.path.display().to_string();
            if let Some(pos) = res.iter().position(|path| *path == main_path) {
                res.swap(0, pos);
            }
        }
        Ok(res)
    }

    pub fn all_checkers(&self, ctx: &Context) -> Result<Vec<String>, String> {
        let mut res = Vec::new();
        for eval in self.evals() {
            if let Some(checker) = Self::resolve_checker(ctx, &eval.checker)? {
                if !res.contains(&checker.path) {
                    res.push(checker.path);
                }
            }
        }
        Ok(res)
    }

    ///
    /// Whether any eval clause performs three-way checking, which requires the main
    /// solution to produce a reference output per generated input.
    ///
    pub fn needs_expected_output(&self, ctx: &Context) -> Result<bool, String> {
        for eval in self.evals() {
            if let Some(checker) = Self::resolve_checker(ctx, &eval.checker)? {
                if checker.mode == CheckingMode::ThreeWay {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    ///
    /// Static validation: three-way checking needs a main solution, and every referenced
    /// file must exist.
    ///
    pub fn validate(&self, ctx: &Context) -> Result<(), String> {
        if self.needs_expected_output(ctx)? && ctx.pkg.main_solution().is_none() {
            return Err(
                "Finder expression requires three-way checking, but the package has no main \
                 solution. Either provide an accepted solution, or use two-way checking by \
                 prefixing the checker with `2:`."
                    .to_owned(),
            );
        }
        for checker in self.all_checkers(ctx)? {
            if !ctx.root.join(&checker).is_file() {
                return Err(format!(
                    "Finder expression references non-existing checker {checker}"
                ));
            }
        }
        for solution in self.all_solutions(ctx)? {
            if !ctx.root.join(&solution).is_file() {
                return Err(format!(
                    "Finder expression references non-existing solution {solution}"
                ));
            }
        }
        Ok(())
    }
}

///
/// One resolved solution/checker run requested by the expression.
///
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FinderCall {
    pub solution: String,
    pub checker: Option<FinderChecker>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FinderSolutionResult {
    pub output_path: std::path::PathBuf,
    pub stderr_path: Option<std::path::PathBuf>,
    pub run_log: Option<RunLog>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FinderResult {
    pub solution: String,
    pub outcome: Outcome,
    pub checker: Option<FinderChecker>,
    pub solution_result: Option<FinderSolutionResult>,
    pub checker_result: Option<CheckerResult>,
}

///
/// The truth value of a whole expression over one input, plus every eval result that
/// contributed to it.
///
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FinderOutcome {
    pub truth_value: bool,
    pub results: Vec<FinderResult>,
}

///
/// The side evaluating an eval clause: runs the solution (memoized per input) and the
/// requested checker, returning the resulting outcome.
///
pub trait FinderCallRunner {
    fn run<'a>(
        &'a mut self,
        ctx: &'a mut Context,
        call: FinderCall,
    ) -> Pin<Box<dyn Future<Output = Result<FinderResult, String>> + 'a>>;
}

fn resolve_call(ctx: &Context, eval: &FinderEval) -> Result<FinderCall, String> {
    Ok(FinderCall {
        solution: FinderTree::resolve_solution(ctx, &eval.solution)?,
        checker: FinderTree::resolve_checker(ctx, &eval.checker)?,
    })
}

///
/// Walk the expression, running eval clauses through the runner and combining truth
/// values. Results from every sub-eval accumulate for reporting.
///
pub fn evaluate<'a>(
    expr: &'a FinderExpr,
    ctx: &'a mut Context,
    runner: &'a mut dyn FinderCallRunner,
) -> Pin<Box<dyn Future<Output = Result<FinderOutcome, String>> + 'a>> {
    Box::pin(async move {
        match expr {
            FinderExpr::Or(lhs, rhs) => {
                let a = evaluate(lhs, &mut *ctx, &mut *runner).await?;
                let b = evaluate(rhs, &mut *ctx, &mut *runner).await?;
                let mut results = a.results;
                results.extend(b.results);
                Ok(FinderOutcome {
                    truth_value: a.truth_value || b.truth_value,
                    results,
                })
            }
            FinderExpr::And(lhs, rhs) => {
                let a = evaluate(lhs, &mut *ctx, &mut *runner).await?;
                let b = evaluate(rhs, &mut *ctx, &mut *runner).await?;
                let mut results = a.results;
                results.extend(b.results);
                Ok(FinderOutcome {
                    truth_value: a.truth_value && b.truth_value,
                    results,
                })
            }
            FinderExpr::Not(inner) => {
                let outcome = evaluate(inner, &mut *ctx, &mut *runner).await?;
                Ok(FinderOutcome {
                    truth_value: !outcome.truth_value,
                    results: outcome.results,
                })
            }
            FinderExpr::Matching {
                eval,
                positive,
                expected,
            } => {
                let call = resolve_call(ctx, eval)?;
                let result = runner.run(ctx, call).await?;
                let mut truth_value = expected.matches(result.outcome);
                if !positive {
                    truth_value = !truth_value;
                }
                Ok(FinderOutcome {
                    truth_value,
                    results: vec![result],
                })
            }
            FinderExpr::EquatingEval { lhs, positive, rhs } => {
                let lhs_call = resolve_call(ctx, lhs)?;
                let lhs_result = runner.run(ctx, lhs_call).await?;
                let rhs_call = resolve_call(ctx, rhs)?;
                let rhs_result = runner.run(ctx, rhs_call).await?;
                let mut truth_value = lhs_result.outcome == rhs_result.outcome;
                if !positive {
                    truth_value = !truth_value;
                }
                Ok(FinderOutcome {
                    truth_value,
                    results: vec![lhs_result, rhs_result],
                })
            }
            FinderExpr::EquatingOutcome {
                lhs,
                positive,
                outcome,
            } => {
                let call = resolve_call(ctx, lhs)?;
                let result = runner.run(ctx, call).await?;
                let mut truth_value = result.outcome == *outcome;
                if !positive {
                    truth_value = !truth_value;
                }
                Ok(FinderOutcome {
                    truth_value,
                    results: vec![result],
                })
            }
        }
    })
}
