// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use grading::Outcome;

use crate::schema::ExpectedOutcome;
use crate::stressing::finder::{
    parse, CheckerSpec, CheckingMode, FinderEval, FinderExpr,
};

fn eval(solution: &str) -> FinderEval {
    FinderEval {
        solution: solution.to_owned(),
        checker: CheckerSpec::Default,
    }
}

#[test]
fn parses_simple_matching() {
    let tree = parse("[sol1.sh] ~ wrong-answer").unwrap();
    assert_eq!(
        tree.expr,
        FinderExpr::Matching {
            eval: eval("sol1.sh"),
            positive: true,
            expected: ExpectedOutcome::WrongAnswer,
        }
    );
}

#[test]
fn parses_negated_matcher() {
    let tree = parse("[sols/slow.cpp] !~ tle").unwrap();
    assert_eq!(
        tree.expr,
        FinderExpr::Matching {
            eval: eval("sols/slow.cpp"),
            positive: false,
            expected: ExpectedOutcome::TimeLimitExceeded,
        }
    );
}

#[test]
fn parses_wildcard_solution() {
    let tree = parse("[$] ~ incorrect").unwrap();
    assert_eq!(
        tree.expr,
        FinderExpr::Matching {
            eval: eval("$"),
            positive: true,
            expected: ExpectedOutcome::Incorrect,
        }
    );
}

#[test]
fn parses_quoted_filename() {
    let tree = parse("[\"sol-1.cpp\"] ~ wa").unwrap();
    assert_eq!(
        tree.expr,
        FinderExpr::Matching {
            eval: eval("sol-1.cpp"),
            positive: true,
            expected: ExpectedOutcome::WrongAnswer,
        }
    );
}

#[test]
fn parses_checker_clauses() {
    let tree = parse("[a.sh ON chk.sh] ~ ac").unwrap();
    let FinderExpr::Matching { eval, .. } = &tree.expr else {
        panic!("wrong shape");
    };
    assert_eq!(
        eval.checker,
        CheckerSpec::Named {
            token: "chk.sh".to_owned(),
            mode: CheckingMode::ThreeWay,
        }
    );

    let tree = parse("[a.sh ON 2:chk.sh] ~ ac").unwrap();
    let FinderExpr::Matching { eval, .. } = &tree.expr else {
        panic!("wrong shape");
    };
    assert_eq!(
        eval.checker,
        CheckerSpec::Named {
            token: "chk.sh".to_owned(),
            mode: CheckingMode::TwoWay,
        }
    );

    let tree = parse("[a.sh ON :nil] ~ re").unwrap();
    let FinderExpr::Matching { eval, .. } = &tree.expr else {
        panic!("wrong shape");
    };
    assert_eq!(eval.checker, CheckerSpec::Nil);

    let tree = parse("[a.sh ON $] ~ ac").unwrap();
    let FinderExpr::Matching { eval, .. } = &tree.expr else {
        panic!("wrong shape");
    };
    assert_eq!(
        eval.checker,
        CheckerSpec::Named {
            token: "$".to_owned(),
            mode: CheckingMode::ThreeWay,
        }
    );
}

#[test]
fn parses_equating_forms() {
    let tree = parse("[a.sh] == [b.sh]").unwrap();
    assert!(matches!(
        tree.expr,
        FinderExpr::EquatingEval { positive: true, .. }
    ));

    let tree = parse("[a.sh] != [b.sh]").unwrap();
    assert!(matches!(
        tree.expr,
        FinderExpr::EquatingEval {
            positive: false,
            ..
        }
    ));

    let tree = parse("[a.sh] == wrong-answer").unwrap();
    let FinderExpr::EquatingOutcome { outcome, positive, .. } = tree.expr else {
        panic!("wrong shape");
    };
    assert!(positive);
    assert_eq!(outcome, Outcome::WrongAnswer);

    // An ExpectedOutcome shorthand naming exactly one outcome is accepted as a literal.
    let tree = parse("[a.sh] == wa").unwrap();
    let FinderExpr::EquatingOutcome { outcome, .. } = tree.expr else {
        panic!("wrong shape");
    };
    assert_eq!(outcome, Outcome::WrongAnswer);

    // A group shorthand is not a concrete outcome.
    assert!(parse("[a.sh] == incorrect").is_err());
}

#[test]
fn parses_boolean_structure() {
    let tree = parse("!([a.sh] ~ ac) && [b.sh] ~ wa || [c.sh] == [d.sh]").unwrap();
    // Parsed as ((!(..) && ..) || ..): conjunction binds tighter than disjunction.
    let FinderExpr::Or(lhs, rhs) = tree.expr else {
        panic!("top level should be a disjunction");
    };
    assert!(matches!(*rhs, FinderExpr::EquatingEval { .. }));
    let FinderExpr::And(not_part, matching) = *lhs else {
        panic!("lhs should be a conjunction");
    };
    assert!(matches!(*not_part, FinderExpr::Not(_)));
    assert!(matches!(*matching, FinderExpr::Matching { .. }));
}

#[test]
fn whitespace_is_insignificant() {
    assert_eq!(
        parse("[a.sh]~wa").unwrap(),
        parse("  [ a.sh ] ~ wa  ").unwrap()
    );
}

#[test]
fn rejects_garbage() {
    assert!(parse("").is_err());
    assert!(parse("[a.sh] ~").is_err());
    assert!(parse("a.sh ~ wa").is_err());
    assert!(parse("[a.sh] ~ not-a-verdict").is_err());
}

#[test]
fn lowercase_on_keyword() {
    let tree = parse("[a.sh on chk.sh] ~ ac").unwrap();
    let FinderExpr::Matching { eval, .. } = &tree.expr else {
        panic!("wrong shape");
    };
    assert!(matches!(eval.checker, CheckerSpec::Named { .. }));
}
