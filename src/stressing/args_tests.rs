// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::schema::Primitive;
use crate::stressing::args::{parse, ArgPart, ArgsGenerator, ParsedArgs};

fn vars() -> BTreeMap<String, Primitive> {
    let mut vars = BTreeMap::new();
    vars.insert("MAX_N".to_owned(), Primitive::Int(10));
    vars.insert("RATIO".to_owned(), Primitive::Float(0.5));
    vars.insert("NAME".to_owned(), Primitive::String("tree".to_owned()));
    vars
}

fn generate(template: &str) -> String {
    let parsed = parse(template).unwrap();
    let vars = vars();
    let generator = ArgsGenerator::new(&vars);
    let mut rng = StdRng::seed_from_u64(1234);
    generator.generate(&parsed, &mut rng).unwrap()
}

#[test]
fn plain_text_is_preserved() {
    assert_eq!(generate("--n=5 --verbose"), "--n=5 --verbose");
    assert_eq!(generate(""), "");
}

#[test]
fn quoted_text_keeps_quotes() {
    assert_eq!(generate("--name=\"allow me\""), "--name=\"allow me\"");
}

#[test]
fn variables_expand() {
    assert_eq!(generate("--max=<MAX_N>"), "--max=10");
    assert_eq!(generate("<NAME>"), "tree");
    assert_eq!(generate("--ratio=<RATIO>"), "--ratio=0.500000");
}

#[test]
fn undefined_variable_errors() {
    let parsed = parse("<UNKNOWN>").unwrap();
    let vars = vars();
    let generator = ArgsGenerator::new(&vars);
    let mut rng = StdRng::seed_from_u64(0);
    assert!(generator.generate(&parsed, &mut rng).is_err());
}

#[test]
fn degenerate_ranges_are_deterministic() {
    assert_eq!(generate("[5..5]"), "5");
    assert_eq!(generate("['a'..'a']"), "a");
}

#[test]
fn int_range_respects_bounds() {
    let parsed = parse("[1..6]").unwrap();
    let vars = vars();
    let generator = ArgsGenerator::new(&vars);
    for seed in 0..64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let value: i64 = generator
            .generate(&parsed, &mut rng)
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=6).contains(&value));
    }
}

#[test]
fn char_range_respects_bounds() {
    let parsed = parse("['a'..'c']").unwrap();
    let vars = vars();
    let generator = ArgsGenerator::new(&vars);
    for seed in 0..32 {
        let mut rng = StdRng::seed_from_u64(seed);
        let value = generator.generate(&parsed, &mut rng).unwrap();
        assert!(["a", "b", "c"].contains(&value.as_str()));
    }
}

#[test]
fn range_with_variable_endpoint() {
    let parsed = parse("[<MAX_N>..<MAX_N>]").unwrap();
    let vars = vars();
    let generator = ArgsGenerator::new(&vars);
    let mut rng = StdRng::seed_from_u64(0);
    assert_eq!(generator.generate(&parsed, &mut rng).unwrap(), "10");
}

#[test]
fn nested_range_endpoint() {
    let parsed = parse("[1..[3..3]]").unwrap();
    let vars = vars();
    let generator = ArgsGenerator::new(&vars);
    for seed in 0..32 {
        let mut rng = StdRng::seed_from_u64(seed);
        let value: i64 = generator
            .generate(&parsed, &mut rng)
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=3).contains(&value));
    }
}

#[test]
fn invalid_range_bounds_error() {
    let parsed = parse("[6..1]").unwrap();
    let vars = vars();
    let generator = ArgsGenerator::new(&vars);
    let mut rng = StdRng::seed_from_u64(0);
    assert!(generator.generate(&parsed, &mut rng).is_err());
}

#[test]
fn select_picks_an_option() {
    let parsed = parse("(a|b|c)").unwrap();
    let vars = vars();
    let generator = ArgsGenerator::new(&vars);
    for seed in 0..32 {
        let mut rng = StdRng::seed_from_u64(seed);
        let value = generator.generate(&parsed, &mut rng).unwrap();
        assert!(["a", "b", "c"].contains(&value.as_str()));
    }
}

#[test]
fn single_option_select_is_deterministic() {
    assert_eq!(generate("(only)"), "only");
}

#[test]
fn random_hex_has_eight_digits() {
    let value = generate("@");
    assert_eq!(value.len(), 8);
    assert!(value.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn words_mix_text_and_expressions() {
    let value = generate("--n=[7..7] --flag=<MAX_N>x");
    assert_eq!(value, "--n=7 --flag=10x");
}

#[test]
fn ticked_expression_inside_word() {
    assert_eq!(generate("ab`[9..9]`cd"), "ab9cd");
}

#[test]
fn parse_structure() {
    let ParsedArgs(args) = parse("--a [1..2] @").unwrap();
    assert_eq!(args.len(), 3);
    assert_eq!(args[0], vec![ArgPart::Text("--a".to_owned())]);
    assert!(matches!(args[1][0], ArgPart::Range(_)));
    assert_eq!(args[2], vec![ArgPart::RandomHex]);
}

#[test]
fn complex_template_parses() {
    parse(r#"--MAX_N="allow me" --int=[1..<MAX_N>] --float=[1.0..2.5] --char=['a'..'z'] --sel=("a"|"b"|"c") @ --r2=[1..[8..15]]"#)
        .unwrap();
}
