// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::collections::BTreeMap;

use rand::Rng;

use crate::schema::Primitive;

///
/// One component of a generator argument: literal text, a variable substitution, a
/// random range, a weighted choice, or a random hex token.
///
#[derive(Clone, Debug, PartialEq)]
pub enum ArgPart {
    Text(String),
    Var(String),
    Range(RangeExpr),
    Select(Vec<Vec<ArgPart>>),
    RandomHex,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RangeValue {
    Int(i64),
    Float(f64),
    Char(char),
    Var(String),
    Range(Box<RangeExpr>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RangeExpr {
    pub min: Box<RangeValue>,
    pub max: Box<RangeValue>,
}

///
/// A parsed generator argument template: a list of arguments, each a concatenation of
/// parts.
///
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedArgs(pub Vec<Vec<ArgPart>>);

peg::parser! {
    grammar generator_args() for str {
        rule ws() = quiet!{[' ' | '\t' | '\r' | '\n']+}

        pub rule args() -> Vec<Vec<ArgPart>>
            = ws()? a:(arg() ** ws()) ws()? { a }

        rule arg() -> Vec<ArgPart> = parts:(part()+) { parts }

        rule part() -> ArgPart
            = random_hex() / ticked() / expr() / text()

        rule random_hex() -> ArgPart = "@" { ArgPart::RandomHex }

        rule ticked() -> ArgPart = "`" e:expr() "`" { e }

        rule expr() -> ArgPart
            = v:var() { ArgPart::Var(v) }
            / r:range() { ArgPart::Range(r) }
            / select()

        rule var() -> String = "<" name:cname() ">" { name }

        rule cname() -> String
            = s:$(['a'..='z' | 'A'..='Z' | '_'] ['a'..='z' | 'A'..='Z' | '0'..='9' | '_']*)
            { s.to_owned() }

        rule range() -> RangeExpr
            = "[" min:range_value() ".." max:range_value() "]" {
                RangeExpr { min: Box::new(min), max: Box::new(max) }
            }

        rule range_value() -> RangeValue
            = r:range() { RangeValue::Range(Box::new(r)) }
            / v:var() { RangeValue::Var(v) }
            / f:float() { f }
            / i:int() { i }
            / c:char_value() { c }

        rule float() -> RangeValue
            = s:$(['-' | '+']? ['0'..='9']+ "." ['0'..='9']+) {?
                s.parse().map(RangeValue::Float).or(Err("float"))
            }

        rule int() -> RangeValue
            = s:$(['-' | '+']? ['0'..='9']+) {?
                s.parse().map(RangeValue::Int).or(Err("int"))
            }

        rule char_value() -> RangeValue
            = "'" c:$([^ '\'']) "'" { RangeValue::Char(c.chars().next().unwrap()) }

        rule select() -> ArgPart
            = "(" options:(select_value() ** "|") ")" { ArgPart::Select(options) }

        rule select_value() -> Vec<ArgPart> = parts:(select_part()+) { parts }

        rule select_part() -> ArgPart
            = ticked() / expr() / text()

        rule text() -> ArgPart = s:$(text_piece()+) { ArgPart::Text(s.to_owned()) }

        rule text_piece()
            = quoted_string()
            / [^ ' ' | '\t' | '\x0c' | '\r' | '\n' | '[' | ']' | '(' | ')' | '<' | '>' | '|' | '`' | '@']

        rule quoted_string()
            = "\"" ("\\" [_] / [^ '"' | '\\'])* "\""
    }
}

pub fn parse(args: &str) -> Result<ParsedArgs, String> {
    generator_args::args(args)
        .map(ParsedArgs)
        .map_err(|e| format!("Failed to parse generator arguments {args:?}: {e}"))
}

fn primitive_as_str(value: &Primitive) -> String {
    match value {
        Primitive::Float(x) => format!("{x:.6}"),
        other => other.to_string(),
    }
}

fn range_value_as_str(value: RangeValue) -> String {
    match value {
        RangeValue::Int(i) => i.to_string(),
        RangeValue::Float(x) => format!("{x:.6}"),
        RangeValue::Char(c) => c.to_string(),
        RangeValue::Var(_) | RangeValue::Range(_) => unreachable!("resolved before rendering"),
    }
}

///
/// Expands parsed argument templates against the package variables, drawing randomness
/// from the given generator.
///
pub struct ArgsGenerator<'a> {
    vars: &'a BTreeMap<String, Primitive>,
}

impl<'a> ArgsGenerator<'a> {
    pub fn new(vars: &'a BTreeMap<String, Primitive>) -> ArgsGenerator<'a> {
        ArgsGenerator { vars }
    }

    fn resolve_var(&self, name: &str) -> Result<Primitive, String> {
        self.vars
            .get(name)
            .cloned()
            .map(|value| value.expand())
            .ok_or_else(|| format!("Variable {name} is not defined"))
    }

    fn resolve_range_value<R: Rng>(
        &self,
        value: &RangeValue,
        rng: &mut R,
    ) -> Result<RangeValue, String> {
        match value {
            RangeValue::Var(name) => match self.resolve_var(name)? {
                Primitive::Int(i) => Ok(RangeValue::Int(i)),
                Primitive::Float(x) => Ok(RangeValue::Float(x)),
                Primitive::String(s) if s.chars().count() == 1 => {
                    Ok(RangeValue::Char(s.chars().next().unwrap()))
                }
                other => Err(format!(
                    "Variable {name} = {other} cannot be used as a range endpoint"
                )),
            },
            RangeValue::Range(inner) => {
                let drawn = self.eval_range(inner, rng)?;
                Ok(drawn)
            }
            other => Ok(other.clone()),
        }
    }

    fn eval_range<R: Rng>(&self, range: &RangeExpr, rng: &mut R) -> Result<RangeValue, String> {
        let min = self.resolve_range_value(&range.min, rng)?;
        let max = self.resolve_range_value(&range.max, rng)?;
        match (min, max) {
            (RangeValue::Int(a), RangeValue::Int(b)) => {
                if b < a {
                    return Err(format!("Found int range with invalid bounds [{a}..{b}]"));
                }
                Ok(RangeValue::Int(rng.gen_range(a..=b)))
            }
            (RangeValue::Float(a), RangeValue::Float(b)) => {
                Ok(RangeValue::Float(a + (b - a) * rng.gen::<f64>()))
            }
            (RangeValue::Int(a), RangeValue::Float(b)) => {
                let a = a as f64;
                Ok(RangeValue::Float(a + (b - a) * rng.gen::<f64>()))
            }
            (RangeValue::Float(a), RangeValue::Int(b)) => {
                let b = b as f64;
                Ok(RangeValue::Float(a + (b - a) * rng.gen::<f64>()))
            }
            (RangeValue::Char(a), RangeValue::Char(b)) => {
                let (a, b) = (a as u32, b as u32);
                if b < a {
                    return Err(format!(
                        "Found char range with invalid bounds ['{}'..'{}']",
                        char::from_u32(a).unwrap_or('?'),
                        char::from_u32(b).unwrap_or('?'),
                    ));
                }
                let drawn = rng.gen_range(a..=b);
                Ok(RangeValue::Char(
                    char::from_u32(drawn).ok_or_else(|| "Invalid char in range".to_owned())?,
                ))
            }
            (a, b) => Err(format!("Types in range are incompatible: {a:?} != {b:?}")),
        }
    }

    fn eval_part<R: Rng>(&self, part: &ArgPart, rng: &mut R) -> Result<String, String> {
        match part {
            ArgPart::Text(text) => Ok(text.clone()),
            ArgPart::Var(name) => Ok(primitive_as_str(&self.resolve_var(name)?)),
            ArgPart::Range(range) => Ok(range_value_as_str(self.eval_range(range, rng)?)),
            ArgPart::Select(options) => {
                if options.is_empty() {
                    return Ok(String::new());
                }
                let chosen = &options[rng.gen_range(0..options.len())];
                let mut out = String::new();
                for part in chosen {
                    out.push_str(&self.eval_part(part, rng)?);
                }
                Ok(out)
            }
            ArgPart::RandomHex => {
                const HEX: &[u8] = b"0123456789abcdef";
                Ok((0..8)
                    .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
                    .collect())
            }
        }
    }

    ///
    /// Render the whole template into a concrete argument string.
    ///
    pub fn generate<R: Rng>(&self, args: &ParsedArgs, rng: &mut R) -> Result<String, String> {
        let mut rendered = Vec::new();
        for arg in &args.0 {
            let mut out = String::new();
            for part in arg {
                out.push_str(&self.eval_part(part, rng)?);
            }
            rendered.push(out);
        }
        Ok(rendered.join(" "))
    }
}
