// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::path::PathBuf;
use std::str::FromStr;

use grading::Outcome;
use serde::{Deserialize, Deserializer, Serialize};

///
/// The outcome a solution is declared to have. A superset of `Outcome` that groups
/// concrete verdicts; parsing accepts the usual competitive-programming shorthands.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExpectedOutcome {
    Accepted,
    WrongAnswer,
    /// Any non-AC verdict among WA, RTE, MLE and TLE.
    Incorrect,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    /// Either TLE or RTE; useful where the two are indistinguishable.
    TleOrRte,
}

impl ExpectedOutcome {
    pub fn matches(&self, outcome: Outcome) -> bool {
        match self {
            ExpectedOutcome::Accepted => outcome == Outcome::Accepted,
            ExpectedOutcome::WrongAnswer => outcome == Outcome::WrongAnswer,
            ExpectedOutcome::Incorrect => matches!(
                outcome,
                Outcome::WrongAnswer
                    | Outcome::RuntimeError
                    | Outcome::MemoryLimitExceeded
                    | Outcome::TimeLimitExceeded
            ),
            ExpectedOutcome::RuntimeError => outcome == Outcome::RuntimeError,
            ExpectedOutcome::TimeLimitExceeded => outcome == Outcome::TimeLimitExceeded,
            ExpectedOutcome::MemoryLimitExceeded => outcome == Outcome::MemoryLimitExceeded,
            ExpectedOutcome::OutputLimitExceeded => outcome == Outcome::OutputLimitExceeded,
            ExpectedOutcome::TleOrRte => matches!(
                outcome,
                Outcome::TimeLimitExceeded | Outcome::RuntimeError
            ),
        }
    }

    /// Every concrete outcome this expectation matches.
    pub fn get_matches(&self) -> Vec<Outcome> {
        const ALL: [Outcome; 8] = [
            Outcome::Accepted,
            Outcome::WrongAnswer,
            Outcome::JudgeFailed,
            Outcome::RuntimeError,
            Outcome::TimeLimitExceeded,
            Outcome::MemoryLimitExceeded,
            Outcome::OutputLimitExceeded,
            Outcome::InternalError,
        ];
        ALL.into_iter().filter(|o| self.matches(*o)).collect()
    }

    pub fn intersects(&self, other: ExpectedOutcome) -> bool {
        self.get_matches()
            .into_iter()
            .any(|outcome| other.matches(outcome))
    }

    /// Whether a solution with this expectation is considered slow.
    pub fn is_slow(&self) -> bool {
        self.matches(Outcome::TimeLimitExceeded)
    }
}

impl FromStr for ExpectedOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<ExpectedOutcome, String> {
        let normalized: String = s
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == '-' || c == ' ' || c == '/' { '_' } else { c })
            .collect();
        match normalized.as_str() {
            "accepted" | "ac" | "correct" => Ok(ExpectedOutcome::Accepted),
            "wrong_answer" | "wa" => Ok(ExpectedOutcome::WrongAnswer),
            "incorrect" | "fail" => Ok(ExpectedOutcome::Incorrect),
            "runtime_error" | "rte" | "re" => Ok(ExpectedOutcome::RuntimeError),
            "time_limit_exceeded" | "timeout" | "tle" => Ok(ExpectedOutcome::TimeLimitExceeded),
            "memory_limit_exceeded" | "mle" => Ok(ExpectedOutcome::MemoryLimitExceeded),
            "output_limit_exceeded" | "ole" => Ok(ExpectedOutcome::OutputLimitExceeded),
            "tle_or_rte" | "tle_rte" | "tle+rte" => Ok(ExpectedOutcome::TleOrRte),
            _ => Err(format!("Unknown expected outcome: {s}")),
        }
    }
}

impl std::fmt::Display for ExpectedOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExpectedOutcome::Accepted => "ACCEPTED",
            ExpectedOutcome::WrongAnswer => "WRONG_ANSWER",
            ExpectedOutcome::Incorrect => "INCORRECT",
            ExpectedOutcome::RuntimeError => "RUNTIME_ERROR",
            ExpectedOutcome::TimeLimitExceeded => "TIME_LIMIT_EXCEEDED",
            ExpectedOutcome::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
            ExpectedOutcome::OutputLimitExceeded => "OUTPUT_LIMIT_EXCEEDED",
            ExpectedOutcome::TleOrRte => "TLE_OR_RTE",
        };
        f.write_str(name)
    }
}

impl<'de> Deserialize<'de> for ExpectedOutcome {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<ExpectedOutcome, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

///
/// A primitive value usable as a package variable.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Primitive {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl std::fmt::Display for Primitive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Primitive::Bool(b) => write!(f, "{b}"),
            Primitive::Int(i) => write!(f, "{i}"),
            Primitive::Float(x) => write!(f, "{x}"),
            Primitive::String(s) => f.write_str(s),
        }
    }
}

impl Primitive {
    /// A leading backslash escapes a literal value that would otherwise be interpreted.
    pub fn expand(&self) -> Primitive {
        match self {
            Primitive::String(s) if s.starts_with('\\') => Primitive::String(s[1..].to_owned()),
            other => other.clone(),
        }
    }
}

///
/// A code file referenced by the package, with an optional language override and extra
/// files placed alongside it during compilation.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeItem {
    /// The path to the code file, relative to the package directory.
    pub path: PathBuf,
    /// The language of the code file; inferred from the extension when absent.
    #[serde(default)]
    pub language: Option<String>,
    /// Extra files staged alongside the code file during compilation.
    #[serde(default)]
    pub compilation_files: Vec<PathBuf>,
}

impl CodeItem {
    pub fn from_path(path: impl Into<PathBuf>) -> CodeItem {
        CodeItem {
            path: path.into(),
            language: None,
            compilation_files: vec![],
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Testcase {
    pub input_path: PathBuf,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorCall {
    /// The name of the generator to call.
    pub name: String,
    /// The arguments to pass to the generator.
    #[serde(default)]
    pub args: Option<String>,
}

///
/// A bag of testcases built together. Sources are concatenated in a fixed order:
/// enumerated testcases, then glob matches, then generator calls, then the lines of the
/// generator script.
///
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestcaseSubgroup {
    pub name: String,
    /// Testcases copied verbatim into the group.
    #[serde(default)]
    pub testcases: Vec<Testcase>,
    /// A glob matching `.in` files relative to the package directory; outputs with the
    /// same stem and a `.out` extension are picked up when present.
    #[serde(default)]
    pub testcase_glob: Option<String>,
    /// Generators called once each.
    #[serde(default)]
    pub generators: Vec<GeneratorCall>,
    /// A script emitting one generator call per line: either a `.txt` file or a program
    /// whose stdout is the script.
    #[serde(default)]
    pub generator_script: Option<CodeItem>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestcaseGroup {
    #[serde(flatten)]
    pub subgroup: TestcaseSubgroup,
    /// Further subgroups sharing this group's directory; generated filenames are
    /// prefixed with the subgroup index and name.
    #[serde(default)]
    pub subgroups: Vec<TestcaseSubgroup>,
    /// Group-specific validator, overriding the package validator.
    #[serde(default)]
    pub validator: Option<CodeItem>,
    /// The weight of this group in the final score.
    #[serde(default)]
    pub weight: Option<f64>,
}

impl TestcaseGroup {
    pub fn name(&self) -> &str {
        &self.subgroup.name
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Generator {
    #[serde(flatten)]
    pub code: CodeItem,
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Solution {
    #[serde(flatten)]
    pub code: CodeItem,
    /// The expected outcome of this solution.
    pub outcome: ExpectedOutcome,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Stress {
    pub name: String,
    /// Generator pattern expanded per iteration.
    pub generator: GeneratorCall,
    /// The finder expression evaluated over solution outcomes.
    pub finder: String,
}

///
/// The problem package: the declarative root of every build/run/stress operation.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Package {
    pub name: String,
    /// Time limit, in milliseconds.
    pub time_limit: u64,
    /// Memory limit, in MiB.
    pub memory_limit: u64,
    /// Output limit, in KiB.
    #[serde(default = "default_output_limit")]
    pub output_limit: u64,
    #[serde(default)]
    pub checker: Option<CodeItem>,
    #[serde(default)]
    pub validator: Option<CodeItem>,
    #[serde(default)]
    pub generators: Vec<Generator>,
    /// All tested solutions. The first one is the main solution, used as the reference,
    /// and must be expected to be accepted.
    #[serde(default)]
    pub solutions: Vec<Solution>,
    #[serde(default)]
    pub testcases: Vec<TestcaseGroup>,
    #[serde(default)]
    pub stresses: Vec<Stress>,
    /// Variables shared across the package; passed as `--key=value` to validators and
    /// usable in generator argument templates.
    #[serde(default)]
    pub vars: std::collections::BTreeMap<String, Primitive>,
}

fn default_output_limit() -> u64 {
    4096
}

impl Package {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(main) = self.solutions.first() {
            if main.outcome != ExpectedOutcome::Accepted {
                return Err(
                    "The first solution in the package must have the \"accepted\" outcome"
                        .to_owned(),
                );
            }
        }
        for (i, group) in self.testcases.iter().enumerate() {
            if group.name() == "samples" && i > 0 {
                return Err(format!(
                    "The \"samples\" group must be the first group in the package, but is the {}-th",
                    i + 1
                ));
            }
        }
        Ok(())
    }

    pub fn expanded_vars(&self) -> std::collections::BTreeMap<String, Primitive> {
        self.vars
            .iter()
            .map(|(k, v)| (k.clone(), v.expand()))
            .collect()
    }

    pub fn main_solution(&self) -> Option<&Solution> {
        self.solutions
            .first()
            .filter(|sol| sol.outcome == ExpectedOutcome::Accepted)
    }

    pub fn get_generator(&self, name: &str) -> Result<&Generator, String> {
        self.generators
            .iter()
            .find(|gen| gen.name == name)
            .ok_or_else(|| format!("Generator {name} not found in package"))
    }

    pub fn get_solution(&self, path: &str) -> Option<&Solution> {
        self.solutions
            .iter()
            .find(|sol| sol.code.path == PathBuf::from(path))
    }

    pub fn get_stress(&self, name: &str) -> Result<&Stress, String> {
        self.stresses
            .iter()
            .find(|stress| stress.name == name)
            .ok_or_else(|| format!("Stress test {name} not found in package"))
    }

    pub fn get_testgroup(&self, name: &str) -> Result<&TestcaseGroup, String> {
        self.testcases
            .iter()
            .find(|group| group.name() == name)
            .ok_or_else(|| format!("Test group {name} not found in package"))
    }
}
