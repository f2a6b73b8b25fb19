// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use serde::{Deserialize, Serialize};

///
/// The verdict of a single evaluation.
///
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Outcome {
    Accepted,
    WrongAnswer,
    JudgeFailed,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    InternalError,
}

impl Outcome {
    /// The SCREAMING_SNAKE name used in reports.
    pub fn name(&self) -> &'static str {
        match self {
            Outcome::Accepted => "ACCEPTED",
            Outcome::WrongAnswer => "WRONG_ANSWER",
            Outcome::JudgeFailed => "JUDGE_FAILED",
            Outcome::RuntimeError => "RUNTIME_ERROR",
            Outcome::TimeLimitExceeded => "TIME_LIMIT_EXCEEDED",
            Outcome::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
            Outcome::OutputLimitExceeded => "OUTPUT_LIMIT_EXCEEDED",
            Outcome::InternalError => "INTERNAL_ERROR",
        }
    }
}
