// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

///
/// The enumerated reason an execution under a sandbox terminated.
///
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ExitStatus {
    Ok,
    Signal,
    Timeout,
    WallTimeout,
    NonzeroReturn,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    SandboxError,
}

impl Default for ExitStatus {
    fn default() -> ExitStatus {
        ExitStatus::SandboxError
    }
}

///
/// A parsed sandbox meta log: line-oriented `key: value`. Repeated keys keep every value
/// (the external isolator emits `status` more than once in some configurations).
///
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetaLog {
    entries: HashMap<String, Vec<String>>,
}

impl MetaLog {
    pub fn parse(raw: &str) -> MetaLog {
        let mut entries: HashMap<String, Vec<String>> = HashMap::new();
        for line in raw.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            entries
                .entry(key.trim().to_owned())
                .or_default()
                .push(value.trim().to_owned());
        }
        MetaLog { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        self.entries
            .get(key)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn status_list(&self) -> Vec<&str> {
        match self.get("status") {
            Some(s) if !s.is_empty() => s.split(',').map(str::trim).collect(),
            _ => vec![],
        }
    }

    ///
    /// The dominant exit status for a native-sandbox meta log. Wall-clock timeouts take
    /// precedence over CPU timeouts, and limit violations over plain signals/returns.
    ///
    pub fn exit_status(&self) -> ExitStatus {
        let statuses = self.status_list();
        if statuses.contains(&"WT") {
            ExitStatus::WallTimeout
        } else if statuses.contains(&"TO") {
            ExitStatus::Timeout
        } else if statuses.contains(&"OL") {
            ExitStatus::OutputLimitExceeded
        } else if statuses.contains(&"ML") {
            ExitStatus::MemoryLimitExceeded
        } else if statuses.contains(&"SG") {
            ExitStatus::Signal
        } else if statuses.contains(&"RE") {
            ExitStatus::NonzeroReturn
        } else {
            ExitStatus::Ok
        }
    }
}

pub fn human_exit_description(status: ExitStatus, exit_code: i32, killing_signal: i32) -> String {
    match status {
        ExitStatus::Ok => {
            format!("Execution successfully finished (with exit code {exit_code})")
        }
        ExitStatus::SandboxError => "Execution failed because of sandbox error".to_owned(),
        ExitStatus::Timeout => "Execution timed out".to_owned(),
        ExitStatus::WallTimeout => {
            "Execution timed out (wall clock limit exceeded)".to_owned()
        }
        ExitStatus::Signal => {
            format!("Execution killed with signal {killing_signal}")
        }
        ExitStatus::NonzeroReturn => {
            "Execution failed because the return code was nonzero".to_owned()
        }
        ExitStatus::MemoryLimitExceeded => "Execution exceeded memory limit".to_owned(),
        ExitStatus::OutputLimitExceeded => "Execution exceeded output limit".to_owned(),
    }
}
