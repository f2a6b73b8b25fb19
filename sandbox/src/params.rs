// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Path used as a stderr target to merge it into stdout.
pub const MERGE_STDERR: &str = "/dev/stdout";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryMount {
    pub src: PathBuf,
    pub dst: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
}

///
/// Per-execution limits and bindings for a sandbox.
///
/// Limits follow the conventions of the package format: timeouts in milliseconds, address
/// and stack space in MiB, file size in KiB. `max_processes` of 1 is strict;
/// a large value merely bounds fork bombs; None leaves the count unbounded.
///
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fsize: Option<u64>, // KiB
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub cgroup: bool,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub dirs: Vec<DirectoryMount>,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub preserve_env: bool,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub inherit_env: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub set_env: BTreeMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_processes: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_file: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_space: Option<u64>, // MiB
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_space: Option<u64>, // MiB
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>, // ms
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallclock_timeout: Option<u64>, // ms
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_timeout: Option<u64>, // ms
}

impl SandboxParams {
    pub fn new() -> SandboxParams {
        SandboxParams::default()
    }

    ///
    /// A JSON rendering of the params, suitable for keying cached executions. Unset fields
    /// are omitted so that adding parameters later does not invalidate existing entries.
    ///
    pub fn get_cacheable_params(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn set_stdio(&mut self, stdin: Option<PathBuf>, stdout: Option<PathBuf>) {
        self.stdin_file = stdin;
        self.stdout_file = stdout;
    }

    pub fn set_stdall(
        &mut self,
        stdin: Option<PathBuf>,
        stdout: Option<PathBuf>,
        stderr: Option<PathBuf>,
    ) {
        self.stdin_file = stdin;
        self.stdout_file = stdout;
        self.stderr_file = stderr;
    }

    pub fn add_mapped_directory(&mut self, src: &Path) {
        self.add_mapped_directory_to(src, None, None, false);
    }

    pub fn add_mapped_directory_to(
        &mut self,
        src: &Path,
        dest: Option<&Path>,
        options: Option<&str>,
        ignore_if_not_existing: bool,
    ) {
        if ignore_if_not_existing && !src.exists() {
            return;
        }
        self.dirs.push(DirectoryMount {
            src: src.to_owned(),
            dst: dest.unwrap_or(src).to_owned(),
            options: options.map(str::to_owned),
        });
    }

    pub fn set_multiprocess(&mut self, multiprocess: bool) {
        if multiprocess {
            // Still capped to limit the effect of fork bombs.
            self.max_processes = Some(1000);
        } else {
            self.max_processes = Some(1);
        }
    }
}
