// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::collections::HashMap;
use std::path::Path;

use sandbox::SandboxParams;
use serde::{Deserialize, Serialize};

///
/// How thoroughly a build/run verifies the package.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum VerificationLevel {
    None = 0,
    Validate = 1,
    FastSolutions = 2,
    Asan = 3,
    AllSolutions = 4,
    Full = 5,
}

impl VerificationLevel {
    pub fn from_value(value: u8) -> VerificationLevel {
        match value {
            0 => VerificationLevel::None,
            1 => VerificationLevel::Validate,
            2 => VerificationLevel::FastSolutions,
            3 => VerificationLevel::Asan,
            4 => VerificationLevel::AllSolutions,
            _ => VerificationLevel::Full,
        }
    }
}

///
/// Logical file names used when expanding `{compilable}`-style placeholders in language
/// commands. All paths are relative to the sandbox root.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileMapping {
    pub input: String,
    pub output: String,
    pub error: String,
    pub compilable: String,
    pub executable: String,
}

impl Default for FileMapping {
    fn default() -> FileMapping {
        FileMapping {
            input: "stdin".to_owned(),
            output: "stdout".to_owned(),
            error: "stderr".to_owned(),
            compilable: "compilable".to_owned(),
            executable: "executable".to_owned(),
        }
    }
}

impl FileMapping {
    pub fn apply(&self, command: &str) -> String {
        command
            .replace("{input}", &self.input)
            .replace("{output}", &self.output)
            .replace("{error}", &self.error)
            .replace("{compilable}", &self.compilable)
            .replace("{executable}", &self.executable)
    }

    fn merged_over(&self, overrides: &PartialFileMapping) -> FileMapping {
        FileMapping {
            input: overrides.input.clone().unwrap_or_else(|| self.input.clone()),
            output: overrides
                .output
                .clone()
                .unwrap_or_else(|| self.output.clone()),
            error: overrides.error.clone().unwrap_or_else(|| self.error.clone()),
            compilable: overrides
                .compilable
                .clone()
                .unwrap_or_else(|| self.compilable.clone()),
            executable: overrides
                .executable
                .clone()
                .unwrap_or_else(|| self.executable.clone()),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PartialFileMapping {
    pub input: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub compilable: Option<String>,
    pub executable: Option<String>,
}

///
/// Sandbox limits declared by the environment. Unset fields fall through to the defaults
/// merged underneath them.
///
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvironmentSandbox {
    pub max_processes: Option<u32>,
    /// Time limit in milliseconds.
    pub time_limit: Option<u64>,
    /// Wall time limit in milliseconds.
    pub wall_time_limit: Option<u64>,
    /// Memory limit in MiB.
    pub memory_limit: Option<u64>,
    /// Stack limit in MiB.
    pub stack_limit: Option<u64>,
    /// File size limit in KiB.
    pub file_size_limit: Option<u64>,
    pub preserve_env: Option<bool>,
    /// Host directories exposed read-only inside the sandbox.
    pub mirror_dirs: Option<Vec<String>>,
}

impl EnvironmentSandbox {
    fn merged_over(&self, overrides: &EnvironmentSandbox) -> EnvironmentSandbox {
        EnvironmentSandbox {
            max_processes: overrides.max_processes.or(self.max_processes),
            time_limit: overrides.time_limit.or(self.time_limit),
            wall_time_limit: overrides.wall_time_limit.or(self.wall_time_limit),
            memory_limit: overrides.memory_limit.or(self.memory_limit),
            stack_limit: overrides.stack_limit.or(self.stack_limit),
            file_size_limit: overrides.file_size_limit.or(self.file_size_limit),
            preserve_env: overrides.preserve_env.or(self.preserve_env),
            mirror_dirs: overrides
                .mirror_dirs
                .clone()
                .or_else(|| self.mirror_dirs.clone()),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompilationConfig {
    /// Commands to compile the program, run in order.
    pub commands: Vec<String>,
    pub sandbox: Option<EnvironmentSandbox>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionConfig {
    /// Command to run the program.
    pub command: Option<String>,
    pub sandbox: Option<EnvironmentSandbox>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentLanguage {
    /// Identifier of this language within the environment.
    pub name: String,
    #[serde(default)]
    pub readable_name: Option<String>,
    /// File extension this language claims; used to infer the language of a code item.
    pub extension: String,
    #[serde(default)]
    pub compilation: Option<CompilationConfig>,
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub file_mapping: Option<PartialFileMapping>,
}

///
/// The per-workstation environment: the list of supported languages with their
/// compile/run commands and defaults, plus which sandbox implementation to use.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Environment {
    pub default_file_mapping: Option<PartialFileMapping>,
    pub default_compilation: Option<CompilationConfig>,
    pub default_execution: Option<ExecutionConfig>,
    pub languages: Vec<EnvironmentLanguage>,
    /// Identifier of the sandbox backend ("stupid" or "isolate").
    pub sandbox: String,
    /// Extra, free-form extension configuration.
    pub extensions: HashMap<String, serde_yaml::Value>,
}

impl Default for Environment {
    fn default() -> Environment {
        default_environment()
    }
}

impl Environment {
    pub fn load(path: &Path) -> Result<Environment, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("Environment file {} not found: {e}", path.display()))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| format!("Failed to parse environment {}: {e}", path.display()))
    }

    pub fn get_language(&self, name: &str) -> Result<&EnvironmentLanguage, String> {
        self.languages
            .iter()
            .find(|lang| lang.name == name)
            .ok_or_else(|| format!("Language {name} not found in environment"))
    }

    pub fn language_for_extension(&self, extension: &str) -> Result<&EnvironmentLanguage, String> {
        self.languages
            .iter()
            .find(|lang| lang.extension == extension)
            .ok_or_else(|| format!("No language in environment supports extension .{extension}"))
    }

    ///
    /// The merged compilation config for a language: generous defaults for compilers
    /// (they need system tools, multiple processes and a bigger budget than the judged
    /// program), the environment defaults, then the language overrides.
    ///
    pub fn compilation_config(&self, language: &str) -> Result<CompilationConfig, String> {
        let base = EnvironmentSandbox {
            max_processes: None,
            time_limit: Some(10000),
            wall_time_limit: Some(10000),
            memory_limit: Some(512),
            preserve_env: Some(true),
            mirror_dirs: Some(vec!["/etc".to_owned(), "/usr".to_owned()]),
            ..EnvironmentSandbox::default()
        };
        let mut merged = CompilationConfig {
            commands: vec![],
            sandbox: Some(base),
        };
        for config in [
            self.default_compilation.as_ref(),
            self.get_language(language)?.compilation.as_ref(),
        ]
        .into_iter()
        .flatten()
        {
            if !config.commands.is_empty() {
                merged.commands = config.commands.clone();
            }
            if let Some(sandbox) = &config.sandbox {
                merged.sandbox = Some(
                    merged
                        .sandbox
                        .as_ref()
                        .map(|base| base.merged_over(sandbox))
                        .unwrap_or_else(|| sandbox.clone()),
                );
            }
        }
        Ok(merged)
    }

    pub fn execution_config(&self, language: &str) -> Result<ExecutionConfig, String> {
        let configs = [
            self.default_execution.clone(),
            Some(self.get_language(language)?.execution.clone()),
        ];
        Ok(merge_execution_configs(configs.iter().flatten()))
    }

    pub fn file_mapping(&self, language: &str) -> Result<FileMapping, String> {
        let mut mapping = FileMapping::default();
        if let Some(defaults) = &self.default_file_mapping {
            mapping = mapping.merged_over(defaults);
        }
        if let Some(overrides) = &self.get_language(language)?.file_mapping {
            mapping = mapping.merged_over(overrides);
        }
        Ok(mapping)
    }
}

pub fn merge_execution_configs<'a>(
    configs: impl Iterator<Item = &'a ExecutionConfig>,
) -> ExecutionConfig {
    let mut merged = ExecutionConfig {
        command: None,
        sandbox: Some(EnvironmentSandbox::default()),
    };
    for config in configs {
        if config.command.is_some() {
            merged.command = config.command.clone();
        }
        if let Some(sandbox) = &config.sandbox {
            merged.sandbox = Some(
                merged
                    .sandbox
                    .as_ref()
                    .map(|base| base.merged_over(sandbox))
                    .unwrap_or_else(|| sandbox.clone()),
            );
        }
    }
    merged
}

///
/// Render an environment sandbox declaration into concrete sandbox params.
///
pub fn sandbox_params_from_config(config: Option<&EnvironmentSandbox>) -> SandboxParams {
    let config = config.cloned().unwrap_or_default();
    let mut params = SandboxParams::new();
    params.timeout = config.time_limit;
    params.wallclock_timeout = config.wall_time_limit;
    params.address_space = config.memory_limit;
    params.stack_space = config.stack_limit;
    params.fsize = config.file_size_limit;
    params.max_processes = config.max_processes;
    if config.preserve_env.unwrap_or(false) {
        params.preserve_env = true;
    }
    for dir in config.mirror_dirs.unwrap_or_default() {
        params.add_mapped_directory(Path::new(&dir));
    }
    params
}

///
/// The built-in environment used when no environment file is configured: C++, Python and
/// POSIX shell under the native sandbox.
///
pub fn default_environment() -> Environment {
    Environment {
        default_file_mapping: None,
        default_compilation: None,
        default_execution: None,
        languages: vec![
            EnvironmentLanguage {
                name: "cpp".to_owned(),
                readable_name: Some("C++".to_owned()),
                extension: "cpp".to_owned(),
                compilation: Some(CompilationConfig {
                    commands: vec![
                        "g++ -std=c++20 -O2 -o {executable} {compilable}".to_owned()
                    ],
                    sandbox: None,
                }),
                execution: ExecutionConfig {
                    command: Some("./{executable}".to_owned()),
                    sandbox: None,
                },
                file_mapping: Some(PartialFileMapping {
                    compilable: Some("compilable.cpp".to_owned()),
                    ..PartialFileMapping::default()
                }),
            },
            EnvironmentLanguage {
                name: "py".to_owned(),
                readable_name: Some("Python".to_owned()),
                extension: "py".to_owned(),
                compilation: None,
                execution: ExecutionConfig {
                    command: Some("python3 {executable}".to_owned()),
                    sandbox: Some(EnvironmentSandbox {
                        preserve_env: Some(true),
                        mirror_dirs: Some(vec!["/etc".to_owned(), "/usr".to_owned()]),
                        ..EnvironmentSandbox::default()
                    }),
                },
                file_mapping: None,
            },
            EnvironmentLanguage {
                name: "sh".to_owned(),
                readable_name: Some("POSIX shell".to_owned()),
                extension: "sh".to_owned(),
                compilation: None,
                execution: ExecutionConfig {
                    command: Some("/bin/sh {executable}".to_owned()),
                    sandbox: None,
                },
                file_mapping: None,
            },
        ],
        sandbox: "stupid".to_owned(),
        extensions: HashMap::new(),
    }
}

///
/// Extension hook: an alternative compiler binary name substituted into compile commands,
/// used on hosts where `g++` is a shim for another toolchain.
///
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompilerExtension {
    pub gpp_alternative: Option<String>,
}

impl Environment {
    pub fn compiler_extension(&self) -> CompilerExtension {
        self.extensions
            .get("compiler")
            .and_then(|value| serde_yaml::from_value(value.clone()).ok())
            .unwrap_or_default()
    }
}
