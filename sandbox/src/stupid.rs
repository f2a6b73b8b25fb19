// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use storage::FileCacher;

use crate::params::SandboxParams;
use crate::status::{ExitStatus, MetaLog};
use crate::timeit::{supervise, TimeitOptions};

///
/// The native subprocess sandbox. It has very few isolation features and is not secure
/// against box escaping, but it is portable and has no external dependencies, which makes
/// it the right default for an authoring workstation.
///
/// Every execution runs under the in-process timeit supervisor and leaves a `logs.<n>`
/// meta file in the box directory.
///
pub struct StupidSandbox {
    pub(crate) file_cacher: Arc<FileCacher>,
    pub(crate) name: String,
    pub(crate) params: SandboxParams,
    path: PathBuf,
    exec_num: i64,
    returncode: Option<i32>,
    log: Option<MetaLog>,
}

impl StupidSandbox {
    pub fn new(
        file_cacher: Arc<FileCacher>,
        name: Option<&str>,
        temp_dir: Option<&Path>,
        params: Option<SandboxParams>,
    ) -> Result<StupidSandbox, String> {
        let name = name.unwrap_or("unnamed").to_owned();
        let temp_dir = temp_dir
            .map(Path::to_owned)
            .unwrap_or_else(std::env::temp_dir);
        let path = tempfile::Builder::new()
            .prefix(&format!("casebox-{name}-"))
            .tempdir_in(&temp_dir)
            .map_err(|e| format!("Failed to create sandbox directory: {e}"))?
            .keep();
        debug!("Sandbox in `{}' created, using stupid box.", path.display());

        let mut params = params.unwrap_or_default();
        // Needed by interpreters that search the home for packages.
        params
            .set_env
            .entry("HOME".to_owned())
            .or_insert_with(|| "./".to_owned());

        Ok(StupidSandbox {
            file_cacher,
            name,
            params,
            path,
            exec_num: -1,
            returncode: None,
            log: None,
        })
    }

    pub fn get_root_path(&self) -> &Path {
        &self.path
    }

    fn current_log_name(&self) -> PathBuf {
        PathBuf::from(format!("logs.{}", self.exec_num))
    }

    fn timeit_options(&self, command: &[String]) -> TimeitOptions {
        let mut options = TimeitOptions {
            log_file: self.path.join(self.current_log_name()),
            argv: command.to_vec(),
            chdir: Some(self.path.clone()),
            stdin_file: self.params.stdin_file.clone(),
            stdout_file: self.params.stdout_file.clone(),
            stderr_file: self.params.stderr_file.clone(),
            time_limit: None,
            wall_time_limit: None,
            memory_limit_kib: self.params.address_space.map(|mib| mib * 1024),
            fs_limit_kib: self.params.fsize,
            env: self
                .params
                .set_env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        if let Some(timeout) = self.params.timeout {
            let mut timeout_s = timeout as f64 / 1000.0;
            if let Some(extra) = self.params.extra_timeout {
                timeout_s += extra as f64 / 1000.0;
            }
            options.time_limit = Some(timeout_s);
        }
        if let Some(wall) = self.params.wallclock_timeout {
            options.wall_time_limit = Some(wall as f64 / 1000.0);
        }
        options
    }

    pub fn use_soft_timeout(&self) -> bool {
        true
    }

    pub async fn execute_without_std(&mut self, command: &[String]) -> bool {
        self.exec_num += 1;

        debug!(
            "Executing program in sandbox with command: `{}'.",
            command.join(" ")
        );
        let cmd_log = self.path.join("commands.log");
        let mut existing = tokio::fs::read_to_string(&cmd_log).await.unwrap_or_default();
        existing.push_str(&command.join(" "));
        existing.push('\n');
        let _ = tokio::fs::write(&cmd_log, existing).await;

        let options = self.timeit_options(command);
        let result = tokio::task::spawn_blocking(move || supervise(&options))
            .await
            .map_err(|e| format!("Supervisor task failed: {e}"))
            .and_then(|r| r);

        self.returncode = match &result {
            Ok(_) => Some(0),
            Err(err) => {
                warn!("Sandbox error while executing command: {err}");
                Some(2)
            }
        };
        self.hydrate_logs().await;
        self.translate_box_exitcode()
    }

    fn translate_box_exitcode(&self) -> bool {
        self.returncode == Some(0)
    }

    pub async fn hydrate_logs(&mut self) {
        self.log = None;
        let log_path = self.path.join(self.current_log_name());
        if let Ok(raw) = tokio::fs::read_to_string(&log_path).await {
            self.log = Some(MetaLog::parse(&raw));
        }
    }

    pub fn get_execution_time(&self) -> Option<f64> {
        self.log.as_ref().and_then(|log| log.get_f64("time"))
    }

    pub fn get_execution_wall_clock_time(&self) -> Option<f64> {
        self.log.as_ref().and_then(|log| log.get_f64("time-wall"))
    }

    pub fn get_memory_used(&self) -> Option<u64> {
        self.log
            .as_ref()
            .and_then(|log| log.get_i64("mem"))
            .map(|kib| kib as u64 * 1024)
    }

    pub fn get_killing_signal(&self) -> i32 {
        self.log
            .as_ref()
            .and_then(|log| log.get_i64("exit-sig"))
            .unwrap_or(0) as i32
    }

    pub fn get_exit_code(&self) -> i32 {
        self.log
            .as_ref()
            .and_then(|log| log.get_i64("exit-code"))
            .unwrap_or(0) as i32
    }

    pub fn get_exit_status(&self) -> ExitStatus {
        if self.returncode != Some(0) {
            return ExitStatus::SandboxError;
        }
        match &self.log {
            Some(log) => log.exit_status(),
            None => ExitStatus::SandboxError,
        }
    }

    pub fn debug_message(&self) -> String {
        format!(
            "returncode = {:?}\nlogs = {:?}\ntimeit_args = {:?}",
            self.returncode,
            self.log,
            self.timeit_options(&[]).to_args(),
        )
    }

    pub fn initialize(&mut self) -> Result<(), String> {
        std::fs::create_dir_all(&self.path)
            .map_err(|e| format!("Failed to create sandbox directory: {e}"))
    }

    pub fn cleanup(&mut self, delete: bool) {
        // This sandbox has no kernel state to release; deletion is the only cleanup.
        if delete {
            debug!("Deleting sandbox in {}.", self.path.display());
            if let Err(err) = std::fs::remove_dir_all(&self.path) {
                warn!(
                    "Failed to delete sandbox {} ({err}); leaving it for later collection.",
                    self.path.display()
                );
            }
        }
    }
}

impl std::fmt::Debug for StupidSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StupidSandbox")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
