// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use storage::FileCacher;

use crate::params::SandboxParams;
use crate::status::{ExitStatus, MetaLog};

static NEXT_BOX_ID: AtomicU32 = AtomicU32::new(0);

/// Commands that run outside the isolator, with the home directory temporarily unlocked.
/// They are internal setup steps that must create files owned by our user; their output
/// is cleared afterwards so nothing leaks into captured streams.
const SECURE_COMMANDS: &[&str] = &[
    "/bin/cp",
    "/bin/mv",
    "/usr/bin/cp",
    "/usr/bin/mv",
    "/usr/bin/zip",
    "/usr/bin/unzip",
];

///
/// A sandbox delegating to an external `isolate` binary, which provides filesystem
/// namespacing and cgroup-based accounting. Parameters are rendered to its CLI and its
/// meta file is parsed for the structured exit information.
///
/// The `home` directory inside the outer temporary directory is bind-mounted to `/tmp`
/// inside the box; file staging targets it directly.
///
pub struct IsolateSandbox {
    pub(crate) file_cacher: Arc<FileCacher>,
    pub(crate) name: String,
    pub(crate) params: SandboxParams,
    box_id: u32,
    outer_dir: PathBuf,
    home: PathBuf,
    home_dest: PathBuf,
    box_exec: PathBuf,
    info_basename: PathBuf,
    exec_num: i64,
    returncode: Option<i32>,
    log: Option<MetaLog>,
}

impl IsolateSandbox {
    pub fn new(
        file_cacher: Arc<FileCacher>,
        name: Option<&str>,
        temp_dir: Option<&Path>,
        params: Option<SandboxParams>,
    ) -> Result<IsolateSandbox, String> {
        let name = name.unwrap_or("unnamed").to_owned();
        let temp_dir = temp_dir
            .map(Path::to_owned)
            .unwrap_or_else(std::env::temp_dir);
        let outer_dir = tempfile::Builder::new()
            .prefix(&format!("casebox-{name}-"))
            .tempdir_in(&temp_dir)
            .map_err(|e| format!("Failed to create sandbox directory: {e}"))?
            .keep();
        let home = outer_dir.join("home");
        std::fs::create_dir_all(&home)
            .map_err(|e| format!("Failed to create sandbox home: {e}"))?;

        let box_id = NEXT_BOX_ID.fetch_add(1, Ordering::SeqCst) % 10;
        let box_exec = detect_box_executable();
        debug!(
            "Sandbox in `{}' created, using box `{}'.",
            home.display(),
            box_exec.display()
        );

        let info_basename = outer_dir.join("run.log");
        let mut sandbox = IsolateSandbox {
            file_cacher,
            name,
            params: SandboxParams::default(),
            box_id,
            outer_dir,
            home,
            home_dest: PathBuf::from("/tmp"),
            box_exec,
            info_basename,
            exec_num: -1,
            returncode: None,
            log: None,
        };
        sandbox.set_params(params.unwrap_or_default());
        Ok(sandbox)
    }

    pub fn set_params(&mut self, params: SandboxParams) {
        self.params = params;
        // The home directory is always visible read-write inside the box.
        self.params.dirs.push(crate::params::DirectoryMount {
            src: self.home.clone(),
            dst: self.home_dest.clone(),
            options: Some("rw".to_owned()),
        });
        self.params
            .set_env
            .insert("HOME".to_owned(), self.home_dest.display().to_string());
    }

    pub fn get_root_path(&self) -> &Path {
        &self.outer_dir
    }

    /// Staged files live under the home directory, which the box sees as `/tmp`.
    pub fn relative_path(&self, path: &Path) -> PathBuf {
        self.home.join(path)
    }

    pub fn inner_absolute_path(&self, path: &Path) -> PathBuf {
        self.home_dest.join(path)
    }

    pub fn use_soft_timeout(&self) -> bool {
        true
    }

    fn meta_file(&self) -> PathBuf {
        PathBuf::from(format!(
            "{}.{}",
            self.info_basename.display(),
            self.exec_num
        ))
    }

    fn build_box_options(&self) -> Vec<String> {
        let mut res = vec![format!("--box-id={}", self.box_id)];
        if self.params.cgroup {
            res.push("--cg".to_owned());
        }
        res.push(format!("--chdir={}", self.home_dest.display()));
        for mount in &self.params.dirs {
            let mut spec = if mount.src == mount.dst {
                mount.src.display().to_string()
            } else {
                format!("{}={}", mount.dst.display(), mount.src.display())
            };
            if let Some(options) = &mount.options {
                spec = format!("{spec}:{options}");
            }
            res.push(format!("--dir={spec}"));
        }
        if self.params.preserve_env {
            res.push("--full-env".to_owned());
        }
        for var in &self.params.inherit_env {
            res.push(format!("--env={var}"));
        }
        for (var, value) in &self.params.set_env {
            res.push(format!("--env={var}={value}"));
        }
        if let Some(fsize) = self.params.fsize {
            res.push(format!("--fsize={fsize}"));
        }
        if let Some(stdin) = &self.params.stdin_file {
            res.push(format!("--stdin={}", stdin.display()));
        }
        if let Some(stack) = self.params.stack_space {
            res.push(format!("--stack={}", stack * 1024));
        }
        if let Some(address_space) = self.params.address_space {
            let kib = address_space * 1024;
            if self.params.cgroup {
                res.push(format!("--cg-mem={kib}"));
            } else {
                res.push(format!("--mem={kib}"));
            }
        }
        if let Some(stdout) = &self.params.stdout_file {
            res.push(format!("--stdout={}", stdout.display()));
        }
        match self.params.max_processes {
            Some(max_processes) => res.push(format!("--processes={max_processes}")),
            None => res.push("--processes".to_owned()),
        }
        if let Some(stderr) = &self.params.stderr_file {
            res.push(format!("--stderr={}", stderr.display()));
        }
        if let Some(timeout) = self.params.timeout {
            res.push(format!("--time={}", timeout as f64 / 1000.0));
        }
        if let Some(wallclock_timeout) = self.params.wallclock_timeout {
            res.push(format!("--wall-time={}", wallclock_timeout as f64 / 1000.0));
        }
        if let Some(extra_timeout) = self.params.extra_timeout {
            res.push(format!("--extra-time={}", extra_timeout as f64 / 1000.0));
        }
        res.push(format!("--meta={}", self.meta_file().display()));
        res.push("--run".to_owned());
        res
    }

    async fn append_command_log(&self, line: &str) {
        let cmd_log = self.outer_dir.join("commands.log");
        let mut existing = tokio::fs::read_to_string(&cmd_log).await.unwrap_or_default();
        existing.push_str(line);
        existing.push('\n');
        let _ = tokio::fs::write(&cmd_log, existing).await;
    }

    fn home_mode(&self) -> u32 {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(&self.home)
            .map(|m| m.permissions().mode() & 0o777)
            .unwrap_or(0o700)
    }

    fn chmod_home(&self, mode: u32) {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&self.home, std::fs::Permissions::from_mode(mode));
    }

    async fn write_empty_run_log(&self) -> Result<(), String> {
        tokio::fs::write(
            self.meta_file(),
            "time:0.000\ntime-wall:0.000\nmax-rss:0\ncg-mem:0\n",
        )
        .await
        .map_err(|e| format!("Failed to write run log: {e}"))
    }

    ///
    /// Run a whitelisted setup command outside the isolator, with the home directory
    /// temporarily unlocked to 0700 and command output cleared afterwards.
    ///
    async fn execute_secure(&mut self, command: &[String]) -> bool {
        debug!(
            "Executing non-securely: {command:?} at {}",
            self.home.display()
        );
        let prev_mode = self.home_mode();
        self.chmod_home(0o700);
        self.append_command_log(&command.join(" ")).await;

        let status = tokio::process::Command::new(&command[0])
            .args(&command[1..])
            .current_dir(&self.home)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        self.chmod_home(prev_mode);

        // Secure commands are setup steps; clear their output so nothing is forwarded.
        if let Some(stdout_file) = &self.params.stdout_file {
            let _ = tokio::fs::write(self.home.join(stdout_file), b"").await;
        }
        if let Some(stderr_file) = &self.params.stderr_file {
            let _ = tokio::fs::write(self.home.join(stderr_file), b"").await;
        }
        if let Err(err) = self.write_empty_run_log().await {
            warn!("{err}");
        }

        match status {
            Ok(status) => {
                self.returncode = Some(status.code().unwrap_or(2));
                self.hydrate_logs().await;
                true
            }
            Err(err) => {
                warn!("Failed to execute secure command {command:?}: {err}");
                self.returncode = Some(2);
                false
            }
        }
    }

    pub async fn execute_without_std(&mut self, command: &[String]) -> bool {
        self.log = None;
        self.exec_num += 1;

        if SECURE_COMMANDS.contains(&command[0].as_str()) {
            return self.execute_secure(command).await;
        }

        let mut args = self.build_box_options();
        args.push("--".to_owned());
        args.extend(command.iter().cloned());
        debug!(
            "Executing program in sandbox with command: `{} {}'.",
            self.box_exec.display(),
            args.join(" ")
        );

        let prev_mode = self.home_mode();
        self.chmod_home(0o700);
        self.append_command_log(&format!("{} {}", self.box_exec.display(), args.join(" ")))
            .await;
        self.chmod_home(prev_mode);

        let output = tokio::process::Command::new(&self.box_exec)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        let ok = match output {
            Ok(status) => {
                let code = status.code().unwrap_or(2);
                self.returncode = Some(code);
                self.translate_box_exitcode(code)
            }
            Err(err) => {
                warn!("Failed to execute program in sandbox: {err}");
                self.returncode = Some(2);
                false
            }
        };
        self.hydrate_logs().await;
        ok
    }

    ///
    /// The isolator exits 0 when both it and the command succeeded, 1 when the command
    /// was terminated (timeout, signal, nonzero), and 2 on an internal error. The first
    /// two are successful executions from the sandbox's point of view.
    ///
    fn translate_box_exitcode(&self, exitcode: i32) -> bool {
        matches!(exitcode, 0 | 1)
    }

    pub async fn hydrate_logs(&mut self) {
        self.log = None;
        if let Ok(raw) = tokio::fs::read_to_string(self.meta_file()).await {
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
        let log = self.log.as_ref()?;
        // Both counters are reported in KiB.
        let kib = log.get_i64("cg-mem").or_else(|| log.get_i64("max-rss"))?;
        Some(kib as u64 * 1024)
    }

    pub fn get_killing_signal(&self) -> i32 {
        self.log
            .as_ref()
            .and_then(|log| log.get_i64("exitsig"))
            .unwrap_or(0) as i32
    }

    pub fn get_exit_code(&self) -> i32 {
        self.log
            .as_ref()
            .and_then(|log| log.get_i64("exitcode"))
            .unwrap_or(0) as i32
    }

    pub fn get_exit_status(&self) -> ExitStatus {
        let Some(log) = &self.log else {
            return ExitStatus::SandboxError;
        };
        let statuses = log.get_all("status");
        let has = |s: &str| statuses.iter().any(|v| v == s);
        if has("XX") {
            ExitStatus::SandboxError
        } else if has("TO") {
            if log.get("message").is_some_and(|m| m.contains("wall")) {
                ExitStatus::WallTimeout
            } else {
                ExitStatus::Timeout
            }
        } else if log.get_i64("cg-oom-killed").unwrap_or(0) > 0 {
            ExitStatus::MemoryLimitExceeded
        } else if has("SG") {
            ExitStatus::Signal
        } else if has("RE") {
            ExitStatus::NonzeroReturn
        } else {
            // An OK status is implicit; the isolator does not report it.
            ExitStatus::Ok
        }
    }

    pub fn debug_message(&self) -> String {
        format!(
            "returncode = {:?}\nlogs = {:?}\nbox options = {:?}",
            self.returncode,
            self.log,
            self.build_box_options(),
        )
    }

    fn base_command(&self) -> Vec<String> {
        let mut cmd = vec![self.box_exec.display().to_string()];
        if self.params.cgroup {
            cmd.push("--cg".to_owned());
        }
        cmd.push(format!("--box-id={}", self.box_id));
        cmd
    }

    pub async fn initialize(&mut self) -> Result<(), String> {
        let mut cmd = self.base_command();
        cmd.push("--init".to_owned());
        let status = tokio::process::Command::new(&cmd[0])
            .args(&cmd[1..])
            .stdout(Stdio::null())
            .status()
            .await
            .map_err(|e| format!("Failed to run isolate --init: {e}"))?;
        if !status.success() {
            return Err(format!("Failed to initialize sandbox: {status}"));
        }
        Ok(())
    }

    pub async fn cleanup(&mut self, delete: bool) {
        let base = self.base_command();

        if delete {
            // Files created inside the box may be owned by the sandbox user; chmod from
            // within so the outer user can remove the whole tree afterwards.
            let mut cmd = base.clone();
            cmd.extend([
                format!("--dir={}={}:rw", self.home_dest.display(), self.home.display()),
                "--run".to_owned(),
                "--".to_owned(),
                "/bin/chmod".to_owned(),
                "777".to_owned(),
                "-R".to_owned(),
                self.home_dest.display().to_string(),
            ]);
            let _ = tokio::process::Command::new(&cmd[0])
                .args(&cmd[1..])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
        }

        let mut cmd = base;
        cmd.push("--cleanup".to_owned());
        if let Err(err) = tokio::process::Command::new(&cmd[0])
            .args(&cmd[1..])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            warn!("Failed to run isolate --cleanup: {err}");
        }

        if delete {
            if let Err(err) = tokio::fs::remove_dir_all(&self.outer_dir).await {
                warn!(
                    "Failed to delete sandbox {} ({err}); leaving it for later collection.",
                    self.outer_dir.display()
                );
            }
        }
    }
}

///
/// Look for an isolate executable: first next to the working directory, then in the
/// conventional prefix, then fall back to PATH resolution.
///
fn detect_box_executable() -> PathBuf {
    let candidates = [
        PathBuf::from("./isolate/isolate"),
        PathBuf::from("./isolate"),
        PathBuf::from("/usr/local/bin/isolate"),
    ];
    for path in candidates {
        if path.is_file() {
            return path;
        }
    }
    PathBuf::from("isolate")
}

impl std::fmt::Debug for IsolateSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolateSandbox")
            .field("name", &self.name)
            .field("box_id", &self.box_id)
            .field("outer_dir", &self.outer_dir)
            .finish_non_exhaustive()
    }
}
