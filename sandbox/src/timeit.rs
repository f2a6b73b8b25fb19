// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::resource::{getrusage, setrlimit, Resource, Usage, UsageWho};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{setsid, sysconf, Pid, SysconfVar};

use crate::params::MERGE_STDERR;

// Polling starts fine-grained so short-lived commands are reaped promptly, and backs
// off to this ceiling for long-running ones.
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(100);

///
/// Options for one supervised execution. Limits mirror the timeit CLI: seconds for the
/// time limits, KiB for memory and file size.
///
#[derive(Clone, Debug, Default)]
pub struct TimeitOptions {
    pub log_file: PathBuf,
    pub argv: Vec<String>,
    pub chdir: Option<PathBuf>,
    pub stdin_file: Option<PathBuf>,
    pub stdout_file: Option<PathBuf>,
    pub stderr_file: Option<PathBuf>,
    pub time_limit: Option<f64>,
    pub wall_time_limit: Option<f64>,
    pub memory_limit_kib: Option<u64>,
    pub fs_limit_kib: Option<u64>,
    /// Extra environment entries applied on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

impl TimeitOptions {
    ///
    /// Parse the wrapper CLI: `<log_path> [-t<cpu_s>] [-w<wall_s>] [-m<mem_mib>]
    /// [-i<stdin>] [-o<stdout>] [-e<stderr>] [-c<chdir>] [-f<fsize_kib>] -- argv...`.
    ///
    pub fn from_args(args: &[String]) -> Result<TimeitOptions, String> {
        let mut iter = args.iter();
        let log_file = PathBuf::from(
            iter.next()
                .ok_or_else(|| "Missing log file argument".to_owned())?,
        );
        let mut options = TimeitOptions {
            log_file,
            ..TimeitOptions::default()
        };

        let rest: Vec<&String> = iter.collect();
        let mut i = 0;
        while i < rest.len() && rest[i].starts_with('-') && rest[i] != "--" {
            let opt = rest[i].as_str();
            let value = &opt[2..];
            match &opt[..2] {
                "-t" => {
                    options.time_limit =
                        Some(value.parse().map_err(|e| format!("Invalid -t: {e}"))?)
                }
                "-w" => {
                    options.wall_time_limit =
                        Some(value.parse().map_err(|e| format!("Invalid -w: {e}"))?)
                }
                "-m" => {
                    let mib: u64 = value.parse().map_err(|e| format!("Invalid -m: {e}"))?;
                    options.memory_limit_kib = Some(mib * 1024);
                }
                "-i" => options.stdin_file = Some(PathBuf::from(value)),
                "-o" => options.stdout_file = Some(PathBuf::from(value)),
                "-e" => options.stderr_file = Some(PathBuf::from(value)),
                "-c" => options.chdir = Some(PathBuf::from(value)),
                "-f" => {
                    options.fs_limit_kib =
                        Some(value.parse().map_err(|e| format!("Invalid -f: {e}"))?)
                }
                _ => return Err(format!("Invalid option {opt}")),
            }
            i += 1;
        }
        if i < rest.len() && rest[i] == "--" {
            i += 1;
        }
        options.argv = rest[i..].iter().map(|s| (*s).clone()).collect();
        if options.argv.is_empty() {
            return Err("Missing command to execute".to_owned());
        }
        Ok(options)
    }

    ///
    /// Render the option flags back into CLI form.
    ///
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(t) = self.time_limit {
            args.push(format!("-t{t:.3}"));
        }
        if let Some(w) = self.wall_time_limit {
            args.push(format!("-w{w:.3}"));
        }
        if let Some(m) = self.memory_limit_kib {
            args.push(format!("-m{}", m / 1024));
        }
        if let Some(p) = &self.stdin_file {
            args.push(format!("-i{}", p.display()));
        }
        if let Some(p) = &self.stdout_file {
            args.push(format!("-o{}", p.display()));
        }
        if let Some(p) = &self.stderr_file {
            args.push(format!("-e{}", p.display()));
        }
        if let Some(f) = self.fs_limit_kib {
            args.push(format!("-f{f}"));
        }
        if let Some(c) = &self.chdir {
            args.push(format!("-c{}", c.display()));
        }
        args
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match (&self.chdir, path.is_relative()) {
            (Some(dir), true) => dir.join(path),
            _ => path.to_owned(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SuperviseReport {
    /// Whether a CPU or wall timeout was flagged.
    pub timed_out: bool,
}

/// Total CPU time (user + system) recorded in a rusage snapshot, in seconds.
fn usage_cpu_seconds(usage: &Usage) -> f64 {
    let user = usage.user_time();
    let system = usage.system_time();
    (user.tv_sec() + system.tv_sec()) as f64 + (user.tv_usec() + system.tv_usec()) as f64 / 1e6
}

fn to_io_error(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

/// Cumulative CPU time (user + system) of a live process, in seconds.
fn proc_cpu_time(pid: Pid) -> Option<f64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The comm field may contain spaces; skip past its closing paren.
    let rest = stat.get(stat.rfind(')')? + 2..)?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let ticks = sysconf(SysconfVar::CLK_TCK).ok().flatten()?;
    if ticks <= 0 {
        return None;
    }
    Some((utime + stime) as f64 / ticks as f64)
}

/// Peak RSS of a live process, in KiB.
fn proc_peak_rss_kib(pid: Pid) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmHWM:") {
            return rest.trim().trim_end_matches("kB").trim().parse().ok();
        }
    }
    None
}

fn file_size(path: Option<&PathBuf>) -> u64 {
    path.and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0)
}

fn kill_group(pid: Pid) {
    // The child runs in its own process group; the negative pgid signals the whole tree.
    let _ = kill(Pid::from_raw(-pid.as_raw()), Signal::SIGKILL);
}

///
/// Run the command to completion under the declared limits and write the structured meta
/// log. The Err branch is reserved for failures of the supervisor itself; the supervised
/// command failing in any way is a normal result recorded in the log.
///
pub fn supervise(options: &TimeitOptions) -> Result<SuperviseReport, String> {
    let stdin_path = options.stdin_file.as_ref().map(|p| options.resolve(p));
    let stdout_path = options
        .stdout_file
        .as_ref()
        .map(|p| options.resolve(p));
    let stderr_path = match &options.stderr_file {
        Some(p) if p == Path::new(MERGE_STDERR) => None,
        Some(p) => Some(options.resolve(p)),
        None => None,
    };
    let merge_stderr = options
        .stderr_file
        .as_ref()
        .map(|p| p == Path::new(MERGE_STDERR))
        .unwrap_or(false);

    let mut command = Command::new(&options.argv[0]);
    command.args(&options.argv[1..]);
    if let Some(dir) = &options.chdir {
        command.current_dir(dir);
    }
    command.envs(options.env.iter().map(|(k, v)| (k.clone(), v.clone())));

    match &stdin_path {
        Some(path) => {
            let file = std::fs::File::open(path)
                .map_err(|e| format!("Failed to open stdin file {}: {e}", path.display()))?;
            command.stdin(Stdio::from(file));
        }
        None => {
            command.stdin(Stdio::null());
        }
    }
    let stdout_handle = match &stdout_path {
        Some(path) => {
            let file = std::fs::File::create(path)
                .map_err(|e| format!("Failed to open stdout file {}: {e}", path.display()))?;
            let handle = file
                .try_clone()
                .map_err(|e| format!("Failed to clone stdout handle: {e}"))?;
            command.stdout(Stdio::from(file));
            Some(handle)
        }
        None => {
            command.stdout(Stdio::null());
            None
        }
    };
    if merge_stderr {
        match stdout_handle {
            Some(handle) => {
                command.stderr(Stdio::from(handle));
            }
            None => {
                command.stderr(Stdio::null());
            }
        }
    } else {
        match &stderr_path {
            Some(path) => {
                let file = std::fs::File::create(path)
                    .map_err(|e| format!("Failed to open stderr file {}: {e}", path.display()))?;
                command.stderr(Stdio::from(file));
            }
            None => {
                command.stderr(Stdio::null());
            }
        }
    }

    let time_limit = options.time_limit;
    let fs_limit_kib = options.fs_limit_kib;
    unsafe {
        command.pre_exec(move || {
            // Own process group, so the supervisor can kill the whole tree.
            setsid().map_err(to_io_error)?;
            if let Some(tl) = time_limit {
                let secs = ((tl * 1000.0) as u64 + 999) / 1000;
                setrlimit(Resource::RLIMIT_CPU, secs, secs + 1).map_err(to_io_error)?;
            }
            if let Some(kib) = fs_limit_kib {
                let bytes = kib * 1024;
                setrlimit(Resource::RLIMIT_FSIZE, bytes + 1, bytes * 2)
                    .map_err(to_io_error)?;
            }
            Ok(())
        });
    }

    // Children usage accumulates only as children are reaped, so the delta across this
    // run's wait covers exactly this child.
    let usage_before = getrusage(UsageWho::RUSAGE_CHILDREN)
        .map_err(|e| format!("Failed to read resource usage: {e}"))?;

    let start = Instant::now();
    let child = command
        .spawn()
        .map_err(|e| format!("Failed to spawn {:?}: {e}", options.argv))?;
    let pid = Pid::from_raw(child.id() as i32);

    let mut alarm_msg: Option<&'static str> = None;
    let mut peak_rss_kib: Option<u64> = None;
    let mut poll_interval = Duration::from_millis(1);
    let wait_status = loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => break status,
            // Stop/continue notifications are not requested and not terminal.
            Ok(_) => {}
            Err(e) => return Err(format!("Failed to wait for child: {e}")),
        }

        if let Some(rss) = proc_peak_rss_kib(pid) {
            peak_rss_kib = Some(peak_rss_kib.unwrap_or(0).max(rss));
        }

        if alarm_msg.is_none() {
            let wall = start.elapsed().as_secs_f64();
            if let Some(wl) = options.wall_time_limit {
                if wall > wl {
                    alarm_msg = Some("wall timelimit");
                    kill_group(pid);
                }
            }
            if alarm_msg.is_none() {
                if let (Some(tl), Some(cpu)) = (options.time_limit, proc_cpu_time(pid)) {
                    if cpu > tl {
                        alarm_msg = Some("timelimit");
                        kill_group(pid);
                    }
                }
            }
            if alarm_msg.is_none() {
                if let (Some(ml), Some(rss)) = (options.memory_limit_kib, peak_rss_kib) {
                    if rss > ml {
                        alarm_msg = Some("memorylimit");
                        kill_group(pid);
                    }
                }
            }
        }
        std::thread::sleep(poll_interval);
        poll_interval = std::cmp::min(poll_interval * 2, MAX_POLL_INTERVAL);
    };

    let usage_after = getrusage(UsageWho::RUSAGE_CHILDREN)
        .map_err(|e| format!("Failed to read resource usage: {e}"))?;

    let wall_time = start.elapsed().as_secs_f64();
    let mut cpu_time =
        (usage_cpu_seconds(&usage_after) - usage_cpu_seconds(&usage_before)).max(0.0);
    // Peak RSS comes from the supervisor's own polling; a child that exits before the
    // first poll falls back to the reaped-children high-water mark (KiB on Linux).
    let memory_kib = peak_rss_kib.unwrap_or(usage_after.max_rss() as u64);

    let exitcode = match wait_status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => -(signal as i32),
        _ => -1,
    };

    let file_sizes = file_size(stdout_path.as_ref()) + file_size(stderr_path.as_ref());

    let mut statuses: Vec<&str> = Vec::new();
    let push_status = |statuses: &mut Vec<&str>, s: &'static str| {
        if !statuses.contains(&s) {
            statuses.push(s);
        }
    };

    if exitcode > 0 {
        push_status(&mut statuses, "RE");
    }
    if exitcode < 0 {
        push_status(&mut statuses, "SG");
    }
    if let Some(tl) = options.time_limit {
        if cpu_time > tl || -exitcode == Signal::SIGXCPU as i32 || alarm_msg == Some("timelimit") {
            push_status(&mut statuses, "TO");
            cpu_time = cpu_time.max(tl);
        }
    }
    if let Some(wl) = options.wall_time_limit {
        if wall_time > wl || alarm_msg == Some("wall timelimit") {
            push_status(&mut statuses, "WT");
            push_status(&mut statuses, "TO");
        }
    }
    if let Some(ml) = options.memory_limit_kib {
        if memory_kib > ml || alarm_msg == Some("memorylimit") {
            push_status(&mut statuses, "ML");
        }
    }
    if let Some(fl) = options.fs_limit_kib {
        if file_sizes > fl * 1024 {
            push_status(&mut statuses, "OL");
        }
    }

    let mut entries = Vec::new();
    entries.push(format!("exit-code: {exitcode}"));
    if exitcode < 0 {
        entries.push(format!("exit-sig: {}", -exitcode));
    }
    if !statuses.is_empty() {
        entries.push(format!("status: {}", statuses.join(",")));
    }
    if let Some(msg) = alarm_msg {
        entries.push(format!("alarm-msg: {msg}"));
    }
    entries.push(format!("time: {cpu_time:.3}"));
    entries.push(format!("time-wall: {wall_time:.3}"));
    entries.push(format!("mem: {memory_kib}"));
    entries.push(format!("file: {file_sizes}"));

    if let Some(parent) = options.log_file.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create log directory: {e}"))?;
    }
    std::fs::write(&options.log_file, entries.join("\n") + "\n")
        .map_err(|e| format!("Failed to write log file: {e}"))?;

    Ok(SuperviseReport {
        timed_out: statuses.contains(&"TO") || statuses.contains(&"WT"),
    })
}
