// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use sandbox::timeit::{supervise, TimeitOptions};

/// Thin CLI over the supervision routine:
/// `timeit <log_path> [-t<cpu_s>] [-w<wall_s>] [-m<mem_mib>] [-i<stdin>] [-o<stdout>]
///  [-e<stderr>] [-c<chdir>] [-f<fsize_kib>] -- argv...`
///
/// Exits 0 when the command ran to completion (regardless of its own exit code), 1 when
/// a timeout class fired, and 2 on a sandbox error.
fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = match TimeitOptions::from_args(&args) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("timeit: {err}");
            std::process::exit(2);
        }
    };
    match supervise(&options) {
        Ok(report) => std::process::exit(i32::from(report.timed_out)),
        Err(err) => {
            eprintln!("timeit: {err}");
            std::process::exit(2);
        }
    }
}
