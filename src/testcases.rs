// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::path::PathBuf;

use crate::package::Context;
use crate::schema::{Testcase, TestcaseGroup};

///
/// The inputs previously built for a group, in ascending file-name order (which is the
/// order they were generated in).
///
pub fn find_built_testcase_inputs(ctx: &Context, group: &TestcaseGroup) -> Vec<PathBuf> {
    let group_path = ctx.build_testgroup_path(group.name());
    let Ok(entries) = std::fs::read_dir(&group_path) else {
        return vec![];
    };
    let mut inputs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().map(|e| e == "in").unwrap_or(false))
        .collect();
    inputs.sort();
    inputs
}

///
/// The built testcases of a group, pairing every input with its reference-output path
/// (which may not exist yet before output generation).
///
pub fn find_built_testcases(ctx: &Context, group: &TestcaseGroup) -> Vec<Testcase> {
    find_built_testcase_inputs(ctx, group)
        .into_iter()
        .map(|input_path| {
            let output_path = input_path.with_extension("out");
            Testcase {
                input_path,
                output_path: Some(output_path),
            }
        })
        .collect()
}

///
/// Remove previously built testcases, so deleted groups do not leave stale files behind.
///
pub fn clear_built_testcases(ctx: &Context) -> Result<(), String> {
    let tests_dir = ctx.build_tests_dir();
    if tests_dir.exists() {
        std::fs::remove_dir_all(&tests_dir)
            .map_err(|e| format!("Failed to clear {}: {e}", tests_dir.display()))?;
    }
    std::fs::create_dir_all(&tests_dir)
        .map_err(|e| format!("Failed to create {}: {e}", tests_dir.display()))?;
    Ok(())
}
