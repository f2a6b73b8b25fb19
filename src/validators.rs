// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use grading::{DigestHolder, DigestOrDest, DigestOrSource, GradingFileOutput};
use log::info;

use crate::code::{compile_item, run_item};
use crate::package::Context;
use crate::schema::CodeItem;
use crate::testcases::find_built_testcase_inputs;

/// Per-variable (min-value-hit, max-value-hit) coverage flags collected from the
/// validator's overview log.
pub type HitBounds = BTreeMap<String, (bool, bool)>;

#[derive(Clone, Debug)]
pub struct TestcaseValidationInfo {
    pub group: String,
    pub path: PathBuf,
    pub ok: bool,
    pub hit_bounds: HitBounds,
    pub message: Option<String>,
}

fn bounds_or(lhs: (bool, bool), rhs: (bool, bool)) -> (bool, bool) {
    (lhs.0 || rhs.0, lhs.1 || rhs.1)
}

///
/// Parse the testOverview log: one `"var": markers` line per checked field.
///
fn process_bounds(log: &str) -> HitBounds {
    let mut bounds = HitBounds::new();
    for line in log.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().trim_matches('"');
        let hit = (
            value.contains("min-value-hit"),
            value.contains("max-value-hit"),
        );
        bounds
            .entry(key.to_owned())
            .and_modify(|existing| *existing = bounds_or(*existing, hit))
            .or_insert(hit);
    }
    bounds
}

async fn compile_validator(ctx: &mut Context, validator: &CodeItem) -> Result<String, String> {
    compile_item(ctx, validator)
        .await
        .map_err(|e| format!("Failed compiling validator {}: {e}", validator.path.display()))
}

///
/// The package-level validator, compiled, when one is configured.
///
pub async fn compile_main_validator(
    ctx: &mut Context,
) -> Result<Option<(CodeItem, String)>, String> {
    let Some(validator) = ctx.pkg.validator.clone() else {
        return Ok(None);
    };
    let digest = compile_validator(ctx, &validator).await?;
    Ok(Some((validator, digest)))
}

///
/// Compile the validator of every group that has one (group-specific or the package
/// default), keyed by group name.
///
pub async fn compile_validators(ctx: &mut Context) -> Result<HashMap<String, String>, String> {
    let groups: Vec<(String, CodeItem)> = ctx
        .pkg
        .testcases
        .iter()
        .filter_map(|group| {
            group
                .validator
                .clone()
                .or_else(|| ctx.pkg.validator.clone())
                .map(|validator| (group.name().to_owned(), validator))
        })
        .collect();

    let mut compiled = HashMap::new();
    for (group_name, validator) in groups {
        info!("Compiling validator for group {group_name}...");
        let digest = compile_validator(ctx, &validator).await?;
        compiled.insert(group_name, digest);
    }
    Ok(compiled)
}

///
/// Run a validator over one input: the testcase is fed on stdin, package variables are
/// passed as `--key=value` flags, and the overview log is collected for bounds coverage.
///
pub async fn validate_test(
    ctx: &mut Context,
    testcase: &Path,
    validator: &CodeItem,
    validator_digest: &str,
) -> Result<(bool, Option<String>, HitBounds), String> {
    let mut var_args: Vec<String> = ctx
        .pkg
        .expanded_vars()
        .iter()
        .map(|(k, v)| format!("--{k}={v}"))
        .collect();
    var_args.extend([
        "--testOverviewLogFileName".to_owned(),
        "validator.log".to_owned(),
    ]);

    let message_digest = DigestHolder::new();
    let log_digest = DigestHolder::new();
    let run_log = run_item(
        ctx,
        validator,
        DigestOrSource::from_digest_value(validator_digest),
        Some(DigestOrSource::from_path(testcase)),
        None,
        Some(DigestOrDest::from_digest(message_digest.clone())),
        vec![],
        vec![GradingFileOutput::to_digest("validator.log", log_digest.clone()).optional()],
        Some(&shlex::join(var_args.iter().map(String::as_str))),
        None,
    )
    .await?;

    let log_overview = match log_digest.get() {
        Some(digest) => ctx.get_digest_as_string(&digest).await.unwrap_or_default(),
        None => String::new(),
    };
    let message = match message_digest.get() {
        Some(digest) => ctx.get_digest_as_string(&digest).await,
        None => None,
    };

    let ok = run_log.map(|log| log.exitcode == 0).unwrap_or(false);
    Ok((ok, message, process_bounds(&log_overview)))
}

///
/// Validate every built testcase of every group that has a validator. A nonzero
/// validator exit is a validation failure carrying the captured stderr as the message.
///
pub async fn validate_testcases(
    ctx: &mut Context,
    groups: Option<&HashSet<String>>,
) -> Result<Vec<TestcaseValidationInfo>, String> {
    let compiled = compile_validators(ctx).await?;

    let mut infos = Vec::new();
    let group_list: Vec<_> = ctx
        .pkg
        .testcases
        .iter()
        .map(|group| {
            (
                group.name().to_owned(),
                group.validator.clone().or_else(|| ctx.pkg.validator.clone()),
            )
        })
        .collect();

    for (group_name, validator) in group_list {
        let Some(validator) = validator else {
            continue;
        };
        let Some(digest) = compiled.get(&group_name).cloned() else {
            continue;
        };
        if let Some(groups) = groups {
            if !groups.contains(&group_name) {
                continue;
            }
        }
        let group = ctx.pkg.get_testgroup(&group_name)?.clone();
        let testcases = find_built_testcase_inputs(ctx, &group);
        for testcase in testcases {
            let (ok, message, hit_bounds) =
                validate_test(ctx, &testcase, &validator, &digest).await?;
            infos.push(TestcaseValidationInfo {
                group: group_name.clone(),
                path: testcase,
                ok,
                hit_bounds,
                message,
            });
        }
    }
    Ok(infos)
}

///
/// Render the validation results: failures with their messages, then per-group bounds
/// that were never hit (coverage gaps in the testset).
///
pub fn print_validation_report(infos: &[TestcaseValidationInfo]) -> bool {
    let mut ok = true;
    let mut hit_bounds_per_group: BTreeMap<&str, HitBounds> = BTreeMap::new();
    for info in infos {
        if !info.ok {
            ok = false;
            println!(
                "Testcase {} failed validation:\n{}",
                info.path.display(),
                info.message.as_deref().unwrap_or("<no message>")
            );
            continue;
        }
        let group_bounds = hit_bounds_per_group.entry(&info.group).or_default();
        for (key, value) in &info.hit_bounds {
            let entry = group_bounds.entry(key.clone()).or_insert((false, false));
            *entry = bounds_or(*entry, *value);
        }
    }

    for (group, hit_bounds) in &hit_bounds_per_group {
        let mut lines = Vec::new();
        for (key, (min_hit, max_hit)) in hit_bounds {
            if *min_hit && *max_hit {
                continue;
            }
            if !min_hit {
                lines.push(format!("  - {key}: min-value not hit"));
            }
            if !max_hit {
                lines.push(format!("  - {key}: max-value not hit"));
            }
        }
        if !lines.is_empty() {
            println!("Group {group} unhit bounds:");
            for line in lines {
                println!("{line}");
            }
        }
    }
    ok
}
