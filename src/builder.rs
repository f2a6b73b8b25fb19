// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::collections::HashSet;

use log::info;

use crate::environment::VerificationLevel;
use crate::generators::{generate_outputs_for_testcases, generate_testcases};
use crate::package::Context;
use crate::validators::{print_validation_report, validate_testcases};

///
/// The build pipeline: regenerate every testcase input, validate them, then produce the
/// reference outputs with the main solution. The first unrecoverable user error aborts.
///
pub async fn build(
    ctx: &mut Context,
    verification: VerificationLevel,
    groups: Option<&HashSet<String>>,
) -> Result<(), String> {
    info!("Generating testcases...");
    generate_testcases(ctx, groups).await?;

    if verification >= VerificationLevel::Validate {
        info!("Validating testcases...");
        let infos = validate_testcases(ctx, groups).await?;
        if !print_validation_report(&infos) {
            return Err("Testcase validation failed".to_owned());
        }
    }

    info!("Generating reference outputs...");
    generate_outputs_for_testcases(ctx, groups).await?;
    Ok(())
}
