// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use sandbox::{Sandbox, SandboxParams};

use crate::artifacts::{GradingArtifacts, GradingLogsHolder, RunLog};
use crate::caching::DependencyCache;
use crate::steps;

///
/// Compile through the dependency cache. A failed compilation is never recorded: the
/// cache block is abandoned without committing, so the next attempt re-runs.
///
pub async fn compile(
    commands: &[String],
    params: &SandboxParams,
    sandbox: &mut Sandbox,
    artifacts: &GradingArtifacts,
    dependency_cache: &DependencyCache,
) -> Result<bool, String> {
    let extra_params = params.get_cacheable_params();
    let artifacts_list = std::slice::from_ref(artifacts);
    let block = dependency_cache
        .enter(commands, artifacts_list, &extra_params)
        .await?;
    if !block.is_cached() && !steps::compile(commands, params, sandbox, artifacts).await? {
        return Ok(false);
    }
    block.commit().await?;
    Ok(true)
}

///
/// Run through the dependency cache. The returned RunLog comes either from a fresh
/// execution or from the cached fingerprint.
///
pub async fn run(
    command: &str,
    params: &SandboxParams,
    sandbox: &mut Sandbox,
    artifacts: &mut GradingArtifacts,
    dependency_cache: &DependencyCache,
) -> Result<Option<RunLog>, String> {
    let logs = GradingLogsHolder::new();
    artifacts.logs = Some(logs.clone());

    let commands = [command.to_owned()];
    let extra_params = params.get_cacheable_params();
    let artifacts = &*artifacts;
    let artifacts_list = std::slice::from_ref(artifacts);
    let block = dependency_cache
        .enter(&commands, artifacts_list, &extra_params)
        .await?;
    if !block.is_cached() {
        steps::run(command, params, sandbox, artifacts).await?;
    }
    block.commit().await?;

    Ok(logs.run())
}
