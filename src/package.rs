// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use grading::DependencyCache;
use log::debug;
use sandbox::Sandbox;
use storage::{FileCacher, FilesystemStorage, Storage};

use crate::environment::Environment;
use crate::schema::Package;

pub const PACKAGE_FILES: &[&str] = &["problem.yml", "problem.yaml"];
pub const ENVIRONMENT_FILE: &str = "env.yml";

///
/// Everything a command needs to operate on one problem package: the parsed package, the
/// environment, the content-addressed storage with its cacher, the dependency cache and
/// the singleton sandbox.
///
pub struct Context {
    pub root: PathBuf,
    pub pkg: Package,
    pub env: Environment,
    pub storage: Arc<dyn Storage>,
    pub cacher: Arc<FileCacher>,
    pub cache: DependencyCache,
    pub sandbox: Sandbox,
}

pub fn find_package_file(root: &Path) -> Result<PathBuf, String> {
    for name in PACKAGE_FILES {
        let candidate = root.join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(format!(
        "No problem package found at {} (expected one of: {})",
        root.display(),
        PACKAGE_FILES.join(", ")
    ))
}

pub fn load_package(root: &Path) -> Result<Package, String> {
    let path = find_package_file(root)?;
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
    let pkg: Package = serde_yaml::from_str(&raw)
        .map_err(|e| format!("Failed to parse {}: {e}", path.display()))?;
    pkg.validate()?;
    Ok(pkg)
}

fn load_environment(root: &Path) -> Result<Environment, String> {
    let candidate = root.join(ENVIRONMENT_FILE);
    if candidate.is_file() {
        Environment::load(&candidate)
    } else {
        Ok(Environment::default())
    }
}

impl Context {
    pub async fn load(root: &Path) -> Result<Context, String> {
        let root = root
            .canonicalize()
            .map_err(|e| format!("Invalid package directory {}: {e}", root.display()))?;
        let pkg = load_package(&root)?;
        let env = load_environment(&root)?;
        Context::new(root, pkg, env).await
    }

    pub async fn new(root: PathBuf, pkg: Package, env: Environment) -> Result<Context, String> {
        let cache_dir = root.join(".box");
        let storage: Arc<dyn Storage> =
            Arc::new(FilesystemStorage::new(cache_dir.join(".storage")).map_err(|e| e.to_string())?);
        let cacher = Arc::new(
            FileCacher::new_shared(storage.clone(), cache_dir.clone()).map_err(|e| e.to_string())?,
        );
        let cache = DependencyCache::new(&cache_dir, storage.clone())?;
        let mut sandbox = Sandbox::new(&env.sandbox, cacher.clone(), Some(&pkg.name), None)?;
        sandbox.initialize().await?;
        debug!(
            "Loaded package {} with sandbox root {}",
            pkg.name,
            sandbox.get_root_path().display()
        );
        Ok(Context {
            root,
            pkg,
            env,
            storage,
            cacher,
            cache,
            sandbox,
        })
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(".box")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.cache_dir().join("runs")
    }

    pub fn build_dir(&self) -> PathBuf {
        self.root.join("build")
    }

    pub fn build_tests_dir(&self) -> PathBuf {
        self.build_dir().join("tests")
    }

    pub fn build_testgroup_path(&self, group: &str) -> PathBuf {
        self.build_tests_dir().join(group)
    }

    ///
    /// Fetch a small blob from the storage as text, or None when it is unavailable.
    ///
    pub async fn get_digest_as_string(&self, digest: &str) -> Option<String> {
        self.cacher.get_file_to_string(digest, None).await.ok()
    }

    ///
    /// Tear down the sandbox and flush the dependency cache. To be called before exit.
    ///
    pub async fn shutdown(mut self) {
        self.sandbox.cleanup(true).await;
        self.cache.close();
    }
}

///
/// Drop every derived directory of a package: the `.box` cache and the `build` tree.
///
pub fn clear_package(root: &Path) -> Result<(), String> {
    for dir in [root.join(".box"), root.join("build")] {
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .map_err(|e| format!("Failed to remove {}: {e}", dir.display()))?;
        }
    }
    Ok(())
}
