// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hashing::Fingerprint;
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use storage::Storage;

use crate::artifacts::{DigestHolder, GradingArtifacts, GradingLogsHolder, LogsSnapshot};

///
/// The key side of a memoized execution: the commands, the full artifact declaration and
/// any extra parameters (typically the cacheable sandbox params). Hashed into a SHA-1 over
/// the JSON encoding.
///
#[derive(Serialize)]
struct CacheInput<'a> {
    commands: &'a [String],
    artifacts: &'a [GradingArtifacts],
    extra_params: &'a serde_json::Value,
}

///
/// The value side: every produced digest in declaration order, the SHA-1 of every
/// path-sourced input, the SHA-1 of every tracked output currently on disk (empty string
/// when absent), and the captured logs.
///
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheFingerprint {
    pub digests: Vec<Option<String>>,
    pub fingerprints: Vec<String>,
    pub output_fingerprints: Vec<String>,
    pub logs: Vec<LogsSnapshot>,
}

///
/// Validate the single-producer discipline of digest holders: a holder may be produced
/// at most once across the plan, and must be produced before it is consumed.
///
fn check_digests(artifacts_list: &[GradingArtifacts]) -> Result<(), String> {
    let mut produced: HashSet<usize> = HashSet::new();
    for artifacts in artifacts_list {
        for input in &artifacts.inputs {
            let Some(digest) = &input.digest else {
                continue;
            };
            if digest.is_filled() {
                continue;
            }
            if !produced.contains(&digest.id()) {
                return Err("Digests must be produced before being consumed".to_owned());
            }
        }
        for output in &artifacts.outputs {
            let Some(digest) = &output.digest else {
                continue;
            };
            if digest.is_filled() {
                continue;
            }
            if produced.contains(&digest.id()) {
                return Err("A digest cannot be produced more than once".to_owned());
            }
            produced.insert(digest.id());
        }
    }
    Ok(())
}

fn build_digest_list(artifacts_list: &[GradingArtifacts]) -> Vec<DigestHolder> {
    let mut digests = Vec::new();
    for artifacts in artifacts_list {
        for output in &artifacts.outputs {
            if let Some(digest) = &output.digest {
                digests.push(digest.clone());
            }
        }
    }
    digests
}

fn build_logs_list(artifacts_list: &[GradingArtifacts]) -> Vec<GradingLogsHolder> {
    artifacts_list
        .iter()
        .filter_map(|artifacts| artifacts.logs.clone())
        .collect()
}

async fn file_fingerprint(path: &Path) -> Result<Option<String>, String> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(format!("Failed to open {}: {e}", path.display())),
    };
    let fingerprint = hashing::digest_reader(&mut file)
        .await
        .map_err(|e| format!("Failed to fingerprint {}: {e}", path.display()))?;
    Ok(Some(fingerprint.to_hex()))
}

///
/// SHA-1 of every input file whose source is a filesystem path. Digest-sourced inputs are
/// already identified by the digest in the cache key.
///
async fn build_fingerprint_list(
    artifacts_list: &[GradingArtifacts],
) -> Result<Vec<String>, String> {
    let mut fingerprints = Vec::new();
    for artifacts in artifacts_list {
        for input in &artifacts.inputs {
            let Some(src) = &input.src else {
                continue;
            };
            let path = artifacts.root.join(src);
            let fingerprint = file_fingerprint(&path)
                .await?
                .ok_or_else(|| format!("Input file {} does not exist", path.display()))?;
            fingerprints.push(fingerprint);
        }
    }
    Ok(fingerprints)
}

///
/// SHA-1 of every non-intermediate, non-hashed output with a filesystem destination,
/// with the empty string standing in for a missing file. Hashed outputs are already
/// identified by their digest and are deliberately not fingerprinted on disk.
///
async fn build_output_fingerprint_list(
    artifacts_list: &[GradingArtifacts],
) -> Result<Vec<String>, String> {
    let mut fingerprints = Vec::new();
    for artifacts in artifacts_list {
        for output in &artifacts.outputs {
            let Some(dest) = &output.dest else {
                continue;
            };
            if output.intermediate || output.hash {
                continue;
            }
            let path = artifacts.root.join(dest);
            fingerprints.push(file_fingerprint(&path).await?.unwrap_or_default());
        }
    }
    Ok(fingerprints)
}

async fn build_cache_fingerprint(
    artifacts_list: &[GradingArtifacts],
) -> Result<CacheFingerprint, String> {
    Ok(CacheFingerprint {
        digests: build_digest_list(artifacts_list)
            .iter()
            .map(DigestHolder::get)
            .collect(),
        fingerprints: build_fingerprint_list(artifacts_list).await?,
        output_fingerprints: build_output_fingerprint_list(artifacts_list).await?,
        logs: build_logs_list(artifacts_list)
            .iter()
            .map(GradingLogsHolder::snapshot)
            .collect(),
    })
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

///
/// Whether every required output of the plan is actually present: digest outputs must
/// exist in the storage, and plain outputs must exist on disk with the declared
/// executable bit.
///
pub async fn is_artifact_ok(
    artifacts: &GradingArtifacts,
    storage: &Arc<dyn Storage>,
) -> Result<bool, String> {
    for output in &artifacts.outputs {
        if output.optional || output.intermediate {
            continue;
        }
        if let Some(digest) = &output.digest {
            let Some(value) = digest.get() else {
                return Ok(false);
            };
            if !storage.exists(&value).await.map_err(|e| e.to_string())? {
                return Ok(false);
            }
            continue;
        }
        let Some(dest) = &output.dest else {
            return Ok(false);
        };
        let path = artifacts.root.join(dest);
        if !path.is_file() {
            return Ok(false);
        }
        if is_executable(&path) != output.executable {
            return Ok(false);
        }
    }
    Ok(true)
}

pub async fn are_artifacts_ok(
    artifacts_list: &[GradingArtifacts],
    storage: &Arc<dyn Storage>,
) -> Result<bool, String> {
    for artifacts in artifacts_list {
        if !is_artifact_ok(artifacts, storage).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn build_cache_key(
    commands: &[String],
    artifacts_list: &[GradingArtifacts],
    extra_params: &serde_json::Value,
) -> Result<String, String> {
    let input = CacheInput {
        commands,
        artifacts: artifacts_list,
        extra_params,
    };
    let encoded = serde_json::to_vec(&input).map_err(|e| format!("{e}"))?;
    Ok(Fingerprint::digest(&encoded).to_hex())
}

///
/// Memoizes command executions over artifact plans. The database is a single-file JSON
/// map opened at process start; unreadable entries and schema mismatches are treated as
/// misses.
///
pub struct DependencyCache {
    storage: Arc<dyn Storage>,
    db_path: PathBuf,
    db: Mutex<HashMap<String, CacheFingerprint>>,
}

impl DependencyCache {
    pub fn new(root: &Path, storage: Arc<dyn Storage>) -> Result<DependencyCache, String> {
        std::fs::create_dir_all(root)
            .map_err(|e| format!("Failed to create cache directory {}: {e}", root.display()))?;
        let db_path = root.join(".cache_db.json");
        let db = match std::fs::read(&db_path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(db) => db,
                Err(err) => {
                    debug!("Dependency cache at {} is unreadable ({err}); starting fresh.", db_path.display());
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Ok(DependencyCache {
            storage,
            db_path,
            db: Mutex::new(db),
        })
    }

    fn persist(&self) {
        let encoded = {
            let db = self.db.lock();
            serde_json::to_vec(&*db)
        };
        match encoded {
            Ok(bytes) => {
                if let Err(err) = std::fs::write(&self.db_path, bytes) {
                    warn!("Failed to persist dependency cache: {err}");
                }
            }
            Err(err) => warn!("Failed to encode dependency cache: {err}"),
        }
    }

    ///
    /// Open a cache block for the given step. On enter, a hit is attempted (the block
    /// reports it via `is_cached`). The caller runs the step only on a miss, and then
    /// calls `commit` on clean completion; abandoning the block without committing (the
    /// step failed) stores nothing, keeping the cache consistent across cancellation.
    ///
    pub async fn enter<'a>(
        &'a self,
        commands: &'a [String],
        artifacts_list: &'a [GradingArtifacts],
        extra_params: &'a serde_json::Value,
    ) -> Result<CacheBlock<'a>, String> {
        check_digests(artifacts_list)?;
        let key = build_cache_key(commands, artifacts_list, extra_params)?;
        let cached = self.find_in_cache(&key, artifacts_list).await?;
        Ok(CacheBlock {
            cache: self,
            key,
            artifacts_list,
            cached,
        })
    }

    async fn find_in_cache(
        &self,
        key: &str,
        artifacts_list: &[GradingArtifacts],
    ) -> Result<bool, String> {
        let Some(fingerprint) = self.db.lock().get(key).cloned() else {
            return Ok(false);
        };

        let reference = build_cache_fingerprint(artifacts_list).await?;

        if fingerprint.fingerprints != reference.fingerprints
            || fingerprint.output_fingerprints != reference.output_fingerprints
        {
            self.evict(key);
            return Ok(false);
        }

        // Apply the stored digests into the plan's holders, keeping the previous values
        // around so the write can be rolled back if the storage lost content.
        let holders = build_digest_list(artifacts_list);
        if fingerprint.digests.len() != holders.len() || fingerprint.logs.len() != reference.logs.len()
        {
            self.evict(key);
            return Ok(false);
        }
        let old_values: Vec<Option<String>> = holders.iter().map(DigestHolder::get).collect();
        for (holder, value) in holders.iter().zip(&fingerprint.digests) {
            holder.set(value.clone());
        }

        if !are_artifacts_ok(artifacts_list, &self.storage).await? {
            for (holder, old) in holders.iter().zip(old_values) {
                holder.set(old);
            }
            self.evict(key);
            return Ok(false);
        }

        self.copy_hashed_files(artifacts_list).await?;

        for (holder, snapshot) in build_logs_list(artifacts_list).iter().zip(&fingerprint.logs) {
            holder.apply_cached(snapshot);
        }

        Ok(true)
    }

    ///
    /// Materialize hashed outputs from the storage to their dest paths, applying the
    /// declared executable bit and maxlen cap.
    ///
    async fn copy_hashed_files(&self, artifacts_list: &[GradingArtifacts]) -> Result<(), String> {
        use std::os::unix::fs::PermissionsExt;

        for artifacts in artifacts_list {
            for output in &artifacts.outputs {
                if !output.hash {
                    continue;
                }
                let Some(dest) = &output.dest else {
                    continue;
                };
                let digest = output
                    .digest
                    .as_ref()
                    .ok_or_else(|| "Hashed output has no digest holder".to_owned())?;
                let value = match digest.get() {
                    Some(value) => value,
                    None if output.optional => continue,
                    None => return Err("Hashed output digest was never produced".to_owned()),
                };

                let path = artifacts.root.join(dest);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| e.to_string())?;
                }
                let mut reader = self.storage.get(&value).await.map_err(|e| e.to_string())?;
                let mut writer = tokio::fs::File::create(&path)
                    .await
                    .map_err(|e| format!("Failed to create {}: {e}", path.display()))?;
                storage::copy_chunked(&mut reader, &mut writer, output.maxlen)
                    .await
                    .map_err(|e| e.to_string())?;
                drop(writer);
                if output.executable {
                    tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                        .await
                        .map_err(|e| format!("Failed to chmod {}: {e}", path.display()))?;
                }
            }
        }
        Ok(())
    }

    async fn store_in_cache(
        &self,
        key: &str,
        artifacts_list: &[GradingArtifacts],
    ) -> Result<(), String> {
        if !are_artifacts_ok(artifacts_list, &self.storage).await? {
            return Ok(());
        }
        let fingerprint = build_cache_fingerprint(artifacts_list).await?;
        self.db.lock().insert(key.to_owned(), fingerprint);
        self.persist();
        Ok(())
    }

    fn evict(&self, key: &str) {
        if self.db.lock().remove(key).is_some() {
            self.persist();
        }
    }

    pub fn close(&self) {
        self.persist();
    }
}

impl Drop for DependencyCache {
    fn drop(&mut self) {
        self.persist();
    }
}

impl std::fmt::Debug for DependencyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyCache")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

///
/// An open cache block, spanning one step execution.
///
#[must_use]
pub struct CacheBlock<'a> {
    cache: &'a DependencyCache,
    key: String,
    artifacts_list: &'a [GradingArtifacts],
    cached: bool,
}

impl CacheBlock<'_> {
    /// Whether the step was replayed from the cache.
    pub fn is_cached(&self) -> bool {
        self.cached
    }

    ///
    /// Record the step's results. To be called only on clean completion; dropping the
    /// block instead leaves the cache untouched.
    ///
    pub async fn commit(self) -> Result<(), String> {
        self.cache
            .store_in_cache(&self.key, self.artifacts_list)
            .await
    }
}
