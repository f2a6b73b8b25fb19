// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use sandbox::ExitStatus;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

///
/// A rewriteable cell holding a storage digest. Producing steps fill it after successful
/// completion; consumers downstream read it. A holder has exactly one producer within an
/// artifact plan, and the producer must be declared before any consumer; the dependency
/// cache validates this before running the plan.
///
/// Clones share the same cell, and sharing is identity: the cache tracks holders by
/// pointer to pair produced digests back up with their cells on a hit.
///
#[derive(Clone, Debug, Default)]
pub struct DigestHolder(Arc<Mutex<Option<String>>>);

impl DigestHolder {
    pub fn new() -> DigestHolder {
        DigestHolder::default()
    }

    pub fn with_value(value: impl Into<String>) -> DigestHolder {
        DigestHolder(Arc::new(Mutex::new(Some(value.into()))))
    }

    pub fn get(&self) -> Option<String> {
        self.0.lock().clone()
    }

    pub fn set(&self, value: Option<String>) {
        *self.0.lock() = value;
    }

    pub fn is_filled(&self) -> bool {
        self.0.lock().is_some()
    }

    /// Stable identity of the underlying cell, used to track producer/consumer pairs.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl Serialize for DigestHolder {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut obj = serializer.serialize_struct("DigestHolder", 1)?;
        obj.serialize_field("value", &self.get())?;
        obj.end()
    }
}

///
/// The structured result of one sandboxed execution.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    pub exitcode: i32,
    pub exitstatus: ExitStatus,
    pub time: Option<f64>,
    pub memory: Option<u64>,
    pub wall_time: Option<f64>,
}

impl Default for RunLog {
    fn default() -> RunLog {
        RunLog {
            exitcode: 0,
            exitstatus: ExitStatus::SandboxError,
            time: Some(0.0),
            memory: None,
            wall_time: None,
        }
    }
}

///
/// The log of one preprocessing (compile) command.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreprocessLog {
    pub cmd: Vec<String>,
    pub exitcode: i32,
    pub log: String,
}

///
/// A serializable snapshot of the captured logs of an artifact plan.
///
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LogsSnapshot {
    pub run: Option<RunLog>,
    pub preprocess: Option<Vec<PreprocessLog>>,
    /// Whether these logs were replayed from the dependency cache.
    #[serde(default, skip_serializing)]
    pub cached: bool,
}

///
/// A shared cell capturing the logs of an execution, so cached replays can hand the
/// original logs back to the caller.
///
#[derive(Clone, Debug, Default)]
pub struct GradingLogsHolder(Arc<Mutex<LogsSnapshot>>);

impl GradingLogsHolder {
    pub fn new() -> GradingLogsHolder {
        GradingLogsHolder::default()
    }

    pub fn run(&self) -> Option<RunLog> {
        self.0.lock().run.clone()
    }

    pub fn set_run(&self, run: RunLog) {
        self.0.lock().run = Some(run);
    }

    pub fn preprocess(&self) -> Option<Vec<PreprocessLog>> {
        self.0.lock().preprocess.clone()
    }

    pub fn set_preprocess(&self, logs: Vec<PreprocessLog>) {
        self.0.lock().preprocess = Some(logs);
    }

    pub fn snapshot(&self) -> LogsSnapshot {
        self.0.lock().clone()
    }

    pub fn is_cached(&self) -> bool {
        self.0.lock().cached
    }

    /// Replay cached logs into this holder, marking it as a cache hit.
    pub fn apply_cached(&self, snapshot: &LogsSnapshot) {
        let mut guard = self.0.lock();
        if snapshot.run.is_some() {
            guard.run = snapshot.run.clone();
        }
        if snapshot.preprocess.is_some() {
            guard.preprocess = snapshot.preprocess.clone();
        }
        guard.cached = true;
    }
}

impl Serialize for GradingLogsHolder {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

///
/// Where an input comes from: a host path or a digest in the storage.
///
#[derive(Clone, Debug, Default)]
pub struct DigestOrSource {
    pub src: Option<PathBuf>,
    pub digest: Option<DigestHolder>,
}

impl DigestOrSource {
    pub fn from_path(src: impl Into<PathBuf>) -> DigestOrSource {
        DigestOrSource {
            src: Some(src.into()),
            digest: None,
        }
    }

    pub fn from_digest(digest: DigestHolder) -> DigestOrSource {
        DigestOrSource {
            src: None,
            digest: Some(digest),
        }
    }

    pub fn from_digest_value(value: impl Into<String>) -> DigestOrSource {
        Self::from_digest(DigestHolder::with_value(value))
    }
}

///
/// Where an output goes: a host path, a digest holder, or both.
///
#[derive(Clone, Debug, Default)]
pub struct DigestOrDest {
    pub dest: Option<PathBuf>,
    pub digest: Option<DigestHolder>,
}

impl DigestOrDest {
    pub fn from_path(dest: impl Into<PathBuf>) -> DigestOrDest {
        DigestOrDest {
            dest: Some(dest.into()),
            digest: None,
        }
    }

    pub fn from_digest(digest: DigestHolder) -> DigestOrDest {
        DigestOrDest {
            dest: None,
            digest: Some(digest),
        }
    }
}

///
/// A file copied into the sandbox before an execution.
///
#[derive(Clone, Debug, Serialize)]
pub struct GradingFileInput {
    /// Destination path relative to the sandbox.
    pub dest: PathBuf,
    /// Source path relative to the artifact root.
    pub src: Option<PathBuf>,
    /// Digest if the content comes from the storage.
    pub digest: Option<DigestHolder>,
    /// Whether the destination file should be marked as an executable.
    pub executable: bool,
}

impl GradingFileInput {
    pub fn from_path(src: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> GradingFileInput {
        GradingFileInput {
            dest: dest.into(),
            src: Some(src.into()),
            digest: None,
            executable: false,
        }
    }

    pub fn from_digest(digest: DigestHolder, dest: impl Into<PathBuf>) -> GradingFileInput {
        GradingFileInput {
            dest: dest.into(),
            src: None,
            digest: Some(digest),
            executable: false,
        }
    }

    pub fn from_source(source: &DigestOrSource, dest: impl Into<PathBuf>) -> GradingFileInput {
        GradingFileInput {
            dest: dest.into(),
            src: source.src.clone(),
            digest: source.digest.clone(),
            executable: false,
        }
    }

    pub fn executable(mut self) -> GradingFileInput {
        self.executable = true;
        self
    }
}

///
/// A file copied out of the sandbox after an execution.
///
/// Outputs flagged `hash` are routed via the storage even when they also have a `dest`:
/// they are identified by content alone, the dest path is cleared from the cache key, and
/// the executable bit is restored at materialization time rather than fingerprinted. For
/// plain `dest` outputs the on-disk executable bit participates in the cache fingerprint,
/// and toggling it evicts the entry.
///
#[derive(Clone, Debug)]
pub struct GradingFileOutput {
    /// Source path relative to the sandbox.
    pub src: PathBuf,
    /// Destination path relative to the artifact root.
    pub dest: Option<PathBuf>,
    /// Digest holder filled when the file is routed through the storage.
    pub digest: Option<DigestHolder>,
    /// Whether the destination file should be marked as an executable.
    pub executable: bool,
    /// Whether the file may be missing after the step.
    pub optional: bool,
    /// Cap the copied size.
    pub maxlen: Option<u64>,
    /// An intermediate file that is not tracked by the cache fingerprint.
    pub intermediate: bool,
    /// Route the content through the storage, identifying it by digest.
    pub hash: bool,
}

impl GradingFileOutput {
    /// An output tracked by content: routed through the storage and also written to its
    /// dest path. This is the default shape of an output.
    pub fn to_path(src: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> GradingFileOutput {
        GradingFileOutput {
            src: src.into(),
            dest: Some(dest.into()),
            digest: Some(DigestHolder::new()),
            executable: false,
            optional: false,
            maxlen: None,
            intermediate: false,
            hash: true,
        }
    }

    /// An output tracked by its on-disk state (content and executable bit) instead of by
    /// digest; changing the file at dest evicts cache entries that produced it.
    pub fn to_plain_path(src: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> GradingFileOutput {
        GradingFileOutput {
            src: src.into(),
            dest: Some(dest.into()),
            digest: None,
            executable: false,
            optional: false,
            maxlen: None,
            intermediate: false,
            hash: false,
        }
    }

    pub fn to_digest(src: impl Into<PathBuf>, digest: DigestHolder) -> GradingFileOutput {
        GradingFileOutput {
            src: src.into(),
            dest: None,
            digest: Some(digest),
            executable: false,
            optional: false,
            maxlen: None,
            intermediate: false,
            hash: true,
        }
    }

    pub fn to_dest(src: impl Into<PathBuf>, dest: &DigestOrDest) -> GradingFileOutput {
        GradingFileOutput {
            src: src.into(),
            dest: dest.dest.clone(),
            digest: Some(dest.digest.clone().unwrap_or_default()),
            executable: false,
            optional: false,
            maxlen: None,
            intermediate: false,
            hash: true,
        }
    }

    pub fn executable(mut self) -> GradingFileOutput {
        self.executable = true;
        self
    }

    pub fn optional(mut self) -> GradingFileOutput {
        self.optional = true;
        self
    }

    pub fn with_maxlen(mut self, maxlen: u64) -> GradingFileOutput {
        self.maxlen = Some(maxlen);
        self
    }

    pub fn intermediate(mut self) -> GradingFileOutput {
        self.intermediate = true;
        self
    }

    pub fn hashed(mut self) -> GradingFileOutput {
        self.hash = true;
        self
    }
}

impl Serialize for GradingFileOutput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // Hashed outputs are tracked by digest only; their dest path must not
        // participate in the cache key.
        let dest = if self.hash { None } else { self.dest.as_ref() };
        let mut obj = serializer.serialize_struct("GradingFileOutput", 8)?;
        obj.serialize_field("src", &self.src)?;
        obj.serialize_field("dest", &dest)?;
        obj.serialize_field("digest", &self.digest)?;
        obj.serialize_field("executable", &self.executable)?;
        obj.serialize_field("optional", &self.optional)?;
        obj.serialize_field("maxlen", &self.maxlen)?;
        obj.serialize_field("intermediate", &self.intermediate)?;
        obj.serialize_field("hash", &self.hash)?;
        obj.end()
    }
}

///
/// The declarative I/O plan for one sandbox execution.
///
#[derive(Clone, Debug, Default, Serialize)]
pub struct GradingArtifacts {
    /// Host root directory for paths that do not go through the storage.
    pub root: PathBuf,
    pub inputs: Vec<GradingFileInput>,
    pub outputs: Vec<GradingFileOutput>,
    pub logs: Option<GradingLogsHolder>,
}

impl GradingArtifacts {
    pub fn new() -> GradingArtifacts {
        GradingArtifacts {
            root: PathBuf::from("."),
            ..GradingArtifacts::default()
        }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> GradingArtifacts {
        GradingArtifacts {
            root: root.into(),
            ..GradingArtifacts::default()
        }
    }
}
