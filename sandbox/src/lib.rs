// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use log::debug;
use storage::{copy_chunked, FileCacher};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};

pub mod params;
pub mod status;
pub mod timeit;

mod isolate;
mod stupid;

pub use crate::isolate::IsolateSandbox;
pub use crate::params::{DirectoryMount, SandboxParams, MERGE_STDERR};
pub use crate::status::{human_exit_description, ExitStatus, MetaLog};
pub use crate::stupid::StupidSandbox;

///
/// The sandbox handle used by every execution step. A tagged variant over the concrete
/// backends: callers obtain one via `Sandbox::new` keyed on the environment
/// configuration, and the backend choice is inlined at construction rather than
/// dispatched virtually on every file operation.
///
#[derive(Debug)]
pub enum Sandbox {
    Stupid(StupidSandbox),
    Isolate(IsolateSandbox),
}

impl Sandbox {
    pub fn new(
        kind: &str,
        file_cacher: Arc<FileCacher>,
        name: Option<&str>,
        temp_dir: Option<&Path>,
    ) -> Result<Sandbox, String> {
        match kind {
            "isolate" => Ok(Sandbox::Isolate(IsolateSandbox::new(
                file_cacher,
                name,
                temp_dir,
                None,
            )?)),
            _ => Ok(Sandbox::Stupid(StupidSandbox::new(
                file_cacher,
                name,
                temp_dir,
                None,
            )?)),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Sandbox::Stupid(s) => &s.name,
            Sandbox::Isolate(s) => &s.name,
        }
    }

    pub fn file_cacher(&self) -> &Arc<FileCacher> {
        match self {
            Sandbox::Stupid(s) => &s.file_cacher,
            Sandbox::Isolate(s) => &s.file_cacher,
        }
    }

    pub fn params(&self) -> &SandboxParams {
        match self {
            Sandbox::Stupid(s) => &s.params,
            Sandbox::Isolate(s) => &s.params,
        }
    }

    pub fn params_mut(&mut self) -> &mut SandboxParams {
        match self {
            Sandbox::Stupid(s) => &mut s.params,
            Sandbox::Isolate(s) => &mut s.params,
        }
    }

    pub fn set_params(&mut self, params: SandboxParams) {
        match self {
            Sandbox::Stupid(s) => s.params = params,
            Sandbox::Isolate(s) => s.set_params(params),
        }
    }

    pub fn set_multiprocess(&mut self, multiprocess: bool) {
        self.params_mut().set_multiprocess(multiprocess);
    }

    pub fn get_root_path(&self) -> &Path {
        match self {
            Sandbox::Stupid(s) => s.get_root_path(),
            Sandbox::Isolate(s) => s.get_root_path(),
        }
    }

    ///
    /// Translate from a relative path inside the sandbox to a host path.
    ///
    pub fn relative_path(&self, path: &Path) -> PathBuf {
        match self {
            Sandbox::Stupid(s) => s.get_root_path().join(path),
            Sandbox::Isolate(s) => s.relative_path(path),
        }
    }

    pub fn use_soft_timeout(&self) -> bool {
        match self {
            Sandbox::Stupid(s) => s.use_soft_timeout(),
            Sandbox::Isolate(s) => s.use_soft_timeout(),
        }
    }

    pub async fn initialize(&mut self) -> Result<(), String> {
        match self {
            Sandbox::Stupid(s) => s.initialize(),
            Sandbox::Isolate(s) => s.initialize().await,
        }
    }

    ///
    /// Tear the sandbox down, releasing any external kernel resources. Failures are
    /// logged and swallowed; stray temporary files can be garbage-collected later.
    ///
    pub async fn cleanup(&mut self, delete: bool) {
        match self {
            Sandbox::Stupid(s) => s.cleanup(delete),
            Sandbox::Isolate(s) => s.cleanup(delete).await,
        }
    }

    ///
    /// Run a command to completion with stdio redirected per the params. The returned
    /// flag reports whether the *sandbox* worked; the child's own exit status is
    /// inspected through the log accessors.
    ///
    pub async fn execute_without_std(&mut self, command: &[String]) -> bool {
        match self {
            Sandbox::Stupid(s) => s.execute_without_std(command).await,
            Sandbox::Isolate(s) => s.execute_without_std(command).await,
        }
    }

    pub async fn hydrate_logs(&mut self) {
        match self {
            Sandbox::Stupid(s) => s.hydrate_logs().await,
            Sandbox::Isolate(s) => s.hydrate_logs().await,
        }
    }

    pub fn get_execution_time(&self) -> Option<f64> {
        match self {
            Sandbox::Stupid(s) => s.get_execution_time(),
            Sandbox::Isolate(s) => s.get_execution_time(),
        }
    }

    pub fn get_execution_wall_clock_time(&self) -> Option<f64> {
        match self {
            Sandbox::Stupid(s) => s.get_execution_wall_clock_time(),
            Sandbox::Isolate(s) => s.get_execution_wall_clock_time(),
        }
    }

    /// Memory used by the execution, in bytes.
    pub fn get_memory_used(&self) -> Option<u64> {
        match self {
            Sandbox::Stupid(s) => s.get_memory_used(),
            Sandbox::Isolate(s) => s.get_memory_used(),
        }
    }

    pub fn get_killing_signal(&self) -> i32 {
        match self {
            Sandbox::Stupid(s) => s.get_killing_signal(),
            Sandbox::Isolate(s) => s.get_killing_signal(),
        }
    }

    pub fn get_exit_code(&self) -> i32 {
        match self {
            Sandbox::Stupid(s) => s.get_exit_code(),
            Sandbox::Isolate(s) => s.get_exit_code(),
        }
    }

    pub fn get_exit_status(&self) -> ExitStatus {
        match self {
            Sandbox::Stupid(s) => s.get_exit_status(),
            Sandbox::Isolate(s) => s.get_exit_status(),
        }
    }

    pub fn get_human_exit_description(&self) -> String {
        human_exit_description(
            self.get_exit_status(),
            self.get_exit_code(),
            self.get_killing_signal(),
        )
    }

    pub fn get_stats(&self) -> String {
        let time_str = match self.get_execution_time() {
            Some(time) => format!("{time:.3} sec"),
            None => "(time unknown)".to_owned(),
        };
        let mem_str = match self.get_memory_used() {
            Some(memory) => format!("{:.2} MB", memory as f64 / (1024.0 * 1024.0)),
            None => "(memory usage unknown)".to_owned(),
        };
        format!("[{time_str} - {mem_str}]")
    }

    pub fn debug_message(&self) -> String {
        match self {
            Sandbox::Stupid(s) => s.debug_message(),
            Sandbox::Isolate(s) => s.debug_message(),
        }
    }

    ///
    /// Create an empty file in the sandbox and open it for writing.
    ///
    pub async fn create_file(
        &self,
        path: &Path,
        executable: bool,
        overwrite: bool,
    ) -> Result<tokio::fs::File, String> {
        if executable {
            debug!("Creating executable file {} in sandbox.", path.display());
        } else {
            debug!("Creating plain file {} in sandbox.", path.display());
        }
        let real_path = self.relative_path(path);
        if overwrite {
            let _ = tokio::fs::remove_file(&real_path).await;
        }
        if let Some(parent) = real_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("Failed to create sandbox directory: {e}"))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&real_path)
            .await
            .map_err(|e| format!("Failed to create file {} in sandbox: {e}", real_path.display()))?;
        set_mode(&real_path, if executable { 0o755 } else { 0o644 }).await?;
        Ok(file)
    }

    pub async fn create_symlink(
        &self,
        path: &Path,
        from_path: &Path,
        overwrite: bool,
    ) -> Result<PathBuf, String> {
        let real_path = self.relative_path(path);
        if overwrite {
            let _ = tokio::fs::remove_file(&real_path).await;
        }
        if let Some(parent) = real_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("Failed to create sandbox directory: {e}"))?;
        }
        let target = tokio::fs::canonicalize(from_path)
            .await
            .map_err(|e| format!("Failed to resolve {}: {e}", from_path.display()))?;
        tokio::fs::symlink(&target, &real_path)
            .await
            .map_err(|e| format!("Failed to create symlink {}: {e}", real_path.display()))?;
        Ok(real_path)
    }

    ///
    /// Materialize a storage digest inside the sandbox. With `try_symlink`, an executable
    /// is installed as a symlink into the storage when the backend supports it, saving a
    /// copy.
    ///
    pub async fn create_file_from_storage(
        &self,
        path: &Path,
        digest: &str,
        executable: bool,
        overwrite: bool,
        try_symlink: bool,
    ) -> Result<(), String> {
        if try_symlink && executable {
            if let Some(symlink_path) = self.file_cacher().path_for_symlink(digest) {
                if let Ok(created) = self.create_symlink(path, &symlink_path, overwrite).await {
                    set_mode(&created, 0o755).await?;
                    return Ok(());
                }
            }
        }
        let mut file = self.create_file(path, executable, overwrite).await?;
        self.file_cacher()
            .get_file_to_fobj(digest, &mut file)
            .await
            .map_err(|e| e.to_string())?;
        file.flush().await.map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn create_file_from_bytes(
        &self,
        path: &Path,
        content: &[u8],
        executable: bool,
        overwrite: bool,
    ) -> Result<(), String> {
        let mut file = self.create_file(path, executable, overwrite).await?;
        file.write_all(content).await.map_err(|e| e.to_string())?;
        file.flush().await.map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn create_file_from_string(
        &self,
        path: &Path,
        content: &str,
        executable: bool,
        overwrite: bool,
    ) -> Result<(), String> {
        self.create_file_from_bytes(path, content.as_bytes(), executable, overwrite)
            .await
    }

    pub async fn create_file_from_other_file(
        &self,
        path: &Path,
        from_path: &Path,
        executable: bool,
        overwrite: bool,
        try_symlink: bool,
    ) -> Result<(), String> {
        if try_symlink && executable {
            if let Ok(created) = self.create_symlink(path, from_path, overwrite).await {
                set_mode(&created, 0o755).await?;
                return Ok(());
            }
        }
        let mut src = tokio::fs::File::open(from_path)
            .await
            .map_err(|e| format!("Failed to open {}: {e}", from_path.display()))?;
        let mut file = self.create_file(path, executable, overwrite).await?;
        copy_chunked(&mut src, &mut file, None)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    ///
    /// Open a file in the sandbox for reading, optionally through a truncating view.
    ///
    pub async fn get_file(
        &self,
        path: &Path,
        trunc_len: Option<u64>,
    ) -> Result<Truncator<tokio::fs::File>, String> {
        debug!("Retrieving file {} from sandbox.", path.display());
        let real_path = self.relative_path(path);
        let file = tokio::fs::File::open(&real_path)
            .await
            .map_err(|e| format!("Failed to open {}: {e}", real_path.display()))?;
        Ok(Truncator::new(file, trunc_len))
    }

    pub async fn get_file_to_bytes(
        &self,
        path: &Path,
        maxlen: Option<u64>,
    ) -> Result<Vec<u8>, String> {
        let mut reader = self.get_file(path, maxlen).await?;
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|e| e.to_string())?;
        Ok(buf)
    }

    pub async fn get_file_to_string(
        &self,
        path: &Path,
        maxlen: Option<u64>,
    ) -> Result<String, String> {
        let bytes = self.get_file_to_bytes(path, maxlen).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    ///
    /// Put a sandbox file into the storage and return its digest.
    ///
    pub async fn get_file_to_storage(
        &self,
        path: &Path,
        description: &str,
        trunc_len: Option<u64>,
    ) -> Result<String, String> {
        let mut reader = self.get_file(path, trunc_len).await?;
        self.file_cacher()
            .put_file_from_fobj(&mut reader, description)
            .await
            .map_err(|e| e.to_string())
    }

    pub fn stat_file(&self, path: &Path) -> Result<std::fs::Metadata, String> {
        std::fs::metadata(self.relative_path(path)).map_err(|e| e.to_string())
    }

    pub fn file_exists(&self, path: &Path) -> bool {
        self.relative_path(path).exists()
    }

    pub async fn remove_file(&self, path: &Path) {
        let _ = tokio::fs::remove_file(self.relative_path(path)).await;
    }

    ///
    /// Expand a glob over the sandbox staging root, returning sandbox-relative paths.
    ///
    pub fn glob(&self, glob_expr: &str) -> Vec<PathBuf> {
        let root = self.relative_path(Path::new(""));
        let pattern = root.join(glob_expr);
        let Some(pattern) = pattern.to_str() else {
            return vec![];
        };
        let Ok(paths) = glob::glob(pattern) else {
            return vec![];
        };
        paths
            .filter_map(Result::ok)
            .filter_map(|p| p.strip_prefix(&root).map(Path::to_owned).ok())
            .collect()
    }
}

async fn set_mode(path: &Path, mode: u32) -> Result<(), String> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| format!("Failed to chmod {}: {e}", path.display()))
}

///
/// A read-only capped view over a reader. It provides a truncated version of the stream
/// without ever touching the underlying file.
///
pub struct Truncator<R> {
    inner: R,
    remaining: Option<u64>,
}

impl<R> Truncator<R> {
    pub fn new(inner: R, size: Option<u64>) -> Truncator<R> {
        Truncator {
            inner,
            remaining: size,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Truncator<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        match me.remaining {
            None => Pin::new(&mut me.inner).poll_read(cx, buf),
            Some(0) => Poll::Ready(Ok(())),
            Some(limit) => {
                let mut inner_buf = buf.take(limit.min(buf.remaining() as u64) as usize);
                ready!(Pin::new(&mut me.inner).poll_read(cx, &mut inner_buf))?;
                let filled = inner_buf.filled().len();
                unsafe {
                    buf.assume_init(filled);
                }
                buf.advance(filled);
                me.remaining = Some(limit - filled as u64);
                Poll::Ready(Ok(()))
            }
        }
    }
}

#[cfg(test)]
mod status_tests;

#[cfg(test)]
mod stupid_tests;
