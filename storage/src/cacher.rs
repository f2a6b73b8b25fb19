// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hashing::Digester;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::store::{
    copy_chunked, create_directory_or_die, FileWithDescription, Storage, StorageError,
    CHUNK_SIZE, TOMBSTONE_DIGEST,
};

///
/// A two-level cache for digests: a process-local scratch directory in front of a backing
/// Storage. The first read of a digest streams it from the backing storage into a local
/// file named by the digest; later reads open the local file directly. Writes commit
/// locally first and to the backing storage second, so a crash in between leaves the local
/// cache usable and the backing storage unchanged.
///
pub struct FileCacher {
    backend: Arc<dyn Storage>,
    shared: bool,
    file_dir: PathBuf,
    temp_dir: tempfile::TempDir,
    // Owns the scratch directory in exclusive mode so it is deleted on drop.
    _exclusive_dir: Option<tempfile::TempDir>,
    folder: Option<PathBuf>,
}

impl FileCacher {
    ///
    /// An exclusive cacher: the scratch directory is freshly created and deleted when the
    /// cacher is dropped.
    ///
    pub fn new(backend: Arc<dyn Storage>) -> Result<FileCacher, StorageError> {
        let exclusive_dir = tempfile::TempDir::new()
            .map_err(|e| format!("Failed to create cacher scratch directory: {e}"))?;
        let file_dir = exclusive_dir.path().to_owned();
        let temp_dir = Self::temp_dir_in(&file_dir)?;
        Ok(FileCacher {
            backend,
            shared: false,
            file_dir,
            temp_dir,
            _exclusive_dir: Some(exclusive_dir),
            folder: None,
        })
    }

    ///
    /// A shared cacher: the scratch directory lives under `folder` and persists across
    /// processes. Concurrent precache phases are coordinated by `precache_lock`.
    ///
    pub fn new_shared(backend: Arc<dyn Storage>, folder: PathBuf) -> Result<FileCacher, StorageError> {
        create_directory_or_die(&folder)?;
        let file_dir = folder.join("fs-cache-shared");
        create_directory_or_die(&file_dir)?;
        let temp_dir = Self::temp_dir_in(&file_dir)?;
        Ok(FileCacher {
            backend,
            shared: true,
            file_dir,
            temp_dir,
            _exclusive_dir: None,
            folder: Some(folder),
        })
    }

    fn temp_dir_in(file_dir: &Path) -> Result<tempfile::TempDir, StorageError> {
        // Temp files must live under file_dir to avoid cross-filesystem moves.
        tempfile::Builder::new()
            .prefix("_temp")
            .tempdir_in(file_dir)
            .map_err(|e| format!("Failed to create cacher temp directory: {e}").into())
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn backend(&self) -> &Arc<dyn Storage> {
        &self.backend
    }

    ///
    /// Take an exclusive advisory lock over the shared cache directory for a precache
    /// phase. Ordinary reads and writes do not lock; they rely on write-temp-then-rename
    /// atomicity.
    ///
    pub fn precache_lock(&self) -> Result<Option<PrecacheGuard>, StorageError> {
        let Some(folder) = &self.folder else {
            return Ok(None);
        };
        let lock_path = folder.join("cacher.lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| format!("Failed to open {}: {e}", lock_path.display()))?;
        nix::fcntl::flock(file.as_raw_fd(), nix::fcntl::FlockArg::LockExclusive)
            .map_err(|e| format!("Failed to lock {}: {e}", lock_path.display()))?;
        Ok(Some(PrecacheGuard { _file: file }))
    }

    fn local_path(&self, digest: &str) -> PathBuf {
        self.file_dir.join(digest)
    }

    ///
    /// Ensure a local copy of the digest exists and return its path.
    ///
    async fn cache_locally(&self, digest: &str) -> Result<PathBuf, StorageError> {
        if digest == TOMBSTONE_DIGEST {
            return Err(StorageError::Tombstone);
        }
        let local = self.local_path(digest);
        if tokio::fs::metadata(&local).await.is_ok() {
            return Ok(local);
        }

        debug!("Fetching file {digest} from the backing storage");
        let mut reader = self.backend.get(digest).await?;
        let temp = tempfile::Builder::new()
            .tempfile_in(self.temp_dir.path())
            .map_err(|e| format!("Failed to create temporary cache file: {e}"))?;
        let (file, temp_path) = temp
            .keep()
            .map_err(|e| format!("Failed to persist temporary cache file: {e}"))?;
        let mut writer = tokio::fs::File::from_std(file);
        copy_chunked(&mut reader, &mut writer, None).await?;
        writer.sync_all().await?;
        drop(writer);
        tokio::fs::rename(&temp_path, &local).await?;
        Ok(local)
    }

    pub async fn get_file(&self, digest: &str) -> Result<tokio::fs::File, StorageError> {
        let path = self.cache_locally(digest).await?;
        Ok(tokio::fs::File::open(path).await?)
    }

    pub async fn get_file_to_path(&self, digest: &str, dst: &Path) -> Result<(), StorageError> {
        let src = self.cache_locally(digest).await?;
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut reader = tokio::fs::File::open(src).await?;
        let mut writer = tokio::fs::File::create(dst).await?;
        copy_chunked(&mut reader, &mut writer, None).await?;
        Ok(())
    }

    pub async fn get_file_to_fobj<W>(&self, digest: &str, writer: &mut W) -> Result<(), StorageError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut reader = self.get_file(digest).await?;
        copy_chunked(&mut reader, writer, None).await?;
        Ok(())
    }

    pub async fn get_file_content(&self, digest: &str) -> Result<Vec<u8>, StorageError> {
        let mut reader = self.get_file(digest).await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    pub async fn get_file_to_string(
        &self,
        digest: &str,
        maxlen: Option<u64>,
    ) -> Result<String, StorageError> {
        let mut reader = self.get_file(digest).await?;
        let mut buf = Vec::new();
        match maxlen {
            Some(n) => {
                let mut limited = (&mut reader).take(n);
                limited.read_to_end(&mut buf).await?;
            }
            None => {
                reader.read_to_end(&mut buf).await?;
            }
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    pub async fn get_size(&self, digest: &str) -> Result<u64, StorageError> {
        let local = self.local_path(digest);
        if let Ok(meta) = tokio::fs::metadata(&local).await {
            return Ok(meta.len());
        }
        self.backend.size(digest).await
    }

    pub async fn describe(&self, digest: &str) -> Result<String, StorageError> {
        self.backend.describe(digest).await
    }

    pub async fn exists(&self, digest: &str) -> Result<bool, StorageError> {
        if tokio::fs::metadata(self.local_path(digest)).await.is_ok() {
            return Ok(true);
        }
        self.backend.exists(digest).await
    }

    ///
    /// Digest the stream while writing it to a temporary local file, move it into the
    /// local cache, and only then stream the committed local file into the backing
    /// storage. Returns the hex digest of the content.
    ///
    pub async fn put_file_from_fobj<R>(
        &self,
        reader: &mut R,
        description: &str,
    ) -> Result<String, StorageError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let temp = tempfile::Builder::new()
            .tempfile_in(self.temp_dir.path())
            .map_err(|e| format!("Failed to create temporary cache file: {e}"))?;
        let (file, temp_path) = temp
            .keep()
            .map_err(|e| format!("Failed to persist temporary cache file: {e}"))?;

        // Digest while writing, chunk by chunk, so the content is only read once.
        let mut writer = tokio::fs::File::from_std(file);
        let mut digester = Digester::new();
        let mut buf = vec![0_u8; CHUNK_SIZE];
        loop {
            let read = reader.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            digester.update(&buf[..read]);
            writer.write_all(&buf[..read]).await?;
        }
        writer.sync_all().await?;
        drop(writer);

        let digest_hex = digester.finish().to_hex();
        let local = self.local_path(&digest_hex);
        if tokio::fs::metadata(&local).await.is_ok() {
            tokio::fs::remove_file(&temp_path).await?;
        } else {
            tokio::fs::rename(&temp_path, &local).await?;
        }

        // Local commit happened first; a crash below leaves the backing storage unchanged
        // and the local cache usable.
        if let Some(mut pending) = self.backend.create(&digest_hex).await? {
            let mut local_reader = tokio::fs::File::open(&local).await?;
            copy_chunked(&mut local_reader, pending.file_mut(), None).await?;
            self.backend.commit(pending, description).await?;
        }

        Ok(digest_hex)
    }

    pub async fn put_file_from_path(&self, path: &Path) -> Result<String, StorageError> {
        let mut reader = tokio::fs::File::open(path)
            .await
            .map_err(|e| format!("Failed to open {}: {e}", path.display()))?;
        self.put_file_from_fobj(&mut reader, "").await
    }

    pub async fn put_file_from_bytes(&self, content: &[u8]) -> Result<String, StorageError> {
        let mut reader = content;
        self.put_file_from_fobj(&mut reader, "").await
    }

    pub async fn delete(&self, digest: &str) -> Result<(), StorageError> {
        let _ = tokio::fs::remove_file(self.local_path(digest)).await;
        self.backend.delete(digest).await
    }

    pub async fn list(&self) -> Result<Vec<FileWithDescription>, StorageError> {
        self.backend.list().await
    }

    pub fn path_for_symlink(&self, digest: &str) -> Option<PathBuf> {
        self.backend.path_for_symlink(digest)
    }

    ///
    /// Drop every locally cached file, keeping the backing storage intact.
    ///
    pub async fn purge_cache(&self) -> Result<(), StorageError> {
        let mut entries = tokio::fs::read_dir(&self.file_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for FileCacher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCacher")
            .field("shared", &self.shared)
            .field("file_dir", &self.file_dir)
            .finish_non_exhaustive()
    }
}

///
/// Held for the duration of a precache phase; the advisory lock releases when the guard
/// is dropped.
///
pub struct PrecacheGuard {
    _file: std::fs::File,
}
