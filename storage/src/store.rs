// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

///
/// Chunk size for streaming copies through the store and the cacher. Copies await between
/// chunks, which keeps long transfers cooperative with the rest of the runtime.
///
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// A reserved digest value marking content that was deliberately deleted. Reads of a
/// tombstone fail loudly rather than falling through to a plain miss.
pub const TOMBSTONE_DIGEST: &str = "x";

#[derive(Debug, PartialEq, Eq)]
pub enum StorageError {
    /// The digest is not present in the storage.
    MissingDigest(String),
    /// The digest refers to deleted content.
    Tombstone,
    Unclassified(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::MissingDigest(digest) => {
                write!(f, "Digest {digest} was not present in the storage")
            }
            StorageError::Tombstone => write!(f, "Attempted to read deleted content"),
            StorageError::Unclassified(s) => write!(f, "{s}"),
        }
    }
}

impl From<String> for StorageError {
    fn from(err: String) -> Self {
        StorageError::Unclassified(err)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Unclassified(err.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileWithDescription {
    pub name: String,
    pub description: String,
}

///
/// A blob in the process of being stored: the caller writes the content to `file` and then
/// hands the value back to `commit`, which moves it into its final location atomically.
///
pub struct PendingFile {
    pub(crate) file: tokio::fs::File,
    pub(crate) temp_path: PathBuf,
    pub(crate) name: String,
}

impl PendingFile {
    pub fn file_mut(&mut self) -> &mut tokio::fs::File {
        &mut self.file
    }
}

///
/// A content-addressed blob store keyed by hex digests.
///
/// Writes go through `create`/`commit`: content is written to a temporary file in the same
/// directory as its final location and renamed over on commit. Two processes racing to
/// commit the same digest are safe because the rename is atomic and the content is
/// identical by hash assumption. Readers are not synchronized with deleters; callers must
/// not delete digests which may still have active readers.
///
#[async_trait]
pub trait Storage: Send + Sync {
    /// Open a blob for reading. Fails with `MissingDigest` when absent.
    async fn get(
        &self,
        name: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin + 'static>, StorageError>;

    /// Start storing a blob. Returns None when the digest is already present, in which
    /// case the caller does not need to store the content at all.
    async fn create(&self, name: &str) -> Result<Option<PendingFile>, StorageError>;

    /// Commit a blob created by `create`. Returns whether this call actually installed the
    /// content (false means someone else got there first, which makes no difference to the
    /// caller outside of tests).
    async fn commit(&self, file: PendingFile, description: &str) -> Result<bool, StorageError>;

    async fn exists(&self, name: &str) -> Result<bool, StorageError>;

    async fn describe(&self, name: &str) -> Result<String, StorageError>;

    async fn size(&self, name: &str) -> Result<u64, StorageError>;

    async fn delete(&self, name: &str) -> Result<(), StorageError>;

    async fn list(&self) -> Result<Vec<FileWithDescription>, StorageError>;

    /// A stable filesystem path for the blob, when the storage is filesystem-backed.
    /// Sandboxes use this to install executables via symlink instead of copying.
    fn path_for_symlink(&self, name: &str) -> Option<PathBuf>;
}

///
/// Copy `reader` into `writer` through CHUNK_SIZE buffers, up to `maxlen` bytes when given.
///
pub async fn copy_chunked<R, W>(
    reader: &mut R,
    writer: &mut W,
    maxlen: Option<u64>,
) -> Result<u64, StorageError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut remaining = maxlen;
    let mut buf = vec![0_u8; CHUNK_SIZE];
    let mut copied: u64 = 0;
    loop {
        let cap = match remaining {
            Some(0) => break,
            Some(n) => std::cmp::min(n as usize, CHUNK_SIZE),
            None => CHUNK_SIZE,
        };
        let read = reader.read(&mut buf[..cap]).await?;
        if read == 0 {
            break;
        }
        writer.write_all(&buf[..read]).await?;
        copied += read as u64;
        if let Some(n) = remaining {
            remaining = Some(n - read as u64);
        }
    }
    writer.flush().await?;
    Ok(copied)
}

///
/// Stores blobs as flat files named by their digest under a root directory.
///
pub struct FilesystemStorage {
    path: PathBuf,
}

impl FilesystemStorage {
    pub fn new(path: PathBuf) -> Result<FilesystemStorage, StorageError> {
        std::fs::create_dir_all(&path)
            .map_err(|e| format!("Failed to create storage directory {}: {e}", path.display()))?;
        Ok(FilesystemStorage { path })
    }

    fn blob_path(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

#[async_trait]
impl Storage for FilesystemStorage {
    async fn get(
        &self,
        name: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin + 'static>, StorageError> {
        if name == TOMBSTONE_DIGEST {
            return Err(StorageError::Tombstone);
        }
        match tokio::fs::File::open(self.blob_path(name)).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::MissingDigest(name.to_owned()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, name: &str) -> Result<Option<PendingFile>, StorageError> {
        let final_path = self.blob_path(name);
        if tokio::fs::metadata(&final_path).await.is_ok() {
            return Ok(None);
        }

        // The temporary file lives in the same directory as the final location so that the
        // commit rename never crosses filesystems.
        let temp = tempfile::Builder::new()
            .prefix(".tmp.")
            .suffix(name)
            .tempfile_in(&self.path)
            .map_err(|e| format!("Failed to create temporary storage file: {e}"))?;
        let (file, temp_path) = temp
            .keep()
            .map_err(|e| format!("Failed to persist temporary storage file: {e}"))?;
        Ok(Some(PendingFile {
            file: tokio::fs::File::from_std(file),
            temp_path,
            name: name.to_owned(),
        }))
    }

    async fn commit(
        &self,
        mut file: PendingFile,
        _description: &str,
    ) -> Result<bool, StorageError> {
        file.file.flush().await?;
        file.file.sync_all().await?;
        drop(file.file);

        let final_path = self.blob_path(&file.name);
        if tokio::fs::metadata(&final_path).await.is_ok() {
            // Someone else committed the same digest between create and commit. The content
            // is identical, so just discard the temporary file.
            tokio::fs::remove_file(&file.temp_path).await?;
            return Ok(false);
        }
        tokio::fs::rename(&file.temp_path, &final_path).await?;
        Ok(true)
    }

    async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        Ok(tokio::fs::metadata(self.blob_path(name)).await.is_ok())
    }

    async fn describe(&self, name: &str) -> Result<String, StorageError> {
        if self.exists(name).await? {
            Ok(String::new())
        } else {
            Err(StorageError::MissingDigest(name.to_owned()))
        }
    }

    async fn size(&self, name: &str) -> Result<u64, StorageError> {
        match tokio::fs::metadata(self.blob_path(name)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::MissingDigest(name.to_owned()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, name: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.blob_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<FileWithDescription>, StorageError> {
        let mut entries = tokio::fs::read_dir(&self.path).await?;
        let mut res = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(".tmp.") {
                continue;
            }
            res.push(FileWithDescription {
                name,
                description: String::new(),
            });
        }
        res.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(res)
    }

    fn path_for_symlink(&self, name: &str) -> Option<PathBuf> {
        let path = self.blob_path(name);
        path.is_file().then_some(path)
    }
}

impl fmt::Debug for FilesystemStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilesystemStorage")
            .field("path", &self.path)
            .finish()
    }
}

///
/// A storage that is always empty and drops every blob it receives. Useful for
/// short-lived contexts that only want the local caching half of a FileCacher.
///
pub struct NullStorage;

#[async_trait]
impl Storage for NullStorage {
    async fn get(
        &self,
        name: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin + 'static>, StorageError> {
        Err(StorageError::MissingDigest(name.to_owned()))
    }

    async fn create(&self, _name: &str) -> Result<Option<PendingFile>, StorageError> {
        Ok(None)
    }

    async fn commit(&self, _file: PendingFile, _description: &str) -> Result<bool, StorageError> {
        Ok(false)
    }

    async fn exists(&self, _name: &str) -> Result<bool, StorageError> {
        Ok(false)
    }

    async fn describe(&self, name: &str) -> Result<String, StorageError> {
        Err(StorageError::MissingDigest(name.to_owned()))
    }

    async fn size(&self, name: &str) -> Result<u64, StorageError> {
        Err(StorageError::MissingDigest(name.to_owned()))
    }

    async fn delete(&self, _name: &str) -> Result<(), StorageError> {
        Ok(())
    }

    async fn list(&self) -> Result<Vec<FileWithDescription>, StorageError> {
        Ok(vec![])
    }

    fn path_for_symlink(&self, _name: &str) -> Option<PathBuf> {
        None
    }
}

pub(crate) fn create_directory_or_die(path: &Path) -> Result<(), StorageError> {
    std::fs::create_dir_all(path)
        .map_err(|e| format!("Cannot create directory {}: {e}", path.display()))?;
    Ok(())
}
