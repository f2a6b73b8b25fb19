// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
mod cacher;
mod store;

pub use crate::cacher::{FileCacher, PrecacheGuard};
pub use crate::store::{
    copy_chunked, FileWithDescription, FilesystemStorage, NullStorage, PendingFile, Storage,
    StorageError, CHUNK_SIZE, TOMBSTONE_DIGEST,
};

#[cfg(test)]
mod store_tests;
