// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use std::fmt;
use std::io;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const FINGERPRINT_SIZE: usize = 20;

// Streamed digesting reads through a buffer of this size, awaiting between chunks.
const DIGEST_CHUNK_SIZE: usize = 64 * 1024;

///
/// A SHA-1 content fingerprint. The content-addressed storage and the dependency cache
/// are both keyed by the hex rendering of this value, so a fingerprint is always an
/// exact function of the bytes it was computed over.
///
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    /// Fingerprint a byte slice in one shot.
    pub fn digest(bytes: &[u8]) -> Fingerprint {
        let mut digester = Digester::new();
        digester.update(bytes);
        digester.finish()
    }

    pub fn from_hex(hex_string: &str) -> Result<Fingerprint, String> {
        let bytes = hex::decode(hex_string)
            .map_err(|e| format!("Invalid fingerprint {hex_string:?}: {e}"))?;
        let bytes: [u8; FINGERPRINT_SIZE] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            format!(
                "Invalid fingerprint {hex_string:?}: expected {FINGERPRINT_SIZE} bytes, got {}",
                bytes.len()
            )
        })?;
        Ok(Fingerprint(bytes))
    }

    #[allow(clippy::wrong_self_convention)]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    ///
    /// A 64-bit value cut from the fingerprint. Since the fingerprint comes from a
    /// strong hash, the prefix is itself a strong short hash, usable as a deterministic
    /// seed for content-keyed randomness.
    ///
    pub fn prefix_u64(&self) -> u64 {
        let mut prefix = [0_u8; 8];
        prefix.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(prefix)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint<{}>", self.to_hex())
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Fingerprint, String> {
        Fingerprint::from_hex(s)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Fingerprint, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

///
/// An incremental fingerprint computation: feed it bytes as they stream by and finish
/// into the resulting Fingerprint. Keeps a count of the bytes seen, so callers copying
/// while digesting do not need a second pass for the size.
///
pub struct Digester {
    hasher: Sha1,
    byte_count: u64,
}

impl Digester {
    pub fn new() -> Digester {
        Digester {
            hasher: Sha1::new(),
            byte_count: 0,
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.byte_count += bytes.len() as u64;
    }

    pub fn bytes_seen(&self) -> u64 {
        self.byte_count
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(self.hasher.finalize().into())
    }
}

///
/// Fingerprint everything a reader yields, chunk by chunk, without retaining the
/// content anywhere.
///
pub async fn digest_reader<R>(reader: &mut R) -> io::Result<Fingerprint>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut digester = Digester::new();
    let mut buf = vec![0_u8; DIGEST_CHUNK_SIZE];
    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        digester.update(&buf[..read]);
    }
    Ok(digester.finish())
}

#[cfg(test)]
mod tests;
