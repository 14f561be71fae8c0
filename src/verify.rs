//! Integrity verification for completed transfers.
//!
//! The engine is agnostic to the hash algorithm: anything implementing
//! [`sha2::Digest`] plugs in through the blanket [`Hasher`] impl, and
//! callers may implement [`Hasher`] directly for algorithms outside the
//! RustCrypto family.

use std::path::Path;

use sha2::Digest;
use tokio::io::AsyncReadExt;

use crate::error::{DownloadError, Result};

/// Incremental hash consumer producing a fixed-length digest.
pub trait Hasher: Send {
    /// Feed a slice of transferred bytes into the hash state.
    fn update(&mut self, data: &[u8]);

    /// Consume the hasher and return the digest.
    fn finish(self: Box<Self>) -> Vec<u8>;
}

impl<D> Hasher for D
where
    D: Digest + Send,
{
    fn update(&mut self, data: &[u8]) {
        Digest::update(self, data);
    }

    fn finish(self: Box<Self>) -> Vec<u8> {
        (*self).finalize().to_vec()
    }
}

/// Compares two digests without early exit, so the comparison time does
/// not leak the position of the first mismatching byte.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Streams a file from disk through `hasher` and returns the digest.
///
/// Used when the bytes on disk were not all seen by the transfer loop:
/// resumed downloads and already-complete short-circuits.
pub(crate) async fn hash_file(
    path: &Path,
    mut hasher: Box<dyn Hasher>,
    buffer_size: usize,
) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(DownloadError::FileSystem)?;
    let mut buffer = vec![0u8; buffer_size];

    loop {
        let count = file.read(&mut buffer).await?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }

    Ok(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::Sha256;

    #[test]
    fn digest_matches_direct_computation() {
        let mut hasher: Box<dyn Hasher> = Box::new(Sha256::new());
        hasher.update(b"hello ");
        hasher.update(b"world");

        let expected = Sha256::digest(b"hello world").to_vec();
        assert_eq!(hasher.finish(), expected);
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }

    #[tokio::test]
    async fn hash_file_streams_whole_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let content = vec![7u8; 100_000];
        tokio::fs::write(&path, &content).await.unwrap();

        let digest = hash_file(&path, Box::new(Sha256::new()), 8192)
            .await
            .unwrap();
        assert_eq!(digest, Sha256::digest(&content).to_vec());
    }
}
