//! Content hashing for change classification.
//!
//! The drive reports MD5 content hashes, so MD5 is the default algorithm;
//! SHA-256 is available for deployments that maintain their own hashes on
//! both sides. Whatever the algorithm, the output is lowercase hex with a
//! stable length.

use std::path::Path;

use md5::Md5;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::Result;

/// Checksum placeholder for content that has no hash (folders, never-read files).
pub const CHECKSUM_UNKNOWN: &str = "-";

/// Checksum placeholder for content that was requested but unreadable.
pub const CHECKSUM_UNREADABLE: &str = "<unknown>";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl HashAlgorithm {
    /// Length of the hex digest this algorithm produces.
    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Md5 => 32,
            HashAlgorithm::Sha256 => 64,
        }
    }

    pub fn hash_bytes(&self, bytes: &[u8]) -> String {
        match self {
            HashAlgorithm::Md5 => hex::encode(Md5::digest(bytes)),
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(bytes)),
        }
    }

    /// Hash a file's content in chunks. The caller decides how to treat a
    /// missing or unreadable file; this just reports the IO error.
    pub async fn hash_file(&self, path: &Path) -> Result<String> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut buf = vec![0u8; 64 * 1024];
        match self {
            HashAlgorithm::Md5 => {
                let mut hasher = Md5::new();
                loop {
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                Ok(hex::encode(hasher.finalize()))
            }
            HashAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                loop {
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                Ok(hex::encode(hasher.finalize()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_matches_known_vectors() {
        let algo = HashAlgorithm::Md5;
        assert_eq!(algo.hash_bytes(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(algo.hash_bytes(b"abcd"), "e2fc714c4727ee9395f324cd2e7f331f");
    }

    #[test]
    fn sha256_matches_known_vector() {
        let algo = HashAlgorithm::Sha256;
        assert_eq!(
            algo.hash_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn digest_len_is_stable() {
        assert_eq!(
            HashAlgorithm::Md5.hash_bytes(b"x").len(),
            HashAlgorithm::Md5.digest_len()
        );
        assert_eq!(
            HashAlgorithm::Sha256.hash_bytes(b"x").len(),
            HashAlgorithm::Sha256.digest_len()
        );
    }

    #[tokio::test]
    async fn hash_file_matches_hash_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        tokio::fs::write(&path, b"abcd").await.unwrap();
        let got = HashAlgorithm::Md5.hash_file(&path).await.unwrap();
        assert_eq!(got, HashAlgorithm::Md5.hash_bytes(b"abcd"));
    }

    #[tokio::test]
    async fn hash_file_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(HashAlgorithm::Md5.hash_file(&missing).await.is_err());
    }
}
