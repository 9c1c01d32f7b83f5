//! Content digests for transferred files.
//!
//! [`IntegrityVerifier`] hashes finalized files and compares them against an
//! expected digest. [`StreamingDigest`] is the incremental form used while a
//! file is still being copied.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use access::{BridgeError, Result};
use md5::Md5;
use sha2::{Digest, Sha256, Sha512};

/// Buffer size used when hashing files from disk (64KB).
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestAlgorithm {
    #[default]
    Sha256,
    Sha512,
    Md5,
    Crc32,
}

impl DigestAlgorithm {
    /// Parses an algorithm name, falling back to SHA-256 for unknown names.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "sha256" => DigestAlgorithm::Sha256,
            "sha512" => DigestAlgorithm::Sha512,
            "md5" => DigestAlgorithm::Md5,
            "crc32" => DigestAlgorithm::Crc32,
            other => {
                tracing::warn!(algorithm = other, "Unknown digest algorithm, using sha256");
                DigestAlgorithm::Sha256
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
            DigestAlgorithm::Md5 => "md5",
            DigestAlgorithm::Crc32 => "crc32",
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incremental hasher for one of the supported algorithms.
#[derive(Clone)]
pub enum StreamingDigest {
    Sha256(Sha256),
    Sha512(Sha512),
    Md5(Md5),
    Crc32(crc32fast::Hasher),
}

impl StreamingDigest {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Sha256 => StreamingDigest::Sha256(Sha256::new()),
            DigestAlgorithm::Sha512 => StreamingDigest::Sha512(Sha512::new()),
            DigestAlgorithm::Md5 => StreamingDigest::Md5(Md5::new()),
            DigestAlgorithm::Crc32 => StreamingDigest::Crc32(crc32fast::Hasher::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            StreamingDigest::Sha256(h) => h.update(data),
            StreamingDigest::Sha512(h) => h.update(data),
            StreamingDigest::Md5(h) => h.update(data),
            StreamingDigest::Crc32(h) => h.update(data),
        }
    }

    /// Feeds everything `reader` yields into the hasher. Returns bytes read.
    pub fn update_from<R: Read>(&mut self, reader: &mut R) -> std::io::Result<u64> {
        let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                return Ok(total);
            }
            self.update(&buffer[..n]);
            total += n as u64;
        }
    }

    /// Lowercase hex digest of the bytes seen so far, without consuming the hasher.
    pub fn snapshot(&self) -> String {
        self.clone().finalize()
    }

    /// Lowercase hex digest of everything fed to the hasher.
    pub fn finalize(self) -> String {
        match self {
            StreamingDigest::Sha256(h) => hex::encode(h.finalize()),
            StreamingDigest::Sha512(h) => hex::encode(h.finalize()),
            StreamingDigest::Md5(h) => hex::encode(h.finalize()),
            StreamingDigest::Crc32(h) => format!("{:08x}", h.finalize()),
        }
    }
}

/// Computes and compares file digests.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityVerifier {
    algorithm: DigestAlgorithm,
}

impl IntegrityVerifier {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self { algorithm }
    }

    /// Creates a verifier from a configured algorithm name.
    pub fn from_name(name: &str) -> Self {
        Self::new(DigestAlgorithm::from_name(name))
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Returns a fresh streaming hasher for this verifier's algorithm.
    pub fn hasher(&self) -> StreamingDigest {
        StreamingDigest::new(self.algorithm)
    }

    /// Hashes the file at `path` and returns the lowercase hex digest.
    pub fn calculate_hash(&self, path: &Path) -> Result<String> {
        let mut file = File::open(path).map_err(|e| {
            BridgeError::from(e).with_context("path", path.display())
        })?;
        let mut hasher = self.hasher();
        hasher.update_from(&mut file)?;
        Ok(hasher.finalize())
    }

    /// Hashes `path` and compares it to `expected` (hex, case-insensitive).
    ///
    /// Returns the actual digest on match and an `IntegrityMismatch` error
    /// carrying both digests otherwise.
    pub fn verify(&self, path: &Path, expected: &str) -> Result<String> {
        let actual = self.calculate_hash(path)?;
        let expected = expected.trim();
        if !actual.eq_ignore_ascii_case(expected) {
            tracing::warn!(
                path = %path.display(),
                algorithm = %self.algorithm,
                "Digest mismatch"
            );
            return Err(BridgeError::integrity_mismatch(expected, &actual)
                .with_context("path", path.display())
                .with_context("algorithm", self.algorithm));
        }
        Ok(actual)
    }
}
