//! Content checksums: parsing, hashing, and comparison.
//!
//! Catalog checksums are written as `<algorithm>:<hex digest>`, for example
//! `sha256:b94d27b9...`. A bare hex digest is accepted for manifests that
//! predate the prefix and is interpreted by its length.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256, Sha512};
use tokio_util::sync::CancellationToken;

use crate::error::{InstallerError, InstallerResult};

/// Buffer size for reading files during checksum calculation (64KB).
pub(crate) const BUFFER_SIZE: usize = 64 * 1024;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    /// Prefix used in the textual form.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Digest length in bytes.
    pub fn digest_len(&self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Some(Self::Sha256),
            "sha512" | "sha-512" => Some(Self::Sha512),
            _ => None,
        }
    }

    fn from_hex_len(len: usize) -> Option<Self> {
        match len {
            64 => Some(Self::Sha256),
            128 => Some(Self::Sha512),
            _ => None,
        }
    }

    /// Start an incremental hash.
    pub fn hasher(&self) -> ContentHasher {
        match self {
            Self::Sha256 => ContentHasher::Sha256(Sha256::new()),
            Self::Sha512 => ContentHasher::Sha512(Sha512::new()),
        }
    }
}

/// Incremental hasher over one of the supported algorithms.
#[derive(Clone)]
pub enum ContentHasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl ContentHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Checksum {
        match self {
            Self::Sha256(h) => Checksum {
                algorithm: ChecksumAlgorithm::Sha256,
                digest: h.finalize().to_vec(),
            },
            Self::Sha512(h) => Checksum {
                algorithm: ChecksumAlgorithm::Sha512,
                digest: h.finalize().to_vec(),
            },
        }
    }
}

/// A digest tagged with its algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Checksum {
    algorithm: ChecksumAlgorithm,
    digest: Vec<u8>,
}

impl Checksum {
    /// Create from raw digest bytes.
    pub fn new(algorithm: ChecksumAlgorithm, digest: Vec<u8>) -> InstallerResult<Self> {
        if digest.len() != algorithm.digest_len() {
            return Err(InstallerError::InvalidCatalog(format!(
                "{} digest must be {} bytes, got {}",
                algorithm.prefix(),
                algorithm.digest_len(),
                digest.len()
            )));
        }
        Ok(Self { algorithm, digest })
    }

    /// Compute the checksum of an in-memory buffer.
    pub fn of_bytes(algorithm: ChecksumAlgorithm, data: &[u8]) -> Self {
        let mut hasher = algorithm.hasher();
        hasher.update(data);
        hasher.finalize()
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    /// Lowercase hex digest without the algorithm prefix.
    pub fn hex(&self) -> String {
        hex::encode(&self.digest)
    }

    /// Compare against another checksum without short-circuiting on content.
    ///
    /// The loop visits every byte regardless of where the first difference is.
    pub fn matches(&self, other: &Checksum) -> bool {
        if self.algorithm != other.algorithm || self.digest.len() != other.digest.len() {
            return false;
        }
        let diff = self
            .digest
            .iter()
            .zip(other.digest.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        diff == 0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.prefix(), self.hex())
    }
}

impl FromStr for Checksum {
    type Err = InstallerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (algorithm, hex_digest) = match s.split_once(':') {
            Some((prefix, digest)) => {
                let algorithm = ChecksumAlgorithm::from_prefix(prefix).ok_or_else(|| {
                    InstallerError::InvalidCatalog(format!(
                        "unsupported checksum algorithm '{}'",
                        prefix
                    ))
                })?;
                (algorithm, digest)
            }
            None => {
                let algorithm = ChecksumAlgorithm::from_hex_len(s.len()).ok_or_else(|| {
                    InstallerError::InvalidCatalog(format!(
                        "checksum '{}' has no algorithm prefix and an unrecognised length",
                        s
                    ))
                })?;
                (algorithm, s)
            }
        };

        let digest = hex::decode(hex_digest).map_err(|e| {
            InstallerError::InvalidCatalog(format!("checksum '{}' is not valid hex: {}", s, e))
        })?;
        Self::new(algorithm, digest)
    }
}

impl Serialize for Checksum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Hash a file in chunks.
///
/// `cancel` is checked between chunks and `on_progress` receives the running
/// byte count. Intended to run on the blocking pool.
pub fn hash_file(
    path: &Path,
    algorithm: ChecksumAlgorithm,
    pack_id: &str,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(u64),
) -> InstallerResult<Checksum> {
    let mut file = File::open(path).map_err(|e| InstallerError::io(path, e))?;
    let mut hasher = algorithm.hasher();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut processed = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Err(InstallerError::Cancelled {
                pack_id: pack_id.to_string(),
            });
        }

        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| InstallerError::io(path, e))?;
        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
        processed += bytes_read as u64;
        on_progress(processed);
    }

    Ok(hasher.finalize())
}
