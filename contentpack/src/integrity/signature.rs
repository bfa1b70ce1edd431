//! Signature verification for artifacts and manifests.
//!
//! Signatures are base64-encoded HMAC-SHA256 tags computed with the
//! application key over the raw bytes. The verifier sits behind
//! [`SignatureVerifier`] so a different scheme can be swapped in.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio_util::sync::CancellationToken;

use super::checksum::BUFFER_SIZE;
use crate::error::{InstallerError, InstallerResult};

type HmacSha256 = Hmac<Sha256>;

/// Validates detached signatures.
pub trait SignatureVerifier: Send + Sync {
    /// Verify a signature over an in-memory buffer.
    fn verify_bytes(&self, subject: &str, data: &[u8], signature: &str) -> InstallerResult<()>;

    /// Verify a signature over a file, streaming its contents.
    fn verify_file(
        &self,
        subject: &str,
        path: &Path,
        signature: &str,
        cancel: &CancellationToken,
    ) -> InstallerResult<()>;
}

/// HMAC-SHA256 verifier keyed with the application key.
///
/// Without a key every signed artifact is rejected.
#[derive(Clone, Default)]
pub struct HmacVerifier {
    key: Option<Vec<u8>>,
}

impl std::fmt::Debug for HmacVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacVerifier")
            .field("has_key", &self.key.is_some())
            .finish()
    }
}

impl HmacVerifier {
    pub fn new(key: Option<Vec<u8>>) -> Self {
        Self { key }
    }

    /// Produce a signature for `data`. Used by release tooling and tests.
    pub fn sign(&self, data: &[u8]) -> InstallerResult<String> {
        let mut mac = self.mac("signing")?;
        mac.update(data);
        Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    fn mac(&self, subject: &str) -> InstallerResult<HmacSha256> {
        let key = self.key.as_ref().ok_or_else(|| InstallerError::Signature {
            subject: subject.to_string(),
            reason: "no verification key configured".to_string(),
        })?;
        HmacSha256::new_from_slice(key).map_err(|e| InstallerError::Signature {
            subject: subject.to_string(),
            reason: format!("invalid key: {}", e),
        })
    }

    fn decode(subject: &str, signature: &str) -> InstallerResult<Vec<u8>> {
        general_purpose::STANDARD
            .decode(signature.trim())
            .map_err(|e| InstallerError::Signature {
                subject: subject.to_string(),
                reason: format!("signature is not valid base64: {}", e),
            })
    }

    fn finish(subject: &str, mac: HmacSha256, expected: &[u8]) -> InstallerResult<()> {
        mac.verify_slice(expected)
            .map_err(|_| InstallerError::Signature {
                subject: subject.to_string(),
                reason: "signature does not match".to_string(),
            })
    }
}

impl SignatureVerifier for HmacVerifier {
    fn verify_bytes(&self, subject: &str, data: &[u8], signature: &str) -> InstallerResult<()> {
        let expected = Self::decode(subject, signature)?;
        let mut mac = self.mac(subject)?;
        mac.update(data);
        Self::finish(subject, mac, &expected)
    }

    fn verify_file(
        &self,
        subject: &str,
        path: &Path,
        signature: &str,
        cancel: &CancellationToken,
    ) -> InstallerResult<()> {
        let expected = Self::decode(subject, signature)?;
        let mut mac = self.mac(subject)?;

        let mut file = File::open(path).map_err(|e| InstallerError::io(path, e))?;
        let mut buffer = vec![0u8; BUFFER_SIZE];
        loop {
            if cancel.is_cancelled() {
                return Err(InstallerError::Cancelled {
                    pack_id: subject.to_string(),
                });
            }
            let n = file
                .read(&mut buffer)
                .map_err(|e| InstallerError::io(path, e))?;
            if n == 0 {
                break;
            }
            mac.update(&buffer[..n]);
        }

        Self::finish(subject, mac, &expected)
    }
}
