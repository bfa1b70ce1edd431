//! Integrity verification of downloaded artifacts.
//!
//! - `checksum`: digest parsing, chunked file hashing, comparison
//! - `signature`: detached signature verification
//!
//! A successful check yields a [`VerificationReceipt`]. The receipt can only
//! be minted here, and the state store requires one to mark a pack installed.

mod checksum;
mod signature;

pub use checksum::{hash_file, Checksum, ChecksumAlgorithm, ContentHasher};
pub use signature::{HmacVerifier, SignatureVerifier};

use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{InstallerError, InstallerResult};

/// Proof that an artifact passed checksum (and signature, when present) checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReceipt {
    pack_id: String,
    checksum: Checksum,
    signature_checked: bool,
}

impl VerificationReceipt {
    pub fn pack_id(&self) -> &str {
        &self.pack_id
    }

    pub fn checksum(&self) -> &Checksum {
        &self.checksum
    }

    pub fn signature_checked(&self) -> bool {
        self.signature_checked
    }

    /// Receipt for test fixtures that need to reach the installed state directly.
    #[cfg(test)]
    pub(crate) fn for_tests(pack_id: &str, checksum: Checksum) -> Self {
        Self {
            pack_id: pack_id.to_string(),
            checksum,
            signature_checked: false,
        }
    }
}

/// Verify a downloaded file against its expected checksum.
///
/// On mismatch the file is deleted before the error is returned.
pub fn verify_checksum(
    pack_id: &str,
    path: &Path,
    expected: &Checksum,
    cancel: &CancellationToken,
    on_progress: impl FnMut(u64),
) -> InstallerResult<VerificationReceipt> {
    let actual = hash_file(path, expected.algorithm(), pack_id, cancel, on_progress)?;

    if !actual.matches(expected) {
        warn!(pack_id = %pack_id, expected = %expected, actual = %actual, "Checksum mismatch, discarding artifact");
        if let Err(e) = std::fs::remove_file(path) {
            warn!(pack_id = %pack_id, error = %e, "Failed to remove corrupt artifact");
        }
        return Err(InstallerError::Checksum {
            pack_id: pack_id.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }

    debug!(pack_id = %pack_id, checksum = %actual, "Checksum verified");
    Ok(VerificationReceipt {
        pack_id: pack_id.to_string(),
        checksum: actual,
        signature_checked: false,
    })
}

/// Check the artifact signature and extend the receipt.
///
/// A failure deletes the artifact; the pack must be downloaded again.
pub fn verify_signature(
    receipt: VerificationReceipt,
    path: &Path,
    signature: &str,
    verifier: &dyn SignatureVerifier,
    cancel: &CancellationToken,
) -> InstallerResult<VerificationReceipt> {
    match verifier.verify_file(&receipt.pack_id, path, signature, cancel) {
        Ok(()) => Ok(VerificationReceipt {
            signature_checked: true,
            ..receipt
        }),
        Err(e) => {
            if !e.is_cancelled() {
                std::fs::remove_file(path).ok();
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_verify_checksum_match() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.tar.gz");
        std::fs::write(&path, b"hello world").unwrap();
        let expected = Checksum::of_bytes(ChecksumAlgorithm::Sha256, b"hello world");

        let receipt =
            verify_checksum("core", &path, &expected, &CancellationToken::new(), |_| {}).unwrap();

        assert_eq!(receipt.pack_id(), "core");
        assert_eq!(receipt.checksum(), &expected);
        assert!(!receipt.signature_checked());
        assert!(path.exists());
    }

    #[test]
    fn test_verify_checksum_mismatch_removes_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.tar.gz");
        std::fs::write(&path, b"hello world").unwrap();
        let expected = Checksum::of_bytes(ChecksumAlgorithm::Sha256, b"other");

        let err = verify_checksum("core", &path, &expected, &CancellationToken::new(), |_| {})
            .unwrap_err();

        assert!(matches!(err, InstallerError::Checksum { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn test_verify_signature_extends_receipt() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.tar.gz");
        std::fs::write(&path, b"hello world").unwrap();
        let checksum = Checksum::of_bytes(ChecksumAlgorithm::Sha256, b"hello world");
        let verifier = HmacVerifier::new(Some(b"key".to_vec()));
        let sig = verifier.sign(b"hello world").unwrap();
        let cancel = CancellationToken::new();

        let receipt = verify_checksum("core", &path, &checksum, &cancel, |_| {}).unwrap();
        let receipt = verify_signature(receipt, &path, &sig, &verifier, &cancel).unwrap();
        assert!(receipt.signature_checked());
    }

    #[test]
    fn test_bad_signature_removes_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.tar.gz");
        std::fs::write(&path, b"hello world").unwrap();
        let checksum = Checksum::of_bytes(ChecksumAlgorithm::Sha256, b"hello world");
        let verifier = HmacVerifier::new(Some(b"key".to_vec()));
        let sig = verifier.sign(b"tampered").unwrap();
        let cancel = CancellationToken::new();

        let receipt = verify_checksum("core", &path, &checksum, &cancel, |_| {}).unwrap();
        let err = verify_signature(receipt, &path, &sig, &verifier, &cancel).unwrap_err();
        assert!(matches!(err, InstallerError::Signature { .. }));
        assert!(!path.exists());
    }
}
