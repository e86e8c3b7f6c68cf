use std::fmt;
use std::path::Path;
use std::str::FromStr;

use tracing::warn;

use crate::TransferError;
use crate::chunked::calculate_file_checksum;

const SHA256_PREFIX: &str = "sha256:";
const FALLBACK_PREFIX: &str = "fallback:";

/// Content hash of a whole file, used as idempotency key and integrity check.
///
/// Travels on the wire as a tagged string: `sha256:<hex>` or
/// `fallback:<name>:<size>:<unix-ms>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fingerprint {
    /// Hex-encoded SHA-256 of the content.
    Sha256(String),
    /// Unique but non-cryptographic key; content cannot be verified against it.
    Fallback(String),
}

impl Fingerprint {
    /// Fingerprint of an in-memory buffer.
    pub fn of_bytes(data: &[u8]) -> Self {
        Self::Sha256(crate::checksum_bytes(data))
    }

    /// Fallback key built from the file name, size and the current time.
    pub fn fallback(file_name: &str, file_size: u64) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self::Fallback(format!("{file_name}:{file_size}:{now}"))
    }

    /// The hex digest, if this fingerprint can verify content.
    pub fn digest(&self) -> Option<&str> {
        match self {
            Self::Sha256(hex) => Some(hex),
            Self::Fallback(_) => None,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256(hex) => write!(f, "{SHA256_PREFIX}{hex}"),
            Self::Fallback(key) => write!(f, "{FALLBACK_PREFIX}{key}"),
        }
    }
}

impl FromStr for Fingerprint {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(hex) = s.strip_prefix(SHA256_PREFIX) {
            let valid = hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit());
            if !valid {
                return Err(TransferError::InvalidFingerprint(s.to_string()));
            }
            return Ok(Self::Sha256(hex.to_ascii_lowercase()));
        }
        if let Some(key) = s.strip_prefix(FALLBACK_PREFIX)
            && !key.is_empty()
        {
            return Ok(Self::Fallback(key.to_string()));
        }
        Err(TransferError::InvalidFingerprint(s.to_string()))
    }
}

/// Streams `path` through SHA-256.
///
/// A read failure does not abort the upload: it is logged and a fallback key
/// is returned instead, so finalize skips verification for this file.
pub fn fingerprint_file(path: &Path, file_name: &str, file_size: u64) -> Fingerprint {
    match calculate_file_checksum(path) {
        Ok(hex) => Fingerprint::Sha256(hex),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot digest source, using fallback key");
            Fingerprint::fallback(file_name, file_size)
        }
    }
}
