// casket-net/src/validation.rs
use std::fs::File;
use std::io;
use std::path::Path;

use casket_common::error::{CasketError, Result};
use casket_common::model::Checksum;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use url::Url;

/// Outcome of checking a downloaded artifact against its descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Verified { digest: String },
    /// No usable checksum was declared; the transaction must be flagged.
    Unverified { reason: String },
}

impl Verification {
    pub fn is_verified(&self) -> bool {
        matches!(self, Verification::Verified { .. })
    }
}

/// Parses a download URL. `https` and `file` are always accepted, plain
/// `http` only when `allow_http` is set.
pub fn validate_url(url_str: &str, allow_http: bool) -> Result<Url> {
    let url = Url::parse(url_str)
        .map_err(|e| CasketError::Validation(format!("Failed to parse URL '{url_str}': {e}")))?;
    match url.scheme() {
        "https" | "file" => Ok(url),
        "http" if allow_http => {
            warn!("Downloading over plain http: {}", url_str);
            Ok(url)
        }
        scheme => Err(CasketError::Validation(format!(
            "Invalid URL scheme for '{url_str}': Must be https, but got '{scheme}'"
        ))),
    }
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let bytes_copied = io::copy(&mut file, &mut hasher)?;
    let actual = hex::encode(hasher.finalize());
    debug!(
        "Calculated SHA256 of {}: {} ({} bytes read)",
        path.display(),
        actual,
        bytes_copied
    );
    Ok(actual)
}

/// Checks `path` against a hex SHA-256 and returns the actual digest.
pub fn verify_checksum(path: &Path, expected: &str) -> Result<String> {
    debug!("Verifying checksum for: {}", path.display());
    let expected = expected.trim();
    if expected.is_empty() || !expected.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CasketError::Validation(format!(
            "Expected checksum '{expected}' is not a hex SHA-256 digest"
        )));
    }
    let actual = sha256_file(path)?;
    debug!("Expected SHA256:   {}", expected);

    // Wrong-length (or odd-length) hex can never match a SHA-256.
    let matches = match (hex::decode(expected), hex::decode(&actual)) {
        (Ok(want), Ok(got)) => digests_equal(&want, &got),
        _ => false,
    };
    if matches {
        Ok(actual)
    } else {
        Err(CasketError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: expected.to_lowercase(),
            actual,
        })
    }
}

/// Compares every byte regardless of where the first difference is.
fn digests_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub fn verify_artifact(path: &Path, checksum: &Checksum) -> Result<Verification> {
    match checksum {
        Checksum::Sha256(expected) => {
            let digest = verify_checksum(path, expected)?;
            Ok(Verification::Verified { digest })
        }
        Checksum::NoCheck => {
            warn!(
                "Skipping checksum verification for {} - descriptor declares no_check.",
                path.display()
            );
            Ok(Verification::Unverified {
                reason: "descriptor declares no_check".to_string(),
            })
        }
        Checksum::Absent => {
            warn!(
                "Skipping checksum verification for {} - none provided.",
                path.display()
            );
            Ok(Verification::Unverified {
                reason: "descriptor declares no checksum".to_string(),
            })
        }
    }
}
