//! Content digests binding an attestation record to a deployment descriptor.
//!
//! The digest is SHA-256 over the exact bytes of the input, rendered as lowercase
//! hex. Files are read in binary mode so no newline translation ever happens.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{AttestationError, Result};

/// Computes canonical SHA-256 digests of deployment descriptors.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestComputer;

impl DigestComputer {
    /// Create a new digest computer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Digest an in-memory buffer.
    #[must_use]
    pub fn digest(&self, content: &[u8]) -> String {
        hex::encode(Sha256::digest(content))
    }

    /// Digest everything readable from `reader`.
    ///
    /// # Errors
    ///
    /// Returns `AttestationError::Io` if the reader fails part-way; a partial
    /// digest is never returned.
    pub fn digest_reader<R: Read>(&self, mut reader: R) -> Result<String> {
        let mut hasher = Sha256::new();
        // `io::copy` retries reads that fail with `Interrupted`.
        io::copy(&mut reader, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    }

    /// Digest a file on disk, e.g. a compose manifest.
    ///
    /// # Errors
    ///
    /// Returns `AttestationError::Io` naming the path if the file cannot be opened or read.
    pub fn digest_file(&self, path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            AttestationError::Io(format!("failed to open '{}': {e}", path.display()))
        })?;
        self.digest_reader(BufReader::new(file)).map_err(|e| match e {
            AttestationError::Io(msg) => {
                AttestationError::Io(format!("failed to read '{}': {msg}", path.display()))
            }
            other => other,
        })
    }
}

/// Case-insensitive comparison of two hex digests.
#[must_use]
pub fn hex_digest_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.eq_ignore_ascii_case(b)
}
