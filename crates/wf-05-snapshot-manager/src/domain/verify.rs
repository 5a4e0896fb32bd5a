//! Streaming digest and completeness checks of a downloaded archive.

use sha2::{Digest, Sha256};

use super::errors::SnapshotError;

/// Tracks size and SHA-256 of the bytes seen so far.
#[derive(Debug, Default, Clone)]
pub struct Digester {
    hasher: Sha256,
    bytes: u64,
}

impl Digester {
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Check against the expected size and checksum, when known.
    pub fn verify(self, expected_size: Option<u64>, sha256: Option<&str>) -> Result<(), SnapshotError> {
        if let Some(expected) = expected_size {
            if expected != self.bytes {
                return Err(SnapshotError::SizeMismatch {
                    expected,
                    actual: self.bytes,
                });
            }
        }
        if let Some(expected) = sha256 {
            let actual = format!("{:x}", self.hasher.finalize());
            let expected = expected.trim().trim_start_matches("0x").to_ascii_lowercase();
            if expected != actual {
                return Err(SnapshotError::ChecksumMismatch { expected, actual });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // sha256("abc")
    const ABC: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_matching_digest() {
        let mut d = Digester::default();
        d.update(b"a");
        d.update(b"bc");
        assert_eq!(d.bytes(), 3);
        assert!(d.verify(Some(3), Some(&ABC.to_uppercase())).is_ok());
    }

    #[test]
    fn test_mismatches() {
        let mut d = Digester::default();
        d.update(b"abc");
        assert!(matches!(
            d.clone().verify(Some(4), None),
            Err(SnapshotError::SizeMismatch { expected: 4, actual: 3 })
        ));
        assert!(matches!(
            d.verify(None, Some("00")),
            Err(SnapshotError::ChecksumMismatch { .. })
        ));
    }
}
