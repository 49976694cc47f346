// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use crate::receivers::logrt::persistence::base64_bytes;

/// Default number of leading bytes covered by a digest.
pub const DEFAULT_DIGEST_WINDOW: usize = 512;

/// A checksum over the first `len` bytes of a file.
///
/// Used to recognise a file when its device/inode pair is unavailable or ambiguous, and to
/// notice content that was replaced in place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrefixDigest {
    len: u64,
    #[serde(with = "base64_bytes")]
    sum: [u8; 32],
}

impl PrefixDigest {
    /// Digest of an entire byte slice.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut sum = [0u8; 32];
        sum.copy_from_slice(&Sha256::digest(bytes));
        Self {
            len: bytes.len() as u64,
            sum,
        }
    }

    /// Digest of a zero-length prefix.
    pub fn empty() -> Self {
        Self::of_bytes(&[])
    }

    /// Number of bytes the digest covers.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check whether `head` (the leading bytes of some file) starts with the bytes this digest
    /// was computed over. A head shorter than the digest window never matches.
    pub fn matches_head(&self, head: &[u8]) -> bool {
        let len = self.len as usize;
        if len > head.len() {
            return false;
        }
        Self::of_bytes(&head[..len]) == *self
    }
}

/// Read up to `window` leading bytes of a file.
pub fn read_head(file: &mut File, window: usize) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(0))?;

    let mut head = Vec::with_capacity(window);
    file.by_ref().take(window as u64).read_to_end(&mut head)?;
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_read_head_truncates_to_window() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world this is a longer message")
            .unwrap();
        file.flush().unwrap();

        let mut f = file.reopen().unwrap();
        assert_eq!(read_head(&mut f, 5).unwrap(), b"hello");
        assert_eq!(read_head(&mut f, 1000).unwrap().len(), 36);
    }

    #[test]
    fn test_matches_head() {
        let digest = PrefixDigest::of_bytes(b"hello");

        assert!(digest.matches_head(b"hello world"));
        assert!(digest.matches_head(b"hello"));
        assert!(!digest.matches_head(b"hell"));
        assert!(!digest.matches_head(b"jello world"));
    }

    #[test]
    fn test_empty_digest_matches_everything() {
        let digest = PrefixDigest::empty();
        assert!(digest.is_empty());
        assert!(digest.matches_head(b""));
        assert!(digest.matches_head(b"anything"));
    }

    #[test]
    fn test_digest_serde() {
        let digest = PrefixDigest::of_bytes(b"hello world");
        let json = serde_json::to_string(&digest).unwrap();
        assert!(json.contains(r#""len":11"#));

        let restored: PrefixDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(digest, restored);
    }
}
