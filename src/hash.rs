//! Deterministic content hashing (C1).
//!
//! Every `content_hash`, `file_hash`, and `text_hash` column in the store is
//! produced and re-derived through this module. Hashing is SHA-256 over the
//! exact bytes of the canonical artifact, rendered as `"sha256:" + 64 lowercase
//! hex digits`. No salting: the same bytes always produce the same hash, which
//! is what makes the verifier (C6) meaningful.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::ProvenanceError;

const PREFIX: &str = "sha256:";
const HEX_LEN: usize = 64;
const STREAM_CHUNK: usize = 64 * 1024;

/// Hash a byte slice already resident in memory.
pub fn hash_text(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{PREFIX}{:x}", hasher.finalize())
}

/// Hash a file on disk, streaming so large files are never fully loaded.
pub fn hash_file(path: &Path) -> Result<String, ProvenanceError> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ProvenanceError::PathNotFound { path: path.display().to_string() }
        } else if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProvenanceError::PermissionDenied { path: path.display().to_string() }
        } else {
            ProvenanceError::Internal { message: format!("opening {}: {e}", path.display()) }
        }
    })?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; STREAM_CHUNK];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| ProvenanceError::Internal { message: format!("reading {}: {e}", path.display()) })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{PREFIX}{:x}", hasher.finalize()))
}

/// Check that a string has the `sha256:` prefix followed by exactly 64 lowercase hex digits.
pub fn is_valid_format(s: &str) -> bool {
    match s.strip_prefix(PREFIX) {
        Some(rest) => rest.len() == HEX_LEN && rest.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_text_is_deterministic() {
        let a = hash_text(b"hello world");
        let b = hash_text(b"hello world");
        assert_eq!(a, b);
        assert!(is_valid_format(&a));
    }

    #[test]
    fn hash_text_differs_on_different_input() {
        assert_ne!(hash_text(b"a"), hash_text(b"b"));
    }

    #[test]
    fn valid_format_rejects_garbage() {
        assert!(!is_valid_format("not-a-hash"));
        assert!(!is_valid_format("sha256:tooshort"));
        assert!(!is_valid_format(&format!("sha256:{}", "A".repeat(64))));
        assert!(is_valid_format(&format!("sha256:{}", "a".repeat(64))));
    }

    #[test]
    fn hash_file_streams_and_matches_hash_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, b"some file contents").unwrap();
        let from_file = hash_file(&path).unwrap();
        let from_text = hash_text(b"some file contents");
        assert_eq!(from_file, from_text);
    }

    #[test]
    fn hash_file_missing_is_path_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.bin");
        let err = hash_file(&path).unwrap_err();
        assert_eq!(err.category(), "path_not_found");
    }
}
