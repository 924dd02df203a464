//! Integrity: whole-file SHA-256 digest (hex text), sent as the first unit of every transfer.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

const READ_BUF: usize = 64 * 1024;

/// Hash a byte slice. Returns the lowercase hex digest.
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hash a file's full contents. Returns the lowercase hex digest.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Verify a file against an expected hex digest (case-insensitive).
pub fn verify_file(expected: &str, path: &Path) -> io::Result<bool> {
    Ok(hash_file(path)?.eq_ignore_ascii_case(expected.trim()))
}
