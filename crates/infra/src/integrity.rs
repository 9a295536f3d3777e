//! Artifact integrity checks.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha1::{Digest, Sha1};

use mailops_core::Signature;

/// Compute the SHA-1 signature of a file, streaming it in fixed-size blocks.
pub fn file_signature(path: &Path) -> io::Result<Signature> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let mut digest = [0u8; 20];
    digest.copy_from_slice(&hasher.finalize());
    Ok(Signature::from_digest(&digest))
}

/// `true` iff the file at `path` hashes to `expected`.
pub fn verify_file(path: &Path, expected: &Signature) -> io::Result<bool> {
    Ok(&file_signature(path)? == expected)
}
