//! Streaming SHA-256 file digests for provenance logs.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Block size used when streaming a file through the hasher.
pub const BLOCK_SIZE: usize = 64 * 1024;

/// Hex-encoded SHA-256 of the file at `path`.
pub fn digest(path: &Path) -> io::Result<String> {
    digest_with_block_size(path, BLOCK_SIZE)
}

/// Same as [`digest`] with an explicit block size. The result does not
/// depend on `block_size`.
pub fn digest_with_block_size(path: &Path, block_size: usize) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; block_size.max(1)];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
