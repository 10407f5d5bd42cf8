use std::{
    fs::File,
    io::{self, Read},
    path::Path,
};

use log::trace;

const READ_BLOCK_SIZE: usize = 1024 * 1024;

/// Digest computation over files. Implementations must be usable from a
/// blocking worker thread.
pub trait Checksum: Send + Sync {
    /// Compute the digest of a file as lower-case hex text.
    fn compute(&self, path: &Path) -> io::Result<String>;

    /// Check a file against an expected hex digest. Case is ignored.
    fn verify(&self, path: &Path, expected: &str) -> io::Result<bool> {
        Ok(digests_match(&self.compute(path)?, expected))
    }
}

/// Compare two hex digests, ignoring case and surrounding whitespace.
pub fn digests_match(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// MD5, which is what the update server publishes for firmware images.
#[derive(Clone, Copy, Debug, Default)]
pub struct Md5Checksum;

impl Checksum for Md5Checksum {
    fn compute(&self, path: &Path) -> io::Result<String> {
        let mut file = File::open(path)?;
        let mut buf = vec![0u8; READ_BLOCK_SIZE];
        let mut context = md5::Context::new();
        let mut size = 0u64;

        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            context.consume(&buf[..n]);
            size += n as u64;
        }

        let digest = format!("{:x}", context.compute());
        trace!("MD5 of {:?} ({} bytes): {}", path, size, digest);

        Ok(digest)
    }
}
