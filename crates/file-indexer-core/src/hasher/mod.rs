use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::storage::models::{ContentSignature, NewFileHash};

/// Read buffer for streaming hashes. Large enough that a typical file
/// is consumed in a handful of syscalls.
pub const READ_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// MD5, SHA1 and SHA256 fed from one pass over the input.
#[derive(Clone, Default)]
pub struct MultiHasher {
    md5: Md5,
    sha1: Sha1,
    sha256: Sha256,
    bytes: u64,
}

impl MultiHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.md5.update(chunk);
        self.sha1.update(chunk);
        self.sha256.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    pub fn finalize(self) -> NewFileHash {
        NewFileHash {
            size: self.bytes as i64,
            signature: ContentSignature {
                md5: hex::encode(self.md5.finalize()),
                sha1: hex::encode(self.sha1.finalize()),
                sha256: hex::encode(self.sha256.finalize()),
            },
        }
    }
}

pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<NewFileHash> {
    let mut hasher = MultiHasher::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize())
}

pub fn hash_file(path: &Path) -> io::Result<NewFileHash> {
    hash_reader(File::open(path)?)
}

/// Hashes an in-memory buffer, e.g. an extracted archive entry.
pub fn hash_bytes(data: &[u8]) -> NewFileHash {
    let mut hasher = MultiHasher::new();
    for chunk in data.chunks(READ_BUFFER_SIZE) {
        hasher.update(chunk);
    }
    hasher.finalize()
}
