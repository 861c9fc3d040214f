//! Content hashing for change detection.
//!
//! Files get a 128-bit XXH3 digest of their full contents, hex encoded to 32
//! characters. Directories carry no content hash.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use xxhash_rust::xxh3::Xxh3;

use crate::error::Result;

const READ_BUF: usize = 64 * 1024;

pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:032x}", xxhash_rust::xxh3::xxh3_128(bytes))
}

pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Xxh3::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:032x}", hasher.digest128()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn bytes_and_file_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"hello").unwrap();
        drop(f);

        assert_eq!(hash_file(&path).unwrap(), hash_bytes(b"hello"));
    }

    #[test]
    fn digest_is_32_hex_chars() {
        let h = hash_bytes(b"");
        assert_eq!(h.len(), 32);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn distinct_content_distinct_digest() {
        assert_ne!(hash_bytes(b"hello"), hash_bytes(b"hello!"));
    }
}
