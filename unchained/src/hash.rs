//! Content hashes used to address remote blobs and detect stale local files.

use crate::error::{IndexError, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::Path;

/// Hex sha-256 of an in-memory blob.
pub fn content_hash(bytes: &[u8]) -> String {
    to_hex(&Sha256::digest(bytes))
}

/// Hex sha-256 of a file, streamed.
pub fn content_hash_file(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut file = fs::File::open(path).map_err(|err| IndexError::io(path, err))?;
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buf).map_err(|err| IndexError::io(path, err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(to_hex(&hasher.finalize()))
}

fn to_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_and_memory_hashes_agree() {
        let dir = crate::test_utils::temp_dir("hash");
        fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("blob");
        let blob = vec![7u8; 3 * 1024 * 1024 + 5];
        fs::write(&path, &blob).expect("write");

        assert_eq!(content_hash_file(&path).expect("hash file"), content_hash(&blob));
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );

        let _ = fs::remove_dir_all(&dir);
    }
}
