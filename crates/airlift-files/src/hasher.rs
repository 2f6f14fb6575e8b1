//! Whole-file and in-memory BLAKE3 checksums, hex encoded.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Streaming checksum of a file.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn file_checksum<P: AsRef<Path>>(path: P) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Checksum of an in-memory buffer.
#[must_use]
pub fn data_checksum(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn file_and_data_checksums_agree() {
        let mut file = NamedTempFile::new().unwrap();
        let data = vec![0x5Au8; 200 * 1024];
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        assert_eq!(file_checksum(file.path()).unwrap(), data_checksum(&data));
    }

    #[test]
    fn empty_file_checksum() {
        let file = NamedTempFile::new().unwrap();
        assert_eq!(file_checksum(file.path()).unwrap(), data_checksum(&[]));
    }
}
