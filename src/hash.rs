use std::{
    fs::File,
    io::{BufReader, ErrorKind, Read},
    path::Path,
};

use hex::encode;
use md5::Md5;
use sha2::{Digest, Sha256};

use crate::error::ThreatPulseError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigests {
    pub size: u64,
    pub md5: String,
    pub sha256: String,
}

pub struct Hash;

impl Hash {
    /// Computes MD5 and SHA-256 in a single pass over the file.
    pub fn compute_digests(path: &Path) -> Result<FileDigests, ThreatPulseError> {
        let f = File::open(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => ThreatPulseError::FileNotFound(path.to_path_buf()),
            _ => ThreatPulseError::IoError(e),
        })?;

        let mut reader = BufReader::new(f);
        let mut md5 = Md5::new();
        let mut sha256 = Sha256::new();
        let mut buffer = [0; 8192]; // Read in 8KB chunks
        let mut size: u64 = 0;

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            md5.update(&buffer[..bytes_read]);
            sha256.update(&buffer[..bytes_read]);
            size += bytes_read as u64;
        }

        Ok(FileDigests {
            size,
            md5: encode(md5.finalize()),
            sha256: encode(sha256.finalize()),
        })
    }

    pub fn short_hash(hash: Option<&str>) -> &str {
        match hash {
            Some(hash) => &hash[..hash.len().min(12)],
            None => "-",
        }
    }
}
