//! Content fingerprints for file identity.

use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{IngestError, Result};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// What we know about a file on disk at the moment it was fingerprinted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIdentity {
    pub path: PathBuf,
    pub name: String,
    pub size_bytes: u64,
    /// Hex SHA-256 of the file content.
    pub fingerprint: String,
}

/// Compute the SHA-256 fingerprint of any readable source.
pub fn compute_fingerprint<R: Read>(reader: &mut R) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Fingerprint a file synchronously.
pub fn identify_file(path: &Path) -> Result<FileIdentity> {
    let metadata = std::fs::metadata(path).map_err(|e| IngestError::io(path, e))?;
    if !metadata.is_file() {
        return Err(IngestError::validation(path, "not a regular file"));
    }

    let mut file = std::fs::File::open(path).map_err(|e| IngestError::io(path, e))?;
    let fingerprint = compute_fingerprint(&mut file).map_err(|e| IngestError::io(path, e))?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());

    Ok(FileIdentity {
        path: path.to_path_buf(),
        name,
        size_bytes: metadata.len(),
        fingerprint,
    })
}

/// Fingerprint a file on the blocking pool.
pub async fn identify(path: &Path) -> Result<FileIdentity> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || identify_file(&owned))
        .await
        .map_err(|e| IngestError::Processing(format!("fingerprint task failed: {}", e)))?
}
