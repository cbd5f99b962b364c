//! Content fingerprinting

use crate::document::Fingerprint;
use crate::error::{Result, WatchError};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::trace;

const READ_CHUNK: usize = 64 * 1024;

/// Computes SHA-256 fingerprints of whole files
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentIdentifier;

impl ContentIdentifier {
    pub fn new() -> Self {
        Self
    }

    /// Stream the file through SHA-256
    ///
    /// A file that vanishes or becomes unreadable mid-read yields
    /// [`WatchError::Read`]; callers treat that as an aborted observation,
    /// never as a deletion.
    pub async fn identify(&self, path: &Path) -> Result<Fingerprint> {
        let read_err = |source| WatchError::Read { path: path.to_path_buf(), source };

        let mut file = File::open(path).await.map_err(read_err)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; READ_CHUNK];
        let mut total = 0usize;

        loop {
            let n = file.read(&mut buffer).await.map_err(read_err)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            total += n;
        }

        let fingerprint = Fingerprint::new(format!("{:x}", hasher.finalize()));
        trace!("Fingerprinted {:?} ({} bytes): {}", path, total, fingerprint.short());
        Ok(fingerprint)
    }
}
