use sha1::{Digest, Sha1};
use std::path::Path;
use tokio::io::AsyncReadExt;

use crate::error::{ArchiveError, Result};

const READ_BUFFER: usize = 64 * 1024;

pub fn calculate_sha1(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hashes a reader to the end, returning the hex digest and the byte count.
pub async fn calculate_sha1_from_reader<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
) -> std::io::Result<(String, u64)> {
    let mut hasher = Sha1::new();
    let mut buffer = vec![0u8; READ_BUFFER];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}

pub async fn calculate_sha1_for_file(path: &Path) -> Result<(String, u64)> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| ArchiveError::io(path, e))?;
    calculate_sha1_from_reader(file)
        .await
        .map_err(|e| ArchiveError::io(path, e))
}

/// True for a 40 character hex string
pub fn is_sha1_hex(value: &str) -> bool {
    value.len() == 40 && value.chars().all(|c| c.is_ascii_hexdigit())
}
