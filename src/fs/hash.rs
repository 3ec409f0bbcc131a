//! Content hashing for metadata snapshots.
//!
//! BLAKE3 produces a 256-bit digest; files are streamed through the hasher
//! with a fixed buffer so memory use does not depend on file size.

use std::io::Read;
use std::path::Path;

/// Hash bytes using BLAKE3.
pub fn hash_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Hash a file by streaming it through BLAKE3.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; 65536]; // 64KB buffer

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// Hash a file on the blocking thread pool.
pub async fn hash_file_async(path: &Path) -> std::io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file(&path))
        .await
        .map_err(std::io::Error::other)?
}
