//! MD5 digests for payload verification and copy checks.

use std::path::Path;

use md5::{Digest, Md5};
use tokio::io::AsyncReadExt;

use crate::error::{AfsError, AfsResult};

const CHUNK: usize = 64 * 1024;

/// Lowercase hex MD5 of `data`.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Check `data` against a hex digest (case-insensitive).
pub fn verify(data: &[u8], expected: &str) -> AfsResult<()> {
    let actual = md5_hex(data);
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(AfsError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Streaming MD5 of a file.
pub async fn file_md5(path: &Path) -> AfsResult<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| AfsError::io(path, e))?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = file.read(&mut buf).await.map_err(|e| AfsError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Digest of a directory tree: MD5 over the sorted `(relative path, kind,
/// file digest)` lines. Two trees with the same shape and content match.
pub async fn tree_md5(root: &Path) -> AfsResult<String> {
    let mut lines = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut rd = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| AfsError::io(&dir, e))?;
        while let Some(entry) = rd.next_entry().await.map_err(|e| AfsError::io(&dir, e))? {
            let path = entry.path();
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            let meta = tokio::fs::metadata(&path)
                .await
                .map_err(|e| AfsError::io(&path, e))?;
            if meta.is_dir() {
                lines.push(format!("d {rel}"));
                pending.push(path);
            } else {
                lines.push(format!("f {rel} {}", file_md5(&path).await?));
            }
        }
    }
    lines.sort();
    Ok(md5_hex(lines.join("\n").as_bytes()))
}
