//! BP-013: BLAKE3 digests of compiled payloads and source modules.

use super::error::{CompileError, CompileResult};
use serde_json::Value;
use std::io::Read;
use std::path::Path;

const STREAM_BUF_SIZE: usize = 65536;

/// Hash raw bytes. Returns `"blake3:{hex}"`.
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("blake3:{}", blake3::hash(bytes).to_hex())
}

/// Digest of a payload's compact JSON form. Key order is part of the input.
pub fn payload_digest(doc: &Value) -> CompileResult<String> {
    let bytes = serde_json::to_vec(doc).map_err(|e| CompileError::serialization(e.to_string()))?;
    Ok(hash_bytes(&bytes))
}

/// Hash a source file's contents. Returns `"blake3:{hex}"`.
pub fn hash_file(path: &Path) -> CompileResult<String> {
    let io_err = |e: std::io::Error| CompileError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    };
    let mut file = std::fs::File::open(path).map_err(io_err)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; STREAM_BUF_SIZE];
    loop {
        let n = file.read(&mut buf).map_err(io_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("blake3:{}", hasher.finalize().to_hex()))
}
