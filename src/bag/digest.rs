//! Checksum computation for packages in staging.

use crate::error::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const BUF_SIZE: usize = 64 * 1024;

/// Digests gathered in a single pass over a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigests {
    pub md5: String,
    /// The raw md5 bytes base64-encoded, as object stores expect in the
    /// Content-MD5 header.
    pub md5_base64: String,
    pub sha256: String,
    pub size: u64,
}

/// Computes md5, sha256 and size in one read.
pub fn digest_file(path: &Path) -> Result<FileDigests> {
    let mut file = File::open(path)?;
    let mut md5 = Md5::new();
    let mut sha256 = Sha256::new();
    let mut size: u64 = 0;
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        md5.update(&buf[..n]);
        sha256.update(&buf[..n]);
        size += n as u64;
    }
    let md5_raw = md5.finalize();
    Ok(FileDigests {
        md5: hex::encode(&md5_raw),
        md5_base64: BASE64.encode(&md5_raw),
        sha256: hex::encode(sha256.finalize()),
        size,
    })
}

/// Streaming sha256 of one file, hex-encoded.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut sha256 = Sha256::new();
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        sha256.update(&buf[..n]);
    }
    Ok(hex::encode(sha256.finalize()))
}

/// The receipt sent to a replication origin: sha256 over the bytes of
/// `tagmanifest-sha256.txt`, finalized with the peer's nonce using the
/// tail-append convention — the emitted hex is `nonce_bytes ‖ digest`.
/// With no nonce this is the plain sha256.
pub fn tagmanifest_receipt(tagmanifest: &Path, nonce: Option<&str>) -> Result<String> {
    let content = std::fs::read(tagmanifest)?;
    let digest = Sha256::digest(&content);
    match nonce {
        Some(nonce) if !nonce.is_empty() => {
            let mut out = nonce.as_bytes().to_vec();
            out.extend_from_slice(&digest);
            Ok(hex::encode(out))
        }
        _ => Ok(hex::encode(digest)),
    }
}
