use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// Two-byte gzip magic used to detect compressed index payloads.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Lower-case hex MD5 of a byte buffer.
pub fn md5_hex(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Lower-case hex MD5 of a file, streamed in 1 MiB chunks.
pub fn md5_hex_file(path: &Path) -> Result<String> {
    let mut file =
        std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == GZIP_MAGIC[0] && bytes[1] == GZIP_MAGIC[1]
}

pub fn gzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).context("gzip write")?;
    encoder.finish().context("gzip finish")
}

pub fn gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).context("gunzip read")?;
    Ok(out)
}

/// Decompress if the buffer carries the gzip magic, otherwise return as-is.
pub fn maybe_gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    if is_gzip(bytes) {
        gunzip(bytes)
    } else {
        Ok(bytes.to_vec())
    }
}

pub fn b64_encode(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn b64_decode(s: &str) -> Result<Vec<u8>> {
    BASE64.decode(s.trim()).context("decode base64")
}
