//! Gzip compression for vector responses
//!
//! Scratch buffers are recycled through a lazily-initialized, process-wide
//! free-list; a buffer whose encoder errored is not returned. Teardown is a
//! no-op.

use std::io::Write;
use std::sync::OnceLock;

use axum::http::HeaderMap;
use bytes::Bytes;
use flate2::{write::GzEncoder, Compression};
use parking_lot::Mutex;

const POOL_LIMIT: usize = 16;

static BUFFER_POOL: OnceLock<Mutex<Vec<Vec<u8>>>> = OnceLock::new();

fn pool() -> &'static Mutex<Vec<Vec<u8>>> {
    BUFFER_POOL.get_or_init(|| Mutex::new(Vec::new()))
}

fn acquire_buffer() -> Vec<u8> {
    pool().lock().pop().unwrap_or_default()
}

fn release_buffer(mut buffer: Vec<u8>) {
    buffer.clear();
    let mut pool = pool().lock();
    if pool.len() < POOL_LIMIT {
        pool.push(buffer);
    }
}

/// Strict check for `gzip` among the `Accept-Encoding` tokens, avoiding
/// false positives on values like `x-gzip-foo`.
pub fn supports_gzip(headers: &HeaderMap) -> bool {
    let Some(value) = headers.get(axum::http::header::ACCEPT_ENCODING) else {
        return false;
    };
    let Ok(value) = value.to_str() else {
        return false;
    };
    value
        .split(',')
        .map(|token| token.split(';').next().unwrap_or("").trim())
        .any(|token| token.eq_ignore_ascii_case("gzip"))
}

/// Gzip `payload` using a pooled scratch buffer.
pub fn compress(payload: &[u8]) -> std::io::Result<Bytes> {
    let buffer = acquire_buffer();
    let mut encoder = GzEncoder::new(buffer, Compression::default());
    // An errored encoder's buffer is dropped rather than recycled.
    encoder.write_all(payload)?;
    let buffer = encoder.finish()?;
    let compressed = Bytes::copy_from_slice(&buffer);
    release_buffer(buffer);
    Ok(compressed)
}
