//! Response body decoding.
//!
//! Compression is detected by content sniffing rather than by trusting the
//! `Content-Encoding` header: servers lie about encodings often enough that
//! the magic bytes are the only reliable signal.

use std::io::Read;

use bytes::Bytes;
use flate2::read::GzDecoder;

/// Gzip member header magic, RFC 1952.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Decode a response body to text.
///
/// Gzip-compressed payloads are inflated first; anything else (including a
/// truncated or corrupt gzip stream) falls back to the raw bytes. Invalid
/// UTF-8 sequences are replaced rather than rejected.
pub fn decode_body(body: &Bytes) -> String {
    match ungzip(body) {
        Some(inflated) => String::from_utf8_lossy(&inflated).into_owned(),
        None => String::from_utf8_lossy(body).into_owned(),
    }
}

fn ungzip(body: &[u8]) -> Option<Vec<u8>> {
    if body.len() < 2 || body[..2] != GZIP_MAGIC {
        return None;
    }
    let mut decoder = GzDecoder::new(body);
    let mut inflated = Vec::new();
    match decoder.read_to_end(&mut inflated) {
        Ok(_) => Some(inflated),
        Err(err) => {
            tracing::debug!(%err, "gzip inflate failed, returning raw body");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Bytes {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        Bytes::from(encoder.finish().unwrap())
    }

    #[test]
    fn plain_bodies_pass_through() {
        let body = Bytes::from_static(b"hello world");
        assert_eq!(decode_body(&body), "hello world");
    }

    #[test]
    fn gzip_bodies_are_inflated() {
        let body = gzip("compressed payload".as_bytes());
        assert_eq!(decode_body(&body), "compressed payload");
    }

    #[test]
    fn corrupt_gzip_falls_back_to_raw() {
        // Magic bytes but garbage after: must not panic, must not lose data.
        let body = Bytes::from_static(&[0x1f, 0x8b, 0xff, 0xfe, 0x00]);
        let decoded = decode_body(&body);
        assert!(!decoded.is_empty());
    }

    #[test]
    fn short_bodies_are_safe() {
        assert_eq!(decode_body(&Bytes::from_static(&[0x1f])), "\u{1f}");
        assert_eq!(decode_body(&Bytes::new()), "");
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let body = Bytes::from_static(&[0x68, 0x69, 0xff]);
        assert_eq!(decode_body(&body), "hi\u{fffd}");
    }
}
