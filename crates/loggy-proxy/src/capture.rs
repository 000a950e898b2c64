//! The inspection side path: decompress, classify, extract, buffer.
//!
//! Runs against a copy of the request body after the proxy has already
//! secured the original bytes for forwarding. Nothing here returns an
//! error; a payload the pipeline cannot handle produces log lines and no
//! events, never a broken request.

use crate::AppState;
use flate2::read::{DeflateDecoder, GzDecoder};
use http::header::CONTENT_ENCODING;
use http::HeaderMap;
use loggy_core::extract;
use serde_json::Value;
use std::io::Read;
use tracing::{debug, trace};

/// Largest unmatched payload preview kept for the suggestions list.
const UNMATCHED_PAYLOAD_PREVIEW: usize = 4096;

/// Undo the request body's content encoding.
///
/// `gzip`, `deflate` and `br` are understood; anything else (or a
/// decode failure) passes the bytes through untouched so the parser can
/// still try them as UTF-8 JSON.
pub fn decompress(data: &[u8], encoding: Option<&str>) -> Vec<u8> {
    let encoding = match encoding {
        Some(e) => e.trim().to_ascii_lowercase(),
        None => return data.to_vec(),
    };

    let mut out = Vec::new();
    let ok = match encoding.as_str() {
        "gzip" => GzDecoder::new(data).read_to_end(&mut out).is_ok(),
        "deflate" => DeflateDecoder::new(data).read_to_end(&mut out).is_ok(),
        "br" => brotli::Decompressor::new(data, 4096)
            .read_to_end(&mut out)
            .is_ok(),
        _ => false,
    };

    if ok {
        out
    } else {
        if matches!(encoding.as_str(), "gzip" | "deflate" | "br") {
            debug!(encoding = %encoding, bytes = data.len(), "Decompression failed, using raw bytes");
        }
        data.to_vec()
    }
}

/// Whether a plain-HTTP body is worth handing to the extractor.
pub fn is_json_shaped(headers: &HeaderMap, body: &[u8]) -> bool {
    if let Some(content_type) = headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        if content_type.contains("json") {
            return true;
        }
    }

    matches!(
        body.iter().find(|b| !b.is_ascii_whitespace()),
        Some(&b'{') | Some(&b'[')
    )
}

/// Inspect one teed request body: match it against the source registry,
/// extract events into the shared buffer, or record the domain as an
/// unmatched candidate.
pub async fn inspect_request(state: &AppState, url: &str, headers: &HeaderMap, body: &[u8]) {
    if body.is_empty() {
        return;
    }
    if body.len() > state.settings.max_capture_bytes {
        trace!(url = %url, bytes = body.len(), "Body exceeds capture limit, skipping inspection");
        return;
    }

    let encoding = headers.get(CONTENT_ENCODING).and_then(|v| v.to_str().ok());
    let decoded = decompress(body, encoding);

    match state.registry.match_url(url).await {
        Some(source) => {
            let events = extract::parse_payload(&decoded, &source, url);
            if events.is_empty() {
                debug!(url = %url, source = %source.id, "No events extracted from payload");
                return;
            }

            debug!(url = %url, source = %source.id, count = events.len(), "Captured events");
            state.registry.record_capture(&source.id).await;
            state.events.lock().await.extend(events);
        }
        None => {
            let payload = unmatched_preview(&decoded);
            state.registry.track_unmatched(url, &payload).await;
        }
    }
}

/// Decoded payload for the unmatched list, falling back to a truncated
/// string for bodies that aren't JSON or form data.
fn unmatched_preview(decoded: &[u8]) -> Value {
    if let Some(value) = extract::decode_payload(decoded) {
        return value;
    }
    let text = String::from_utf8_lossy(&decoded[..decoded.len().min(UNMATCHED_PAYLOAD_PREVIEW)]);
    Value::String(text.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_decompress_gzip() {
        let original = br#"{"event":"Login"}"#;
        let compressed = gzip(original);
        assert_eq!(decompress(&compressed, Some("gzip")), original);
    }

    #[test]
    fn test_decompress_deflate() {
        let original = b"hello deflate";
        let mut encoder =
            flate2::write::DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(original).unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(decompress(&compressed, Some("deflate")), original);
    }

    #[test]
    fn test_decompress_brotli() {
        let original = br#"{"event":"br"}"#;
        let mut compressed = Vec::new();
        {
            let mut writer =
                brotli::CompressorWriter::new(&mut compressed, 4096, 5, 22);
            writer.write_all(original).unwrap();
        }
        assert_eq!(decompress(&compressed, Some("br")), original);
    }

    #[test]
    fn test_decompress_unknown_encoding_passes_through() {
        let data = b"raw bytes";
        assert_eq!(decompress(data, Some("zstd")), data);
        assert_eq!(decompress(data, None), data);
    }

    #[test]
    fn test_decompress_corrupt_gzip_passes_through() {
        let data = b"definitely not gzip";
        assert_eq!(decompress(data, Some("gzip")), data);
    }

    #[test]
    fn test_is_json_shaped() {
        let mut headers = HeaderMap::new();
        assert!(is_json_shaped(&headers, br#"{"a":1}"#));
        assert!(is_json_shaped(&headers, b"  [1,2]"));
        assert!(!is_json_shaped(&headers, b"event=Signup"));

        headers.insert(
            http::header::CONTENT_TYPE,
            "application/json; charset=utf-8".parse().unwrap(),
        );
        assert!(is_json_shaped(&headers, b"event=Signup"));
    }
}
