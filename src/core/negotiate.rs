//! Content negotiation for gzip response bodies.
//!
//! [`accepts_gzip`] is called once per request with a body, so it scans the
//! `Accept-Encoding` value in place instead of collecting segments.

/// Leading bytes of every gzip stream (RFC 1952 ID1, ID2).
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Default minimum body size for on-the-fly compression.
pub const DEFAULT_MIN_COMPRESS_SIZE: usize = 150;

/// Default ceiling for a pre-gzipped body inflated for a non-gzip client.
pub const DEFAULT_MAX_DECOMPRESSED_SIZE: usize = 64 * 1024 * 1024;

/// Media types worth compressing; everything else is sent as produced.
const COMPRESSIBLE_TYPES: &[&str] = &[
    "application/atom+xml",
    "application/javascript",
    "application/json",
    "application/ld+json",
    "application/rss+xml",
    "application/vnd.ms-fontobject",
    "application/x-font-opentype",
    "application/x-font-truetype",
    "application/x-font-ttf",
    "application/x-javascript",
    "application/xhtml+xml",
    "application/xml",
    "font/eot",
    "font/opentype",
    "font/otf",
    "font/ttf",
    "image/svg+xml",
    "image/vnd.microsoft.icon",
    "image/x-icon",
    "text/css",
    "text/csv",
    "text/html",
    "text/javascript",
    "text/plain",
    "text/xml",
];

/// Reports whether an `Accept-Encoding` header value admits gzip.
///
/// Segments are scanned left to right. The coding token must be exactly
/// `gzip` (case-sensitive). A bare `gzip` accepts; `gzip;q=<v>` accepts unless
/// `v` is zero (`0`, `0.0`, `0.000`, ...) or not a number. The scan gives up
/// and rejects as soon as it meets a segment shorter than four bytes, a token
/// that merely starts with `gzip`, or a malformed parameter list.
pub fn accepts_gzip(accept_encoding: &str) -> bool {
    let header = accept_encoding.trim();
    if header.is_empty() {
        return false;
    }

    for segment in header.split(',') {
        let coding = segment.trim_start_matches(' ');
        if coding.len() < 4 {
            return false;
        }
        let Some(rest) = coding.strip_prefix("gzip") else {
            continue;
        };

        let rest = rest.trim_start_matches(' ');
        if rest.is_empty() {
            return true;
        }
        let Some(params) = rest.strip_prefix(';') else {
            return false;
        };
        let Some(quality) = params.trim_start_matches(' ').strip_prefix("q=") else {
            return false;
        };
        return quality_accepts(quality);
    }

    false
}

/// `true` unless the quality value is all zeros/dots, empty, or unparsable.
fn quality_accepts(quality: &str) -> bool {
    let quality = quality.trim_matches(' ');
    if quality.is_empty() || quality.bytes().all(|b| b == b'0' || b == b'.') {
        return false;
    }
    quality.parse::<f32>().is_ok_and(|q| q > 0.0)
}

/// Whether `body` already starts with the gzip magic header.
pub fn is_gzip(body: &[u8]) -> bool {
    body.starts_with(&GZIP_MAGIC)
}

/// Whether a `Content-Type` value names a compressible media type.
///
/// Parameters (`; charset=utf-8`) are ignored and the comparison is
/// case-insensitive.
pub fn is_compressible(content_type: &str) -> bool {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim();
    COMPRESSIBLE_TYPES
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(media_type))
}
