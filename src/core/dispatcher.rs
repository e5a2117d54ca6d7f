//! Response Dispatcher: turns a handler [`Response`] into the status, headers
//! and bytes that go on the wire.
//!
//! Body resolution happens once, here. Gzip detection on the resolved bytes
//! takes priority over the MIME allow-list: a body that already carries the
//! gzip magic is either passed through (client accepts gzip) or decompressed
//! (client does not), whatever its content type and whether on-the-fly
//! compression is enabled.
use std::io::{self, Read, Write};

use bytes::Bytes;
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use http::{
    HeaderMap, HeaderName, HeaderValue, StatusCode,
    header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, VARY},
};

use crate::{
    config::models::ServerConfig,
    core::{
        error::{ReportableError, RequestError},
        negotiate::{
            DEFAULT_MAX_DECOMPRESSED_SIZE, DEFAULT_MIN_COMPRESS_SIZE, accepts_gzip, is_compressible,
            is_gzip,
        },
        response::{Body, Response},
    },
};

const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";
const JSON_CONTENT_TYPE: &str = "application/json";

/// How a non-empty body is encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Sent as resolved.
    Identity,
    /// Compressed on the fly.
    Compressed,
    /// Already gzip; sent as-is with `Content-Encoding: gzip`.
    Passthrough,
    /// Already gzip; decompressed for a client that does not accept it.
    Decompressed,
}

/// The resolved response, ready to be written.
#[derive(Debug)]
pub struct Dispatched {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub encoding: Encoding,
    /// Serialization or transcoding failure, if any.
    pub error: Option<ReportableError>,
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    pub json_indented: bool,
    pub disable_compression: bool,
    pub min_compress_size: usize,
    /// Largest body produced when inflating a pre-gzipped body.
    pub max_decompressed_size: usize,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self {
            json_indented: false,
            disable_compression: false,
            min_compress_size: DEFAULT_MIN_COMPRESS_SIZE,
            max_decompressed_size: DEFAULT_MAX_DECOMPRESSED_SIZE,
        }
    }
}

impl From<&ServerConfig> for Dispatcher {
    fn from(config: &ServerConfig) -> Self {
        Self {
            json_indented: config.json_indented,
            disable_compression: config.disable_compression,
            min_compress_size: config.min_compress_size,
            max_decompressed_size: config.max_decompressed_size,
        }
    }
}

impl Dispatcher {
    pub fn dispatch(&self, response: Response, request_headers: &HeaderMap) -> Dispatched {
        let status = response.status();
        let mut headers = HeaderMap::new();
        for (name, value) in &response.headers {
            append_header(&mut headers, name, value);
        }

        let body = match response.body {
            Body::Empty => Bytes::new(),
            Body::Text(text) => {
                set_default_content_type(&mut headers, TEXT_CONTENT_TYPE);
                Bytes::from(text)
            }
            Body::Bytes(bytes) => bytes,
            Body::Json(value) => match value.serialize_body(self.json_indented) {
                Ok(serialized) => {
                    set_default_content_type(&mut headers, JSON_CONTENT_TYPE);
                    Bytes::from(serialized)
                }
                Err(err) => {
                    let error = ReportableError::from(RequestError::Serialize(err)).capture_call_stack();
                    return failed(error);
                }
            },
        };

        let mut dispatched = Dispatched {
            status,
            headers,
            body,
            encoding: Encoding::Identity,
            error: None,
        };
        if dispatched.body.is_empty() {
            return dispatched;
        }

        let client_accepts_gzip = request_headers
            .get(ACCEPT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .is_some_and(accepts_gzip);

        if is_gzip(&dispatched.body) {
            if client_accepts_gzip {
                dispatched
                    .headers
                    .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
                dispatched.encoding = Encoding::Passthrough;
            } else {
                match gunzip(&dispatched.body, self.max_decompressed_size) {
                    Ok(plain) => {
                        dispatched.headers.remove(CONTENT_ENCODING);
                        dispatched.headers.remove(CONTENT_LENGTH);
                        dispatched.body = plain;
                        dispatched.encoding = Encoding::Decompressed;
                    }
                    Err(err) => return failed(RequestError::Transcode(err).into()),
                }
            }
            add_vary_accept_encoding(&mut dispatched.headers);
            return dispatched;
        }

        if self.should_compress(&dispatched, client_accepts_gzip) {
            match gzip(&dispatched.body) {
                Ok(compressed) => {
                    dispatched
                        .headers
                        .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
                    dispatched.headers.remove(CONTENT_LENGTH);
                    dispatched.body = compressed;
                    dispatched.encoding = Encoding::Compressed;
                    add_vary_accept_encoding(&mut dispatched.headers);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "gzip compression failed, sending identity body");
                    dispatched.error = Some(RequestError::Transcode(err).into());
                }
            }
        }

        dispatched
    }

    fn should_compress(&self, dispatched: &Dispatched, client_accepts_gzip: bool) -> bool {
        if self.disable_compression || !client_accepts_gzip {
            return false;
        }
        if dispatched.body.len() < self.min_compress_size {
            return false;
        }
        if dispatched.headers.contains_key(CONTENT_ENCODING) {
            return false;
        }
        dispatched
            .headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(is_compressible)
    }
}

/// A 500 with no body, carrying `error`.
fn failed(error: ReportableError) -> Dispatched {
    Dispatched {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        headers: HeaderMap::new(),
        body: Bytes::new(),
        encoding: Encoding::Identity,
        error: Some(error),
    }
}

fn append_header(headers: &mut HeaderMap, name: &str, value: &str) {
    let name = match HeaderName::from_bytes(name.as_bytes()) {
        Ok(name) => name,
        Err(err) => {
            tracing::warn!(header = %name, error = %err, "Skipping invalid response header name");
            return;
        }
    };
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.append(name, value);
        }
        Err(err) => {
            tracing::warn!(header = %name, error = %err, "Skipping invalid response header value");
        }
    }
}

/// Set `Content-Type` unless the handler already gave a non-empty one.
fn set_default_content_type(headers: &mut HeaderMap, content_type: &'static str) {
    let already_set = headers
        .get_all(CONTENT_TYPE)
        .iter()
        .any(|value| !value.is_empty());
    if !already_set {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
}

/// Adds `accept-encoding` to `Vary` unless it, or `*`, is already listed.
fn add_vary_accept_encoding(headers: &mut HeaderMap) {
    for vary in headers.get_all(VARY) {
        if let Ok(vary) = vary.to_str() {
            let covered = vary.split(',').any(|v| {
                let v = v.trim();
                v == "*" || v.eq_ignore_ascii_case("accept-encoding")
            });
            if covered {
                return;
            }
        }
    }
    headers.append(VARY, HeaderValue::from_static("accept-encoding"));
}

fn gzip(body: &[u8]) -> io::Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
    encoder.write_all(body)?;
    Ok(Bytes::from(encoder.finish()?))
}

/// Inflate `body`, failing once the output would exceed `limit` bytes.
fn gunzip(body: &[u8], limit: usize) -> io::Result<Bytes> {
    let mut plain = Vec::with_capacity(body.len().saturating_mul(2).min(limit));
    let ceiling = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    GzDecoder::new(body).take(ceiling).read_to_end(&mut plain)?;
    if plain.len() > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("decompressed body exceeds {limit} bytes"),
        ));
    }
    Ok(Bytes::from(plain))
}

#[cfg(test)]
mod tests {
    use serde::Serialize;

    use super::*;

    #[derive(Serialize)]
    struct Payload {
        field1: String,
        field2: bool,
    }

    fn payload() -> Payload {
        Payload {
            field1: "a".repeat(1000),
            field2: true,
        }
    }

    fn payload_json() -> Vec<u8> {
        serde_json::to_vec(&payload()).unwrap()
    }

    fn accept(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if !value.is_empty() {
            headers.insert(ACCEPT_ENCODING, HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    fn header<'a>(dispatched: &'a Dispatched, name: HeaderName) -> Option<&'a str> {
        dispatched.headers.get(name).and_then(|v| v.to_str().ok())
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("cannot encode"))
        }
    }

    #[test]
    fn test_json_body_compact() {
        #[derive(Serialize)]
        struct Sum {
            a: i32,
            b: i32,
            result: i32,
        }

        let dispatched = Dispatcher::default().dispatch(
            Response::json(Sum { a: 1, b: 2, result: 3 }),
            &accept("gzip"),
        );
        assert_eq!(dispatched.status, StatusCode::OK);
        assert_eq!(&dispatched.body[..], br#"{"a":1,"b":2,"result":3}"#);
        assert_eq!(header(&dispatched, CONTENT_TYPE), Some("application/json"));
        // Below the size threshold.
        assert_eq!(dispatched.encoding, Encoding::Identity);
        assert!(dispatched.error.is_none());
    }

    #[test]
    fn test_json_body_indented() {
        let dispatcher = Dispatcher {
            json_indented: true,
            ..Dispatcher::default()
        };
        let dispatched = dispatcher.dispatch(Response::json(vec![1, 2]), &HeaderMap::new());
        assert_eq!(&dispatched.body[..], b"[\n  1,\n  2\n]");
    }

    #[test]
    fn test_json_respects_handler_content_type() {
        let response = Response::json(payload()).with_header("Content-Type", "application/vnd.api+json");
        let dispatched = Dispatcher::default().dispatch(response, &HeaderMap::new());
        assert_eq!(header(&dispatched, CONTENT_TYPE), Some("application/vnd.api+json"));
    }

    #[test]
    fn test_empty_content_type_counts_as_unset() {
        let response = Response::json(payload()).with_header("Content-Type", "");
        let dispatched = Dispatcher::default().dispatch(response, &HeaderMap::new());
        assert_eq!(header(&dispatched, CONTENT_TYPE), Some("application/json"));
    }

    #[test]
    fn test_text_defaults_to_plain() {
        let dispatched = Dispatcher::default().dispatch(Response::text("hello"), &HeaderMap::new());
        assert_eq!(header(&dispatched, CONTENT_TYPE), Some(TEXT_CONTENT_TYPE));
        assert_eq!(&dispatched.body[..], b"hello");
    }

    #[test]
    fn test_bytes_have_no_default_content_type() {
        let dispatched = Dispatcher::default().dispatch(Response::bytes(vec![1u8, 2, 3]), &HeaderMap::new());
        assert!(dispatched.headers.get(CONTENT_TYPE).is_none());
    }

    #[test]
    fn test_empty_body_keeps_status_and_headers() {
        let response = Response::empty()
            .with_status(StatusCode::NO_CONTENT)
            .with_header("X-Request-Id", "abc");
        let dispatched = Dispatcher::default().dispatch(response, &accept("gzip"));
        assert_eq!(dispatched.status, StatusCode::NO_CONTENT);
        assert!(dispatched.body.is_empty());
        assert_eq!(header(&dispatched, HeaderName::from_static("x-request-id")), Some("abc"));
        assert!(dispatched.headers.get(VARY).is_none());
    }

    #[test]
    fn test_headers_appended_in_order_and_invalid_skipped() {
        let response = Response::text("x")
            .with_header("Set-Cookie", "a=1")
            .with_header("bad header", "v")
            .with_header("X-Bad-Value", "line\nbreak")
            .with_header("Set-Cookie", "b=2");
        let dispatched = Dispatcher::default().dispatch(response, &HeaderMap::new());
        let cookies: Vec<_> = dispatched
            .headers
            .get_all(http::header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert!(dispatched.headers.get("x-bad-value").is_none());
    }

    #[test]
    fn test_serialization_failure_is_500_with_error() {
        let response = Response::json(Unserializable)
            .with_status(StatusCode::CREATED)
            .with_header("X-Custom", "1");
        let dispatched = Dispatcher::default().dispatch(response, &accept("gzip"));
        assert_eq!(dispatched.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(dispatched.body.is_empty());
        let error = dispatched.error.unwrap();
        assert!(error.message().starts_with("json serialization: cannot encode"));
        assert!(error.call_stack().is_some());
    }

    #[test]
    fn test_compression_table() {
        let plain = payload_json();
        let compressed = gzip(&plain).unwrap().to_vec();

        // (body, content type, accept-encoding, expected encoding)
        let cases: Vec<(Response, &str, Encoding)> = vec![
            (Response::json(payload()), "gzip", Encoding::Compressed),
            (Response::json(payload()), "", Encoding::Identity),
            (Response::text(String::from_utf8(plain.clone()).unwrap()), "gzip", Encoding::Compressed),
            (Response::text(String::from_utf8(plain.clone()).unwrap()), "", Encoding::Identity),
            (
                Response::bytes(plain.clone()).with_header("Content-Type", "application/json"),
                "gzip",
                Encoding::Compressed,
            ),
            (Response::bytes(plain.clone()), "gzip", Encoding::Identity),
            (Response::bytes(plain.clone()), "", Encoding::Identity),
            (
                Response::bytes(compressed.clone()).with_header("Content-Type", "application/json"),
                "gzip",
                Encoding::Passthrough,
            ),
            (
                Response::bytes(compressed.clone()).with_header("Content-Type", "application/json"),
                "",
                Encoding::Decompressed,
            ),
            (Response::bytes(compressed.clone()), "gzip", Encoding::Passthrough),
            (Response::bytes(compressed.clone()), "", Encoding::Decompressed),
        ];

        for (i, (response, accept_encoding, expected)) in cases.into_iter().enumerate() {
            let dispatched = Dispatcher::default().dispatch(response, &accept(accept_encoding));
            assert_eq!(dispatched.encoding, expected, "case {i}");

            let wire_is_gzip = header(&dispatched, CONTENT_ENCODING) == Some("gzip");
            let readable = if wire_is_gzip {
                gunzip(&dispatched.body, usize::MAX).unwrap()
            } else {
                dispatched.body.clone()
            };
            assert_eq!(&readable[..], &plain[..], "case {i}");
            assert!(dispatched.error.is_none(), "case {i}");
        }
    }

    #[test]
    fn test_disable_compression_still_decompresses() {
        let dispatcher = Dispatcher {
            disable_compression: true,
            ..Dispatcher::default()
        };
        let plain = payload_json();
        let compressed = gzip(&plain).unwrap();

        let dispatched = dispatcher.dispatch(Response::json(payload()), &accept("gzip"));
        assert_eq!(dispatched.encoding, Encoding::Identity);

        let dispatched = dispatcher.dispatch(
            Response::bytes(compressed).with_header("Content-Encoding", "gzip"),
            &accept("deflate"),
        );
        assert_eq!(dispatched.encoding, Encoding::Decompressed);
        assert!(dispatched.headers.get(CONTENT_ENCODING).is_none());
        assert_eq!(&dispatched.body[..], &plain[..]);
    }

    #[test]
    fn test_small_body_not_compressed() {
        let dispatched = Dispatcher::default().dispatch(Response::text("a".repeat(149)), &accept("gzip"));
        assert_eq!(dispatched.encoding, Encoding::Identity);

        let dispatched = Dispatcher::default().dispatch(Response::text("a".repeat(150)), &accept("gzip"));
        assert_eq!(dispatched.encoding, Encoding::Compressed);
    }

    #[test]
    fn test_handler_content_encoding_disables_compression() {
        let response = Response::text("a".repeat(500)).with_header("Content-Encoding", "br");
        let dispatched = Dispatcher::default().dispatch(response, &accept("gzip"));
        assert_eq!(dispatched.encoding, Encoding::Identity);
        assert_eq!(header(&dispatched, CONTENT_ENCODING), Some("br"));
    }

    #[test]
    fn test_transcode_removes_content_length_and_adds_vary() {
        let body = "a".repeat(500);
        let response = Response::text(body.clone())
            .with_header("Content-Length", "500")
            .with_header("Vary", "origin");
        let dispatched = Dispatcher::default().dispatch(response, &accept("gzip, deflate"));
        assert_eq!(dispatched.encoding, Encoding::Compressed);
        assert!(dispatched.headers.get(CONTENT_LENGTH).is_none());
        let vary: Vec<_> = dispatched
            .headers
            .get_all(VARY)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(vary, vec!["origin", "accept-encoding"]);
        assert!(dispatched.body.len() < body.len());
    }

    #[test]
    fn test_vary_not_duplicated() {
        let response = Response::text("a".repeat(500)).with_header("Vary", "Accept-Encoding");
        let dispatched = Dispatcher::default().dispatch(response, &accept("gzip"));
        assert_eq!(dispatched.headers.get_all(VARY).iter().count(), 1);
    }

    #[test]
    fn test_corrupt_gzip_fails_with_transcode_error() {
        // Magic is right, compression method byte is not deflate (8).
        let corrupt = vec![0x1f, 0x8b, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x01, 0x02];
        let dispatched = Dispatcher::default().dispatch(Response::bytes(corrupt), &HeaderMap::new());
        assert_eq!(dispatched.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(dispatched.body.is_empty());
        assert!(dispatched.error.unwrap().message().starts_with("gzip transcoding"));
    }

    #[test]
    fn test_decompression_is_bounded() {
        let plain = vec![b'a'; 10_000];
        let compressed = gzip(&plain).unwrap();
        assert!(compressed.len() < 200);

        let dispatcher = Dispatcher {
            max_decompressed_size: 1_000,
            ..Dispatcher::default()
        };
        let dispatched = dispatcher.dispatch(
            Response::bytes(compressed.clone()).with_header("Content-Type", "text/plain"),
            &HeaderMap::new(),
        );
        assert_eq!(dispatched.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(dispatched.body.is_empty());
        assert_eq!(
            dispatched.error.unwrap().message(),
            "gzip transcoding: decompressed body exceeds 1000 bytes"
        );

        // Exactly at the ceiling is fine.
        let dispatcher = Dispatcher {
            max_decompressed_size: plain.len(),
            ..Dispatcher::default()
        };
        let dispatched = dispatcher.dispatch(Response::bytes(compressed), &HeaderMap::new());
        assert_eq!(dispatched.encoding, Encoding::Decompressed);
        assert_eq!(&dispatched.body[..], &plain[..]);
    }

    #[test]
    fn test_round_trip_matches_uncompressed() {
        let enabled = Dispatcher::default().dispatch(Response::json(payload()), &accept("gzip"));
        let disabled = Dispatcher {
            disable_compression: true,
            ..Dispatcher::default()
        }
        .dispatch(Response::json(payload()), &accept("gzip"));

        assert_eq!(enabled.encoding, Encoding::Compressed);
        assert_eq!(gunzip(&enabled.body, usize::MAX).unwrap(), disabled.body);
    }
}
