#![allow(dead_code)]

use std::{
    io::Read,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use http::header::ACCEPT_ENCODING;
use http_body_util::BodyExt;
use httplog::{LogRecord, LogSink, LoggedBody, Server, config::ServerConfig};

/// Collects every emitted record for inspection.
#[derive(Default)]
pub struct CapturingSink {
    records: Mutex<Vec<LogRecord>>,
}

impl LogSink for CapturingSink {
    fn emit(&self, record: LogRecord) {
        self.records.lock().unwrap().push(record);
    }
}

impl CapturingSink {
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn only(&self) -> LogRecord {
        let records = self.records();
        assert_eq!(records.len(), 1, "expected exactly one record: {records:?}");
        records.into_iter().next().unwrap()
    }
}

pub fn server_with_sink(config: ServerConfig) -> (Server, Arc<CapturingSink>) {
    let sink = Arc::new(CapturingSink::default());
    let server = Server::new(&config).with_log_sink(sink.clone());
    (server, sink)
}

pub fn get(uri: &str, accept_encoding: Option<&str>) -> http::Request<axum::body::Body> {
    let mut builder = http::Request::builder().uri(uri);
    if let Some(accept_encoding) = accept_encoding {
        builder = builder.header(ACCEPT_ENCODING, accept_encoding);
    }
    builder.body(axum::body::Body::empty()).unwrap()
}

/// Read the whole body; the body is dropped afterwards, which emits the record.
pub async fn read_body(response: http::Response<LoggedBody>) -> (http::response::Parts, Bytes) {
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await.unwrap().to_bytes();
    (parts, bytes)
}

pub fn gunzip(bytes: &[u8]) -> Vec<u8> {
    let mut plain = Vec::new();
    flate2::read::GzDecoder::new(bytes)
        .read_to_end(&mut plain)
        .unwrap();
    plain
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    use std::io::Write;

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}
