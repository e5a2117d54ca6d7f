//! Request metrics over the `metrics` facade.
//!
//! No exporter is bundled; the host process installs whichever recorder it
//! uses. Without one every call here is a no-op.
//!
//! Provided metrics (labels `code`, `handler`, `method` unless noted):
//! * `http_requests_total` (counter)
//! * `http_request_duration_seconds` (histogram)
//! * `http_response_size_bytes` (histogram)
//! * `http_open_connections` (gauge, unlabelled)
use std::time::Duration;

use metrics::{Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::Lazy;

pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
pub const HTTP_RESPONSE_SIZE_BYTES: &str = "http_response_size_bytes";
pub const HTTP_OPEN_CONNECTIONS: &str = "http_open_connections";

static DESCRIBED: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        HTTP_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests completed, by status code, handler and method."
    );
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Time from admission until the response body was fully written."
    );
    describe_histogram!(
        HTTP_RESPONSE_SIZE_BYTES,
        Unit::Bytes,
        "Response body bytes written to the client, after any transcoding."
    );
    describe_gauge!(
        HTTP_OPEN_CONNECTIONS,
        "Admitted requests that have not finished yet."
    );
});

/// Register metric descriptions with the installed recorder. Idempotent.
///
/// Call after installing the recorder; descriptions sent before that are lost.
pub fn init_metrics() {
    Lazy::force(&DESCRIBED);
}

/// Record one completed request.
pub fn record_request(code: u16, handler: &str, method: &str, elapsed: Duration, bytes_sent: usize) {
    let labels = [
        ("code", code.to_string()),
        ("handler", handler.to_string()),
        ("method", method.to_string()),
    ];
    counter!(HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, &labels).record(elapsed.as_secs_f64());
    histogram!(HTTP_RESPONSE_SIZE_BYTES, &labels).record(bytes_sent as f64);
}

pub fn set_open_connections(count: usize) {
    gauge!(HTTP_OPEN_CONNECTIONS).set(count as f64);
}
