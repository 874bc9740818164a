//! Per-request correlation and outcome logging.
//!
//! Execution requests are long-lived and often finish after the HTTP
//! exchange (async callbacks, detached sync work), so every log line
//! needs a correlation id that also reaches the caller. One middleware
//! owns both halves: it pins an `x-request-id` on the way in and records
//! the outcome with structured fields on the way out.

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub static REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

fn mint_correlation_id() -> HeaderValue {
    // A v4 UUID is always a valid header value; the fallback exists only
    // to keep this path panic-free.
    HeaderValue::try_from(Uuid::new_v4().to_string())
        .unwrap_or_else(|_| HeaderValue::from_static("unidentified"))
}

/// Pin a correlation id on the request, echo it on the response, and log
/// the outcome: server errors loudly, rejected requests quietly, the
/// rest at debug.
pub async fn trace_request(mut req: Request, next: Next) -> Response {
    let correlation_id = req
        .headers()
        .get(&REQUEST_ID_HEADER)
        .cloned()
        .unwrap_or_else(mint_correlation_id);
    req.headers_mut()
        .insert(REQUEST_ID_HEADER.clone(), correlation_id.clone());

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let mut response = next.run(req).await;
    response
        .headers_mut()
        .insert(REQUEST_ID_HEADER.clone(), correlation_id.clone());

    let status = response.status();
    let latency_ms = started.elapsed().as_millis() as u64;
    let correlation = correlation_id.to_str().unwrap_or("binary");

    if status.is_server_error() {
        error!(
            correlation,
            %method,
            path = %path,
            status = status.as_u16(),
            latency_ms,
            "request failed"
        );
    } else if status.is_client_error() {
        warn!(
            correlation,
            %method,
            path = %path,
            status = status.as_u16(),
            latency_ms,
            "request rejected"
        );
    } else {
        debug!(
            correlation,
            %method,
            path = %path,
            status = status.as_u16(),
            latency_ms,
            "request served"
        );
    }

    response
}
