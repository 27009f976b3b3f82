//! Response headers for the HTTP tunnel
//!
//! Cache suppression, the status headers the JavaScript client reads on
//! failure, and `Accept-Encoding` negotiation for read responses.

use axum::http::header::{CACHE_CONTROL, EXPIRES, PRAGMA};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use guactunnel_shared::Status;

/// Numeric Guacamole status of a failed request
pub static STATUS_CODE_HEADER: HeaderName = HeaderName::from_static("guacamole-status-code");

/// Human-readable message of a failed request
pub static ERROR_MESSAGE_HEADER: HeaderName = HeaderName::from_static("guacamole-error-message");

/// Session token returned by `connect`, required on every later request
pub static TUNNEL_TOKEN_HEADER: HeaderName = HeaderName::from_static("guacamole-tunnel-token");

/// Compression applied to a read response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Gzip,
    Deflate,
    Identity,
}

impl ContentEncoding {
    /// Pick the best supported encoding from an `Accept-Encoding` value.
    pub fn negotiate(accept_encoding: Option<&str>) -> Self {
        let Some(accept) = accept_encoding else {
            return ContentEncoding::Identity;
        };

        let mut best = (ContentEncoding::Identity, 0.0f32);
        for entry in accept.split(',') {
            let mut parts = entry.split(';');
            let coding = parts.next().unwrap_or("").trim().to_ascii_lowercase();
            let quality = parts
                .find_map(|p| p.trim().strip_prefix("q="))
                .and_then(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            if quality <= 0.0 {
                continue;
            }

            let encoding = match coding.as_str() {
                "gzip" | "x-gzip" | "*" => ContentEncoding::Gzip,
                "deflate" => ContentEncoding::Deflate,
                _ => continue,
            };
            // Ties keep the earlier entry
            if quality > best.1 {
                best = (encoding, quality);
            }
        }
        best.0
    }

    /// Value for the `Content-Encoding` header, if any
    pub fn header_value(self) -> Option<HeaderValue> {
        match self {
            ContentEncoding::Gzip => Some(HeaderValue::from_static("gzip")),
            ContentEncoding::Deflate => Some(HeaderValue::from_static("deflate")),
            ContentEncoding::Identity => None,
        }
    }
}

/// Headers for tunnel read and write responses
pub fn no_cache(headers: &mut HeaderMap) {
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
}

/// Headers for the connect response, which must never be reused
pub fn no_store(headers: &mut HeaderMap) {
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(EXPIRES, HeaderValue::from_static("0"));
}

/// Headers describing a failed request
pub fn error_headers(headers: &mut HeaderMap, status: Status, message: &str) {
    headers.insert(
        STATUS_CODE_HEADER.clone(),
        HeaderValue::from(status.guacamole_code()),
    );
    let message = HeaderValue::from_str(message)
        .unwrap_or_else(|_| HeaderValue::from_static("Internal server error."));
    headers.insert(ERROR_MESSAGE_HEADER.clone(), message);
    no_cache(headers);
}
