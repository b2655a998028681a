//! Gateway error responses.
//!
//! Errors surface either through axum (ordinary requests) or as raw bytes
//! written straight to a socket the HTTP stack never saw (upgrade path).

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::error::GatewayError;

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        // Upgrade rejections only reach axum on kept-alive connections; end them.
        let status = self.status_code().unwrap_or(StatusCode::BAD_REQUEST);
        let mut response = (status, self.client_message()).into_response();
        let headers = response.headers_mut();
        if let Some(secs) = self.retry_after_secs() {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        if matches!(self, GatewayError::UpgradeRejected(_)) {
            headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
        response
    }
}

/// Minimal HTTP/1.1 response for errors raised before the HTTP stack is
/// involved. `None` means the connection is closed silently.
pub fn raw_error_response(err: &GatewayError) -> Option<Vec<u8>> {
    let status = err.status_code()?;
    let body = err.client_message();

    let mut head = format!(
        "HTTP/1.1 {} {}\r\ncontent-type: text/plain; charset=utf-8\r\ncontent-length: {}\r\nconnection: close\r\n",
        status.as_str(),
        status.canonical_reason().unwrap_or(""),
        body.len()
    );
    if let Some(secs) = err.retry_after_secs() {
        head.push_str(&format!("retry-after: {secs}\r\n"));
    }
    head.push_str("\r\n");

    let mut bytes = head.into_bytes();
    bytes.extend_from_slice(body.as_bytes());
    Some(bytes)
}
