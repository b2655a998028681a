//! Header manipulation for forwarded traffic.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers (RFC 9110 §7.6.1), including any named by
//!   `Connection`
//! - Detect protocol-upgrade requests
//!
//! The forwarding chain itself lives in `forwarded.rs`.

use axum::http::{header, HeaderMap, HeaderName};

/// Headers that describe a single transport hop and must not be forwarded.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// True if any comma-separated token in `values` equals `token`
/// (ASCII case-insensitive).
pub fn has_token<'a, I>(values: I, token: &str) -> bool
where
    I: IntoIterator<Item = &'a [u8]>,
{
    values.into_iter().any(|value| {
        value
            .split(|b| *b == b',')
            .any(|part| part.trim_ascii().eq_ignore_ascii_case(token.as_bytes()))
    })
}

/// A request asks for a protocol switch when `Connection` lists `upgrade`
/// and an `Upgrade` header is present.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        && has_token(
            headers
                .get_all(header::CONNECTION)
                .iter()
                .map(|v| v.as_bytes()),
            "upgrade",
        )
}

/// Remove hop-by-hop headers in place.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in &named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}
