//! Client identity and the forwarding chain.
//!
//! The chain is always extended, never overwritten: every hop that carried
//! the request stays visible to backends, including this gateway's peer.
//! The first hop is the rate-limit identity.

use std::fmt;
use std::net::IpAddr;

use axum::http::{HeaderMap, HeaderName, HeaderValue};

/// The address a request is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    address: String,
}

impl ClientIdentity {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Ordered list of hops, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedChain {
    hops: Vec<String>,
}

impl ForwardedChain {
    /// Merge the existing header values (in arrival order) with the peer.
    pub fn resolve<'a, I>(existing: I, peer: IpAddr) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut hops: Vec<String> = existing
            .into_iter()
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|hop| !hop.is_empty())
            .map(str::to_owned)
            .collect();
        hops.push(peer.to_string());
        Self { hops }
    }

    /// Read the chain header from `headers`. Values that are not valid
    /// UTF-8 are ignored.
    pub fn from_headers(headers: &HeaderMap, name: &HeaderName, peer: IpAddr) -> Self {
        Self::resolve(
            headers
                .get_all(name)
                .iter()
                .filter_map(|value| value.to_str().ok()),
            peer,
        )
    }

    /// Identity used for rate limiting: the first recorded hop.
    pub fn client_identity(&self) -> ClientIdentity {
        // resolve always pushes the peer, so hops is never empty
        ClientIdentity::new(self.hops.first().cloned().unwrap_or_default())
    }

    pub fn hops(&self) -> &[String] {
        &self.hops
    }

    pub fn header_string(&self) -> String {
        self.hops.join(", ")
    }

    pub fn header_value(&self) -> HeaderValue {
        // Hops came from valid header text or an IpAddr.
        HeaderValue::from_str(&self.header_string())
            .unwrap_or_else(|_| HeaderValue::from_static("unknown"))
    }
}
