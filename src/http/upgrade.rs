//! Protocol upgrade dispatch.
//!
//! # Responsibilities
//! - Admit upgrade attempts through the same pipeline as ordinary requests
//! - Refuse routes without upgrade support before any backend is contacted
//! - Relay the handshake with only the forwarding chain and `Host` rewritten
//! - Pipe raw bytes both ways until either side goes away
//!
//! # Design Decisions
//! - A handshake opening a connection is handled on the raw socket, before
//!   the HTTP stack sees it; the backend's answer reaches the client untouched
//! - A handshake later on a kept-alive connection goes through hyper's
//!   upgrade machinery and the same admission and checks
//! - Either copy direction ending drops both sides
//!
//! ```text
//! Received → RouteResolved → HandshakeRelayed → Piping → Closed
//!        ↘ Rejected
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, Method, Request, Response, StatusCode, Uri, Version};
use bytes::BytesMut;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::ForwardingConfig;
use crate::error::{GatewayError, UpgradeRejection};
use crate::http::pipeline::{Admitted, Pipeline, RequestContext};
use crate::http::response::raw_error_response;
use crate::net::sniff::RequestHead;
use crate::observability::metrics;
use crate::routing::Route;
use crate::security::headers::has_token;
use crate::security::ForwardedChain;

/// Where an upgrade session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    Received,
    RouteResolved,
    HandshakeRelayed,
    Piping,
    Closed,
    Rejected,
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpgradeState::Received => "received",
            UpgradeState::RouteResolved => "route_resolved",
            UpgradeState::HandshakeRelayed => "handshake_relayed",
            UpgradeState::Piping => "piping",
            UpgradeState::Closed => "closed",
            UpgradeState::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

struct Session {
    peer: SocketAddr,
    path: String,
    state: UpgradeState,
}

impl Session {
    fn new(peer: SocketAddr, path: impl Into<String>) -> Self {
        let path = path.into();
        tracing::debug!(peer = %peer, path = %path, state = %UpgradeState::Received, "Upgrade session");
        Self {
            peer,
            path,
            state: UpgradeState::Received,
        }
    }

    fn advance(&mut self, next: UpgradeState) {
        tracing::debug!(
            peer = %self.peer,
            path = %self.path,
            from = %self.state,
            to = %next,
            "Upgrade session"
        );
        self.state = next;
    }
}

/// Keeps the active-session gauge honest however the pipe ends.
struct ActiveSession;

impl ActiveSession {
    fn open() -> Self {
        metrics::upgrade_session_opened();
        Self
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        metrics::upgrade_session_closed();
    }
}

/// What the gateway checks in a handshake before relaying it.
#[derive(Debug, Clone, Copy)]
struct Handshake {
    is_get: bool,
    http_11: bool,
    websocket: bool,
    has_key: bool,
    has_version: bool,
}

impl Handshake {
    fn from_head(head: &RequestHead) -> Self {
        Self {
            is_get: head.method == "GET",
            http_11: head.minor_version >= 1,
            websocket: has_token(head.header_values("upgrade"), "websocket"),
            has_key: head.header("sec-websocket-key").is_some(),
            has_version: head.header("sec-websocket-version").is_some(),
        }
    }

    fn from_request<B>(request: &Request<B>) -> Self {
        let headers = request.headers();
        Self {
            is_get: request.method() == Method::GET,
            http_11: request.version() == Version::HTTP_11,
            websocket: has_token(
                headers.get_all(header::UPGRADE).iter().map(|v| v.as_bytes()),
                "websocket",
            ),
            has_key: headers.contains_key(header::SEC_WEBSOCKET_KEY),
            has_version: headers.contains_key(header::SEC_WEBSOCKET_VERSION),
        }
    }

    /// Only WebSocket upgrades over HTTP/1.1 GET are relayed.
    fn check(&self) -> Result<(), UpgradeRejection> {
        if !self.websocket {
            return Err(UpgradeRejection::MalformedHandshake(
                "unsupported upgrade protocol",
            ));
        }
        if !self.is_get {
            return Err(UpgradeRejection::MalformedHandshake("method must be GET"));
        }
        if !self.http_11 {
            return Err(UpgradeRejection::MalformedHandshake("HTTP/1.1 required"));
        }
        if !self.has_key {
            return Err(UpgradeRejection::MalformedHandshake(
                "missing Sec-WebSocket-Key",
            ));
        }
        if !self.has_version {
            return Err(UpgradeRejection::MalformedHandshake(
                "missing Sec-WebSocket-Version",
            ));
        }
        Ok(())
    }
}

/// Hands upgrade connections to their backends.
#[derive(Debug, Clone)]
pub struct UpgradeDispatcher {
    pipeline: Arc<Pipeline>,
    forwarded_header: HeaderName,
    change_origin: bool,
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl UpgradeDispatcher {
    pub fn new(
        pipeline: Arc<Pipeline>,
        forwarded_header: HeaderName,
        config: &ForwardingConfig,
    ) -> Self {
        Self {
            pipeline,
            forwarded_header,
            change_origin: config.change_origin,
            connect_timeout: config.connect_timeout(),
            response_timeout: config.timeout(),
        }
    }

    /// Own `client` until the session ends.
    ///
    /// `buf` holds every byte read so far: the head plus anything the client
    /// sent right behind it.
    pub async fn dispatch<S>(&self, mut client: S, peer: SocketAddr, head: RequestHead, buf: BytesMut)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut session = Session::new(peer, head.path());

        let admitted = match self.admit_head(peer, &head) {
            Ok(admitted) => admitted,
            Err(err) => {
                session.advance(UpgradeState::Rejected);
                reject(&mut client, peer, err).await;
                return;
            }
        };
        session.advance(UpgradeState::RouteResolved);
        let route = admitted.route.prefix().to_string();

        let mut backend = match self.connect(&admitted.route).await {
            Ok(backend) => backend,
            Err(err) => {
                session.advance(UpgradeState::Rejected);
                metrics::record_upgrade(&route, "backend_error");
                reject(&mut client, peer, err).await;
                return;
            }
        };

        let relayed = self.relay_head(&head, &admitted.route, &admitted.chain);
        let early = &buf[head.len.min(buf.len())..];
        let written = async {
            backend.write_all(&relayed).await?;
            if !early.is_empty() {
                backend.write_all(early).await?;
            }
            backend.flush().await
        };
        if let Err(e) = written.await {
            session.advance(UpgradeState::Rejected);
            metrics::record_upgrade(&route, "backend_error");
            let err = GatewayError::BackendUnreachable {
                backend: admitted.route.backend.to_string(),
                source: Box::new(e),
            };
            reject(&mut client, peer, err).await;
            return;
        }
        session.advance(UpgradeState::HandshakeRelayed);

        tracing::info!(
            peer = %peer,
            client = %admitted.identity,
            route = %route,
            backend = %admitted.route.backend,
            "Upgrade relayed"
        );

        // the backend's status line is never inspected on this path
        run_pipe(session, &route, client, backend).await;
        metrics::record_upgrade(&route, "piped");
    }

    /// Relay a handshake that reached the HTTP stack on a kept-alive
    /// connection.
    ///
    /// The backend's answer is returned for hyper to send. On `101` both
    /// upgraded connections are piped on a spawned task.
    pub async fn relay(
        &self,
        mut request: Request<Body>,
        peer: SocketAddr,
    ) -> Result<(String, Response<Body>), GatewayError> {
        let mut session = Session::new(peer, request.uri().path());

        let ctx = RequestContext::from_headers(
            request.method().clone(),
            request.uri().path(),
            peer,
            request.headers(),
            &self.forwarded_header,
        );
        let admitted = match self.admit(ctx, Handshake::from_request(&request)) {
            Ok(admitted) => admitted,
            Err(err) => {
                session.advance(UpgradeState::Rejected);
                tracing::info!(peer = %peer, error = %err, "Upgrade refused");
                return Err(err);
            }
        };
        session.advance(UpgradeState::RouteResolved);
        let route = admitted.route.prefix().to_string();

        let client_upgrade = hyper::upgrade::on(&mut request);
        let mut response = match self.relay_request(request.uri(), request.headers(), &admitted).await {
            Ok(response) => response,
            Err(err) => {
                session.advance(UpgradeState::Rejected);
                metrics::record_upgrade(&route, "backend_error");
                tracing::error!(peer = %peer, error = %err, "Upgrade backend failed");
                return Err(err);
            }
        };
        session.advance(UpgradeState::HandshakeRelayed);

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            tracing::info!(peer = %peer, route = %route, status = response.status().as_u16(), "Backend declined upgrade");
            metrics::record_upgrade(&route, "backend_refused");
            session.advance(UpgradeState::Closed);
            return Ok((route, response.map(Body::new)));
        }

        tracing::info!(
            peer = %peer,
            client = %admitted.identity,
            route = %route,
            backend = %admitted.route.backend,
            "Upgrade relayed"
        );

        let backend_upgrade = hyper::upgrade::on(&mut response);
        let piped_route = route.clone();
        tokio::spawn(async move {
            let route = piped_route;
            match tokio::try_join!(client_upgrade, backend_upgrade) {
                Ok((client, backend)) => {
                    run_pipe(session, &route, TokioIo::new(client), TokioIo::new(backend)).await;
                    metrics::record_upgrade(&route, "piped");
                }
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "Upgrade did not complete");
                    metrics::record_upgrade(&route, "backend_error");
                    session.advance(UpgradeState::Closed);
                }
            }
        });

        Ok((route, response.map(Body::new)))
    }

    /// Raw-socket admission: parse what the pipeline needs out of `head`.
    fn admit_head(&self, peer: SocketAddr, head: &RequestHead) -> Result<Admitted, GatewayError> {
        let method = Method::from_bytes(head.method.as_bytes()).map_err(|_| {
            GatewayError::UpgradeRejected(UpgradeRejection::MalformedHandshake("invalid method"))
        })?;
        let forwarded_for = head
            .header_values(self.forwarded_header.as_str())
            .filter_map(|v| std::str::from_utf8(v).ok())
            .map(str::to_owned)
            .collect();

        let ctx = RequestContext::new(method, head.path(), peer, forwarded_for);
        self.admit(ctx, Handshake::from_head(head))
    }

    /// Pipeline admission plus the upgrade-specific checks.
    fn admit(&self, ctx: RequestContext, handshake: Handshake) -> Result<Admitted, GatewayError> {
        let admitted = self.pipeline.run(ctx)?;

        if !admitted.route.supports_upgrade() {
            metrics::record_upgrade(admitted.route.prefix(), "rejected");
            return Err(GatewayError::UpgradeRejected(
                UpgradeRejection::NotUpgradeCapable,
            ));
        }
        if let Err(rejection) = handshake.check() {
            metrics::record_upgrade(admitted.route.prefix(), "rejected");
            return Err(GatewayError::UpgradeRejected(rejection));
        }
        Ok(admitted)
    }

    async fn connect(&self, route: &Route) -> Result<TcpStream, GatewayError> {
        let backend = &route.backend;
        match tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(backend.socket_address()),
        )
        .await
        {
            Ok(Ok(stream)) => {
                // latency of every relayed frame matters more than throughput here
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(backend = %backend, error = %e, "Failed to set TCP_NODELAY");
                }
                Ok(stream)
            }
            Ok(Err(e)) => Err(GatewayError::BackendUnreachable {
                backend: backend.to_string(),
                source: Box::new(e),
            }),
            Err(_) => Err(GatewayError::BackendTimeout {
                backend: backend.to_string(),
                timeout: self.connect_timeout,
            }),
        }
    }

    /// Send the handshake over a dedicated backend connection.
    async fn relay_request(
        &self,
        uri: &Uri,
        request_headers: &HeaderMap,
        admitted: &Admitted,
    ) -> Result<Response<Incoming>, GatewayError> {
        let backend = &admitted.route.backend;
        let stream = self.connect(&admitted.route).await?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake::<_, Body>(TokioIo::new(stream))
            .await
            .map_err(|e| GatewayError::BackendUnreachable {
                backend: backend.to_string(),
                source: Box::new(e),
            })?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                tracing::debug!(error = %e, "Upgrade backend connection ended");
            }
        });

        let target = uri
            .path_and_query()
            .map_or_else(|| uri.path(), |pq| pq.as_str());
        let mut outbound = Request::builder()
            .method(Method::GET)
            .uri(backend.target_path(target))
            .version(Version::HTTP_11)
            .body(Body::empty())
            .map_err(|e| GatewayError::MalformedRequest(e.to_string()))?;

        let headers = outbound.headers_mut();
        *headers = request_headers.clone();
        headers.remove(&self.forwarded_header);
        if self.change_origin {
            headers.insert(header::HOST, backend.host_header());
        }
        headers.insert(self.forwarded_header.clone(), admitted.chain.header_value());

        match tokio::time::timeout(self.response_timeout, sender.send_request(outbound)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(GatewayError::BackendUnreachable {
                backend: backend.to_string(),
                source: Box::new(e),
            }),
            Err(_) => Err(GatewayError::BackendTimeout {
                backend: backend.to_string(),
                timeout: self.response_timeout,
            }),
        }
    }

    /// Serialise the handshake for the backend.
    fn relay_head(&self, head: &RequestHead, route: &Route, chain: &ForwardedChain) -> Vec<u8> {
        let mut out = Vec::with_capacity(head.len + 64);
        out.extend_from_slice(
            format!(
                "{} {} HTTP/1.{}\r\n",
                head.method,
                route.backend.target_path(&head.target),
                head.minor_version
            )
            .as_bytes(),
        );

        for header in &head.headers {
            let name = header.name.as_str();
            if name.eq_ignore_ascii_case(self.forwarded_header.as_str())
                || (self.change_origin && name.eq_ignore_ascii_case("host"))
            {
                continue;
            }
            push_header(&mut out, name, &header.value);
        }

        if self.change_origin {
            push_header(&mut out, "Host", route.backend.authority().as_str().as_bytes());
        }
        push_header(
            &mut out,
            self.forwarded_header.as_str(),
            chain.header_string().as_bytes(),
        );
        out.extend_from_slice(b"\r\n");
        out
    }
}

fn push_header(out: &mut Vec<u8>, name: &str, value: &[u8]) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

/// Answer (or just drop) a refused upgrade.
async fn reject<S>(client: &mut S, peer: SocketAddr, err: GatewayError)
where
    S: AsyncWrite + Unpin,
{
    let response = match &err {
        // unroutable or invalid upgrades get no HTTP answer at all
        GatewayError::RouteNotFound { .. }
        | GatewayError::UpgradeRejected(_)
        | GatewayError::MalformedRequest(_) => None,
        other => raw_error_response(other),
    };

    match &err {
        GatewayError::RateLimitExceeded { .. } => {}
        GatewayError::BackendUnreachable { .. } | GatewayError::BackendTimeout { .. } => {
            tracing::error!(peer = %peer, error = %err, "Upgrade backend failed")
        }
        _ => tracing::info!(peer = %peer, error = %err, "Upgrade refused"),
    }

    if let Some(bytes) = response {
        if let Err(e) = client.write_all(&bytes).await {
            tracing::debug!(peer = %peer, error = %e, "Failed to write upgrade rejection");
        }
    }
    let _ = client.shutdown().await;
}

async fn run_pipe<C, B>(mut session: Session, route: &str, client: C, backend: B)
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    session.advance(UpgradeState::Piping);
    let active = ActiveSession::open();
    let (closed_by, result) = pipe(client, backend).await;
    drop(active);

    match result {
        Ok(bytes) => {
            tracing::debug!(peer = %session.peer, route, closed_by, bytes, "Upgrade pipe finished")
        }
        Err(e) => {
            tracing::debug!(peer = %session.peer, route, closed_by, error = %e, "Upgrade pipe failed")
        }
    }
    session.advance(UpgradeState::Closed);
}

/// Copy both directions until one of them ends, then drop both sides.
///
/// Returns which side finished first and the bytes it carried.
async fn pipe<C, B>(client: C, backend: B) -> (&'static str, std::io::Result<u64>)
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    tokio::select! {
        result = tokio::io::copy(&mut client_read, &mut backend_write) => ("client", result),
        result = tokio::io::copy(&mut backend_read, &mut client_write) => ("backend", result),
    }
}
