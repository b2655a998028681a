//! Gateway server setup and connection handling.
//!
//! # Responsibilities
//! - Build the admission pipeline, forwarder and upgrade dispatcher
//! - Create the Axum router with CORS, request IDs and tracing
//! - Accept connections and sniff the first request head on each
//! - Hand upgrades to the dispatcher and everything else to hyper
//! - Drain tracked connections on shutdown
//!
//! # Design Decisions
//! - Connections are served by hyper directly (not `axum::serve`) so the
//!   raw socket stays available to the upgrade path
//! - One task per connection; the accept loop never awaits request work
//! - An upgrade opening a connection is dispatched on the raw socket; later
//!   ones on a kept-alive connection go through hyper's upgrade support
//! - The HTTP/1 header read timeout also bounds how long a kept-alive
//!   connection may sit idle holding a connection permit

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, Request},
    response::{IntoResponse, Response},
    Router,
};
use bytes::BytesMut;
use hyper::body::Incoming;
use hyper_util::{
    rt::{TokioExecutor, TokioIo, TokioTimer},
    server::conn::auto,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tower::{ServiceBuilder, ServiceExt};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::{ConfigError, GatewayConfig};
use crate::error::GatewayError;
use crate::http::forward::{Forwarder, ProxiedRequest};
use crate::http::pipeline::{Pipeline, RateLimitStage, RequestContext};
use crate::http::response::raw_error_response;
use crate::http::upgrade::UpgradeDispatcher;
use crate::net::{
    read_head, ConnectionGuard, ConnectionPermit, ConnectionTracker, Listener, ListenerError,
    Rewind, SniffError, Sniffed,
};
use crate::observability::{logging::ACCESS_TARGET, metrics};
use crate::routing::RouteTable;
use crate::security::cors::cors_layer;
use crate::security::headers::is_upgrade_request;
use crate::security::FixedWindowLimiter;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub forwarder: Forwarder,
    pub dispatcher: UpgradeDispatcher,
}

/// Everything a spawned connection task needs.
#[derive(Clone)]
struct ConnectionContext {
    router: Router,
    dispatcher: UpgradeDispatcher,
    max_header_bytes: usize,
    header_read_timeout: Duration,
}

/// The API gateway.
pub struct GatewayServer {
    router: Router,
    dispatcher: UpgradeDispatcher,
    limiter: Option<Arc<FixedWindowLimiter>>,
    tracker: ConnectionTracker,
    config: GatewayConfig,
}

impl GatewayServer {
    /// Compile routes and build every subsystem. Fails on invalid routes
    /// or forwarding settings.
    pub fn new(config: GatewayConfig) -> Result<Self, ConfigError> {
        let routes = Arc::new(RouteTable::from_config(&config.routes)?);

        let limiter = config
            .rate_limit
            .enabled
            .then(|| Arc::new(FixedWindowLimiter::from_config(&config.rate_limit)));
        let rate_limit = limiter
            .as_ref()
            .map(|l| RateLimitStage::new(Arc::clone(l), config.rate_limit.message.clone()));
        let pipeline = Arc::new(Pipeline::standard(routes, rate_limit));
        tracing::debug!(stages = ?pipeline.stage_names(), "Admission pipeline ready");

        let forwarder = Forwarder::new(&config.forwarding)?;
        let dispatcher = UpgradeDispatcher::new(
            Arc::clone(&pipeline),
            forwarder.forwarded_header().clone(),
            &config.forwarding,
        );

        let state = AppState {
            pipeline,
            forwarder,
            dispatcher: dispatcher.clone(),
        };
        let router = Self::build_router(&config, state);

        Ok(Self {
            router,
            dispatcher,
            limiter,
            tracker: ConnectionTracker::new(),
            config,
        })
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(config: &GatewayConfig, state: AppState) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                    .layer(TraceLayer::new_for_http())
                    .layer(PropagateRequestIdLayer::x_request_id()),
            )
            .layer(cors_layer(&config.cors))
    }

    /// Accept connections until `shutdown` fires, then drain.
    pub async fn run(
        self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            routes = self.config.routes.len(),
            rate_limit = self.limiter.is_some(),
            "Gateway starting"
        );

        if let Some(limiter) = &self.limiter {
            let limiter = Arc::clone(limiter);
            let interval = self.config.rate_limit.sweep_interval();
            let stop = shutdown.resubscribe();
            tokio::spawn(async move { limiter.run_sweeper(interval, stop).await });
        }

        let ctx = ConnectionContext {
            router: self.router.clone(),
            dispatcher: self.dispatcher.clone(),
            max_header_bytes: self.config.listener.max_header_bytes,
            header_read_timeout: self.config.listener.header_read_timeout(),
        };

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, no longer accepting");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => {
                        let guard = self.tracker.track();
                        let ctx = ctx.clone();
                        let stop = shutdown.resubscribe();
                        tokio::spawn(async move {
                            serve_connection(ctx, stream, peer, permit, guard, stop).await;
                        });
                    }
                    Err(ListenerError::Accept(e)) => {
                        tracing::warn!(error = %e, "Accept failed");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Listener stopped");
                        break;
                    }
                },
            }
        }
        drop(listener);

        let deadline = self.config.listener.shutdown_drain();
        if self.tracker.drain(deadline).await {
            tracing::info!("All connections drained");
        } else {
            tracing::warn!(
                remaining = self.tracker.active_count(),
                deadline = ?deadline,
                "Drain deadline passed with connections still open"
            );
        }

        tracing::info!("Gateway stopped");
        Ok(())
    }
}

async fn serve_connection(
    ctx: ConnectionContext,
    mut stream: TcpStream,
    peer: SocketAddr,
    _permit: ConnectionPermit,
    guard: ConnectionGuard,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = BytesMut::with_capacity(4096);

    let sniffed = match read_head(
        &mut stream,
        &mut buf,
        ctx.max_header_bytes,
        ctx.header_read_timeout,
    )
    .await
    {
        Ok(sniffed) => sniffed,
        Err(e @ (SniffError::Malformed(_) | SniffError::TooLarge(_))) => {
            tracing::debug!(connection_id = %guard.id(), peer = %peer, error = %e, "Bad request head");
            if let Some(bytes) = raw_error_response(&GatewayError::MalformedRequest(e.to_string())) {
                let _ = stream.write_all(&bytes).await;
            }
            return;
        }
        Err(e) => {
            tracing::debug!(connection_id = %guard.id(), peer = %peer, error = %e, "Connection dropped before request");
            return;
        }
    };

    match sniffed {
        Sniffed::Empty => return,
        Sniffed::Head(head) if head.is_upgrade() => {
            ctx.dispatcher.dispatch(stream, peer, head, buf).await;
            return;
        }
        Sniffed::Head(_) | Sniffed::Http2Preface => {}
    }

    let io = TokioIo::new(Rewind::new(stream, buf.freeze()));
    let router = ctx.router;
    let service = hyper::service::service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(peer));
        router.clone().oneshot(request)
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(ctx.header_read_timeout);
    builder
        .http2()
        .timer(TokioTimer::new())
        .keep_alive_interval(ctx.header_read_timeout)
        .keep_alive_timeout(ctx.header_read_timeout);
    let conn = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.recv() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = result {
        tracing::debug!(connection_id = %guard.id(), peer = %peer, error = %e, "Connection error");
    }
}

/// Main proxy handler: admit, then forward.
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let (route, result) = if is_upgrade_request(request.headers()) {
        match state.dispatcher.relay(request, peer).await {
            Ok((route, response)) => (Some(route), Ok(response)),
            Err(err) => (None, Err(err)),
        }
    } else {
        let ctx = RequestContext::from_headers(
            method.clone(),
            path.clone(),
            peer,
            request.headers(),
            state.forwarder.forwarded_header(),
        );
        match state.pipeline.run(ctx) {
            Ok(admitted) => {
                let route = admitted.route.prefix().to_string();
                let proxied = ProxiedRequest::new(request, admitted);
                (Some(route), state.forwarder.forward(proxied).await)
            }
            Err(err) => (None, Err(err)),
        }
    };

    let response = match result {
        Ok(response) => response,
        Err(err) => {
            tracing::debug!(request_id = %request_id, kind = err.kind(), error = %err, "Request failed");
            err.into_response()
        }
    };

    let status = response.status();
    let bytes = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let route = route.as_deref().unwrap_or("none");

    tracing::info!(
        target: ACCESS_TARGET,
        request_id = %request_id,
        client = %peer,
        method = %method,
        path = %path,
        route,
        status = status.as_u16(),
        bytes,
        latency_ms = start.elapsed().as_millis() as u64,
        "request"
    );
    metrics::record_request(method.as_str(), status.as_u16(), route, start);

    response
}
