//! Admission pipeline shared by ordinary requests and upgrades.
//!
//! An explicit, ordered list of stages. Each stage takes the request context
//! and either short-circuits with a `GatewayError` or hands an augmented
//! context to the next one:
//!
//! ```text
//! RequestContext → IdentityStage → RateLimitStage → RouteStage → Admitted
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName, Method};

use crate::error::GatewayError;
use crate::observability::metrics;
use crate::routing::{Route, RouteTable};
use crate::security::{Admission, ClientIdentity, FixedWindowLimiter, ForwardedChain};

/// What the pipeline knows about one inbound request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub peer: SocketAddr,
    forwarded_for: Vec<String>,
    pub chain: Option<ForwardedChain>,
    pub identity: Option<ClientIdentity>,
    pub route: Option<Arc<Route>>,
}

impl RequestContext {
    /// `forwarded_for` holds the existing chain header values in arrival order.
    pub fn new(
        method: Method,
        path: impl Into<String>,
        peer: SocketAddr,
        forwarded_for: Vec<String>,
    ) -> Self {
        Self {
            method,
            path: path.into(),
            peer,
            forwarded_for,
            chain: None,
            identity: None,
            route: None,
        }
    }

    pub fn from_headers(
        method: Method,
        path: impl Into<String>,
        peer: SocketAddr,
        headers: &HeaderMap,
        forwarded_header: &HeaderName,
    ) -> Self {
        let forwarded_for = headers
            .get_all(forwarded_header)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_owned)
            .collect();
        Self::new(method, path, peer, forwarded_for)
    }

    fn resolved_chain(&self) -> ForwardedChain {
        match &self.chain {
            Some(chain) => chain.clone(),
            None => ForwardedChain::resolve(
                self.forwarded_for.iter().map(String::as_str),
                self.peer.ip(),
            ),
        }
    }

    fn resolved_identity(&self) -> ClientIdentity {
        match &self.identity {
            Some(identity) => identity.clone(),
            None => self.resolved_chain().client_identity(),
        }
    }
}

/// A request that passed every stage.
#[derive(Debug, Clone)]
pub struct Admitted {
    pub route: Arc<Route>,
    pub chain: ForwardedChain,
    pub identity: ClientIdentity,
}

/// One step of the admission pipeline.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, ctx: RequestContext) -> Result<RequestContext, GatewayError>;
}

/// Extends the forwarding chain and stamps the client identity.
#[derive(Debug, Default)]
pub struct IdentityStage;

impl Stage for IdentityStage {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn apply(&self, mut ctx: RequestContext) -> Result<RequestContext, GatewayError> {
        let chain = ctx.resolved_chain();
        ctx.identity = Some(chain.client_identity());
        ctx.chain = Some(chain);
        Ok(ctx)
    }
}

/// Consults the shared fixed-window limiter.
#[derive(Debug)]
pub struct RateLimitStage {
    limiter: Arc<FixedWindowLimiter>,
    message: String,
}

impl RateLimitStage {
    pub fn new(limiter: Arc<FixedWindowLimiter>, message: impl Into<String>) -> Self {
        Self {
            limiter,
            message: message.into(),
        }
    }
}

impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn apply(&self, ctx: RequestContext) -> Result<RequestContext, GatewayError> {
        let identity = ctx.resolved_identity();
        match self.limiter.admit(&identity) {
            Admission::Allowed { remaining } => {
                tracing::trace!(client = %identity, remaining, "Rate limit admitted");
                Ok(ctx)
            }
            Admission::Rejected { retry_after } => {
                tracing::warn!(client = %identity, path = %ctx.path, "Rate limit exceeded");
                metrics::record_rate_limited();
                Err(GatewayError::RateLimitExceeded {
                    identity: identity.to_string(),
                    retry_after,
                    message: self.message.clone(),
                })
            }
        }
    }
}

/// Resolves the request path against the route table.
#[derive(Debug)]
pub struct RouteStage {
    routes: Arc<RouteTable>,
}

impl RouteStage {
    pub fn new(routes: Arc<RouteTable>) -> Self {
        Self { routes }
    }
}

impl Stage for RouteStage {
    fn name(&self) -> &'static str {
        "route"
    }

    fn apply(&self, mut ctx: RequestContext) -> Result<RequestContext, GatewayError> {
        match self.routes.resolve(&ctx.path) {
            Some(route) => {
                ctx.route = Some(Arc::clone(route));
                Ok(ctx)
            }
            None => Err(GatewayError::RouteNotFound {
                path: ctx.path.clone(),
            }),
        }
    }
}

/// Ordered composition of stages.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// identity → rate limit (when a limiter is given) → route.
    pub fn standard(routes: Arc<RouteTable>, limiter: Option<RateLimitStage>) -> Self {
        let mut stages: Vec<Box<dyn Stage>> = vec![Box::new(IdentityStage)];
        if let Some(limiter) = limiter {
            stages.push(Box::new(limiter));
        }
        stages.push(Box::new(RouteStage::new(routes)));
        Self::new(stages)
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn run(&self, ctx: RequestContext) -> Result<Admitted, GatewayError> {
        let ctx = self
            .stages
            .iter()
            .try_fold(ctx, |ctx, stage| stage.apply(ctx))?;

        let chain = ctx.resolved_chain();
        let identity = ctx.resolved_identity();
        match ctx.route {
            Some(route) => Ok(Admitted {
                route,
                chain,
                identity,
            }),
            None => Err(GatewayError::RouteNotFound { path: ctx.path }),
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}
