//! Rate limit service implementation.

use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, instrument, warn};

use super::proto::{rate_limit_service_server::RateLimitService, CheckRequest, CheckResponse};
use crate::ratelimit::{BucketBackend, Decision, Identifiers, RateLimiter, RouteId};

/// Implementation of the `RateLimitService` gRPC interface.
pub struct RateLimitServiceImpl<B: BucketBackend> {
    /// The rate limiter instance
    rate_limiter: Arc<RateLimiter<B>>,
}

impl<B: BucketBackend> RateLimitServiceImpl<B> {
    /// Create a new RateLimitServiceImpl with the given rate limiter.
    pub fn new(rate_limiter: Arc<RateLimiter<B>>) -> Self {
        Self { rate_limiter }
    }
}

fn identifiers_from(req: &CheckRequest) -> Identifiers {
    let mut ids = Identifiers::new();
    if let Some(ip) = req.ip.as_deref() {
        ids = ids.with_ip(ip);
    }
    if let Some(email) = req.email.as_deref() {
        ids = ids.with_email(email);
    }
    if let Some(id) = req.okta_identifier.as_deref() {
        ids = ids.with_okta_identifier(id);
    }
    if let Some(hash) = req.access_token_hash.as_deref() {
        ids = ids.with_access_token_hash(hash);
    }
    ids
}

fn response_from(decision: Decision) -> CheckResponse {
    match decision {
        Decision::Allow => CheckResponse {
            allowed: true,
            retry_after: None,
            retry_after_ms: 0,
            limited_by: String::new(),
        },
        Decision::Deny { retry_after_ms, .. } => CheckResponse {
            allowed: false,
            retry_after: Some(prost_types::Duration {
                seconds: (retry_after_ms / 1000) as i64,
                nanos: ((retry_after_ms % 1000) * 1_000_000) as i32,
            }),
            retry_after_ms,
            limited_by: decision
                .limited_by()
                .map(|d| d.as_str().to_string())
                .unwrap_or_default(),
        },
    }
}

#[tonic::async_trait]
impl<B: BucketBackend + 'static> RateLimitService for RateLimitServiceImpl<B> {
    /// Decide whether a gateway request may proceed.
    ///
    /// A deny is a normal response with `allowed = false`; only malformed
    /// requests produce a gRPC error.
    #[instrument(
        skip(self, request),
        fields(route = %request.get_ref().route)
    )]
    async fn check(
        &self,
        request: Request<CheckRequest>,
    ) -> Result<Response<CheckResponse>, Status> {
        let req = request.into_inner();

        let route: RouteId = match req.route.parse() {
            Ok(route) => route,
            Err(e) => {
                warn!(route = %req.route, "Received check for unknown route");
                return Err(Status::invalid_argument(e.to_string()));
            }
        };

        let identifiers = identifiers_from(&req);
        let decision = self.rate_limiter.check(route, &identifiers).await;

        debug!(
            route = %route,
            allowed = decision.is_allowed(),
            retry_after_ms = decision.retry_after_ms(),
            "Rate limit decision made"
        );

        Ok(Response::new(response_from(decision)))
    }
}
