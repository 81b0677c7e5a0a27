//! Request middleware enforcing a rate limit rule.
//!
//! ```rust,ignore
//! let limit = RouteLimit::new(engine.clone(), "auth_login");
//! let app = Router::new()
//!     .route("/login", post(login))
//!     .layer(middleware::from_fn_with_state(limit, enforce_rate_limit));
//! ```

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::ratelimit::{CheckResult, RateLimitEngine};

/// Configured limit for the route.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Hits left in the current window.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Epoch seconds at which the window resets.
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";
const UNKNOWN_CLIENT: &str = "unknown";

/// The rule a route is limited by, plus the engine enforcing it.
#[derive(Clone)]
pub struct RouteLimit {
    engine: Arc<RateLimitEngine>,
    rule: Arc<str>,
}

impl RouteLimit {
    /// Limit a route by a registered rule.
    pub fn new(engine: Arc<RateLimitEngine>, rule: impl Into<String>) -> Self {
        Self {
            engine,
            rule: Arc::from(rule.into()),
        }
    }

    /// Limit a route by an ad hoc (max attempts, window) pair.
    ///
    /// Routes built with the same pair share one synthetic rule, and with it
    /// one counter per client.
    pub fn simple(engine: Arc<RateLimitEngine>, max_attempts: u64, window_ms: u64) -> Result<Self> {
        let rule = engine.ensure_synthetic_rule(max_attempts, window_ms)?;
        Ok(Self::new(engine, rule))
    }

    /// Name of the enforced rule.
    pub fn rule(&self) -> &str {
        &self.rule
    }
}

/// Resolve the client identifier for a request.
///
/// Takes the first hop of `X-Forwarded-For`, then `X-Real-IP`, then the
/// connection's peer address.
pub fn client_identifier(headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> String {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    header_value(FORWARDED_FOR)
        .or_else(|| header_value(REAL_IP))
        .or_else(|| remote_addr.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// Middleware: check the route's rule before running the handler.
pub async fn enforce_rate_limit(
    State(limit): State<RouteLimit>,
    request: Request,
    next: Next,
) -> Response {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let identifier = client_identifier(request.headers(), remote_addr);
    let metadata = json!({
        "method": request.method().as_str(),
        "path": request.uri().path(),
    });

    let result = limit
        .engine
        .check_limit(limit.rule(), &identifier, Some(metadata))
        .await;

    if !result.allowed {
        debug!(rule = %limit.rule(), identifier = %identifier, "Rejecting rate limited request");
        return too_many_requests(&result);
    }

    let mut response = next.run(request).await;
    apply_limit_headers(&result, response.headers_mut());
    response
}

fn apply_limit_headers(result: &CheckResult, headers: &mut HeaderMap) {
    // Unknown rule or fail-open: nothing meaningful to report.
    let Some(info) = &result.limit_info else {
        return;
    };

    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(info.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(info.remaining_points));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(info.reset_at.div_ceil(1000)));
}

fn too_many_requests(result: &CheckResult) -> Response {
    let retry_after = result.retry_after.unwrap_or(1);
    let message = if result.block_reason.is_some() {
        "Access temporarily blocked. Please try again later."
    } else {
        "Too many requests. Please try again later."
    };

    let mut body = json!({
        "success": false,
        "error": message,
        "message": message,
        "retryAfter": retry_after,
    });
    if let Some(reason) = &result.block_reason {
        body["blockReason"] = json!(reason);
    }

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(0u64));
    response
}
