//! HTTP surface: rate limiting middleware plus the decision and admin API.

mod middleware;
mod server;
mod service;

pub use middleware::{
    client_identifier, enforce_rate_limit, RouteLimit, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
    X_RATELIMIT_RESET,
};
pub use server::HttpServer;
pub use service::{router, ApiError, AttackReport, BlockRequest, CheckRequest, ADMIN_RULE};
