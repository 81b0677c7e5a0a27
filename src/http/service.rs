//! HTTP handlers for the decision and admin endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::middleware::{enforce_rate_limit, RouteLimit};
use crate::error::BulwarkError;
use crate::ratelimit::{AttackType, CheckResult, RateLimitEngine, RateLimitRule, StatsSnapshot};

/// Rule guarding the admin endpoints.
pub const ADMIN_RULE: &str = "sensitive_operations";

/// Body of `POST /v1/check`.
#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub rule: String,
    pub identifier: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Body of `POST /admin/blocks`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRequest {
    pub identifier: String,
    pub duration_ms: u64,
    #[serde(default = "default_block_reason")]
    pub reason: String,
}

fn default_block_reason() -> String {
    "manual".to_string()
}

/// Body of `POST /admin/attacks`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttackReport {
    pub identifier: String,
    pub attack_type: AttackType,
    #[serde(default)]
    pub evidence: serde_json::Value,
}

/// Error response for the HTTP surface.
#[derive(Debug)]
pub struct ApiError(BulwarkError);

impl From<BulwarkError> for ApiError {
    fn from(err: BulwarkError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            BulwarkError::InvalidArgument(_) | BulwarkError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "success": false,
            "error": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn invalid_argument(message: &str) -> ApiError {
    ApiError(BulwarkError::InvalidArgument(message.to_string()))
}

/// Build the service router.
///
/// Admin endpoints are themselves limited by the `sensitive_operations` rule.
pub fn router(engine: Arc<RateLimitEngine>) -> Router {
    let admin = Router::new()
        .route("/stats", get(stats))
        .route("/stats/reset", post(reset_stats))
        .route("/blocks", post(block))
        .route("/blocks/{identifier}", delete(unblock))
        .route("/rules", get(list_rules).put(put_rule))
        .route("/attacks", post(report_attack))
        .layer(middleware::from_fn_with_state(
            RouteLimit::new(engine.clone(), ADMIN_RULE),
            enforce_rate_limit,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/v1/check", post(check))
        .nest("/admin", admin)
        .with_state(engine)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Decide whether a request may proceed.
#[instrument(skip(engine, request), fields(rule = %request.rule, identifier = %request.identifier))]
async fn check(
    State(engine): State<Arc<RateLimitEngine>>,
    Json(request): Json<CheckRequest>,
) -> ApiResult<Json<CheckResult>> {
    if request.rule.is_empty() {
        warn!("Received check request with empty rule");
        return Err(invalid_argument("rule is required"));
    }
    if request.identifier.is_empty() {
        warn!("Received check request with empty identifier");
        return Err(invalid_argument("identifier is required"));
    }

    let result = engine
        .check_limit(&request.rule, &request.identifier, request.metadata)
        .await;
    debug!(allowed = result.allowed, "Check complete");
    Ok(Json(result))
}

async fn stats(State(engine): State<Arc<RateLimitEngine>>) -> Json<StatsSnapshot> {
    Json(engine.get_stats())
}

async fn reset_stats(State(engine): State<Arc<RateLimitEngine>>) -> StatusCode {
    engine.reset_stats();
    StatusCode::NO_CONTENT
}

async fn block(
    State(engine): State<Arc<RateLimitEngine>>,
    Json(request): Json<BlockRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    engine.block_identifier(&request.identifier, request.duration_ms, &request.reason)?;
    let body = json!({
        "identifier": request.identifier,
        "reason": request.reason,
        "unblockAt": engine.now_ms().saturating_add(request.duration_ms),
    });
    Ok((StatusCode::CREATED, Json(body)))
}

async fn unblock(
    State(engine): State<Arc<RateLimitEngine>>,
    Path(identifier): Path<String>,
) -> Json<serde_json::Value> {
    let removed = engine.unblock_identifier(&identifier);
    Json(json!({ "identifier": identifier, "removed": removed }))
}

async fn list_rules(State(engine): State<Arc<RateLimitEngine>>) -> Json<Vec<RateLimitRule>> {
    Json(engine.rules())
}

async fn put_rule(
    State(engine): State<Arc<RateLimitEngine>>,
    Json(rule): Json<RateLimitRule>,
) -> ApiResult<Json<RateLimitRule>> {
    engine.add_rule(rule.clone())?;
    Ok(Json(rule))
}

async fn report_attack(
    State(engine): State<Arc<RateLimitEngine>>,
    Json(report): Json<AttackReport>,
) -> ApiResult<Json<serde_json::Value>> {
    if report.identifier.is_empty() {
        return Err(invalid_argument("identifier is required"));
    }

    let detection = engine.report_attack(&report.identifier, report.attack_type, report.evidence);
    let body = match detection {
        Some(detection) => json!({
            "detected": true,
            "severity": detection.pattern.severity,
            "blocked": detection.blocked,
        }),
        None => json!({ "detected": false }),
    };
    Ok(Json(body))
}
