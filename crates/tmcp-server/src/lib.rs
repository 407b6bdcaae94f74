//! HTTP transport: tool invocation with streamed results, health and
//! readiness reporting, Prometheus metrics, authentication, per-identity
//! rate limiting, and structured audit logging.
//!
//! The middleware pipeline is explicit and ordered: correlate →
//! authenticate → rate-limit → dispatch → size-cap. Each stage is a plain
//! function over `(request, next)`; the composition lives in
//! [`build_app`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod auth;
pub mod events;
pub mod health;
pub mod metrics;
pub mod ratelimit;

use crate::audit::{AuditEvent, AuditKind, AuditLogger};
use crate::auth::{Auth, AuthOutcome};
use crate::events::{spawn_tool_stream, StreamContext, API_VERSION};
use crate::metrics::MetricsRegistry;
use crate::ratelimit::{RateDecision, RateLimiter};
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::{Extension, Router};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tmcp_archive::ArchiveConfig;
use tmcp_change::FsTemplater;
use tmcp_config::{ServerConfig, MAX_OPEN_STREAMS};
use tmcp_error::{CorrelationId, ErrorCode, TaskError, TaskErrorDto};
use tmcp_ops::Operations;
use tmcp_sandbox::Sandbox;
use tokio::sync::Semaphore;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::info;

/// Rate-limit identity attached to authenticated requests.
#[derive(Debug, Clone)]
pub struct Identity(pub String);

/// Shared server state, built once at startup and injected everywhere.
pub struct AppState {
    /// Runtime configuration.
    pub config: ServerConfig,
    /// Shared operation handlers.
    pub ops: Arc<Operations>,
    /// Authentication state.
    pub auth: Auth,
    /// Rate-limit state.
    pub rate: RateLimiter,
    /// Audit logger.
    pub audit: AuditLogger,
    /// Counter registry.
    pub metrics: Arc<MetricsRegistry>,
    /// Server start instant (for `/healthz` uptime).
    pub started_at: Instant,
    /// Flipped during graceful shutdown; `/healthz` turns 503.
    pub tearing_down: AtomicBool,
    /// Cap on simultaneously open event streams.
    pub streams: Arc<Semaphore>,
}

/// The state handle handlers receive.
pub type SharedState = Arc<AppState>;

/// Assemble the full state from configuration.
///
/// # Errors
///
/// Propagates sandbox construction failures (`EIO`).
pub fn build_state(
    config: ServerConfig,
    audit_sink: Arc<dyn audit::AuditSink>,
) -> Result<SharedState, TaskError> {
    let sandbox = Sandbox::new(&config.working_directory)?;
    let archive_config = ArchiveConfig {
        task_mcp_version: config.task_mcp_version.clone(),
        ..ArchiveConfig::default()
    };
    let ops = Arc::new(Operations::new(
        sandbox,
        Arc::new(FsTemplater::new()),
        archive_config,
    ));
    Ok(Arc::new(AppState {
        auth: Auth::new(config.auth_tokens.iter().cloned()),
        rate: RateLimiter::new(config.rate_limit_per_minute, config.burst_limit()),
        audit: AuditLogger::new(audit_sink),
        metrics: Arc::new(MetricsRegistry::new()),
        started_at: Instant::now(),
        tearing_down: AtomicBool::new(false),
        streams: Arc::new(Semaphore::new(MAX_OPEN_STREAMS)),
        ops,
        config,
    }))
}

/// Build the router with the full middleware pipeline.
pub fn build_app(state: SharedState) -> Router {
    let protected = Router::new()
        .route("/mcp", post(mcp_handler))
        .route("/sse", post(sse_handler))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_mw))
        .layer(middleware::from_fn_with_state(state.clone(), auth_mw));

    let admin = Router::new()
        .route("/security/metrics", get(security_metrics_handler))
        .layer(middleware::from_fn_with_state(state.clone(), auth_mw));

    let open = Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/metrics", get(metrics_handler));

    Router::new()
        .merge(protected)
        .merge(admin)
        .merge(open)
        .layer(middleware::from_fn(request_logger_mw))
        .layer(middleware::from_fn(correlate_mw))
        .layer(cors_layer(&state.config))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Assign the request's correlation ID and echo it as a response header.
async fn correlate_mw(mut req: Request, next: Next) -> Response {
    let correlation_id = CorrelationId::generate();
    req.extensions_mut().insert(correlation_id.clone());
    let mut resp = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(correlation_id.as_str()) {
        resp.headers_mut().insert("x-correlation-id", value);
    }
    resp
}

/// Log method, path, status, duration, and correlation ID per request.
async fn request_logger_mw(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let correlation_id = req
        .extensions()
        .get::<CorrelationId>()
        .map(|c| c.to_string())
        .unwrap_or_default();
    let start = Instant::now();

    let resp = next.run(req).await;

    info!(
        correlation_id = %correlation_id,
        http.method = %method,
        http.path = %path,
        http.status = resp.status().as_u16(),
        http.duration_ms = start.elapsed().as_millis() as u64,
        "request completed"
    );
    resp
}

/// Authenticate and attach the rate-limit [`Identity`].
async fn auth_mw(State(state): State<SharedState>, mut req: Request, next: Next) -> Response {
    let client = client_addr(&req);
    let correlation_id = correlation_of(&req);
    let bearer = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let cookie = req
        .headers()
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(auth_cookie);

    match state.auth.check(bearer, cookie, &client) {
        AuthOutcome::Allowed { identity } => {
            if state.auth.enabled() {
                state.metrics.incr("tmcp_auth_success_total");
                state.audit.record(
                    AuditEvent::new(AuditKind::AuthSuccess)
                        .correlation(correlation_id.as_str())
                        .client(&client),
                );
            }
            req.extensions_mut().insert(Identity(identity));
            next.run(req).await
        }
        AuthOutcome::Missing => {
            state.metrics.incr("tmcp_auth_failures_total");
            state.audit.record(
                AuditEvent::new(AuditKind::AuthMissing)
                    .correlation(correlation_id.as_str())
                    .client(&client),
            );
            error_response(
                &correlation_id,
                TaskError::new(ErrorCode::AuthMissing, "authentication required")
                    .with_hint("supply Authorization: Bearer <token> or an auth_token cookie"),
            )
        }
        AuthOutcome::Invalid => {
            state.metrics.incr("tmcp_auth_failures_total");
            state.audit.record(
                AuditEvent::new(AuditKind::AuthInvalid)
                    .correlation(correlation_id.as_str())
                    .client(&client),
            );
            error_response(
                &correlation_id,
                TaskError::new(ErrorCode::AuthInvalid, "token not recognised"),
            )
        }
        AuthOutcome::Blocked { retry_after } => {
            state.metrics.incr("tmcp_rate_limited_total");
            state.audit.record(
                AuditEvent::new(AuditKind::AuthRateLimited)
                    .correlation(correlation_id.as_str())
                    .client(&client),
            );
            let mut resp = error_response(
                &correlation_id,
                TaskError::new(
                    ErrorCode::RateLimited,
                    "too many failed authentication attempts",
                )
                .with_hint(format!("retry after {retry_after}s")),
            );
            insert_header(&mut resp, "retry-after", &retry_after.to_string());
            resp
        }
    }
}

/// Enforce the per-identity request budget and attach the
/// `X-RateLimit-*` headers.
async fn rate_limit_mw(State(state): State<SharedState>, req: Request, next: Next) -> Response {
    let correlation_id = correlation_of(&req);
    let identity = req
        .extensions()
        .get::<Identity>()
        .map(|i| i.0.clone())
        .unwrap_or_else(|| format!("addr:{}", client_addr(&req)));

    let decision = state.rate.check(&identity);
    if !decision.allowed {
        state.metrics.incr("tmcp_rate_limited_total");
        state.metrics.incr("tmcp_requests_blocked_total");
        state.audit.record(
            AuditEvent::new(AuditKind::RequestBlocked)
                .correlation(correlation_id.as_str())
                .detail("rate limit"),
        );
        let mut resp = error_response(
            &correlation_id,
            TaskError::new(ErrorCode::RateLimited, "request budget exhausted")
                .with_hint(format!("retry after {}s", decision.reset_seconds)),
        );
        attach_rate_headers(&mut resp, decision);
        insert_header(&mut resp, "retry-after", &decision.reset_seconds.to_string());
        return resp;
    }

    let mut resp = next.run(req).await;
    attach_rate_headers(&mut resp, decision);
    resp
}

fn attach_rate_headers(resp: &mut Response, decision: RateDecision) {
    insert_header(resp, "x-ratelimit-limit", &decision.limit.to_string());
    insert_header(resp, "x-ratelimit-remaining", &decision.remaining.to_string());
    insert_header(resp, "x-ratelimit-reset", &decision.reset_seconds.to_string());
}

fn insert_header(resp: &mut Response, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        resp.headers_mut().insert(name, value);
    }
}

fn client_addr(req: &Request) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn correlation_of(req: &Request) -> CorrelationId {
    req.extensions()
        .get::<CorrelationId>()
        .cloned()
        .unwrap_or_else(CorrelationId::generate)
}

/// Extract the `auth_token` cookie value from a `Cookie` header.
fn auth_cookie(header: &str) -> Option<&str> {
    header
        .split(';')
        .map(str::trim)
        .find_map(|pair| pair.strip_prefix("auth_token="))
}

/// Single translation point from the taxonomy to an HTTP response.
fn error_response(correlation_id: &CorrelationId, err: TaskError) -> Response {
    let status =
        StatusCode::from_u16(err.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let dto = TaskErrorDto::from_error(&err, correlation_id);
    (status, Json(json!({ "error": dto }))).into_response()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Body of `POST /mcp` and `POST /sse`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct McpRequest {
    tool: String,
    #[serde(default)]
    input: Value,
    api_version: Option<String>,
}

async fn mcp_handler(
    State(state): State<SharedState>,
    Extension(correlation_id): Extension<CorrelationId>,
    Json(body): Json<McpRequest>,
) -> Response {
    let Ok(permit) = state.streams.clone().try_acquire_owned() else {
        return busy_response(&state, &correlation_id);
    };

    let rx = spawn_tool_stream(
        stream_context(&state),
        correlation_id,
        body.tool,
        body.input,
        body.api_version.unwrap_or_else(|| API_VERSION.to_string()),
    );
    let lines = ReceiverStream::new(rx).map(move |frame| {
        let _hold = &permit;
        Ok::<_, Infallible>(frame.ndjson_line())
    });

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response()
}

async fn sse_handler(
    State(state): State<SharedState>,
    Extension(correlation_id): Extension<CorrelationId>,
    Json(body): Json<McpRequest>,
) -> Response {
    let Ok(permit) = state.streams.clone().try_acquire_owned() else {
        return busy_response(&state, &correlation_id);
    };

    let heartbeat = Duration::from_millis(state.config.sse_heartbeat_ms);
    let id = correlation_id.to_string();
    let rx = spawn_tool_stream(
        stream_context(&state),
        correlation_id,
        body.tool,
        body.input,
        body.api_version.unwrap_or_else(|| API_VERSION.to_string()),
    );

    // One heartbeat immediately on connection, then the event frames; the
    // keep-alive layer covers quiet gaps in between.
    let events = stream::once(async { Ok::<_, Infallible>(SseEvent::default().comment("keep-alive")) })
        .chain(ReceiverStream::new(rx).map(move |frame| {
            let _hold = &permit;
            Ok(SseEvent::default()
                .event(frame.kind)
                .id(id.clone())
                .data(frame.payload.to_string()))
        }));

    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(heartbeat).text("keep-alive"))
        .into_response()
}

fn stream_context(state: &SharedState) -> StreamContext {
    StreamContext {
        ops: Arc::clone(&state.ops),
        metrics: Arc::clone(&state.metrics),
        audit: state.audit.clone(),
        cap_bytes: state.config.max_response_bytes(),
    }
}

fn busy_response(state: &SharedState, correlation_id: &CorrelationId) -> Response {
    state.metrics.incr("tmcp_requests_blocked_total");
    error_response(
        correlation_id,
        TaskError::new(ErrorCode::ServerBusy, "too many open streams")
            .with_hint("retry once an existing stream completes"),
    )
}

async fn healthz_handler(State(state): State<SharedState>) -> Response {
    if state.tearing_down.load(Ordering::Relaxed) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "shutting_down" })),
        )
            .into_response();
    }
    Json(json!({
        "status": "ok",
        "uptime": state.started_at.elapsed().as_secs(),
        "version": state.config.task_mcp_version,
    }))
    .into_response()
}

async fn readyz_handler(State(state): State<SharedState>) -> Response {
    let report = health::run_probes(state.ops.sandbox());
    let status = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

async fn metrics_handler(State(state): State<SharedState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
        .into_response()
}

async fn security_metrics_handler(State(state): State<SharedState>) -> Response {
    let mut summary = state.metrics.security_summary();
    if let Value::Object(map) = &mut summary {
        map.insert(
            "tracking".to_string(),
            json!({
                "failedAuthClients": state.auth.tracked_clients(),
                "rateLimitIdentities": state.rate.tracked_identities(),
            }),
        );
    }
    Json(summary).into_response()
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    if config.allowed_origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let patterns = config.allowed_origins.clone();
    CorsLayer::new().allow_origin(AllowOrigin::predicate(move |origin, _| {
        origin
            .to_str()
            .is_ok_and(|o| patterns.iter().any(|p| origin_matches(p, o)))
    }))
}

/// Simple `*` wildcard match for origin patterns like
/// `https://*.example.com`.
fn origin_matches(pattern: &str, origin: &str) -> bool {
    let mut remainder = origin;
    let mut segments = pattern.split('*').peekable();
    let mut first = true;
    while let Some(segment) = segments.next() {
        if first {
            first = false;
            let Some(rest) = remainder.strip_prefix(segment) else {
                return false;
            };
            remainder = rest;
            continue;
        }
        if segments.peek().is_none() {
            return segment.is_empty() || remainder.ends_with(segment);
        }
        match remainder.find(segment) {
            Some(pos) if !segment.is_empty() => remainder = &remainder[pos + segment.len()..],
            _ => return false,
        }
    }
    segments.peek().is_none() && (pattern.ends_with('*') || remainder.is_empty())
}
