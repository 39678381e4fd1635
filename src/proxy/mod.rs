use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Request};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

mod retry;
pub mod upstream;

use crate::state::{ChatFailureKind, ProxyState};

use self::upstream::{UpstreamClient, UpstreamError};

/// Alias paths kept for compatibility with existing frontends; every alias
/// in a set hits the same handler.
pub const CHAT_PATHS: [&str; 3] = ["/api/spark", "/spark", "/v2/chat/completions"];
pub const DIAG_PATHS: [&str; 3] = ["/api/test", "/test", "/status"];

/// Advertised chat endpoint in descriptor and diagnostics payloads.
const CHAT_ENDPOINT: &str = "/api/spark";

const MAX_BODY_BYTES: usize = 1024 * 1024;

const CORS_ALLOW_HEADERS: &str =
    "Origin, X-Requested-With, Content-Type, Accept, Authorization";
const CORS_ALLOW_METHODS: &str = "POST, GET, OPTIONS";

#[derive(Clone)]
pub struct ProxyService {
    upstream: UpstreamClient,
    state: ProxyState,
    registry_file: PathBuf,
}

impl ProxyService {
    pub fn new(upstream: UpstreamClient, state: ProxyState, registry_file: PathBuf) -> Self {
        Self {
            upstream,
            state,
            registry_file,
        }
    }
}

/// Unexpected handler failure, turned into a structured 500 instead of
/// tearing down the connection.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct InternalError(#[from] anyhow::Error);

impl IntoResponse for InternalError {
    fn into_response(self) -> Response {
        warn!("handler error: {:#}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "internal server error",
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}

pub fn router(proxy: ProxyService) -> Router {
    let p0 = proxy.clone();
    let p1 = proxy.clone();

    let mut app = Router::new()
        .route("/", get(service_descriptor))
        .route("/health", get(move || health(p0.clone())))
        .route("/proxy-port.json", get(move || port_registry_file(p1.clone())));

    for path in CHAT_PATHS {
        let p = proxy.clone();
        app = app.route(path, post(move |body: Bytes| handle_chat(p.clone(), body)));
    }
    for path in DIAG_PATHS {
        let p = proxy.clone();
        app = app.route(path, get(move || diagnostics(p.clone())));
    }

    app.fallback(not_found)
        .layer(middleware::from_fn(access_log))
        .layer(middleware::from_fn(cors_headers))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}

/// Permissive CORS for the co-located frontend. Preflight requests
/// short-circuit to an empty 200 before routing (and before the access
/// log).
async fn cors_headers(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut resp = StatusCode::OK.into_response();
        apply_cors(resp.headers_mut());
        return resp;
    }
    let mut resp = next.run(req).await;
    apply_cors(resp.headers_mut());
    resp
}

fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_ALLOW_METHODS),
    );
}

async fn access_log(req: Request, next: Next) -> Response {
    info!("{} {}", req.method(), req.uri().path());
    next.run(req).await
}

async fn service_descriptor() -> Json<Value> {
    Json(json!({
        "message": "spark proxy is running",
        "status": "running",
        "endpoints": {
            "spark": CHAT_ENDPOINT,
            "test": "/api/test",
            "health": "/health",
            "root": "/",
        },
        "time": rfc3339_now(),
    }))
}

async fn health(proxy: ProxyService) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "uptime": proxy.state.uptime().as_secs_f64(),
    }))
}

/// Serves the persisted port-registry file so other local processes can
/// discover the live port over HTTP as well.
async fn port_registry_file(proxy: ProxyService) -> Result<Response, InternalError> {
    match tokio::fs::read(&proxy.registry_file).await {
        Ok(bytes) => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
            bytes,
        )
            .into_response()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "port registry file not found" })),
        )
            .into_response()),
        Err(err) => Err(anyhow::Error::new(err)
            .context(format!(
                "failed to read port registry {}",
                proxy.registry_file.display()
            ))
            .into()),
    }
}

async fn handle_chat(proxy: ProxyService, body: Bytes) -> Response {
    let request_id = uuid::Uuid::new_v4();
    debug!(%request_id, "chat request body: {}", body_preview(&body, 300));

    let message_count = serde_json::from_slice::<Value>(&body)
        .ok()
        .as_ref()
        .and_then(|v| v.get("messages"))
        .and_then(|m| m.as_array())
        .map(|m| m.len());
    let Some(message_count) = message_count else {
        info!(%request_id, "rejected chat request without a valid messages array");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "invalid request body",
                "message": "missing required `messages` field or it is not an array",
            })),
        )
            .into_response();
    };

    info!(%request_id, "forwarding chat request with {message_count} messages");
    match proxy.upstream.forward_chat(body).await {
        Ok(resp_body) => {
            proxy.state.record_chat_success();
            debug!(%request_id, "upstream response: {}", body_preview(&resp_body, 300));
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
                resp_body,
            )
                .into_response()
        }
        Err(err) => {
            let (kind, code, details) = match &err {
                UpstreamError::Http { status, body } => {
                    warn!(
                        %request_id,
                        "upstream returned HTTP {status}: {}",
                        body_preview(body, 2048)
                    );
                    let kind = if *status == 401 {
                        warn!(%request_id, "credential may be invalid, check the configured bearer token");
                        ChatFailureKind::CredentialRejected
                    } else {
                        ChatFailureKind::UpstreamHttp
                    };
                    (kind, *status, upstream_error_details(body))
                }
                UpstreamError::Unreachable(msg) => {
                    warn!(%request_id, "no response from upstream: {msg}");
                    (ChatFailureKind::Unreachable, 500, no_details())
                }
                UpstreamError::Request(msg) => {
                    warn!(%request_id, "failed to construct upstream request: {msg}");
                    (ChatFailureKind::Local, 500, no_details())
                }
            };
            proxy.state.record_chat_failure(kind);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": err.to_string(),
                    "details": details,
                    "message": "upstream chat request failed",
                    "code": code,
                    "time": rfc3339_now(),
                    "suggestion": "check network connectivity and that the API credential is valid",
                })),
            )
                .into_response()
        }
    }
}

async fn diagnostics(proxy: ProxyService) -> Json<Value> {
    let status = proxy.state.snapshot();
    Json(json!({
        "status": "ok",
        "message": "proxy service is running",
        "timestamp": rfc3339_now(),
        "version": env!("CARGO_PKG_VERSION"),
        "memory": memory_snapshot(),
        "apiEndpoint": CHAT_ENDPOINT,
        "apiStatus": {
            "isHealthy": status.is_healthy,
            "lastCheck": status
                .last_check
                .map(|t| humantime::format_rfc3339_seconds(t).to_string()),
            "retryCount": status.retry_count,
        },
        "serverUptime": format_uptime(proxy.state.uptime()),
    }))
}

async fn not_found(method: Method, uri: Uri) -> (StatusCode, Json<Value>) {
    debug!("no route matched {} {}", method, uri.path());
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "resource not found",
            "path": uri.path(),
            "method": method.as_str(),
            "availableEndpoints": [CHAT_ENDPOINT, "/api/test", "/health", "/"],
            "suggestion": "check that the request URL is correct",
        })),
    )
}

fn upstream_error_details(body: &Bytes) -> Value {
    if body.is_empty() {
        return no_details();
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

fn no_details() -> Value {
    Value::String("no detailed error information".to_string())
}

fn body_preview(body: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= max {
        return text.into_owned();
    }
    text.chars().take(max.saturating_sub(1)).collect::<String>() + "…"
}

fn rfc3339_now() -> String {
    humantime::format_rfc3339_seconds(SystemTime::now()).to_string()
}

fn format_uptime(uptime: Duration) -> String {
    // Whole seconds only, to keep the human string short.
    humantime::format_duration(Duration::from_secs(uptime.as_secs())).to_string()
}

#[cfg(target_os = "linux")]
fn memory_snapshot() -> Value {
    fn field_kb(status: &str, key: &str) -> Option<u64> {
        status
            .lines()
            .find(|l| l.starts_with(key))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    }

    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return Value::Null;
    };
    match (field_kb(&status, "VmRSS:"), field_kb(&status, "VmSize:")) {
        (Some(rss), Some(vm)) => json!({ "rssBytes": rss * 1024, "vmBytes": vm * 1024 }),
        _ => Value::Null,
    }
}

#[cfg(not(target_os = "linux"))]
fn memory_snapshot() -> Value {
    Value::Null
}
