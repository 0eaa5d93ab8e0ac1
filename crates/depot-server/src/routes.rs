//! Top-level router: ecosystem mounts plus the auth and logging
//! middleware stack.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use tower_http::catch_panic::CatchPanicLayer;

use crate::auth::{AuthConfig, Permission, verify_jwt};
use crate::nix::NixState;
use crate::npm::NpmState;
use crate::python::PythonState;
use crate::reply;

/// Build the complete router.
///
/// Mount map:
/// - `/nix-cache-info` (legacy) and `/nix/*` → Nix adapter
/// - `/npm/*` → NPM adapter
/// - `/python/*` (including `/python/simple/...`) → Python adapter
///
/// The auth middleware sits inside the logger so denied requests are
/// still logged; panics are converted to plain 500s before the logger
/// records them.
pub fn router(nix: NixState, npm: NpmState, python: PythonState, auth: AuthConfig) -> Router {
    Router::new()
        .merge(crate::nix::router(nix))
        .merge(crate::npm::router(npm))
        .merge(crate::python::router(python))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(axum::middleware::from_fn_with_state(Arc::new(auth), auth_middleware))
        .layer(axum::middleware::from_fn(http_logger))
}

fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic"
    };
    tracing::error!(panic = detail, "handler panicked");
    reply::internal_error()
}

async fn http_logger(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(req).await;

    let bytes = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    tracing::info!(
        status = response.status().as_u16(),
        bytes,
        ms = start.elapsed().as_millis() as u64,
        "{method} {path}"
    );
    response
}

async fn auth_middleware(State(config): State<Arc<AuthConfig>>, req: Request, next: Next) -> Response {
    if config.is_empty() {
        return next.run(req).await;
    }

    let is_write = matches!(req.method().as_str(), "PUT" | "POST" | "DELETE");
    if !is_write && !config.require_auth_for_read {
        return next.run(req).await;
    }

    let Some(auth_header) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        tracing::warn!(
            method = %req.method(),
            path = %req.uri().path(),
            operation = if is_write { "write" } else { "read" },
            "request without authorization header"
        );
        return reply::unauthorized();
    };

    let token = auth_header.strip_prefix("Bearer ").unwrap_or(auth_header);
    let fingerprint = match verify_jwt(token, &config) {
        Ok(fingerprint) => fingerprint,
        Err(e) => {
            tracing::warn!(method = %req.method(), path = %req.uri().path(), error = %e, "invalid JWT token");
            return reply::invalid_token();
        }
    };

    let Some(key) = config.find_by_fingerprint(&fingerprint) else {
        tracing::warn!(fingerprint = %fingerprint, "key not found in auth config");
        return reply::invalid_token();
    };

    if is_write && key.permission != Permission::ReadWrite {
        tracing::warn!(fingerprint = %fingerprint, "insufficient permissions for write operation");
        return reply::forbidden();
    }

    tracing::debug!(
        method = %req.method(),
        path = %req.uri().path(),
        fingerprint = %fingerprint,
        "authorized request"
    );
    next.run(req).await
}
