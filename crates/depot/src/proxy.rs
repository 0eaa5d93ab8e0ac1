//! Authenticated forwarding proxy.
//!
//! Rewrites scheme/host to the configured target and injects a bearer
//! token minted from a discovered SSH key. `nix copy` and friends talk
//! to the local listener; the token never appears on their command
//! lines.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::sshkeys;

type CliError = Box<dyn std::error::Error + Send + Sync>;

struct ProxyState {
    client: reqwest::Client,
    target: reqwest::Url,
    token: String,
}

/// A running proxy listener. Dropping the handle leaves the task
/// running; call [`ProxyHandle::stop`] to tear it down.
pub struct ProxyHandle {
    pub addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
}

impl ProxyHandle {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn stop(self) {
        let _ = self.shutdown.send(());
    }
}

/// Start the proxy on the given port (0 picks an ephemeral one).
pub async fn start(target: &str, port: u16) -> Result<ProxyHandle, CliError> {
    let target: reqwest::Url = target.parse()?;
    let token = sshkeys::create_token()?;

    let state = Arc::new(ProxyState {
        client: reqwest::Client::new(),
        target,
        token,
    });
    let app = Router::new().fallback(forward).with_state(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    let addr = listener.local_addr()?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        if let Err(e) = serve.await {
            error!(error = %e, "proxy server error");
        }
    });

    Ok(ProxyHandle {
        addr,
        shutdown: shutdown_tx,
    })
}

/// The `depot proxy <target>` command: run until interrupted.
pub async fn run(target: &str, port: u16) -> Result<(), CliError> {
    let handle = start(target, port).await?;
    info!(addr = %handle.addr, target, "proxy running");
    info!("press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    handle.stop();
    Ok(())
}

async fn forward(State(state): State<Arc<ProxyState>>, req: Request) -> Response {
    info!(method = %req.method(), path = %req.uri().path(), "proxy request");

    let mut url = state.target.clone();
    url.set_path(req.uri().path());
    url.set_query(req.uri().query());

    let method = match reqwest::Method::from_bytes(req.method().as_str().as_bytes()) {
        Ok(method) => method,
        Err(_) => return (StatusCode::BAD_REQUEST, "bad request").into_response(),
    };

    let mut outbound = state.client.request(method, url);
    for (name, value) in req.headers() {
        if name == header::HOST || name == header::AUTHORIZATION {
            continue;
        }
        outbound = outbound.header(name, value);
    }
    outbound = outbound.header(header::AUTHORIZATION, format!("Bearer {}", state.token));
    outbound = outbound.body(reqwest::Body::wrap_stream(req.into_body().into_data_stream()));

    let upstream = match outbound.send().await {
        Ok(upstream) => upstream,
        Err(e) => {
            error!(error = %e, "failed to forward request");
            return (StatusCode::BAD_GATEWAY, "bad gateway").into_response();
        }
    };

    let mut response = Response::builder().status(upstream.status().as_u16());
    if let Some(headers) = response.headers_mut() {
        for (name, value) in upstream.headers() {
            if let (Ok(name), Ok(value)) = (
                axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
                axum::http::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.insert(name, value);
            }
        }
    }
    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|e| {
            error!(error = %e, "failed to build proxied response");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
        })
}
