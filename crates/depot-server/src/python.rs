//! Python Simple repository adapter (PEP 503 HTML, PEP 691 JSON).
//!
//! Below the `/python` prefix, with an optional `/simple` segment for
//! index-url compatibility. Distribution files live in blob storage at
//! `{pkg}/{filename}`; metadata sidecars land in the KV store.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use futures::TryStreamExt;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::downloadcounter::DownloadSender;
use crate::metrics::Metrics;
use crate::reply;
use crate::storage::Storage;

pub mod db;
pub mod models;

pub use db::PythonDb;
pub use models::{SimpleFileEntry, SimplePackageIndex, normalize_name};

pub const SIMPLE_JSON_CONTENT_TYPE: &str = "application/vnd.pypi.simple.v1+json";

const MAX_METADATA_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct PythonState {
    pub db: PythonDb,
    pub storage: Arc<dyn Storage>,
    /// Absolute base for rewritten file URLs, e.g.
    /// `http://localhost:8080/python`.
    pub base_url: String,
    pub downloads: DownloadSender,
    pub metrics: Metrics,
}

pub fn router(state: PythonState) -> Router {
    Router::new()
        .route("/python", any(dispatch))
        .route("/python/", any(dispatch))
        .route("/python/{*rest}", any(dispatch))
        .with_state(state)
}

async fn dispatch(State(state): State<PythonState>, req: Request) -> Response {
    let path = percent_encoding::percent_decode_str(req.uri().path())
        .decode_utf8_lossy()
        .into_owned();
    let path = path.strip_prefix("/python").unwrap_or(&path);
    // pip may be pointed at .../python/simple as the index root.
    let path = path.strip_prefix("/simple").unwrap_or(path).to_string();

    match req.method().as_str() {
        "GET" | "HEAD" => get(state, &path, req).await,
        "PUT" => put(state, &path, req).await,
        _ => reply::method_not_allowed(),
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn wants_json(req: &Request) -> bool {
    req.headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains(SIMPLE_JSON_CONTENT_TYPE))
        .unwrap_or(false)
}

async fn get(state: PythonState, path: &str, req: Request) -> Response {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return list_packages(state, &req).await;
    }

    let parts: Vec<&str> = trimmed.split('/').collect();
    match parts.as_slice() {
        [package] => get_package(state, package, &req).await,
        [package, filename] => get_package_file(state, package, filename).await,
        _ => reply::not_found(),
    }
}

async fn list_packages(state: PythonState, req: &Request) -> Response {
    tracing::debug!("listing packages");
    let packages = match state.db.list_packages().await {
        Ok(packages) => packages,
        Err(e) => {
            tracing::error!(error = %e, "failed to list packages");
            return reply::internal_error();
        }
    };

    if wants_json(req) {
        let projects: Vec<serde_json::Value> = packages
            .iter()
            .map(|name| serde_json::json!({"name": name}))
            .collect();
        let body = serde_json::json!({
            "meta": {"api-version": models::SIMPLE_API_VERSION},
            "projects": projects,
        });
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, SIMPLE_JSON_CONTENT_TYPE)],
            body.to_string(),
        )
            .into_response();
    }

    let mut html = String::from("<!DOCTYPE html>\n<html>\n<head><title>Simple index</title></head>\n<body>\n");
    for package in &packages {
        let name = escape_html(package);
        html.push_str(&format!("<a href=\"{name}/\">{name}</a><br/>\n"));
    }
    html.push_str("</body>\n</html>\n");
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
        .into_response()
}

async fn get_package(state: PythonState, package: &str, req: &Request) -> Response {
    tracing::debug!(package, "getting package index");
    let index = match state.db.get_package(package, &state.base_url).await {
        Ok(index) => index,
        Err(e) => {
            tracing::error!(package, error = %e, "failed to get package index");
            return reply::internal_error();
        }
    };
    if index.files.is_empty() {
        return reply::not_found();
    }

    if wants_json(req) {
        return match serde_json::to_string_pretty(&index) {
            Ok(body) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, SIMPLE_JSON_CONTENT_TYPE)],
                body,
            )
                .into_response(),
            Err(e) => {
                tracing::error!(package, error = %e, "failed to encode package index");
                reply::internal_error()
            }
        };
    }

    let title = escape_html(&index.name);
    let mut html = format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Links for {title}</title></head>\n<body>\n<h1>Links for {title}</h1>\n"
    );
    for file in &index.files {
        html.push_str(&format!("<a href=\"{}\"", escape_html(&file.url)));
        if let Some(sha256) = file.hashes.get("sha256") {
            html.push_str(&format!(" data-dist-info-metadata=\"sha256={}\"", escape_html(sha256)));
        }
        if !file.requires_python.is_empty() {
            html.push_str(&format!(" data-requires-python=\"{}\"", escape_html(&file.requires_python)));
        }
        html.push_str(&format!(">{}</a><br/>\n", escape_html(&file.filename)));
    }
    html.push_str("</body>\n</html>\n");
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
        .into_response()
}

async fn get_package_file(state: PythonState, package: &str, filename: &str) -> Response {
    let blob_path = format!("{package}/{filename}");
    tracing::debug!(path = %blob_path, "getting package file");

    let size = match state.storage.stat(&blob_path).await {
        Ok(Some(size)) => size,
        Ok(None) => return reply::not_found(),
        Err(e) => {
            tracing::error!(path = %blob_path, error = %e, "failed to stat file");
            return reply::internal_error();
        }
    };
    let reader = match state.storage.get(&blob_path).await {
        Ok(Some(reader)) => reader,
        Ok(None) => return reply::not_found(),
        Err(e) => {
            tracing::error!(path = %blob_path, error = %e, "failed to get file");
            return reply::internal_error();
        }
    };

    state.downloads.record("python", &blob_path).await;
    state.metrics.record_download("python", size);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, size)
        .body(Body::from_stream(ReaderStream::new(reader)))
        .unwrap_or_else(|_| reply::internal_error())
}

async fn put(state: PythonState, path: &str, req: Request) -> Response {
    let path = path.trim_matches('/').to_string();
    if path.is_empty() {
        return reply::bad_request();
    }

    if path.ends_with(".json") {
        return put_metadata(state, &path, req).await;
    }
    put_file(state, &path, req).await
}

async fn put_metadata(state: PythonState, path: &str, req: Request) -> Response {
    let body = match axum::body::to_bytes(req.into_body(), MAX_METADATA_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(path, error = %e, "failed to read metadata body");
            return reply::bad_request();
        }
    };
    let entry: SimpleFileEntry = match serde_json::from_slice(&body) {
        Ok(entry) => entry,
        Err(e) => {
            tracing::warn!(path, error = %e, "failed to decode metadata");
            return reply::bad_request();
        }
    };
    if entry.package_name().is_empty() || entry.version().is_empty() {
        tracing::warn!(path, filename = %entry.filename, "metadata missing package name or version");
        return reply::bad_request();
    }

    if let Err(e) = state.db.put_version(&entry).await {
        tracing::error!(path, error = %e, "failed to store package version");
        return reply::internal_error();
    }
    reply::created()
}

async fn put_file(state: PythonState, path: &str, req: Request) -> Response {
    let stream = req.into_body().into_data_stream().map_err(std::io::Error::other);
    let reader = StreamReader::new(stream);

    match state.storage.put(path, Box::new(reader)).await {
        Ok(written) => {
            state.metrics.record_upload("python", written);
            tracing::debug!(path, written, "stored file");
            reply::created()
        }
        Err(e) => {
            tracing::error!(path, error = %e, "failed to write file");
            reply::internal_error()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_send() {
        fn check<F: std::future::Future + Send>(_: F) {}
        check(dispatch(
            State(unsafe { std::mem::zeroed() }),
            unsafe { std::mem::zeroed() },
        ));
    }

    fn _assert_state_bounds()
    where
        PythonState: Send + Sync + Clone + 'static,
    {
    }

    fn _assert_handler() {
        fn check<H: axum::handler::Handler<T, PythonState>, T>(_: H) {}
        check(dispatch);
    }

    #[test]
    fn html_escaping_covers_the_usual_suspects() {
        assert_eq!(escape_html("a<b>&\"c\""), "a&lt;b&gt;&amp;&quot;c&quot;");
        assert_eq!(escape_html("plain-1.0"), "plain-1.0");
    }
}
