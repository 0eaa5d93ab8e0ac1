//! NPM registry adapter.
//!
//! Below the `/npm` prefix: tarballs live at `{pkg}/-/{file}.tgz` in
//! blob storage, everything else is abbreviated metadata in the KV
//! store. Scoped names (`@scope/pkg`) keep their scope through
//! path-escaping.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode, header};
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

pub use db::NpmDb;
pub use models::{AbbreviatedPackage, AbbreviatedVersion, Dist};

const MAX_METADATA_BYTES: usize = 8 * 1024 * 1024;

#[derive(Clone)]
pub struct NpmState {
    pub db: NpmDb,
    pub storage: Arc<dyn Storage>,
    pub downloads: DownloadSender,
    pub metrics: Metrics,
}

pub fn router(state: NpmState) -> Router {
    Router::new().route("/npm/{*rest}", any(dispatch)).with_state(state)
}

async fn dispatch(State(state): State<NpmState>, req: Request) -> Response {
    // Clients request scoped packages as /@scope%2Fname; work on the
    // decoded path like the rest of the metadata layer.
    let path = percent_encoding::percent_decode_str(req.uri().path())
        .decode_utf8_lossy()
        .into_owned();
    let path = path.strip_prefix("/npm").unwrap_or(&path).trim_start_matches('/').to_string();

    if path.ends_with(".tgz") {
        return tarball_dispatch(state, &path, req).await;
    }
    metadata_dispatch(state, &path, req).await
}

/// Split a metadata path into (package name, optional version). The
/// package name keeps its `@scope/` prefix.
fn parse_metadata_path(path: &str) -> Option<(String, Option<String>)> {
    let parts: Vec<&str> = path.trim_matches('/').split('/').filter(|p| !p.is_empty()).collect();
    match parts.as_slice() {
        [] => None,
        [scope, name] if scope.starts_with('@') => Some((format!("{scope}/{name}"), None)),
        [scope, name, version] if scope.starts_with('@') => Some((format!("{scope}/{name}"), Some(version.to_string()))),
        [name] if !name.starts_with('@') => Some((name.to_string(), None)),
        [name, version] if !name.starts_with('@') => Some((name.to_string(), Some(version.to_string()))),
        _ => None,
    }
}

async fn metadata_dispatch(state: NpmState, path: &str, req: Request) -> Response {
    let Some((package, version)) = parse_metadata_path(path) else {
        tracing::debug!(path, "invalid metadata path");
        return reply::bad_request();
    };

    match req.method().as_str() {
        "GET" | "HEAD" => metadata_get(state, &package, version.as_deref()).await,
        "PUT" => metadata_put(state, &package, version.as_deref(), req).await,
        "DELETE" => metadata_delete(state, &package, version.as_deref()).await,
        _ => reply::method_not_allowed(),
    }
}

fn json_response<T: serde::Serialize>(value: &T) -> Response {
    match serde_json::to_vec(value) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metadata");
            reply::internal_error()
        }
    }
}

async fn metadata_get(state: NpmState, package: &str, version: Option<&str>) -> Response {
    match version {
        None => {
            // Aggregate view over every stored version.
            match state.db.get_package(package).await {
                Ok(Some(metadata)) => json_response(&metadata),
                Ok(None) => reply::not_found(),
                Err(e) => {
                    tracing::error!(package, error = %e, "failed to get package metadata");
                    reply::internal_error()
                }
            }
        }
        Some("latest") => {
            // Dereference through the aggregate's dist-tags.
            let package_metadata = match state.db.get_package(package).await {
                Ok(Some(metadata)) => metadata,
                Ok(None) => return reply::not_found(),
                Err(e) => {
                    tracing::error!(package, error = %e, "failed to get package metadata");
                    return reply::internal_error();
                }
            };
            let Some(latest) = package_metadata.dist_tags.get("latest") else {
                return reply::not_found();
            };
            match package_metadata.versions.get(latest) {
                Some(version_metadata) => json_response(version_metadata),
                None => reply::not_found(),
            }
        }
        Some(version) => match state.db.get_version(package, version).await {
            Ok(Some(metadata)) => json_response(&metadata),
            Ok(None) => reply::not_found(),
            Err(e) => {
                tracing::error!(package, version, error = %e, "failed to get version metadata");
                reply::internal_error()
            }
        },
    }
}

async fn metadata_put(state: NpmState, package: &str, version: Option<&str>, req: Request) -> Response {
    let Some(version) = version else {
        return reply::method_not_allowed();
    };

    let body = match axum::body::to_bytes(req.into_body(), MAX_METADATA_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(package, version, error = %e, "failed to read metadata body");
            return reply::bad_request();
        }
    };
    let metadata: AbbreviatedVersion = match serde_json::from_slice(&body) {
        Ok(metadata) => metadata,
        Err(e) => {
            tracing::warn!(package, version, error = %e, "failed to parse version metadata");
            return reply::bad_request();
        }
    };

    if metadata.name != package {
        tracing::warn!(package, body_name = %metadata.name, "package name mismatch");
        return reply::bad_request();
    }

    if let Err(e) = state.db.put_version(package, version, &metadata).await {
        tracing::error!(package, version, error = %e, "failed to save package version");
        return reply::internal_error();
    }
    tracing::debug!(package, version, "saved package version");
    reply::created()
}

async fn metadata_delete(state: NpmState, package: &str, version: Option<&str>) -> Response {
    let Some(version) = version else {
        return reply::method_not_allowed();
    };
    match state.db.delete_version(package, version).await {
        Ok(_) => reply::no_content(),
        Err(e) => {
            tracing::error!(package, version, error = %e, "failed to delete package version");
            reply::internal_error()
        }
    }
}

async fn tarball_dispatch(state: NpmState, path: &str, req: Request) -> Response {
    // Tarball paths look like {pkg}/-/{pkg}-{version}.tgz, with an
    // extra leading segment for scoped packages.
    if path.split('/').count() < 2 {
        return reply::bad_request();
    }

    match req.method().as_str() {
        "GET" | "HEAD" => tarball_get(state, path, req.method() == Method::HEAD).await,
        "PUT" => tarball_put(state, path, req).await,
        _ => reply::method_not_allowed(),
    }
}

async fn tarball_get(state: NpmState, path: &str, head: bool) -> Response {
    let size = match state.storage.stat(path).await {
        Ok(Some(size)) => size,
        Ok(None) => return reply::not_found(),
        Err(e) => {
            tracing::error!(path, error = %e, "failed to stat tarball");
            return reply::internal_error();
        }
    };

    if head {
        return (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (header::CONTENT_LENGTH, size.to_string()),
            ],
        )
            .into_response();
    }

    let reader = match state.storage.get(path).await {
        Ok(Some(reader)) => reader,
        Ok(None) => return reply::not_found(),
        Err(e) => {
            tracing::error!(path, error = %e, "failed to read tarball");
            return reply::internal_error();
        }
    };

    tracing::debug!(path, "serving tarball");
    state.downloads.record("npm", path).await;
    state.metrics.record_download("npm", size);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, size)
        .body(Body::from_stream(ReaderStream::new(reader)))
        .unwrap_or_else(|_| reply::internal_error())
}

async fn tarball_put(state: NpmState, path: &str, req: Request) -> Response {
    let stream = req.into_body().into_data_stream().map_err(std::io::Error::other);
    let reader = StreamReader::new(stream);

    match state.storage.put(path, Box::new(reader)).await {
        Ok(written) => {
            state.metrics.record_upload("npm", written);
            tracing::debug!(path, written, "tarball uploaded");
            reply::created()
        }
        Err(e) => {
            tracing::error!(path, error = %e, "failed to save tarball");
            reply::internal_error()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_paths_parse_scoped_and_plain_names() {
        assert_eq!(parse_metadata_path("lodash"), Some(("lodash".to_string(), None)));
        assert_eq!(
            parse_metadata_path("lodash/4.17.21"),
            Some(("lodash".to_string(), Some("4.17.21".to_string())))
        );
        assert_eq!(
            parse_metadata_path("@types/node"),
            Some(("@types/node".to_string(), None))
        );
        assert_eq!(
            parse_metadata_path("@types/node/1.0.0"),
            Some(("@types/node".to_string(), Some("1.0.0".to_string())))
        );
        assert_eq!(parse_metadata_path(""), None);
        assert_eq!(parse_metadata_path("@scope"), None);
        assert_eq!(parse_metadata_path("a/b/c/d"), None);
    }
}
