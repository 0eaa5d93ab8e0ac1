//! Nix binary cache adapter.
//!
//! Serves `/nix-cache-info`, narinfo records, NAR archives and build
//! logs below the `/nix` prefix. Dispatch is by path shape rather than
//! fixed routes because narinfo names embed the hash part in the file
//! name itself.

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
pub mod narinfo;
pub mod signing;

pub use db::NixDb;
pub use narinfo::{NarInfo, hash_part_of, is_valid_hash_part};
pub use signing::SigningKey;

/// Largest accepted narinfo payload. Real records are a few hundred
/// bytes; anything near this size is garbage.
const MAX_NARINFO_BYTES: usize = 1024 * 1024;

const CACHE_INFO: &str = "StoreDir: /nix/store\nWantMassQuery: 1\nPriority: 30\n";

#[derive(Clone)]
pub struct NixState {
    pub db: NixDb,
    pub storage: Arc<dyn Storage>,
    pub signing_key: Option<Arc<SigningKey>>,
    pub downloads: DownloadSender,
    pub metrics: Metrics,
}

pub fn router(state: NixState) -> Router {
    Router::new()
        // Legacy unprefixed location, kept for old cache configs.
        .route("/nix-cache-info", any(dispatch))
        .route("/nix/{*rest}", any(dispatch))
        .with_state(state)
}

async fn dispatch(State(state): State<NixState>, req: Request) -> Response {
    let original = req.uri().path();
    if original == "/nix-cache-info" || original == "/nix/nix-cache-info" {
        return cache_info(&state, req.method());
    }
    let path = original.strip_prefix("/nix").unwrap_or(original).to_string();
    if path.ends_with(".narinfo") {
        return narinfo_dispatch(state, &path, req).await;
    }
    if path.starts_with("/nar/") && nar_extension(&path).is_some() {
        return nar_dispatch(state, &path, req).await;
    }
    if let Some(storepath) = path.strip_prefix("/log/") {
        let storepath = format!("/{}", storepath.trim_start_matches('/'));
        return build_log(req.method(), &storepath).await;
    }
    reply::not_found()
}

fn cache_info(state: &NixState, method: &Method) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return reply::method_not_allowed();
    }
    let mut body = CACHE_INFO.to_string();
    if let Some(key) = &state.signing_key {
        body.push_str(&format!("PublicKey: {}\n", key.public_key()));
    }
    reply::ok_text("text/plain", body)
}

async fn narinfo_dispatch(state: NixState, path: &str, req: Request) -> Response {
    match req.method().as_str() {
        "GET" | "HEAD" => narinfo_get(state, path, req.method() == Method::HEAD).await,
        "PUT" => narinfo_put(state, path, req).await,
        _ => reply::method_not_allowed(),
    }
}

async fn narinfo_get(state: NixState, path: &str, head: bool) -> Response {
    let ni = match state.db.get(path).await {
        Ok(Some(ni)) => ni,
        Ok(None) => return reply::not_found(),
        Err(e) => {
            tracing::error!(path, error = %e, "failed to query narinfo");
            return reply::internal_error();
        }
    };

    tracing::debug!(path, store_path = %ni.store_path, "serving narinfo");
    let output = ni.to_string();
    state.metrics.record_download("nix", output.len() as u64);
    if head {
        return (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, ni.content_type().to_string()),
                (header::CONTENT_LENGTH, output.len().to_string()),
            ],
        )
            .into_response();
    }
    reply::ok_text(ni.content_type(), output)
}

async fn narinfo_put(state: NixState, path: &str, req: Request) -> Response {
    let body = match axum::body::to_bytes(req.into_body(), MAX_NARINFO_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(path, error = %e, "failed to read narinfo body");
            return reply::bad_request();
        }
    };
    let text = match std::str::from_utf8(&body) {
        Ok(text) => text,
        Err(_) => {
            tracing::warn!(path, "narinfo body is not UTF-8");
            return reply::bad_request();
        }
    };
    let mut ni = match NarInfo::parse(text) {
        Ok(ni) => ni,
        Err(e) => {
            tracing::warn!(path, error = %e, "failed to parse narinfo");
            return reply::bad_request();
        }
    };

    // The URL names the record by hash part; it must agree with the
    // parsed StorePath or a client could poison other entries.
    let file = path.rsplit('/').next().unwrap_or(path);
    let expected = file.trim_end_matches(".narinfo");
    let actual = ni.hash_part();
    if expected != actual {
        tracing::warn!(path, expected, actual, "narinfo hash part mismatch");
        return reply::bad_request();
    }

    if let Some(key) = &state.signing_key {
        // Upstream signatures are preserved; ours is appended.
        ni.signatures.push(key.sign(&ni.fingerprint()));
    }

    if let Err(e) = state.db.put(path, &ni).await {
        tracing::error!(path, error = %e, "failed to store narinfo");
        return reply::internal_error();
    }
    reply::created()
}

fn nar_extension(path: &str) -> Option<(&'static str, &'static str)> {
    if path.ends_with(".nar.xz") {
        Some((".nar.xz", "application/x-xz"))
    } else if path.ends_with(".nar.gz") {
        Some((".nar.gz", "application/gzip"))
    } else if path.ends_with(".nar.bz2") {
        Some((".nar.bz2", "application/x-bzip2"))
    } else if path.ends_with(".nar") {
        Some((".nar", "application/octet-stream"))
    } else {
        None
    }
}

/// `nar/{filehash}[-{narhash}]{ext}` → validated storage path.
fn nar_storage_path(path: &str) -> Option<(String, &'static str)> {
    let (ext, content_type) = nar_extension(path)?;
    let file = path.strip_prefix("/nar/")?;
    let stem = file.strip_suffix(ext)?;
    // Some clients name NARs {filehash}-{narhash}; only the file hash
    // addresses the blob.
    let hash_part = stem.split('-').next().unwrap_or(stem);
    if !is_valid_hash_part(hash_part) {
        return None;
    }
    Some((format!("nar/{hash_part}{ext}"), content_type))
}

async fn nar_dispatch(state: NixState, path: &str, req: Request) -> Response {
    let Some((nar_path, content_type)) = nar_storage_path(path) else {
        tracing::debug!(path, "invalid NAR hash part");
        return reply::bad_request();
    };

    match req.method().as_str() {
        "GET" | "HEAD" => nar_get(state, &nar_path, content_type, req.method() == Method::HEAD).await,
        "PUT" => nar_put(state, &nar_path, req).await,
        _ => reply::method_not_allowed(),
    }
}

async fn nar_get(state: NixState, nar_path: &str, content_type: &'static str, head: bool) -> Response {
    let size = match state.storage.stat(nar_path).await {
        Ok(Some(size)) => size,
        Ok(None) => {
            tracing::debug!(nar_path, "NAR not found");
            return reply::not_found();
        }
        Err(e) => {
            tracing::error!(nar_path, error = %e, "failed to stat NAR");
            return reply::internal_error();
        }
    };

    if head {
        return (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type.to_string()),
                (header::CONTENT_LENGTH, size.to_string()),
            ],
        )
            .into_response();
    }

    let reader = match state.storage.get(nar_path).await {
        Ok(Some(reader)) => reader,
        Ok(None) => return reply::not_found(),
        Err(e) => {
            tracing::error!(nar_path, error = %e, "failed to open NAR");
            return reply::internal_error();
        }
    };

    state.downloads.record("nix", nar_path).await;
    state.metrics.record_download("nix", size);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, size)
        .body(Body::from_stream(ReaderStream::new(reader)))
        .unwrap_or_else(|_| reply::internal_error())
}

async fn nar_put(state: NixState, nar_path: &str, req: Request) -> Response {
    let stream = req.into_body().into_data_stream().map_err(std::io::Error::other);
    let reader = StreamReader::new(stream);

    match state.storage.put(nar_path, Box::new(reader)).await {
        Ok(written) => {
            state.metrics.record_upload("nix", written);
            reply::created()
        }
        Err(e) => {
            tracing::error!(nar_path, error = %e, "failed to write NAR");
            reply::internal_error()
        }
    }
}

async fn build_log(method: &Method, storepath: &str) -> Response {
    if method != Method::GET {
        return reply::method_not_allowed();
    }

    // kill_on_drop covers request cancellation: dropping this future
    // reaps the child.
    let output = tokio::process::Command::new("nix")
        .arg("log")
        .arg(storepath)
        .kill_on_drop(true)
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => reply::ok_text(
            "text/plain",
            String::from_utf8_lossy(&output.stdout).into_owned(),
        ),
        Ok(output) => {
            tracing::error!(
                storepath,
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "nix log failed"
            );
            reply::internal_error()
        }
        Err(e) => {
            tracing::error!(storepath, error = %e, "failed to run nix log");
            reply::internal_error()
        }
    }
}
