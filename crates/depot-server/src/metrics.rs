//! Prometheus metrics, exposed on a dedicated listener.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,
    total_downloads: IntCounterVec,
    downloaded_bytes_total: IntCounterVec,
    package_uploads_total: IntCounterVec,
    uploaded_bytes_total: IntCounterVec,
    access_log_errors_total: IntCounter,
    download_counter_errors_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let total_downloads = IntCounterVec::new(
            Opts::new("total_downloads", "Total number of successful downloads served"),
            &["ecosystem"],
        )?;
        let downloaded_bytes_total = IntCounterVec::new(
            Opts::new("downloaded_bytes_total", "Total bytes downloaded from depot"),
            &["ecosystem"],
        )?;
        let package_uploads_total = IntCounterVec::new(
            Opts::new("package_uploads_total", "Total number of successfully uploaded package files"),
            &["ecosystem"],
        )?;
        let uploaded_bytes_total = IntCounterVec::new(
            Opts::new("uploaded_bytes_total", "Total bytes uploaded into depot"),
            &["ecosystem"],
        )?;
        let access_log_errors_total = IntCounter::new(
            "access_log_errors_total",
            "Total number of access log processing errors",
        )?;
        let download_counter_errors_total = IntCounterVec::new(
            Opts::new(
                "download_counter_errors_total",
                "Total number of download counter processing errors",
            ),
            &["ecosystem"],
        )?;

        registry.register(Box::new(total_downloads.clone()))?;
        registry.register(Box::new(downloaded_bytes_total.clone()))?;
        registry.register(Box::new(package_uploads_total.clone()))?;
        registry.register(Box::new(uploaded_bytes_total.clone()))?;
        registry.register(Box::new(access_log_errors_total.clone()))?;
        registry.register(Box::new(download_counter_errors_total.clone()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                total_downloads,
                downloaded_bytes_total,
                package_uploads_total,
                uploaded_bytes_total,
                access_log_errors_total,
                download_counter_errors_total,
            }),
        })
    }

    pub fn record_download(&self, ecosystem: &str, bytes: u64) {
        self.inner.total_downloads.with_label_values(&[ecosystem]).inc();
        self.inner
            .downloaded_bytes_total
            .with_label_values(&[ecosystem])
            .inc_by(bytes);
    }

    pub fn record_upload(&self, ecosystem: &str, bytes: u64) {
        self.inner.package_uploads_total.with_label_values(&[ecosystem]).inc();
        self.inner
            .uploaded_bytes_total
            .with_label_values(&[ecosystem])
            .inc_by(bytes);
    }

    pub fn record_access_log_error(&self) {
        self.inner.access_log_errors_total.inc();
    }

    pub fn record_download_counter_error(&self, ecosystem: &str) {
        self.inner
            .download_counter_errors_total
            .with_label_values(&[ecosystem])
            .inc();
    }

    fn render(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.inner.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

async fn metrics_handler(metrics: Metrics) -> impl IntoResponse {
    match metrics.render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
        }
    }
}

/// Serve `/metrics` on its own address until the process exits.
pub async fn listen_and_serve(addr: SocketAddr, metrics: Metrics) -> std::io::Result<()> {
    let app = Router::new().route("/metrics", get(move || metrics_handler(metrics.clone())));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_with_ecosystem_labels() {
        let metrics = Metrics::new().unwrap();
        metrics.record_download("nix", 100);
        metrics.record_download("nix", 50);
        metrics.record_upload("npm", 7);

        let body = String::from_utf8(metrics.render().unwrap()).unwrap();
        assert!(body.contains(r#"total_downloads{ecosystem="nix"} 2"#));
        assert!(body.contains(r#"downloaded_bytes_total{ecosystem="nix"} 150"#));
        assert!(body.contains(r#"uploaded_bytes_total{ecosystem="npm"} 7"#));
    }
}
