//! `depot npm push`: upload a saved package tree to a remote depot.
//!
//! For every version with a tarball on disk, the tarball goes up
//! first, then the version record with its `dist.tarball` rewritten
//! to the new location, then one alias record per dist-tag pointing
//! at that version (so `latest` lookups work on the remote).

use std::path::{Path, PathBuf};

use depot_server::npm::{AbbreviatedPackage, AbbreviatedVersion};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use walkdir::WalkDir;

type CliError = Box<dyn std::error::Error + Send + Sync>;

pub async fn run(target: &str, dir: &str, token: Option<String>) -> Result<(), CliError> {
    let pusher = Pusher::new(target, token);
    pusher.push_packages(Path::new(dir)).await
}

pub struct Pusher {
    client: reqwest::Client,
    target: String,
    token: Option<String>,
}

impl Pusher {
    pub fn new(target: &str, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            target: target.trim_end_matches('/').to_string(),
            token,
        }
    }

    pub async fn push_packages(&self, base_dir: &Path) -> Result<(), CliError> {
        let mut package_count = 0usize;

        for entry in WalkDir::new(base_dir) {
            let entry = entry?;
            if !entry.file_type().is_file() || entry.file_name() != std::ffi::OsStr::new("metadata.json") {
                continue;
            }

            let contents = tokio::fs::read(entry.path()).await?;
            let metadata: AbbreviatedPackage = serde_json::from_slice(&contents)
                .map_err(|e| format!("failed to parse {}: {e}", entry.path().display()))?;

            package_count += 1;
            info!(name = %metadata.name, count = package_count, "processing package");
            let package_dir = entry.path().parent().unwrap_or(base_dir);
            self.push_package(&metadata, package_dir).await?;
        }

        if package_count == 0 {
            return Err(format!("no packages found in directory {}", base_dir.display()).into());
        }
        info!(count = package_count, "all packages pushed successfully");
        Ok(())
    }

    async fn push_package(&self, metadata: &AbbreviatedPackage, package_dir: &Path) -> Result<(), CliError> {
        info!(name = %metadata.name, "pushing package");

        for (version, version_metadata) in &metadata.versions {
            let tarball_path = package_dir.join(tarball_file_name(version_metadata));
            if !tarball_path.exists() {
                warn!(
                    package = %version_metadata.name,
                    version = %version_metadata.version,
                    "skipping version, tarball not found"
                );
                continue;
            }
            self.push_version(metadata, version_metadata, &tarball_path)
                .await
                .map_err(|e| format!("failed to push version {version}: {e}"))?;
        }

        info!(name = %metadata.name, "package pushed successfully");
        Ok(())
    }

    async fn push_version(
        &self,
        package: &AbbreviatedPackage,
        version: &AbbreviatedVersion,
        tarball_path: &PathBuf,
    ) -> Result<(), CliError> {
        info!(package = %version.name, version = %version.version, "pushing version");

        let tarball_name = tarball_file_name(version);
        let tarball_url = format!("{}/npm/{}/-/{tarball_name}", self.target, version.name);

        let file = tokio::fs::File::open(tarball_path).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        self.put(&tarball_url, body, "application/octet-stream").await?;

        // Point clients at the copy we just uploaded.
        let mut version = version.clone();
        version.dist.tarball = tarball_url;

        let body = serde_json::to_vec(&version)?;
        let version_url = format!("{}/npm/{}/{}", self.target, version.name, version.version);
        self.put(&version_url, body.clone().into(), "application/json").await?;

        // Alias rows for dist-tags resolving to this version.
        for (tag, tagged_version) in &package.dist_tags {
            if tagged_version != &version.version {
                continue;
            }
            let tag_url = format!("{}/npm/{}/{tag}", self.target, version.name);
            self.put(&tag_url, body.clone().into(), "application/json").await?;
        }

        info!(package = %version.name, version = %version.version, "version pushed successfully");
        Ok(())
    }

    async fn put(&self, url: &str, body: reqwest::Body, content_type: &str) -> Result<(), CliError> {
        let mut request = self.client.put(url).header("content-type", content_type).body(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("HTTP {status}: {body}").into());
        }
        Ok(())
    }
}

/// `{basename}-{version}.tgz`, mirroring the public registry's layout
/// for scoped packages (`@types/node` → `node-1.0.0.tgz`).
fn tarball_file_name(version: &AbbreviatedVersion) -> String {
    let base = version.name.rsplit('/').next().unwrap_or(&version.name);
    format!("{base}-{}.tgz", version.version)
}
