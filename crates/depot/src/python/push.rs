//! `depot python push`: upload a saved distribution tree.
//!
//! Binary files go first, metadata sidecars second: a client must
//! never resolve metadata to a file the server does not have yet.

use std::path::Path;

use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use walkdir::WalkDir;

type CliError = Box<dyn std::error::Error + Send + Sync>;

const BINARY_EXTENSIONS: &[&str] = &[".gz", ".tar.gz", ".whl", ".zip", ".bz2"];

pub async fn run(target: &str, dir: &str, token: Option<String>) -> Result<(), CliError> {
    let pusher = Pusher::new(target, token);
    pusher.push(Path::new(dir)).await
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

    pub async fn push(&self, dir: &Path) -> Result<(), CliError> {
        info!(target = %self.target, dir = %dir.display(), "pushing Python packages");

        let mut binary_files = Vec::new();
        let mut metadata_files = Vec::new();
        for entry in WalkDir::new(dir) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".json") {
                metadata_files.push(entry.into_path());
            } else if BINARY_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) {
                binary_files.push(entry.into_path());
            }
        }

        info!(count = binary_files.len(), "pushing binary files");
        self.push_files(dir, &binary_files).await?;

        info!(count = metadata_files.len(), "pushing metadata files");
        self.push_files(dir, &metadata_files).await?;

        info!("push complete");
        Ok(())
    }

    async fn push_files(&self, dir: &Path, files: &[std::path::PathBuf]) -> Result<(), CliError> {
        for file in files {
            let relative = file.strip_prefix(dir)?.to_string_lossy().replace('\\', "/");
            let to = format!("{}/python/{relative}", self.target);
            debug!(file = %relative, to = %to, "pushing file");
            self.push_file(file, &to)
                .await
                .map_err(|e| format!("failed to push file {relative}: {e}"))?;
        }
        Ok(())
    }

    async fn push_file(&self, path: &Path, to: &str) -> Result<(), CliError> {
        let file = tokio::fs::File::open(path).await?;
        let mut request = self
            .client
            .put(to)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(format!("unexpected status code: {}", response.status()).into());
        }
        Ok(())
    }
}
