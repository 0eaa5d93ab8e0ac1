//! `depot python save`: mirror distributions from PyPI into a local
//! tree that `python push` can later upload.
//!
//! Specs are requirement lines (`requests>=2.8.1, ==2.8.*`); versions
//! are filtered with PEP 440 specifier semantics. Every saved file
//! gets a `.json` sidecar holding its Simple API entry.

use std::io::Cursor;
use std::str::FromStr;
use std::sync::Arc;

use depot_server::python::{SimpleFileEntry, SimplePackageIndex};
use futures::StreamExt;
use pep440_rs::{Version, VersionSpecifiers};
use tokio::io::AsyncBufReadExt;
use tracing::{debug, info};

type CliError = Box<dyn std::error::Error + Send + Sync>;

const PYPI_SIMPLE_URL: &str = "https://pypi.org/simple";
const USER_AGENT: &str = "Depot/0.1 (+https://github.com/depot-cache/depot)";

/// Operators that can start the specifier part of a requirement line.
const SPLITTERS: &[&str] = &["===", "==", "~=", ">=", "<=", ">", "<", "!="];

pub async fn run(packages: &[String], dir: &str, stdin: bool) -> Result<(), CliError> {
    let saver = Saver::new(Arc::new(depot_server::storage::FsStorage::new(dir)));
    if stdin || packages.is_empty() {
        if packages.is_empty() {
            info!("no packages specified, reading from stdin");
        }
        return saver.save_from_stdin().await;
    }
    saver.save(packages).await
}

pub struct Saver {
    client: reqwest::Client,
    storage: Arc<dyn depot_server::storage::Storage>,
}

impl Saver {
    pub fn new(storage: Arc<dyn depot_server::storage::Storage>) -> Self {
        Self {
            client: reqwest::Client::new(),
            storage,
        }
    }

    pub async fn save(&self, packages: &[String]) -> Result<(), CliError> {
        for package in packages {
            self.save_package(package.trim()).await?;
        }
        Ok(())
    }

    async fn save_from_stdin(&self) -> Result<(), CliError> {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            self.save_package(line).await?;
        }
        Ok(())
    }

    async fn save_package(&self, line: &str) -> Result<(), CliError> {
        info!(line, "saving package");

        let (package, specifiers) = split_requirement(line);
        let specifiers = if specifiers.is_empty() {
            None
        } else {
            Some(
                VersionSpecifiers::from_str(specifiers)
                    .map_err(|e| format!("invalid package specifier {line:?}: {e}"))?,
            )
        };

        debug!(package, "fetching package index");
        let index = self.get_package_index(package).await?;

        let keep = |version: &str| -> Result<bool, CliError> {
            let Some(specifiers) = &specifiers else {
                return Ok(true);
            };
            let version = Version::from_str(version).map_err(|e| format!("invalid version {version}: {e}"))?;
            Ok(specifiers.contains(&version))
        };

        let mut saved_files = 0usize;
        let mut saved_versions = std::collections::BTreeSet::new();
        for file in &index.files {
            let version = file.version();
            if version.is_empty() || !keep(version)? {
                continue;
            }
            debug!(package, file = %file.filename, "saving package file");
            self.save_package_file(package, file)
                .await
                .map_err(|e| format!("failed to save package file {} for {package}: {e}", file.filename))?;
            saved_files += 1;
            saved_versions.insert(version.to_string());
        }

        info!(package, versions = saved_versions.len(), files = saved_files, "saved package");
        Ok(())
    }

    async fn save_package_file(&self, package: &str, file: &SimpleFileEntry) -> Result<(), CliError> {
        let file_name = format!("{package}/{}", file.filename);

        // Same size as last time means the download can be skipped.
        let existing = self.storage.stat(&file_name).await?;
        if let (Some(size), Some(expected)) = (existing, file.size)
            && size == expected
        {
            debug!(package, file = %file.filename, "file already exists with matching size, skipping download");
            return Ok(());
        }

        let response = self
            .client
            .get(&file.url)
            .header("user-agent", USER_AGENT)
            .send()
            .await?
            .error_for_status()?;

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk?);
        }
        self.storage.put(&file_name, Box::new(Cursor::new(body))).await?;

        // Sidecar JSON so push can replay the metadata to a depot.
        let metadata_name = format!("{file_name}.json");
        let metadata = serde_json::to_vec_pretty(file)?;
        self.storage.put(&metadata_name, Box::new(Cursor::new(metadata))).await?;

        Ok(())
    }

    async fn get_package_index(&self, package: &str) -> Result<SimplePackageIndex, CliError> {
        let response = self
            .client
            .get(format!("{PYPI_SIMPLE_URL}/{package}"))
            .header("user-agent", USER_AGENT)
            .header("accept", depot_server::python::SIMPLE_JSON_CONTENT_TYPE)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

/// Split a requirement line into the package name and the raw
/// specifier tail, on the first occurrence of any operator.
fn split_requirement(line: &str) -> (&str, &str) {
    let first = SPLITTERS
        .iter()
        .filter_map(|op| line.find(op))
        .min();
    match first {
        Some(index) => (line[..index].trim(), line[index..].trim()),
        None => (line.trim(), ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requirement_lines_split_on_the_first_operator() {
        assert_eq!(split_requirement("requests"), ("requests", ""));
        assert_eq!(split_requirement("requests==2.8.1"), ("requests", "==2.8.1"));
        assert_eq!(
            split_requirement("requests >= 2.8.1, == 2.8.*"),
            ("requests", ">= 2.8.1, == 2.8.*")
        );
        assert_eq!(split_requirement("flask~=2.3"), ("flask", "~=2.3"));
        // === must win over == at the same position.
        assert_eq!(split_requirement("flask===2.3.0"), ("flask", "===2.3.0"));
    }

    #[test]
    fn specifier_filtering_uses_pep440_semantics() {
        let specifiers = VersionSpecifiers::from_str(">=2.8.1, <3").unwrap();
        assert!(specifiers.contains(&Version::from_str("2.9.0").unwrap()));
        assert!(!specifiers.contains(&Version::from_str("3.0.0").unwrap()));
        assert!(!specifiers.contains(&Version::from_str("2.8.0").unwrap()));
    }
}
