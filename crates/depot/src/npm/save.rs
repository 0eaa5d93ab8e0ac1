//! `depot npm save`: mirror packages (and their dependency closures)
//! from the public registry into a local tree that `npm push` can
//! later upload.
//!
//! Layout per package: `{dir}/{name}/metadata.json` plus
//! `{dir}/{name}/{name}-{version}.tgz` per saved version.

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::Arc;

use depot_server::npm::{AbbreviatedPackage, AbbreviatedVersion};
use depot_server::storage::{FsStorage, Storage};
use futures::StreamExt;
use tokio::io::AsyncBufReadExt;
use tracing::{debug, error, info, warn};

use crate::npm::pkglock;
use crate::npm::sri::Sri;

const NPM_REGISTRY_URL: &str = "https://registry.npmjs.org";

type CliError = Box<dyn std::error::Error + Send + Sync>;

/// A `name@version` request. Scoped names keep their `@scope/` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageSpec {
    pub name: String,
    pub version: String,
}

impl PackageSpec {
    pub fn parse(spec: &str) -> Self {
        // Careful with scoped packages: the leading @ is part of the
        // name, only the last @ separates the version.
        let body = spec.strip_prefix('@').unwrap_or(spec);
        match body.rsplit_once('@') {
            Some((name, version)) => {
                let prefix = if spec.starts_with('@') { "@" } else { "" };
                PackageSpec {
                    name: format!("{prefix}{name}"),
                    version: version.to_string(),
                }
            }
            None => PackageSpec {
                name: spec.to_string(),
                version: "latest".to_string(),
            },
        }
    }
}

impl std::fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

pub async fn run(packages: &[String], dir: &str, stdin: bool) -> Result<(), CliError> {
    let storage = Arc::new(FsStorage::new(dir));
    let saver = Saver::new(storage);

    if stdin {
        return saver.save_from_stdin().await;
    }

    let mut packages = packages.to_vec();
    if packages.len() == 1 && packages[0].ends_with("package-lock.json") {
        let contents = tokio::fs::read_to_string(&packages[0]).await?;
        packages = pkglock::parse(&contents)?;
    }
    if packages.is_empty() {
        return Err("no packages specified and stdin not enabled".into());
    }

    saver.save(&packages).await
}

pub struct Saver {
    client: reqwest::Client,
    storage: Arc<dyn Storage>,
}

impl Saver {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            client: reqwest::Client::new(),
            storage,
        }
    }

    async fn save_from_stdin(&self) -> Result<(), CliError> {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        let mut packages = Vec::new();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            packages.push(line.to_string());
        }
        if packages.is_empty() {
            return Err("no packages found in input".into());
        }
        self.save(&packages).await
    }

    /// Download the requested specs and everything they depend on.
    /// Dependency graphs contain cycles, so this is a work queue with
    /// a seen set rather than a recursion.
    pub async fn save(&self, packages: &[String]) -> Result<(), CliError> {
        let mut queue: Vec<PackageSpec> = packages.iter().map(|p| PackageSpec::parse(p.trim())).collect();
        info!(count = queue.len(), "saving packages");

        let mut seen: HashSet<PackageSpec> = HashSet::new();
        let mut index = 0;
        while index < queue.len() {
            let spec = queue[index].clone();
            index += 1;
            if !seen.insert(spec.clone()) {
                continue;
            }

            let dependencies = self.download(&spec).await?;
            info!(package = %spec, dependencies = dependencies.len(), "downloaded package");
            for dependency in dependencies {
                if seen.contains(&dependency) {
                    continue;
                }
                if dependency.version.starts_with("file:") {
                    error!(package = %spec, dependency = %dependency, "skipping file: dependency");
                    continue;
                }
                if dependency.version.starts_with("npm:") {
                    info!(package = %spec, dependency = %dependency, "skipping npm: alias dependency");
                    continue;
                }
                queue.push(dependency);
            }
        }

        info!(total = seen.len(), "all packages saved");
        Ok(())
    }

    /// Fetch one package version and return its dependency specs.
    async fn download(&self, spec: &PackageSpec) -> Result<Vec<PackageSpec>, CliError> {
        info!(name = %spec.name, version = %spec.version, "downloading package");
        let metadata = self.fetch_metadata(&spec.name).await?;
        debug!(name = %spec.name, versions = metadata.versions.len(), "fetched metadata");

        let version = if spec.version == "latest" {
            metadata
                .dist_tags
                .get("latest")
                .cloned()
                .ok_or_else(|| format!("no latest dist-tag for package {}", spec.name))?
        } else {
            spec.version.clone()
        };
        let Some(version_metadata) = metadata.versions.get(&version) else {
            return Err(format!("version {version} not found for package {}", spec.name).into());
        };

        let tarball_name = format!("{}/{}-{version}.tgz", spec.name, base_name(&spec.name));
        self.download_tarball(version_metadata, &tarball_name).await?;

        // The whole aggregated document is saved so push can replay
        // any version later.
        let metadata_json = serde_json::to_vec_pretty(&metadata)?;
        self.storage
            .put(
                &format!("{}/metadata.json", spec.name),
                Box::new(Cursor::new(metadata_json)),
            )
            .await?;

        let dependencies = version_metadata
            .all_dependencies()
            .filter(|(name, version)| !name.is_empty() && !version.is_empty())
            .map(|(name, version)| PackageSpec {
                name: name.clone(),
                version: resolve_version_spec(version).to_string(),
            })
            .collect();
        Ok(dependencies)
    }

    async fn fetch_metadata(&self, name: &str) -> Result<AbbreviatedPackage, CliError> {
        let response = self
            .client
            .get(format!("{NPM_REGISTRY_URL}/{name}"))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// Stream the tarball into storage, verifying its hash on the way.
    async fn download_tarball(&self, version: &AbbreviatedVersion, tarball_name: &str) -> Result<(), CliError> {
        if self.storage.stat(tarball_name).await?.is_some() {
            debug!(tarball = tarball_name, "tarball already saved, skipping download");
            return Ok(());
        }

        let response = self
            .client
            .get(&version.dist.tarball)
            .send()
            .await?
            .error_for_status()?;

        // Prefer the SRI integrity string; fall back to the legacy
        // sha1 shasum.
        let (mut sri, expected) = if !version.dist.integrity.is_empty() {
            let (sri, expected) = Sri::parse(&version.dist.integrity)?;
            (sri, expected)
        } else {
            (Sri::new("sha1")?, String::new())
        };

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            sri.update(&chunk);
            body.extend_from_slice(&chunk);
        }

        let actual = sri.finish();
        if !expected.is_empty() {
            if actual != expected {
                return Err(format!("integrity mismatch for {tarball_name}: expected {expected}, got {actual}").into());
            }
        } else if !version.dist.shasum.is_empty() {
            let actual_hex = sha1_hex(&body);
            if actual_hex != version.dist.shasum {
                return Err(format!(
                    "shasum mismatch for {tarball_name}: expected {}, got {actual_hex}",
                    version.dist.shasum
                )
                .into());
            }
        } else {
            warn!(tarball = tarball_name, "no integrity information published, storing unverified");
        }

        self.storage.put(tarball_name, Box::new(Cursor::new(body))).await?;
        info!(tarball = tarball_name, "downloaded tarball");
        Ok(())
    }
}

/// The directory-less part of a package name: `@types/node` → `node`.
fn base_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

fn sha1_hex(data: &[u8]) -> String {
    use sha1::{Digest, Sha1};
    hex::encode(Sha1::digest(data))
}

/// Resolve a dependency's version spec to something fetchable. Ranges
/// collapse to `latest`; only exact pins stay as-is.
fn resolve_version_spec(spec: &str) -> &str {
    if spec == "*"
        || spec == "latest"
        || spec.starts_with('^')
        || spec.starts_with('~')
        || spec.starts_with('>')
        || spec.starts_with('<')
        || spec.starts_with('=')
        || spec.contains(' ')
        || spec.contains("||")
    {
        "latest"
    } else {
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specs_parse_plain_scoped_and_versionless_names() {
        assert_eq!(
            PackageSpec::parse("left-pad@1.3.0"),
            PackageSpec {
                name: "left-pad".to_string(),
                version: "1.3.0".to_string()
            }
        );
        assert_eq!(
            PackageSpec::parse("left-pad"),
            PackageSpec {
                name: "left-pad".to_string(),
                version: "latest".to_string()
            }
        );
        assert_eq!(
            PackageSpec::parse("@types/node@20.11.5"),
            PackageSpec {
                name: "@types/node".to_string(),
                version: "20.11.5".to_string()
            }
        );
        assert_eq!(
            PackageSpec::parse("@types/node"),
            PackageSpec {
                name: "@types/node".to_string(),
                version: "latest".to_string()
            }
        );
    }

    #[test]
    fn version_ranges_resolve_to_latest() {
        assert_eq!(resolve_version_spec("^1.0.0"), "latest");
        assert_eq!(resolve_version_spec("~1.2.3"), "latest");
        assert_eq!(resolve_version_spec(">=1.0.0 <2.0.0"), "latest");
        assert_eq!(resolve_version_spec("*"), "latest");
        assert_eq!(resolve_version_spec("1.2.3"), "1.2.3");
    }

    #[test]
    fn scoped_names_keep_their_scope_in_tarball_paths() {
        assert_eq!(base_name("@types/node"), "node");
        assert_eq!(base_name("left-pad"), "left-pad");
    }
}
