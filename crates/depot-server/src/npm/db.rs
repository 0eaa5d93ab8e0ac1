//! NPM metadata rows: one KV entry per package version at
//! `/npm/{escaped name}/{escaped version}`. The package-level document
//! is an aggregation over the version prefix.

use std::collections::BTreeMap;

use crate::kv::{ANY_VERSION, Kv, KvError, UNBOUNDED, escape_segment, values_of};
use crate::npm::models::{AbbreviatedPackage, AbbreviatedVersion};

#[derive(Clone)]
pub struct NpmDb {
    kv: Kv,
}

impl NpmDb {
    pub fn new(kv: Kv) -> Self {
        Self { kv }
    }

    fn version_key(package: &str, version: &str) -> String {
        format!("/npm/{}/{}", escape_segment(package), escape_segment(version))
    }

    fn package_prefix(package: &str) -> String {
        format!("/npm/{}/", escape_segment(package))
    }

    pub async fn get_version(&self, package: &str, version: &str) -> Result<Option<AbbreviatedVersion>, KvError> {
        Ok(self
            .kv
            .get(&Self::version_key(package, version))
            .await?
            .map(|(metadata, _)| metadata))
    }

    pub async fn put_version(
        &self,
        package: &str,
        version: &str,
        metadata: &AbbreviatedVersion,
    ) -> Result<(), KvError> {
        self.kv
            .put(&Self::version_key(package, version), ANY_VERSION, metadata)
            .await
            .map(|_| ())
    }

    pub async fn delete_version(&self, package: &str, version: &str) -> Result<bool, KvError> {
        self.kv.delete(&Self::version_key(package, version)).await
    }

    pub async fn delete_package(&self, package: &str) -> Result<u64, KvError> {
        self.kv.delete_prefix(&Self::package_prefix(package), 0, UNBOUNDED).await
    }

    /// Aggregate every stored version into the abbreviated package
    /// document. The `latest` dist-tag is the value of a child key
    /// literally named `latest` when present; otherwise the highest
    /// semver-parseable version wins.
    pub async fn get_package(&self, package: &str) -> Result<Option<AbbreviatedPackage>, KvError> {
        let records = self.kv.get_prefix(&Self::package_prefix(package), 0, UNBOUNDED).await?;
        if records.is_empty() {
            return Ok(None);
        }

        let all_versions: Vec<AbbreviatedVersion> = values_of(&records)?;

        let mut latest = None;
        for (record, version) in records.iter().zip(&all_versions) {
            if record.key.rsplit('/').next() == Some("latest") {
                latest = Some(version.version.clone());
            }
        }
        if latest.is_none() {
            latest = all_versions
                .iter()
                .filter_map(|v| semver::Version::parse(&v.version).ok())
                .max()
                .map(|v| v.to_string());
        }

        let mut versions = BTreeMap::new();
        for version in all_versions {
            versions.insert(version.version.clone(), version);
        }

        let mut dist_tags = BTreeMap::new();
        if let Some(latest) = latest {
            dist_tags.insert("latest".to_string(), latest);
        }

        Ok(Some(AbbreviatedPackage {
            name: package.to_string(),
            modified: None,
            dist_tags,
            versions,
        }))
    }
}
