//! Python package rows: one KV entry per distribution file at
//! `/python/{normalized name}/{version}`.

use crate::kv::{ANY_VERSION, Kv, KvError, UNBOUNDED, escape_segment, values_of};
use crate::python::models::{SimpleFileEntry, SimpleMeta, SimplePackageIndex, normalize_name};

#[derive(Clone)]
pub struct PythonDb {
    kv: Kv,
}

impl PythonDb {
    pub fn new(kv: Kv) -> Self {
        Self { kv }
    }

    fn version_key(package: &str, version: &str) -> String {
        format!(
            "/python/{}/{}",
            escape_segment(&normalize_name(package)),
            escape_segment(version)
        )
    }

    fn package_prefix(package: &str) -> String {
        format!("/python/{}/", escape_segment(&normalize_name(package)))
    }

    pub async fn get_version(&self, package: &str, version: &str) -> Result<Option<SimpleFileEntry>, KvError> {
        Ok(self
            .kv
            .get(&Self::version_key(package, version))
            .await?
            .map(|(entry, _)| entry))
    }

    pub async fn put_version(&self, entry: &SimpleFileEntry) -> Result<(), KvError> {
        let key = Self::version_key(entry.package_name(), entry.version());
        self.kv.put(&key, ANY_VERSION, entry).await.map(|_| ())
    }

    pub async fn delete_version(&self, package: &str, version: &str) -> Result<bool, KvError> {
        self.kv.delete(&Self::version_key(package, version)).await
    }

    pub async fn delete_package(&self, package: &str) -> Result<u64, KvError> {
        self.kv.delete_prefix(&Self::package_prefix(package), 0, UNBOUNDED).await
    }

    /// The package index, with file URLs rewritten to the given base
    /// so clients resolve downloads through this server.
    pub async fn get_package(&self, package: &str, base_url: &str) -> Result<SimplePackageIndex, KvError> {
        let mut index = SimplePackageIndex {
            meta: SimpleMeta::default(),
            name: package.to_string(),
            files: Vec::new(),
            versions: Vec::new(),
        };

        let records = self.kv.get_prefix(&Self::package_prefix(package), 0, UNBOUNDED).await?;
        if records.is_empty() {
            return Ok(index);
        }

        index.files = values_of::<SimpleFileEntry>(&records)?;

        let base = base_url.trim_end_matches('/');
        let mut seen = std::collections::BTreeSet::new();
        for file in &mut index.files {
            let version = file.version().to_string();
            if seen.insert(version.clone()) {
                index.versions.push(version);
            }
            file.url = format!("{base}/{}/{}", normalize_name(file.package_name()), file.filename);
        }

        Ok(index)
    }

    /// Distinct package names, sorted. Names come back normalized
    /// because the key schema stores them that way.
    pub async fn list_packages(&self) -> Result<Vec<String>, KvError> {
        let records = self.kv.get_prefix("/python/", 0, UNBOUNDED).await?;
        let mut packages = Vec::new();
        let mut seen = std::collections::BTreeSet::new();
        for record in records {
            let rest = record.key.trim_start_matches("/python/");
            let Some(name) = rest.split('/').next() else {
                continue;
            };
            if !name.is_empty() && seen.insert(name.to_string()) {
                packages.push(name.to_string());
            }
        }
        packages.sort();
        Ok(packages)
    }
}
