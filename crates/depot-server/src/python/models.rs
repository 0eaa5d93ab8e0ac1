//! PEP 691 Simple repository models.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const SIMPLE_API_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimplePackageIndex {
    pub meta: SimpleMeta,
    pub name: String,
    pub files: Vec<SimpleFileEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleMeta {
    #[serde(rename = "api-version")]
    pub api_version: String,
}

impl Default for SimpleMeta {
    fn default() -> Self {
        Self {
            api_version: SIMPLE_API_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SimpleFileEntry {
    pub filename: String,
    pub url: String,
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
    #[serde(rename = "requires-python", default, skip_serializing_if = "String::is_empty")]
    pub requires_python: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(rename = "core-metadata", default, skip_serializing_if = "Option::is_none")]
    pub core_metadata: Option<serde_json::Value>,
    #[serde(rename = "data-dist-info-metadata", default, skip_serializing_if = "Option::is_none")]
    pub data_dist_info_metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yanked: Option<serde_json::Value>,
}

const BINARY_EXTENSIONS: &[&str] = &[".bz2", ".gz", ".tar", ".whl", ".zip"];

impl SimpleFileEntry {
    /// Distribution filenames are `{name}-{version}[-...]`; the part
    /// before the first dash is the project name.
    pub fn package_name(&self) -> &str {
        self.filename.split('-').next().unwrap_or(&self.filename)
    }

    /// The version component of the filename, after the known binary
    /// extensions are stripped.
    pub fn version(&self) -> &str {
        let mut name = self.filename.as_str();
        for ext in BINARY_EXTENSIONS {
            name = name.strip_suffix(ext).unwrap_or(name);
        }
        name.splitn(3, '-').nth(1).unwrap_or("")
    }
}

/// PEP 503 name normalization: lowercase, runs of `-`, `_` and `.`
/// are all equivalent to `-`.
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase().replace(['_', '.'], "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(filename: &str) -> SimpleFileEntry {
        SimpleFileEntry {
            filename: filename.to_string(),
            ..SimpleFileEntry::default()
        }
    }

    #[test]
    fn filenames_split_into_name_and_version() {
        let sdist = entry("Flask-2.3.0.tar.gz");
        assert_eq!(sdist.package_name(), "Flask");
        assert_eq!(sdist.version(), "2.3.0");

        let wheel = entry("requests-2.32.3-py3-none-any.whl");
        assert_eq!(wheel.package_name(), "requests");
        assert_eq!(wheel.version(), "2.32.3");

        let plain = entry("weird.zip");
        assert_eq!(plain.package_name(), "weird.zip");
        assert_eq!(plain.version(), "");
    }

    #[test]
    fn normalization_is_idempotent() {
        for name in ["Flask", "zope.interface", "My_Package", "already-normal"] {
            let once = normalize_name(name);
            assert_eq!(normalize_name(&once), once);
        }
        assert_eq!(normalize_name("zope.interface"), "zope-interface");
        assert_eq!(normalize_name("My_Package"), "my-package");
    }

    #[test]
    fn json_field_names_follow_pep_691() {
        let entry: SimpleFileEntry = serde_json::from_value(serde_json::json!({
            "filename": "Flask-2.3.0.tar.gz",
            "url": "https://files.pythonhosted.org/x/Flask-2.3.0.tar.gz",
            "hashes": {"sha256": "abc123"},
            "requires-python": ">=3.8",
            "size": 12345
        }))
        .unwrap();
        assert_eq!(entry.requires_python, ">=3.8");
        assert_eq!(entry.size, Some(12345));

        let out = serde_json::to_value(&entry).unwrap();
        assert_eq!(out["requires-python"], ">=3.8");
    }
}
