//! Abbreviated NPM registry metadata, the subset served with
//! `Accept: application/vnd.npm.install-v1+json`. Fields the server
//! does not interpret pass through as raw JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AbbreviatedPackage {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
    #[serde(rename = "dist-tags", default)]
    pub dist_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub versions: BTreeMap<String, AbbreviatedVersion>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AbbreviatedVersion {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<serde_json::Value>,
    pub dist: Dist,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<BTreeMap<String, String>>,
    #[serde(rename = "optionalDependencies", default, skip_serializing_if = "Option::is_none")]
    pub optional_dependencies: Option<BTreeMap<String, String>>,
    #[serde(rename = "devDependencies", default, skip_serializing_if = "Option::is_none")]
    pub dev_dependencies: Option<BTreeMap<String, String>>,
    #[serde(rename = "bundledDependencies", default, skip_serializing_if = "Option::is_none")]
    pub bundled_dependencies: Option<Vec<String>>,
    #[serde(rename = "peerDependencies", default, skip_serializing_if = "Option::is_none")]
    pub peer_dependencies: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directories: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engines: Option<serde_json::Value>,
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(rename = "_nodeVersion", default, skip_serializing_if = "Option::is_none")]
    pub node_version: Option<serde_json::Value>,
    #[serde(rename = "_npmVersion", default, skip_serializing_if = "Option::is_none")]
    pub npm_version: Option<serde_json::Value>,
    #[serde(rename = "_npmUser", default, skip_serializing_if = "Option::is_none")]
    pub npm_user: Option<Person>,
    #[serde(rename = "_hasShrinkwrap", default, skip_serializing_if = "std::ops::Not::not")]
    pub has_shrinkwrap: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Dist {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub integrity: String,
    #[serde(default)]
    pub shasum: String,
    pub tarball: String,
    #[serde(rename = "fileCount", default, skip_serializing_if = "Option::is_none")]
    pub file_count: Option<u64>,
    #[serde(rename = "unpackedSize", default, skip_serializing_if = "Option::is_none")]
    pub unpacked_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<DistSignature>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistSignature {
    pub keyid: String,
    pub sig: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Person {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl AbbreviatedVersion {
    /// All dependency maps a closure walk needs to follow.
    pub fn all_dependencies(&self) -> impl Iterator<Item = (&String, &String)> {
        self.dependencies
            .iter()
            .chain(self.dev_dependencies.iter())
            .chain(self.peer_dependencies.iter())
            .chain(self.optional_dependencies.iter())
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_json_round_trips_without_field_loss() {
        let input = serde_json::json!({
            "name": "@types/node",
            "version": "1.0.0",
            "dist": {
                "integrity": "sha512-abc",
                "shasum": "0123456789abcdef",
                "tarball": "https://registry.npmjs.org/@types/node/-/node-1.0.0.tgz"
            },
            "dependencies": {"undici-types": "~6.19.2"},
            "bin": {"tsc": "./bin/tsc"},
            "engines": {"node": ">=14"}
        });

        let version: AbbreviatedVersion = serde_json::from_value(input.clone()).unwrap();
        assert_eq!(version.name, "@types/node");
        assert_eq!(version.dist.shasum, "0123456789abcdef");

        let output = serde_json::to_value(&version).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn dependency_iterator_covers_every_kind() {
        let version: AbbreviatedVersion = serde_json::from_value(serde_json::json!({
            "name": "a",
            "version": "1.0.0",
            "dist": {"shasum": "", "tarball": ""},
            "dependencies": {"b": "1.0.0"},
            "devDependencies": {"c": "2.0.0"},
            "peerDependencies": {"d": "3.0.0"},
            "optionalDependencies": {"e": "4.0.0"}
        }))
        .unwrap();

        let names: Vec<&str> = version.all_dependencies().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["b", "c", "d", "e"]);
    }
}
