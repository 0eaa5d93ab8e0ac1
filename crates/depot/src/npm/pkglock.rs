//! package-lock.json (v2/v3) ingestion for `depot npm save`.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct NpmLock {
    #[serde(default)]
    packages: BTreeMap<String, LockedPackage>,
}

#[derive(Debug, Deserialize)]
struct LockedPackage {
    #[serde(default)]
    name: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    resolved: String,
}

/// Extract a sorted list of unique `name@version` specs for registry
/// packages. Local and git dependencies are skipped.
pub fn parse(input: &str) -> Result<Vec<String>, serde_json::Error> {
    let lock: NpmLock = serde_json::from_str(input)?;

    let mut unique = BTreeSet::new();
    for (install_path, package) in &lock.packages {
        // The "" entry is the project itself.
        if install_path.is_empty() {
            continue;
        }
        if package.resolved.is_empty()
            || package.resolved.starts_with("file:")
            || package.resolved.starts_with("git+")
        {
            continue;
        }

        // The true published name wins over the install path.
        let name = if package.name.is_empty() {
            strip_node_modules_path(install_path)
        } else {
            package.name.as_str()
        };
        if name.is_empty() || package.version.is_empty() {
            continue;
        }

        unique.insert(format!("{name}@{}", package.version));
    }

    Ok(unique.into_iter().collect())
}

fn strip_node_modules_path(path: &str) -> &str {
    match path.rfind("node_modules/") {
        Some(index) => &path[index + "node_modules/".len()..],
        None => path,
    }
}
