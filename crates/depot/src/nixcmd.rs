//! Wrappers around the `nix` command line.
//!
//! Every invocation is cancellation-aware (the child is killed when
//! the future is dropped) and captures stderr for the error log.

use std::collections::BTreeMap;
use std::process::Output;

use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum NixCmdError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed with {status}: {stderr}")]
    Failed {
        command: &'static str,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("failed to parse {command} output: {source}")]
    Parse {
        command: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

async fn run(command: &'static str, program: &str, args: &[&str]) -> Result<Output, NixCmdError> {
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| NixCmdError::Spawn { command, source })?;
    if !output.status.success() {
        return Err(NixCmdError::Failed {
            command,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(output)
}

/// `nix copy --to <to> --refresh <paths...>`
pub async fn copy_to(to: &str, paths: &[String]) -> Result<(), NixCmdError> {
    let mut args = vec!["copy", "--to", to, "--refresh"];
    args.extend(paths.iter().map(String::as_str));
    run("nix copy", "nix", &args).await.map(|_| ())
}

/// `nix flake archive --to <to> --refresh <flake_ref>`
pub async fn flake_archive(to: &str, flake_ref: &str) -> Result<(), NixCmdError> {
    run(
        "nix flake archive",
        "nix",
        &["flake", "archive", "--to", to, "--refresh", flake_ref],
    )
    .await
    .map(|_| ())
}

/// `nix eval <flake_ref> --raw` → the evaluated store path.
pub async fn eval(flake_ref: &str) -> Result<String, NixCmdError> {
    let output = run("nix eval", "nix", &["eval", flake_ref, "--raw"]).await?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// `nix derivation show <path>` → (input derivations, input sources).
pub async fn derivation_show(store_path: &str) -> Result<(Vec<String>, Vec<String>), NixCmdError> {
    let output = run("nix derivation show", "nix", &["derivation", "show", store_path]).await?;
    parse_derivations(&output.stdout)
}

/// `nix-store --realise <paths...>` → realised output paths, one per
/// stdout line.
pub async fn realise(paths: &[String]) -> Result<Vec<String>, NixCmdError> {
    let mut args = vec!["--realise"];
    args.extend(paths.iter().map(String::as_str));
    let output = run("nix-store --realise", "nix-store", &args).await?;
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

#[derive(Debug, Deserialize)]
struct Derivation {
    #[serde(rename = "inputDrvs", default)]
    input_drvs: BTreeMap<String, serde_json::Value>,
    #[serde(rename = "inputSrcs", default)]
    input_srcs: Vec<String>,
}

/// Normalize a derivation input to an absolute store path. Basenames
/// come back prefixed with the store dir; absolute paths outside the
/// store (local builder scripts and the like) are dropped.
fn normalize_store_path(path: &str) -> Option<String> {
    if path.starts_with("/nix/store/") {
        return Some(path.to_string());
    }
    if !path.starts_with('/') {
        return Some(format!("/nix/store/{path}"));
    }
    None
}

fn parse_derivations(json: &[u8]) -> Result<(Vec<String>, Vec<String>), NixCmdError> {
    let derivations: BTreeMap<String, Derivation> =
        serde_json::from_slice(json).map_err(|source| NixCmdError::Parse {
            command: "nix derivation show",
            source,
        })?;

    let mut input_drvs = Vec::new();
    let mut input_srcs = Vec::new();
    for derivation in derivations.values() {
        input_drvs.extend(derivation.input_drvs.keys().filter_map(|k| normalize_store_path(k)));
        input_srcs.extend(derivation.input_srcs.iter().filter_map(|s| normalize_store_path(s)));
    }
    Ok((input_drvs, input_srcs))
}
