//! Nix push orchestration.
//!
//! Pushes go through a local authenticated proxy so the `nix` tooling
//! never handles credentials. Each store path is pushed with its
//! comprehensive closure: derivation inputs are realised and copied
//! alongside the outputs, so a builder cut off from the public cache
//! can still reconstruct everything.

use tokio::io::AsyncBufReadExt;
use tracing::info;

use crate::{nixcmd, proxy};

type CliError = Box<dyn std::error::Error + Send + Sync>;

pub struct Pusher {
    target: String,
}

impl Pusher {
    pub fn new(target: String) -> Self {
        Self { target }
    }

    async fn with_proxy<F, Fut>(&self, f: F) -> Result<(), CliError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<(), CliError>>,
    {
        let handle = proxy::start(&self.target, 0).await?;
        info!(addr = %handle.addr, target = %self.target, "started proxy");
        let result = f(handle.url()).await;
        handle.stop();
        result
    }

    pub async fn push_store_paths(&self, paths: &[String]) -> Result<(), CliError> {
        if paths.is_empty() {
            return Ok(());
        }
        self.with_proxy(|proxy_url| async move {
            for path in paths {
                push_comprehensive(&proxy_url, path).await?;
            }
            Ok(())
        })
        .await
    }

    pub async fn push_flake_reference(&self, flake_ref: &str) -> Result<(), CliError> {
        self.with_proxy(|proxy_url| async move { push_flake_comprehensive(&proxy_url, flake_ref).await })
            .await
    }

    /// Read store paths and flake references from stdin, one per line,
    /// and push them all through a single proxy.
    pub async fn push_from_stdin(&self) -> Result<(), CliError> {
        let mut store_paths = Vec::new();
        let mut flake_refs = Vec::new();

        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with("/nix/store/") {
                store_paths.push(line.to_string());
            } else if line.contains('#') || line.contains(':') {
                flake_refs.push(line.to_string());
            } else {
                // Assume a store path.
                store_paths.push(line.to_string());
            }
        }

        self.with_proxy(|proxy_url| async move {
            for path in &store_paths {
                info!(path = %path, "pushing store path");
                push_comprehensive(&proxy_url, path).await?;
            }
            for flake_ref in &flake_refs {
                info!(flake_ref = %flake_ref, "pushing flake reference");
                push_flake_comprehensive(&proxy_url, flake_ref).await?;
            }
            Ok(())
        })
        .await
    }
}

/// Push a store path together with its realised inputs.
async fn push_comprehensive(proxy_url: &str, store_path: &str) -> Result<(), CliError> {
    info!(path = store_path, "getting derivation info");
    let (input_drvs, input_srcs) = nixcmd::derivation_show(store_path).await?;

    let mut all_inputs = input_srcs;
    all_inputs.extend(input_drvs);

    let mut all_paths = vec![store_path.to_string()];
    if !all_inputs.is_empty() {
        info!(count = all_inputs.len(), "realising input dependencies");
        let realised = nixcmd::realise(&all_inputs).await?;
        all_paths.extend(realised);
    }

    info!(count = all_paths.len(), "copying all paths");
    nixcmd::copy_to(proxy_url, &all_paths).await?;
    Ok(())
}

/// Archive a flake's sources, evaluate it to a store path, then push
/// that path comprehensively.
async fn push_flake_comprehensive(proxy_url: &str, flake_ref: &str) -> Result<(), CliError> {
    info!(flake_ref, "evaluating flake reference");

    // flake archive only accepts the base flake, not an #attr.
    let base_flake = flake_ref.split_once('#').map(|(base, _)| base).unwrap_or(flake_ref);
    nixcmd::flake_archive(proxy_url, base_flake).await?;

    let store_path = nixcmd::eval(flake_ref).await?;
    info!(flake_ref, path = %store_path, "flake reference evaluated");

    push_comprehensive(proxy_url, &store_path).await
}
