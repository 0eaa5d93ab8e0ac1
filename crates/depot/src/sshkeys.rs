//! SSH key discovery for client-side authentication.
//!
//! Keys come from ssh-agent (via `$SSH_AUTH_SOCK`, falling back to
//! gpg-agent's SSH socket) and from `~/.ssh/*.pub` files with
//! unencrypted sibling private keys. The first key that can sign a
//! JWT (RSA or NIST P-256) wins.

use std::path::{Path, PathBuf};

use depot_server::auth::jwt::JwtAlgorithm;
use depot_server::auth::signer::{FileSigner, TokenSigner, ecdsa_ssh_signature_to_fixed};
use depot_server::auth::{AuthError, create_jwt};
use ssh_key::{Algorithm, HashAlg, PublicKey};
use tracing::{debug, info, warn};

pub struct KeyInfo {
    /// "agent" or "file".
    pub source: &'static str,
    pub alg: String,
    pub fingerprint: String,
    pub comment: String,
    pub hints: Vec<&'static str>,
    pub signer: Option<Box<dyn TokenSigner>>,
}

/// Discover available SSH keys from ssh-agent and `~/.ssh`.
pub fn discover() -> Vec<KeyInfo> {
    debug!("discovering SSH keys");
    let mut out = Vec::new();

    let sock = match std::env::var("SSH_AUTH_SOCK") {
        Ok(sock) if !sock.is_empty() => Some(PathBuf::from(sock)),
        _ => {
            debug!("SSH_AUTH_SOCK not set, trying gpg-agent's SSH socket");
            gpg_agent_ssh_sock()
        }
    };
    if let Some(sock) = sock {
        debug!(socket = %sock.display(), "listing agent keys");
        match list_agent_keys(&sock) {
            Ok(keys) => out.extend(keys),
            Err(e) => warn!(error = %e, "failed to list SSH agent keys"),
        }
    }

    debug!("scanning ~/.ssh directory for key files");
    match list_file_keys() {
        Ok(keys) => out.extend(keys),
        Err(e) => warn!(error = %e, "failed to scan for key files"),
    }

    out
}

/// Mint a bearer token from the first discovered key that can sign.
/// The caller holds the token for the process lifetime.
pub fn create_token() -> Result<String, AuthError> {
    let keys = discover();
    if keys.is_empty() {
        return Err(AuthError::Signing("no SSH keys found".to_string()));
    }

    for key in keys {
        let Some(signer) = key.signer else {
            debug!(fingerprint = %key.fingerprint, "skipping key without signer");
            continue;
        };
        if JwtAlgorithm::for_key(signer.public_key().key_data()).is_err() {
            debug!(alg = %key.alg, fingerprint = %key.fingerprint, "skipping unsupported key type");
            continue;
        }
        match create_jwt(signer.as_ref()) {
            Ok(token) => {
                info!(fingerprint = %key.fingerprint, source = key.source, "using SSH key for authentication");
                return Ok(token);
            }
            Err(e) => {
                debug!(fingerprint = %key.fingerprint, error = %e, "failed to create JWT");
            }
        }
    }

    Err(AuthError::Signing("no usable SSH keys found for JWT signing".to_string()))
}

fn list_agent_keys(sock: &Path) -> Result<Vec<KeyInfo>, AuthError> {
    let mut client =
        ssh_agent_client_rs::Client::connect(sock).map_err(|e| AuthError::Signing(e.to_string()))?;
    let identities = client
        .list_identities()
        .map_err(|e| AuthError::Signing(e.to_string()))?;

    let mut out = Vec::new();
    for public_key in identities {
        let comment = public_key.comment().to_string();
        let alg = algorithm_name(public_key.algorithm());
        let fingerprint = public_key.fingerprint(HashAlg::Sha256).to_string();
        let hints = classify(&public_key.algorithm().to_string(), &comment);
        let signer = AgentSigner {
            socket: sock.to_path_buf(),
            public_key,
        };
        out.push(KeyInfo {
            source: "agent",
            alg,
            fingerprint,
            comment,
            hints,
            signer: Some(Box::new(signer)),
        });
    }
    Ok(out)
}

fn list_file_keys() -> Result<Vec<KeyInfo>, AuthError> {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| AuthError::Signing("no home directory".to_string()))?;
    let ssh_dir = home.join(".ssh");
    let Ok(entries) = std::fs::read_dir(&ssh_dir) else {
        return Ok(Vec::new());
    };

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("pub") {
            continue;
        }
        let Ok(data) = std::fs::read_to_string(&path) else {
            continue;
        };
        let Ok(public_key) = PublicKey::from_openssh(data.trim()) else {
            continue;
        };

        // The sibling private key, when present and unencrypted.
        let private_path = path.with_extension("");
        let signer = std::fs::read_to_string(&private_path)
            .ok()
            .and_then(|pem| FileSigner::load(&pem).ok());

        let comment = public_key.comment().to_string();
        out.push(KeyInfo {
            source: "file",
            alg: algorithm_name(public_key.algorithm()),
            fingerprint: public_key.fingerprint(HashAlg::Sha256).to_string(),
            hints: classify(&public_key.algorithm().to_string(), &comment),
            comment,
            signer: signer.map(|s| Box::new(s) as Box<dyn TokenSigner>),
        });
    }
    Ok(out)
}

/// Signer backed by ssh-agent. Reconnects per signature to avoid
/// long-lived socket issues; hardware-held keys work transparently.
struct AgentSigner {
    socket: PathBuf,
    public_key: PublicKey,
}

impl TokenSigner for AgentSigner {
    fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, AuthError> {
        let mut client = ssh_agent_client_rs::Client::connect(&self.socket)
            .map_err(|e| AuthError::Signing(format!("failed to connect to ssh-agent: {e}")))?;
        let signature = client
            .sign(&self.public_key, message)
            .map_err(|e| AuthError::Signing(e.to_string()))?;

        match signature.algorithm() {
            Algorithm::Rsa { hash: Some(HashAlg::Sha256) } => Ok(signature.as_bytes().to_vec()),
            Algorithm::Rsa { hash } => Err(AuthError::Signing(format!(
                "agent produced an RSA signature with unusable hash {hash:?}"
            ))),
            Algorithm::Ecdsa { .. } => ecdsa_ssh_signature_to_fixed(signature.as_bytes()),
            other => Err(AuthError::UnsupportedKeyType(other.to_string())),
        }
    }
}

fn algorithm_name(algorithm: Algorithm) -> String {
    match algorithm {
        Algorithm::Ed25519 => "ed25519".to_string(),
        Algorithm::Rsa { .. } => "rsa".to_string(),
        Algorithm::Ecdsa { curve } => format!("ecdsa-{curve}"),
        Algorithm::SkEd25519 => "ed25519-sk".to_string(),
        Algorithm::SkEcdsaSha2NistP256 => "ecdsa-sk".to_string(),
        other => other.to_string(),
    }
}

/// Loose heuristics about where a key lives, for log output only.
fn classify(key_type: &str, comment: &str) -> Vec<&'static str> {
    let mut hints = Vec::new();
    if key_type.contains("-sk") || key_type.starts_with("sk-") {
        hints.push("fido2");
    }
    let c = comment.to_lowercase();
    if c.contains("cardno:") || c.contains("gpg") {
        hints.push("gpg-agent");
    }
    if c.contains("yubikey") {
        hints.push("yubikey?");
    }
    hints
}

fn gpg_agent_ssh_sock() -> Option<PathBuf> {
    let output = std::process::Command::new("gpgconf")
        .args(["--list-dirs", "agent-ssh-socket"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let sock = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if sock.is_empty() { None } else { Some(PathBuf::from(sock)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hints_flag_hardware_and_gpg_keys() {
        assert_eq!(classify("sk-ssh-ed25519@openssh.com", ""), vec!["fido2"]);
        assert_eq!(classify("ssh-ed25519", "cardno:000123"), vec!["gpg-agent"]);
        assert_eq!(classify("ssh-rsa", "work YubiKey"), vec!["yubikey?"]);
        assert!(classify("ssh-rsa", "alice@laptop").is_empty());
    }

    #[test]
    fn algorithm_names_are_normalized() {
        assert_eq!(algorithm_name(Algorithm::Ed25519), "ed25519");
        assert_eq!(algorithm_name(Algorithm::Rsa { hash: None }), "rsa");
        assert_eq!(
            algorithm_name(Algorithm::Ecdsa {
                curve: ssh_key::EcdsaCurve::NistP256
            }),
            "ecdsa-nistp256"
        );
    }
}
