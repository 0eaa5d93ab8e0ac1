//! Request authorization: bearer JWTs signed by SSH private keys,
//! verified against an allowlist of SSH public keys.

use ssh_key::{HashAlg, PublicKey};
use thiserror::Error;

pub mod jwt;
pub mod signer;

pub use jwt::{Claims, JwtAlgorithm, create_jwt, verify_jwt};
pub use signer::{FileSigner, TokenSigner, ecdsa_ssh_signature_to_fixed};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to read auth file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid format on line {line}: {reason}")]
    InvalidLine { line: usize, reason: String },

    #[error("invalid SSH key on line {line}: {source}")]
    InvalidKey {
        line: usize,
        #[source]
        source: ssh_key::Error,
    },

    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("token verification failed: {0}")]
    Verification(String),

    #[error("signing failed: {0}")]
    Signing(String),
}

/// Access level granted to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Read-only access.
    Read,
    /// Read and write access.
    ReadWrite,
}

#[derive(Debug, Clone)]
pub struct AuthorizedKey {
    pub permission: Permission,
    pub public_key: PublicKey,
    pub comment: String,
}

impl AuthorizedKey {
    /// SHA-256 fingerprint in the OpenSSH `SHA256:...` form, which is
    /// what tokens carry in their `key_fingerprint` claim.
    pub fn fingerprint(&self) -> String {
        self.public_key.fingerprint(HashAlg::Sha256).to_string()
    }
}

/// Parsed auth file. With no keys configured, everything is open.
/// Any read-only key escalates the policy to authenticate reads too.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub keys: Vec<AuthorizedKey>,
    pub require_auth_for_read: bool,
}

impl AuthConfig {
    /// Load from a file of `r|w <authorized_keys line>` records.
    /// Blank lines and `#` comments are skipped.
    pub fn load(path: &std::path::Path) -> Result<Self, AuthError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn parse(input: &str) -> Result<Self, AuthError> {
        let mut config = AuthConfig::default();

        for (index, raw) in input.lines().enumerate() {
            let line_number = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((perm, key_line)) = line.split_once(char::is_whitespace) else {
                return Err(AuthError::InvalidLine {
                    line: line_number,
                    reason: "expected at least 3 fields".to_string(),
                });
            };
            let permission = match perm {
                "r" => {
                    config.require_auth_for_read = true;
                    Permission::Read
                }
                "w" => Permission::ReadWrite,
                other => {
                    return Err(AuthError::InvalidLine {
                        line: line_number,
                        reason: format!("expected 'r' or 'w', got '{other}'"),
                    });
                }
            };

            let public_key = PublicKey::from_openssh(key_line.trim()).map_err(|source| AuthError::InvalidKey {
                line: line_number,
                source,
            })?;
            let comment = public_key.comment().to_string();
            config.keys.push(AuthorizedKey {
                permission,
                public_key,
                comment,
            });
        }

        Ok(config)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Look up a key by its SHA-256 fingerprint.
    pub fn find_by_fingerprint(&self, fingerprint: &str) -> Option<&AuthorizedKey> {
        self.keys.iter().find(|key| key.fingerprint() == fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ED25519_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBCEWXG1Pb6NAVCoKbhr1b6tpyXpFpGHPaL9WbrDW9H8 alice@example";

    #[test]
    fn parses_permissions_and_comments() {
        let input = format!(
            "# comment line\n\nr {ED25519_KEY}\nw ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIPlMZ4etWCcUyfxKnVYLNDO0ZY3suTSYjIHYjL9dmXO3 bob@example\n"
        );
        let config = AuthConfig::parse(&input).unwrap();
        assert_eq!(config.keys.len(), 2);
        assert!(config.require_auth_for_read);
        assert_eq!(config.keys[0].permission, Permission::Read);
        assert_eq!(config.keys[0].comment, "alice@example");
        assert_eq!(config.keys[1].permission, Permission::ReadWrite);
    }

    #[test]
    fn write_only_config_leaves_reads_open() {
        let input = format!("w {ED25519_KEY}\n");
        let config = AuthConfig::parse(&input).unwrap();
        assert!(!config.require_auth_for_read);
    }

    #[test]
    fn empty_input_yields_open_config() {
        let config = AuthConfig::parse("").unwrap();
        assert!(config.is_empty());
        assert!(!config.require_auth_for_read);
    }

    #[test]
    fn bad_permission_is_reported_with_line_number() {
        let err = AuthConfig::parse(&format!("x {ED25519_KEY}\n")).unwrap_err();
        match err {
            AuthError::InvalidLine { line, .. } => assert_eq!(line, 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn fingerprints_use_the_openssh_sha256_form() {
        let config = AuthConfig::parse(&format!("r {ED25519_KEY}\n")).unwrap();
        let fingerprint = config.keys[0].fingerprint();
        assert!(fingerprint.starts_with("SHA256:"), "{fingerprint}");
        assert!(config.find_by_fingerprint(&fingerprint).is_some());
        assert!(config.find_by_fingerprint("SHA256:nope").is_none());
    }
}
