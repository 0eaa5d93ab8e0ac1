//! Ed25519 narinfo signing, compatible with Nix's trusted-public-keys
//! verification.
//!
//! Key files use the `nix-store --generate-binary-cache-key` format:
//! `{name}:{base64}` where the payload is the 64-byte expanded keypair
//! (secret key) or the 32-byte verifying key (public key).

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::Signer;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
}

pub struct SigningKey {
    name: String,
    key: ed25519_dalek::SigningKey,
}

impl SigningKey {
    /// Parse a secret key in `{name}:{base64(64-byte keypair)}` form.
    pub fn parse(input: &str) -> Result<Self, SigningError> {
        let (name, payload) = input
            .trim()
            .split_once(':')
            .ok_or_else(|| SigningError::InvalidKey("expected name:base64key".to_string()))?;
        if name.is_empty() {
            return Err(SigningError::InvalidKey("key name is empty".to_string()));
        }
        let bytes = BASE64
            .decode(payload)
            .map_err(|e| SigningError::InvalidKey(format!("bad base64: {e}")))?;
        let key = match bytes.len() {
            64 => {
                let keypair: [u8; 64] = bytes.try_into().map_err(|_| SigningError::InvalidKey("bad length".to_string()))?;
                ed25519_dalek::SigningKey::from_keypair_bytes(&keypair)
                    .map_err(|e| SigningError::InvalidKey(e.to_string()))?
            }
            32 => {
                let seed: [u8; 32] = bytes.try_into().map_err(|_| SigningError::InvalidKey("bad length".to_string()))?;
                ed25519_dalek::SigningKey::from_bytes(&seed)
            }
            n => {
                return Err(SigningError::InvalidKey(format!(
                    "expected 32 or 64 key bytes, got {n}"
                )));
            }
        };
        Ok(Self {
            name: name.to_string(),
            key,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sign a narinfo fingerprint, producing a `Sig` line value.
    pub fn sign(&self, fingerprint: &str) -> String {
        let signature = self.key.sign(fingerprint.as_bytes());
        format!("{}:{}", self.name, BASE64.encode(signature.to_bytes()))
    }

    /// Public key in `{name}:{base64}` form, suitable for
    /// `trusted-public-keys` in nix.conf.
    pub fn public_key(&self) -> String {
        format!("{}:{}", self.name, BASE64.encode(self.key.verifying_key().as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::Verifier;

    use super::*;

    fn test_key() -> SigningKey {
        let seed = [7u8; 32];
        let key = ed25519_dalek::SigningKey::from_bytes(&seed);
        let encoded = format!("depot-test-1:{}", BASE64.encode(key.to_keypair_bytes()));
        SigningKey::parse(&encoded).unwrap()
    }

    #[test]
    fn signatures_verify_against_the_public_key() {
        let key = test_key();
        let fingerprint = "1;/nix/store/abc-hello;sha256:deadbeef;123;";
        let sig = key.sign(fingerprint);

        let (name, sig_b64) = sig.split_once(':').unwrap();
        assert_eq!(name, "depot-test-1");

        let (_, pk_b64) = key.public_key().split_once(':').unwrap();
        let pk_bytes: [u8; 32] = BASE64.decode(pk_b64).unwrap().try_into().unwrap();
        let verifying = ed25519_dalek::VerifyingKey::from_bytes(&pk_bytes).unwrap();
        let sig_bytes: [u8; 64] = BASE64.decode(sig_b64).unwrap().try_into().unwrap();
        let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        verifying.verify(fingerprint.as_bytes(), &signature).unwrap();
    }

    #[test]
    fn seed_only_keys_are_accepted() {
        let encoded = format!("seedkey:{}", BASE64.encode([3u8; 32]));
        let key = SigningKey::parse(&encoded).unwrap();
        assert_eq!(key.name(), "seedkey");
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert!(SigningKey::parse("no-colon").is_err());
        assert!(SigningKey::parse(":missing-name").is_err());
        assert!(SigningKey::parse("name:!!!").is_err());
        let short = format!("name:{}", BASE64.encode([0u8; 16]));
        assert!(SigningKey::parse(&short).is_err());
    }
}
