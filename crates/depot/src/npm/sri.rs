//! Subresource Integrity hashes, `{alg}-{base64(digest)}`.
//!
//! Registries publish sha512 integrity strings alongside the legacy
//! sha1 shasum; both are verified while streaming.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SriError {
    #[error("invalid SRI format")]
    InvalidFormat,

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
}

pub struct Sri {
    algorithm: &'static str,
    hasher: Hasher,
}

impl Sri {
    pub fn new(algorithm: &str) -> Result<Self, SriError> {
        let (algorithm, hasher) = match algorithm {
            "sha1" => ("sha1", Hasher::Sha1(Sha1::new())),
            "sha256" => ("sha256", Hasher::Sha256(Sha256::new())),
            "sha512" => ("sha512", Hasher::Sha512(Sha512::new())),
            other => return Err(SriError::UnsupportedAlgorithm(other.to_string())),
        };
        Ok(Self { algorithm, hasher })
    }

    /// Parse an integrity string like `sha512-xyz...`, returning the
    /// hasher and the expected value to compare against.
    pub fn parse(integrity: &str) -> Result<(Self, String), SriError> {
        let (algorithm, _) = integrity.split_once('-').ok_or(SriError::InvalidFormat)?;
        Ok((Self::new(algorithm)?, integrity.to_string()))
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.hasher {
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    /// The finished `{alg}-{base64}` string.
    pub fn finish(self) -> String {
        let digest = match self.hasher {
            Hasher::Sha1(h) => h.finalize().to_vec(),
            Hasher::Sha256(h) => h.finalize().to_vec(),
            Hasher::Sha512(h) => h.finalize().to_vec(),
        };
        format!("{}-{}", self.algorithm, BASE64.encode(digest))
    }
}
